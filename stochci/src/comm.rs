//! The interprocess-communication seam.
//!
//! The iteration engine talks to its peers only through the collective
//! operations of the [`Comm`] trait: all-to-all exchanges for the staged
//! adds, all-gathers for trial vectors, all-reduces for norms, and rank-0
//! broadcasts for the shared systematic-sampling random number. Which
//! transport implements them is none of the engine's business; this module
//! ships [`SerialComm`] for single-process runs and [`ThreadComm`], which
//! runs every rank as a thread over shared mailboxes and backs the
//! multi-rank tests. An MPI binding would be a third implementation of the
//! same trait.
//!
//! All ranks must issue the same sequence of collective calls; between
//! collectives each rank runs deterministically.

use std::sync::{Arc, Barrier, Mutex};

/// Collective operations over a fixed set of ranks.
pub trait Comm {
    /// This process' rank, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of participating processes.
    fn size(&self) -> usize;

    /// All-to-all exchange of opaque payloads: `send[d]` goes to rank `d`;
    /// the result holds one payload per origin rank.
    fn all_to_all(&self, send: &[Vec<u8>]) -> Vec<Vec<u8>>;

    /// Gathers one payload per rank, identically on every rank.
    fn all_gather(&self, mine: &[u8]) -> Vec<Vec<u8>>;

    /// Sum of `x` over all ranks.
    fn sum_f64(&self, x: f64) -> f64;

    /// Sum of `x` over all ranks.
    fn sum_u64(&self, x: u64) -> u64;

    /// Maximum of `x` over all ranks.
    fn max_f64(&self, x: f64) -> f64;

    /// Every rank receives rank 0's `x`.
    fn broadcast_f64(&self, x: f64) -> f64;

    /// Gathers one `f64` per rank, identically on every rank.
    fn gather_f64(&self, x: f64) -> Vec<f64> {
        self.all_gather(&x.to_le_bytes())
            .iter()
            .map(|bytes| f64::from_le_bytes(bytes.as_slice().try_into().unwrap()))
            .collect()
    }
}

/// The trivial communicator for one process.
pub struct SerialComm;

impl Comm for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_to_all(&self, send: &[Vec<u8>]) -> Vec<Vec<u8>> {
        assert_eq!(send.len(), 1);
        send.to_vec()
    }

    fn all_gather(&self, mine: &[u8]) -> Vec<Vec<u8>> {
        vec![mine.to_vec()]
    }

    fn sum_f64(&self, x: f64) -> f64 {
        x
    }

    fn sum_u64(&self, x: u64) -> u64 {
        x
    }

    fn max_f64(&self, x: f64) -> f64 {
        x
    }

    fn broadcast_f64(&self, x: f64) -> f64 {
        x
    }
}

struct Mailbox {
    // [origin][destination]
    slots: Vec<Vec<Vec<u8>>>,
}

struct Shared {
    size: usize,
    barrier: Barrier,
    mailbox: Mutex<Mailbox>,
}

/// One rank of an in-process communicator whose ranks are threads.
///
/// Collectives deposit into a shared mailbox, wait on a barrier, read the
/// slots addressed to them, and wait again so the mailbox can be reused.
/// This matches the suspension-point model: a rank blocks only inside a
/// collective.
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadComm {
    /// Creates communicators for `size` ranks; hand one to each thread.
    #[must_use]
    pub fn create(size: usize) -> Vec<Self> {
        assert!(size > 0);
        let shared = Arc::new(Shared {
            size,
            barrier: Barrier::new(size),
            mailbox: Mutex::new(Mailbox {
                slots: vec![vec![Vec::new(); size]; size],
            }),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn exchange(&self, send: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        {
            let mut mailbox = self.shared.mailbox.lock().unwrap();
            mailbox.slots[self.rank] = send;
        }
        self.shared.barrier.wait();
        let received = {
            let mailbox = self.shared.mailbox.lock().unwrap();
            (0..self.shared.size)
                .map(|origin| mailbox.slots[origin][self.rank].clone())
                .collect()
        };
        self.shared.barrier.wait();
        received
    }
}

impl Comm for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_to_all(&self, send: &[Vec<u8>]) -> Vec<Vec<u8>> {
        assert_eq!(send.len(), self.shared.size);
        self.exchange(send.to_vec())
    }

    fn all_gather(&self, mine: &[u8]) -> Vec<Vec<u8>> {
        let send = vec![mine.to_vec(); self.shared.size];
        self.exchange(send)
    }

    fn sum_f64(&self, x: f64) -> f64 {
        self.all_gather(&x.to_le_bytes())
            .iter()
            .map(|bytes| f64::from_le_bytes(bytes.as_slice().try_into().unwrap()))
            .sum()
    }

    fn sum_u64(&self, x: u64) -> u64 {
        self.all_gather(&x.to_le_bytes())
            .iter()
            .map(|bytes| u64::from_le_bytes(bytes.as_slice().try_into().unwrap()))
            .sum()
    }

    fn max_f64(&self, x: f64) -> f64 {
        self.all_gather(&x.to_le_bytes())
            .iter()
            .map(|bytes| f64::from_le_bytes(bytes.as_slice().try_into().unwrap()))
            .fold(f64::NEG_INFINITY, f64::max)
    }

    fn broadcast_f64(&self, x: f64) -> f64 {
        let gathered = self.all_gather(&x.to_le_bytes());
        f64::from_le_bytes(gathered[0].as_slice().try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_on_ranks<F, T>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(ThreadComm) -> T + Clone + Send + 'static,
        T: Send + 'static,
    {
        let comms = ThreadComm::create(size);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                thread::spawn(move || f(comm))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn serial_identity() {
        let comm = SerialComm;
        assert_eq!(comm.sum_f64(2.5), 2.5);
        assert_eq!(comm.broadcast_f64(1.25), 1.25);
        assert_eq!(comm.all_to_all(&[vec![1, 2, 3]]), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn threaded_all_to_all() {
        let received = run_on_ranks(3, |comm| {
            let send: Vec<Vec<u8>> = (0..3)
                .map(|dest| vec![u8::try_from(comm.rank()).unwrap() * 10 + dest])
                .collect();
            (comm.rank(), comm.all_to_all(&send))
        });

        for (rank, payloads) in received {
            let expected: Vec<Vec<u8>> = (0..3)
                .map(|origin: u8| vec![origin * 10 + u8::try_from(rank).unwrap()])
                .collect();
            assert_eq!(payloads, expected);
        }
    }

    #[test]
    fn threaded_reductions() {
        let sums = run_on_ranks(4, |comm| {
            let rank = comm.rank() as u64;
            (
                comm.sum_u64(rank + 1),
                comm.max_f64(rank as f64),
                comm.broadcast_f64(rank as f64 + 7.0),
            )
        });

        for (sum, max, bcast) in sums {
            assert_eq!(sum, 10);
            assert_eq!(max, 3.0);
            assert_eq!(bcast, 7.0);
        }
    }

    #[test]
    fn repeated_collectives_reuse_the_mailbox() {
        let results = run_on_ranks(2, |comm| {
            let mut totals = vec![];
            for round in 0..10 {
                totals.push(comm.sum_u64(round + comm.rank() as u64));
            }
            totals
        });

        for totals in results {
            let expected: Vec<u64> = (0..10).map(|round| 2 * round + 1).collect();
            assert_eq!(totals, expected);
        }
    }
}
