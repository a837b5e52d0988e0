//! Staging buffers for cross-process sparse-vector additions.
//!
//! Every rank accumulates its outgoing `(index, value, initiator)` triples
//! in one row of fixed capacity per destination rank. A flush performs two
//! all-to-all exchanges, counts then payloads, after which each rank
//! commits what it received; the commit itself lives in
//! [`DistVec::perform_add`](crate::vector::DistVec::perform_add). The
//! initiator flag rides in bit `2 * n_orb` of the staged index, one bit
//! past the determinant, which is why staged rows are sized for one extra
//! bit and why the flag can never alias determinant data.

use crate::bitstring::{clear_bit, det_bytes, read_bit, set_bit};

/// Per-destination send buffers with fixed capacity.
pub struct Adder {
    det_width: usize,
    stage_width: usize,
    flag_bit: u8,
    cap: usize,
    send_idx: Vec<Vec<u8>>,
    send_val: Vec<Vec<f64>>,
}

impl Adder {
    /// Creates buffers for `n_procs` destinations holding up to `cap`
    /// pending adds each, for determinants of `n_bits` bits.
    #[must_use]
    pub fn new(n_bits: u8, cap: usize, n_procs: usize) -> Self {
        assert!(cap > 0);
        Self {
            det_width: det_bytes(n_bits),
            stage_width: det_bytes(n_bits + 1),
            flag_bit: n_bits,
            cap,
            send_idx: vec![Vec::new(); n_procs],
            send_val: vec![Vec::new(); n_procs],
        }
    }

    /// Number of adds currently staged for `dest`.
    #[must_use]
    pub fn pending(&self, dest: usize) -> usize {
        self.send_val[dest].len()
    }

    /// True when nothing is staged anywhere.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.send_val.iter().all(Vec::is_empty)
    }

    /// Stages one add for `dest`.
    ///
    /// # Panics
    ///
    /// Panics when the destination row is full; the caller must flush
    /// before overfilling, and growing silently is not an option because
    /// every rank has to agree on when the exchange happens.
    pub fn stage(&mut self, dest: usize, det: &[u8], val: f64, ini: bool) {
        assert_eq!(det.len(), self.det_width);
        assert!(
            self.send_val[dest].len() < self.cap,
            "staging row for rank {dest} is full ({} adds); flush required",
            self.cap
        );

        let row = &mut self.send_idx[dest];
        let start = row.len();
        row.extend_from_slice(det);
        row.resize(start + self.stage_width, 0);
        if ini {
            set_bit(&mut row[start..], self.flag_bit);
        }
        self.send_val[dest].push(val);
    }

    /// Takes all staged rows, leaving the buffers empty.
    pub fn drain(&mut self) -> (Vec<Vec<u8>>, Vec<Vec<f64>>) {
        let idx = self
            .send_idx
            .iter_mut()
            .map(std::mem::take)
            .collect::<Vec<_>>();
        let val = self
            .send_val
            .iter_mut()
            .map(std::mem::take)
            .collect::<Vec<_>>();
        (idx, val)
    }

    /// Width in bytes of one staged index row.
    #[must_use]
    pub fn stage_width(&self) -> usize {
        self.stage_width
    }

    /// Splits one received staged row into the bare determinant (written
    /// into `det_out`) and the initiator flag.
    pub fn decode(&self, chunk: &[u8], det_out: &mut [u8]) -> bool {
        assert_eq!(chunk.len(), self.stage_width);
        assert_eq!(det_out.len(), self.det_width);

        det_out.copy_from_slice(&chunk[..self.det_width]);
        let ini = read_bit(chunk, self.flag_bit);
        // the flag shares the last byte with the determinant unless the
        // determinant fills its bytes exactly
        if usize::from(self.flag_bit / 8) < self.det_width {
            clear_bit(det_out, self.flag_bit);
        }
        ini
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_and_decode_round_trip() {
        // 6-bit determinants share their byte with the flag
        let mut adder = Adder::new(6, 4, 2);
        let det = [0b0010_1001_u8];

        adder.stage(1, &det, 0.5, true);
        adder.stage(1, &det, -0.25, false);
        assert_eq!(adder.pending(1), 2);
        assert_eq!(adder.pending(0), 0);

        let (idx, val) = adder.drain();
        assert!(adder.is_empty());
        assert_eq!(val[1], vec![0.5, -0.25]);
        assert_eq!(idx[1].len(), 2 * adder.stage_width());

        let mut det_out = [0_u8; 1];
        let chunks: Vec<&[u8]> = idx[1].chunks_exact(adder.stage_width()).collect();

        assert!(adder.decode(chunks[0], &mut det_out));
        assert_eq!(det_out, det);
        assert!(!adder.decode(chunks[1], &mut det_out));
        assert_eq!(det_out, det);
    }

    #[test]
    fn byte_aligned_determinants_get_an_extra_flag_byte() {
        let mut adder = Adder::new(8, 2, 1);
        assert_eq!(adder.stage_width(), 2);

        let det = [0xff_u8];
        adder.stage(0, &det, 1.0, true);
        let (idx, _) = adder.drain();

        let mut det_out = [0_u8; 1];
        assert!(adder.decode(&idx[0], &mut det_out));
        // all eight determinant bits survive next to the flag
        assert_eq!(det_out, det);
    }

    #[test]
    #[should_panic(expected = "flush required")]
    fn over_capacity_staging_is_fatal() {
        let mut adder = Adder::new(6, 1, 1);
        let det = [0_u8; 1];
        adder.stage(0, &det, 1.0, false);
        adder.stage(0, &det, 1.0, false);
    }
}
