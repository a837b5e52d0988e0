//! Scrambled hashing of determinant indices and the intra-process lookup
//! table.
//!
//! Hashes are computed from the occupied-orbital list, not the bit string,
//! by folding one random 32-bit word per spin-orbital into an accumulator.
//! Two scramblers exist per vector: one byte-identical on every process,
//! whose hash assigns each index to its owning rank, and one local, which
//! drives the process-private table below. The hash function itself is a
//! free function so nothing needs to allocate a table just to hash.

use rand::Rng;
use std::path::Path;
use thiserror::Error;

/// Error raised when a persisted scrambler cannot be restored.
#[derive(Debug, Error)]
pub enum ScramblerError {
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The file does not hold one 32-bit word per spin-orbital.
    #[error("scrambler file holds {found} words where {expected} were expected")]
    Corrupt {
        /// Words found in the file.
        found: usize,
        /// One per spin-orbital.
        expected: usize,
    },
}

/// Reads a persisted scrambler, expecting exactly one `u32` per
/// spin-orbital; a shorter or longer file is corrupt.
pub fn load_scrambler(path: &Path, n_spinorb: u8) -> Result<Vec<u32>, ScramblerError> {
    let bytes = std::fs::read(path)?;
    let expected = usize::from(n_spinorb);
    if bytes.len() != expected * 4 {
        return Err(ScramblerError::Corrupt {
            found: bytes.len() / 4,
            expected,
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}

/// Generates one scrambler word per spin-orbital.
#[must_use]
pub fn gen_scrambler(n_spinorb: u8, rng: &mut impl Rng) -> Vec<u32> {
    (0..n_spinorb).map(|_| rng.gen()).collect()
}

/// Hashes an occupied-orbital list under `scrambler`.
#[must_use]
pub fn det_hash(occ: &[u8], scrambler: &[u32]) -> u64 {
    occ.iter().fold(0_u64, |acc, &orb| {
        acc.wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(u64::from(scrambler[usize::from(orb)]))
    })
}

/// The rank that owns a determinant with occupied-orbital list `occ`,
/// computed from the process-common scrambler; every rank agrees on it.
#[must_use]
pub fn assigned_rank(occ: &[u8], common_scrambler: &[u32], n_procs: usize) -> usize {
    usize::try_from(det_hash(occ, common_scrambler) % n_procs as u64).unwrap()
}

struct Entry {
    det: Box<[u8]>,
    hash: u64,
    pos: i64,
}

/// Chained hash table mapping determinant bytes to signed storage
/// positions; `-1` marks a reserved but unassigned slot.
pub struct HashTable {
    buckets: Vec<Vec<Entry>>,
}

impl HashTable {
    /// Creates a table with `n_buckets` chains.
    #[must_use]
    pub fn new(n_buckets: usize) -> Self {
        assert!(n_buckets > 0);
        Self {
            buckets: (0..n_buckets).map(|_| Vec::new()).collect(),
        }
    }

    fn bucket_of(&self, hash: u64) -> usize {
        usize::try_from(hash % self.buckets.len() as u64).unwrap()
    }

    /// Looks up `det` under its precomputed `hash`. With `create` a missing
    /// entry is inserted holding position `-1`; without it, `None` is
    /// returned. The mutable reference lets the caller assign the position.
    pub fn read(&mut self, det: &[u8], hash: u64, create: bool) -> Option<&mut i64> {
        let bucket = self.bucket_of(hash);
        let chain = &mut self.buckets[bucket];

        if let Some(idx) = chain
            .iter()
            .position(|entry| entry.hash == hash && *entry.det == *det)
        {
            return Some(&mut chain[idx].pos);
        }
        if !create {
            return None;
        }

        chain.push(Entry {
            det: det.into(),
            hash,
            pos: -1,
        });
        Some(&mut chain.last_mut().unwrap().pos)
    }

    /// Read-only lookup of the position stored for `det`.
    #[must_use]
    pub fn lookup(&self, det: &[u8], hash: u64) -> Option<i64> {
        self.buckets[self.bucket_of(hash)]
            .iter()
            .find(|entry| entry.hash == hash && *entry.det == *det)
            .map(|entry| entry.pos)
    }

    /// Removes the entry for `det`, if present.
    pub fn delete(&mut self, det: &[u8], hash: u64) {
        let bucket = self.bucket_of(hash);
        let chain = &mut self.buckets[bucket];
        if let Some(idx) = chain
            .iter()
            .position(|entry| entry.hash == hash && *entry.det == *det)
        {
            chain.swap_remove(idx);
        }
    }
}
