//! The distributed hashed sparse vector over determinant indices.
//!
//! Every stored determinant occupies one *position*: the same row of the
//! index column, the occupied-orbital column, the diagonal cache, and each
//! of the `n_vecs` value rows. Positions are handed out by popping a LIFO
//! free-stack, else by appending with doubling growth, and never move once
//! assigned, so external references such as the deterministic-subspace
//! Hamiltonian stay valid across iterations.
//!
//! Ownership of an index is decided by hashing its occupied-orbital list
//! with a scrambler that is byte-identical on every rank; the intra-process
//! lookup table uses a second, local scrambler. Additions are staged in the
//! [`Adder`](crate::adder::Adder) and committed by [`DistVec::perform_add`],
//! whose initiator rule only lets flagged contributions create previously
//! empty positions.

use crate::adder::Adder;
use crate::bitstring::{det_bytes, list_bits};
use crate::comm::Comm;
use crate::hashtable::{assigned_rank, det_hash, HashTable};
use itertools::izip;
use std::fs::File;
use std::io::{BufWriter, Read as _, Write as _};
use std::path::Path;
use thiserror::Error;

/// Element type stored in the value rows.
pub trait VecElem: Copy + Default + PartialEq + std::ops::AddAssign + std::fmt::Debug {
    /// Absolute magnitude, as used by compression and one-norms.
    fn magnitude(self) -> f64;
    /// Lossless conversion onto the wire and into dot products.
    fn to_f64(self) -> f64;
    /// Conversion back from the wire; exact for every value this crate
    /// ships (integer walker counts are exactly representable).
    fn from_f64(x: f64) -> Self;
    /// True for the additive identity.
    fn is_zero(self) -> bool {
        self == Self::default()
    }
}

impl VecElem for f64 {
    fn magnitude(self) -> f64 {
        self.abs()
    }
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(x: f64) -> Self {
        x
    }
}

impl VecElem for i32 {
    fn magnitude(self) -> f64 {
        f64::from(self.abs())
    }
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(x: f64) -> Self {
        x.round() as Self
    }
}

/// Error raised by [`DistVec::save`] and [`DistVec::load`].
#[derive(Debug, Error)]
pub enum StateError {
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The determinant file does not divide into index rows.
    #[error("determinant file holds {len} bytes, not a multiple of the index width {width}")]
    MisalignedDets {
        /// File length in bytes.
        len: usize,
        /// Expected index-row width.
        width: usize,
    },
    /// The value file disagrees with the determinant file.
    #[error("value file holds {found} bytes where {expected} were expected")]
    ValueSize {
        /// File length in bytes.
        found: usize,
        /// Length implied by the determinant count.
        expected: usize,
    },
}

/// Statistics of one [`DistVec::perform_add`] flush.
pub struct AddStats {
    /// Elements committed locally (received from any origin).
    pub n_received: usize,
    /// Noninitiator contributions that landed on already-occupied
    /// positions; feeds the sign-coherence diagnostics.
    pub nonini_occupied_adds: u64,
    /// Return leg: one success byte per add this rank staged, indexed by
    /// destination rank, in staging order.
    pub successes: Vec<Vec<u8>>,
}

/// The distributed sparse vector; see the module docs.
pub struct DistVec<T> {
    n_bits: u8,
    n_occ: usize,
    det_width: usize,
    n_vecs: usize,
    curr_vec: usize,
    capacity: usize,
    curr_size: usize,
    indices: Vec<u8>,
    occ_rows: Vec<u8>,
    diag_cache: Vec<f64>,
    values: Vec<Vec<T>>,
    occupied: Vec<bool>,
    free_stack: Vec<usize>,
    vec_hash: HashTable,
    common_scrambler: Vec<u32>,
    local_scrambler: Vec<u32>,
    min_del_idx: usize,
    n_determ: usize,
    adder: Adder,
    n_nonz: usize,
    occ_scratch: Vec<u8>,
}

impl<T: VecElem> DistVec<T> {
    /// Creates an empty vector for determinants of `n_bits` spin-orbitals
    /// with `n_occ` electrons, storing `n_vecs` value rows.
    ///
    /// `common_scrambler` must be byte-identical on every rank;
    /// `local_scrambler` is private to this process. Both need one word per
    /// spin-orbital.
    #[must_use]
    pub fn new(
        n_bits: u8,
        n_occ: usize,
        n_vecs: usize,
        capacity: usize,
        adder_cap: usize,
        n_procs: usize,
        common_scrambler: Vec<u32>,
        local_scrambler: Vec<u32>,
    ) -> Self {
        assert!(n_vecs > 0 && capacity > 0);
        assert_eq!(common_scrambler.len(), usize::from(n_bits));
        assert_eq!(local_scrambler.len(), usize::from(n_bits));

        let det_width = det_bytes(n_bits);
        Self {
            n_bits,
            n_occ,
            det_width,
            n_vecs,
            curr_vec: 0,
            capacity,
            curr_size: 0,
            indices: vec![0; capacity * det_width],
            occ_rows: vec![0; capacity * n_occ],
            diag_cache: vec![f64::NAN; capacity],
            values: vec![vec![T::default(); capacity]; n_vecs],
            occupied: vec![false; capacity],
            free_stack: vec![],
            vec_hash: HashTable::new(2 * capacity),
            common_scrambler,
            local_scrambler,
            min_del_idx: 0,
            n_determ: 0,
            adder: Adder::new(n_bits, adder_cap, n_procs),
            n_nonz: 0,
            occ_scratch: vec![0; n_occ],
        }
    }

    /// Highest position ever assigned plus one.
    #[must_use]
    pub fn curr_size(&self) -> usize {
        self.curr_size
    }

    /// Number of live positions.
    #[must_use]
    pub fn n_nonz(&self) -> usize {
        self.n_nonz
    }

    /// Number of stored value rows.
    #[must_use]
    pub fn n_vecs(&self) -> usize {
        self.n_vecs
    }

    /// Electrons per determinant, the width of one occupied-orbital row.
    #[must_use]
    pub fn n_occ(&self) -> usize {
        self.n_occ
    }

    /// Row targeted by the scalar operations.
    #[must_use]
    pub fn curr_vec_idx(&self) -> usize {
        self.curr_vec
    }

    /// Points the scalar operations at value row `k`.
    ///
    /// # Panics
    ///
    /// Panics when `k` is out of range.
    pub fn set_curr_vec_idx(&mut self, k: usize) {
        assert!(k < self.n_vecs, "value row {k} of {} requested", self.n_vecs);
        self.curr_vec = k;
    }

    /// Positions below this watermark are never deleted.
    pub fn set_min_del_idx(&mut self, min_del_idx: usize) {
        self.min_del_idx = min_del_idx;
    }

    /// Marks the leading `n_determ` positions as the deterministic
    /// subspace, which is excluded from deletion.
    pub fn set_n_determ(&mut self, n_determ: usize) {
        self.n_determ = n_determ;
    }

    /// Length of the deterministic prefix.
    #[must_use]
    pub fn n_determ(&self) -> usize {
        self.n_determ
    }

    /// The index bytes at `pos`.
    #[must_use]
    pub fn index(&self, pos: usize) -> &[u8] {
        &self.indices[pos * self.det_width..(pos + 1) * self.det_width]
    }

    /// The occupied-orbital list at `pos`.
    #[must_use]
    pub fn occ_orbs(&self, pos: usize) -> &[u8] {
        &self.occ_rows[pos * self.n_occ..(pos + 1) * self.n_occ]
    }

    /// True when `pos` is live.
    #[must_use]
    pub fn is_occupied(&self, pos: usize) -> bool {
        self.occupied[pos]
    }

    /// The current-row value at `pos`.
    #[must_use]
    pub fn value(&self, pos: usize) -> T {
        self.values[self.curr_vec][pos]
    }

    /// The row-`row` value at `pos`.
    #[must_use]
    pub fn value_in(&self, row: usize, pos: usize) -> T {
        self.values[row][pos]
    }

    /// Mutable access to the current-row value at `pos`.
    pub fn value_mut(&mut self, pos: usize) -> &mut T {
        &mut self.values[self.curr_vec][pos]
    }

    /// Mutable access to the row-`row` value at `pos`.
    pub fn value_in_mut(&mut self, row: usize, pos: usize) -> &mut T {
        &mut self.values[row][pos]
    }

    /// Iterates over the live positions in ascending order.
    pub fn live_positions(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.curr_size).filter(move |&pos| self.occupied[pos])
    }

    /// One-norm of the current value row over the live positions.
    #[must_use]
    pub fn local_one_norm(&self) -> f64 {
        self.live_positions()
            .map(|pos| self.values[self.curr_vec][pos].magnitude())
            .sum()
    }

    /// The diagonal matrix element at `pos`, computed through `compute` on
    /// first demand and cached until the position is recycled.
    pub fn diag_el(&mut self, pos: usize, compute: impl FnOnce(&[u8]) -> f64) -> f64 {
        let cached = self.diag_cache[pos];
        if cached.is_nan() {
            let value = compute(&self.occ_rows[pos * self.n_occ..(pos + 1) * self.n_occ]);
            self.diag_cache[pos] = value;
            value
        } else {
            cached
        }
    }

    /// The rank owning determinant `det`; identical on every rank.
    #[must_use]
    pub fn owner_rank(&mut self, det: &[u8], n_procs: usize) -> usize {
        let mut occ = std::mem::take(&mut self.occ_scratch);
        let n = list_bits(det, &mut occ);
        assert_eq!(n, self.n_occ, "determinant has the wrong electron count");
        let rank = assigned_rank(&occ, &self.common_scrambler, n_procs);
        self.occ_scratch = occ;
        rank
    }

    /// Stages `val` for addition at index `det` on whichever rank owns it.
    ///
    /// # Panics
    ///
    /// Panics when the staging row for the owning rank is full; the caller
    /// must flush with [`Self::perform_add`] first.
    pub fn add<C: Comm>(&mut self, det: &[u8], val: T, ini: bool, comm: &C) {
        let dest = self.owner_rank(det, comm.size());
        self.adder.stage(dest, det, val.to_f64(), ini);
    }

    /// Flushes the staged adds: one all-to-all of counts, one of index
    /// payloads, one of value payloads, a local commit, and the return leg
    /// of per-element success bytes.
    pub fn perform_add<C: Comm>(&mut self, comm: &C) -> AddStats {
        let (send_idx, send_val) = self.adder.drain();
        let stage_width = self.adder.stage_width();

        // phase 1: counts
        let count_payloads: Vec<Vec<u8>> = send_val
            .iter()
            .map(|vals| u32::try_from(vals.len()).unwrap().to_le_bytes().to_vec())
            .collect();
        let recv_counts: Vec<usize> = comm
            .all_to_all(&count_payloads)
            .iter()
            .map(|bytes| u32::from_le_bytes(bytes.as_slice().try_into().unwrap()) as usize)
            .collect();

        // phase 2: payloads
        let recv_idx = comm.all_to_all(&send_idx);
        let val_payloads: Vec<Vec<u8>> = send_val
            .iter()
            .map(|vals| vals.iter().flat_map(|v| v.to_le_bytes()).collect())
            .collect();
        let recv_val = comm.all_to_all(&val_payloads);

        // local commit, in origin-rank order
        let mut nonini_occupied = 0;
        let mut n_received = 0;
        let mut det = vec![0; self.det_width];
        let mut success_payloads = Vec::with_capacity(recv_idx.len());

        for (origin, (idx_bytes, val_bytes)) in recv_idx.iter().zip(&recv_val).enumerate() {
            let count = recv_counts[origin];
            assert_eq!(idx_bytes.len(), count * stage_width);
            assert_eq!(val_bytes.len(), count * 8);

            let mut successes = Vec::with_capacity(count);
            for (chunk, val_le) in idx_bytes
                .chunks_exact(stage_width)
                .zip(val_bytes.chunks_exact(8))
            {
                let ini = self.adder.decode(chunk, &mut det);
                let val = f64::from_le_bytes(val_le.try_into().unwrap());
                let (ok, nonini) = self.add_element(&det, val, ini);
                nonini_occupied += u64::from(nonini);
                n_received += usize::from(ok);
                successes.push(u8::from(ok));
            }
            success_payloads.push(successes);
        }

        // return leg, for the origin's perturbative bookkeeping
        let successes = comm.all_to_all(&success_payloads);

        AddStats {
            n_received,
            nonini_occupied_adds: nonini_occupied,
            successes,
        }
    }

    // commits one received element; returns (committed, noninitiator-occupied)
    fn add_element(&mut self, det: &[u8], val: f64, ini: bool) -> (bool, bool) {
        let mut occ = std::mem::take(&mut self.occ_scratch);
        let n = list_bits(det, &mut occ);
        assert_eq!(n, self.n_occ, "determinant has the wrong electron count");
        let hash = det_hash(&occ, &self.local_scrambler);

        let (pos, nonini_occupied) = match self.vec_hash.lookup(det, hash) {
            Some(pos) if pos >= 0 => (usize::try_from(pos).unwrap(), !ini),
            Some(_) => {
                // reserved but unassigned: give it a position
                let pos = self.alloc_position(det, &occ);
                *self.vec_hash.read(det, hash, false).unwrap() = i64::try_from(pos).unwrap();
                (pos, false)
            }
            None => {
                if !ini {
                    // the initiator rule drops contributions that would
                    // create a new population
                    self.occ_scratch = occ;
                    return (false, false);
                }
                let pos = self.alloc_position(det, &occ);
                *self.vec_hash.read(det, hash, true).unwrap() = i64::try_from(pos).unwrap();
                (pos, false)
            }
        };

        self.values[self.curr_vec][pos] += T::from_f64(val);
        self.occ_scratch = occ;
        (true, nonini_occupied)
    }

    fn alloc_position(&mut self, det: &[u8], occ: &[u8]) -> usize {
        let pos = self.free_stack.pop().unwrap_or_else(|| {
            let pos = self.curr_size;
            self.curr_size += 1;
            if self.curr_size > self.capacity {
                self.grow();
            }
            pos
        });

        self.indices[pos * self.det_width..(pos + 1) * self.det_width].copy_from_slice(det);
        self.occ_rows[pos * self.n_occ..(pos + 1) * self.n_occ].copy_from_slice(occ);
        self.diag_cache[pos] = f64::NAN;
        for row in &mut self.values {
            row[pos] = T::default();
        }
        self.occupied[pos] = true;
        self.n_nonz += 1;
        pos
    }

    fn grow(&mut self) {
        self.capacity *= 2;
        self.indices.resize(self.capacity * self.det_width, 0);
        self.occ_rows.resize(self.capacity * self.n_occ, 0);
        self.diag_cache.resize(self.capacity, f64::NAN);
        self.occupied.resize(self.capacity, false);
        for row in &mut self.values {
            row.resize(self.capacity, T::default());
        }
    }

    /// Frees `pos` if every value row there is zero and it lies above both
    /// the no-delete watermark and the deterministic prefix; silently does
    /// nothing otherwise. Freed positions go onto the LIFO stack for reuse.
    pub fn del_at_pos(&mut self, pos: usize) {
        if pos < self.min_del_idx || pos < self.n_determ || !self.occupied[pos] {
            return;
        }
        if !(0..self.n_vecs).all(|row| self.values[row][pos].is_zero()) {
            return;
        }

        let occ = &self.occ_rows[pos * self.n_occ..(pos + 1) * self.n_occ];
        let det = &self.indices[pos * self.det_width..(pos + 1) * self.det_width];
        let hash = det_hash(occ, &self.local_scrambler);
        self.vec_hash.delete(det, hash);

        self.occupied[pos] = false;
        self.free_stack.push(pos);
        self.n_nonz -= 1;
    }

    /// Precomputes the local-table hashes of a flat array of index rows,
    /// for use with [`Self::dot`].
    #[must_use]
    pub fn hashes_for(&mut self, dets: &[u8]) -> Vec<u64> {
        let mut occ = std::mem::take(&mut self.occ_scratch);
        let hashes = dets
            .chunks_exact(self.det_width)
            .map(|det| {
                let n = list_bits(det, &mut occ);
                assert_eq!(n, self.n_occ);
                det_hash(&occ, &self.local_scrambler)
            })
            .collect();
        self.occ_scratch = occ;
        hashes
    }

    /// Local partial of the inner product of the current value row with the
    /// sparse operand `(dets, vals)`, whose local hashes were precomputed
    /// with [`Self::hashes_for`].
    #[must_use]
    pub fn dot(&self, dets: &[u8], vals: &[f64], hashes: &[u64]) -> f64 {
        izip!(dets.chunks_exact(self.det_width), vals, hashes)
            .filter_map(|(det, &val, &hash)| {
                self.vec_hash.lookup(det, hash).and_then(|pos| {
                    (pos >= 0).then(|| {
                        self.values[self.curr_vec][usize::try_from(pos).unwrap()].to_f64() * val
                    })
                })
            })
            .sum()
    }

    /// Gathers the live elements of the current value row from every rank;
    /// each rank receives the identical concatenation, used for trial
    /// vectors.
    #[must_use]
    pub fn collect_procs<C: Comm>(&self, comm: &C) -> (Vec<u8>, Vec<f64>) {
        let mut dets = vec![];
        let mut vals = vec![];
        for pos in self.live_positions() {
            dets.extend_from_slice(self.index(pos));
            vals.push(self.values[self.curr_vec][pos].to_f64());
        }

        let val_bytes: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        let all_dets = comm.all_gather(&dets);
        let all_vals = comm.all_gather(&val_bytes);

        let dets = all_dets.concat();
        let vals = all_vals
            .concat()
            .chunks_exact(8)
            .map(|chunk| f64::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        (dets, vals)
    }

    /// Writes this rank's live index rows and value rows to
    /// `dets<rank>.dat` and `vals<rank>.dat` under `dir`; rank 0 also
    /// writes the common scrambler to `hash.dat` and the per-rank
    /// deterministic-subspace lengths to `dense.txt`.
    pub fn save<C: Comm>(&self, dir: &Path, comm: &C) -> Result<(), StateError> {
        let rank = comm.rank();

        let mut det_file = BufWriter::new(File::create(dir.join(format!("dets{rank}.dat")))?);
        for pos in self.live_positions() {
            det_file.write_all(self.index(pos))?;
        }
        det_file.flush()?;

        let mut val_file = BufWriter::new(File::create(dir.join(format!("vals{rank}.dat")))?);
        for row in 0..self.n_vecs {
            for pos in self.live_positions() {
                val_file.write_all(&self.values[row][pos].to_f64().to_le_bytes())?;
            }
        }
        val_file.flush()?;

        let determ_lengths = comm.all_gather(&u64::try_from(self.n_determ).unwrap().to_le_bytes());
        if rank == 0 {
            let mut hash_file = BufWriter::new(File::create(dir.join("hash.dat"))?);
            for &word in &self.common_scrambler {
                hash_file.write_all(&word.to_le_bytes())?;
            }
            hash_file.flush()?;

            let lengths: Vec<String> = determ_lengths
                .iter()
                .map(|bytes| u64::from_le_bytes(bytes.as_slice().try_into().unwrap()).to_string())
                .collect();
            std::fs::write(dir.join("dense.txt"), lengths.join(",") + "\n")?;
        }
        Ok(())
    }

    /// Restores this rank's elements from `dir`, rebuilding the hash table
    /// and recomputing every occupied-orbital list. Returns the number of
    /// elements loaded.
    pub fn load<C: Comm>(&mut self, dir: &Path, comm: &C) -> Result<usize, StateError> {
        let rank = comm.rank();

        let mut det_bytes_read = vec![];
        File::open(dir.join(format!("dets{rank}.dat")))?.read_to_end(&mut det_bytes_read)?;
        if det_bytes_read.len() % self.det_width != 0 {
            return Err(StateError::MisalignedDets {
                len: det_bytes_read.len(),
                width: self.det_width,
            });
        }
        let n_rows = det_bytes_read.len() / self.det_width;

        let mut val_bytes = vec![];
        File::open(dir.join(format!("vals{rank}.dat")))?.read_to_end(&mut val_bytes)?;
        let expected = self.n_vecs * n_rows * 8;
        if val_bytes.len() != expected {
            return Err(StateError::ValueSize {
                found: val_bytes.len(),
                expected,
            });
        }

        for (i, det) in det_bytes_read.chunks_exact(self.det_width).enumerate() {
            let mut occ = std::mem::take(&mut self.occ_scratch);
            let n = list_bits(det, &mut occ);
            assert_eq!(n, self.n_occ, "loaded determinant has the wrong electron count");
            let hash = det_hash(&occ, &self.local_scrambler);

            let pos = self.alloc_position(det, &occ);
            *self.vec_hash.read(det, hash, true).unwrap() = i64::try_from(pos).unwrap();
            self.occ_scratch = occ;

            for row in 0..self.n_vecs {
                let offset = (row * n_rows + i) * 8;
                let val = f64::from_le_bytes(val_bytes[offset..offset + 8].try_into().unwrap());
                self.values[row][pos] = T::from_f64(val);
            }
        }
        Ok(n_rows)
    }
}
