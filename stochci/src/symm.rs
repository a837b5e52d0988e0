//! Point-group symmetry bookkeeping and excitation enumeration.
//!
//! Spatial orbitals carry irreducible-representation labels from an Abelian
//! point group of order [`N_IRREPS`]; the group law is XOR on the labels. A
//! single excitation `i -> a` is allowed when both orbitals carry the same
//! irrep, a double `i, j -> a, b` when the XOR of all four labels vanishes.
//!
//! Spin-orbitals are indexed `0..2 * n_orb`, spin-up first. The enumeration
//! convention is: same-spin doubles are listed once with `i < j` and `a < b`;
//! for opposite-spin doubles the spin-up orbital occupies slots 0 and 2 of
//! the record.

use crate::bitstring::read_bit;

/// Order of the Abelian point group.
pub const N_IRREPS: usize = 8;

/// Spatial orbital of a spin-orbital index.
#[must_use]
pub const fn spatial(orb: u8, n_orb: u8) -> u8 {
    orb % n_orb
}

/// Spin (0 up, 1 down) of a spin-orbital index.
#[must_use]
pub const fn spin(orb: u8, n_orb: u8) -> u8 {
    orb / n_orb
}

/// Spatial orbitals grouped by irrep, each group ascending.
pub struct SymmLookup {
    by_irrep: [Vec<u8>; N_IRREPS],
}

impl SymmLookup {
    /// Builds the lookup from the per-orbital irrep labels.
    ///
    /// # Panics
    ///
    /// Panics if a label is outside `0..8`.
    #[must_use]
    pub fn new(symm: &[u8]) -> Self {
        let mut by_irrep: [Vec<u8>; N_IRREPS] = Default::default();
        for (orb, &irrep) in symm.iter().enumerate() {
            by_irrep[usize::from(irrep)].push(u8::try_from(orb).unwrap());
        }
        Self { by_irrep }
    }

    /// The spatial orbitals carrying irrep `irrep`, ascending.
    #[must_use]
    pub fn orbs(&self, irrep: u8) -> &[u8] {
        &self.by_irrep[usize::from(irrep)]
    }
}

/// Counts the unoccupied spatial orbitals of `det` for every (irrep, spin)
/// pair.
#[must_use]
pub fn count_symm_virt(det: &[u8], n_orb: u8, symm: &[u8]) -> [[u8; 2]; N_IRREPS] {
    let mut counts = [[0; 2]; N_IRREPS];
    for sp in 0..n_orb {
        for sigma in 0..2 {
            if !read_bit(det, sp + sigma * n_orb) {
                counts[usize::from(symm[usize::from(sp)])][usize::from(sigma)] += 1;
            }
        }
    }
    counts
}

/// Number of symmetry-allowed single excitations of the electron in
/// spin-orbital `orb`, given precomputed virtual counts.
#[must_use]
pub fn count_sing_virt(counts: &[[u8; 2]; N_IRREPS], symm: &[u8], n_orb: u8, orb: u8) -> u8 {
    counts[usize::from(symm[usize::from(spatial(orb, n_orb))])][usize::from(spin(orb, n_orb))]
}

/// Number of occupied orbitals with at least one symmetry-allowed single
/// excitation.
#[must_use]
pub fn count_sing_allowed(
    counts: &[[u8; 2]; N_IRREPS],
    occ: &[u8],
    symm: &[u8],
    n_orb: u8,
) -> usize {
    occ.iter()
        .filter(|&&orb| count_sing_virt(counts, symm, n_orb, orb) > 0)
        .count()
}

/// Total number of symmetry-allowed single excitations of `occ`, without
/// materialising them.
#[must_use]
pub fn count_singex(counts: &[[u8; 2]; N_IRREPS], occ: &[u8], symm: &[u8], n_orb: u8) -> usize {
    occ.iter()
        .map(|&orb| usize::from(count_sing_virt(counts, symm, n_orb, orb)))
        .sum()
}

/// Number of symmetry-allowed virtual pairs for each possible irrep of the
/// first virtual orbital.
///
/// `gamma` is the XOR of the two occupied orbitals' irreps and `same_spin`
/// selects the pairing rule: for a same-spin pair the unordered count is
/// reported under the smaller irrep of each `(g, g ^ gamma)` pair, for an
/// opposite-spin pair the index is the irrep of the spin-up virtual and all
/// eight entries may be populated.
#[must_use]
pub fn symm_pair_wt(
    counts: &[[u8; 2]; N_IRREPS],
    gamma: u8,
    spins: (u8, u8),
    same_spin: bool,
) -> [u16; N_IRREPS] {
    let mut weights = [0; N_IRREPS];
    for g in 0..u8::try_from(N_IRREPS).unwrap() {
        let h = g ^ gamma;
        let entry = &mut weights[usize::from(g)];

        if same_spin {
            let m_g = u16::from(counts[usize::from(g)][usize::from(spins.0)]);
            if h == g {
                *entry = m_g * m_g.saturating_sub(1) / 2;
            } else if h > g {
                *entry = m_g * u16::from(counts[usize::from(h)][usize::from(spins.0)]);
            }
        } else {
            *entry = u16::from(counts[usize::from(g)][0])
                * u16::from(counts[usize::from(h)][1]);
        }
    }
    weights
}

/// Returns the `k`-th (0-based) unoccupied spatial orbital of irrep `irrep`
/// and spin `spin` as a spin-orbital index, or `None` if fewer than `k + 1`
/// exist.
#[must_use]
pub fn virt_from_idx(
    det: &[u8],
    lookup: &SymmLookup,
    n_orb: u8,
    irrep: u8,
    spin: u8,
    k: usize,
) -> Option<u8> {
    lookup
        .orbs(irrep)
        .iter()
        .map(|&sp| sp + spin * n_orb)
        .filter(|&orb| !read_bit(det, orb))
        .nth(k)
}

/// Enumerates every symmetry-allowed double excitation of `det` into `out`.
///
/// `out` is cleared first; each record is `[i, j, a, b]` with `i, j` occupied
/// and `a, b` unoccupied, following the module-level ordering convention.
pub fn doub_ex_symm(det: &[u8], occ: &[u8], n_orb: u8, symm: &[u8], out: &mut Vec<[u8; 4]>) {
    out.clear();

    for (e1, &i) in occ.iter().enumerate() {
        for &j in &occ[e1 + 1..] {
            let (sp_i, sp_j) = (spatial(i, n_orb), spatial(j, n_orb));
            let gamma = symm[usize::from(sp_i)] ^ symm[usize::from(sp_j)];

            if spin(i, n_orb) == spin(j, n_orb) {
                let sigma = spin(i, n_orb);
                for a_sp in 0..n_orb {
                    let a = a_sp + sigma * n_orb;
                    if read_bit(det, a) {
                        continue;
                    }
                    for b_sp in a_sp + 1..n_orb {
                        let b = b_sp + sigma * n_orb;
                        if read_bit(det, b)
                            || symm[usize::from(a_sp)] ^ symm[usize::from(b_sp)] != gamma
                        {
                            continue;
                        }
                        out.push([i, j, a, b]);
                    }
                }
            } else {
                // `occ` is sorted, so `i` is the spin-up orbital
                for a_sp in 0..n_orb {
                    if read_bit(det, a_sp) {
                        continue;
                    }
                    for b_sp in 0..n_orb {
                        let b = b_sp + n_orb;
                        if read_bit(det, b)
                            || symm[usize::from(a_sp)] ^ symm[usize::from(b_sp)] != gamma
                        {
                            continue;
                        }
                        out.push([i, j, a_sp, b]);
                    }
                }
            }
        }
    }
}

/// Enumerates every symmetry-allowed single excitation of `det` into `out`
/// as `[i, a]` records. `out` is cleared first.
pub fn sing_ex_symm(det: &[u8], occ: &[u8], n_orb: u8, symm: &[u8], out: &mut Vec<[u8; 2]>) {
    out.clear();

    for &i in occ {
        let sigma = spin(i, n_orb);
        let irrep = symm[usize::from(spatial(i, n_orb))];
        for a_sp in 0..n_orb {
            let a = a_sp + sigma * n_orb;
            if symm[usize::from(a_sp)] == irrep && !read_bit(det, a) {
                out.push([i, a]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstring::set_bit;

    fn det_from(bits: &[u8], n_bytes: usize) -> Vec<u8> {
        let mut det = vec![0; n_bytes];
        for &bit in bits {
            set_bit(&mut det, bit);
        }
        det
    }

    #[test]
    fn lookup_groups_orbitals() {
        let symm = [0, 1, 0, 3, 1, 0];
        let lookup = SymmLookup::new(&symm);

        assert_eq!(lookup.orbs(0), &[0, 2, 5]);
        assert_eq!(lookup.orbs(1), &[1, 4]);
        assert_eq!(lookup.orbs(3), &[3]);
        assert_eq!(lookup.orbs(2), &[] as &[u8]);
    }

    #[test]
    fn virt_counts() {
        // 4 spatial orbitals, occupied: up {0, 1}, down {0}
        let symm = [0, 1, 0, 1];
        let det = det_from(&[0, 1, 4], 1);

        let counts = count_symm_virt(&det, 4, &symm);
        assert_eq!(counts[0], [1, 1]); // up: {2}, down: {2}
        assert_eq!(counts[1], [1, 2]); // up: {3}, down: {1, 3}
    }

    #[test]
    fn hf_double_count() {
        // n_orb = 4, n_elec = 4, every orbital in irrep 0: 2 same-spin
        // doubles (one per spin) plus 2 * 2 * 2 * 2 opposite-spin doubles
        let symm = [0; 4];
        let det = det_from(&[0, 1, 4, 5], 1);
        let occ = [0, 1, 4, 5];

        let mut doubles = vec![];
        doub_ex_symm(&det, &occ, 4, &symm, &mut doubles);
        assert_eq!(doubles.len(), 18);
    }

    #[test]
    fn doubles_obey_ordering_and_symmetry() {
        let symm = [0, 1, 2, 3, 1, 0];
        let det = det_from(&[0, 1, 6, 8], 2);
        let occ = [0, 1, 6, 8];
        let n_orb = 6;

        let mut doubles = vec![];
        doub_ex_symm(&det, &occ, n_orb, &symm, &mut doubles);
        assert!(!doubles.is_empty());

        for [i, j, a, b] in doubles {
            // P3: irrep closure
            let product = symm[usize::from(spatial(i, n_orb))]
                ^ symm[usize::from(spatial(j, n_orb))]
                ^ symm[usize::from(spatial(a, n_orb))]
                ^ symm[usize::from(spatial(b, n_orb))];
            assert_eq!(product, 0);

            assert!(i < j);
            if spin(i, n_orb) == spin(j, n_orb) {
                assert!(a < b);
                assert_eq!(spin(a, n_orb), spin(i, n_orb));
            } else {
                // spin-up orbitals in slots 0 and 2
                assert_eq!(spin(i, n_orb), 0);
                assert_eq!(spin(a, n_orb), 0);
                assert_eq!(spin(j, n_orb), 1);
                assert_eq!(spin(b, n_orb), 1);
            }
            assert!(!read_bit(&det, a));
            assert!(!read_bit(&det, b));
        }
    }

    #[test]
    fn singles_match_counts() {
        let symm = [0, 1, 0, 1, 2, 0];
        let det = det_from(&[0, 3, 7, 10], 2);
        let occ = [0, 3, 7, 10];
        let n_orb = 6;

        let mut singles = vec![];
        sing_ex_symm(&det, &occ, n_orb, &symm, &mut singles);

        let counts = count_symm_virt(&det, n_orb, &symm);
        assert_eq!(singles.len(), count_singex(&counts, &occ, &symm, n_orb));

        for [i, a] in singles {
            assert_eq!(
                symm[usize::from(spatial(i, n_orb))],
                symm[usize::from(spatial(a, n_orb))]
            );
            assert_eq!(spin(i, n_orb), spin(a, n_orb));
            assert!(!read_bit(&det, a));
        }
    }

    #[test]
    fn pair_weights_cover_enumeration() {
        // same-spin pair in irreps 0 and 1, so gamma = 1
        let symm = [0, 1, 0, 1, 0, 1];
        let det = det_from(&[0, 1], 2);
        let n_orb = 6;

        let counts = count_symm_virt(&det, n_orb, &symm);
        let weights = symm_pair_wt(&counts, 1, (0, 0), true);

        // unoccupied up: irrep 0 {2, 4}, irrep 1 {3, 5}; unordered mixed
        // pairs live under the smaller irrep
        assert_eq!(weights[0], 4);
        assert_eq!(weights[1], 0);

        let mut doubles = vec![];
        doub_ex_symm(&det, &[0, 1], n_orb, &symm, &mut doubles);
        assert_eq!(doubles.len(), usize::from(weights.iter().sum::<u16>()));
    }

    #[test]
    fn kth_virtual() {
        let symm = [0, 1, 0, 1, 0, 0];
        let lookup = SymmLookup::new(&symm);
        let det = det_from(&[0, 2, 7], 2);
        let n_orb = 6;

        // unoccupied up orbitals of irrep 0: {4, 5}
        assert_eq!(virt_from_idx(&det, &lookup, n_orb, 0, 0, 0), Some(4));
        assert_eq!(virt_from_idx(&det, &lookup, n_orb, 0, 0, 1), Some(5));
        assert_eq!(virt_from_idx(&det, &lookup, n_orb, 0, 0, 2), None);
        // unoccupied down orbitals of irrep 1: {9 (= 3 + 6)} minus occupied 7 -> {9}
        assert_eq!(virt_from_idx(&det, &lookup, n_orb, 1, 1, 0), Some(9));
    }
}
