//! Heat-bath Power-Pitzer sampling of double excitations.
//!
//! The uniform stages of the near-uniform factorisation are replaced by
//! distributions computed once from the two-electron integrals: the occupied
//! pair is drawn from row sums of the double-excitation magnitude matrix,
//! the virtuals from the square roots of the exchange integrals. The
//! normalised variant renormalises the virtual distributions over the
//! unoccupied orbitals of each determinant; the unnormalised variant samples
//! the fixed whole-orbital distribution through precomputed alias tables in
//! `O(1)` and returns a null draw whenever an occupied orbital comes up.
//!
//! Point-group symmetry is not folded into the proposal; a symmetry-
//! forbidden record carries a vanishing matrix element and contributes
//! nothing. Singles are sampled near-uniformly under both variants.

use crate::compress::AliasTable;
use crate::matel::Integrals;
use crate::near_uniform::Draw;
use crate::symm::{spatial, spin};
use arrayvec::ArrayVec;
use ndarray::Array2;
use rand::Rng;

/// Which flavour of the heat-bath distribution to sample.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HbVariant {
    /// Virtual distributions renormalised over unoccupied orbitals.
    Normalized,
    /// Fixed whole-orbital virtual distributions with alias sampling.
    Unnormalized,
}

/// The heat-bath Power-Pitzer proposal distribution.
pub struct HeatBath {
    n_orb: u8,
    d_mat: Array2<f64>,
    s_row: Vec<f64>,
    exch_sqrt: Array2<f64>,
    exch_row_sum: Vec<f64>,
    exch_alias: Vec<AliasTable>,
    variant: HbVariant,
}

impl HeatBath {
    /// Builds the sampling tables from the integrals. This is the only
    /// `O(n_orb^4)` step; sampling afterwards touches `O(n_elec + n_orb)`
    /// values per draw (or `O(n_elec)` for the unnormalised variant).
    #[must_use]
    pub fn set_up(ints: &Integrals, variant: HbVariant) -> Self {
        let n_orb = u8::try_from(ints.n_active()).unwrap();
        let n = usize::from(n_orb);

        // Coulomb-style magnitude sums; they dominate every pair that has a
        // nonzero element, including the same-spatial opposite-spin pairs
        // the antisymmetrised sum would miss
        let mut d_mat = Array2::zeros((n, n));
        for p in 0..n_orb {
            for q in 0..n_orb {
                let mut total = 0.0;
                for r in 0..n_orb {
                    for s in 0..n_orb {
                        total += ints.eri(p, r, q, s).abs();
                    }
                }
                d_mat[[usize::from(p), usize::from(q)]] = total;
            }
        }

        let s_row: Vec<f64> = d_mat.rows().into_iter().map(|row| row.sum()).collect();

        let mut exch_sqrt = Array2::zeros((n, n));
        for p in 0..n_orb {
            for q in 0..n_orb {
                // exchange integral (pq|qp)
                exch_sqrt[[usize::from(p), usize::from(q)]] =
                    ints.eri(p, q, q, p).abs().sqrt();
            }
        }

        let exch_row_sum: Vec<f64> = exch_sqrt.rows().into_iter().map(|row| row.sum()).collect();
        let exch_alias = exch_sqrt
            .rows()
            .into_iter()
            .map(|row| AliasTable::setup(row.as_slice().unwrap()))
            .collect();

        Self {
            n_orb,
            d_mat,
            s_row,
            exch_sqrt,
            exch_row_sum,
            exch_alias,
            variant,
        }
    }

    fn occ_pair_prob(&self, occ: &[u8], e_first: usize, e_second: usize) -> f64 {
        let sp_first = usize::from(spatial(occ[e_first], self.n_orb));
        let sp_second = usize::from(spatial(occ[e_second], self.n_orb));

        let s_total: f64 = occ
            .iter()
            .map(|&orb| self.s_row[usize::from(spatial(orb, self.n_orb))])
            .sum();
        let d_total: f64 = occ
            .iter()
            .enumerate()
            .filter(|&(e, _)| e != e_first)
            .map(|(_, &orb)| self.d_mat[[sp_first, usize::from(spatial(orb, self.n_orb))]])
            .sum();
        if s_total == 0.0 || d_total == 0.0 {
            return 0.0;
        }
        (self.s_row[sp_first] / s_total) * (self.d_mat[[sp_first, sp_second]] / d_total)
    }

    // probability of proposing spatial orbital `virt` as the partner of the
    // electron in `orb`, under the active variant
    fn virt_prob(&self, det: &[u8], orb: u8, virt: u8) -> f64 {
        let sp = usize::from(spatial(orb, self.n_orb));
        match self.variant {
            HbVariant::Unnormalized => {
                self.exch_sqrt[[sp, usize::from(virt)]] / self.exch_row_sum[sp]
            }
            HbVariant::Normalized => {
                let sigma = spin(orb, self.n_orb);
                let total: f64 = (0..self.n_orb)
                    .filter(|&q| !crate::bitstring::read_bit(det, q + sigma * self.n_orb))
                    .map(|q| self.exch_sqrt[[sp, usize::from(q)]])
                    .sum();
                if total == 0.0 {
                    0.0
                } else {
                    self.exch_sqrt[[sp, usize::from(virt)]] / total
                }
            }
        }
    }

    fn sample_virt(&self, det: &[u8], orb: u8, rng: &mut impl Rng) -> Option<u8> {
        let sp = usize::from(spatial(orb, self.n_orb));
        let sigma = spin(orb, self.n_orb);

        match self.variant {
            HbVariant::Unnormalized => {
                let q = u8::try_from(self.exch_alias[sp].sample(rng)).unwrap();
                // occupied draws are zero-weight and come back null
                (!crate::bitstring::read_bit(det, q + sigma * self.n_orb)).then_some(q)
            }
            HbVariant::Normalized => {
                let total: f64 = (0..self.n_orb)
                    .filter(|&q| !crate::bitstring::read_bit(det, q + sigma * self.n_orb))
                    .map(|q| self.exch_sqrt[[sp, usize::from(q)]])
                    .sum();
                if total == 0.0 {
                    return None;
                }
                let mut target = rng.gen::<f64>() * total;
                for q in 0..self.n_orb {
                    if crate::bitstring::read_bit(det, q + sigma * self.n_orb) {
                        continue;
                    }
                    target -= self.exch_sqrt[[sp, usize::from(q)]];
                    if target < 0.0 {
                        return Some(q);
                    }
                }
                None
            }
        }
    }

    /// Samples one double excitation of `det`. The returned probability
    /// accounts for every factored ordering that can propose the same
    /// record.
    pub fn sample_doub(&self, det: &[u8], occ: &[u8], rng: &mut impl Rng) -> Draw {
        // first electron by S-row weight
        let s_weights: Vec<f64> = occ
            .iter()
            .map(|&orb| self.s_row[usize::from(spatial(orb, self.n_orb))])
            .collect();
        let Some(e1) = cdf_sample(&s_weights, rng) else {
            return Draw::null();
        };

        // second electron by D-matrix weight
        let sp1 = usize::from(spatial(occ[e1], self.n_orb));
        let d_weights: Vec<f64> = occ
            .iter()
            .enumerate()
            .map(|(e, &orb)| {
                if e == e1 {
                    0.0
                } else {
                    self.d_mat[[sp1, usize::from(spatial(orb, self.n_orb))]]
                }
            })
            .collect();
        let Some(e2) = cdf_sample(&d_weights, rng) else {
            return Draw::null();
        };

        let (i, j) = (occ[e1], occ[e2]);
        let Some(a_sp) = self.sample_virt(det, i, rng) else {
            return Draw::null();
        };
        let Some(b_sp) = self.sample_virt(det, j, rng) else {
            return Draw::null();
        };

        let a = a_sp + spin(i, self.n_orb) * self.n_orb;
        let b = b_sp + spin(j, self.n_orb) * self.n_orb;
        if a == b {
            return Draw::null();
        }

        // sum the proposal probability over the orderings producing this
        // record: both electron orderings, and both virtual pairings when
        // the spins coincide
        let pair_prob = self.occ_pair_prob(occ, e1, e2) + self.occ_pair_prob(occ, e2, e1);
        let same_spin = spin(i, self.n_orb) == spin(j, self.n_orb);
        let mut virt_factor = self.virt_prob(det, i, a_sp) * self.virt_prob(det, j, b_sp);
        if same_spin {
            virt_factor += self.virt_prob(det, i, b_sp) * self.virt_prob(det, j, a_sp);
        }

        let ((i, j), (a, b)) = order_record(i, j, a, b, self.n_orb);
        let mut orbs = ArrayVec::new();
        orbs.extend([i, j, a, b]);
        Draw {
            orbs,
            prob: pair_prob * virt_factor,
        }
    }
}

// orders a double-excitation record by the module conventions: ascending
// occupied pair; ascending virtuals for same spin, spin-up slots first
// otherwise
fn order_record(i: u8, j: u8, a: u8, b: u8, n_orb: u8) -> ((u8, u8), (u8, u8)) {
    if spin(i, n_orb) == spin(j, n_orb) {
        let occ = if i < j { (i, j) } else { (j, i) };
        let virt = if a < b { (a, b) } else { (b, a) };
        (occ, virt)
    } else if spin(i, n_orb) == 0 {
        ((i, j), (a, b))
    } else {
        ((j, i), (b, a))
    }
}

fn cdf_sample(weights: &[f64], rng: &mut impl Rng) -> Option<usize> {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let mut target = rng.gen::<f64>() * total;
    for (idx, &weight) in weights.iter().enumerate() {
        target -= weight;
        if target < 0.0 {
            return Some(idx);
        }
    }
    // floating-point underrun lands on the last nonzero weight
    weights.iter().rposition(|&w| w > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstring::set_bit;
    use crate::symm::doub_ex_symm;
    use float_cmp::assert_approx_eq;
    use ndarray::{Array2 as A2, Array4};
    use rand::SeedableRng;
    use rand_pcg::Pcg64;
    use std::collections::HashMap;

    fn det_from(bits: &[u8], n_bytes: usize) -> Vec<u8> {
        let mut det = vec![0; n_bytes];
        for &bit in bits {
            set_bit(&mut det, bit);
        }
        det
    }

    fn test_integrals(n: usize) -> Integrals {
        // deterministic, asymmetric-free tensor with full 8-fold symmetry
        let mut eris = Array4::zeros((n, n, n, n));
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    for l in 0..n {
                        let canon = [
                            [i, j, k, l],
                            [j, i, k, l],
                            [i, j, l, k],
                            [j, i, l, k],
                            [k, l, i, j],
                            [l, k, i, j],
                            [k, l, j, i],
                            [l, k, j, i],
                        ]
                        .into_iter()
                        .min()
                        .unwrap();
                        let [a, b, c, d] = canon;
                        eris[[i, j, k, l]] =
                            0.1 + 0.07 * (a + 2 * b) as f64 + 0.03 * (c * d) as f64;
                    }
                }
            }
        }
        Integrals::new(A2::zeros((n, n)), eris, 0)
    }

    #[test]
    fn d_matrix_is_symmetric() {
        let ints = test_integrals(4);
        let hb = HeatBath::set_up(&ints, HbVariant::Normalized);

        for p in 0..4 {
            for q in 0..4 {
                assert_approx_eq!(f64, hb.d_mat[[p, q]], hb.d_mat[[q, p]], ulps = 4);
            }
        }
        assert_approx_eq!(f64, hb.s_row[1], hb.d_mat.row(1).sum(), ulps = 4);
    }

    fn frequency_check(variant: HbVariant) {
        let n_orb = 3;
        let ints = test_integrals(3);
        let hb = HeatBath::set_up(&ints, variant);

        let det = det_from(&[0, 4], 1);
        let occ = [0, 4];
        let symm = [0; 3];

        let mut enumerated = vec![];
        doub_ex_symm(&det, &occ, n_orb, &symm, &mut enumerated);
        assert_eq!(enumerated.len(), 4);

        let mut rng = Pcg64::seed_from_u64(17);
        let n_draws = 300_000;
        let mut hits: HashMap<[u8; 4], (u64, f64)> = HashMap::new();

        for _ in 0..n_draws {
            let draw = hb.sample_doub(&det, &occ, &mut rng);
            if draw.prob > 0.0 {
                let key: [u8; 4] = draw.orbs.as_slice().try_into().unwrap();
                let entry = hits.entry(key).or_insert((0, draw.prob));
                entry.0 += 1;
            }
        }

        for record in enumerated {
            let (count, prob) = hits
                .get(&record)
                .copied()
                .unwrap_or_else(|| panic!("{record:?} never proposed"));
            let freq = count as f64 / f64::from(n_draws);
            assert!(
                (freq - prob).abs() < 4.0 * (prob / f64::from(n_draws)).sqrt() + 2e-4,
                "{variant:?} {record:?}: frequency {freq} vs probability {prob}"
            );
        }
    }

    #[test]
    fn normalized_draws_match_their_probabilities() {
        frequency_check(HbVariant::Normalized);
    }

    #[test]
    fn unnormalized_draws_match_their_probabilities() {
        frequency_check(HbVariant::Unnormalized);
    }

    #[test]
    fn same_spin_records_are_ordered() {
        let ints = test_integrals(4);
        let hb = HeatBath::set_up(&ints, HbVariant::Normalized);

        let det = det_from(&[0, 1, 4], 1);
        let occ = [0, 1, 4];
        let mut rng = Pcg64::seed_from_u64(3);

        for _ in 0..2000 {
            let draw = hb.sample_doub(&det, &occ, &mut rng);
            if draw.prob == 0.0 {
                continue;
            }
            let [i, j, a, b]: [u8; 4] = draw.orbs.as_slice().try_into().unwrap();
            assert!(i < j);
            if spin(i, 4) == spin(j, 4) {
                assert!(a < b);
            } else {
                assert_eq!(spin(i, 4), 0);
                assert_eq!(spin(a, 4), 0);
            }
            assert!(!crate::bitstring::read_bit(&det, a));
            assert!(!crate::bitstring::read_bit(&det, b));
        }
    }
}
