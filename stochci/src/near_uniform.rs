//! Near-uniform factored sampling of the excitation distribution.
//!
//! The proposal stratifies by singles versus doubles, then (for doubles) by
//! occupied pair, irrep pair, and virtual pair, uniformly at every level
//! where symmetry permits. Every draw carries the exact probability with
//! which it was proposed; a draw with probability `0` is null and must be
//! filtered by the caller before use.

use crate::symm::{
    count_sing_allowed, count_sing_virt, count_symm_virt, spatial, spin, symm_pair_wt,
    virt_from_idx, SymmLookup, N_IRREPS,
};
use arrayvec::ArrayVec;
use rand::Rng;

/// One sampled excitation: 2 orbitals for a single, 4 for a double, plus the
/// exact proposal probability. `prob == 0.0` marks a null draw.
#[derive(Clone, Debug, PartialEq)]
pub struct Draw {
    /// The excitation record, `[i, a]` or `[i, j, a, b]`.
    pub orbs: ArrayVec<u8, 4>,
    /// Probability with which this record was proposed.
    pub prob: f64,
}

impl Draw {
    /// A null draw, to be filtered by the caller.
    #[must_use]
    pub fn null() -> Self {
        Self {
            orbs: ArrayVec::new(),
            prob: 0.0,
        }
    }
}

/// Draws a binomial(`n`, `p`) variate; used to split a walker population
/// into "try a double" versus "try a single". Runs in `O(n)`.
pub fn bin_sample(n: u32, p: f64, rng: &mut impl Rng) -> u32 {
    (0..n).filter(|_| rng.gen::<f64>() < p).count() as u32
}

/// The near-uniform proposal distribution over a fixed set of symmetry
/// labels.
pub struct NearUniform<'a> {
    n_orb: u8,
    symm: &'a [u8],
    lookup: &'a SymmLookup,
}

impl<'a> NearUniform<'a> {
    /// Creates the sampler for `n_orb` active spatial orbitals with irrep
    /// labels `symm`.
    #[must_use]
    pub fn new(n_orb: u8, symm: &'a [u8], lookup: &'a SymmLookup) -> Self {
        Self {
            n_orb,
            symm,
            lookup,
        }
    }

    /// Number of symmetry-allowed virtual pairs for the occupied pair
    /// `(i, j)`.
    #[must_use]
    pub fn allowed_doub_count(&self, counts: &[[u8; 2]; N_IRREPS], i: u8, j: u8) -> u32 {
        let same_spin = spin(i, self.n_orb) == spin(j, self.n_orb);
        let gamma = self.symm[usize::from(spatial(i, self.n_orb))]
            ^ self.symm[usize::from(spatial(j, self.n_orb))];
        symm_pair_wt(counts, gamma, (spin(i, self.n_orb), spin(j, self.n_orb)), same_spin)
            .iter()
            .map(|&w| u32::from(w))
            .sum()
    }

    /// Decodes the `flat`-th allowed virtual pair for the occupied pair
    /// `(i, j)` into a full excitation record, `flat` ranging over
    /// [`Self::allowed_doub_count`]. The flat index runs through the irrep
    /// buckets in order and uniformly within each bucket.
    #[must_use]
    pub fn doub_from_flat(
        &self,
        det: &[u8],
        counts: &[[u8; 2]; N_IRREPS],
        i: u8,
        j: u8,
        mut flat: u32,
    ) -> [u8; 4] {
        let (sigma_i, sigma_j) = (spin(i, self.n_orb), spin(j, self.n_orb));
        let same_spin = sigma_i == sigma_j;
        let gamma = self.symm[usize::from(spatial(i, self.n_orb))]
            ^ self.symm[usize::from(spatial(j, self.n_orb))];

        let weights = symm_pair_wt(counts, gamma, (sigma_i, sigma_j), same_spin);
        let mut g = 0;
        while flat >= u32::from(weights[usize::from(g)]) {
            flat -= u32::from(weights[usize::from(g)]);
            g += 1;
        }
        let h = g ^ gamma;

        let (a, b) = if same_spin {
            if g == h {
                let m = usize::from(counts[usize::from(g)][usize::from(sigma_i)]);
                let (k1, k2) = unrank_pair(flat as usize, m);
                (
                    virt_from_idx(det, self.lookup, self.n_orb, g, sigma_i, k1).unwrap(),
                    virt_from_idx(det, self.lookup, self.n_orb, g, sigma_i, k2).unwrap(),
                )
            } else {
                let m_h = u32::from(counts[usize::from(h)][usize::from(sigma_i)]);
                let a = virt_from_idx(
                    det,
                    self.lookup,
                    self.n_orb,
                    g,
                    sigma_i,
                    (flat / m_h) as usize,
                )
                .unwrap();
                let b = virt_from_idx(
                    det,
                    self.lookup,
                    self.n_orb,
                    h,
                    sigma_i,
                    (flat % m_h) as usize,
                )
                .unwrap();
                if a < b {
                    (a, b)
                } else {
                    (b, a)
                }
            }
        } else {
            let m_dn = u32::from(counts[usize::from(h)][1]);
            (
                virt_from_idx(det, self.lookup, self.n_orb, g, 0, (flat / m_dn) as usize).unwrap(),
                virt_from_idx(det, self.lookup, self.n_orb, h, 1, (flat % m_dn) as usize).unwrap(),
            )
        };

        [i, j, a, b]
    }

    /// The `k`-th allowed virtual for the electron in `orb`, `k` ranging
    /// over [`count_sing_virt`].
    #[must_use]
    pub fn sing_from_flat(&self, det: &[u8], orb: u8, k: u32) -> [u8; 2] {
        let irrep = self.symm[usize::from(spatial(orb, self.n_orb))];
        let a = virt_from_idx(
            det,
            self.lookup,
            self.n_orb,
            irrep,
            spin(orb, self.n_orb),
            k as usize,
        )
        .unwrap();
        [orb, a]
    }

    /// Samples one double excitation of `det`.
    pub fn sample_doub(
        &self,
        det: &[u8],
        occ: &[u8],
        counts: &[[u8; 2]; N_IRREPS],
        rng: &mut impl Rng,
    ) -> Draw {
        let n_elec = occ.len();
        let n_pairs = n_elec * (n_elec - 1) / 2;

        // occupied pair, uniform
        let pair_idx = rng.gen_range(0..n_pairs);
        let (e1, e2) = unrank_pair(pair_idx, n_elec);
        let (i, j) = (occ[e1], occ[e2]);

        // irrep pair by weight, then virtual pair uniform within it;
        // drawing a flat index over the summed weights does both at once
        let total = self.allowed_doub_count(counts, i, j);
        if total == 0 {
            return Draw::null();
        }
        let flat = rng.gen_range(0..total);

        let mut orbs = ArrayVec::new();
        orbs.extend(self.doub_from_flat(det, counts, i, j, flat));
        Draw {
            orbs,
            prob: 1.0 / (n_pairs as f64 * f64::from(total)),
        }
    }

    /// Samples one single excitation of `det`: a uniform choice among the
    /// electrons with at least one allowed virtual, then a uniform allowed
    /// virtual.
    pub fn sample_sing(
        &self,
        det: &[u8],
        occ: &[u8],
        counts: &[[u8; 2]; N_IRREPS],
        rng: &mut impl Rng,
    ) -> Draw {
        let n_allowed = count_sing_allowed(counts, occ, self.symm, self.n_orb);
        if n_allowed == 0 {
            return Draw::null();
        }

        let chosen = rng.gen_range(0..n_allowed);
        let i = *occ
            .iter()
            .filter(|&&orb| count_sing_virt(counts, self.symm, self.n_orb, orb) > 0)
            .nth(chosen)
            .unwrap();

        let n_virt = count_sing_virt(counts, self.symm, self.n_orb, i);
        let k = rng.gen_range(0..usize::from(n_virt));
        let irrep = self.symm[usize::from(spatial(i, self.n_orb))];
        let a = virt_from_idx(det, self.lookup, self.n_orb, irrep, spin(i, self.n_orb), k).unwrap();

        let mut orbs = ArrayVec::new();
        orbs.extend([i, a]);
        Draw {
            orbs,
            prob: 1.0 / (n_allowed as f64 * f64::from(n_virt)),
        }
    }

    /// Samples `n_samp` independent excitations, splitting the attempts
    /// between doubles and singles by a binomial draw with double
    /// probability `p_doub`. The split factor is folded into each draw's
    /// probability. Null draws are included; callers filter them.
    pub fn sample(
        &self,
        det: &[u8],
        occ: &[u8],
        n_samp: u32,
        p_doub: f64,
        rng: &mut impl Rng,
        out: &mut Vec<Draw>,
    ) {
        out.clear();
        let counts = count_symm_virt(det, self.n_orb, self.symm);
        let n_doub = bin_sample(n_samp, p_doub, rng);

        for _ in 0..n_doub {
            let mut draw = self.sample_doub(det, occ, &counts, rng);
            draw.prob *= p_doub;
            out.push(draw);
        }
        for _ in n_doub..n_samp {
            let mut draw = self.sample_sing(det, occ, &counts, rng);
            draw.prob *= 1.0 - p_doub;
            out.push(draw);
        }
    }
}

/// Unranks `idx` into the `idx`-th pair `(e1 < e2)` of `0..n`.
#[must_use]
pub fn unrank_pair(mut idx: usize, n: usize) -> (usize, usize) {
    let mut e1 = 0;
    loop {
        let row = n - 1 - e1;
        if idx < row {
            return (e1, e1 + 1 + idx);
        }
        idx -= row;
        e1 += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstring::set_bit;
    use crate::symm::doub_ex_symm;
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

    #[test]
    fn pair_unranking() {
        let mut seen = vec![];
        for idx in 0..6 {
            seen.push(unrank_pair(idx, 4));
        }
        assert_eq!(
            seen,
            vec![(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)]
        );
    }

    #[test]
    fn binomial_mean() {
        let mut rng = Pcg64::seed_from_u64(7);
        let total: u32 = (0..2000).map(|_| bin_sample(20, 0.3, &mut rng)).sum();
        let mean = f64::from(total) / 2000.0;
        assert!((mean - 6.0).abs() < 0.2);
    }

    #[test]
    fn double_draws_match_their_probabilities() {
        // empirical frequency of every enumerated double converges to the
        // probability reported with the draw
        let n_orb = 4;
        let symm = [0, 1, 0, 1];
        let lookup = SymmLookup::new(&symm);
        let det = det_from(&[0, 1, 4, 5], 1);
        let occ = [0, 1, 4, 5];

        let sampler = NearUniform::new(n_orb, &symm, &lookup);
        let counts = count_symm_virt(&det, n_orb, &symm);

        let mut enumerated = vec![];
        doub_ex_symm(&det, &occ, n_orb, &symm, &mut enumerated);
        assert!(!enumerated.is_empty());

        let mut rng = Pcg64::seed_from_u64(31);
        let n_draws = 200_000;
        let mut hits: HashMap<[u8; 4], (u64, f64)> = HashMap::new();

        for _ in 0..n_draws {
            let draw = sampler.sample_doub(&det, &occ, &counts, &mut rng);
            if draw.prob > 0.0 {
                let key: [u8; 4] = draw.orbs.as_slice().try_into().unwrap();
                let entry = hits.entry(key).or_insert((0, draw.prob));
                entry.0 += 1;
            }
        }

        for record in enumerated {
            let (count, prob) = hits[&record];
            let freq = count as f64 / f64::from(n_draws);
            assert!(
                (freq - prob).abs() < 4.0 * (prob / f64::from(n_draws)).sqrt() + 1e-4,
                "excitation {record:?}: frequency {freq} vs probability {prob}"
            );
        }
    }

    #[test]
    fn single_draws_match_their_probabilities() {
        let n_orb = 4;
        let symm = [0, 0, 0, 1];
        let lookup = SymmLookup::new(&symm);
        let det = det_from(&[0, 4, 7], 1);
        let occ = [0, 4, 7];

        let sampler = NearUniform::new(n_orb, &symm, &lookup);
        let counts = count_symm_virt(&det, n_orb, &symm);

        let mut rng = Pcg64::seed_from_u64(5);
        let n_draws = 100_000;
        let mut hits: HashMap<[u8; 2], (u64, f64)> = HashMap::new();
        let mut nulls = 0;

        for _ in 0..n_draws {
            let draw = sampler.sample_sing(&det, &occ, &counts, &mut rng);
            if draw.prob == 0.0 {
                nulls += 1;
                continue;
            }
            let key: [u8; 2] = draw.orbs.as_slice().try_into().unwrap();
            let entry = hits.entry(key).or_insert((0, draw.prob));
            entry.0 += 1;
        }

        // electron in spin-orbital 7 (irrep 1) has no unoccupied partner,
        // so it is never proposed; the other two always succeed
        assert_eq!(nulls, 0);
        for (record, (count, prob)) in hits {
            let freq = count as f64 / f64::from(n_draws);
            assert!(
                (freq - prob).abs() < 4.0 * (prob / f64::from(n_draws)).sqrt() + 1e-4,
                "excitation {record:?}: frequency {freq} vs probability {prob}"
            );
        }
    }

    #[test]
    fn probabilities_sum_to_one() {
        // the reported double probabilities over all enumerated records sum
        // to 1 when every occupied pair has allowed virtuals
        let n_orb = 4;
        let symm = [0; 4];
        let lookup = SymmLookup::new(&symm);
        let det = det_from(&[0, 1, 4, 5], 1);
        let occ = [0, 1, 4, 5];

        let sampler = NearUniform::new(n_orb, &symm, &lookup);
        let counts = count_symm_virt(&det, n_orb, &symm);

        let mut rng = Pcg64::seed_from_u64(11);
        let mut probs: HashMap<[u8; 4], f64> = HashMap::new();
        for _ in 0..50_000 {
            let draw = sampler.sample_doub(&det, &occ, &counts, &mut rng);
            assert!(draw.prob > 0.0);
            probs.insert(draw.orbs.as_slice().try_into().unwrap(), draw.prob);
        }

        assert_eq!(probs.len(), 18);
        let total: f64 = probs.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
    }
}
