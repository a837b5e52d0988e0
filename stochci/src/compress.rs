//! Stochastic compression of sparse vectors.
//!
//! One compression is the composition of two operations: [`find_preserve`]
//! keeps every element whose magnitude is large enough that resampling it
//! could only add variance, and [`sys_comp`] replaces the remainder by a
//! systematic (low-variance) resample whose expectation equals the input.
//! Both synchronise across ranks, because the preservation threshold and the
//! sampling step depend on the global one-norm, and the single uniform
//! random number driving the resample is broadcast from rank 0 by the
//! caller.
//!
//! [`comp_sub`] is the factored variant used when the matrix-vector product
//! is a chain of sub-sampling steps; [`AliasTable`] is the `O(1)`
//! categorical-sampling helper used by the heat-bath distributions.

use crate::comm::Comm;
use itertools::izip;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Walker's alias table for `O(1)` sampling from a fixed categorical
/// distribution.
pub struct AliasTable {
    prob: Vec<f64>,
    alias: Vec<u32>,
}

impl AliasTable {
    /// Builds the table from nonnegative `weights`.
    ///
    /// # Panics
    ///
    /// Panics if `weights` is empty or sums to zero.
    #[must_use]
    pub fn setup(weights: &[f64]) -> Self {
        let n = weights.len();
        let total: f64 = weights.iter().sum();
        assert!(n > 0 && total > 0.0, "alias table needs positive weight");

        let mut prob: Vec<f64> = weights
            .iter()
            .map(|&w| w * n as f64 / total)
            .collect();
        let mut alias = vec![0_u32; n];

        let mut small: Vec<usize> = (0..n).filter(|&i| prob[i] < 1.0).collect();
        let mut large: Vec<usize> = (0..n).filter(|&i| prob[i] >= 1.0).collect();

        while let (Some(&s), Some(&l)) = (small.last(), large.last()) {
            small.pop();
            alias[s] = u32::try_from(l).unwrap();
            prob[l] -= 1.0 - prob[s];
            if prob[l] < 1.0 {
                large.pop();
                small.push(l);
            }
        }
        // leftovers are flush with 1 up to round-off
        for &i in small.iter().chain(large.iter()) {
            prob[i] = 1.0;
        }

        Self { prob, alias }
    }

    /// Draws one category.
    pub fn sample(&self, rng: &mut impl Rng) -> usize {
        let k = rng.gen_range(0..self.prob.len());
        if rng.gen::<f64>() < self.prob[k] {
            k
        } else {
            self.alias[k] as usize
        }
    }
}

struct HeapItem {
    mag: f64,
    pos: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.mag == other.mag && self.pos == other.pos
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.mag
            .partial_cmp(&other.mag)
            .unwrap()
            .then(self.pos.cmp(&other.pos))
    }
}

/// Marks in `keep` every element of `values` that is preserved exactly and
/// returns the global one-norm of the un-kept remainder together with the
/// global number of kept elements.
///
/// An element is preserved when its magnitude reaches the running threshold
/// `residual / (n_target - n_kept)`; the residual norm is re-reduced across
/// ranks every pass because the threshold depends on it, and the loop ends
/// when no rank preserved anything new.
pub fn find_preserve<C: Comm>(
    values: &[f64],
    keep: &mut [bool],
    n_target: usize,
    comm: &C,
) -> (f64, usize) {
    assert_eq!(values.len(), keep.len());
    keep.iter_mut().for_each(|k| *k = false);

    let mut heap: BinaryHeap<HeapItem> = values
        .iter()
        .enumerate()
        .filter(|(_, &v)| v != 0.0)
        .map(|(pos, &v)| HeapItem { mag: v.abs(), pos })
        .collect();

    let mut local_resid: f64 = heap.iter().map(|item| item.mag).sum();
    let mut n_kept_glob = 0_usize;

    loop {
        let glob_resid = comm.sum_f64(local_resid);
        if n_kept_glob >= n_target || glob_resid <= 0.0 {
            return (glob_resid, n_kept_glob);
        }

        let thresh = glob_resid / (n_target - n_kept_glob) as f64;
        let mut n_new = 0_u64;
        while let Some(top) = heap.peek() {
            if top.mag < thresh {
                break;
            }
            let item = heap.pop().unwrap();
            keep[item.pos] = true;
            local_resid -= item.mag;
            n_new += 1;
        }

        let n_new_glob = comm.sum_u64(n_new);
        if n_new_glob == 0 {
            return (glob_resid, n_kept_glob);
        }
        n_kept_glob += usize::try_from(n_new_glob).unwrap();
    }
}

// first sample point inside this rank's slab of the global prefix order
fn seed_sys(local_norms: &[f64], rank: usize, u: f64, step: f64) -> f64 {
    let offset: f64 = local_norms[..rank].iter().sum();
    let k = ((offset - u) / step).ceil().max(0.0);
    u + k * step - offset
}

/// Systematically resamples the un-kept elements of `values` in place so
/// that at most `n_samp` of them survive, each with magnitude
/// `norm / n_samp` times its hit count and the sign of the original value.
///
/// `rn_sys` is the single uniform in `[0, 1)` broadcast from rank 0; every
/// rank derives its slab of sample points from it, so the resample is
/// consistent across any rank count.
pub fn sys_comp<C: Comm>(
    values: &mut [f64],
    keep: &[bool],
    n_samp: usize,
    rn_sys: f64,
    comm: &C,
) {
    let local_norm: f64 = values
        .iter()
        .zip(keep)
        .filter(|&(v, &k)| !k && *v != 0.0)
        .map(|(v, _)| v.abs())
        .sum();
    let norms = comm.gather_f64(local_norm);
    let glob_norm: f64 = norms.iter().sum();

    if n_samp == 0 || glob_norm <= 0.0 {
        for (v, &k) in values.iter_mut().zip(keep) {
            if !k {
                *v = 0.0;
            }
        }
        return;
    }

    let step = glob_norm / n_samp as f64;
    let u = rn_sys * step;
    let mut next = seed_sys(&norms, comm.rank(), u, step);
    let mut lbound = 0.0;

    for (v, &k) in values.iter_mut().zip(keep) {
        if k || *v == 0.0 {
            continue;
        }
        let ubound = lbound + v.abs();
        let mut hits = 0_u64;
        while next < ubound {
            hits += 1;
            next += step;
        }
        *v = v.signum() * step * hits as f64;
        lbound = ubound;
    }
}

/// Per-row sub-distribution of the factored compression.
pub enum RowDist<'a> {
    /// `n` equally weighted choices.
    Uniform(u32),
    /// Explicit sub-weights, not necessarily normalised.
    Weighted(&'a [f64]),
}

impl RowDist<'_> {
    fn len(&self) -> u32 {
        match self {
            Self::Uniform(n) => *n,
            Self::Weighted(wts) => u32::try_from(wts.len()).unwrap(),
        }
    }

    // weight of leaf `k` under row weight `row_wt`
    fn leaf(&self, row_wt: f64, k: u32) -> f64 {
        match self {
            Self::Uniform(n) => row_wt / f64::from(*n),
            Self::Weighted(wts) => {
                let total: f64 = wts.iter().sum();
                if total <= 0.0 {
                    0.0
                } else {
                    row_wt * wts[k as usize] / total
                }
            }
        }
    }
}

/// One surviving draw of the factored compression.
#[derive(Clone, Debug, PartialEq)]
pub struct SubSample {
    /// Index into the row (origin) array.
    pub row: usize,
    /// Index of the chosen sub-option within the row.
    pub sub: u32,
    /// Surviving weight: the exact leaf weight for preserved leaves, a
    /// multiple of the sampling step otherwise.
    pub weight: f64,
}

enum KeepState {
    None,
    All,
    Partial(Vec<bool>),
}

/// Factored "keep large, resample the rest" over rows with sub-weights.
///
/// Every leaf `(row, sub)` carries weight `row_wts[row]` times the
/// normalised sub-weight. Leaves at or above the running preservation
/// threshold survive exactly (a uniform row is preserved wholesale, since
/// all of its leaves are equal); the remaining weight is resampled
/// systematically with the broadcast uniform `rn_sys`, exactly as
/// [`sys_comp`]. The survivors number at most `n_samp` plus boundary
/// round-off.
pub fn comp_sub<C: Comm>(
    row_wts: &[f64],
    dists: &[RowDist],
    n_samp: usize,
    rn_sys: f64,
    comm: &C,
) -> Vec<SubSample> {
    assert_eq!(row_wts.len(), dists.len());

    let mut states: Vec<KeepState> = row_wts.iter().map(|_| KeepState::None).collect();
    let mut local_resid: f64 = row_wts.iter().filter(|&&w| w > 0.0).sum();
    let mut n_kept_glob = 0_usize;

    loop {
        let glob_resid = comm.sum_f64(local_resid);
        if n_kept_glob >= n_samp || glob_resid <= 0.0 {
            break;
        }
        let thresh = glob_resid / (n_samp - n_kept_glob) as f64;

        let mut n_new = 0_u64;
        for ((state, &row_wt), dist) in states.iter_mut().zip(row_wts).zip(dists) {
            if row_wt <= 0.0 || dist.len() == 0 {
                continue;
            }
            match state {
                KeepState::All => {}
                KeepState::None => match dist {
                    RowDist::Uniform(n) => {
                        if row_wt / f64::from(*n) >= thresh {
                            *state = KeepState::All;
                            local_resid -= row_wt;
                            n_new += u64::from(*n);
                        }
                    }
                    RowDist::Weighted(_) => {
                        let mut kept = vec![false; dist.len() as usize];
                        let mut any = false;
                        for (k, flag) in kept.iter_mut().enumerate() {
                            let leaf = dist.leaf(row_wt, u32::try_from(k).unwrap());
                            if leaf >= thresh && leaf > 0.0 {
                                *flag = true;
                                local_resid -= leaf;
                                n_new += 1;
                                any = true;
                            }
                        }
                        if any {
                            *state = KeepState::Partial(kept);
                        }
                    }
                },
                KeepState::Partial(kept) => {
                    let mut all = true;
                    for (k, flag) in kept.iter_mut().enumerate() {
                        let leaf = dist.leaf(row_wt, u32::try_from(k).unwrap());
                        if *flag {
                            continue;
                        }
                        if leaf >= thresh && leaf > 0.0 {
                            *flag = true;
                            local_resid -= leaf;
                            n_new += 1;
                        } else {
                            all = false;
                        }
                    }
                    if all {
                        *state = KeepState::All;
                    }
                }
            }
        }

        let n_new_glob = comm.sum_u64(n_new);
        if n_new_glob == 0 {
            break;
        }
        n_kept_glob += usize::try_from(n_new_glob).unwrap();
    }

    // preserved leaves come out exactly
    let mut out = vec![];
    for (row, (state, dist)) in states.iter().zip(dists).enumerate() {
        let row_wt = row_wts[row];
        if row_wt <= 0.0 {
            continue;
        }
        match state {
            KeepState::None => {}
            KeepState::All => {
                for k in 0..dist.len() {
                    let leaf = dist.leaf(row_wt, k);
                    if leaf > 0.0 {
                        out.push(SubSample {
                            row,
                            sub: k,
                            weight: leaf,
                        });
                    }
                }
            }
            KeepState::Partial(kept) => {
                for (k, &flag) in kept.iter().enumerate() {
                    let k = u32::try_from(k).unwrap();
                    if flag {
                        out.push(SubSample {
                            row,
                            sub: k,
                            weight: dist.leaf(row_wt, k),
                        });
                    }
                }
            }
        }
    }

    // systematic resample of the un-kept leaves, in (row, sub) order
    let n_resamp = n_samp.saturating_sub(n_kept_glob);
    let is_kept = |state: &KeepState, k: u32| match state {
        KeepState::None => false,
        KeepState::All => true,
        KeepState::Partial(kept) => kept[k as usize],
    };

    let local_norm: f64 = izip!(&states, row_wts, dists)
        .filter(|(_, &w, _)| w > 0.0)
        .map(|(state, &w, dist)| {
            (0..dist.len())
                .filter(|&k| !is_kept(state, k))
                .map(|k| dist.leaf(w, k))
                .sum::<f64>()
        })
        .sum();
    let norms = comm.gather_f64(local_norm);
    let glob_norm: f64 = norms.iter().sum();

    if n_resamp == 0 || glob_norm <= 0.0 {
        return out;
    }

    let step = glob_norm / n_resamp as f64;
    let u = rn_sys * step;
    let mut next = seed_sys(&norms, comm.rank(), u, step);
    let mut lbound = 0.0;

    for (row, (state, dist)) in states.iter().zip(dists).enumerate() {
        let row_wt = row_wts[row];
        if row_wt <= 0.0 {
            continue;
        }
        for k in 0..dist.len() {
            if is_kept(state, k) {
                continue;
            }
            let leaf = dist.leaf(row_wt, k);
            if leaf <= 0.0 {
                continue;
            }
            let ubound = lbound + leaf;
            let mut hits = 0_u64;
            while next < ubound {
                hits += 1;
                next += step;
            }
            if hits > 0 {
                out.push(SubSample {
                    row,
                    sub: k,
                    weight: step * hits as f64,
                });
            }
            lbound = ubound;
        }
    }

    out
}
