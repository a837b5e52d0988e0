//! The subspace (Arnoldi-like) driver for excited states.
//!
//! `n_trial` iterates evolve side by side under `(I - eps H)`, sharing one
//! index set: the backing [`DistVec`](crate::vector::DistVec) stores
//! `2 * n_trial` value rows, the current half and the next half, and the
//! halves flip by an index swap after every multiplication. Each outer
//! iteration normalises, projects onto the trial vectors (the overlap
//! matrix `D` and the Hamiltonian projection `B`), compresses, multiplies,
//! and periodically restarts by recombining the iterates with coefficients
//! from a generalised eigendecomposition or an inverse of `B`.

use crate::comm::Comm;
use crate::compress::{find_preserve, sys_comp};
use crate::linalg::{gen_eig, invert, invert_upper, qr};
use crate::matel::{off_diag_connections, Integrals};
use crate::vector::DistVec;
use ndarray::Array2;
use rand::Rng;
use serde::Serialize;

/// Normalisation applied to each iterate before projection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum NormTechnique {
    /// Leave the iterates as they are.
    None,
    /// Scale each iterate by its global one-norm.
    OneNorm,
    /// Scale every iterate by the largest of the one-norms.
    MaxOneNorm,
}

/// How the iterates are recombined at a restart.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum RestartTechnique {
    /// Keep the dominant solutions of `B x = lambda D x`.
    Eig,
    /// Recombine with `B^-1`.
    HInv,
    /// QR-factorise `B` and recombine with `R^-1`.
    RInv,
}

/// Parameters of the subspace driver.
#[derive(Clone, Debug, Serialize)]
pub struct ArnoldiParams {
    /// Imaginary-time step of the multiplication.
    pub eps: f64,
    /// Iterations between restarts.
    pub restart_int: u64,
    /// Restart recombination.
    pub restart_technique: RestartTechnique,
    /// Normalisation mode.
    pub norm_technique: NormTechnique,
    /// Compression target per iterate.
    pub target_nonz: usize,
}

/// Per-iteration output: both projection matrices, trial by iterate.
pub struct ArnoldiStats {
    /// Overlap matrix `D`, `d[[t, v]] = <trial_t | iterate_v>`.
    pub overlap: Array2<f64>,
    /// Hamiltonian projection `B`, `b[[t, v]] = <trial_t | next_v>`.
    pub h_overlap: Array2<f64>,
    /// Whether this iteration ended in a restart.
    pub restarted: bool,
}

struct Trial {
    dets: Vec<u8>,
    vals: Vec<f64>,
    hashes: Vec<u64>,
}

/// The subspace driver; see the module docs.
pub struct ArnoldiDriver<'a, C, R> {
    /// The iterate store, `2 * n_trial` value rows.
    pub vec: DistVec<f64>,
    params: ArnoldiParams,
    ints: &'a Integrals,
    symm: &'a [u8],
    n_orb: u8,
    n_trial: usize,
    trials: Vec<Trial>,
    curr_half: usize,
    comm: &'a C,
    rng: R,
    iteration: u64,
}

impl<'a, C: Comm, R: Rng> ArnoldiDriver<'a, C, R> {
    /// Creates the driver over `vec`, whose rows `0..n_trial` must hold the
    /// initial iterates. The trial vectors are given as flat index rows and
    /// values, replicated on every rank.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut vec: DistVec<f64>,
        trial_dets: &[Vec<u8>],
        trial_vals: &[Vec<f64>],
        params: ArnoldiParams,
        ints: &'a Integrals,
        symm: &'a [u8],
        n_orb: u8,
        comm: &'a C,
        rng: R,
    ) -> Self {
        let n_trial = trial_dets.len();
        assert_eq!(trial_vals.len(), n_trial);
        assert_eq!(vec.n_vecs(), 2 * n_trial);

        let trials = trial_dets
            .iter()
            .zip(trial_vals)
            .map(|(dets, vals)| Trial {
                dets: dets.clone(),
                vals: vals.clone(),
                hashes: vec.hashes_for(dets),
            })
            .collect();

        Self {
            vec,
            params,
            ints,
            symm,
            n_orb,
            n_trial,
            trials,
            curr_half: 0,
            comm,
            rng,
            iteration: 0,
        }
    }

    /// Row index of iterate `v` in the current half.
    #[must_use]
    pub fn curr_row(&self, v: usize) -> usize {
        self.curr_half + v
    }

    fn next_row(&self, v: usize) -> usize {
        self.n_trial - self.curr_half + v
    }

    fn global_one_norm(&mut self, row: usize) -> f64 {
        self.vec.set_curr_vec_idx(row);
        self.comm.sum_f64(self.vec.local_one_norm())
    }

    fn projection(&mut self, rows_base: impl Fn(&Self, usize) -> usize) -> Array2<f64> {
        let mut matrix = Array2::zeros((self.n_trial, self.n_trial));
        for v in 0..self.n_trial {
            let row = rows_base(self, v);
            self.vec.set_curr_vec_idx(row);
            for (t, trial) in self.trials.iter().enumerate() {
                let local = self.vec.dot(&trial.dets, &trial.vals, &trial.hashes);
                matrix[[t, v]] = self.comm.sum_f64(local);
            }
        }
        matrix
    }

    /// Runs one outer iteration: normalise, project, compress, multiply,
    /// project against `H`, and restart when due.
    pub fn iterate(&mut self) -> ArnoldiStats {
        let eps = self.params.eps;

        // 1. normalise
        let norms: Vec<f64> = (0..self.n_trial)
            .map(|v| self.global_one_norm(self.curr_row(v)))
            .collect();
        let max_norm = norms.iter().fold(0.0_f64, |acc, &n| acc.max(n));
        for v in 0..self.n_trial {
            let scale = match self.params.norm_technique {
                NormTechnique::None => 1.0,
                NormTechnique::OneNorm => {
                    if norms[v] > 0.0 {
                        1.0 / norms[v]
                    } else {
                        1.0
                    }
                }
                NormTechnique::MaxOneNorm => {
                    if max_norm > 0.0 {
                        1.0 / max_norm
                    } else {
                        1.0
                    }
                }
            };
            if scale != 1.0 {
                let row = self.curr_row(v);
                let positions: Vec<usize> = self.vec.live_positions().collect();
                for pos in positions {
                    *self.vec.value_in_mut(row, pos) *= scale;
                }
            }
        }

        // 2. overlap with the trial vectors
        let overlap = self.projection(Self::curr_row);

        // 3. compress each iterate
        for v in 0..self.n_trial {
            let row = self.curr_row(v);
            self.vec.set_curr_vec_idx(row);
            let positions: Vec<usize> = self.vec.live_positions().collect();
            let mut values: Vec<f64> = positions.iter().map(|&pos| self.vec.value(pos)).collect();
            let mut keep = vec![false; values.len()];
            let (_, n_kept) =
                find_preserve(&values, &mut keep, self.params.target_nonz, self.comm);
            let rn = self.comm.broadcast_f64(self.rng.gen::<f64>());
            sys_comp(
                &mut values,
                &keep,
                self.params.target_nonz - n_kept,
                rn,
                self.comm,
            );
            for (&pos, &value) in positions.iter().zip(&values) {
                *self.vec.value_mut(pos) = value;
            }
        }

        // 4. multiply each iterate into the next half
        for v in 0..self.n_trial {
            let curr = self.curr_row(v);
            let next = self.next_row(v);

            let positions: Vec<usize> = self.vec.live_positions().collect();
            for &pos in &positions {
                *self.vec.value_in_mut(next, pos) = 0.0;
            }

            // off-diagonal application, routed through the adder
            for &pos in &positions {
                let val = self.vec.value_in(curr, pos);
                if val == 0.0 {
                    continue;
                }
                let det = self.vec.index(pos).to_vec();
                let occ = self.vec.occ_orbs(pos).to_vec();
                let mut staged = vec![];
                off_diag_connections(&det, &occ, self.n_orb, self.symm, self.ints, |target, el| {
                    staged.push((target.to_vec(), -eps * el * val));
                });
                for (target, contribution) in staged {
                    self.vec.add(&target, contribution, true, self.comm);
                }
            }
            self.vec.set_curr_vec_idx(next);
            self.vec.perform_add(self.comm);

            // in-place diagonal scaling
            let positions: Vec<usize> = self.vec.live_positions().collect();
            for pos in positions {
                let val = self.vec.value_in(curr, pos);
                if val == 0.0 {
                    continue;
                }
                let ints = self.ints;
                let n_orb = self.n_orb;
                let diag = self.vec.diag_el(pos, |occ| ints.diag_matrel(occ, n_orb));
                *self.vec.value_in_mut(next, pos) += (1.0 - eps * diag) * val;
            }
        }

        // 5. Hamiltonian projection
        let h_overlap = self.projection(Self::next_row);

        // 6. periodic restart
        self.iteration += 1;
        let restarted = if self.iteration % self.params.restart_int == 0 {
            self.restart(&h_overlap, &overlap)
        } else {
            false
        };

        // the next half becomes current
        self.curr_half = self.n_trial - self.curr_half;

        ArnoldiStats {
            overlap,
            h_overlap,
            restarted,
        }
    }

    // recombines the next-half iterates with coefficients from the chosen
    // solve; a numerically singular solve skips the restart
    fn restart(&mut self, b: &Array2<f64>, d: &Array2<f64>) -> bool {
        let coeffs = match self.params.restart_technique {
            RestartTechnique::Eig => match gen_eig(b, d) {
                Some((_, vectors)) => vectors,
                None => return false,
            },
            RestartTechnique::HInv => match invert(b) {
                Some(inv) => inv,
                None => return false,
            },
            RestartTechnique::RInv => {
                let (_, r) = qr(b);
                match invert_upper(&r) {
                    Some(inv) => inv,
                    None => return false,
                }
            }
        };

        let positions: Vec<usize> = self.vec.live_positions().collect();
        let base = self.n_trial - self.curr_half;
        for pos in positions {
            let old: Vec<f64> = (0..self.n_trial)
                .map(|u| self.vec.value_in(base + u, pos))
                .collect();
            for v in 0..self.n_trial {
                let recombined: f64 = (0..self.n_trial)
                    .map(|u| old[u] * coeffs[[u, v]])
                    .sum();
                *self.vec.value_in_mut(base + v, pos) = recombined;
            }
        }
        true
    }
}
