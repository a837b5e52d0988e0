//! Hamiltonian matrix elements from one- and two-electron integrals.
//!
//! The integrals are held in chemists' notation: `eris[[i, j, k, l]]` is
//! `(ij|kl)`, the repulsion between densities `ij` and `kl`. Orbital
//! arguments of the public methods are *active* spatial indices; the
//! frozen-core offset `n_frz / 2` is applied internally before indexing the
//! tensors. All three evaluators return the magnitude-correct element
//! without the permutation sign; callers multiply by the parity computed
//! while toggling the bit string.

use crate::symm::{spatial, spin};
use ndarray::{Array2, Array4};

/// One- and two-electron integral tensors with frozen-core bookkeeping.
#[derive(Clone)]
pub struct Integrals {
    h_core: Array2<f64>,
    eris: Array4<f64>,
    n_frz_spatial: usize,
}

impl Integrals {
    /// Wraps the raw tensors. `n_frz` is the number of frozen electrons and
    /// must be even.
    ///
    /// # Panics
    ///
    /// Panics if `h_core` is not square, if the `eris` axes do not all match
    /// `h_core`, or if `n_frz` is odd.
    #[must_use]
    pub fn new(h_core: Array2<f64>, eris: Array4<f64>, n_frz: u8) -> Self {
        let tot_orb = h_core.nrows();
        assert_eq!(h_core.ncols(), tot_orb, "h_core must be square");
        assert!(
            eris.shape().iter().all(|&extent| extent == tot_orb),
            "eris axes must match h_core"
        );
        assert_eq!(n_frz % 2, 0, "frozen electrons come in pairs");

        Self {
            h_core,
            eris,
            n_frz_spatial: usize::from(n_frz / 2),
        }
    }

    /// Number of active spatial orbitals.
    #[must_use]
    pub fn n_active(&self) -> usize {
        self.h_core.nrows() - self.n_frz_spatial
    }

    /// Two-electron integral `(ij|kl)` over active spatial orbitals.
    #[must_use]
    pub fn eri(&self, i: u8, j: u8, k: u8, l: u8) -> f64 {
        self.eri_act(i, j, k, l)
    }

    /// One-electron integral over active spatial orbitals.
    #[must_use]
    pub fn h(&self, i: u8, j: u8) -> f64 {
        self.h_act(i, j)
    }

    fn h_act(&self, i: u8, j: u8) -> f64 {
        self.h_core[[
            usize::from(i) + self.n_frz_spatial,
            usize::from(j) + self.n_frz_spatial,
        ]]
    }

    fn eri_act(&self, i: u8, j: u8, k: u8, l: u8) -> f64 {
        self.eris[[
            usize::from(i) + self.n_frz_spatial,
            usize::from(j) + self.n_frz_spatial,
            usize::from(k) + self.n_frz_spatial,
            usize::from(l) + self.n_frz_spatial,
        ]]
    }

    // one active and one core index; core indices are raw
    fn eri_core(&self, i: u8, j: u8, k: usize, l: usize) -> f64 {
        self.eris[[
            usize::from(i) + self.n_frz_spatial,
            usize::from(j) + self.n_frz_spatial,
            k,
            l,
        ]]
    }

    fn eri_core_mixed(&self, i: u8, k: usize, l: usize, j: u8) -> f64 {
        self.eris[[
            usize::from(i) + self.n_frz_spatial,
            k,
            l,
            usize::from(j) + self.n_frz_spatial,
        ]]
    }

    /// Unsigned matrix element of the double excitation
    /// `orbs = [i, j, a, b]` (spin-orbitals): `(ia|jb)`, minus the exchange
    /// term `(ib|ja)` when the pair is same-spin.
    #[must_use]
    pub fn doub_matr_el_nosgn(&self, orbs: &[u8; 4], n_orb: u8) -> f64 {
        let [i, j, a, b] = orbs.map(|orb| spatial(orb, n_orb));
        let same_spin = spin(orbs[0], n_orb) == spin(orbs[1], n_orb);

        let mut el = self.eri_act(i, a, j, b);
        if same_spin {
            el -= self.eri_act(i, b, j, a);
        }
        el
    }

    /// Unsigned matrix element of the single excitation `orbs = [i, a]`
    /// (spin-orbitals), summed over the closed-shell core and the other
    /// electrons in `occ`.
    #[must_use]
    pub fn sing_matr_el_nosgn(&self, orbs: &[u8; 2], occ: &[u8], n_orb: u8) -> f64 {
        let i = spatial(orbs[0], n_orb);
        let a = spatial(orbs[1], n_orb);
        let sigma = spin(orbs[0], n_orb);

        let mut el = self.h_act(i, a);

        for k in 0..self.n_frz_spatial {
            el += 2.0 * self.eri_core(i, a, k, k) - self.eri_core_mixed(i, k, k, a);
        }

        for &other in occ {
            if other == orbs[0] {
                continue;
            }
            let j = spatial(other, n_orb);
            el += self.eri_act(i, a, j, j);
            if spin(other, n_orb) == sigma {
                el -= self.eri_act(i, j, j, a);
            }
        }
        el
    }

    /// Diagonal matrix element of the determinant with occupied spin-orbital
    /// list `occ`, relative to the frozen-core energy.
    #[must_use]
    pub fn diag_matrel(&self, occ: &[u8], n_orb: u8) -> f64 {
        let mut el = 0.0;

        for (n, &orb) in occ.iter().enumerate() {
            let i = spatial(orb, n_orb);
            el += self.h_act(i, i);

            for k in 0..self.n_frz_spatial {
                el += 2.0 * self.eri_core(i, i, k, k) - self.eri_core_mixed(i, k, k, i);
            }

            for &other in &occ[n + 1..] {
                let j = spatial(other, n_orb);
                el += self.eri_act(i, i, j, j);
                if spin(other, n_orb) == spin(orb, n_orb) {
                    el -= self.eri_act(i, j, j, i);
                }
            }
        }
        el
    }
}

/// Visits every nonzero off-diagonal Hamiltonian connection of `det`,
/// passing the excited determinant and the signed matrix element. Used to
/// apply the deterministic-subspace product and to build `H` times a trial
/// vector.
pub fn off_diag_connections(
    det: &[u8],
    occ: &[u8],
    n_orb: u8,
    symm: &[u8],
    ints: &Integrals,
    mut visit: impl FnMut(&[u8], f64),
) {
    let mut scratch = det.to_vec();

    let mut singles = vec![];
    crate::symm::sing_ex_symm(det, occ, n_orb, symm, &mut singles);
    for [i, a] in singles {
        scratch.copy_from_slice(det);
        let sign = crate::bitstring::single_parity(&mut scratch, i, a);
        let el = ints.sing_matr_el_nosgn(&[i, a], occ, n_orb) * f64::from(sign);
        if el != 0.0 {
            visit(&scratch, el);
        }
    }

    let mut doubles = vec![];
    crate::symm::doub_ex_symm(det, occ, n_orb, symm, &mut doubles);
    for orbs in doubles {
        scratch.copy_from_slice(det);
        let sign = crate::bitstring::double_parity(&mut scratch, &orbs);
        let el = ints.doub_matr_el_nosgn(&orbs, n_orb) * f64::from(sign);
        if el != 0.0 {
            visit(&scratch, el);
        }
    }
}
