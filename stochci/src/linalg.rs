//! Small dense factorizations for the subspace-restart solves.
//!
//! The subspace driver periodically recombines its `k` iterates, with `k`
//! the number of trial vectors, by solving a `k x k` generalised
//! eigenproblem or inverting a `k x k` projection matrix. At that size a
//! partial-pivot LU, a Householder QR, and an unshifted QR eigen-iteration
//! cover everything; no general-purpose solver enters the crate.

use ndarray::{Array1, Array2};

/// Solves `a * x = rhs` by Gaussian elimination with partial pivoting.
/// Returns `None` when `a` is numerically singular.
#[must_use]
pub fn lu_solve(a: &Array2<f64>, rhs: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    assert_eq!(a.ncols(), n);
    assert_eq!(rhs.len(), n);

    let mut work = a.clone();
    let mut x = rhs.clone();

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&p, &q| {
                work[[p, col]]
                    .abs()
                    .partial_cmp(&work[[q, col]].abs())
                    .unwrap()
            })
            .unwrap();
        if work[[pivot, col]].abs() < f64::EPSILON * n as f64 {
            return None;
        }
        if pivot != col {
            for j in 0..n {
                work.swap([pivot, j], [col, j]);
            }
            x.swap(pivot, col);
        }

        for row in col + 1..n {
            let factor = work[[row, col]] / work[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for j in col..n {
                work[[row, j]] -= factor * work[[col, j]];
            }
            x[row] -= factor * x[col];
        }
    }

    for col in (0..n).rev() {
        x[col] /= work[[col, col]];
        for row in 0..col {
            x[row] -= work[[row, col]] * x[col];
        }
    }
    Some(x)
}

/// Inverse of `a` by column-wise [`lu_solve`]; `None` when singular.
#[must_use]
pub fn invert(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut inv = Array2::zeros((n, n));
    for col in 0..n {
        let mut unit = Array1::zeros(n);
        unit[col] = 1.0;
        let x = lu_solve(a, &unit)?;
        inv.column_mut(col).assign(&x);
    }
    Some(inv)
}

/// Householder QR decomposition `a = q * r` with `q` orthogonal and `r`
/// upper triangular.
#[must_use]
pub fn qr(a: &Array2<f64>) -> (Array2<f64>, Array2<f64>) {
    let n = a.nrows();
    assert_eq!(a.ncols(), n);

    let mut r = a.clone();
    let mut q = Array2::eye(n);

    for col in 0..n.saturating_sub(1) {
        let norm: f64 = (col..n).map(|row| r[[row, col]].powi(2)).sum::<f64>().sqrt();
        if norm == 0.0 {
            continue;
        }

        let mut v: Vec<f64> = (col..n).map(|row| r[[row, col]]).collect();
        v[0] += v[0].signum() * norm;
        let v_norm_sq: f64 = v.iter().map(|&x| x * x).sum();
        if v_norm_sq == 0.0 {
            continue;
        }

        // r <- (I - 2 v v^T / |v|^2) r, restricted to the trailing block
        for j in 0..n {
            let dot: f64 = v
                .iter()
                .enumerate()
                .map(|(k, &vk)| vk * r[[col + k, j]])
                .sum();
            let scale = 2.0 * dot / v_norm_sq;
            for (k, &vk) in v.iter().enumerate() {
                r[[col + k, j]] -= scale * vk;
            }
        }
        // accumulate q <- q (I - 2 v v^T / |v|^2)
        for i in 0..n {
            let dot: f64 = v
                .iter()
                .enumerate()
                .map(|(k, &vk)| vk * q[[i, col + k]])
                .sum();
            let scale = 2.0 * dot / v_norm_sq;
            for (k, &vk) in v.iter().enumerate() {
                q[[i, col + k]] -= scale * vk;
            }
        }
    }

    (q, r)
}

/// Inverse of the upper-triangular `r` by back substitution; `None` when a
/// diagonal entry vanishes.
#[must_use]
pub fn invert_upper(r: &Array2<f64>) -> Option<Array2<f64>> {
    let n = r.nrows();
    let mut inv = Array2::zeros((n, n));

    for col in (0..n).rev() {
        if r[[col, col]].abs() < f64::EPSILON * n as f64 {
            return None;
        }
        inv[[col, col]] = 1.0 / r[[col, col]];
        for row in (0..col).rev() {
            let mut sum = 0.0;
            for k in row + 1..=col {
                sum += r[[row, k]] * inv[[k, col]];
            }
            inv[[row, col]] = -sum / r[[row, row]];
        }
    }
    Some(inv)
}

/// Solves the generalised eigenproblem `b * x = lambda * d * x` for real
/// eigenvalues, returning them in descending order with the matching
/// eigenvector columns.
///
/// `d` is inverted, and the unshifted QR iteration reduces `d^-1 b`; the
/// eigenvectors come from inverse iteration. Returns `None` when `d` is
/// singular or an eigenvector fails to converge; complex pairs are not
/// handled, which suffices for the near-symmetric projections the subspace
/// driver produces.
#[must_use]
pub fn gen_eig(b: &Array2<f64>, d: &Array2<f64>) -> Option<(Vec<f64>, Array2<f64>)> {
    let n = b.nrows();
    let m = invert(d)?.dot(b);

    // eigenvalues by unshifted QR iteration, run until the subdiagonal
    // part stops mattering
    let mut iter = m.clone();
    for _ in 0..20_000 {
        let (q, r) = qr(&iter);
        iter = r.dot(&q);

        let scale = (0..n).map(|i| iter[[i, i]].abs()).fold(1e-300, f64::max);
        let below = (0..n)
            .flat_map(|i| (0..i).map(move |j| (i, j)))
            .map(|(i, j)| iter[[i, j]].abs())
            .fold(0.0, f64::max);
        if below <= 1e-14 * scale {
            break;
        }
    }
    let mut eigenvalues: Vec<f64> = (0..n).map(|i| iter[[i, i]]).collect();
    eigenvalues.sort_by(|x, y| y.partial_cmp(x).unwrap());

    // eigenvectors by inverse iteration on the shifted matrix
    let mut vectors = Array2::zeros((n, n));
    for (col, &lambda) in eigenvalues.iter().enumerate() {
        let shift = lambda + 1e-10 * lambda.abs().max(1.0);
        let mut shifted = m.clone();
        for i in 0..n {
            shifted[[i, i]] -= shift;
        }

        let mut x = Array1::from_elem(n, 1.0 / (n as f64).sqrt());
        for _ in 0..50 {
            let solved = lu_solve(&shifted, &x)?;
            let norm = solved.dot(&solved).sqrt();
            if norm == 0.0 {
                return None;
            }
            x = solved / norm;
        }
        vectors.column_mut(col).assign(&x);
    }

    Some((eigenvalues, vectors))
}
