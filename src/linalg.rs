//! Small dense linear algebra used by the per-gene fits
//!
//! Every system solved here is a p × p normal-equations matrix with p equal
//! to the number of design coefficients, so plain Cholesky on `Array2<f64>`
//! is all that is needed.

use ndarray::Array2;

/// Pivot substituted for non-positive pivots by [`solve_spd_stabilized`]
const PIVOT_FLOOR: f64 = 1e-12;

/// Computes `X' diag(w) X`
pub fn weighted_gram(x: &Array2<f64>, w: &[f64]) -> Array2<f64> {
    let p = x.ncols();
    let mut out = Array2::<f64>::zeros((p, p));
    for (i, &wi) in w.iter().enumerate().take(x.nrows()) {
        for j in 0..p {
            let xij = x[[i, j]];
            if xij == 0.0 {
                continue;
            }
            for k in j..p {
                out[[j, k]] += wi * xij * x[[i, k]];
            }
        }
    }
    for j in 0..p {
        for k in 0..j {
            out[[j, k]] = out[[k, j]];
        }
    }
    out
}

/// Computes `X' diag(w) z`
pub fn weighted_cross(x: &Array2<f64>, w: &[f64], z: &[f64]) -> Vec<f64> {
    let p = x.ncols();
    let mut out = vec![0.0; p];
    for i in 0..x.nrows() {
        let wz = w[i] * z[i];
        for (j, o) in out.iter_mut().enumerate() {
            *o += x[[i, j]] * wz;
        }
    }
    out
}

/// Adds `lambda` to every diagonal entry in place
pub fn add_ridge(a: &mut Array2<f64>, lambda: f64) {
    for j in 0..a.nrows().min(a.ncols()) {
        a[[j, j]] += lambda;
    }
}

/// Lower-triangular Cholesky factor.
///
/// With `stabilize` set, non-positive pivots are replaced by a tiny positive
/// value instead of failing.
fn cholesky_factor(a: &Array2<f64>, stabilize: bool) -> Option<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return None;
    }
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 || sum.is_nan() {
                    if stabilize && !sum.is_nan() {
                        sum = PIVOT_FLOOR;
                    } else {
                        return None;
                    }
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

pub fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    cholesky_factor(a, false)
}

fn solve_with_factor(l: &Array2<f64>, b: &[f64]) -> Vec<f64> {
    let n = l.nrows();
    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[[i, j]] * y[j];
        }
        y[i] = sum / l[[i, i]];
    }
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for j in (i + 1)..n {
            sum -= l[[j, i]] * x[j];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Solves `A x = b` for symmetric positive definite `A`.
/// Returns `None` when `A` is not positive definite.
pub fn solve_spd(a: &Array2<f64>, b: &[f64]) -> Option<Vec<f64>> {
    if b.len() != a.nrows() {
        return None;
    }
    cholesky(a).map(|l| solve_with_factor(&l, b))
}

/// Solves `A x = b`, flooring non-positive pivots so a solution is always
/// produced. Used inside IRLS where the ridge keeps `A` well conditioned.
pub fn solve_spd_stabilized(a: &Array2<f64>, b: &[f64]) -> Vec<f64> {
    match cholesky_factor(a, true) {
        Some(l) => solve_with_factor(&l, b),
        None => vec![f64::NAN; b.len()],
    }
}

/// Inverse of a symmetric positive definite matrix
pub fn invert_spd(a: &Array2<f64>) -> Option<Array2<f64>> {
    let l = cholesky(a)?;
    let n = a.nrows();
    let mut inv = Array2::<f64>::zeros((n, n));
    let mut e = vec![0.0; n];
    for i in 0..n {
        e.iter_mut().for_each(|v| *v = 0.0);
        e[i] = 1.0;
        let col = solve_with_factor(&l, &e);
        for (j, v) in col.into_iter().enumerate() {
            inv[[j, i]] = v;
        }
    }
    Some(inv)
}

/// `ln det(A)` for symmetric positive definite `A`
pub fn log_det_spd(a: &Array2<f64>) -> Option<f64> {
    let l = cholesky(a)?;
    Some((0..l.nrows()).map(|i| 2.0 * l[[i, i]].ln()).sum())
}

/// Trace of the product `A B` of two square matrices
pub fn trace_of_product(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    let n = a.nrows();
    let mut tr = 0.0;
    for i in 0..n {
        for k in 0..n {
            tr += a[[i, k]] * b[[k, i]];
        }
    }
    tr
}

/// Computes `A B A` for square `A`, `B` (sandwich covariance)
pub fn sandwich(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    a.dot(b).dot(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_weighted_gram_matches_explicit_product() {
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 1.0]];
        let w = [2.0, 1.0, 3.0];
        let g = weighted_gram(&x, &w);
        assert_eq!(g, array![[6.0, 4.0], [4.0, 4.0]]);
        assert_eq!(weighted_cross(&x, &w, &[1.0, 2.0, 3.0]), vec![13.0, 11.0]);
    }

    #[test]
    fn test_solve_spd() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let x = solve_spd(&a, &[2.0, 1.0]).unwrap();
        assert!((4.0 * x[0] + 2.0 * x[1] - 2.0).abs() < 1e-12);
        assert!((2.0 * x[0] + 3.0 * x[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_singular_matrix_is_rejected_but_stabilized_solve_is_finite() {
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        assert!(solve_spd(&a, &[1.0, 1.0]).is_none());
        assert!(log_det_spd(&a).is_none());
        let x = solve_spd_stabilized(&a, &[1.0, 1.0]);
        assert!(x.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_inverse_and_log_det() {
        let a = array![[2.0, 0.5], [0.5, 1.0]];
        let inv = invert_spd(&a).unwrap();
        let id = a.dot(&inv);
        assert!((id[[0, 0]] - 1.0).abs() < 1e-12);
        assert!(id[[0, 1]].abs() < 1e-12);
        let ld = log_det_spd(&a).unwrap();
        assert!((ld - (2.0f64 - 0.25).ln()).abs() < 1e-12);
        assert!((trace_of_product(&a, &inv) - 2.0).abs() < 1e-12);
    }
}
