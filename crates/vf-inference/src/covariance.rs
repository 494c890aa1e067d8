//! Hessian estimation and inversion.

use crate::optimizer::ObjectiveFunction;
use nalgebra::{DMatrix, DVector};
use vf_core::Result;

/// Hessian from forward differences of the gradient, symmetrized.
///
/// H_ij ≈ (g_i(x + ε e_j) − g_i(x)) / ε, stepping backwards when `x + ε`
/// would leave `bounds`.
pub fn compute_hessian(
    objective: &dyn ObjectiveFunction,
    params: &[f64],
    bounds: &[(f64, f64)],
) -> Result<DMatrix<f64>> {
    let n = params.len();
    let grad_center = objective.gradient(params)?;
    let mut hessian = DMatrix::zeros(n, n);

    let mut probe = params.to_vec();
    for j in 0..n {
        let mut eps = 1e-4 * params[j].abs().max(1.0);
        if let Some(&(_, hi)) = bounds.get(j)
            && params[j] + eps > hi
        {
            eps = -eps;
        }
        probe[j] = params[j] + eps;
        let grad_shift = objective.gradient(&probe)?;
        probe[j] = params[j];
        for i in 0..n {
            hessian[(i, j)] = (grad_shift[i] - grad_center[i]) / eps;
        }
    }

    let ht = hessian.transpose();
    Ok((&hessian + &ht) * 0.5)
}

/// Second derivative of `objective` along each coordinate, from three
/// function values spaced `1e-4 * max(|x|, 1)` apart.
///
/// The stencil is centred on `params` unless a bound is in the way, in which
/// case it is shifted inward. Coordinates whose range is too narrow for the
/// stencil report `NaN`. `fval` is the objective at `params`.
pub fn diagonal_curvature(
    objective: &dyn ObjectiveFunction,
    params: &[f64],
    fval: f64,
    bounds: &[(f64, f64)],
) -> Result<Vec<f64>> {
    let mut probe = params.to_vec();
    let mut curvature = Vec::with_capacity(params.len());
    for (i, &x) in params.iter().enumerate() {
        let h = 1e-4 * x.abs().max(1.0);
        let (lo, hi) = bounds.get(i).copied().unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
        if hi - lo < 2.0 * h {
            curvature.push(f64::NAN);
            continue;
        }
        let mid = if x - h < lo {
            x + h
        } else if x + h > hi {
            x - h
        } else {
            x
        };
        let mut at = |v: f64| -> Result<f64> {
            if v == x {
                return Ok(fval);
            }
            probe[i] = v;
            let f = objective.eval(&probe);
            probe[i] = x;
            f
        };
        let (f_lo, f_mid, f_hi) = (at(mid - h)?, at(mid)?, at(mid + h)?);
        curvature.push((f_lo - 2.0 * f_mid + f_hi) / (h * h));
    }
    Ok(curvature)
}

/// Smallest eigenvalue of the unit-diagonal Hessian accepted, relative to its largest.
const MIN_RELATIVE_EIGENVALUE: f64 = 1e-10;

/// Invert a Hessian into a covariance matrix.
///
/// The Hessian is first rescaled to unit diagonal so that the positivity test
/// does not depend on parameter units. Returns `None` when the matrix is not
/// finite, has a non-positive diagonal entry, or is singular or indefinite
/// (smallest eigenvalue below `MIN_RELATIVE_EIGENVALUE` times the largest).
/// No regularization is applied: a covariance is either the inverse of the
/// measured curvature or absent.
pub fn invert_hessian(hessian: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = hessian.nrows();
    if n == 0 {
        return Some(DMatrix::zeros(0, 0));
    }
    if hessian.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let diag = hessian.diagonal();
    if diag.iter().any(|&d| d <= 0.0) {
        log::debug!("covariance: non-positive Hessian diagonal {:?}", diag.as_slice());
        return None;
    }
    let inv_sqrt = diag.map(|d| 1.0 / d.sqrt());
    let unit = DMatrix::from_fn(n, n, |i, j| hessian[(i, j)] * inv_sqrt[i] * inv_sqrt[j]);

    let eigen = unit.symmetric_eigen();
    let (lambda_min, lambda_max) = (eigen.eigenvalues.min(), eigen.eigenvalues.max());
    if !(lambda_min > MIN_RELATIVE_EIGENVALUE * lambda_max) {
        log::debug!("covariance: Hessian eigenvalues span [{lambda_min:.3e}, {lambda_max:.3e}]");
        return None;
    }
    let inv_lambda = DMatrix::from_diagonal(&eigen.eigenvalues.map(|l| 1.0 / l));
    let unit_inv = &eigen.eigenvectors * inv_lambda * eigen.eigenvectors.transpose();
    let cov = DMatrix::from_fn(n, n, |i, j| unit_inv[(i, j)] * inv_sqrt[i] * inv_sqrt[j]);

    if (0..n).any(|i| !(cov[(i, i)].is_finite() && cov[(i, i)] > 0.0)) {
        return None;
    }
    Some(cov)
}

/// Estimated distance to minimum `½ gᵀ C g` for a covariance `C`, with
/// gradient components that push against an active bound left out.
pub fn edm_from_covariance(
    cov: &DMatrix<f64>,
    params: &[f64],
    grad: &[f64],
    bounds: &[(f64, f64)],
) -> f64 {
    let g = DVector::from_iterator(
        grad.len(),
        grad.iter().enumerate().map(|(i, &gi)| match bounds.get(i) {
            Some(&(lo, _)) if params[i] <= lo && gi > 0.0 => 0.0,
            Some(&(_, hi)) if params[i] >= hi && gi < 0.0 => 0.0,
            _ => gi,
        }),
    );
    0.5 * g.dot(&(cov * &g))
}
