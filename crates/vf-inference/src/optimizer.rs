//! Minimizer interface consumed by the fit engine.

use nalgebra::DMatrix;
use vf_core::Result;

/// Objective function over the free-parameter vector.
pub trait ObjectiveFunction: Send + Sync {
    /// Evaluate the function at `params`.
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Gradient at `params` (central differences if not overridden).
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let n = params.len();
        let mut grad = vec![0.0; n];
        let mut probe = params.to_vec();
        for i in 0..n {
            let eps = 1e-8 * params[i].abs().max(1.0);
            probe[i] = params[i] + eps;
            let f_plus = self.eval(&probe)?;
            probe[i] = params[i] - eps;
            let f_minus = self.eval(&probe)?;
            probe[i] = params[i];
            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }
        Ok(grad)
    }

    /// Number of function evaluations performed so far.
    fn n_evaluations(&self) -> usize {
        0
    }
}

/// Result of one minimizer step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Parameters after the step (equal to the input when no progress was made).
    pub params: Vec<f64>,
    /// Objective at `params`.
    pub fval: f64,
    /// Projected gradient norm at `params`.
    pub grad_norm: f64,
    /// Estimated distance to minimum, `NaN` while the curvature model is incomplete.
    pub edm: f64,
    /// No acceptable step exists along any tried direction.
    pub stalled: bool,
    /// The gradient at `params` is not finite.
    pub non_finite: bool,
}

/// Opaque iterative minimizer.
///
/// The fit engine owns the iteration loop and the convergence decision; the
/// minimizer only proposes the next point and, on request, a covariance
/// estimate.
pub trait Minimizer {
    /// Advance from `current` by one iteration.
    fn step(&mut self, objective: &dyn ObjectiveFunction, current: &[f64]) -> Result<StepOutcome>;

    /// Forget accumulated curvature so the next step starts afresh from
    /// whatever point it is given.
    fn restart(&mut self) {}

    /// Covariance of the free parameters at `params`, or `None` if the
    /// Hessian cannot be inverted into a positive-definite matrix.
    fn estimate_covariance(
        &self,
        objective: &dyn ObjectiveFunction,
        params: &[f64],
    ) -> Result<Option<DMatrix<f64>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Quadratic;

    impl ObjectiveFunction for Quadratic {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok((p[0] - 1.0).powi(2) + 3.0 * (p[1] + 2.0).powi(2))
        }
    }

    #[test]
    fn test_default_gradient_is_central_difference() {
        let g = Quadratic.gradient(&[0.0, 0.0]).unwrap();
        assert_relative_eq!(g[0], -2.0, epsilon = 1e-6);
        assert_relative_eq!(g[1], 12.0, epsilon = 1e-6);
        assert_eq!(Quadratic.n_evaluations(), 0);
    }
}
