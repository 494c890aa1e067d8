//! Fit engine: drives a [`Minimizer`] over a [`LikelihoodObjective`].

use crate::covariance::edm_from_covariance;
use crate::lbfgs::LbfgsbMinimizer;
use crate::objective::LikelihoodObjective;
use crate::optimizer::{Minimizer, ObjectiveFunction};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use vf_compute::EvaluationBackend;
use vf_core::{Error, FitResult, FitStatus, ParameterSet, Result};
use vf_model::{Dataset, DensityNode};

/// Minimizer restarts allowed when a convergence claim does not survive the
/// finite-difference Hessian.
pub const MAX_RESTARTS: usize = 3;

/// Fit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FitConfig {
    /// Iteration cap; the only way a fit is cut short.
    pub max_iterations: usize,
    /// Convergence when the estimated distance to minimum drops below this.
    pub edm_tolerance: f64,
    /// Convergence when the projected gradient norm drops below
    /// `grad_tolerance * sqrt(max(|nll|, 1))`.
    pub grad_tolerance: f64,
    /// Convergence when the relative objective change between steps drops below this.
    pub ftol: f64,
    /// Correction pairs kept by the L-BFGS-B minimizer.
    pub history: usize,
    /// Estimate the covariance matrix after convergence.
    pub compute_covariance: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            edm_tolerance: 1e-3,
            grad_tolerance: 1e-6,
            ftol: 1e-12,
            history: 10,
            compute_covariance: true,
        }
    }
}

/// Lifecycle of one fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitState {
    /// Start values loaded and clamped.
    Initialized,
    /// Minimizer steps in progress.
    Running,
    /// Convergence criterion met.
    Converged,
    /// Unrecoverable numerical failure.
    Failed,
    /// Iteration cap reached.
    MaxIterationsExceeded,
}

impl FitState {
    fn can_transition_to(self, next: FitState) -> bool {
        matches!(
            (self, next),
            (FitState::Initialized, FitState::Running)
                | (
                    FitState::Running,
                    FitState::Converged | FitState::Failed | FitState::MaxIterationsExceeded
                )
        )
    }

    fn status(self) -> Option<FitStatus> {
        match self {
            FitState::Converged => Some(FitStatus::Converged),
            FitState::Failed => Some(FitStatus::Failed),
            FitState::MaxIterationsExceeded => Some(FitStatus::MaxIterationsExceeded),
            FitState::Initialized | FitState::Running => None,
        }
    }
}

/// Drives one fit at a time through `Initialized → Running → terminal`.
#[derive(Debug, Clone)]
pub struct FitEngine {
    config: FitConfig,
    state: FitState,
}

impl Default for FitEngine {
    fn default() -> Self {
        Self::new(FitConfig::default())
    }
}

impl FitEngine {
    /// Engine in the `Initialized` state.
    pub fn new(config: FitConfig) -> Self {
        Self { config, state: FitState::Initialized }
    }

    /// Configuration in use.
    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> FitState {
        self.state
    }

    /// Return to `Initialized` for another fit.
    pub fn reset(&mut self) {
        self.state = FitState::Initialized;
    }

    fn transition(&mut self, next: FitState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "fit engine cannot move from {:?} to {next:?}",
                self.state
            )));
        }
        log::trace!("fit engine: {:?} -> {next:?}", self.state);
        self.state = next;
        Ok(())
    }

    /// Fit `root` to `data` with `backend`, starting from (and writing the
    /// result back into) `params`.
    pub fn fit(
        &mut self,
        backend: &dyn EvaluationBackend,
        root: &DensityNode,
        data: &Dataset,
        params: &mut ParameterSet,
    ) -> Result<FitResult> {
        let plan = root.plan();
        let objective = LikelihoodObjective::new(backend, &plan, data, params)?;
        let mut minimizer = LbfgsbMinimizer::new(params.free_bounds(), self.config.history);
        log::info!(
            "{}: fitting '{}' ({} free parameters, {} events)",
            backend.name(),
            root.name(),
            params.n_free(),
            data.n_rows()
        );
        let result = self.minimize(&objective, &mut minimizer, params)?;
        let (hits, misses) = objective.cache_stats();
        log::debug!("{}: normalization cache hits={hits} misses={misses}", backend.name());
        log::info!(
            "{}: {} after {} iterations, nll={:.6}, edm={:.3e}",
            backend.name(),
            result.status,
            result.iterations,
            result.nll,
            result.edm
        );
        Ok(result)
    }

    /// Minimize `objective` over the free parameters of `params`.
    ///
    /// A step that meets a convergence criterion is only accepted once the
    /// distance to minimum recomputed from the finite-difference Hessian is
    /// within `edm_tolerance`. Otherwise the minimizer is restarted from the
    /// current point, at most [`MAX_RESTARTS`] times. `params` is updated in
    /// place with the reported point.
    pub fn minimize(
        &mut self,
        objective: &dyn ObjectiveFunction,
        minimizer: &mut dyn Minimizer,
        params: &mut ParameterSet,
    ) -> Result<FitResult> {
        self.transition(FitState::Running)?;
        let cfg = self.config.clone();
        let bounds = params.free_bounds();

        let mut x = params.free_values();
        let mut fval = objective.eval(&x)?;
        let mut edm = f64::NAN;
        let mut iterations = 0;
        let mut restarts = 0;
        let mut message = None;
        let mut covariance_matrix = None;

        let terminal = if x.is_empty() {
            edm = 0.0;
            FitState::Converged
        } else {
            loop {
                if iterations >= cfg.max_iterations {
                    message = Some(format!("reached {} iterations", cfg.max_iterations));
                    break FitState::MaxIterationsExceeded;
                }
                let out = minimizer.step(objective, &x)?;
                iterations += 1;

                if out.non_finite {
                    message = Some("gradient is not finite".to_string());
                    if out.fval <= fval {
                        x = out.params;
                        fval = out.fval;
                    }
                    break FitState::Failed;
                }

                let prev = fval;
                x = out.params;
                fval = out.fval;
                edm = out.edm;

                let close = edm.is_nan() || edm <= 10.0 * cfg.edm_tolerance;
                let grad_small =
                    out.grad_norm <= cfg.grad_tolerance * fval.abs().max(1.0).sqrt();
                let rel_change = (prev - fval).abs() / prev.abs().max(fval.abs()).max(1.0);
                let candidate = if out.stalled {
                    grad_small || edm <= 100.0 * cfg.edm_tolerance
                } else {
                    edm <= cfg.edm_tolerance || grad_small || (rel_change < cfg.ftol && close)
                };

                if candidate {
                    match measured_edm(objective, &*minimizer, &x, &bounds)? {
                        Some((measured, cov)) if measured <= cfg.edm_tolerance => {
                            edm = measured;
                            covariance_matrix = Some(cov);
                            break FitState::Converged;
                        }
                        Some((measured, _)) => {
                            log::debug!(
                                "iteration {iterations}: minimizer edm {edm:.3e}, Hessian edm {measured:.3e}"
                            );
                            edm = measured;
                        }
                        None if grad_small || restarts == MAX_RESTARTS => {
                            log::warn!("covariance: Hessian is not positive definite");
                            message =
                                Some("Hessian is singular or not positive definite".to_string());
                            break FitState::Failed;
                        }
                        None => log::debug!(
                            "iteration {iterations}: Hessian not positive definite away from a stationary point"
                        ),
                    }
                } else if !out.stalled {
                    log::trace!("iteration {iterations}: nll={fval:.9} edm={edm:.3e}");
                    continue;
                }

                if restarts == MAX_RESTARTS {
                    message = Some(if out.stalled && !candidate {
                        format!("no descent step found (edm={edm:.3e})")
                    } else {
                        format!("edm {edm:.3e} above tolerance after {restarts} restarts")
                    });
                    break FitState::Failed;
                }
                restarts += 1;
                log::debug!("restarting minimizer at iteration {iterations} (restart {restarts})");
                minimizer.restart();
            }
        };

        params.set_free_values(&x)?;
        let n_free = x.len();
        let mut uncertainties = vec![0.0; n_free];
        let mut covariance = None;
        if terminal == FitState::Converged
            && cfg.compute_covariance
            && let Some(cov) = covariance_matrix
        {
            uncertainties = (0..n_free).map(|i| cov[(i, i)].sqrt()).collect();
            // nalgebra is column-major; the covariance is symmetric either way.
            covariance = Some(cov.transpose().as_slice().to_vec());
        }

        self.transition(terminal)?;
        let status = terminal.status().unwrap_or(FitStatus::Failed);
        Ok(FitResult {
            final_parameters: params.clone(),
            nll: fval,
            converged: status == FitStatus::Converged,
            status,
            iterations,
            n_evaluations: objective.n_evaluations(),
            edm,
            uncertainties,
            covariance,
            message,
        })
    }
}

/// Distance to minimum at `x` recomputed from the minimizer's covariance
/// estimate, together with that covariance. `None` when the Hessian cannot
/// be inverted.
fn measured_edm(
    objective: &dyn ObjectiveFunction,
    minimizer: &dyn Minimizer,
    x: &[f64],
    bounds: &[(f64, f64)],
) -> Result<Option<(f64, DMatrix<f64>)>> {
    let Some(cov) = minimizer.estimate_covariance(objective, x)? else {
        return Ok(None);
    };
    let grad = objective.gradient(x)?;
    Ok(Some((edm_from_covariance(&cov, x, &grad, bounds), cov)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::StepOutcome;
    use approx::assert_relative_eq;
    use vf_core::Parameter;

    struct Bowl;

    impl ObjectiveFunction for Bowl {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok(2.0 * (p[0] - 1.0).powi(2) + 0.5 * (p[1] - 2.0).powi(2) + 10.0)
        }

        fn gradient(&self, p: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![4.0 * (p[0] - 1.0), 1.0 * (p[1] - 2.0)])
        }
    }

    fn two_params() -> ParameterSet {
        let mut params = ParameterSet::new();
        params.insert(Parameter::free("a", 4.0, (-5.0, 5.0)).unwrap()).unwrap();
        params.insert(Parameter::free("b", -3.0, (-5.0, 5.0)).unwrap()).unwrap();
        params
    }

    #[test]
    fn test_converges_with_covariance() {
        let mut params = two_params();
        let mut engine = FitEngine::default();
        let mut minimizer = LbfgsbMinimizer::new(params.free_bounds(), 10);
        let result = engine.minimize(&Bowl, &mut minimizer, &mut params).unwrap();

        assert_eq!(engine.state(), FitState::Converged);
        assert!(result.converged);
        assert_relative_eq!(result.value("a").unwrap(), 1.0, epsilon = 5e-2);
        assert_relative_eq!(result.value("b").unwrap(), 2.0, epsilon = 1e-1);
        assert_relative_eq!(params.value("a").unwrap(), result.value("a").unwrap());
        // Inverse Hessian diagonal: 1/4 and 1.
        assert_relative_eq!(result.uncertainty("a").unwrap(), 0.5, max_relative = 1e-3);
        assert_relative_eq!(result.uncertainty("b").unwrap(), 1.0, max_relative = 1e-3);
        assert_eq!(result.covariance.as_ref().map(Vec::len), Some(4));
        assert!(result.edm <= engine.config().edm_tolerance);
    }

    #[test]
    fn test_second_fit_without_reset_is_invalid_state() {
        let mut params = two_params();
        let mut engine = FitEngine::default();
        let mut minimizer = LbfgsbMinimizer::new(params.free_bounds(), 10);
        engine.minimize(&Bowl, &mut minimizer, &mut params).unwrap();

        let err = engine.minimize(&Bowl, &mut minimizer, &mut params).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)), "{err}");

        engine.reset();
        assert_eq!(engine.state(), FitState::Initialized);
        assert!(engine.minimize(&Bowl, &mut minimizer, &mut params).is_ok());
    }

    #[test]
    fn test_iteration_cap() {
        let mut params = two_params();
        let config = FitConfig { max_iterations: 1, compute_covariance: false, ..Default::default() };
        let mut engine = FitEngine::new(config);
        let mut minimizer = LbfgsbMinimizer::new(params.free_bounds(), 10);
        let result = engine.minimize(&Bowl, &mut minimizer, &mut params).unwrap();

        assert_eq!(result.status, FitStatus::MaxIterationsExceeded);
        assert!(!result.converged);
        assert_eq!(result.iterations, 1);
        // The best point found so far is reported.
        assert!(result.nll < Bowl.eval(&[4.0, -3.0]).unwrap());
    }

    /// Minimizer that stays put and never produces a covariance.
    struct FlatCovariance;

    impl Minimizer for FlatCovariance {
        fn step(&mut self, _: &dyn ObjectiveFunction, current: &[f64]) -> Result<StepOutcome> {
            Ok(StepOutcome {
                params: current.to_vec(),
                fval: 10.0,
                grad_norm: 0.0,
                edm: 0.0,
                stalled: false,
                non_finite: false,
            })
        }

        fn estimate_covariance(
            &self,
            _: &dyn ObjectiveFunction,
            _: &[f64],
        ) -> Result<Option<DMatrix<f64>>> {
            Ok(None)
        }
    }

    #[test]
    fn test_singular_covariance_reports_failed() {
        let mut params = two_params();
        let mut engine = FitEngine::default();
        let result = engine.minimize(&Bowl, &mut FlatCovariance, &mut params).unwrap();
        assert_eq!(engine.state(), FitState::Failed);
        assert_eq!(result.status, FitStatus::Failed);
        assert!(!result.converged);
        assert!(result.message.is_some());
        assert!(result.covariance.is_none());
    }

    /// Flat along `a + b = 3`: the Hessian has rank one.
    struct Valley;

    impl ObjectiveFunction for Valley {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok((p[0] + p[1] - 3.0).powi(2) + 10.0)
        }

        fn gradient(&self, p: &[f64]) -> Result<Vec<f64>> {
            let r = 2.0 * (p[0] + p[1] - 3.0);
            Ok(vec![r, r])
        }
    }

    #[test]
    fn test_degenerate_minimum_fails() {
        let mut params = two_params();
        let mut engine = FitEngine::default();
        let mut minimizer = LbfgsbMinimizer::new(params.free_bounds(), 10);
        let result = engine.minimize(&Valley, &mut minimizer, &mut params).unwrap();

        assert_eq!(result.status, FitStatus::Failed);
        assert!(!result.converged);
        assert!(result.covariance.is_none());
        assert!(result.uncertainties.iter().all(|&s| s == 0.0));
        let message = result.message.unwrap_or_default();
        assert!(message.contains("singular"), "{message}");
    }

    /// Minimizer that claims convergence wherever it is.
    #[derive(Default)]
    struct Overconfident {
        restarts: usize,
    }

    impl Minimizer for Overconfident {
        fn step(&mut self, objective: &dyn ObjectiveFunction, current: &[f64]) -> Result<StepOutcome> {
            Ok(StepOutcome {
                params: current.to_vec(),
                fval: objective.eval(current)?,
                grad_norm: 1.0,
                edm: 0.0,
                stalled: false,
                non_finite: false,
            })
        }

        fn restart(&mut self) {
            self.restarts += 1;
        }

        fn estimate_covariance(
            &self,
            _: &dyn ObjectiveFunction,
            params: &[f64],
        ) -> Result<Option<DMatrix<f64>>> {
            Ok(Some(DMatrix::identity(params.len(), params.len())))
        }
    }

    #[test]
    fn test_premature_convergence_claim_is_rejected() {
        let mut params = two_params();
        let mut engine = FitEngine::default();
        let mut minimizer = Overconfident::default();
        let result = engine.minimize(&Bowl, &mut minimizer, &mut params).unwrap();

        // Gradient (12, -5) at the start: ½ (144 + 25) with unit covariance.
        assert_eq!(result.status, FitStatus::Failed);
        assert_eq!(minimizer.restarts, MAX_RESTARTS);
        assert_eq!(result.iterations, MAX_RESTARTS + 1);
        assert_relative_eq!(result.edm, 84.5, max_relative = 1e-12);
        assert!(result.message.unwrap_or_default().contains("above tolerance"));
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let cfg: FitConfig = serde_json::from_str(r#"{"max_iterations": 50}"#).unwrap();
        assert_eq!(cfg.max_iterations, 50);
        assert_eq!(cfg.history, 10);
        assert!(serde_json::from_str::<FitConfig>(r#"{"max_iter": 5}"#).is_err());
    }
}
