//! Common data types for vecfit

use crate::parameter::ParameterSet;
use serde::{Deserialize, Serialize};

/// Terminal state of a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    /// Convergence criterion met.
    Converged,
    /// Unrecoverable numerical failure (e.g. singular Hessian for covariance).
    Failed,
    /// Iteration cap reached; the best point found is reported.
    MaxIterationsExceeded,
}

impl std::fmt::Display for FitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FitStatus::Converged => "converged",
            FitStatus::Failed => "failed",
            FitStatus::MaxIterationsExceeded => "max-iterations-exceeded",
        };
        f.write_str(s)
    }
}

/// Fit result containing parameter estimates and uncertainties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Snapshot of the full parameter set at the reported point
    pub final_parameters: ParameterSet,

    /// Negative log-likelihood at the reported point
    pub nll: f64,

    /// Convergence flag (`status == Converged`)
    pub converged: bool,

    /// Terminal status
    pub status: FitStatus,

    /// Number of minimizer steps taken
    pub iterations: usize,

    /// Number of objective evaluations
    pub n_evaluations: usize,

    /// Estimated distance to minimum at the final point
    pub edm: f64,

    /// Free-parameter uncertainties (sqrt of covariance diagonal), free order
    pub uncertainties: Vec<f64>,

    /// Covariance matrix over free parameters (row-major, N×N). `None` if not requested or failed.
    pub covariance: Option<Vec<f64>>,

    /// Optional diagnostic for `Failed` outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FitResult {
    /// Value of a named parameter in the final snapshot.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.final_parameters.value(name)
    }

    /// Uncertainty of a named free parameter.
    pub fn uncertainty(&self, name: &str) -> Option<f64> {
        let pos = self.final_parameters.free_names().iter().position(|n| n == name)?;
        self.uncertainties.get(pos).copied()
    }

    /// Get correlation matrix element (i, j). Returns `None` if covariance is unavailable.
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let n = self.uncertainties.len();
        if i >= n || j >= n {
            return None;
        }
        let sigma_i = self.uncertainties[i];
        let sigma_j = self.uncertainties[j];
        if sigma_i <= 0.0 || sigma_j <= 0.0 {
            return None;
        }
        Some(cov[i * n + j] / (sigma_i * sigma_j))
    }
}
