//! Univariate density leaves.

mod exponential;
mod gamma;
mod gaussian;
mod polynomial;

pub use exponential::ExponentialPdf;
pub use gamma::GammaPdf;
pub use gaussian::GaussianPdf;
pub use polynomial::PolynomialPdf;

use serde::{Deserialize, Serialize};

/// Closed set of leaf kinds.
///
/// Backends that cannot call through a trait object (the GPU kernel) dispatch
/// on this tag instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfKind {
    /// `exp(-0.5 ((x - mean) / sigma)^2)`
    Gaussian,
    /// `exp(-rate * x)`
    Exponential,
    /// `1 + sum_i a_i x^i`
    Polynomial,
    /// `(x - mu)^(gamma - 1) exp(-(x - mu) / beta)`
    Gamma,
}

/// Unnormalized density over one bounded observable.
///
/// Implementations define the *shape* only; normalization over the observable
/// range happens in [`crate::normalize`], either through
/// [`UnivariatePdf::analytical_integral`] or by quadrature. Invalid shape
/// parameters must yield `NaN` rather than panic, so that the objective can
/// penalize the point.
pub trait UnivariatePdf: Send + Sync + std::fmt::Debug {
    /// Leaf kind tag.
    fn kind(&self) -> PdfKind;

    /// Number of shape parameters, in the order `unnormalized` expects them.
    fn n_params(&self) -> usize;

    /// Shape parameter roles, for diagnostics and spec round-trips.
    fn param_roles(&self) -> Vec<String>;

    /// Unnormalized density at `x`.
    fn unnormalized(&self, x: f64, params: &[f64]) -> f64;

    /// Unnormalized density for a contiguous batch of observations.
    fn unnormalized_batch(&self, xs: &[f64], params: &[f64], out: &mut [f64]) {
        for (o, &x) in out.iter_mut().zip(xs) {
            *o = self.unnormalized(x, params);
        }
    }

    /// Closed-form integral over `range`, if one exists.
    fn analytical_integral(&self, _params: &[f64], _range: (f64, f64)) -> Option<f64> {
        None
    }

    /// Inverse of the truncated CDF on `range` at `u ∈ [0, 1)`, if it has a closed form.
    fn inverse_cdf(&self, _u: f64, _params: &[f64], _range: (f64, f64)) -> Option<f64> {
        None
    }

    /// Upper bound of the unnormalized density on `range`, used as the
    /// rejection-sampling envelope.
    ///
    /// The default scans a regular grid and adds a 10% margin.
    fn envelope(&self, params: &[f64], range: (f64, f64)) -> f64 {
        grid_maximum(|x| self.unnormalized(x, params), range, 512) * 1.1
    }
}

pub(crate) fn grid_maximum(f: impl Fn(f64) -> f64, range: (f64, f64), n: usize) -> f64 {
    let (a, b) = range;
    let step = (b - a) / n as f64;
    let mut max = f64::NEG_INFINITY;
    for i in 0..=n {
        let v = f(a + step * i as f64);
        if v.is_nan() {
            return f64::NAN;
        }
        if v > max {
            max = v;
        }
    }
    max
}

/// Build the leaf implementation for a kind with `n_params` shape parameters.
pub fn leaf_for(kind: PdfKind, n_params: usize) -> std::sync::Arc<dyn UnivariatePdf> {
    use std::sync::Arc;
    match kind {
        PdfKind::Gaussian => Arc::new(GaussianPdf),
        PdfKind::Exponential => Arc::new(ExponentialPdf),
        PdfKind::Polynomial => Arc::new(PolynomialPdf::new(n_params)),
        PdfKind::Gamma => Arc::new(GammaPdf),
    }
}
