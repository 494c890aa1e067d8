use crate::pdf::{PdfKind, UnivariatePdf};

/// Exponential shape `exp(-rate * x)` truncated to the observable range.
///
/// Parameters: `[rate]`. Negative rates give a rising exponential; `rate → 0`
/// approaches the uniform density.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExponentialPdf;

impl ExponentialPdf {
    /// `(e^{-r a} - e^{-r b}) / r`, with the `r → 0` limit `b - a`.
    fn integral(rate: f64, a: f64, b: f64) -> f64 {
        let w = b - a;
        if (rate * w).abs() < 1e-12 {
            return (-rate * a).exp() * w;
        }
        (-rate * a).exp() * -(-rate * w).exp_m1() / rate
    }
}

impl UnivariatePdf for ExponentialPdf {
    fn kind(&self) -> PdfKind {
        PdfKind::Exponential
    }

    fn n_params(&self) -> usize {
        1
    }

    fn param_roles(&self) -> Vec<String> {
        vec!["rate".into()]
    }

    #[inline]
    fn unnormalized(&self, x: f64, params: &[f64]) -> f64 {
        (-params[0] * x).exp()
    }

    fn analytical_integral(&self, params: &[f64], range: (f64, f64)) -> Option<f64> {
        let rate = params[0];
        if !rate.is_finite() {
            return Some(f64::NAN);
        }
        Some(Self::integral(rate, range.0, range.1))
    }

    fn inverse_cdf(&self, u: f64, params: &[f64], range: (f64, f64)) -> Option<f64> {
        let rate = params[0];
        let (a, b) = range;
        let w = b - a;
        if !rate.is_finite() {
            return None;
        }
        if (rate * w).abs() < 1e-12 {
            return Some(a + u * w);
        }
        // F(x) = (1 - e^{-r (x - a)}) / (1 - e^{-r w})
        let span = -(-rate * w).exp_m1();
        let x = a - (-u * span).ln_1p() / rate;
        Some(x.clamp(a, b))
    }

    fn envelope(&self, params: &[f64], range: (f64, f64)) -> f64 {
        // Monotone: the maximum sits on an edge.
        self.unnormalized(range.0, params).max(self.unnormalized(range.1, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_integral_matches_closed_form() {
        let pdf = ExponentialPdf;
        let i = pdf.analytical_integral(&[0.1], (0.0, 20.0)).unwrap();
        assert_relative_eq!(i, (1.0 - (-2.0f64).exp()) / 0.1, max_relative = 1e-13);
    }

    #[test]
    fn test_small_rate_limit() {
        let pdf = ExponentialPdf;
        let i = pdf.analytical_integral(&[1e-15], (2.0, 5.0)).unwrap();
        assert_relative_eq!(i, 3.0, max_relative = 1e-12);
        let x = pdf.inverse_cdf(0.5, &[0.0], (2.0, 4.0)).unwrap();
        assert_relative_eq!(x, 3.0);
    }

    #[test]
    fn test_inverse_cdf_median() {
        let pdf = ExponentialPdf;
        let (a, b, r) = (0.0, 20.0, 0.1);
        let x = pdf.inverse_cdf(0.5, &[r], (a, b)).unwrap();
        let half = ExponentialPdf::integral(r, a, x) / ExponentialPdf::integral(r, a, b);
        assert_relative_eq!(half, 0.5, max_relative = 1e-12);
    }
}
