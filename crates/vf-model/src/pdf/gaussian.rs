use crate::math::{standard_normal_cdf, standard_normal_mass};
use crate::pdf::{PdfKind, UnivariatePdf};
use statrs::distribution::{ContinuousCDF, Normal};

/// Gaussian shape `exp(-0.5 z^2)`, `z = (x - mean) / sigma`, truncated to the observable range.
///
/// Parameters: `[mean, sigma]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianPdf;

/// Below this in-range probability mass the inverse CDF loses all precision.
const MIN_INVERSE_MASS: f64 = 1e-6;

impl UnivariatePdf for GaussianPdf {
    fn kind(&self) -> PdfKind {
        PdfKind::Gaussian
    }

    fn n_params(&self) -> usize {
        2
    }

    fn param_roles(&self) -> Vec<String> {
        vec!["mean".into(), "sigma".into()]
    }

    #[inline]
    fn unnormalized(&self, x: f64, params: &[f64]) -> f64 {
        let (mean, sigma) = (params[0], params[1]);
        if !(sigma > 0.0) {
            return f64::NAN;
        }
        let z = (x - mean) / sigma;
        (-0.5 * z * z).exp()
    }

    fn analytical_integral(&self, params: &[f64], range: (f64, f64)) -> Option<f64> {
        let (mean, sigma) = (params[0], params[1]);
        if !(sigma > 0.0) || !mean.is_finite() {
            return Some(f64::NAN);
        }
        let za = (range.0 - mean) / sigma;
        let zb = (range.1 - mean) / sigma;
        Some(sigma * (2.0 * std::f64::consts::PI).sqrt() * standard_normal_mass(za, zb))
    }

    fn inverse_cdf(&self, u: f64, params: &[f64], range: (f64, f64)) -> Option<f64> {
        let (mean, sigma) = (params[0], params[1]);
        let normal = Normal::new(mean, sigma).ok()?;
        let pa = standard_normal_cdf((range.0 - mean) / sigma);
        let pb = standard_normal_cdf((range.1 - mean) / sigma);
        if !(pb - pa > MIN_INVERSE_MASS) {
            return None;
        }
        let x = normal.inverse_cdf(pa + u * (pb - pa));
        Some(x.clamp(range.0, range.1))
    }

    fn envelope(&self, params: &[f64], range: (f64, f64)) -> f64 {
        let mean = params[0];
        // Peak of the truncated shape: at the mean, or at the closest edge.
        let peak = mean.clamp(range.0, range.1);
        self.unnormalized(peak, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_full_range_integral() {
        let pdf = GaussianPdf;
        let i = pdf.analytical_integral(&[0.0, 1.5], (-40.0, 40.0)).unwrap();
        assert_relative_eq!(i, 1.5 * (2.0 * std::f64::consts::PI).sqrt(), max_relative = 1e-12);
    }

    #[test]
    fn test_upper_tail_integral_keeps_precision() {
        let pdf = GaussianPdf;
        // 9..10 sigma above the mean: Phi(zb) - Phi(za) would cancel to zero.
        let i = pdf.analytical_integral(&[0.0, 1.0], (9.0, 10.0)).unwrap();
        assert!(i > 0.0 && i < 1e-17);
    }

    #[test]
    fn test_invalid_sigma_is_nan() {
        let pdf = GaussianPdf;
        assert!(pdf.unnormalized(1.0, &[0.0, -1.0]).is_nan());
        assert!(pdf.analytical_integral(&[0.0, 0.0], (0.0, 1.0)).unwrap().is_nan());
    }

    #[test]
    fn test_inverse_cdf_truncated() {
        let pdf = GaussianPdf;
        let lo = pdf.inverse_cdf(0.0, &[10.0, 2.0], (0.0, 20.0)).unwrap();
        let mid = pdf.inverse_cdf(0.5, &[10.0, 2.0], (0.0, 20.0)).unwrap();
        assert!(lo >= 0.0);
        assert_relative_eq!(mid, 10.0, epsilon = 1e-9);
        assert!(pdf.inverse_cdf(0.5, &[100.0, 0.1], (0.0, 20.0)).is_none());
    }
}
