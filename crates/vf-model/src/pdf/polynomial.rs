use crate::math::monomial_integral;
use crate::pdf::{PdfKind, UnivariatePdf};

/// Polynomial shape `1 + a_1 x + a_2 x^2 + ... + a_k x^k`.
///
/// The constant term is fixed to one so the coefficients are not degenerate
/// with the overall normalization. Regions where the polynomial goes negative
/// evaluate to a negative density, which the likelihood rejects.
#[derive(Debug, Clone, Copy)]
pub struct PolynomialPdf {
    degree: usize,
}

impl PolynomialPdf {
    /// Polynomial with `degree` free coefficients.
    pub fn new(degree: usize) -> Self {
        Self { degree }
    }
}

impl UnivariatePdf for PolynomialPdf {
    fn kind(&self) -> PdfKind {
        PdfKind::Polynomial
    }

    fn n_params(&self) -> usize {
        self.degree
    }

    fn param_roles(&self) -> Vec<String> {
        (1..=self.degree).map(|i| format!("a{i}")).collect()
    }

    #[inline]
    fn unnormalized(&self, x: f64, params: &[f64]) -> f64 {
        // Horner on the coefficients, then shift by the fixed constant term.
        let mut acc = 0.0;
        for &a in params.iter().rev() {
            acc = (acc + a) * x;
        }
        1.0 + acc
    }

    fn analytical_integral(&self, params: &[f64], range: (f64, f64)) -> Option<f64> {
        let (a, b) = range;
        let mut total = b - a;
        for (i, &c) in params.iter().enumerate() {
            total += c * monomial_integral(i + 1, a, b);
        }
        Some(total)
    }
}
