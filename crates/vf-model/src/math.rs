use std::f64::consts::SQRT_2;

#[inline]
pub(crate) fn standard_normal_cdf(z: f64) -> f64 {
    0.5 * statrs::function::erf::erfc(-z / SQRT_2)
}

/// Probability mass of `N(0,1)` inside `[za, zb]`, computed on the tail with
/// the smaller cancellation error.
#[inline]
pub(crate) fn standard_normal_mass(za: f64, zb: f64) -> f64 {
    if za > 0.0 {
        // Both in the upper tail: use complementary CDFs.
        standard_normal_cdf(-za) - standard_normal_cdf(-zb)
    } else {
        standard_normal_cdf(zb) - standard_normal_cdf(za)
    }
}

/// `(b^(k+1) - a^(k+1)) / (k+1)`, the integral of `x^k` over `[a, b]`.
#[inline]
pub(crate) fn monomial_integral(k: usize, a: f64, b: f64) -> f64 {
    let e = (k + 1) as i32;
    (b.powi(e) - a.powi(e)) / (k + 1) as f64
}
