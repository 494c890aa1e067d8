//! SIMD kernels for column-at-a-time density evaluation.
//!
//! Uses `wide::f64x4` for the arithmetic. `exp` and `ln` are evaluated lane by
//! lane with the scalar `f64` functions: the `wide` approximations are too
//! coarse for a likelihood that must agree with the row-at-a-time path.

use wide::f64x4;

#[inline(always)]
fn exp_f64x4(v: f64x4) -> f64x4 {
    let arr: [f64; 4] = v.into();
    f64x4::from([arr[0].exp(), arr[1].exp(), arr[2].exp(), arr[3].exp()])
}

#[inline(always)]
fn ln_f64x4(v: f64x4) -> f64x4 {
    let arr: [f64; 4] = v.into();
    f64x4::from([arr[0].ln(), arr[1].ln(), arr[2].ln(), arr[3].ln()])
}

/// `out[i] = scale * exp(-0.5 ((xs[i] - mean) / sigma)^2)`.
///
/// A non-positive `sigma` fills `out` with `NaN`.
pub fn gaussian_batch(xs: &[f64], mean: f64, sigma: f64, scale: f64, out: &mut [f64]) {
    assert_eq!(xs.len(), out.len());
    if !(sigma > 0.0) {
        out.fill(f64::NAN);
        return;
    }
    if !use_simd() {
        for (o, &x) in out.iter_mut().zip(xs) {
            let z = (x - mean) / sigma;
            *o = scale * (-0.5 * z * z).exp();
        }
        return;
    }

    let n = xs.len();
    let chunks = n / 4;
    let mean4 = f64x4::splat(mean);
    let sigma4 = f64x4::splat(sigma);
    let half4 = f64x4::splat(-0.5);
    let scale4 = f64x4::splat(scale);

    for i in 0..chunks {
        let offset = i * 4;
        let x = f64x4::from(&xs[offset..offset + 4]);
        let z = (x - mean4) / sigma4;
        let v = scale4 * exp_f64x4(half4 * z * z);
        let arr: [f64; 4] = v.into();
        out[offset..offset + 4].copy_from_slice(&arr);
    }

    for i in chunks * 4..n {
        let z = (xs[i] - mean) / sigma;
        out[i] = scale * (-0.5 * z * z).exp();
    }
}

/// `out[i] = scale * exp(-rate * xs[i])`.
pub fn exponential_batch(xs: &[f64], rate: f64, scale: f64, out: &mut [f64]) {
    assert_eq!(xs.len(), out.len());
    if !use_simd() {
        for (o, &x) in out.iter_mut().zip(xs) {
            *o = scale * (-rate * x).exp();
        }
        return;
    }

    let n = xs.len();
    let chunks = n / 4;
    let neg_rate4 = f64x4::splat(-rate);
    let scale4 = f64x4::splat(scale);

    for i in 0..chunks {
        let offset = i * 4;
        let x = f64x4::from(&xs[offset..offset + 4]);
        let v = scale4 * exp_f64x4(neg_rate4 * x);
        let arr: [f64; 4] = v.into();
        out[offset..offset + 4].copy_from_slice(&arr);
    }

    for i in chunks * 4..n {
        out[i] = scale * (-rate * xs[i]).exp();
    }
}

/// `out[i] = scale * (1 + Σ_k coeffs[k] xs[i]^(k+1))`, Horner order.
pub fn polynomial_batch(xs: &[f64], coeffs: &[f64], scale: f64, out: &mut [f64]) {
    assert_eq!(xs.len(), out.len());
    if !use_simd() {
        for (o, &x) in out.iter_mut().zip(xs) {
            let mut acc = 0.0;
            for &a in coeffs.iter().rev() {
                acc = (acc + a) * x;
            }
            *o = scale * (1.0 + acc);
        }
        return;
    }

    let n = xs.len();
    let chunks = n / 4;
    let one4 = f64x4::splat(1.0);
    let scale4 = f64x4::splat(scale);

    for i in 0..chunks {
        let offset = i * 4;
        let x = f64x4::from(&xs[offset..offset + 4]);
        let mut acc = f64x4::ZERO;
        for &a in coeffs.iter().rev() {
            acc = (acc + f64x4::splat(a)) * x;
        }
        let v = scale4 * (one4 + acc);
        let arr: [f64; 4] = v.into();
        out[offset..offset + 4].copy_from_slice(&arr);
    }

    for i in chunks * 4..n {
        let mut acc = 0.0;
        for &a in coeffs.iter().rev() {
            acc = (acc + a) * xs[i];
        }
        out[i] = scale * (1.0 + acc);
    }
}

/// `data[i] *= factor`.
pub fn scale_in_place(data: &mut [f64], factor: f64) {
    if !use_simd() {
        for v in data.iter_mut() {
            *v *= factor;
        }
        return;
    }

    let n = data.len();
    let chunks = n / 4;
    let factor4 = f64x4::splat(factor);

    for i in 0..chunks {
        let offset = i * 4;
        let v = f64x4::from(&data[offset..offset + 4]) * factor4;
        let arr: [f64; 4] = v.into();
        data[offset..offset + 4].copy_from_slice(&arr);
    }

    for v in &mut data[chunks * 4..] {
        *v *= factor;
    }
}

/// `dst[i] += a * src[i]`.
///
/// # Panics
///
/// Panics if `dst.len() != src.len()`.
pub fn axpy(dst: &mut [f64], a: f64, src: &[f64]) {
    assert_eq!(dst.len(), src.len());
    if !use_simd() {
        for (d, &s) in dst.iter_mut().zip(src) {
            *d += a * s;
        }
        return;
    }

    let n = dst.len();
    let chunks = n / 4;
    let a4 = f64x4::splat(a);

    for i in 0..chunks {
        let offset = i * 4;
        let mut d = f64x4::from(&dst[offset..offset + 4]);
        let s = f64x4::from(&src[offset..offset + 4]);
        d += a4 * s;
        let arr: [f64; 4] = d.into();
        dst[offset..offset + 4].copy_from_slice(&arr);
    }

    for i in chunks * 4..n {
        dst[i] += a * src[i];
    }
}

/// `Σ ln(xs[i])`. Non-positive entries propagate as `-inf` / `NaN`.
pub fn sum_ln(xs: &[f64]) -> f64 {
    if !use_simd() {
        return sum_ln_scalar(xs);
    }

    let n = xs.len();
    let chunks = n / 4;
    let mut acc = f64x4::ZERO;

    for i in 0..chunks {
        let offset = i * 4;
        acc += ln_f64x4(f64x4::from(&xs[offset..offset + 4]));
    }

    let mut total = acc.reduce_add();
    for &x in &xs[chunks * 4..] {
        total += x.ln();
    }
    total
}

/// Scalar reference for [`sum_ln`].
pub fn sum_ln_scalar(xs: &[f64]) -> f64 {
    xs.iter().map(|x| x.ln()).sum()
}

/// Check if SIMD should be used on the current platform.
#[inline(always)]
fn use_simd() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("avx2")
    }
    #[cfg(target_arch = "aarch64")]
    {
        true
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}
