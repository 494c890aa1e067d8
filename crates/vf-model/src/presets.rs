//! Built-in model definitions.

use crate::builder::ModelBuilder;
use crate::factory;
use crate::spec::ModelSpec;
use vf_core::Result;

/// Events generated for the reference benchmark workload.
pub const REFERENCE_EVENTS: usize = 100_000;

/// Factory statements of the reference benchmark model: a gamma peak, three
/// Gaussians and a linear background, combined with yield coefficients.
pub const REFERENCE_FACTORY: &str = "\
Gamma::vpdf(x[0,20],g[20,0.1,40],b[0.5,0.01,10],m0[0]);
Gaussian::gpdf(x,m1[10,0,20],s1[2,0.1,10]);
Gaussian::g2(x,m2[5,0,20],s2[0.3,0.01,10]);
Gaussian::g3(x,m3[15,0,20],s3[0.4,0.01,10]);
Polynomial::pol(x,a[-0.01,-0.05,0.1]);
SUM::model(ns1[0,1000000000]*vpdf,ns2[0,10000000000]*gpdf,ng2[0,1000000000]*g2,ng3[0,10000000000]*g3,npol[0,10000000000]*pol)";

/// Reference benchmark model with yields set for `n_events` expected events
/// (fractions 0.2 / 0.3 / 0.1 / 0.1 / 0.3).
pub fn reference_spec(n_events: usize) -> Result<ModelSpec> {
    let mut spec = factory::parse(REFERENCE_FACTORY)?;
    let n = n_events as f64;
    for (name, frac) in [("ns1", 0.2), ("ns2", 0.3), ("ng2", 0.1), ("ng3", 0.1), ("npol", 0.3)] {
        spec.set_initial(name, frac * n)?;
    }
    Ok(spec)
}

/// Two-component mixture `0.2·Gauss(10, 2) + 0.8·Exp(rate 0.1)` on `x ∈ [0, 20]`.
///
/// The exponential coefficient is held constant at 0.8 so that the free
/// coefficient `f_gauss` equals the Gaussian fraction at the generating point.
pub fn gauss_exp_mixture() -> ModelBuilder {
    ModelBuilder::new()
        .observable("x", (0.0, 20.0))
        .free("mean", 10.0, (0.0, 20.0))
        .free("sigma", 2.0, (0.1, 10.0))
        .free("rate", 0.1, (0.001, 1.0))
        .free("f_gauss", 0.2, (0.0, 1.0))
        .constant("f_exp", 0.8)
        .gaussian("gauss", "x", "mean", "sigma")
        .exponential("expo", "x", "rate")
        .sum("model", &[("f_gauss", "gauss"), ("f_exp", "expo")], false)
}

/// Names of the built-in presets accepted by [`preset_spec`].
pub const PRESETS: &[&str] = &["reference", "gauss-exp"];

/// Spec for a named preset.
pub fn preset_spec(name: &str, n_events: usize) -> Result<ModelSpec> {
    match name {
        "reference" => reference_spec(n_events),
        "gauss-exp" => Ok(gauss_exp_mixture().spec().clone()),
        other => Err(vf_core::Error::Validation(format!(
            "unknown preset '{other}' (expected one of {PRESETS:?})"
        ))),
    }
}
