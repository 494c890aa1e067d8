use super::*;
use crate::normalize::integrate;
use crate::presets::{gauss_exp_mixture, reference_spec};
use approx::assert_relative_eq;
use vf_core::Error;

fn three_component(coefs: [f64; 3]) -> Model {
    ModelBuilder::new()
        .observable("x", (0.0, 20.0))
        .free("mean", 10.0, (0.0, 20.0))
        .free("sigma", 2.0, (0.1, 10.0))
        .free("rate", 0.1, (0.001, 1.0))
        .free("a1", 0.02, (-0.05, 0.1))
        .free("c0", coefs[0], (0.0, 10.0))
        .free("c1", coefs[1], (0.0, 10.0))
        .free("c2", coefs[2], (0.0, 10.0))
        .gaussian("gauss", "x", "mean", "sigma")
        .exponential("expo", "x", "rate")
        .polynomial("pol", "x", &["a1"])
        .sum("model", &[("c0", "gauss"), ("c1", "expo"), ("c2", "pol")], false)
        .build()
        .unwrap()
}

#[test]
fn test_weighted_sum_integrates_to_one() {
    for coefs in [[1.0, 1.0, 1.0], [0.2, 0.8, 0.0], [5.0, 0.0, 0.01], [0.0, 0.0, 3.0]] {
        let model = three_component(coefs);
        let values = model.parameters.values();
        let total = integrate(|x| model.root.density(x, &values), (0.0, 20.0));
        assert_relative_eq!(total, 1.0, max_relative = 1e-10);
    }
}

#[test]
fn test_nested_sum_integrates_to_one() {
    let model = ModelBuilder::new()
        .observable("x", (0.0, 20.0))
        .free("m", 4.0, (0.0, 20.0))
        .constant("s", 1.0)
        .free("g", 20.0, (0.1, 40.0))
        .free("b", 0.5, (0.01, 10.0))
        .constant("m0", 0.0)
        .free("f1", 0.3, (0.0, 1.0))
        .free("f2", 0.7, (0.0, 1.0))
        .free("n1", 10.0, (0.0, 100.0))
        .free("n2", 90.0, (0.0, 100.0))
        .gaussian("peak", "x", "m", "s")
        .gamma("bump", "x", "g", "b", "m0")
        .sum("signal", &[("f1", "peak"), ("f2", "bump")], false)
        .sum("model", &[("n1", "signal"), ("n2", "peak")], true)
        .build()
        .unwrap();
    let values = model.parameters.values();
    let total = integrate(|x| model.root.density(x, &values), (0.0, 20.0));
    assert_relative_eq!(total, 1.0, max_relative = 1e-9);

    // Shared leaf appears once in the plan.
    let plan = model.root.plan();
    assert_eq!(plan.leaves.len(), 2);
    assert_eq!(plan.steps.len(), 4);
    assert_eq!(plan.yield_indices.as_deref(), Some(&[7usize, 8][..]));
}

#[test]
fn test_plan_matches_recursive_density() {
    let model = three_component([0.3, 0.5, 0.2]);
    let values = model.parameters.values();
    let plan = model.root.plan();
    let cache = NormCache::default();
    let resolved = plan.resolve(&values, &cache);
    let mut slots = vec![0.0; plan.n_slots()];
    for x in [0.0, 0.5, 7.3, 10.0, 19.99] {
        let a = plan.eval_point(x, &resolved, &mut slots);
        let b = model.root.density(x, &values);
        assert_relative_eq!(a, b, max_relative = 1e-14);
    }
    // Resolving again at the same point hits the cache for every leaf.
    let _ = plan.resolve(&values, &cache);
    assert_eq!(cache.stats(), (3, 3));
}

#[test]
fn test_unknown_parameter_reference() {
    let err = ModelBuilder::new()
        .observable("x", (0.0, 20.0))
        .free("mean", 10.0, (0.0, 20.0))
        .gaussian("gauss", "x", "mean", "sigma_typo")
        .build()
        .unwrap_err();
    match err {
        Error::UnknownReference { kind, name, referenced_by } => {
            assert_eq!(kind, "parameter");
            assert_eq!(name, "sigma_typo");
            assert_eq!(referenced_by, "gauss");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unknown_node_and_observable_references() {
    let err = ModelBuilder::new()
        .observable("x", (0.0, 1.0))
        .free("f", 1.0, (0.0, 2.0))
        .sum("model", &[("f", "missing")], false)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::UnknownReference { kind: "node", .. }));

    let err = ModelBuilder::new()
        .free("r", 1.0, (0.0, 2.0))
        .exponential("e", "y", "r")
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::UnknownReference { kind: "observable", .. }));
}

#[test]
fn test_duplicate_names() {
    let err = ModelBuilder::new()
        .observable("x", (0.0, 1.0))
        .free("r", 1.0, (0.0, 2.0))
        .free("r", 1.5, (0.0, 2.0))
        .exponential("e", "x", "r")
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateName { ref name } if name == "r"));

    // Parameters and nodes share one namespace.
    let err = ModelBuilder::new()
        .observable("x", (0.0, 1.0))
        .free("e", 1.0, (0.0, 2.0))
        .exponential("e", "x", "e")
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateName { .. }));
}

#[test]
fn test_invalid_bounds() {
    let err = ModelBuilder::new()
        .observable("x", (0.0, 1.0))
        .free("r", 1.0, (2.0, 0.0))
        .exponential("e", "x", "r")
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBounds { lower, upper, .. } if lower == 2.0 && upper == 0.0));

    let err = ModelBuilder::new()
        .observable("x", (1.0, 1.0))
        .constant("r", 1.0)
        .exponential("e", "x", "r")
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBounds { .. }));
}

#[test]
fn test_negative_coefficient_range_rejected() {
    let err = ModelBuilder::new()
        .observable("x", (0.0, 1.0))
        .constant("r", 1.0)
        .free("c", 0.5, (-1.0, 1.0))
        .exponential("e", "x", "r")
        .sum("model", &[("c", "e")], false)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBounds { ref name, .. } if name == "c"));
}

#[test]
fn test_cycle_and_mixed_observables_rejected() {
    let err = ModelBuilder::new()
        .observable("x", (0.0, 1.0))
        .constant("c", 1.0)
        .sum("a", &[("c", "b")], false)
        .sum("b", &[("c", "a")], false)
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("cycle"));

    let err = ModelBuilder::new()
        .observable("x", (0.0, 1.0))
        .observable("y", (0.0, 1.0))
        .constant("r", 1.0)
        .constant("c", 1.0)
        .exponential("ex", "x", "r")
        .exponential("ey", "y", "r")
        .sum("model", &[("c", "ex"), ("c", "ey")], false)
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("mixes observables"));
}

#[test]
fn test_generate_exact_row_counts() {
    let model = gauss_exp_mixture().build().unwrap();
    let generator = DataGenerator::new();
    for n in [0usize, 1, 17, 2500] {
        let ds = generator.generate(&model.root, &model.parameters, "x", n, 42).unwrap();
        assert_eq!(ds.n_rows(), n);
        assert!(ds.column("x").unwrap().iter().all(|&x| (0.0..=20.0).contains(&x)));
    }
}

#[test]
fn test_generate_is_deterministic_per_seed() {
    let model = reference_spec(1000).and_then(|s| build(&s)).unwrap();
    let generator = DataGenerator::new();
    let a = generator.generate(&model.root, &model.parameters, "x", 5000, 1337).unwrap();
    let b = generator.generate(&model.root, &model.parameters, "x", 5000, 1337).unwrap();
    let c = generator.generate(&model.root, &model.parameters, "x", 5000, 1338).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.digest(), b.digest());
    assert_ne!(a.digest(), c.digest());

    let entropy = generator.generate(&model.root, &model.parameters, "x", 10, 0).unwrap();
    assert_eq!(entropy.n_rows(), 10);
}

#[test]
fn test_generate_snapshot_is_decoupled_from_later_mutation() {
    let model = gauss_exp_mixture().build().unwrap();
    let mut params = model.parameters.clone();
    let generator = DataGenerator::new();
    let before = generator.generate(&model.root, &params, "x", 200, 7).unwrap();
    params.set_value("mean", 3.0).unwrap();
    let after = generator.generate(&model.root, &model.parameters, "x", 200, 7).unwrap();
    assert_eq!(before.digest(), after.digest());
}

#[test]
fn test_generated_gaussian_moments() {
    let model = ModelBuilder::new()
        .observable("x", (0.0, 20.0))
        .free("mean", 10.0, (0.0, 20.0))
        .free("sigma", 2.0, (0.1, 10.0))
        .gaussian("gauss", "x", "mean", "sigma")
        .build()
        .unwrap();
    let ds = DataGenerator::new().generate(&model.root, &model.parameters, "x", 20_000, 99).unwrap();
    let xs = ds.column("x").unwrap();
    let mean = xs.iter().sum::<f64>() / xs.len() as f64;
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / xs.len() as f64;
    assert!((mean - 10.0).abs() < 0.1, "mean = {mean}");
    assert!((var.sqrt() - 2.0).abs() < 0.1, "sigma = {}", var.sqrt());
}

#[test]
fn test_sampling_exhausted() {
    // 1 - 0.1 x is negative on all of [10, 20].
    let model = ModelBuilder::new()
        .observable("x", (10.0, 20.0))
        .free("a1", -0.1, (-1.0, 1.0))
        .polynomial("pol", "x", &["a1"])
        .build()
        .unwrap();
    let err = DataGenerator::new()
        .with_max_trials(1000)
        .generate(&model.root, &model.parameters, "x", 5, 3)
        .unwrap_err();
    assert!(matches!(err, Error::SamplingExhausted { ref node, trials: 1000 } if node == "pol"));
    assert!(err.is_recoverable());
}

#[test]
fn test_generate_wrong_observable() {
    let model = gauss_exp_mixture().build().unwrap();
    let err = DataGenerator::new().generate(&model.root, &model.parameters, "y", 5, 3).unwrap_err();
    assert!(matches!(err, Error::UnknownReference { kind: "observable", .. }));
}

#[test]
fn test_extended_sum_below_root_is_rejected() {
    let nested = |inner_extended: bool| {
        ModelBuilder::new()
            .observable("x", (0.0, 20.0))
            .free("mean", 10.0, (0.0, 20.0))
            .constant("sigma", 2.0)
            .free("rate", 0.1, (0.001, 1.0))
            .free("n_sig", 100.0, (0.0, 1e4))
            .free("n_bkg", 900.0, (0.0, 1e4))
            .constant("one", 1.0)
            .gaussian("gauss", "x", "mean", "sigma")
            .exponential("expo", "x", "rate")
            .sum("inner", &[("n_sig", "gauss"), ("n_bkg", "expo")], inner_extended)
            .sum("model", &[("one", "inner")], true)
            .build()
    };

    let err = nested(true).unwrap_err();
    assert!(matches!(err, Error::Validation(ref m) if m.contains("'inner'")), "{err}");

    let model = nested(false).unwrap();
    assert!(model.root.is_extended());
    assert_eq!(model.root.plan().yield_indices.map(|y| y.len()), Some(1));
}

#[test]
fn test_nested_factory_sum_is_rejected() {
    let src = "Gaussian::g(x[0,20], m[10,0,20], s[2]); Exponential::e(x, r[0.1,0.001,1]); \
               SUM::inner(a[100,0,1e4]*g, b[900,0,1e4]*e); SUM::model(n[1000,0,1e5]*inner)";
    let spec = crate::factory::parse(src).unwrap();
    assert!(matches!(build(&spec), Err(Error::Validation(_))));
}

#[test]
fn test_reference_model_structure() {
    let model = build(&reference_spec(100_000).unwrap()).unwrap();
    assert!(model.root.is_extended());
    assert_eq!(model.parameters.len(), 15);
    assert_eq!(model.parameters.n_free(), 14);
    assert_relative_eq!(model.parameters.value("ns2").unwrap(), 30_000.0, max_relative = 1e-12);
    assert_eq!(model.root.plan().leaves.len(), 5);
}

#[test]
fn test_randomise_parameters_within_bounds() {
    let model = build(&reference_spec(100_000).unwrap()).unwrap();
    let mut a = model.parameters.clone();
    let mut b = model.parameters.clone();
    randomise_parameters(&mut a, 1337).unwrap();
    randomise_parameters(&mut b, 1337).unwrap();
    assert_eq!(a, b);
    for p in a.iter().filter(|p| p.is_free()) {
        let (lo, hi) = p.bounds();
        assert!(p.value() >= lo && p.value() <= hi);
    }
    assert_eq!(a.value("m0"), Some(0.0));
}

#[test]
fn test_factory_and_structured_specs_agree() {
    let spec = factory::parse(
        "Gaussian::gauss(x[0,20], mean[10,0,20], sigma[2,0.1,10]);\
         Exponential::expo(x, rate[0.1,0.001,1]);\
         SUM::model(f_gauss[0.2,0,1]*gauss, f_exp[0.8]*expo)",
    )
    .unwrap();
    let from_factory = build(&spec).unwrap();
    let structured = gauss_exp_mixture().build().unwrap();
    let values = structured.parameters.values();
    assert_eq!(from_factory.parameters.values(), values);
    for x in [0.5, 9.0, 15.0] {
        assert_relative_eq!(
            from_factory.root.density(x, &values),
            structured.root.density(x, &values),
            max_relative = 1e-15
        );
    }
}
