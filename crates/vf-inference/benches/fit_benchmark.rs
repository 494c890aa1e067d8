use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use vf_compute::{BackendKind, select};
use vf_inference::{FitConfig, FitEngine};
use vf_model::presets::{REFERENCE_EVENTS, gauss_exp_mixture, reference_spec};
use vf_model::{DataGenerator, Model};

fn mixture_with_data(n_events: usize) -> (Model, vf_model::Dataset) {
    let model = gauss_exp_mixture().build().unwrap();
    let data = DataGenerator::new()
        .generate(&model.root, &model.parameters, "x", n_events, 1337)
        .unwrap();
    (model, data)
}

fn bench_fit(c: &mut Criterion) {
    let (model, data) = mixture_with_data(REFERENCE_EVENTS);
    let mut start = model.parameters.clone();
    start.set_value("mean", 9.0).unwrap();
    start.set_value("f_gauss", 0.3).unwrap();

    let mut group = c.benchmark_group("fit");
    group.sample_size(10);
    for kind in BackendKind::ALL {
        let Ok(backend) = select(kind) else {
            eprintln!("skipping {kind}: backend unavailable");
            continue;
        };
        group.bench_function(kind.name(), |b| {
            b.iter(|| {
                let mut params = start.clone();
                let mut engine = FitEngine::new(FitConfig::default());
                let res = engine.fit(backend.as_ref(), &model.root, &data, &mut params).unwrap();
                black_box(res.nll)
            })
        });
    }
    group.finish();
}

fn bench_fit_reference(c: &mut Criterion) {
    let model = vf_model::build(&reference_spec(REFERENCE_EVENTS).unwrap()).unwrap();
    let data = DataGenerator::new()
        .generate(&model.root, &model.parameters, "x", REFERENCE_EVENTS, 1337)
        .unwrap();
    let mut start = model.parameters.clone();
    start.set_value("m1", 9.5).unwrap();
    start.set_value("s2", 0.35).unwrap();

    let mut group = c.benchmark_group("fit_reference");
    group.sample_size(10);
    for kind in BackendKind::ALL {
        let Ok(backend) = select(kind) else {
            eprintln!("skipping {kind}: backend unavailable");
            continue;
        };
        group.bench_function(kind.name(), |b| {
            b.iter(|| {
                let mut params = start.clone();
                let mut engine = FitEngine::new(FitConfig::default());
                let res = engine.fit(backend.as_ref(), &model.root, &data, &mut params).unwrap();
                black_box(res.nll)
            })
        });
    }
    group.finish();
}

fn bench_nll(c: &mut Criterion) {
    let mut group = c.benchmark_group("nll");
    for n_events in [10_000usize, 100_000] {
        let (model, data) = mixture_with_data(n_events);
        let plan = model.root.plan();
        let values = model.parameters.values();
        for kind in BackendKind::ALL {
            let Ok(backend) = select(kind) else { continue };
            let cache = vf_model::NormCache::default();
            group.bench_with_input(BenchmarkId::new(kind.name(), n_events), &n_events, |b, _| {
                b.iter(|| black_box(backend.evaluate(&plan, &data, &values, &cache).unwrap()))
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_fit, bench_fit_reference, bench_nll);
criterion_main!(benches);
