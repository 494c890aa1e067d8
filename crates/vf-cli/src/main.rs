//! vecfit CLI

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use vf_compute::{BackendKind, select};
use vf_core::ParameterSet;
use vf_inference::{BenchmarkHarness, FitConfig, FitEngine, HarnessConfig, RunOutcome};
use vf_model::presets::{PRESETS, REFERENCE_EVENTS, preset_spec};
use vf_model::{DataGenerator, Dataset, Model, ModelSpec, randomise_parameters};

#[derive(Parser)]
#[command(name = "vecfit")]
#[command(about = "vecfit - likelihood fits on scalar, vectorized CPU and GPU backends")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Time one fit per backend on a shared generated dataset
    Bench {
        #[command(flatten)]
        workload: WorkloadArgs,

        /// Backends to run (scalar, cpu, gpu). Defaults to all.
        #[arg(long, value_delimiter = ',')]
        backend: Vec<BackendKind>,

        /// Timed fits per backend.
        #[arg(long, default_value = "1")]
        repetitions: usize,

        /// Fit settings (JSON). Defaults are used for missing fields.
        #[arg(long)]
        fit_config: Option<PathBuf>,

        /// Print the full report as JSON instead of `name elapsed_ms` rows.
        #[arg(long)]
        json: bool,

        /// Output file for results. Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto).
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Perform one maximum-likelihood fit
    Fit {
        #[command(flatten)]
        workload: WorkloadArgs,

        /// Evaluation backend (scalar, cpu, gpu).
        #[arg(long, default_value = "cpu")]
        backend: BackendKind,

        /// Fit settings (JSON). Defaults are used for missing fields.
        #[arg(long)]
        fit_config: Option<PathBuf>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto).
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Generate a dataset and report its size and digest
    Generate {
        #[command(flatten)]
        workload: WorkloadArgs,

        /// Write the generated columns (JSON) to this file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List evaluation backends and whether they can run here
    Backends {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

/// Model source and generated dataset.
#[derive(Args)]
struct WorkloadArgs {
    /// Model specification file (YAML or JSON).
    #[arg(long, conflicts_with_all = ["factory", "preset"])]
    model: Option<PathBuf>,

    /// Factory statements, e.g. `Gaussian::g(x[0,10],m[5,0,10],s[1,0.1,5])`.
    #[arg(long, conflicts_with = "preset")]
    factory: Option<String>,

    /// Built-in model (reference, gauss-exp).
    #[arg(long, default_value = "reference")]
    preset: String,

    /// Number of events to generate.
    #[arg(long, default_value_t = REFERENCE_EVENTS)]
    events: usize,

    /// Generation seed (0 = non-reproducible).
    #[arg(long, default_value = "1337")]
    seed: u64,

    /// Draw the fit start point uniformly inside the bounds with this seed.
    #[arg(long)]
    randomise_start: Option<u64>,
}

struct Workload {
    model: Model,
    data: Dataset,
    start: ParameterSet,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Bench { workload, backend, repetitions, fit_config, json, output, threads } => {
            cmd_bench(
                &workload,
                backend,
                repetitions,
                fit_config.as_deref(),
                json,
                output.as_deref(),
                threads,
            )
        }
        Commands::Fit { workload, backend, fit_config, output, threads } => {
            cmd_fit(&workload, backend, fit_config.as_deref(), output.as_deref(), threads)
        }
        Commands::Generate { workload, output } => cmd_generate(&workload, output.as_deref()),
        Commands::Backends { json } => cmd_backends(json),
    }
}

fn cmd_bench(
    args: &WorkloadArgs,
    backends: Vec<BackendKind>,
    repetitions: usize,
    fit_config: Option<&Path>,
    json: bool,
    output: Option<&Path>,
    threads: usize,
) -> Result<()> {
    init_threads(threads);
    let workload = prepare_workload(args)?;
    let config = HarnessConfig {
        backends: if backends.is_empty() { BackendKind::ALL.to_vec() } else { backends },
        repetitions,
        fit: load_fit_config(fit_config)?,
    };
    let harness =
        BenchmarkHarness::new(&workload.model.root, &workload.data, &workload.start, config);
    let report = harness.run()?;

    let text = if json {
        report.to_json()?
    } else {
        let mut lines = Vec::with_capacity(report.entries.len());
        for e in &report.entries {
            lines.push(match &e.outcome {
                RunOutcome::Completed { elapsed_ms, fit } => {
                    format!("{} {elapsed_ms:.3} {}", e.name, fit.status)
                }
                RunOutcome::Unavailable { reason } => format!("{} unavailable: {reason}", e.name),
                RunOutcome::Errored { message } => format!("{} error: {message}", e.name),
            });
        }
        lines.join("\n")
    };
    write_text(output, &text)
}

fn cmd_fit(
    args: &WorkloadArgs,
    backend: BackendKind,
    fit_config: Option<&Path>,
    output: Option<&Path>,
    threads: usize,
) -> Result<()> {
    init_threads(threads);
    let workload = prepare_workload(args)?;
    let evaluator = select(backend)?;
    let mut params = workload.start.clone();
    let mut engine = FitEngine::new(load_fit_config(fit_config)?);

    let start = Instant::now();
    let result = engine.fit(evaluator.as_ref(), &workload.model.root, &workload.data, &mut params)?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;
    tracing::info!(backend = backend.name(), elapsed_ms, status = %result.status, "fit finished");

    let mut value = serde_json::to_value(&result)?;
    value["name"] = backend.name().into();
    value["elapsed_ms"] = elapsed_ms.into();
    value["parameter_names"] = params.free_names().into();
    value["bestfit"] = params.free_values().into();
    value["n_events"] = workload.data.n_rows().into();
    value["dataset_digest"] = workload.data.digest().into();
    write_json(output, &value)
}

fn cmd_generate(args: &WorkloadArgs, output: Option<&Path>) -> Result<()> {
    let workload = prepare_workload(args)?;
    let data = &workload.data;
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string(data)?)
            .with_context(|| format!("writing dataset to {}", path.display()))?;
        tracing::info!(path = %path.display(), "dataset written");
    }
    let summary = serde_json::json!({
        "observable": workload.model.observable().name,
        "n_events": data.n_rows(),
        "seed": args.seed,
        "digest": data.digest(),
    });
    write_json(None, &summary)
}

fn cmd_backends(json: bool) -> Result<()> {
    let registered = BackendKind::registered();
    let rows: Vec<serde_json::Value> = BackendKind::ALL
        .into_iter()
        .map(|kind| {
            let (available, reason) = match select(kind) {
                Ok(_) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            };
            serde_json::json!({
                "backend": kind.to_string(),
                "name": kind.name(),
                "registered": registered.contains(&kind),
                "available": available,
                "reason": reason,
            })
        })
        .collect();

    if json {
        return write_json(None, &serde_json::Value::Array(rows));
    }
    for row in &rows {
        let status = if row["available"] == true { "available" } else { "unavailable" };
        let name = row["name"].as_str().unwrap_or_default();
        let backend = row["backend"].as_str().unwrap_or_default();
        println!("{name:<12} {backend:<10} {status}");
    }
    Ok(())
}

fn init_threads(threads: usize) {
    if threads > 0 {
        // Best-effort; if a global pool already exists, keep going.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global();
    }
}

fn load_model(args: &WorkloadArgs) -> Result<Model> {
    let spec = if let Some(path) = &args.model {
        tracing::info!(path = %path.display(), "loading model spec");
        ModelSpec::from_path(path)
            .with_context(|| format!("reading model spec {}", path.display()))?
    } else if let Some(src) = &args.factory {
        vf_model::factory::parse(src).context("parsing factory statements")?
    } else {
        preset_spec(&args.preset, args.events)
            .with_context(|| format!("available presets: {}", PRESETS.join(", ")))?
    };
    let model = vf_model::build(&spec)?;
    tracing::info!(
        root = model.root.name(),
        parameters = model.parameters.len(),
        free = model.parameters.n_free(),
        "model built"
    );
    Ok(model)
}

fn prepare_workload(args: &WorkloadArgs) -> Result<Workload> {
    let model = load_model(args)?;
    let observable = model.observable().name.clone();
    let data = DataGenerator::new().generate(
        &model.root,
        &model.parameters,
        &observable,
        args.events,
        args.seed,
    )?;
    tracing::info!(events = data.n_rows(), seed = args.seed, "dataset generated");

    let mut start = model.parameters.clone();
    if let Some(seed) = args.randomise_start {
        randomise_parameters(&mut start, seed)?;
        tracing::info!(seed, "randomised fit start point");
    }
    Ok(Workload { model, data, start })
}

fn load_fit_config(path: Option<&Path>) -> Result<FitConfig> {
    let Some(path) = path else {
        return Ok(FitConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading fit config {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing fit config {}", path.display()))
}

fn write_json(output: Option<&Path>, value: &serde_json::Value) -> Result<()> {
    write_text(output, &serde_json::to_string_pretty(value)?)
}

fn write_text(output: Option<&Path>, text: &str) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    } else {
        println!("{text}");
    }
    Ok(())
}
