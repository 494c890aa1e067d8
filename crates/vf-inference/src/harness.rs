//! Benchmark harness: timed fits across evaluation backends.
//!
//! Configurations run one after another on the calling thread. Every run
//! starts from a clone of the same frozen parameter snapshot, so no fit can
//! leak its result into the next run's starting point.

use crate::fit::{FitConfig, FitEngine};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Instant;
use vf_compute::{BackendKind, select};
use vf_core::{Error, FitResult, ParameterSet, Result};
use vf_model::{Dataset, DensityNode};

/// Harness configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Backends to run, in order.
    pub backends: Vec<BackendKind>,
    /// Timed fits per backend.
    pub repetitions: usize,
    /// Fit settings shared by every run.
    pub fit: FitConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self { backends: BackendKind::ALL.to_vec(), repetitions: 1, fit: FitConfig::default() }
    }
}

/// Outcome of one (backend, repetition) run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The fit ran to a terminal state.
    Completed {
        /// Wall time of the fit, including backend preparation.
        elapsed_ms: f64,
        /// Fit result.
        fit: Box<FitResult>,
    },
    /// The backend cannot run here; nothing was timed.
    Unavailable {
        /// Why the backend was skipped.
        reason: String,
    },
    /// The fit raised an error.
    Errored {
        /// Error message.
        message: String,
    },
}

/// One report row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkEntry {
    /// Human-readable configuration name (`fit_Scalar`, `fit_CPU`, `fit_CUDA`).
    pub name: String,
    /// Backend tag.
    pub backend: BackendKind,
    /// Zero-based repetition index.
    pub repetition: usize,
    /// What happened.
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

/// Harness output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchmarkReport {
    /// Number of events in the shared dataset.
    pub n_events: usize,
    /// Rows in execution order.
    pub entries: Vec<BenchmarkEntry>,
}

impl BenchmarkReport {
    /// `(name, elapsed ms)` for every completed run.
    pub fn timings(&self) -> Vec<(String, f64)> {
        self.entries
            .iter()
            .filter_map(|e| match &e.outcome {
                RunOutcome::Completed { elapsed_ms, .. } => Some((e.name.clone(), *elapsed_ms)),
                _ => None,
            })
            .collect()
    }

    /// Backends reported as unavailable, with the reason.
    pub fn unavailable(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter_map(|e| match &e.outcome {
                RunOutcome::Unavailable { reason } => Some((e.name.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    /// Fit results of completed runs, by configuration name.
    pub fn fits(&self) -> impl Iterator<Item = (&str, &FitResult)> {
        self.entries.iter().filter_map(|e| match &e.outcome {
            RunOutcome::Completed { fit, .. } => Some((e.name.as_str(), fit.as_ref())),
            _ => None,
        })
    }

    /// Pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Plain-text table, one row per run.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            let _ = match &e.outcome {
                RunOutcome::Completed { elapsed_ms, fit } => writeln!(
                    out,
                    "{:<12} {:>12.3} ms  {:<24} nll={:.6} iterations={}",
                    e.name, elapsed_ms, fit.status, fit.nll, fit.iterations
                ),
                RunOutcome::Unavailable { reason } => {
                    writeln!(out, "{:<12} {:>15}  {reason}", e.name, "unavailable")
                }
                RunOutcome::Errored { message } => {
                    writeln!(out, "{:<12} {:>15}  {message}", e.name, "error")
                }
            };
        }
        out
    }
}

/// Runs timed fits of one model over one dataset.
pub struct BenchmarkHarness<'a> {
    root: &'a DensityNode,
    data: &'a Dataset,
    snapshot: ParameterSet,
    config: HarnessConfig,
}

impl<'a> BenchmarkHarness<'a> {
    /// Freeze `initial` as the starting point of every run.
    pub fn new(
        root: &'a DensityNode,
        data: &'a Dataset,
        initial: &ParameterSet,
        config: HarnessConfig,
    ) -> Self {
        Self { root, data, snapshot: initial.clone(), config }
    }

    /// Frozen starting point.
    pub fn snapshot(&self) -> &ParameterSet {
        &self.snapshot
    }

    /// Run every configured backend `repetitions` times.
    ///
    /// Unavailable backends and failing fits are recorded in the report; only
    /// an empty configuration is an error.
    pub fn run(&self) -> Result<BenchmarkReport> {
        if self.config.backends.is_empty() {
            return Err(Error::Validation("harness configured with no backends".into()));
        }
        let mut report = BenchmarkReport { n_events: self.data.n_rows(), entries: Vec::new() };
        let repetitions = self.config.repetitions.max(1);

        for &kind in &self.config.backends {
            let backend = match select(kind) {
                Ok(b) => b,
                Err(e) if e.is_recoverable() => {
                    log::warn!("{kind}: skipped ({e})");
                    for repetition in 0..repetitions {
                        report.entries.push(BenchmarkEntry {
                            name: kind.name().to_string(),
                            backend: kind,
                            repetition,
                            outcome: RunOutcome::Unavailable { reason: e.to_string() },
                        });
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            for repetition in 0..repetitions {
                let mut params = self.snapshot.clone();
                let mut engine = FitEngine::new(self.config.fit.clone());
                let start = Instant::now();
                let fitted = engine.fit(backend.as_ref(), self.root, self.data, &mut params);
                let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;

                let outcome = match fitted {
                    Ok(fit) => {
                        log::info!("{kind}: {elapsed_ms:.3} ms ({})", fit.status);
                        RunOutcome::Completed { elapsed_ms, fit: Box::new(fit) }
                    }
                    Err(e) if e.is_recoverable() => {
                        log::warn!("{kind}: unavailable during fit ({e})");
                        RunOutcome::Unavailable { reason: e.to_string() }
                    }
                    Err(e) => {
                        log::warn!("{kind}: fit failed ({e})");
                        RunOutcome::Errored { message: e.to_string() }
                    }
                };
                report.entries.push(BenchmarkEntry {
                    name: kind.name().to_string(),
                    backend: kind,
                    repetition,
                    outcome,
                });
            }
        }
        Ok(report)
    }
}
