//! # vf-inference
//!
//! Maximum-likelihood fitting for vecfit models.
//!
//! - [`LikelihoodObjective`]: negative log-likelihood over the free parameters,
//!   with normalization caching and non-finite penalty substitution.
//! - [`Minimizer`] / [`LbfgsbMinimizer`]: bounded quasi-Newton steps and
//!   Hessian-based covariance.
//! - [`FitEngine`]: the `Initialized → Running → {Converged, Failed,
//!   MaxIterationsExceeded}` state machine.
//! - [`BenchmarkHarness`]: sequential timed fits across backends.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod covariance;
pub mod fit;
pub mod harness;
pub mod lbfgs;
pub mod objective;
pub mod optimizer;

pub use fit::{FitConfig, FitEngine, FitState, MAX_RESTARTS};
pub use harness::{BenchmarkEntry, BenchmarkHarness, BenchmarkReport, HarnessConfig, RunOutcome};
pub use lbfgs::LbfgsbMinimizer;
pub use objective::{LikelihoodObjective, NON_FINITE_PENALTY};
pub use optimizer::{Minimizer, ObjectiveFunction, StepOutcome};
