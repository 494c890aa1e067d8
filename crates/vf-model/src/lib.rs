//! # vf-model
//!
//! Probability models for vecfit.
//!
//! This crate provides:
//! - Univariate density leaves (Gaussian, exponential, polynomial, gamma) that
//!   renormalize themselves over the observable's declared range.
//! - A [`DensityNode`] DAG with weighted sums, and its flattened [`EvalPlan`]
//!   consumed by the evaluation backends.
//! - A [`ModelBuilder`] that validates a structured [`ModelSpec`] (YAML/JSON or
//!   factory string) eagerly.
//! - A columnar [`Dataset`] and a seeded [`DataGenerator`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod dataset;
pub mod factory;
pub mod generate;
pub mod node;
pub mod normalize;
pub mod pdf;
pub mod presets;
pub mod spec;

mod math;

pub use builder::{Model, ModelBuilder, build};
pub use dataset::Dataset;
pub use generate::{DataGenerator, randomise_parameters, rng_from_seed};
pub use node::{DensityNode, EvalPlan, Observable, PlanLeaf, PlanStep, ResolvedPlan};
pub use normalize::NormCache;
pub use pdf::{PdfKind, UnivariatePdf};
pub use spec::{ModelSpec, NodeKindSpec, NodeSpec};

#[cfg(test)]
mod tests;
