//! # vf-compute
//!
//! Likelihood evaluation backends for vecfit.
//!
//! Every backend evaluates the same [`vf_model::EvalPlan`] over a
//! [`vf_model::Dataset`]; they differ only in how events are traversed:
//!
//! - [`ScalarBackend`]: one event at a time, the reference path.
//! - [`VectorizedCpuBackend`]: column-at-a-time blocks, `wide` SIMD kernels,
//!   Rayon across blocks.
//! - `CudaBackend` (feature `cuda`): column-at-a-time on a CUDA device.
//!
//! Use [`select`] to obtain a backend by [`BackendKind`]. Requesting the GPU
//! strategy on a machine or build without CUDA yields
//! [`vf_core::Error::BackendUnavailable`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod gpu_types;
pub mod scalar;
pub mod simd;
pub mod vectorized;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use backend::{BackendKind, EvaluationBackend, PreparedEvaluation, select};
pub use gpu_types::GpuProgram;
pub use scalar::ScalarBackend;
pub use vectorized::VectorizedCpuBackend;

#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;
