//! # vf-core
//!
//! Shared foundation of the vecfit workspace: the error taxonomy, the
//! [`ParameterSet`] that every other crate reads and mutates, and the
//! immutable [`FitResult`] produced by a completed fit.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod parameter;
pub mod types;

pub use error::{Error, Result};
pub use parameter::{Parameter, ParameterSet};
pub use types::{FitResult, FitStatus};
