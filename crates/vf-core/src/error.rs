//! Error types for vecfit

use thiserror::Error;

/// vecfit error type
#[derive(Error, Debug)]
pub enum Error {
    /// A model element references a symbol that was never declared.
    #[error("unknown {kind} '{name}' referenced by '{referenced_by}'")]
    UnknownReference {
        /// Symbol category (`parameter`, `node`, `observable`).
        kind: &'static str,
        /// The undeclared name.
        name: String,
        /// The element holding the reference.
        referenced_by: String,
    },

    /// Two parameters, nodes or observables share one name.
    #[error("duplicate name '{name}'")]
    DuplicateName {
        /// The clashing name.
        name: String,
    },

    /// A declared range has `lower > upper` (or is otherwise unusable).
    #[error("invalid bounds for '{name}': [{lower}, {upper}]")]
    InvalidBounds {
        /// Parameter or observable name.
        name: String,
        /// Lower bound as declared.
        lower: f64,
        /// Upper bound as declared.
        upper: f64,
    },

    /// Rejection sampling ran out of trials for one event.
    #[error("sampling exhausted for node '{node}' after {trials} trials")]
    SamplingExhausted {
        /// Density node being sampled.
        node: String,
        /// Number of proposals drawn for the failing event.
        trials: usize,
    },

    /// The requested evaluation backend cannot run in this process.
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable {
        /// Backend display name.
        backend: String,
        /// Why it could not be selected.
        reason: String,
    },

    /// An illegal state machine transition.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a caller may skip or retry the failing unit of work and carry on.
    ///
    /// `BackendUnavailable` is recovered by the benchmark harness (the
    /// configuration is reported as unavailable); `SamplingExhausted` may be
    /// retried by the caller with different bounds. Everything else is fatal
    /// to the operation that raised it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::BackendUnavailable { .. } | Error::SamplingExhausted { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
