//! Structured model specification.
//!
//! A [`ModelSpec`] is the declarative input to [`crate::ModelBuilder`]. It is
//! plain data: names are not resolved until the builder validates the whole
//! document. YAML and JSON are both accepted.
//!
//! ```yaml
//! observables:
//!   - { name: x, bounds: [0, 20] }
//! parameters:
//!   - { name: mean, value: 10, bounds: [0, 20] }
//!   - { name: sigma, value: 2, bounds: [0.1, 10] }
//!   - { name: rate, value: 0.1, bounds: [0.001, 1] }
//!   - { name: f_gauss, value: 0.2, bounds: [0, 1] }
//!   - { name: f_exp, value: 0.8 }
//! nodes:
//!   - { name: gauss, kind: gaussian, observable: x, mean: mean, sigma: sigma }
//!   - { name: expo, kind: exponential, observable: x, rate: rate }
//!   - name: model
//!     kind: sum
//!     terms:
//!       - { coefficient: f_gauss, node: gauss }
//!       - { coefficient: f_exp, node: expo }
//! root: model
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use vf_core::{Error, Result};

/// Observable declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservableSpec {
    /// Observable (column) name.
    pub name: String,
    /// Domain `[low, high]`.
    pub bounds: (f64, f64),
}

/// Parameter declaration. Without `bounds` the parameter is a constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: String,
    /// Initial value.
    pub value: f64,
    /// Allowed range for a free parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<(f64, f64)>,
}

/// One weighted-sum term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SumTermSpec {
    /// Coefficient parameter name.
    pub coefficient: String,
    /// Child node name.
    pub node: String,
}

/// Node body, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKindSpec {
    /// Truncated Gaussian.
    Gaussian {
        /// Observable name.
        observable: String,
        /// Mean parameter name.
        mean: String,
        /// Width parameter name.
        sigma: String,
    },
    /// Truncated exponential `exp(-rate x)`.
    Exponential {
        /// Observable name.
        observable: String,
        /// Rate parameter name.
        rate: String,
    },
    /// `1 + Σ a_i x^i`.
    Polynomial {
        /// Observable name.
        observable: String,
        /// Coefficient parameter names, lowest order first.
        #[serde(default)]
        coefficients: Vec<String>,
    },
    /// Shifted gamma density.
    Gamma {
        /// Observable name.
        observable: String,
        /// Shape parameter name.
        gamma: String,
        /// Scale parameter name.
        beta: String,
        /// Shift parameter name.
        mu: String,
    },
    /// Weighted sum of other nodes.
    Sum {
        /// Ordered terms.
        terms: Vec<SumTermSpec>,
        /// Coefficients are expected yields.
        #[serde(default)]
        extended: bool,
    },
}

/// Named node declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node name.
    pub name: String,
    /// Node body.
    #[serde(flatten)]
    pub kind: NodeKindSpec,
}

impl NodeSpec {
    /// Every parameter name the node refers to, in positional order.
    pub fn parameter_refs(&self) -> Vec<&str> {
        match &self.kind {
            NodeKindSpec::Gaussian { mean, sigma, .. } => vec![mean.as_str(), sigma.as_str()],
            NodeKindSpec::Exponential { rate, .. } => vec![rate.as_str()],
            NodeKindSpec::Polynomial { coefficients, .. } => {
                coefficients.iter().map(String::as_str).collect()
            }
            NodeKindSpec::Gamma { gamma, beta, mu, .. } => {
                vec![gamma.as_str(), beta.as_str(), mu.as_str()]
            }
            NodeKindSpec::Sum { terms, .. } => {
                terms.iter().map(|t| t.coefficient.as_str()).collect()
            }
        }
    }

    /// Observable of a leaf node (`None` for sums).
    pub fn observable(&self) -> Option<&str> {
        match &self.kind {
            NodeKindSpec::Gaussian { observable, .. }
            | NodeKindSpec::Exponential { observable, .. }
            | NodeKindSpec::Polynomial { observable, .. }
            | NodeKindSpec::Gamma { observable, .. } => Some(observable.as_str()),
            NodeKindSpec::Sum { .. } => None,
        }
    }
}

/// Complete model document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    /// Observables.
    #[serde(default)]
    pub observables: Vec<ObservableSpec>,
    /// Parameters.
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Nodes, in any order.
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Root node; defaults to the last declared node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl ModelSpec {
    /// Parse a YAML or JSON document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_yaml_ng::from_slice(bytes)
            .map_err(|e| Error::Validation(format!("failed to parse model spec: {e}")))
    }

    /// Read and parse a YAML or JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_slice(&bytes)
    }

    /// Name of the root node.
    pub fn root_name(&self) -> Option<&str> {
        self.root.as_deref().or_else(|| self.nodes.last().map(|n| n.name.as_str()))
    }

    /// Override the initial value of a declared parameter.
    pub fn set_initial(&mut self, name: &str, value: f64) -> Result<()> {
        let p = self.parameters.iter_mut().find(|p| p.name == name).ok_or_else(|| {
            Error::UnknownReference {
                kind: "parameter",
                name: name.to_string(),
                referenced_by: "ModelSpec::set_initial".into(),
            }
        })?;
        p.value = value;
        Ok(())
    }
}
