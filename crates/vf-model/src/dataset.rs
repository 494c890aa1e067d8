//! Columnar event storage for likelihood evaluation.

use crate::node::Observable;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use vf_core::{Error, Result};

/// Column-oriented, immutable set of observable values (Structure-of-Arrays).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    n_rows: usize,
    observables: Vec<Observable>,
    columns: Vec<Vec<f64>>,
    #[serde(skip)]
    name_to_index: HashMap<String, usize>,
}

impl Dataset {
    /// Create a [`Dataset`] from already materialized columns.
    ///
    /// `observables` defines which columns are required and their bounds. Extra
    /// columns are ignored. Every value must be finite and inside its bounds.
    pub fn from_columns(
        observables: Vec<Observable>,
        columns: impl IntoIterator<Item = (String, Vec<f64>)>,
    ) -> Result<Self> {
        if observables.is_empty() {
            return Err(Error::Validation("Dataset requires at least one observable".into()));
        }

        let mut by_name: BTreeMap<String, Vec<f64>> = columns.into_iter().collect();
        let mut cols = Vec::with_capacity(observables.len());
        let mut name_to_index = HashMap::with_capacity(observables.len());
        let mut n_rows: Option<usize> = None;

        for (i, obs) in observables.iter().enumerate() {
            let (lo, hi) = obs.bounds;
            if !(lo < hi) {
                return Err(Error::InvalidBounds { name: obs.name.clone(), lower: lo, upper: hi });
            }
            let col = by_name
                .remove(&obs.name)
                .ok_or_else(|| Error::Validation(format!("missing column '{}'", obs.name)))?;
            match n_rows {
                None => n_rows = Some(col.len()),
                Some(n) if n != col.len() => {
                    return Err(Error::Validation(format!(
                        "column length mismatch for '{}': expected {n}, got {}",
                        obs.name,
                        col.len()
                    )));
                }
                Some(_) => {}
            }
            if let Some((row, &x)) =
                col.iter().enumerate().find(|&(_, &x)| !(x.is_finite() && x >= lo && x <= hi))
            {
                return Err(Error::Validation(format!(
                    "column '{}' row {row}: value {x} outside [{lo}, {hi}]",
                    obs.name
                )));
            }
            if name_to_index.insert(obs.name.clone(), i).is_some() {
                return Err(Error::DuplicateName { name: obs.name.clone() });
            }
            cols.push(col);
        }

        Ok(Self { n_rows: n_rows.unwrap_or(0), observables, columns: cols, name_to_index })
    }

    /// Number of rows (events).
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Whether the dataset has no rows.
    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    /// Observables in column order.
    pub fn observables(&self) -> &[Observable] {
        &self.observables
    }

    /// Column by observable name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        let idx = match self.name_to_index.get(name) {
            Some(&i) => i,
            // Deserialized datasets have no index; fall back to a scan.
            None => self.observables.iter().position(|o| o.name == name)?,
        };
        Some(&self.columns[idx])
    }

    /// Bounds of an observable.
    pub fn bounds(&self, name: &str) -> Option<(f64, f64)> {
        self.observables.iter().find(|o| o.name == name).map(|o| o.bounds)
    }

    /// SHA-256 over the column names and little-endian value bytes.
    ///
    /// Two datasets have the same digest iff they are byte-identical.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (obs, col) in self.observables.iter().zip(&self.columns) {
            hasher.update(obs.name.as_bytes());
            hasher.update([0u8]);
            for v in col {
                hasher.update(v.to_le_bytes());
            }
        }
        hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
    }
}
