//! Named scalar parameters with bounds.
//!
//! A [`ParameterSet`] is the single owner of parameter values: density nodes
//! refer into it by index, the generator reads a snapshot of it and the fit
//! engine mutates it in place.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One named model parameter.
///
/// Invariant: `lower <= value <= upper`. Constants carry `lower == upper == value`
/// and never enter the free-parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    value: f64,
    lower: f64,
    upper: f64,
    constant: bool,
}

impl Parameter {
    /// A floating parameter restricted to `[lower, upper]`.
    ///
    /// The initial value is clamped into range. Non-finite or inverted
    /// bounds are rejected with [`Error::InvalidBounds`]. A zero-width range
    /// yields a constant.
    pub fn free(name: impl Into<String>, value: f64, bounds: (f64, f64)) -> Result<Self> {
        let name = name.into();
        let (lower, upper) = bounds;
        if !lower.is_finite() || !upper.is_finite() || lower > upper {
            return Err(Error::InvalidBounds { name, lower, upper });
        }
        if !value.is_finite() {
            return Err(Error::Validation(format!(
                "parameter '{name}' has non-finite initial value {value}"
            )));
        }
        let clamped = value.clamp(lower, upper);
        if clamped != value {
            log::warn!("parameter '{name}': initial value {value} clamped to {clamped}");
        }
        Ok(Self { name, value: clamped, lower, upper, constant: lower == upper })
    }

    /// A fixed value that participates in evaluation but is never fitted.
    pub fn constant(name: impl Into<String>, value: f64) -> Result<Self> {
        let name = name.into();
        if !value.is_finite() {
            return Err(Error::Validation(format!("constant '{name}' must be finite, got {value}")));
        }
        Ok(Self { name, value, lower: value, upper: value, constant: true })
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// `(lower, upper)` bounds.
    pub fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    /// Whether the parameter is part of the free vector.
    pub fn is_free(&self) -> bool {
        !self.constant
    }

    /// Set the value, clamping into bounds. Returns the stored value.
    ///
    /// Constants ignore the request.
    pub fn set_value(&mut self, value: f64) -> f64 {
        if !self.constant && !value.is_nan() {
            self.value = value.clamp(self.lower, self.upper);
        }
        self.value
    }
}

/// Mapping name -> [`Parameter`] with stable, declaration-ordered indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Parameter>", into = "Vec<Parameter>")]
pub struct ParameterSet {
    params: Vec<Parameter>,
    index: HashMap<String, usize>,
}

impl ParameterSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter; fails with [`Error::DuplicateName`] if the name is taken.
    pub fn insert(&mut self, param: Parameter) -> Result<usize> {
        if self.index.contains_key(param.name()) {
            return Err(Error::DuplicateName { name: param.name });
        }
        let idx = self.params.len();
        self.index.insert(param.name.clone(), idx);
        self.params.push(param);
        Ok(idx)
    }

    /// Number of parameters (free and constant).
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Look up by name.
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&i| &self.params[i])
    }

    /// Parameter at a stable index.
    pub fn at(&self, idx: usize) -> Option<&Parameter> {
        self.params.get(idx)
    }

    /// Stable index of a name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Iterate in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Current value of a named parameter.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.get(name).map(Parameter::value)
    }

    /// All values, indexed like the set.
    pub fn values(&self) -> Vec<f64> {
        self.params.iter().map(Parameter::value).collect()
    }

    /// Set a named value (clamped). Returns the stored value.
    pub fn set_value(&mut self, name: &str, value: f64) -> Result<f64> {
        let idx = self.index_of(name).ok_or_else(|| Error::UnknownReference {
            kind: "parameter",
            name: name.to_string(),
            referenced_by: "ParameterSet::set_value".into(),
        })?;
        Ok(self.params[idx].set_value(value))
    }

    /// Indices of free parameters, in declaration order.
    pub fn free_indices(&self) -> Vec<usize> {
        self.params.iter().enumerate().filter(|(_, p)| p.is_free()).map(|(i, _)| i).collect()
    }

    /// Number of free parameters.
    pub fn n_free(&self) -> usize {
        self.params.iter().filter(|p| p.is_free()).count()
    }

    /// Free parameter names.
    pub fn free_names(&self) -> Vec<String> {
        self.params.iter().filter(|p| p.is_free()).map(|p| p.name.clone()).collect()
    }

    /// Free parameter values.
    pub fn free_values(&self) -> Vec<f64> {
        self.params.iter().filter(|p| p.is_free()).map(Parameter::value).collect()
    }

    /// Free parameter bounds.
    pub fn free_bounds(&self) -> Vec<(f64, f64)> {
        self.params.iter().filter(|p| p.is_free()).map(Parameter::bounds).collect()
    }

    /// Overwrite the free vector (clamped into bounds).
    pub fn set_free_values(&mut self, values: &[f64]) -> Result<()> {
        let n_free = self.n_free();
        if values.len() != n_free {
            return Err(Error::Validation(format!(
                "free vector length mismatch: expected {n_free}, got {}",
                values.len()
            )));
        }
        for (p, &v) in self.params.iter_mut().filter(|p| p.is_free()).zip(values) {
            p.set_value(v);
        }
        Ok(())
    }

    /// Expand a free vector into a full value vector, taking constants from `self`.
    pub fn expand_free(&self, free: &[f64]) -> Result<Vec<f64>> {
        let mut out = self.values();
        self.expand_free_into(free, &mut out)?;
        Ok(out)
    }

    /// Like [`Self::expand_free`], writing into a caller-owned buffer.
    pub fn expand_free_into(&self, free: &[f64], out: &mut [f64]) -> Result<()> {
        if out.len() != self.params.len() {
            return Err(Error::Validation(format!(
                "value buffer length mismatch: expected {}, got {}",
                self.params.len(),
                out.len()
            )));
        }
        let mut it = free.iter();
        for (slot, p) in out.iter_mut().zip(&self.params) {
            if p.is_free() {
                let v = it.next().ok_or_else(|| {
                    Error::Validation(format!("free vector too short at '{}'", p.name))
                })?;
                *slot = *v;
            } else {
                *slot = p.value;
            }
        }
        if it.next().is_some() {
            return Err(Error::Validation("free vector too long".into()));
        }
        Ok(())
    }
}

impl TryFrom<Vec<Parameter>> for ParameterSet {
    type Error = Error;

    fn try_from(params: Vec<Parameter>) -> Result<Self> {
        let mut set = ParameterSet::new();
        for p in params {
            set.insert(p)?;
        }
        Ok(set)
    }
}

impl From<ParameterSet> for Vec<Parameter> {
    fn from(set: ParameterSet) -> Self {
        set.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> ParameterSet {
        let mut set = ParameterSet::new();
        set.insert(Parameter::free("mean", 10.0, (0.0, 20.0)).unwrap()).unwrap();
        set.insert(Parameter::constant("m0", 0.0).unwrap()).unwrap();
        set.insert(Parameter::free("sigma", 2.0, (0.1, 10.0)).unwrap()).unwrap();
        set
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let err = Parameter::free("a", 0.0, (1.0, -1.0)).unwrap_err();
        assert!(matches!(err, Error::InvalidBounds { .. }));
        let err = Parameter::free("a", 0.0, (f64::NEG_INFINITY, 1.0)).unwrap_err();
        assert!(matches!(err, Error::InvalidBounds { .. }));
    }

    #[test]
    fn test_initial_value_clamped() {
        let p = Parameter::free("a", 5.0, (0.0, 1.0)).unwrap();
        assert_eq!(p.value(), 1.0);
        let p = Parameter::free("b", 0.5, (0.5, 0.5)).unwrap();
        assert!(!p.is_free());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut set = sample_set();
        let err = set.insert(Parameter::constant("mean", 1.0).unwrap()).unwrap_err();
        assert!(matches!(err, Error::DuplicateName { name } if name == "mean"));
    }

    #[test]
    fn test_free_vector_roundtrip() {
        let mut set = sample_set();
        assert_eq!(set.n_free(), 2);
        assert_eq!(set.free_names(), vec!["mean".to_string(), "sigma".to_string()]);
        set.set_free_values(&[12.0, 50.0]).unwrap();
        assert_eq!(set.value("mean"), Some(12.0));
        assert_eq!(set.value("sigma"), Some(10.0));
        assert_eq!(set.expand_free(&[1.0, 2.0]).unwrap(), vec![1.0, 0.0, 2.0]);
        assert!(set.set_free_values(&[1.0]).is_err());
    }

    #[test]
    fn test_constant_ignores_set_value() {
        let mut set = sample_set();
        assert_eq!(set.set_value("m0", 3.0).unwrap(), 0.0);
        assert!(matches!(set.set_value("nope", 1.0), Err(Error::UnknownReference { .. })));
    }

    #[test]
    fn test_serde_roundtrip_rebuilds_index() {
        let set = sample_set();
        let json = serde_json::to_string(&set).unwrap();
        let back: ParameterSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index_of("sigma"), Some(2));
        assert_eq!(back, set);
    }
}
