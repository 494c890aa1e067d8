//! Eager validation of a [`ModelSpec`] into a density DAG.

use crate::node::{DensityNode, LeafNode, Observable, ParamRef, SumNode, SumTerm};
use crate::pdf::{PdfKind, leaf_for};
use crate::spec::{
    ModelSpec, NodeKindSpec, NodeSpec, ObservableSpec, ParameterSpec, SumTermSpec,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use vf_core::{Error, Parameter, ParameterSet, Result};

/// A validated model: the DAG root plus the parameter set it indexes into.
#[derive(Debug, Clone)]
pub struct Model {
    /// Root density.
    pub root: Arc<DensityNode>,
    /// Parameters referenced by the DAG (declaration order).
    pub parameters: ParameterSet,
}

impl Model {
    /// Observable of the root node.
    pub fn observable(&self) -> &Observable {
        self.root.observable()
    }

    /// Split into `(root, parameters)`.
    pub fn into_parts(self) -> (Arc<DensityNode>, ParameterSet) {
        (self.root, self.parameters)
    }
}

/// Assembles a [`Model`] from a spec.
///
/// All names share one namespace (observables, parameters, nodes). Validation
/// is complete before anything is returned: unknown symbols, duplicate names,
/// inverted bounds, negative coefficients, cycles and mixed observables are
/// construction errors.
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    spec: ModelSpec,
}

impl ModelBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder over an existing spec.
    pub fn from_spec(spec: ModelSpec) -> Self {
        Self { spec }
    }

    /// Declare an observable.
    pub fn observable(mut self, name: &str, bounds: (f64, f64)) -> Self {
        self.spec.observables.push(ObservableSpec { name: name.into(), bounds });
        self
    }

    /// Declare a free parameter.
    pub fn free(mut self, name: &str, value: f64, bounds: (f64, f64)) -> Self {
        self.spec.parameters.push(ParameterSpec { name: name.into(), value, bounds: Some(bounds) });
        self
    }

    /// Declare a constant.
    pub fn constant(mut self, name: &str, value: f64) -> Self {
        self.spec.parameters.push(ParameterSpec { name: name.into(), value, bounds: None });
        self
    }

    /// Declare a Gaussian leaf.
    pub fn gaussian(self, name: &str, observable: &str, mean: &str, sigma: &str) -> Self {
        self.node(
            name,
            NodeKindSpec::Gaussian {
                observable: observable.into(),
                mean: mean.into(),
                sigma: sigma.into(),
            },
        )
    }

    /// Declare an exponential leaf.
    pub fn exponential(self, name: &str, observable: &str, rate: &str) -> Self {
        self.node(name, NodeKindSpec::Exponential { observable: observable.into(), rate: rate.into() })
    }

    /// Declare a polynomial leaf.
    pub fn polynomial(self, name: &str, observable: &str, coefficients: &[&str]) -> Self {
        let coefficients = coefficients.iter().map(|c| c.to_string()).collect();
        self.node(name, NodeKindSpec::Polynomial { observable: observable.into(), coefficients })
    }

    /// Declare a gamma leaf.
    pub fn gamma(self, name: &str, observable: &str, gamma: &str, beta: &str, mu: &str) -> Self {
        self.node(
            name,
            NodeKindSpec::Gamma {
                observable: observable.into(),
                gamma: gamma.into(),
                beta: beta.into(),
                mu: mu.into(),
            },
        )
    }

    /// Declare a weighted sum of `(coefficient, node)` pairs.
    pub fn sum(self, name: &str, terms: &[(&str, &str)], extended: bool) -> Self {
        let terms = terms
            .iter()
            .map(|(c, n)| SumTermSpec { coefficient: c.to_string(), node: n.to_string() })
            .collect();
        self.node(name, NodeKindSpec::Sum { terms, extended })
    }

    /// Declare an arbitrary node.
    pub fn node(mut self, name: &str, kind: NodeKindSpec) -> Self {
        self.spec.nodes.push(NodeSpec { name: name.into(), kind });
        self
    }

    /// Select the root node (defaults to the last declared node).
    pub fn root(mut self, name: &str) -> Self {
        self.spec.root = Some(name.into());
        self
    }

    /// Spec accumulated so far.
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Validate and assemble.
    pub fn build(&self) -> Result<Model> {
        build(&self.spec)
    }
}

/// Validate `spec` and assemble the DAG and parameter set.
pub fn build(spec: &ModelSpec) -> Result<Model> {
    let mut namespace: HashSet<String> = HashSet::new();
    let mut claim = |name: &str| -> Result<()> {
        if name.is_empty() {
            return Err(Error::Validation("empty names are not allowed".into()));
        }
        if !namespace.insert(name.to_string()) {
            return Err(Error::DuplicateName { name: name.to_string() });
        }
        Ok(())
    };

    let mut observables: HashMap<&str, Observable> = HashMap::new();
    for obs in &spec.observables {
        claim(&obs.name)?;
        let (lower, upper) = obs.bounds;
        // A zero-width or unbounded domain cannot be normalized over.
        if !(lower.is_finite() && upper.is_finite() && lower < upper) {
            return Err(Error::InvalidBounds { name: obs.name.clone(), lower, upper });
        }
        observables.insert(&obs.name, Observable { name: obs.name.clone(), bounds: obs.bounds });
    }

    let mut parameters = ParameterSet::new();
    for p in &spec.parameters {
        claim(&p.name)?;
        let param = match p.bounds {
            Some(bounds) => Parameter::free(&p.name, p.value, bounds)?,
            None => Parameter::constant(&p.name, p.value)?,
        };
        parameters.insert(param)?;
    }

    let mut by_name: HashMap<&str, &NodeSpec> = HashMap::new();
    for node in &spec.nodes {
        claim(&node.name)?;
        by_name.insert(&node.name, node);
    }

    let root_name = spec
        .root_name()
        .ok_or_else(|| Error::Validation("model spec declares no nodes".into()))?;
    if !by_name.contains_key(root_name) {
        return Err(Error::UnknownReference {
            kind: "node",
            name: root_name.to_string(),
            referenced_by: "root".into(),
        });
    }

    // The Poisson yield term is attached to the root only.
    for node in &spec.nodes {
        if let NodeKindSpec::Sum { extended: true, .. } = &node.kind
            && node.name != root_name
        {
            return Err(Error::Validation(format!(
                "sum '{}' is extended but only the root sum '{root_name}' may carry yields",
                node.name
            )));
        }
    }

    let mut assembler =
        Assembler { by_name, observables, parameters: &parameters, done: HashMap::new() };
    // Every declared node is validated, reachable from the root or not.
    for node in &spec.nodes {
        assembler.assemble(&node.name, &mut Vec::new())?;
    }
    let root = Arc::clone(&assembler.done[root_name]);

    log::debug!(
        "built model '{}' over '{}': {} nodes, {} parameters ({} free)",
        root.name(),
        root.observable().name,
        root.node_names().len(),
        parameters.len(),
        parameters.n_free()
    );

    Ok(Model { root, parameters })
}

struct Assembler<'a> {
    by_name: HashMap<&'a str, &'a NodeSpec>,
    observables: HashMap<&'a str, Observable>,
    parameters: &'a ParameterSet,
    done: HashMap<String, Arc<DensityNode>>,
}

impl<'a> Assembler<'a> {
    fn param_ref(&self, name: &str, node: &str) -> Result<ParamRef> {
        let index = self.parameters.index_of(name).ok_or_else(|| Error::UnknownReference {
            kind: "parameter",
            name: name.to_string(),
            referenced_by: node.to_string(),
        })?;
        Ok(ParamRef { name: name.to_string(), index })
    }

    fn observable(&self, name: &str, node: &str) -> Result<Observable> {
        self.observables.get(name).cloned().ok_or_else(|| Error::UnknownReference {
            kind: "observable",
            name: name.to_string(),
            referenced_by: node.to_string(),
        })
    }

    fn assemble(&mut self, name: &str, path: &mut Vec<String>) -> Result<Arc<DensityNode>> {
        if let Some(done) = self.done.get(name) {
            return Ok(Arc::clone(done));
        }
        if path.iter().any(|p| p == name) {
            return Err(Error::Validation(format!(
                "cycle in model graph: {} -> {name}",
                path.join(" -> ")
            )));
        }
        let referenced_by = path.last().cloned().unwrap_or_else(|| "root".into());
        let spec = *self.by_name.get(name).ok_or_else(|| Error::UnknownReference {
            kind: "node",
            name: name.to_string(),
            referenced_by,
        })?;

        path.push(name.to_string());
        let node = match &spec.kind {
            NodeKindSpec::Sum { terms, extended } => {
                self.assemble_sum(spec, terms, *extended, path)?
            }
            _ => self.assemble_leaf(spec)?,
        };
        path.pop();

        let node = Arc::new(node);
        self.done.insert(name.to_string(), Arc::clone(&node));
        Ok(node)
    }

    fn assemble_leaf(&self, spec: &NodeSpec) -> Result<DensityNode> {
        let kind = match &spec.kind {
            NodeKindSpec::Gaussian { .. } => PdfKind::Gaussian,
            NodeKindSpec::Exponential { .. } => PdfKind::Exponential,
            NodeKindSpec::Polynomial { .. } => PdfKind::Polynomial,
            NodeKindSpec::Gamma { .. } => PdfKind::Gamma,
            NodeKindSpec::Sum { .. } => {
                return Err(Error::Validation(format!("'{}' is not a leaf", spec.name)));
            }
        };
        let obs_name = spec.observable().unwrap_or_default();
        let observable = self.observable(obs_name, &spec.name)?;
        let params = spec
            .parameter_refs()
            .into_iter()
            .map(|p| self.param_ref(p, &spec.name))
            .collect::<Result<Vec<_>>>()?;

        let pdf = leaf_for(kind, params.len());
        if pdf.n_params() != params.len() {
            return Err(Error::Validation(format!(
                "{:?} leaf '{}' expects {} parameters, got {}",
                kind,
                spec.name,
                pdf.n_params(),
                params.len()
            )));
        }
        Ok(DensityNode::Leaf(LeafNode { name: spec.name.clone(), observable, pdf, params }))
    }

    fn assemble_sum(
        &mut self,
        spec: &NodeSpec,
        terms: &[SumTermSpec],
        extended: bool,
        path: &mut Vec<String>,
    ) -> Result<DensityNode> {
        if terms.is_empty() {
            return Err(Error::Validation(format!("sum '{}' has no terms", spec.name)));
        }
        let mut out = Vec::with_capacity(terms.len());
        for term in terms {
            let coefficient = self.param_ref(&term.coefficient, &spec.name)?;
            let param = self.parameters.at(coefficient.index).ok_or_else(|| {
                Error::Computation(format!("parameter index {} out of range", coefficient.index))
            })?;
            let (lower, upper) = param.bounds();
            if lower < 0.0 {
                return Err(Error::InvalidBounds { name: coefficient.name, lower, upper });
            }
            let child = self.assemble(&term.node, path)?;
            out.push(SumTerm { coefficient, child });
        }

        let first = out[0].child.observable().clone();
        for t in &out[1..] {
            let obs = t.child.observable();
            if obs != &first {
                return Err(Error::Validation(format!(
                    "sum '{}' mixes observables '{}' and '{}'",
                    spec.name, first.name, obs.name
                )));
            }
        }
        Ok(DensityNode::WeightedSum(SumNode { name: spec.name.clone(), terms: out, extended }))
    }
}
