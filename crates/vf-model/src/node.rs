//! Density DAG and its flattened evaluation plan.

use crate::normalize::{NormCache, normalization};
use crate::pdf::{PdfKind, UnivariatePdf};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A bounded observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observable {
    /// Column name.
    pub name: String,
    /// Declared domain `(low, high)`; every leaf renormalizes over it.
    pub bounds: (f64, f64),
}

/// Reference by name into the shared [`vf_core::ParameterSet`], resolved to its index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRef {
    /// Parameter name.
    pub name: String,
    /// Stable index in the parameter set.
    pub index: usize,
}

/// Elementary density over one observable.
#[derive(Debug, Clone)]
pub struct LeafNode {
    /// Node name.
    pub name: String,
    /// Observable the leaf is defined on.
    pub observable: Observable,
    /// Shape implementation.
    pub pdf: Arc<dyn UnivariatePdf>,
    /// Shape parameters, in the order the pdf expects them.
    pub params: Vec<ParamRef>,
}

/// One `(coefficient, child)` pair of a weighted sum.
#[derive(Debug, Clone)]
pub struct SumTerm {
    /// Non-negative coefficient parameter.
    pub coefficient: ParamRef,
    /// Child density.
    pub child: Arc<DensityNode>,
}

/// Mixture `Σ c_i f_i / Σ c_i`.
#[derive(Debug, Clone)]
pub struct SumNode {
    /// Node name.
    pub name: String,
    /// Ordered terms.
    pub terms: Vec<SumTerm>,
    /// Coefficients are expected yields; the likelihood adds a Poisson term.
    pub extended: bool,
}

/// Polymorphic density node.
#[derive(Debug, Clone)]
pub enum DensityNode {
    /// Elementary density.
    Leaf(LeafNode),
    /// Weighted mixture of child nodes.
    WeightedSum(SumNode),
}

impl DensityNode {
    /// Node name.
    pub fn name(&self) -> &str {
        match self {
            DensityNode::Leaf(l) => &l.name,
            DensityNode::WeightedSum(s) => &s.name,
        }
    }

    /// Observable this node is defined on.
    pub fn observable(&self) -> &Observable {
        match self {
            DensityNode::Leaf(l) => &l.observable,
            // Sums are never empty and all children share one observable.
            DensityNode::WeightedSum(s) => s.terms[0].child.observable(),
        }
    }

    /// Whether this node's coefficients are expected yields.
    pub fn is_extended(&self) -> bool {
        matches!(self, DensityNode::WeightedSum(s) if s.extended)
    }

    /// Normalized density at `x` for the full value vector `values`.
    ///
    /// Recomputes every normalization integral; intended for tests and
    /// diagnostics rather than likelihood loops (use [`EvalPlan`] there).
    pub fn density(&self, x: f64, values: &[f64]) -> f64 {
        match self {
            DensityNode::Leaf(l) => {
                let p: Vec<f64> = l.params.iter().map(|r| values[r.index]).collect();
                let norm = normalization(l.pdf.as_ref(), &p, l.observable.bounds);
                l.pdf.unnormalized(x, &p) / norm
            }
            DensityNode::WeightedSum(s) => {
                let mut num = 0.0;
                let mut den = 0.0;
                for t in &s.terms {
                    let c = values[t.coefficient.index];
                    num += c * t.child.density(x, values);
                    den += c;
                }
                num / den
            }
        }
    }

    /// Flatten into a post-order [`EvalPlan`]. Shared sub-nodes appear once.
    pub fn plan(&self) -> EvalPlan {
        let mut plan = EvalPlan {
            steps: Vec::new(),
            leaves: Vec::new(),
            observable: self.observable().clone(),
            yield_indices: None,
        };
        let mut seen: HashMap<String, usize> = HashMap::new();
        flatten(self, &mut plan, &mut seen);
        if let DensityNode::WeightedSum(s) = self
            && s.extended
        {
            plan.yield_indices = Some(s.terms.iter().map(|t| t.coefficient.index).collect());
        }
        plan
    }

    /// Names of all nodes reachable from here (post-order, deduplicated).
    pub fn node_names(&self) -> Vec<String> {
        self.plan().steps.iter().map(|s| s.name().to_string()).collect()
    }
}

fn flatten(node: &DensityNode, plan: &mut EvalPlan, seen: &mut HashMap<String, usize>) -> usize {
    if let Some(&slot) = seen.get(node.name()) {
        return slot;
    }
    let step = match node {
        DensityNode::Leaf(l) => {
            let leaf = plan.leaves.len();
            plan.leaves.push(PlanLeaf {
                name: l.name.clone(),
                pdf: Arc::clone(&l.pdf),
                param_indices: l.params.iter().map(|r| r.index).collect(),
            });
            PlanStep::Leaf { name: l.name.clone(), leaf }
        }
        DensityNode::WeightedSum(s) => {
            let terms = s
                .terms
                .iter()
                .map(|t| (t.coefficient.index, flatten(&t.child, plan, seen)))
                .collect();
            PlanStep::Sum { name: s.name.clone(), terms }
        }
    };
    let slot = plan.steps.len();
    plan.steps.push(step);
    seen.insert(node.name().to_string(), slot);
    slot
}

/// A leaf as seen by the evaluation backends.
#[derive(Debug, Clone)]
pub struct PlanLeaf {
    /// Node name.
    pub name: String,
    /// Shape implementation.
    pub pdf: Arc<dyn UnivariatePdf>,
    /// Indices of the leaf's parameters in the full value vector.
    pub param_indices: Vec<usize>,
}

impl PlanLeaf {
    /// Leaf kind.
    pub fn kind(&self) -> PdfKind {
        self.pdf.kind()
    }

    /// Gather this leaf's parameters from the full value vector.
    pub fn gather(&self, values: &[f64]) -> Vec<f64> {
        self.param_indices.iter().map(|&i| values[i]).collect()
    }
}

/// One evaluation step. Its output lands in the slot equal to its position.
#[derive(Debug, Clone)]
pub enum PlanStep {
    /// Normalized leaf density.
    Leaf {
        /// Node name.
        name: String,
        /// Index into [`EvalPlan::leaves`].
        leaf: usize,
    },
    /// Coefficient-weighted average of earlier slots.
    Sum {
        /// Node name.
        name: String,
        /// `(coefficient parameter index, child slot)`.
        terms: Vec<(usize, usize)>,
    },
}

impl PlanStep {
    /// Node name.
    pub fn name(&self) -> &str {
        match self {
            PlanStep::Leaf { name, .. } | PlanStep::Sum { name, .. } => name,
        }
    }
}

/// Post-order flattening of a density DAG.
///
/// Children always precede their parents, so evaluating `steps` in order
/// fills each slot before it is read. The root is the last step.
#[derive(Debug, Clone)]
pub struct EvalPlan {
    /// Steps in evaluation order.
    pub steps: Vec<PlanStep>,
    /// Distinct leaves; the position is the leaf id used by the norm cache.
    pub leaves: Vec<PlanLeaf>,
    /// Observable shared by every node.
    pub observable: Observable,
    /// Coefficient indices of an extended root sum.
    pub yield_indices: Option<Vec<usize>>,
}

/// Per-evaluation constants resolved once before touching events.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    /// Gathered parameters per leaf.
    pub leaf_params: Vec<Vec<f64>>,
    /// `1 / normalization` per leaf.
    pub leaf_inv_norms: Vec<f64>,
    /// Per sum step: normalized weights `c_i / Σ c`, aligned with its terms.
    pub sum_weights: Vec<Vec<f64>>,
}

impl EvalPlan {
    /// Number of slots (= steps).
    pub fn n_slots(&self) -> usize {
        self.steps.len()
    }

    /// Slot of the root node.
    pub fn root_slot(&self) -> usize {
        self.steps.len() - 1
    }

    /// Resolve leaf parameters, normalization integrals (through `cache`) and
    /// sum weights for the value vector `values`.
    ///
    /// Invalid values are not rejected here: they surface as `NaN` densities.
    pub fn resolve(&self, values: &[f64], cache: &NormCache) -> ResolvedPlan {
        let mut leaf_params = Vec::with_capacity(self.leaves.len());
        let mut leaf_inv_norms = Vec::with_capacity(self.leaves.len());
        for (id, leaf) in self.leaves.iter().enumerate() {
            let p = leaf.gather(values);
            let norm = cache.get_or_compute(id, &p, || {
                normalization(leaf.pdf.as_ref(), &p, self.observable.bounds)
            });
            leaf_inv_norms.push(1.0 / norm);
            leaf_params.push(p);
        }

        let mut sum_weights = Vec::new();
        for step in &self.steps {
            if let PlanStep::Sum { terms, .. } = step {
                let total: f64 = terms.iter().map(|&(c, _)| values[c]).sum();
                sum_weights.push(terms.iter().map(|&(c, _)| values[c] / total).collect());
            }
        }
        ResolvedPlan { leaf_params, leaf_inv_norms, sum_weights }
    }

    /// Poisson term `ν - N ln ν` of an extended root, or 0.
    pub fn extended_term(&self, values: &[f64], n_events: usize) -> f64 {
        match &self.yield_indices {
            Some(idx) => {
                let nu: f64 = idx.iter().map(|&i| values[i]).sum();
                nu - n_events as f64 * nu.ln()
            }
            None => 0.0,
        }
    }

    /// Evaluate the normalized density of every slot at a single `x`.
    ///
    /// This is the row-at-a-time reference path.
    pub fn eval_point(&self, x: f64, resolved: &ResolvedPlan, slots: &mut [f64]) -> f64 {
        let mut sum_idx = 0;
        for (slot, step) in self.steps.iter().enumerate() {
            slots[slot] = match step {
                PlanStep::Leaf { leaf, .. } => {
                    let l = &self.leaves[*leaf];
                    l.pdf.unnormalized(x, &resolved.leaf_params[*leaf])
                        * resolved.leaf_inv_norms[*leaf]
                }
                PlanStep::Sum { terms, .. } => {
                    let w = &resolved.sum_weights[sum_idx];
                    sum_idx += 1;
                    terms.iter().zip(w).map(|(&(_, child), &wi)| wi * slots[child]).sum()
                }
            };
        }
        slots[self.root_slot()]
    }
}
