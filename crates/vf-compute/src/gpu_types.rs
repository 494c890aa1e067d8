//! Flat plan encoding shared by the host and the CUDA kernel.
//!
//! A plan is lowered once into integer descriptors (`ops`, `terms`) that stay
//! on the device for the lifetime of a prepared evaluation. Per evaluation
//! only the `f64` constant buffer changes.
//!
//! Descriptor layout, four `u32` per step:
//!
//! | opcode | a | b | c |
//! |---|---|---|---|
//! | `OP_GAUSSIAN`..`OP_GAMMA` | param offset | n params | inv-norm offset |
//! | `OP_SUM` | first term | n terms | unused |
//!
//! Each term is a `(child slot, weight offset)` pair.

use vf_core::{Error, Result};
use vf_model::{EvalPlan, PdfKind, PlanStep, ResolvedPlan};

/// Normalized Gaussian leaf.
pub const OP_GAUSSIAN: u32 = 0;
/// Normalized exponential leaf.
pub const OP_EXPONENTIAL: u32 = 1;
/// Normalized polynomial leaf.
pub const OP_POLYNOMIAL: u32 = 2;
/// Normalized gamma leaf.
pub const OP_GAMMA: u32 = 3;
/// Weighted sum of earlier slots.
pub const OP_SUM: u32 = 10;

/// Per-thread slot array size in the kernel.
pub const MAX_SLOTS: usize = 32;

/// Device-ready encoding of an [`EvalPlan`].
#[derive(Debug, Clone, PartialEq)]
pub struct GpuProgram {
    /// Step descriptors, four words per step.
    pub ops: Vec<u32>,
    /// `(child slot, weight offset)` pairs.
    pub terms: Vec<u32>,
    /// Number of steps; the root is the last one.
    pub n_slots: usize,
    /// Length of the constant buffer.
    pub n_consts: usize,
    param_offsets: Vec<usize>,
    norm_offset: usize,
    weight_offset: usize,
}

impl GpuProgram {
    /// Lower `plan`. Fails if it needs more than [`MAX_SLOTS`] slots.
    pub fn lower(plan: &EvalPlan) -> Result<Self> {
        let n_slots = plan.n_slots();
        if n_slots > MAX_SLOTS {
            return Err(Error::Validation(format!(
                "model has {n_slots} nodes; the CUDA kernel supports at most {MAX_SLOTS}"
            )));
        }

        let mut param_offsets = Vec::with_capacity(plan.leaves.len());
        let mut cursor = 0;
        for leaf in &plan.leaves {
            param_offsets.push(cursor);
            cursor += leaf.param_indices.len();
        }
        let norm_offset = cursor;
        let weight_offset = norm_offset + plan.leaves.len();

        let mut ops = Vec::with_capacity(4 * n_slots);
        let mut terms = Vec::new();
        let mut weight_cursor = weight_offset;
        for step in &plan.steps {
            match step {
                PlanStep::Leaf { leaf, .. } => {
                    let l = &plan.leaves[*leaf];
                    let opcode = match l.kind() {
                        PdfKind::Gaussian => OP_GAUSSIAN,
                        PdfKind::Exponential => OP_EXPONENTIAL,
                        PdfKind::Polynomial => OP_POLYNOMIAL,
                        PdfKind::Gamma => OP_GAMMA,
                    };
                    ops.extend_from_slice(&[
                        opcode,
                        param_offsets[*leaf] as u32,
                        l.param_indices.len() as u32,
                        (norm_offset + leaf) as u32,
                    ]);
                }
                PlanStep::Sum { terms: t, .. } => {
                    ops.extend_from_slice(&[OP_SUM, (terms.len() / 2) as u32, t.len() as u32, 0]);
                    for &(_, child) in t {
                        terms.push(child as u32);
                        terms.push(weight_cursor as u32);
                        weight_cursor += 1;
                    }
                }
            }
        }

        Ok(Self {
            ops,
            terms,
            n_slots,
            n_consts: weight_cursor,
            param_offsets,
            norm_offset,
            weight_offset,
        })
    }

    /// Fill the constant buffer for one evaluation.
    pub fn pack_constants(&self, resolved: &ResolvedPlan, out: &mut Vec<f64>) {
        out.clear();
        out.resize(self.n_consts, 0.0);
        for (leaf, params) in resolved.leaf_params.iter().enumerate() {
            let o = self.param_offsets[leaf];
            out[o..o + params.len()].copy_from_slice(params);
        }
        let n = resolved.leaf_inv_norms.len();
        out[self.norm_offset..self.norm_offset + n].copy_from_slice(&resolved.leaf_inv_norms);
        let mut cursor = self.weight_offset;
        for weights in &resolved.sum_weights {
            out[cursor..cursor + weights.len()].copy_from_slice(weights);
            cursor += weights.len();
        }
    }

    /// Host interpreter of the descriptor stream, mirroring the kernel.
    #[cfg(test)]
    fn interpret(&self, x: f64, consts: &[f64], slots: &mut [f64]) -> f64 {
        for s in 0..self.n_slots {
            let op = &self.ops[4 * s..4 * s + 4];
            let (a, b, c) = (op[1] as usize, op[2] as usize, op[3] as usize);
            slots[s] = match op[0] {
                OP_GAUSSIAN => {
                    let z = (x - consts[a]) / consts[a + 1];
                    (-0.5 * z * z).exp() * consts[c]
                }
                OP_EXPONENTIAL => (-consts[a] * x).exp() * consts[c],
                OP_POLYNOMIAL => {
                    let mut acc = 0.0;
                    for k in (0..b).rev() {
                        acc = (acc + consts[a + k]) * x;
                    }
                    (1.0 + acc) * consts[c]
                }
                OP_SUM => (0..b)
                    .map(|k| {
                        let child = self.terms[2 * (a + k)] as usize;
                        consts[self.terms[2 * (a + k) + 1] as usize] * slots[child]
                    })
                    .sum(),
                _ => f64::NAN,
            };
        }
        slots[self.n_slots - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use vf_model::NormCache;
    use vf_model::presets::{gauss_exp_mixture, reference_spec};

    #[test]
    fn test_lowering_matches_eval_point() {
        let model = gauss_exp_mixture().build().unwrap();
        let values = model.parameters.values();
        let plan = model.root.plan();
        let program = GpuProgram::lower(&plan).unwrap();
        assert_eq!(program.n_slots, 3);
        assert_eq!(program.ops.len(), 12);
        assert_eq!(program.terms.len(), 4);

        let resolved = plan.resolve(&values, &NormCache::default());
        let mut consts = Vec::new();
        program.pack_constants(&resolved, &mut consts);
        assert_eq!(consts.len(), program.n_consts);

        let mut a = vec![0.0; program.n_slots];
        let mut b = vec![0.0; program.n_slots];
        for i in 0..40 {
            let x = 0.25 + 0.5 * i as f64;
            let expected = plan.eval_point(x, &resolved, &mut a);
            assert_relative_eq!(program.interpret(x, &consts, &mut b), expected, max_relative = 1e-14);
        }
    }

    #[test]
    fn test_reference_model_lowers() {
        let model = vf_model::build(&reference_spec(1000).unwrap()).unwrap();
        let plan = model.root.plan();
        let program = GpuProgram::lower(&plan).unwrap();
        assert_eq!(program.n_slots, 6);
        let gamma_ops = program.ops.chunks(4).filter(|op| op[0] == OP_GAMMA).count();
        assert_eq!(gamma_ops, 1);
        assert_eq!(program.ops[4 * 5], OP_SUM);
        assert_eq!(program.ops[4 * 5 + 2], 5);
    }
}
