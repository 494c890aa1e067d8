//! Column-at-a-time CPU backend.
//!
//! Events are split into fixed-size blocks. Within a block every plan step is
//! evaluated for the whole column before the next step starts, so leaf
//! kernels run over contiguous buffers with SIMD. Blocks run on the Rayon pool
//! and their partial sums are reduced in block order, which keeps the result
//! independent of the thread count.

use crate::backend::{BackendKind, EvaluationBackend, PreparedEvaluation, finish_nll, plan_column};
use crate::simd;
use rayon::prelude::*;
use vf_core::Result;
use vf_model::{Dataset, EvalPlan, NormCache, PdfKind, PlanStep, ResolvedPlan};

/// Events per block.
pub const BLOCK_SIZE: usize = 4096;

const PAR_THRESHOLD: usize = 8_000;

/// SIMD + Rayon evaluation over contiguous columns.
#[derive(Debug, Clone, Copy)]
pub struct VectorizedCpuBackend {
    block_size: usize,
}

impl Default for VectorizedCpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorizedCpuBackend {
    /// Backend with the default block size.
    pub fn new() -> Self {
        Self { block_size: BLOCK_SIZE }
    }

    /// Backend with a custom block size (at least 4).
    pub fn with_block_size(block_size: usize) -> Self {
        Self { block_size: block_size.max(4) }
    }
}

impl EvaluationBackend for VectorizedCpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::VectorizedCpu
    }

    fn prepare<'a>(
        &'a self,
        plan: &'a EvalPlan,
        data: &'a Dataset,
    ) -> Result<Box<dyn PreparedEvaluation + 'a>> {
        let xs = plan_column(plan, data)?;
        Ok(Box::new(VectorizedEvaluation { plan, xs, block_size: self.block_size }))
    }
}

struct VectorizedEvaluation<'a> {
    plan: &'a EvalPlan,
    xs: &'a [f64],
    block_size: usize,
}

impl VectorizedEvaluation<'_> {
    fn can_par(&self) -> bool {
        // Stay sequential when already on a Rayon worker (e.g. parallel outer loops).
        rayon::current_thread_index().is_none()
            && rayon::current_num_threads() > 1
            && self.xs.len() >= PAR_THRESHOLD
    }
}

impl PreparedEvaluation for VectorizedEvaluation<'_> {
    fn n_events(&self) -> usize {
        self.xs.len()
    }

    fn densities(&mut self, values: &[f64], cache: &NormCache) -> Result<Vec<f64>> {
        let resolved = self.plan.resolve(values, cache);
        let plan = self.plan;
        let mut out = vec![0.0; self.xs.len()];
        let eval = |slots: &mut Vec<Vec<f64>>, (x_block, o_block): (&[f64], &mut [f64])| {
            let root = eval_block(plan, &resolved, x_block, slots);
            o_block.copy_from_slice(&root[..x_block.len()]);
        };
        if self.can_par() {
            self.xs
                .par_chunks(self.block_size)
                .zip(out.par_chunks_mut(self.block_size))
                .for_each_init(|| new_slots(plan, self.block_size), eval);
        } else {
            let mut slots = new_slots(plan, self.block_size);
            for pair in self.xs.chunks(self.block_size).zip(out.chunks_mut(self.block_size)) {
                eval(&mut slots, pair);
            }
        }
        Ok(out)
    }

    fn nll(&mut self, values: &[f64], cache: &NormCache) -> Result<f64> {
        let resolved = self.plan.resolve(values, cache);
        let plan = self.plan;
        let block_ln = |slots: &mut Vec<Vec<f64>>, x_block: &[f64]| {
            let root = eval_block(plan, &resolved, x_block, slots);
            simd::sum_ln(&root[..x_block.len()])
        };
        let partials: Vec<f64> = if self.can_par() {
            self.xs
                .par_chunks(self.block_size)
                .map_init(|| new_slots(plan, self.block_size), block_ln)
                .collect()
        } else {
            let mut slots = new_slots(plan, self.block_size);
            self.xs.chunks(self.block_size).map(|b| block_ln(&mut slots, b)).collect()
        };
        let sum_ln: f64 = partials.iter().sum();
        Ok(finish_nll(self.plan, values, self.xs.len(), sum_ln))
    }
}

fn new_slots(plan: &EvalPlan, block_size: usize) -> Vec<Vec<f64>> {
    vec![vec![0.0; block_size]; plan.n_slots()]
}

/// Evaluate every plan step over `xs`; returns the root slot buffer.
fn eval_block<'s>(
    plan: &EvalPlan,
    resolved: &ResolvedPlan,
    xs: &[f64],
    slots: &'s mut [Vec<f64>],
) -> &'s [f64] {
    let m = xs.len();
    let mut sum_idx = 0;
    for (slot, step) in plan.steps.iter().enumerate() {
        let (done, rest) = slots.split_at_mut(slot);
        let out = &mut rest[0][..m];
        match step {
            PlanStep::Leaf { leaf, .. } => {
                let p = &resolved.leaf_params[*leaf];
                let scale = resolved.leaf_inv_norms[*leaf];
                match plan.leaves[*leaf].kind() {
                    PdfKind::Gaussian => simd::gaussian_batch(xs, p[0], p[1], scale, out),
                    PdfKind::Exponential => simd::exponential_batch(xs, p[0], scale, out),
                    PdfKind::Polynomial => simd::polynomial_batch(xs, p, scale, out),
                    PdfKind::Gamma => {
                        plan.leaves[*leaf].pdf.unnormalized_batch(xs, p, out);
                        simd::scale_in_place(out, scale);
                    }
                }
            }
            PlanStep::Sum { terms, .. } => {
                let weights = &resolved.sum_weights[sum_idx];
                sum_idx += 1;
                out.fill(0.0);
                for (&(_, child), &w) in terms.iter().zip(weights) {
                    simd::axpy(out, w, &done[child][..m]);
                }
            }
        }
    }
    &slots[plan.root_slot()]
}
