//! Row-at-a-time reference backend.

use crate::backend::{BackendKind, EvaluationBackend, PreparedEvaluation, finish_nll, plan_column};
use vf_core::Result;
use vf_model::{Dataset, EvalPlan, NormCache};

/// Evaluates the full plan once per event, in dataset order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarBackend;

impl EvaluationBackend for ScalarBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Scalar
    }

    fn prepare<'a>(
        &'a self,
        plan: &'a EvalPlan,
        data: &'a Dataset,
    ) -> Result<Box<dyn PreparedEvaluation + 'a>> {
        let xs = plan_column(plan, data)?;
        Ok(Box::new(ScalarEvaluation { plan, xs, slots: vec![0.0; plan.n_slots()] }))
    }
}

struct ScalarEvaluation<'a> {
    plan: &'a EvalPlan,
    xs: &'a [f64],
    slots: Vec<f64>,
}

impl PreparedEvaluation for ScalarEvaluation<'_> {
    fn n_events(&self) -> usize {
        self.xs.len()
    }

    fn densities(&mut self, values: &[f64], cache: &NormCache) -> Result<Vec<f64>> {
        let resolved = self.plan.resolve(values, cache);
        Ok(self.xs.iter().map(|&x| self.plan.eval_point(x, &resolved, &mut self.slots)).collect())
    }

    fn nll(&mut self, values: &[f64], cache: &NormCache) -> Result<f64> {
        let resolved = self.plan.resolve(values, cache);
        let mut sum_ln = 0.0;
        for &x in self.xs {
            sum_ln += self.plan.eval_point(x, &resolved, &mut self.slots).ln();
        }
        Ok(finish_nll(self.plan, values, self.xs.len(), sum_ln))
    }
}
