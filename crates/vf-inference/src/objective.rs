//! Negative log-likelihood as a function of the free parameters.

use crate::optimizer::ObjectiveFunction;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use vf_compute::{EvaluationBackend, PreparedEvaluation};
use vf_core::{ParameterSet, Result};
use vf_model::{Dataset, EvalPlan, NormCache};

/// Value substituted for a non-finite negative log-likelihood.
pub const NON_FINITE_PENALTY: f64 = 1e30;

/// Backend + plan + dataset, evaluated at free-parameter vectors.
///
/// Constants keep the values they had when the objective was built. The only
/// state carried between calls is the normalization cache, which is keyed by
/// parameter values.
pub struct LikelihoodObjective<'a> {
    prepared: Mutex<Box<dyn PreparedEvaluation + 'a>>,
    cache: NormCache,
    template: ParameterSet,
    free_indices: Vec<usize>,
    free_bounds: Vec<(f64, f64)>,
    n_evaluations: AtomicUsize,
    backend_name: &'static str,
}

impl<'a> LikelihoodObjective<'a> {
    /// Bind `backend` to `plan` and `data`; `params` supplies constants and
    /// the free-parameter layout.
    pub fn new(
        backend: &'a dyn EvaluationBackend,
        plan: &'a EvalPlan,
        data: &'a Dataset,
        params: &ParameterSet,
    ) -> Result<Self> {
        let prepared = backend.prepare(plan, data)?;
        Ok(Self {
            prepared: Mutex::new(prepared),
            cache: NormCache::default(),
            template: params.clone(),
            free_indices: params.free_indices(),
            free_bounds: params.free_bounds(),
            n_evaluations: AtomicUsize::new(0),
            backend_name: backend.name(),
        })
    }

    /// Number of events in the bound dataset.
    pub fn n_events(&self) -> usize {
        self.lock().n_events()
    }

    /// Normalization cache `(hits, misses)`.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    /// Bounds of the free parameters, in free order.
    pub fn free_bounds(&self) -> &[(f64, f64)] {
        &self.free_bounds
    }

    /// Raw NLL at a full value vector, without penalty substitution.
    pub fn nll_at(&self, values: &[f64]) -> Result<f64> {
        self.lock().nll(values, &self.cache)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Box<dyn PreparedEvaluation + 'a>> {
        self.prepared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn penalize(&self, nll: f64, free: &[f64]) -> f64 {
        if nll.is_finite() {
            nll
        } else {
            log::debug!(
                "{}: non-finite NLL ({nll}) at {free:?}, substituting {NON_FINITE_PENALTY:e}",
                self.backend_name
            );
            NON_FINITE_PENALTY
        }
    }
}

impl ObjectiveFunction for LikelihoodObjective<'_> {
    fn eval(&self, free: &[f64]) -> Result<f64> {
        let values = self.template.expand_free(free)?;
        self.n_evaluations.fetch_add(1, Ordering::Relaxed);
        let nll = self.nll_at(&values)?;
        Ok(self.penalize(nll, free))
    }

    fn gradient(&self, free: &[f64]) -> Result<Vec<f64>> {
        let values = self.template.expand_free(free)?;
        let steps: Vec<f64> = free.iter().map(|x| 1e-6 * x.abs().max(1.0)).collect();
        let mut grad = self.lock().gradient(
            &values,
            &self.free_indices,
            &steps,
            &self.free_bounds,
            &self.cache,
        )?;
        self.n_evaluations.fetch_add(2 * free.len(), Ordering::Relaxed);

        // Components that saw a non-finite NLL are redone on the penalized surface.
        let mut probe = free.to_vec();
        for (k, g) in grad.iter_mut().enumerate() {
            if g.is_finite() {
                continue;
            }
            let (lo, hi) = self.free_bounds[k];
            let xp = (free[k] + steps[k]).min(hi);
            let xm = (free[k] - steps[k]).max(lo);
            probe[k] = xp;
            let fp = self.eval(&probe)?;
            probe[k] = xm;
            let fm = self.eval(&probe)?;
            probe[k] = free[k];
            *g = if xp > xm { (fp - fm) / (xp - xm) } else { 0.0 };
        }
        Ok(grad)
    }

    fn n_evaluations(&self) -> usize {
        self.n_evaluations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use vf_compute::ScalarBackend;
    use vf_model::DataGenerator;
    use vf_model::presets::gauss_exp_mixture;

    #[test]
    fn test_objective_matches_backend_and_counts() {
        let model = gauss_exp_mixture().build().unwrap();
        let data =
            DataGenerator::new().generate(&model.root, &model.parameters, "x", 2_000, 21).unwrap();
        let plan = model.root.plan();
        let backend = ScalarBackend;
        let objective = LikelihoodObjective::new(&backend, &plan, &data, &model.parameters).unwrap();

        let free = model.parameters.free_values();
        let f = objective.eval(&free).unwrap();
        let direct = backend
            .evaluate(&plan, &data, &model.parameters.values(), &NormCache::default())
            .unwrap();
        assert_relative_eq!(f, direct, max_relative = 1e-12);
        assert_eq!(objective.n_evaluations(), 1);
        assert_eq!(objective.n_events(), 2_000);

        // Same point again: every leaf normalization comes from the cache.
        let (hits_before, misses_before) = objective.cache_stats();
        objective.eval(&free).unwrap();
        let (hits, misses) = objective.cache_stats();
        assert_eq!(misses, misses_before);
        assert_eq!(hits, hits_before + 2);
    }

    #[test]
    fn test_non_finite_nll_is_penalized() {
        // A Gaussian whose sigma range reaches zero can produce a NaN density.
        let model = vf_model::ModelBuilder::new()
            .observable("x", (0.0, 10.0))
            .free("mean", 5.0, (0.0, 10.0))
            .free("sigma", 1.0, (0.0, 5.0))
            .gaussian("g", "x", "mean", "sigma")
            .build()
            .unwrap();
        let data =
            DataGenerator::new().generate(&model.root, &model.parameters, "x", 100, 2).unwrap();
        let plan = model.root.plan();
        let backend = ScalarBackend;
        let objective = LikelihoodObjective::new(&backend, &plan, &data, &model.parameters).unwrap();

        assert_eq!(objective.eval(&[5.0, 0.0]).unwrap(), NON_FINITE_PENALTY);
        let g = objective.gradient(&[5.0, 0.0]).unwrap();
        assert!(g.iter().all(|v| v.is_finite()));
    }
}
