//! Evaluation strategy interface and selection.

use serde::{Deserialize, Serialize};
use vf_core::{Error, Result};
use vf_model::{Dataset, EvalPlan, NormCache};

/// Enumerated evaluation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// One event at a time, full DAG per event.
    Scalar,
    /// Column-at-a-time over contiguous buffers, SIMD + Rayon.
    VectorizedCpu,
    /// Column-at-a-time offloaded to a CUDA device.
    VectorizedGpu,
}

impl BackendKind {
    /// Every strategy, in benchmark order.
    pub const ALL: [BackendKind; 3] =
        [BackendKind::Scalar, BackendKind::VectorizedCpu, BackendKind::VectorizedGpu];

    /// Human-readable benchmark name.
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Scalar => "fit_Scalar",
            BackendKind::VectorizedCpu => "fit_CPU",
            BackendKind::VectorizedGpu => "fit_CUDA",
        }
    }

    /// Strategies registered in this build. The GPU strategy is only offered
    /// when compiled with the `cuda` feature.
    pub fn registered() -> Vec<BackendKind> {
        let mut kinds = vec![BackendKind::Scalar, BackendKind::VectorizedCpu];
        if cfg!(feature = "cuda") {
            kinds.push(BackendKind::VectorizedGpu);
        }
        kinds
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "scalar" | "fit_scalar" => Ok(BackendKind::Scalar),
            "cpu" | "vectorized-cpu" | "fit_cpu" => Ok(BackendKind::VectorizedCpu),
            "gpu" | "cuda" | "vectorized-gpu" | "fit_cuda" => Ok(BackendKind::VectorizedGpu),
            _ => Err(Error::Validation(format!(
                "unknown backend '{s}' (expected scalar, cpu or cuda)"
            ))),
        }
    }
}

/// A backend bound to one plan and dataset.
///
/// Preparation is where a backend uploads or lays out whatever it needs; the
/// returned object is then evaluated many times at different parameter
/// values. Every call blocks until the result is on the host.
pub trait PreparedEvaluation: Send {
    /// Number of events evaluated per call.
    fn n_events(&self) -> usize;

    /// Normalized root density for every event.
    fn densities(&mut self, values: &[f64], cache: &NormCache) -> Result<Vec<f64>>;

    /// `-Σ ln ρ(x)` over the dataset, plus the Poisson term of an extended root.
    ///
    /// Non-finite results are returned as-is; callers decide how to recover.
    fn nll(&mut self, values: &[f64], cache: &NormCache) -> Result<f64>;

    /// Finite-difference gradient of [`Self::nll`] w.r.t. `values[indices[k]]`.
    ///
    /// Steps are clipped to `bounds[k]`, which turns the central difference
    /// into a one-sided one at a boundary.
    fn gradient(
        &mut self,
        values: &[f64],
        indices: &[usize],
        steps: &[f64],
        bounds: &[(f64, f64)],
        cache: &NormCache,
    ) -> Result<Vec<f64>> {
        let mut probe = values.to_vec();
        let mut grad = Vec::with_capacity(indices.len());
        for ((&i, &h), &(lo, hi)) in indices.iter().zip(steps).zip(bounds) {
            let x = values[i];
            let xp = (x + h).min(hi);
            let xm = (x - h).max(lo);
            if !(xp > xm) {
                grad.push(0.0);
                continue;
            }
            probe[i] = xp;
            let fp = self.nll(&probe, cache)?;
            probe[i] = xm;
            let fm = self.nll(&probe, cache)?;
            probe[i] = x;
            grad.push((fp - fm) / (xp - xm));
        }
        Ok(grad)
    }
}

/// A stateless evaluation strategy.
pub trait EvaluationBackend: Send + Sync {
    /// Strategy tag.
    fn kind(&self) -> BackendKind;

    /// Display name.
    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Bind to a plan and dataset.
    fn prepare<'a>(
        &'a self,
        plan: &'a EvalPlan,
        data: &'a Dataset,
    ) -> Result<Box<dyn PreparedEvaluation + 'a>>;

    /// One-shot NLL evaluation.
    fn evaluate(
        &self,
        plan: &EvalPlan,
        data: &Dataset,
        values: &[f64],
        cache: &NormCache,
    ) -> Result<f64> {
        self.prepare(plan, data)?.nll(values, cache)
    }
}

/// Observable column of `data` the plan is defined on.
pub(crate) fn plan_column<'a>(plan: &EvalPlan, data: &'a Dataset) -> Result<&'a [f64]> {
    let name = plan.observable.name.as_str();
    let column = data.column(name).ok_or_else(|| Error::UnknownReference {
        kind: "observable",
        name: name.to_string(),
        referenced_by: "dataset".into(),
    })?;
    if data.bounds(name) != Some(plan.observable.bounds) {
        return Err(Error::Validation(format!(
            "dataset bounds for '{name}' differ from the model's {:?}",
            plan.observable.bounds
        )));
    }
    Ok(column)
}

/// Combine `Σ ln ρ` with the extended term.
#[inline]
pub(crate) fn finish_nll(plan: &EvalPlan, values: &[f64], n_events: usize, sum_ln: f64) -> f64 {
    -sum_ln + plan.extended_term(values, n_events)
}

/// Instantiate a strategy.
///
/// Fails with [`Error::BackendUnavailable`] when the GPU strategy is requested
/// but the build lacks CUDA support or no device can be opened.
pub fn select(kind: BackendKind) -> Result<Box<dyn EvaluationBackend>> {
    match kind {
        BackendKind::Scalar => Ok(Box::new(crate::scalar::ScalarBackend)),
        BackendKind::VectorizedCpu => Ok(Box::new(crate::vectorized::VectorizedCpuBackend::new())),
        BackendKind::VectorizedGpu => select_gpu(),
    }
}

#[cfg(feature = "cuda")]
fn select_gpu() -> Result<Box<dyn EvaluationBackend>> {
    if !crate::cuda::CudaBackend::is_available() {
        log::warn!("{}: no CUDA device available", BackendKind::VectorizedGpu);
        return Err(Error::BackendUnavailable {
            backend: BackendKind::VectorizedGpu.name().into(),
            reason: "no CUDA device could be opened".into(),
        });
    }
    Ok(Box::new(crate::cuda::CudaBackend::new()?))
}

#[cfg(not(feature = "cuda"))]
fn select_gpu() -> Result<Box<dyn EvaluationBackend>> {
    log::warn!("{}: built without the `cuda` feature", BackendKind::VectorizedGpu);
    Err(Error::BackendUnavailable {
        backend: BackendKind::VectorizedGpu.name().into(),
        reason: "built without the `cuda` feature".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_and_parsing() {
        assert_eq!(BackendKind::Scalar.name(), "fit_Scalar");
        assert_eq!("cpu".parse::<BackendKind>().unwrap(), BackendKind::VectorizedCpu);
        assert_eq!("fit_CUDA".parse::<BackendKind>().unwrap(), BackendKind::VectorizedGpu);
        assert!("tpu".parse::<BackendKind>().is_err());
        let registered = BackendKind::registered();
        assert_eq!(&registered[..2], &[BackendKind::Scalar, BackendKind::VectorizedCpu]);
        assert_eq!(registered.contains(&BackendKind::VectorizedGpu), cfg!(feature = "cuda"));
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_gpu_unavailable_without_feature() {
        match select(BackendKind::VectorizedGpu) {
            Err(Error::BackendUnavailable { backend, .. }) => assert_eq!(backend, "fit_CUDA"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("GPU backend selected without the cuda feature"),
        }
    }
}
