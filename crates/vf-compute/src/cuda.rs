//! CUDA evaluation backend.
//!
//! ```text
//! host: resolve plan -> pack constants -> memcpy_htod
//! device: grid-stride loop, one event per thread, slots in registers
//!         per-block reduction of ln ρ into partials[blockIdx.x]
//! host: memcpy_dtoh partials -> ordered sum
//! ```
//!
//! The kernel is compiled with NVRTC when the backend is created, so no CUDA
//! toolkit is needed at build time.

use crate::backend::{BackendKind, EvaluationBackend, PreparedEvaluation, finish_nll, plan_column};
use crate::gpu_types::{GpuProgram, MAX_SLOTS};
use cudarc::driver::{
    CudaContext, CudaFunction, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
};
use cudarc::nvrtc::{CompileOptions, compile_ptx_with_opts};
use std::sync::Arc;
use vf_core::{Error, Result};
use vf_model::{Dataset, EvalPlan, NormCache};

const BLOCK_DIM: u32 = 256;
const MAX_BLOCKS: usize = 1024;

const KERNEL_SRC: &str = r#"
#define OP_GAUSSIAN 0u
#define OP_EXPONENTIAL 1u
#define OP_POLYNOMIAL 2u
#define OP_GAMMA 3u
#define OP_SUM 10u
#define MAX_SLOTS 32

__device__ double eval_event(double x, const unsigned int* ops, const unsigned int* terms,
                             const double* c, unsigned int n_slots) {
    double slots[MAX_SLOTS];
    for (unsigned int s = 0; s < n_slots; ++s) {
        unsigned int op = ops[4 * s];
        unsigned int a = ops[4 * s + 1];
        unsigned int b = ops[4 * s + 2];
        unsigned int k = ops[4 * s + 3];
        double v;
        switch (op) {
        case OP_GAUSSIAN: {
            double sigma = c[a + 1];
            if (!(sigma > 0.0)) { v = nan(""); break; }
            double z = (x - c[a]) / sigma;
            v = exp(-0.5 * z * z) * c[k];
            break;
        }
        case OP_EXPONENTIAL:
            v = exp(-c[a] * x) * c[k];
            break;
        case OP_POLYNOMIAL: {
            double acc = 0.0;
            for (int i = (int)b - 1; i >= 0; --i) acc = (acc + c[a + i]) * x;
            v = (1.0 + acc) * c[k];
            break;
        }
        case OP_GAMMA: {
            double g = c[a], beta = c[a + 1], t = x - c[a + 2];
            if (!(g > 0.0 && beta > 0.0)) v = nan("");
            else if (t <= 0.0) v = 0.0;
            else v = exp((g - 1.0) * log(t) - t / beta - lgamma(g) - g * log(beta)) * c[k];
            break;
        }
        case OP_SUM: {
            double acc = 0.0;
            for (unsigned int i = 0; i < b; ++i) {
                unsigned int t = 2 * (a + i);
                acc += c[terms[t + 1]] * slots[terms[t]];
            }
            v = acc;
            break;
        }
        default:
            v = nan("");
        }
        slots[s] = v;
    }
    return slots[n_slots - 1];
}

extern "C" __global__ void vf_density(const double* xs, unsigned int n,
                                      const unsigned int* ops, const unsigned int* terms,
                                      const double* c, unsigned int n_slots, double* out) {
    for (unsigned int i = blockIdx.x * blockDim.x + threadIdx.x; i < n;
         i += blockDim.x * gridDim.x) {
        out[i] = eval_event(xs[i], ops, terms, c, n_slots);
    }
}

extern "C" __global__ void vf_sum_ln(const double* xs, unsigned int n,
                                     const unsigned int* ops, const unsigned int* terms,
                                     const double* c, unsigned int n_slots, double* partials) {
    extern __shared__ double scratch[];
    double acc = 0.0;
    for (unsigned int i = blockIdx.x * blockDim.x + threadIdx.x; i < n;
         i += blockDim.x * gridDim.x) {
        acc += log(eval_event(xs[i], ops, terms, c, n_slots));
    }
    scratch[threadIdx.x] = acc;
    __syncthreads();
    for (unsigned int s = blockDim.x / 2; s > 0; s >>= 1) {
        if (threadIdx.x < s) scratch[threadIdx.x] += scratch[threadIdx.x + s];
        __syncthreads();
    }
    if (threadIdx.x == 0) partials[blockIdx.x] = scratch[0];
}
"#;

fn cuda_err(msg: impl std::fmt::Display) -> Error {
    Error::Computation(format!("CUDA: {msg}"))
}

/// Evaluation on CUDA device 0.
pub struct CudaBackend {
    #[allow(dead_code)]
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    kernel_density: CudaFunction,
    kernel_sum_ln: CudaFunction,
}

impl CudaBackend {
    /// Check if CUDA is available at runtime (driver loaded, GPU present).
    pub fn is_available() -> bool {
        // cudarc panics when the driver library is missing.
        std::panic::catch_unwind(|| CudaContext::new(0).is_ok()).unwrap_or(false)
    }

    /// Open device 0 and compile the kernels.
    pub fn new() -> Result<Self> {
        let ctx = match std::panic::catch_unwind(|| CudaContext::new(0)) {
            Ok(Ok(ctx)) => ctx,
            Ok(Err(e)) => {
                return Err(Error::BackendUnavailable {
                    backend: BackendKind::VectorizedGpu.name().into(),
                    reason: format!("context: {e}"),
                });
            }
            Err(_) => {
                return Err(Error::BackendUnavailable {
                    backend: BackendKind::VectorizedGpu.name().into(),
                    reason: "CUDA driver library not available".into(),
                });
            }
        };
        let stream = ctx.default_stream();

        let opts = CompileOptions {
            prec_sqrt: Some(true),
            prec_div: Some(true),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(KERNEL_SRC, opts)
            .map_err(|e| cuda_err(format!("NVRTC compilation failed:\n{e}")))?;
        let module = ctx.load_module(ptx).map_err(|e| cuda_err(format!("load PTX: {e}")))?;
        let kernel_density = module
            .load_function("vf_density")
            .map_err(|e| cuda_err(format!("load vf_density: {e}")))?;
        let kernel_sum_ln = module
            .load_function("vf_sum_ln")
            .map_err(|e| cuda_err(format!("load vf_sum_ln: {e}")))?;
        log::info!("{}: kernels compiled for device 0", BackendKind::VectorizedGpu);

        Ok(Self { ctx, stream, kernel_density, kernel_sum_ln })
    }
}

impl EvaluationBackend for CudaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::VectorizedGpu
    }

    fn prepare<'a>(
        &'a self,
        plan: &'a EvalPlan,
        data: &'a Dataset,
    ) -> Result<Box<dyn PreparedEvaluation + 'a>> {
        let xs = plan_column(plan, data)?;
        let program = GpuProgram::lower(plan)?;
        debug_assert!(program.n_slots <= MAX_SLOTS);
        let n_events = xs.len();
        if n_events > u32::MAX as usize {
            return Err(Error::Validation(format!("{n_events} events exceed the CUDA index range")));
        }

        // Zero-length device buffers are rejected by the driver.
        let d_xs = if xs.is_empty() {
            self.stream.clone_htod(&[0.0f64]).map_err(cuda_err)?
        } else {
            self.stream.clone_htod(xs).map_err(cuda_err)?
        };
        let d_ops = self.stream.clone_htod(&program.ops).map_err(cuda_err)?;
        let d_terms = if program.terms.is_empty() {
            self.stream.clone_htod(&[0u32, 0u32]).map_err(cuda_err)?
        } else {
            self.stream.clone_htod(&program.terms).map_err(cuda_err)?
        };
        let d_consts = self.stream.alloc_zeros::<f64>(program.n_consts.max(1)).map_err(cuda_err)?;

        let n_blocks = n_events.div_ceil(BLOCK_DIM as usize).clamp(1, MAX_BLOCKS);
        let d_partials = self.stream.alloc_zeros::<f64>(n_blocks).map_err(cuda_err)?;
        log::debug!(
            "{}: prepared {n_events} events, {} slots, {n_blocks} blocks",
            BackendKind::VectorizedGpu,
            program.n_slots
        );

        Ok(Box::new(CudaEvaluation {
            backend: self,
            plan,
            program,
            n_events,
            n_blocks,
            d_xs,
            d_ops,
            d_terms,
            d_consts,
            d_partials,
            consts: Vec::new(),
        }))
    }
}

struct CudaEvaluation<'a> {
    backend: &'a CudaBackend,
    plan: &'a EvalPlan,
    program: GpuProgram,
    n_events: usize,
    n_blocks: usize,
    d_xs: CudaSlice<f64>,
    d_ops: CudaSlice<u32>,
    d_terms: CudaSlice<u32>,
    d_consts: CudaSlice<f64>,
    d_partials: CudaSlice<f64>,
    consts: Vec<f64>,
}

impl CudaEvaluation<'_> {
    fn upload_constants(&mut self, values: &[f64], cache: &NormCache) -> Result<()> {
        let resolved = self.plan.resolve(values, cache);
        self.program.pack_constants(&resolved, &mut self.consts);
        if !self.consts.is_empty() {
            self.backend
                .stream
                .memcpy_htod(&self.consts, &mut self.d_consts)
                .map_err(cuda_err)?;
        }
        Ok(())
    }

    fn launch_config(&self, shared_mem_bytes: u32) -> LaunchConfig {
        LaunchConfig {
            grid_dim: (self.n_blocks as u32, 1, 1),
            block_dim: (BLOCK_DIM, 1, 1),
            shared_mem_bytes,
        }
    }
}

impl PreparedEvaluation for CudaEvaluation<'_> {
    fn n_events(&self) -> usize {
        self.n_events
    }

    fn densities(&mut self, values: &[f64], cache: &NormCache) -> Result<Vec<f64>> {
        self.upload_constants(values, cache)?;
        let stream = &self.backend.stream;
        let mut d_out = stream.alloc_zeros::<f64>(self.n_events.max(1)).map_err(cuda_err)?;

        let n = self.n_events as u32;
        let n_slots = self.program.n_slots as u32;
        let config = self.launch_config(0);
        let mut builder = stream.launch_builder(&self.backend.kernel_density);
        builder.arg(&self.d_xs);
        builder.arg(&n);
        builder.arg(&self.d_ops);
        builder.arg(&self.d_terms);
        builder.arg(&self.d_consts);
        builder.arg(&n_slots);
        builder.arg(&mut d_out);

        // SAFETY: every buffer is a live allocation of at least the length the
        // kernel indexes (n events, 4 * n_slots ops, referenced terms/constants),
        // and the scalar arguments match the kernel signature.
        unsafe {
            builder.launch(config).map_err(|e| cuda_err(format!("launch vf_density: {e}")))?;
        }

        let mut out = vec![0.0f64; self.n_events.max(1)];
        stream.memcpy_dtoh(&d_out, &mut out).map_err(cuda_err)?;
        stream.synchronize().map_err(cuda_err)?;
        out.truncate(self.n_events);
        Ok(out)
    }

    fn nll(&mut self, values: &[f64], cache: &NormCache) -> Result<f64> {
        self.upload_constants(values, cache)?;
        let stream = &self.backend.stream;

        let n = self.n_events as u32;
        let n_slots = self.program.n_slots as u32;
        let config = self.launch_config(BLOCK_DIM * std::mem::size_of::<f64>() as u32);
        let mut builder = stream.launch_builder(&self.backend.kernel_sum_ln);
        builder.arg(&self.d_xs);
        builder.arg(&n);
        builder.arg(&self.d_ops);
        builder.arg(&self.d_terms);
        builder.arg(&self.d_consts);
        builder.arg(&n_slots);
        builder.arg(&mut self.d_partials);

        // SAFETY: same buffers as `vf_density`; `d_partials` holds one entry per
        // block and the shared scratch is BLOCK_DIM doubles.
        unsafe {
            builder.launch(config).map_err(|e| cuda_err(format!("launch vf_sum_ln: {e}")))?;
        }

        let mut partials = vec![0.0f64; self.n_blocks];
        stream.memcpy_dtoh(&self.d_partials, &mut partials).map_err(cuda_err)?;
        stream.synchronize().map_err(cuda_err)?;
        let sum_ln: f64 = partials.iter().sum();
        Ok(finish_nll(self.plan, values, self.n_events, sum_ln))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::ScalarBackend;
    use approx::assert_relative_eq;
    use vf_model::DataGenerator;
    use vf_model::presets::gauss_exp_mixture;

    #[test]
    fn test_cuda_matches_scalar_when_available() {
        if !CudaBackend::is_available() {
            return;
        }
        let model = gauss_exp_mixture().build().unwrap();
        let values = model.parameters.values();
        let data =
            DataGenerator::new().generate(&model.root, &model.parameters, "x", 50_000, 3).unwrap();
        let plan = model.root.plan();
        let cache = NormCache::default();

        let gpu = CudaBackend::new().unwrap();
        let nll = gpu.evaluate(&plan, &data, &values, &cache).unwrap();
        let reference = ScalarBackend.evaluate(&plan, &data, &values, &cache).unwrap();
        assert_relative_eq!(nll, reference, max_relative = 1e-9);
    }
}
