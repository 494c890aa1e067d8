//! Synthetic data generation from a density DAG.
//!
//! Each event descends the DAG: a weighted sum picks one child with
//! probability `c_i / Σ c`, a leaf draws `x` by the cheapest exact method it
//! supports. The random generator is an explicit, seeded instance owned by the
//! call; nothing is shared across calls.

use crate::dataset::Dataset;
use crate::node::{DensityNode, Observable};
use crate::pdf::PdfKind;
use rand::distr::weighted::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use std::sync::Arc;
use vf_core::{Error, ParameterSet, Result};

/// Default proposal cap per event for rejection sampling.
pub const DEFAULT_MAX_TRIALS: usize = 100_000;

/// Seeded RNG; `seed == 0` draws from the OS entropy source.
pub fn rng_from_seed(seed: u64) -> StdRng {
    if seed == 0 { StdRng::from_os_rng() } else { StdRng::seed_from_u64(seed) }
}

/// Set every free parameter to a uniform draw inside its bounds.
pub fn randomise_parameters(params: &mut ParameterSet, seed: u64) -> Result<()> {
    let mut rng = rng_from_seed(seed);
    let draws: Vec<f64> = params
        .free_bounds()
        .into_iter()
        .map(|(lo, hi)| lo + rng.random::<f64>() * (hi - lo))
        .collect();
    params.set_free_values(&draws)
}

/// Samples fixed-size datasets from a DAG.
#[derive(Debug, Clone)]
pub struct DataGenerator {
    max_trials: usize,
}

impl Default for DataGenerator {
    fn default() -> Self {
        Self { max_trials: DEFAULT_MAX_TRIALS }
    }
}

impl DataGenerator {
    /// Generator with the default trial cap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the rejection-sampling cap per event.
    pub fn with_max_trials(mut self, max_trials: usize) -> Self {
        self.max_trials = max_trials.max(1);
        self
    }

    /// Draw `count` events of `observable` from `root` at the current values of `params`.
    ///
    /// The parameter values are copied at call time. The same non-zero `seed`
    /// always yields a byte-identical dataset; `seed == 0` is non-reproducible.
    pub fn generate(
        &self,
        root: &DensityNode,
        params: &ParameterSet,
        observable: &str,
        count: usize,
        seed: u64,
    ) -> Result<Dataset> {
        let obs = root.observable().clone();
        if obs.name != observable {
            return Err(Error::UnknownReference {
                kind: "observable",
                name: observable.to_string(),
                referenced_by: root.name().to_string(),
            });
        }
        let values = params.values();
        let sampler = Sampler::compile(root, &values, &obs)?;

        let mut rng = rng_from_seed(seed);
        let mut column = Vec::with_capacity(count);
        for _ in 0..count {
            column.push(sampler.draw(&mut rng, &obs, self.max_trials)?);
        }
        log::debug!("generated {count} events of '{observable}' from '{}'", root.name());
        Dataset::from_columns(vec![obs.clone()], [(obs.name, column)])
    }
}

#[derive(Debug)]
enum LeafMethod {
    /// Rejection from an untruncated normal; efficient when most mass is in range.
    Normal(Normal<f64>),
    /// Closed-form inverse CDF.
    Inverse,
    /// Uniform proposals under a constant envelope.
    Rejection { envelope: f64 },
}

#[derive(Debug)]
enum Sampler {
    Leaf {
        name: String,
        pdf: Arc<dyn crate::pdf::UnivariatePdf>,
        params: Vec<f64>,
        method: LeafMethod,
    },
    Sum {
        pick: WeightedIndex<f64>,
        children: Vec<Sampler>,
    },
}

impl Sampler {
    fn compile(node: &DensityNode, values: &[f64], obs: &Observable) -> Result<Self> {
        match node {
            DensityNode::Leaf(l) => {
                let params: Vec<f64> = l.params.iter().map(|r| values[r.index]).collect();
                let range = obs.bounds;
                let method = match l.pdf.kind() {
                    PdfKind::Gaussian => {
                        let (mean, sigma) = (params[0], params[1]);
                        let mass = l.pdf.analytical_integral(&params, range).unwrap_or(0.0)
                            / (sigma * (2.0 * std::f64::consts::PI).sqrt());
                        match Normal::new(mean, sigma) {
                            Ok(n) if mass >= 0.5 => LeafMethod::Normal(n),
                            _ if l.pdf.inverse_cdf(0.5, &params, range).is_some() => {
                                LeafMethod::Inverse
                            }
                            _ => {
                                LeafMethod::Rejection { envelope: l.pdf.envelope(&params, range) }
                            }
                        }
                    }
                    _ if l.pdf.inverse_cdf(0.5, &params, range).is_some() => LeafMethod::Inverse,
                    _ => LeafMethod::Rejection { envelope: l.pdf.envelope(&params, range) },
                };
                Ok(Sampler::Leaf { name: l.name.clone(), pdf: Arc::clone(&l.pdf), params, method })
            }
            DensityNode::WeightedSum(s) => {
                let weights: Vec<f64> =
                    s.terms.iter().map(|t| values[t.coefficient.index]).collect();
                let pick = WeightedIndex::new(&weights).map_err(|e| {
                    Error::Validation(format!(
                        "sum '{}' cannot be sampled with coefficients {weights:?}: {e}",
                        s.name
                    ))
                })?;
                let children = s
                    .terms
                    .iter()
                    .map(|t| Sampler::compile(&t.child, values, obs))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Sampler::Sum { pick, children })
            }
        }
    }

    fn draw(&self, rng: &mut StdRng, obs: &Observable, max_trials: usize) -> Result<f64> {
        match self {
            Sampler::Sum { children, pick } => {
                children[pick.sample(rng)].draw(rng, obs, max_trials)
            }
            Sampler::Leaf { name, pdf, params, method } => {
                let (a, b) = obs.bounds;
                match method {
                    LeafMethod::Normal(normal) => {
                        for _ in 0..max_trials {
                            let x = normal.sample(rng);
                            if x >= a && x <= b {
                                return Ok(x);
                            }
                        }
                    }
                    LeafMethod::Inverse => {
                        let u: f64 = rng.random();
                        return pdf.inverse_cdf(u, params, obs.bounds).ok_or_else(|| {
                            Error::Computation(format!("inverse CDF failed for '{name}'"))
                        });
                    }
                    LeafMethod::Rejection { envelope } => {
                        for _ in 0..max_trials {
                            let x = a + rng.random::<f64>() * (b - a);
                            let y = rng.random::<f64>() * envelope;
                            if y < pdf.unnormalized(x, params) {
                                return Ok(x);
                            }
                        }
                    }
                }
                Err(Error::SamplingExhausted { node: name.clone(), trials: max_trials })
            }
        }
    }
}
