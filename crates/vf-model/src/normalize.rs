//! Normalization integrals and their cache.
//!
//! Every leaf is renormalized over its observable's declared range. Leaves with
//! a closed-form integral use it; the rest fall back to composite
//! Gauss-Legendre quadrature. Integrals are memoized per (leaf, parameter
//! values) in a [`NormCache`], so a likelihood evaluation costs one integral
//! per leaf only when that leaf's parameters actually moved.

use crate::pdf::UnivariatePdf;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

/// Nodes per Gauss-Legendre panel.
const GL_ORDER: usize = 64;
/// Panels the range is split into for quadrature.
const GL_PANELS: usize = 8;

/// Compute Gauss-Legendre nodes and weights on `[-1, 1]` for the given order.
///
/// Uses Newton iteration on the Legendre recurrence; only half the roots are
/// computed and mirrored.
fn gauss_legendre_nodes_weights(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut nodes = vec![0.0f64; n];
    let mut weights = vec![0.0f64; n];
    if n == 0 {
        return (nodes, weights);
    }
    if n == 1 {
        weights[0] = 2.0;
        return (nodes, weights);
    }

    let nf = n as f64;
    let legendre = |x: f64| {
        let mut p0 = 1.0f64;
        let mut p1 = x;
        for j in 2..=n {
            let jf = j as f64;
            let p2 = ((2.0 * jf - 1.0) * x * p1 - (jf - 1.0) * p0) / jf;
            p0 = p1;
            p1 = p2;
        }
        // (P_n, P'_n)
        (p1, nf * (x * p1 - p0) / (x * x - 1.0))
    };

    for i in 0..n.div_ceil(2) {
        let mut x = ((std::f64::consts::PI * (i as f64 + 0.75)) / (nf + 0.5)).cos();
        for _ in 0..100 {
            let (p, dp) = legendre(x);
            let dx = p / dp;
            x -= dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }
        let (_, dp) = legendre(x);
        let w = 2.0 / ((1.0 - x * x) * dp * dp);

        nodes[i] = -x;
        nodes[n - 1 - i] = x;
        weights[i] = w;
        weights[n - 1 - i] = w;
    }

    (nodes, weights)
}

fn reference_rule() -> &'static (Vec<f64>, Vec<f64>) {
    static RULE: OnceLock<(Vec<f64>, Vec<f64>)> = OnceLock::new();
    RULE.get_or_init(|| gauss_legendre_nodes_weights(GL_ORDER))
}

/// Integrate `f` over `[a, b]` with composite Gauss-Legendre quadrature.
pub fn integrate(f: impl Fn(f64) -> f64, range: (f64, f64)) -> f64 {
    let (nodes, weights) = reference_rule();
    let (a, b) = range;
    let panel = (b - a) / GL_PANELS as f64;
    let mut total = 0.0;
    for k in 0..GL_PANELS {
        let lo = a + panel * k as f64;
        let half = panel / 2.0;
        let mid = lo + half;
        let mut s = 0.0;
        for (&x, &w) in nodes.iter().zip(weights) {
            s += w * f(mid + half * x);
        }
        total += s * half;
    }
    total
}

/// Normalization integral of a leaf over `range`.
pub fn normalization(pdf: &dyn UnivariatePdf, params: &[f64], range: (f64, f64)) -> f64 {
    pdf.analytical_integral(params, range)
        .unwrap_or_else(|| integrate(|x| pdf.unnormalized(x, params), range))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NormKey {
    leaf: usize,
    bits: Vec<u64>,
}

/// Memo of normalization integrals keyed by (leaf id, exact parameter bits).
///
/// The key is the bit pattern of the leaf's own parameter values, so a hit is
/// only possible when the integral would be recomputed from identical inputs.
/// That makes the cache behaviorally transparent to the objective. The map is
/// bounded and simply cleared when it fills up.
#[derive(Debug)]
pub struct NormCache {
    entries: Mutex<HashMap<NormKey, f64>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for NormCache {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl NormCache {
    /// Cache holding at most `capacity` integrals.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached integral for `leaf` at `params`, computing it on a miss.
    pub fn get_or_compute(&self, leaf: usize, params: &[f64], compute: impl FnOnce() -> f64) -> f64 {
        let key = NormKey { leaf, bits: params.iter().map(|v| v.to_bits()).collect() };
        if let Some(&v) = self.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return v;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = compute();
        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            log::debug!("normalization cache full ({} entries); clearing", entries.len());
            entries.clear();
        }
        entries.insert(key, value);
        value
    }

    /// `(hits, misses)` since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    /// Number of memoized integrals.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is memoized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NormKey, f64>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
