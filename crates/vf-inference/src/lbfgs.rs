//! Bounded limited-memory BFGS.
//!
//! Works in scaled coordinates `u = (x - lo) / e`, where `e` is a per-parameter
//! error estimate `1 / sqrt(∂²f/∂x²)` taken at the first step (a fraction of
//! `max(|x|, 1)` where the curvature is unusable). The initial inverse-Hessian
//! guess and the step length are then measured in standard deviations rather
//! than in fractions of the allowed range, which may be many orders of
//! magnitude wider. Bounds are enforced by projection: trial points are
//! clamped to the box and components pushing outward at an active bound are
//! dropped from the search direction.

use crate::covariance::{compute_hessian, diagonal_curvature, invert_hessian};
use crate::optimizer::{Minimizer, ObjectiveFunction, StepOutcome};
use nalgebra::DMatrix;
use std::collections::VecDeque;
use vf_core::Result;

/// Armijo sufficient-decrease constant.
const ARMIJO_C1: f64 = 1e-4;
/// Maximum step halvings per line search.
const MAX_BACKTRACKS: usize = 40;
/// First steepest-descent step, in estimated standard deviations.
const FIRST_STEP: f64 = 1.0;
/// Error estimate relative to `max(|x|, 1)` when the curvature is not positive.
const FALLBACK_ERROR: f64 = 0.1;

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// One secant correction: step `s`, gradient change `y` and `1 / sᵀy`.
struct Correction {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

/// Most recent corrections, oldest first.
struct CorrectionHistory {
    pairs: VecDeque<Correction>,
    capacity: usize,
}

impl CorrectionHistory {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { pairs: VecDeque::with_capacity(capacity), capacity }
    }

    /// Record a correction, evicting the oldest once `capacity` is reached.
    /// Pairs without positive curvature are ignored; returns whether it was kept.
    fn record(&mut self, s: Vec<f64>, y: Vec<f64>) -> bool {
        let sy = dot(&s, &y);
        if !(sy > 1e-10) {
            return false;
        }
        if self.pairs.len() == self.capacity {
            self.pairs.pop_front();
        }
        self.pairs.push_back(Correction { s, y, rho: 1.0 / sy });
        true
    }

    fn newest(&self) -> Option<&Correction> {
        self.pairs.back()
    }

    /// Whether every direction the memory can hold has been sampled.
    fn is_saturated(&self, n: usize) -> bool {
        self.pairs.len() >= n.min(self.capacity)
    }
}

/// Coordinate map between parameters and scaled coordinates.
struct Scaling {
    lower: Vec<f64>,
    error: Vec<f64>,
    /// Upper edge of the box in scaled coordinates.
    upper: Vec<f64>,
}

impl Scaling {
    fn new(bounds: &[(f64, f64)], x: &[f64], curvature: &[f64]) -> Self {
        let error: Vec<f64> = x
            .iter()
            .zip(bounds)
            .zip(curvature)
            .map(|((&xi, &(lo, hi)), &c)| {
                let span = hi - lo;
                if !(span > 0.0) {
                    return 1.0;
                }
                let magnitude = xi.abs().max(1.0);
                let e = if c.is_finite() && c > 0.0 {
                    1.0 / c.sqrt()
                } else {
                    FALLBACK_ERROR * magnitude
                };
                e.clamp((1e-4 * magnitude).min(span), span)
            })
            .collect();
        let upper = bounds.iter().zip(&error).map(|(&(lo, hi), e)| ((hi - lo) / e).max(0.0)).collect();
        Self { lower: bounds.iter().map(|b| b.0).collect(), error, upper }
    }

    fn to_scaled(&self, x: &[f64]) -> Vec<f64> {
        x.iter().zip(self.lower.iter().zip(&self.error)).map(|(&v, (lo, e))| (v - lo) / e).collect()
    }

    fn from_scaled(&self, u: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
        u.iter()
            .zip(self.lower.iter().zip(&self.error))
            .zip(bounds)
            .map(|((&v, (lo, e)), &(blo, bhi))| (lo + v * e).clamp(blo, bhi))
            .collect()
    }

    fn scaled_gradient(&self, grad: &[f64]) -> Vec<f64> {
        grad.iter().zip(&self.error).map(|(g, e)| g * e).collect()
    }

    fn clamp(&self, u: &mut [f64]) {
        for (ui, &ub) in u.iter_mut().zip(&self.upper) {
            *ui = ui.clamp(0.0, ub);
        }
    }

    /// Gradient with components zeroed where they push against an active bound.
    fn projected(&self, u: &[f64], g: &[f64]) -> Vec<f64> {
        u.iter()
            .zip(g)
            .zip(&self.upper)
            .map(|((&ui, &gi), &ub)| {
                if (ui <= 0.0 && gi > 0.0) || (ui >= ub && gi < 0.0) { 0.0 } else { gi }
            })
            .collect()
    }

    /// Drop direction components that would leave the box at an active bound.
    fn confine(&self, u: &[f64], d: &mut [f64]) {
        for ((dj, &uj), &ub) in d.iter_mut().zip(u).zip(&self.upper) {
            if (uj <= 0.0 && *dj < 0.0) || (uj >= ub && *dj > 0.0) {
                *dj = 0.0;
            }
        }
    }
}

/// Point the minimizer last evaluated, in parameter coordinates.
struct Evaluated {
    x: Vec<f64>,
    fval: f64,
    grad: Vec<f64>,
}

/// L-BFGS-B minimizer over a box.
pub struct LbfgsbMinimizer {
    bounds: Vec<(f64, f64)>,
    history: CorrectionHistory,
    scaling: Option<Scaling>,
    last: Option<Evaluated>,
}

impl LbfgsbMinimizer {
    /// Minimizer for `bounds.len()` parameters keeping `m` correction pairs.
    pub fn new(bounds: Vec<(f64, f64)>, m: usize) -> Self {
        Self { history: CorrectionHistory::with_capacity(m), bounds, scaling: None, last: None }
    }

    fn clamp_to_bounds(&self, x: &[f64]) -> Vec<f64> {
        x.iter().zip(&self.bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
    }

    /// Two-loop recursion: returns `H g` for the current inverse-Hessian model.
    fn apply_inverse_hessian(&self, g: &[f64]) -> Vec<f64> {
        let Some(newest) = self.history.newest() else {
            return g.to_vec();
        };

        let mut q = g.to_vec();
        let mut alpha = Vec::with_capacity(self.history.pairs.len());
        for c in self.history.pairs.iter().rev() {
            let a = c.rho * dot(&c.s, &q);
            for (qj, yj) in q.iter_mut().zip(&c.y) {
                *qj -= a * yj;
            }
            alpha.push(a);
        }

        let yy = dot(&newest.y, &newest.y);
        let gamma = if yy > 1e-30 { 1.0 / (newest.rho * yy) } else { 1.0 };
        let mut r: Vec<f64> = q.iter().map(|&qi| gamma * qi).collect();

        for (c, a) in self.history.pairs.iter().zip(alpha.iter().rev()) {
            let beta = c.rho * dot(&c.y, &r);
            for (rj, sj) in r.iter_mut().zip(&c.s) {
                *rj += (a - beta) * sj;
            }
        }
        r
    }

    /// `½ gᵀ H g` on the projected gradient; `NaN` until the history spans
    /// every free direction the memory can hold.
    fn edm(&self, sc: &Scaling, u: &[f64], g: &[f64]) -> f64 {
        if !self.history.is_saturated(g.len()) {
            return f64::NAN;
        }
        let pg = sc.projected(u, g);
        (0.5 * dot(&pg, &self.apply_inverse_hessian(&pg))).max(0.0)
    }

    /// Norm of the parameter-space gradient with active-bound components removed.
    fn projected_norm(&self, x: &[f64], grad: &[f64]) -> f64 {
        x.iter()
            .zip(grad)
            .zip(&self.bounds)
            .map(|((&xi, &gi), &(lo, hi))| {
                if (xi <= lo && gi > 0.0) || (xi >= hi && gi < 0.0) { 0.0 } else { gi * gi }
            })
            .sum::<f64>()
            .sqrt()
    }

    /// Backtracking Armijo search along the projected path `P(u + t d)`.
    #[allow(clippy::too_many_arguments)]
    fn line_search(
        &self,
        objective: &dyn ObjectiveFunction,
        sc: &Scaling,
        u: &[f64],
        fval: f64,
        g: &[f64],
        d: &[f64],
        mut t: f64,
    ) -> Result<Option<(Vec<f64>, f64)>> {
        for _ in 0..MAX_BACKTRACKS {
            let mut trial: Vec<f64> = u.iter().zip(d).map(|(&ui, &di)| ui + t * di).collect();
            sc.clamp(&mut trial);
            let decrease: f64 =
                g.iter().zip(trial.iter().zip(u)).map(|(gi, (a, b))| gi * (a - b)).sum();
            if !(decrease < 0.0) {
                // Projection removed all movement along a descent direction.
                t *= 0.5;
                continue;
            }
            let x_trial = sc.from_scaled(&trial, &self.bounds);
            let f_trial = objective.eval(&x_trial)?;
            if f_trial.is_finite() && f_trial <= fval + ARMIJO_C1 * decrease {
                return Ok(Some((x_trial, f_trial)));
            }
            t *= 0.5;
        }
        Ok(None)
    }

    /// One iteration from an already evaluated, finite point.
    fn advance(
        &mut self,
        objective: &dyn ObjectiveFunction,
        sc: &Scaling,
        x: Vec<f64>,
        fval: f64,
        grad: &[f64],
    ) -> Result<StepOutcome> {
        let u = sc.to_scaled(&x);
        let g = sc.scaled_gradient(grad);

        let mut accepted = None;
        let mut edm_before_reset = f64::NAN;
        if self.history.newest().is_some() {
            let pg = sc.projected(&u, &g);
            let mut d: Vec<f64> = self.apply_inverse_hessian(&pg).iter().map(|v| -v).collect();
            sc.confine(&u, &mut d);
            if dot(&g, &d) < 0.0 {
                accepted = self.line_search(objective, sc, &u, fval, &g, &d, 1.0)?;
            }
            if accepted.is_none() {
                log::debug!("lbfgs: quasi-Newton step rejected, resetting curvature history");
                edm_before_reset = self.edm(sc, &u, &g);
                self.history.pairs.clear();
            }
        }
        if accepted.is_none() {
            let d: Vec<f64> = sc.projected(&u, &g).iter().map(|&gi| -gi).collect();
            let norm = dot(&d, &d).sqrt();
            if norm > 0.0 {
                accepted = self.line_search(objective, sc, &u, fval, &g, &d, FIRST_STEP / norm)?;
            }
        }

        let Some((x_new, f_new)) = accepted else {
            let edm = if self.history.newest().is_some() {
                self.edm(sc, &u, &g)
            } else {
                edm_before_reset
            };
            let grad_norm = self.projected_norm(&x, grad);
            return Ok(StepOutcome { params: x, fval, grad_norm, edm, stalled: true, non_finite: false });
        };

        let grad_new = objective.gradient(&x_new)?;
        let grad_norm = self.projected_norm(&x_new, &grad_new);
        let finite = grad_new.iter().all(|v| v.is_finite());
        let edm = if finite {
            let u_new = sc.to_scaled(&x_new);
            let g_new = sc.scaled_gradient(&grad_new);
            let s = u_new.iter().zip(&u).map(|(a, b)| a - b).collect();
            let y = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
            self.history.record(s, y);
            self.edm(sc, &u_new, &g_new)
        } else {
            f64::NAN
        };

        self.last = Some(Evaluated { x: x_new.clone(), fval: f_new, grad: grad_new });
        Ok(StepOutcome { params: x_new, fval: f_new, grad_norm, edm, stalled: false, non_finite: !finite })
    }
}

impl Minimizer for LbfgsbMinimizer {
    fn step(&mut self, objective: &dyn ObjectiveFunction, current: &[f64]) -> Result<StepOutcome> {
        let x = self.clamp_to_bounds(current);
        let (fval, grad) = match self.last.as_ref() {
            Some(e) if e.x == x => (e.fval, e.grad.clone()),
            _ => {
                let fval = objective.eval(&x)?;
                let grad = objective.gradient(&x)?;
                self.last = Some(Evaluated { x: x.clone(), fval, grad: grad.clone() });
                (fval, grad)
            }
        };

        if !fval.is_finite() || grad.iter().any(|g| !g.is_finite()) {
            let grad_norm = self.projected_norm(&x, &grad);
            return Ok(StepOutcome {
                params: x,
                fval,
                grad_norm,
                edm: f64::NAN,
                stalled: true,
                non_finite: true,
            });
        }

        let scaling = match self.scaling.take() {
            Some(sc) => sc,
            None => {
                let curvature = diagonal_curvature(objective, &x, fval, &self.bounds)?;
                let sc = Scaling::new(&self.bounds, &x, &curvature);
                log::debug!("lbfgs: error estimates {:?}", sc.error);
                sc
            }
        };
        let outcome = self.advance(objective, &scaling, x, fval, &grad);
        self.scaling = Some(scaling);
        outcome
    }

    fn restart(&mut self) {
        self.history.pairs.clear();
        self.scaling = None;
    }

    fn estimate_covariance(
        &self,
        objective: &dyn ObjectiveFunction,
        params: &[f64],
    ) -> Result<Option<DMatrix<f64>>> {
        let hessian = compute_hessian(objective, params, &self.bounds)?;
        Ok(invert_hessian(&hessian))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_history_keeps_newest_curved_pairs() {
        let mut history = CorrectionHistory::with_capacity(3);
        for i in 1..=5 {
            let v = i as f64;
            assert!(history.record(vec![v, 0.0], vec![2.0 * v, 1.0]));
        }
        // Zero curvature along the step.
        assert!(!history.record(vec![1.0, 0.0], vec![0.0, 1.0]));

        assert_eq!(history.pairs.len(), 3);
        let firsts: Vec<f64> = history.pairs.iter().map(|c| c.s[0]).collect();
        assert_eq!(firsts, [3.0, 4.0, 5.0]);
        let newest = history.newest().unwrap();
        assert_relative_eq!(newest.rho, 1.0 / 50.0);
        assert!(history.is_saturated(2));
        assert!(!CorrectionHistory::with_capacity(3).is_saturated(2));
    }

    #[test]
    fn test_scaling_uses_curvature_not_range() {
        let bounds = [(0.0, 1e10), (0.0, 1.0), (0.0, 1.0)];
        let sc = Scaling::new(&bounds, &[2.0e4, 0.5, 0.5], &[1e-4, f64::NAN, 1e12]);
        assert_relative_eq!(sc.error[0], 100.0);
        assert_relative_eq!(sc.error[1], 0.1);
        // Floored at the finite-difference step.
        assert_relative_eq!(sc.error[2], 1e-4);
        assert_relative_eq!(sc.upper[0], 1e8);

        let x = [3.0e4, 0.25, 0.75];
        let back = sc.from_scaled(&sc.to_scaled(&x), &bounds);
        for (a, b) in back.iter().zip(&x) {
            assert_relative_eq!(*a, *b, max_relative = 1e-12);
        }
    }

    /// Anisotropic quadratic with its minimum at (3, -40).
    struct Bowl;

    impl ObjectiveFunction for Bowl {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok(50.0 * (p[0] - 3.0).powi(2) + 0.01 * (p[1] + 40.0).powi(2))
        }

        fn gradient(&self, p: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![100.0 * (p[0] - 3.0), 0.02 * (p[1] + 40.0)])
        }
    }

    fn run(minimizer: &mut LbfgsbMinimizer, x0: &[f64], iters: usize) -> StepOutcome {
        let mut x = x0.to_vec();
        let mut last = None;
        for _ in 0..iters {
            let out = minimizer.step(&Bowl, &x).unwrap();
            x = out.params.clone();
            let done = out.stalled || out.edm < 1e-12;
            last = Some(out);
            if done {
                break;
            }
        }
        last.unwrap()
    }

    #[test]
    fn test_minimizes_badly_scaled_quadratic() {
        let mut m = LbfgsbMinimizer::new(vec![(0.0, 10.0), (-100.0, 100.0)], 5);
        let out = run(&mut m, &[9.0, 90.0], 200);
        assert_relative_eq!(out.params[0], 3.0, epsilon = 1e-4);
        assert_relative_eq!(out.params[1], -40.0, epsilon = 1e-2);
        assert!(out.fval < 1e-6);
    }

    #[test]
    fn test_active_bound_is_respected() {
        // The unconstrained minimum x1 = -40 lies below the box.
        let mut m = LbfgsbMinimizer::new(vec![(0.0, 10.0), (-10.0, 100.0)], 5);
        let out = run(&mut m, &[9.0, 50.0], 200);
        assert_relative_eq!(out.params[0], 3.0, epsilon = 1e-4);
        assert_eq!(out.params[1], -10.0);
        assert!(out.grad_norm < 1e-3);
    }

    /// Narrow well at `x = 2e5` inside a range of 1e10, like an event yield.
    struct Yield;

    impl ObjectiveFunction for Yield {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok(((p[0] - 2.0e5) / 500.0).powi(2) + 50.0 * (p[1] - 0.3).powi(2))
        }

        fn gradient(&self, p: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![2.0 * (p[0] - 2.0e5) / 250_000.0, 100.0 * (p[1] - 0.3)])
        }
    }

    #[test]
    fn test_wide_bounds_do_not_hide_the_minimum() {
        let mut m = LbfgsbMinimizer::new(vec![(0.0, 1.0e10), (0.0, 1.0)], 5);
        let mut x = vec![1.5e5, 0.6];
        let mut last = None;
        for _ in 0..100 {
            let out = m.step(&Yield, &x).unwrap();
            x = out.params.clone();
            let done = out.stalled || out.edm < 1e-10;
            last = Some(out);
            if done {
                break;
            }
        }
        let out = last.unwrap();
        assert_relative_eq!(out.params[0], 2.0e5, epsilon = 1.0);
        assert_relative_eq!(out.params[1], 0.3, epsilon = 1e-4);
        assert!(out.fval < 1e-6);
    }

    #[test]
    fn test_restart_discards_curvature() {
        let mut m = LbfgsbMinimizer::new(vec![(0.0, 10.0), (-100.0, 100.0)], 5);
        let out = m.step(&Bowl, &[9.0, 90.0]).unwrap();
        m.step(&Bowl, &out.params).unwrap();
        assert!(m.history.newest().is_some());
        m.restart();
        assert!(m.history.newest().is_none());
        assert!(m.scaling.is_none());
        // Picks up from the same point with fresh estimates.
        let again = m.step(&Bowl, &out.params).unwrap();
        assert!(again.fval.is_finite());
        assert!(m.scaling.is_some());
    }

    #[test]
    fn test_covariance_of_quadratic() {
        let m = LbfgsbMinimizer::new(vec![(0.0, 10.0), (-100.0, 100.0)], 5);
        let cov = m.estimate_covariance(&Bowl, &[3.0, -40.0]).unwrap().unwrap();
        assert_relative_eq!(cov[(0, 0)], 1.0 / 100.0, max_relative = 1e-6);
        assert_relative_eq!(cov[(1, 1)], 1.0 / 0.02, max_relative = 1e-6);
    }
}
