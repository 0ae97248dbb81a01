//! Cox-Reid adjusted profile likelihood for the dispersion parameter
//!
//! Shared by the gene-wise (no prior) and MAP (log-normal prior) estimators.
//! Everything is parameterised by `log(alpha)`, with `mu` held fixed.

use ndarray::Array2;
use statrs::function::gamma::{digamma, ln_gamma};

use super::DispersionParams;
use crate::linalg::{invert_spd, log_det_spd, trace_of_product, weighted_gram};

/// Hard bounds on line-search proposals in log space
const LOG_ALPHA_LOWER: f64 = -30.0;
const LOG_ALPHA_UPPER: f64 = 10.0;
/// Armijo sufficient-decrease constant
const ARMIJO_EPSILON: f64 = 1.0e-4;
const GRID_POINTS: usize = 20;
const MIN_MU_FLOOR: f64 = 1e-10;

/// Normal prior on `log(alpha)`, centred on the trended dispersion
#[derive(Debug, Clone, Copy)]
pub struct LogDispersionPrior {
    pub mean: f64,
    pub variance: f64,
}

/// Cox-Reid adjusted log-likelihood (plus optional prior) at `log_alpha`
pub fn log_posterior(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    log_alpha: f64,
    prior: Option<&LogDispersionPrior>,
) -> f64 {
    let alpha = log_alpha.exp();
    let alpha_inv = 1.0 / alpha;

    let mut ll = 0.0;
    let mut w = Vec::with_capacity(counts.len());
    for (&y, &m) in counts.iter().zip(mu) {
        let m = m.max(MIN_MU_FLOOR);
        ll += ln_gamma(y + alpha_inv) - ln_gamma(alpha_inv)
            - y * (m + alpha_inv).ln()
            - alpha_inv * (1.0 + m * alpha).ln();
        w.push(1.0 / (1.0 / m + alpha));
    }

    let cr = log_det_spd(&weighted_gram(design, &w)).map_or(0.0, |ld| -0.5 * ld);
    let prior_term = prior.map_or(0.0, |p| -0.5 * (log_alpha - p.mean).powi(2) / p.variance);

    ll + cr + prior_term
}

/// Derivative of [`log_posterior`] with respect to `log(alpha)`
pub fn d_log_posterior(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    log_alpha: f64,
    prior: Option<&LogDispersionPrior>,
) -> f64 {
    let alpha = log_alpha.exp();
    let alpha_inv = 1.0 / alpha;
    let dg_inv = digamma(alpha_inv);

    let mut ll_sum = 0.0;
    let mut w = Vec::with_capacity(counts.len());
    let mut dw = Vec::with_capacity(counts.len());
    for (&y, &m) in counts.iter().zip(mu) {
        let m = m.max(MIN_MU_FLOOR);
        ll_sum += dg_inv + (1.0 + m * alpha).ln() - m * alpha / (1.0 + m * alpha)
            - digamma(y + alpha_inv)
            + y / (m + alpha_inv);
        let wi = 1.0 / (1.0 / m + alpha);
        w.push(wi);
        dw.push(-wi * wi);
    }
    let ll_part = alpha_inv * alpha_inv * ll_sum;

    let b = weighted_gram(design, &w);
    let db = weighted_gram(design, &dw);
    let cr_part = invert_spd(&b).map_or(0.0, |b_inv| -0.5 * trace_of_product(&b_inv, &db));

    let prior_part = prior.map_or(0.0, |p| -(log_alpha - p.mean) / p.variance);

    (ll_part + cr_part) * alpha + prior_part
}

/// Outcome of [`armijo_line_search`]
#[derive(Debug, Clone, Copy)]
pub struct LineSearchOutcome {
    pub log_alpha: f64,
    pub initial_lp: f64,
    pub final_lp: f64,
    /// Iterations used, `maxit` when the search ran out
    pub iterations: usize,
}

impl LineSearchOutcome {
    pub fn hit_maxit(&self, maxit: usize) -> bool {
        self.iterations >= maxit
    }
}

/// Gradient ascent in `log(alpha)` with Armijo backtracking.
///
/// The step size `kappa` grows by 10% after each accepted step (capped at
/// `kappa_0`), is halved every fifth accepted step and after every rejection.
/// Stops once an accepted step improves the objective by less than
/// `disp_tol`, or once `log_alpha` falls below `ln(min_disp / 10)`.
pub fn armijo_line_search(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    start_log_alpha: f64,
    prior: Option<&LogDispersionPrior>,
    params: &DispersionParams,
) -> LineSearchOutcome {
    let min_log_alpha = (params.min_disp / 10.0).ln();

    let mut log_alpha = start_log_alpha;
    let initial_lp = log_posterior(counts, design, mu, log_alpha, prior);
    let mut lp = initial_lp;
    let mut dlp = d_log_posterior(counts, design, mu, log_alpha, prior);
    let mut kappa = params.kappa_0;
    let mut accepted = 0usize;
    let mut iterations = params.maxit;

    for iter in 0..params.maxit {
        let raw = log_alpha + kappa * dlp;
        if raw < LOG_ALPHA_LOWER && dlp != 0.0 {
            kappa = (LOG_ALPHA_LOWER - log_alpha) / dlp;
        }
        if raw > LOG_ALPHA_UPPER && dlp != 0.0 {
            kappa = (LOG_ALPHA_UPPER - log_alpha) / dlp;
        }
        let proposal = log_alpha + kappa * dlp;

        let lp_proposal = log_posterior(counts, design, mu, proposal, prior);
        if -lp_proposal <= -lp - kappa * ARMIJO_EPSILON * dlp * dlp {
            accepted += 1;
            log_alpha = proposal;
            let change = lp_proposal - lp;
            lp = lp_proposal;

            if change < params.disp_tol || log_alpha < min_log_alpha {
                iterations = iter + 1;
                break;
            }

            dlp = d_log_posterior(counts, design, mu, log_alpha, prior);
            kappa = (kappa * 1.1).min(params.kappa_0);
            if accepted % 5 == 0 {
                kappa /= 2.0;
            }
        } else {
            kappa /= 2.0;
        }
    }

    LineSearchOutcome {
        log_alpha,
        initial_lp,
        final_lp: lp,
        iterations,
    }
}

fn argmax(grid: &[f64], values: &[f64]) -> f64 {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if v.is_finite() && (!values[best].is_finite() || *v > values[best]) {
            best = i;
        }
    }
    grid[best]
}

/// Coarse-then-fine grid search over `[ln min_disp, ln max_disp]`.
/// Returns the dispersion (not its log) at the best fine-grid point.
pub fn grid_search(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    min_disp: f64,
    max_disp: f64,
    prior: Option<&LogDispersionPrior>,
) -> f64 {
    let lo = min_disp.ln();
    let hi = max_disp.ln();
    let delta = (hi - lo) / (GRID_POINTS - 1) as f64;

    let evaluate = |grid: &[f64]| -> Vec<f64> {
        grid.iter()
            .map(|&la| log_posterior(counts, design, mu, la, prior))
            .collect()
    };

    let coarse: Vec<f64> = (0..GRID_POINTS).map(|i| lo + i as f64 * delta).collect();
    let center = argmax(&coarse, &evaluate(&coarse));

    let fine_delta = 2.0 * delta / (GRID_POINTS - 1) as f64;
    let fine: Vec<f64> = (0..GRID_POINTS)
        .map(|i| center - delta + i as f64 * fine_delta)
        .collect();
    argmax(&fine, &evaluate(&fine)).exp()
}
