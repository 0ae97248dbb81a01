//! Width of the log-normal dispersion prior
//!
//! The spread of `ln(gene-wise) - ln(trend)` contains both the true
//! biological spread and the sampling noise of the gene-wise estimate. The
//! expected sampling variance, `trigamma((m - p) / 2)`, is subtracted off.
//! With three or fewer residual degrees of freedom that approximation is
//! poor and the prior variance is matched by simulation instead.

use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::{ChiSquared, Normal};

use crate::linalg::{solve_spd, weighted_cross, weighted_gram};
use crate::stats::{mad_squared, trigamma};

/// Floor on the prior variance
pub const MIN_PRIOR_VAR: f64 = 0.25;
/// Gene-wise estimates below this are left out of the residual spread
const MIN_GENE_DISP: f64 = 1e-6;

const SIMULATION_SEED: u64 = 2;
const SIMULATION_DRAWS: usize = 10_000;
const CANDIDATE_COUNT: usize = 200;
const FINE_GRID_COUNT: usize = 1000;
const MAX_CANDIDATE_VAR: f64 = 8.0;
const HIST_LIMIT: f64 = 10.0;
const HIST_BIN_WIDTH: f64 = 0.5;
const LOESS_SPAN: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorVariance {
    /// Variance of the normal prior on `ln(alpha)`
    pub prior_var: f64,
    /// Robust (MAD-based) variance of the log residuals
    pub var_log_disp_ests: f64,
}

/// Estimates the prior variance from paired gene-wise and trended dispersions
pub fn estimate_prior_variance(
    gene_wise: &[f64],
    trended: &[f64],
    n_samples: usize,
    n_coefs: usize,
) -> PriorVariance {
    let residuals: Vec<f64> = gene_wise
        .iter()
        .zip(trended)
        .filter(|(&g, &t)| g.is_finite() && g >= MIN_GENE_DISP && t > 0.0 && t.is_finite())
        .map(|(&g, &t)| g.ln() - t.ln())
        .collect();

    if residuals.len() < 3 {
        log::warn!(
            "only {} genes usable for the dispersion prior; using variance {}",
            residuals.len(),
            MIN_PRIOR_VAR
        );
        return PriorVariance {
            prior_var: MIN_PRIOR_VAR,
            var_log_disp_ests: MIN_PRIOR_VAR,
        };
    }

    let var_log_disp_ests = mad_squared(&residuals);

    let prior_var = if n_samples <= n_coefs {
        MIN_PRIOR_VAR
    } else {
        let df = (n_samples - n_coefs) as f64;
        if df <= 3.0 {
            simulated_prior_variance(&residuals, df)
        } else {
            (var_log_disp_ests - trigamma(df / 2.0)).max(MIN_PRIOR_VAR)
        }
    };

    log::info!(
        "Dispersion prior: var(log residuals) = {:.4}, prior variance = {:.4}",
        var_log_disp_ests,
        prior_var
    );

    PriorVariance {
        prior_var,
        var_log_disp_ests,
    }
}

fn histogram_density(values: &[f64]) -> Vec<f64> {
    let n_bins = (2.0 * HIST_LIMIT / HIST_BIN_WIDTH) as usize;
    let mut counts = vec![0usize; n_bins];
    let mut total = 0usize;
    for &v in values {
        if v > -HIST_LIMIT && v < HIST_LIMIT {
            let bin = (((v + HIST_LIMIT) / HIST_BIN_WIDTH) as usize).min(n_bins - 1);
            counts[bin] += 1;
            total += 1;
        }
    }
    if total == 0 {
        return vec![0.0; n_bins];
    }
    counts
        .into_iter()
        .map(|c| c as f64 / (total as f64 * HIST_BIN_WIDTH))
        .collect()
}

fn kl_divergence(observed: &[f64], simulated: &[f64]) -> f64 {
    let small = observed
        .iter()
        .chain(simulated)
        .copied()
        .filter(|&x| x > 0.0)
        .fold(f64::INFINITY, f64::min);
    if !small.is_finite() {
        return f64::INFINITY;
    }
    observed
        .iter()
        .zip(simulated)
        .filter(|(&o, _)| o > 0.0)
        .map(|(&o, &s)| o * ((o + small).ln() - (s + small).ln()))
        .sum()
}

/// Picks the prior variance whose simulated residual distribution
/// `ln(chi2_df / df) + N(0, v)` is closest in KL divergence to the observed
/// residuals. The KL curve over candidate variances is loess-smoothed before
/// taking the minimum.
fn simulated_prior_variance(residuals: &[f64], df: f64) -> f64 {
    let (chi_sq, std_normal) = match (ChiSquared::new(df), Normal::new(0.0, 1.0)) {
        (Ok(c), Ok(n)) => (c, n),
        _ => return MIN_PRIOR_VAR,
    };
    let observed = histogram_density(residuals);
    if observed.iter().all(|&d| d == 0.0) {
        return MIN_PRIOR_VAR;
    }

    let mut rng = StdRng::seed_from_u64(SIMULATION_SEED);
    let log_df = df.ln();
    let candidates: Vec<f64> = (0..CANDIDATE_COUNT)
        .map(|i| i as f64 * MAX_CANDIDATE_VAR / (CANDIDATE_COUNT - 1) as f64)
        .collect();

    let kl: Vec<f64> = candidates
        .iter()
        .map(|&v| {
            let chi: Vec<f64> = (0..SIMULATION_DRAWS).map(|_| chi_sq.sample(&mut rng)).collect();
            let sd = v.sqrt();
            let draws: Vec<f64> = chi
                .iter()
                .map(|&c| c.ln() + sd * std_normal.sample(&mut rng) - log_df)
                .collect();
            kl_divergence(&observed, &histogram_density(&draws))
        })
        .collect();

    let fine: Vec<f64> = (0..FINE_GRID_COUNT)
        .map(|i| i as f64 * MAX_CANDIDATE_VAR / (FINE_GRID_COUNT - 1) as f64)
        .collect();
    let argmin = fine
        .iter()
        .map(|&x| (x, loess_predict(&candidates, &kl, x, LOESS_SPAN)))
        .filter(|(_, y)| y.is_finite())
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(MIN_PRIOR_VAR, |(x, _)| x);

    log::debug!("simulated prior variance: df={}, argmin KL={:.4}", df, argmin);
    argmin.max(MIN_PRIOR_VAR)
}

/// Local quadratic regression with tricube weights over the nearest
/// `span * n` points, evaluated at `at`
fn loess_predict(x: &[f64], y: &[f64], at: f64, span: f64) -> f64 {
    let mut neighbours: Vec<(f64, usize)> = x
        .iter()
        .enumerate()
        .filter(|(i, _)| y[*i].is_finite())
        .map(|(i, &xi)| ((xi - at).abs(), i))
        .collect();
    if neighbours.is_empty() {
        return f64::NAN;
    }
    neighbours.sort_by(|a, b| a.0.total_cmp(&b.0));
    let q = ((span * x.len() as f64).floor() as usize).clamp(3, neighbours.len());
    neighbours.truncate(q);

    let h = neighbours.last().map_or(0.0, |n| n.0);
    let h = if h > 0.0 { h * 1.000001 } else { 1.0 };

    let mut design = ndarray::Array2::<f64>::zeros((q, 3));
    let mut w = Vec::with_capacity(q);
    let mut ys = Vec::with_capacity(q);
    for (row, &(d, i)) in neighbours.iter().enumerate() {
        let dx = x[i] - at;
        design[[row, 0]] = 1.0;
        design[[row, 1]] = dx;
        design[[row, 2]] = dx * dx;
        w.push((1.0 - (d / h).powi(3)).powi(3));
        ys.push(y[i]);
    }

    // centred at `at`, so the intercept is the prediction
    match solve_spd(&weighted_gram(&design, &w), &weighted_cross(&design, &w, &ys)) {
        Some(beta) => beta[0],
        None => {
            let sw: f64 = w.iter().sum();
            w.iter().zip(&ys).map(|(wi, yi)| wi * yi).sum::<f64>() / sw
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_df_subtracts_sampling_variance() {
        // scaled MAD of the log residuals is exactly 2
        let gene: Vec<f64> = [-4.0, -2.0, 0.0, 2.0, 4.0]
            .iter()
            .map(|r: &f64| (0.1f64.ln() + r / 1.4826).exp())
            .collect();
        let trend = vec![0.1; 5];
        let pv = estimate_prior_variance(&gene, &trend, 20, 2);
        assert!((pv.var_log_disp_ests - 4.0).abs() < 1e-9);
        assert!(pv.prior_var > 3.0);
        let expected = (pv.var_log_disp_ests - trigamma(9.0)).max(MIN_PRIOR_VAR);
        assert!((pv.prior_var - expected).abs() < 1e-12);
    }

    #[test]
    fn test_floor_and_saturated_designs() {
        let gene = vec![0.1, 0.11, 0.09, 0.1];
        let trend = vec![0.1; 4];
        assert_eq!(estimate_prior_variance(&gene, &trend, 20, 2).prior_var, MIN_PRIOR_VAR);
        assert_eq!(estimate_prior_variance(&gene, &trend, 3, 3).prior_var, MIN_PRIOR_VAR);
        assert_eq!(estimate_prior_variance(&gene[..2], &trend[..2], 20, 2).prior_var, MIN_PRIOR_VAR);
    }

    #[test]
    fn test_tiny_estimates_are_ignored() {
        let gene = vec![1e-8, 0.1, 0.2, 0.05, 0.1];
        let trend = vec![0.1; 5];
        let with_tiny = estimate_prior_variance(&gene, &trend, 20, 2);
        let without = estimate_prior_variance(&gene[1..], &trend[1..], 20, 2);
        assert_eq!(with_tiny, without);
    }

    #[test]
    fn test_simulated_prior_is_reproducible_and_tracks_spread() {
        let narrow: Vec<f64> = (0..300)
            .map(|i| ((i % 13) as f64 - 6.0) / 6.0 * 0.6 - 0.3)
            .collect();
        let wide: Vec<f64> = narrow.iter().map(|r| r * 4.0).collect();
        let a = simulated_prior_variance(&narrow, 2.0);
        let b = simulated_prior_variance(&narrow, 2.0);
        assert_eq!(a, b);
        let c = simulated_prior_variance(&wide, 2.0);
        assert!(c >= a);
        assert!(a >= MIN_PRIOR_VAR && c <= MAX_CANDIDATE_VAR);
    }

    #[test]
    fn test_loess_reproduces_a_parabola() {
        let x: Vec<f64> = (0..50).map(|i| i as f64 / 10.0).collect();
        let y: Vec<f64> = x.iter().map(|v| (v - 2.0).powi(2) + 1.0).collect();
        for at in [0.55, 2.0, 3.33] {
            let fitted = loess_predict(&x, &y, at, 0.2);
            assert!((fitted - ((at - 2.0f64).powi(2) + 1.0)).abs() < 1e-8);
        }
    }

    #[test]
    fn test_histogram_density_integrates_to_one() {
        let d = histogram_density(&[-0.2, 0.1, 0.3, 12.0, -11.0]);
        let total: f64 = d.iter().sum::<f64>() * HIST_BIN_WIDTH;
        assert!((total - 1.0).abs() < 1e-12);
    }
}
