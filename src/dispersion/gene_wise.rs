//! Gene-wise dispersion estimation using Cox-Reid adjusted profile likelihood

use std::collections::HashSet;

use ndarray::Array2;

use super::cox_reid::{armijo_line_search, grid_search};
use super::DispersionParams;
use crate::glm::{irls_fitted_mu, MIN_MU};
use crate::linalg::{solve_spd, weighted_cross, weighted_gram};

/// Outcome of [`estimate_gene_wise`] for one gene
#[derive(Debug, Clone)]
pub struct GeneWiseFit {
    pub alpha: f64,
    /// Fitted means the estimate was profiled at; reused by MAP shrinkage
    pub mu: Vec<f64>,
    pub iterations: usize,
    /// Line search converged without needing the grid
    pub converged: bool,
}

/// True when the design has exactly as many distinct rows as columns,
/// i.e. every sample belongs to one of p groups and the fitted means are
/// plain group means.
pub fn is_linear_mu(design: &Array2<f64>) -> bool {
    let rows: HashSet<Vec<u64>> = design
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|x| x.to_bits()).collect())
        .collect();
    rows.len() == design.ncols()
}

/// Least-squares fit of `y` on the design, returned as fitted values
fn linear_model_fit(y: &[f64], design: &Array2<f64>) -> Vec<f64> {
    let ones = vec![1.0; y.len()];
    let beta = solve_spd(&weighted_gram(design, &ones), &weighted_cross(design, &ones, y))
        .unwrap_or_else(|| {
            let mut b = vec![0.0; design.ncols()];
            b[0] = y.iter().sum::<f64>() / y.len() as f64;
            b
        });
    (0..y.len())
        .map(|i| beta.iter().enumerate().map(|(j, b)| design[[i, j]] * b).sum())
        .collect()
}

/// Method-of-moments estimate against linear-model means floored at 1:
/// `sum(((y - mu)^2 - mu) / mu^2) / (m - p)`, floored at zero
fn rough_disp_estimate(normalized: &[f64], design: &Array2<f64>) -> f64 {
    let m = normalized.len();
    let p = design.ncols();
    if m <= p {
        return 0.0;
    }
    let mu = linear_model_fit(normalized, design);
    let sum: f64 = normalized
        .iter()
        .zip(&mu)
        .map(|(&y, &mu)| {
            let mu = mu.max(1.0);
            ((y - mu).powi(2) - mu) / (mu * mu)
        })
        .sum();
    (sum / (m - p) as f64).max(0.0)
}

/// `(var - xim * mean) / mean^2` with `xim` the mean of inverse size factors
fn moments_disp_estimate(normalized: &[f64], xim: f64) -> f64 {
    let n = normalized.len() as f64;
    let mean = normalized.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return f64::INFINITY;
    }
    let var = if n > 1.0 {
        normalized.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)
    } else {
        0.0
    };
    (var - xim * mean) / (mean * mean)
}

/// Estimates one gene's dispersion by maximizing the Cox-Reid adjusted
/// profile likelihood at fixed fitted means.
///
/// The starting value is the smaller of the rough and moments estimates.
/// If the search does not improve on it, it is kept. A search that fails to
/// converge (or stops after one step) is redone on the grid unless the
/// estimate is already near `min_disp`; with grid fallback disabled that is
/// an error instead.
pub fn estimate_gene_wise(
    counts: &[f64],
    size_factors: &[f64],
    design: &Array2<f64>,
    xim: f64,
    max_disp: f64,
    use_linear_mu: bool,
    params: &DispersionParams,
) -> Result<GeneWiseFit, String> {
    let min_disp = params.min_disp;
    let normalized: Vec<f64> = counts
        .iter()
        .zip(size_factors)
        .map(|(&c, &s)| c / s)
        .collect();

    let rough = rough_disp_estimate(&normalized, design);
    let moments = moments_disp_estimate(&normalized, xim);
    let alpha_init = rough.min(moments).clamp(min_disp, max_disp);

    let mu: Vec<f64> = if use_linear_mu {
        linear_model_fit(&normalized, design)
            .iter()
            .zip(size_factors)
            .map(|(&m, &s)| (m * s).max(MIN_MU))
            .collect()
    } else {
        irls_fitted_mu(counts, size_factors, design, alpha_init)
    };

    let search = armijo_line_search(counts, design, &mu, alpha_init.ln(), None, params);
    let no_increase = search.final_lp < search.initial_lp + search.initial_lp.abs() / 1e6;
    let mut alpha = if no_increase {
        alpha_init
    } else {
        search.log_alpha.exp()
    };

    let converged = search.iterations < params.maxit && search.iterations != 1;
    if !converged && alpha > 10.0 * min_disp {
        if !params.grid_fallback {
            return Err(format!(
                "line search did not converge ({} iterations)",
                search.iterations
            ));
        }
        alpha = grid_search(counts, design, &mu, min_disp, max_disp, None);
    }

    if !alpha.is_finite() {
        return Err(format!("non-finite gene-wise estimate {}", alpha));
    }

    Ok(GeneWiseFit {
        alpha: alpha.clamp(min_disp, max_disp),
        mu,
        iterations: search.iterations,
        converged,
    })
}
