//! GLM fitting using Iteratively Reweighted Least Squares (IRLS)

use std::f64::consts::{LN_2, LOG2_E};

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::design::ModelMatrix;
use super::negative_binomial::{nb_mean, nb_total_log_likelihood, nb_weight, MAX_LFC_BETA, MIN_MU};
use crate::data::CountMatrix;
use crate::error::{FitStage, NbLrtError, Result};
use crate::linalg::{
    add_ridge, invert_spd, sandwich, solve_spd, solve_spd_stabilized, weighted_cross, weighted_gram,
};

/// Configurable parameters for GLM fitting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlmFitParams {
    /// Maximum IRLS iterations
    pub maxit: usize,
    /// Relative deviance change treated as converged
    pub beta_tol: f64,
    /// Ridge added to every diagonal entry of X'WX (natural-log scale)
    pub ridge: f64,
    /// Maximum sweeps of the coordinate-wise Newton fallback
    pub fallback_maxit: usize,
}

impl Default for GlmFitParams {
    fn default() -> Self {
        Self {
            maxit: 100,
            beta_tol: 1e-8,
            // 1e-6 on the log2 scale
            ridge: 1e-6 / (LN_2 * LN_2),
            fallback_maxit: 5000,
        }
    }
}

impl GlmFitParams {
    /// Looser settings used only to obtain fitted means for dispersion estimation
    pub fn for_dispersion_mu() -> Self {
        Self {
            maxit: 100,
            beta_tol: 1e-6,
            ridge: 1e-6,
            fallback_maxit: 0,
        }
    }
}

/// How a [`GeneFit`] was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMethod {
    /// Intercept-only design, solved directly
    ClosedForm,
    Irls,
    /// IRLS failed; coordinate-wise Newton with Armijo backtracking
    CoordinateNewton,
}

/// Per-gene fit of one design
#[derive(Debug, Clone)]
pub struct GeneFit {
    /// Natural-log scale coefficients, in design column order
    pub coefficients: Vec<f64>,
    pub standard_errors: Vec<f64>,
    pub log_likelihood: f64,
    /// `-2 * log_likelihood`
    pub deviance: f64,
    /// Fitted means, unclamped
    pub mu: Vec<f64>,
    pub iterations: usize,
    pub method: FitMethod,
    pub converged: bool,
}

impl GeneFit {
    pub fn log2_coefficient(&self, column: usize) -> f64 {
        self.coefficients[column] * LOG2_E
    }

    pub fn log2_standard_error(&self, column: usize) -> f64 {
        self.standard_errors[column] * LOG2_E
    }
}

fn linear_predictor(design: &Array2<f64>, beta: &[f64], row: usize) -> f64 {
    beta.iter()
        .enumerate()
        .map(|(j, b)| design[[row, j]] * b)
        .sum()
}

fn fitted_means(design: &Array2<f64>, beta: &[f64], size_factors: &[f64]) -> Vec<f64> {
    size_factors
        .iter()
        .enumerate()
        .map(|(i, &sf)| nb_mean(linear_predictor(design, beta, i), sf))
        .collect()
}

fn clamped_means(design: &Array2<f64>, beta: &[f64], size_factors: &[f64]) -> Vec<f64> {
    fitted_means(design, beta, size_factors)
        .into_iter()
        .map(|m| m.max(MIN_MU))
        .collect()
}

fn is_intercept_only(design: &Array2<f64>) -> bool {
    design.ncols() == 1 && design.iter().all(|&x| x == 1.0)
}

fn mean_normalized(counts: &[f64], size_factors: &[f64]) -> f64 {
    counts
        .iter()
        .zip(size_factors)
        .map(|(&y, &s)| y / s)
        .sum::<f64>()
        / counts.len() as f64
}

/// OLS of `ln(y/sf + 0.1)` on the design, or the log mean in the intercept
/// when that system cannot be solved
fn initial_beta(counts: &[f64], size_factors: &[f64], design: &Array2<f64>) -> Vec<f64> {
    let log_norm: Vec<f64> = counts
        .iter()
        .zip(size_factors)
        .map(|(&y, &s)| (y / s + 0.1).ln())
        .collect();
    let ones = vec![1.0; counts.len()];
    let xtx = weighted_gram(design, &ones);
    let xty = weighted_cross(design, &ones, &log_norm);

    solve_spd(&xtx, &xty)
        .filter(|b| b.iter().all(|v| v.is_finite()))
        .unwrap_or_else(|| {
            let mut b = vec![0.0; design.ncols()];
            b[0] = mean_normalized(counts, size_factors).max(0.1).ln();
            b
        })
}

struct IrlsOutcome {
    beta: Vec<f64>,
    iterations: usize,
    converged: bool,
}

/// Ridge-penalised IRLS with deviance-based convergence.
///
/// An update with any |beta| above [`MAX_LFC_BETA`] or a NaN deviance stops
/// the loop unconverged; the returned `beta` is then the last accepted one.
fn irls(
    counts: &[f64],
    size_factors: &[f64],
    design: &Array2<f64>,
    alpha: f64,
    params: &GlmFitParams,
    start: Vec<f64>,
) -> IrlsOutcome {
    let n = counts.len();
    let mut beta = start;
    let mut mu = clamped_means(design, &beta, size_factors);
    let mut dev_old = 0.0f64;

    for t in 0..params.maxit {
        let w: Vec<f64> = mu.iter().map(|&m| nb_weight(m, alpha)).collect();
        let z: Vec<f64> = (0..n)
            .map(|i| (mu[i] / size_factors[i]).ln() + (counts[i] - mu[i]) / mu[i])
            .collect();

        let mut xtwx = weighted_gram(design, &w);
        add_ridge(&mut xtwx, params.ridge);
        let next = solve_spd_stabilized(&xtwx, &weighted_cross(design, &w, &z));

        if next.iter().any(|b| !b.is_finite() || b.abs() > MAX_LFC_BETA) {
            return IrlsOutcome {
                beta,
                iterations: t + 1,
                converged: false,
            };
        }
        beta = next;
        mu = clamped_means(design, &beta, size_factors);

        let dev = -2.0 * nb_total_log_likelihood(counts, &mu, alpha);
        let conv_test = (dev - dev_old).abs() / (dev.abs() + 0.1);
        if conv_test.is_nan() {
            return IrlsOutcome {
                beta,
                iterations: t + 1,
                converged: false,
            };
        }
        if t > 0 && conv_test < params.beta_tol {
            return IrlsOutcome {
                beta,
                iterations: t + 1,
                converged: true,
            };
        }
        dev_old = dev;
    }

    IrlsOutcome {
        beta,
        iterations: params.maxit,
        converged: false,
    }
}

/// Coordinate-wise Newton ascent on the exact NB log-likelihood.
///
/// Each coefficient takes a Newton step along its own axis, backtracked until
/// the Armijo condition holds, and is kept within `[-MAX_LFC_BETA, MAX_LFC_BETA]`.
/// Returns the coefficients, sweeps used and whether the relative change in
/// log-likelihood fell below `tol` with every coefficient inside the bound.
/// A coefficient held at the bound means the optimum lies outside it.
fn coordinate_newton(
    counts: &[f64],
    size_factors: &[f64],
    design: &Array2<f64>,
    alpha: f64,
    start: Vec<f64>,
    max_sweeps: usize,
    tol: f64,
) -> (Vec<f64>, usize, bool) {
    const ARMIJO_C: f64 = 1e-4;
    const MAX_HALVINGS: usize = 30;

    let n = counts.len();
    let log_lik = |beta: &[f64]| {
        nb_total_log_likelihood(counts, &fitted_means(design, beta, size_factors), alpha)
    };

    let mut beta: Vec<f64> = start
        .into_iter()
        .map(|b| b.clamp(-MAX_LFC_BETA, MAX_LFC_BETA))
        .collect();
    let mut ll = log_lik(&beta);

    for sweep in 0..max_sweeps {
        let ll_start = ll;

        for j in 0..beta.len() {
            let mu = fitted_means(design, &beta, size_factors);
            let mut grad = 0.0;
            let mut hess = 0.0;
            for i in 0..n {
                let x = design[[i, j]];
                grad += (counts[i] - mu[i]) / (1.0 + alpha * mu[i]) * x;
                hess -= nb_weight(mu[i], alpha) * x * x;
            }
            if hess.abs() < 1e-20 {
                continue;
            }
            let delta = -grad / hess;
            if delta.abs() < 1e-14 {
                continue;
            }

            let old = beta[j];
            let mut step = 1.0;
            let mut improved = false;
            for _ in 0..MAX_HALVINGS {
                beta[j] = (old + step * delta).clamp(-MAX_LFC_BETA, MAX_LFC_BETA);
                let candidate = log_lik(&beta);
                if candidate >= ll + ARMIJO_C * step * grad * delta {
                    ll = candidate;
                    improved = true;
                    break;
                }
                step *= 0.5;
            }
            if !improved {
                beta[j] = old;
            }
        }

        if (ll - ll_start).abs() / (ll.abs() + 0.1) < tol {
            let pinned = beta.iter().any(|b| b.abs() >= MAX_LFC_BETA);
            return (beta, sweep + 1, ll.is_finite() && !pinned);
        }
    }

    (beta, max_sweeps, false)
}

/// Standard errors from `(X'WX + R)^-1 X'WX (X'WX + R)^-1`
fn sandwich_standard_errors(design: &Array2<f64>, weights: &[f64], ridge: f64) -> Vec<f64> {
    let xtwx = weighted_gram(design, weights);
    let mut penalized = xtwx.clone();
    add_ridge(&mut penalized, ridge);

    match invert_spd(&penalized) {
        Some(inv) => {
            let cov = sandwich(&inv, &xtwx);
            (0..design.ncols()).map(|j| cov[[j, j]].max(0.0).sqrt()).collect()
        }
        None => vec![f64::NAN; design.ncols()],
    }
}

/// Fits one gene at a fixed dispersion.
///
/// Intercept-only designs use the closed form `ln(mean(y / sf))`. Otherwise
/// IRLS runs first and the coordinate-wise fallback takes over when IRLS does
/// not converge. `converged` is false only when every path failed.
pub fn fit_gene(
    counts: &[f64],
    size_factors: &[f64],
    design: &Array2<f64>,
    alpha: f64,
    params: &GlmFitParams,
) -> GeneFit {
    let (beta, iterations, method, converged) = if is_intercept_only(design) {
        let mean = mean_normalized(counts, size_factors);
        let b0 = if mean > 0.0 { mean.ln() } else { -MAX_LFC_BETA };
        (vec![b0], 0, FitMethod::ClosedForm, true)
    } else {
        let start = initial_beta(counts, size_factors, design);
        let outcome = irls(counts, size_factors, design, alpha, params, start.clone());
        if outcome.converged {
            (outcome.beta, outcome.iterations, FitMethod::Irls, true)
        } else {
            let from = if outcome
                .beta
                .iter()
                .all(|b| b.is_finite() && b.abs() < MAX_LFC_BETA)
            {
                outcome.beta
            } else {
                start
            };
            let (beta, sweeps, converged) = coordinate_newton(
                counts,
                size_factors,
                design,
                alpha,
                from,
                params.fallback_maxit,
                params.beta_tol,
            );
            (
                beta,
                outcome.iterations + sweeps,
                FitMethod::CoordinateNewton,
                converged,
            )
        }
    };

    let mu = fitted_means(design, &beta, size_factors);
    let log_likelihood = nb_total_log_likelihood(counts, &mu, alpha);
    let weights: Vec<f64> = mu.iter().map(|&m| nb_weight(m.max(MIN_MU), alpha)).collect();
    let standard_errors = sandwich_standard_errors(design, &weights, params.ridge);

    GeneFit {
        coefficients: beta,
        standard_errors,
        log_likelihood,
        deviance: -2.0 * log_likelihood,
        mu,
        iterations,
        method,
        converged: converged && log_likelihood.is_finite(),
    }
}

/// Fitted means (floored at [`MIN_MU`]) from a plain IRLS run at `alpha`.
/// Used by gene-wise dispersion estimation for designs that are not simple
/// group models.
pub fn irls_fitted_mu(
    counts: &[f64],
    size_factors: &[f64],
    design: &Array2<f64>,
    alpha: f64,
) -> Vec<f64> {
    let params = GlmFitParams::for_dispersion_mu();
    let start = initial_beta(counts, size_factors, design);
    let outcome = irls(counts, size_factors, design, alpha, &params, start);
    clamped_means(design, &outcome.beta, size_factors)
}

/// Fits `genes` (row indices of `counts`) in parallel, each at the dispersion
/// in the same position of `dispersions`. Results keep the order of `genes`.
pub fn fit_genes(
    counts: &CountMatrix,
    size_factors: &[f64],
    design: &ModelMatrix,
    genes: &[usize],
    dispersions: &[f64],
    stage: FitStage,
    params: &GlmFitParams,
) -> Vec<Result<GeneFit>> {
    genes
        .par_iter()
        .zip(dispersions.par_iter())
        .map(|(&g, &alpha)| {
            let y = counts.gene_counts(g).to_vec();
            let fit = fit_gene(&y, size_factors, &design.matrix, alpha, params);
            if fit.converged {
                Ok(fit)
            } else {
                let gene_id = &counts.gene_ids()[g];
                let reason = format!(
                    "{:?} fit did not converge after {} iterations (log-likelihood {})",
                    fit.method, fit.iterations, fit.log_likelihood
                );
                log::debug!("{}: {}", gene_id, reason);
                Err(NbLrtError::divergence(gene_id, stage, reason))
            }
        })
        .collect()
}
