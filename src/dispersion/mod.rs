//! Dispersion estimation for negative binomial models
//!
//! Three stages: a gene-wise Cox-Reid estimate per gene, a dispersion-mean
//! trend across genes, and MAP shrinkage of each gene toward the trend.

mod cox_reid;
mod gene_wise;
mod map;
mod prior;
mod trend;

pub use gene_wise::{estimate_gene_wise, is_linear_mu, GeneWiseFit};
pub use map::{fit_map_dispersion, is_dispersion_outlier, MapFit};
pub use prior::{estimate_prior_variance, PriorVariance, MIN_PRIOR_VAR};
pub use trend::{fit_dispersion_trend, DispersionTrend, TrendFitMethod};

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::CountMatrix;
use crate::error::{FitStage, NbLrtError, Result};
use crate::normalization::base_means;

/// Configurable parameters for dispersion estimation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispersionParams {
    /// Lower bound on every dispersion estimate
    pub min_disp: f64,
    /// Line search stops once an accepted step gains less than this
    pub disp_tol: f64,
    /// Initial (and maximum) line search step size
    pub kappa_0: f64,
    /// Maximum line search iterations
    pub maxit: usize,
    /// Gene-wise estimates this many robust SDs above the trend are kept unshrunk
    pub outlier_sd: f64,
    /// Refit non-converged line searches on a grid instead of failing the gene
    pub grid_fallback: bool,
}

impl Default for DispersionParams {
    fn default() -> Self {
        Self {
            min_disp: 1e-8,
            disp_tol: 1e-6,
            kappa_0: 1.0,
            maxit: 100,
            outlier_sd: 2.0,
            grid_fallback: true,
        }
    }
}

impl DispersionParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_disp > 0.0 && self.min_disp.is_finite()) {
            return Err(NbLrtError::InvalidConfig {
                reason: format!("min_disp must be positive, got {}", self.min_disp),
            });
        }
        if !(self.disp_tol > 0.0) || !(self.kappa_0 > 0.0) {
            return Err(NbLrtError::InvalidConfig {
                reason: "disp_tol and kappa_0 must be positive".to_string(),
            });
        }
        if self.maxit == 0 {
            return Err(NbLrtError::InvalidConfig {
                reason: "dispersion maxit must be at least 1".to_string(),
            });
        }
        if !(self.outlier_sd >= 0.0) {
            return Err(NbLrtError::InvalidConfig {
                reason: format!("outlier_sd must be non-negative, got {}", self.outlier_sd),
            });
        }
        Ok(())
    }
}

/// All dispersion quantities for one gene
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeneDispersion {
    pub base_mean: f64,
    pub gene_wise: f64,
    pub trended: f64,
    pub map: f64,
    /// Dispersion used by the GLM fits: `map`, or `gene_wise` for outliers
    pub final_value: f64,
    pub outlier: bool,
}

/// Run-level dispersion results
#[derive(Debug)]
pub struct DispersionEstimates {
    /// One entry per gene of the input matrix, in row order
    pub genes: Vec<Result<GeneDispersion>>,
    pub trend: DispersionTrend,
    pub prior_variance: f64,
    pub var_log_disp_ests: f64,
}

impl DispersionEstimates {
    pub fn n_outliers(&self) -> usize {
        self.genes
            .iter()
            .filter(|g| matches!(g, Ok(d) if d.outlier))
            .count()
    }

    pub fn n_failed(&self) -> usize {
        self.genes.iter().filter(|g| g.is_err()).count()
    }
}

/// Estimates gene-wise, trended and final dispersions for every gene.
///
/// Genes whose estimation fails carry `Err(FitDivergence)` in
/// [`DispersionEstimates::genes`]; only run-level problems return `Err`.
pub fn estimate_dispersions(
    counts: &CountMatrix,
    size_factors: &Array1<f64>,
    design: &Array2<f64>,
    fit_type: TrendFitMethod,
    params: &DispersionParams,
) -> Result<DispersionEstimates> {
    let n_samples = counts.n_samples();
    let n_coefs = design.ncols();
    if design.nrows() != n_samples {
        return Err(NbLrtError::DimensionMismatch {
            expected: format!("{} design rows", n_samples),
            got: design.nrows().to_string(),
        });
    }
    if n_samples <= n_coefs {
        return Err(NbLrtError::InvalidDesign {
            reason: format!(
                "{} samples for {} coefficients leaves no residual degrees of freedom",
                n_samples, n_coefs
            ),
        });
    }

    let sf = size_factors.to_vec();
    let xim = sf.iter().map(|s| 1.0 / s).sum::<f64>() / n_samples as f64;
    let max_disp = (n_samples as f64).max(10.0);
    let use_linear_mu = is_linear_mu(design);
    let means = base_means(counts, size_factors);
    let gene_ids = counts.gene_ids();

    log::info!(
        "Estimating gene-wise dispersions for {} genes ({} mu)",
        counts.n_genes(),
        if use_linear_mu { "linear model" } else { "IRLS" }
    );
    let gene_wise: Vec<std::result::Result<GeneWiseFit, String>> = (0..counts.n_genes())
        .into_par_iter()
        .map(|g| {
            let y = counts.gene_counts(g).to_vec();
            estimate_gene_wise(&y, &sf, design, xim, max_disp, use_linear_mu, params)
        })
        .collect();

    let fitted: Vec<&GeneWiseFit> = gene_wise.iter().filter_map(|r| r.as_ref().ok()).collect();
    let n_unconverged = fitted.iter().filter(|fit| !fit.converged).count();
    if n_unconverged > 0 {
        log::info!("{} gene-wise line searches did not converge", n_unconverged);
    }
    log::debug!(
        "Gene-wise line search used at most {} iterations",
        fitted.iter().map(|fit| fit.iterations).max().unwrap_or(0)
    );

    let gene_values: Vec<f64> = gene_wise
        .iter()
        .map(|r| r.as_ref().map_or(f64::NAN, |fit| fit.alpha))
        .collect();
    let trend = fit_dispersion_trend(&means, &gene_values, fit_type, params.min_disp)?;
    log::info!("Dispersion trend: {}", trend.describe());

    let trended: Vec<f64> = means.iter().map(|&m| trend.eval(m)).collect();
    let prior = estimate_prior_variance(&gene_values, &trended, n_samples, n_coefs);

    log::info!("Shrinking dispersions toward the trend");
    let genes: Vec<Result<GeneDispersion>> = gene_wise
        .into_par_iter()
        .enumerate()
        .map(|(g, fit)| -> Result<GeneDispersion> {
            let fit = fit.map_err(|reason| {
                log::debug!("{}: gene-wise dispersion failed: {}", gene_ids[g], reason);
                NbLrtError::divergence(&gene_ids[g], FitStage::Dispersion, reason)
            })?;
            let y = counts.gene_counts(g).to_vec();
            let map = fit_map_dispersion(
                &y,
                design,
                &fit.mu,
                fit.alpha,
                trended[g],
                prior.prior_var,
                max_disp,
                params,
            )
            .map_err(|reason| {
                log::debug!("{}: MAP dispersion failed: {}", gene_ids[g], reason);
                NbLrtError::divergence(&gene_ids[g], FitStage::Dispersion, reason)
            })?;

            let outlier = is_dispersion_outlier(
                fit.alpha,
                trended[g],
                prior.var_log_disp_ests,
                params.outlier_sd,
            );
            Ok(GeneDispersion {
                base_mean: means[g],
                gene_wise: fit.alpha,
                trended: trended[g],
                map: map.alpha,
                final_value: if outlier { fit.alpha } else { map.alpha },
                outlier,
            })
        })
        .collect();

    let estimates = DispersionEstimates {
        genes,
        trend,
        prior_variance: prior.prior_var,
        var_log_disp_ests: prior.var_log_disp_ests,
    };
    if estimates.n_failed() > 0 {
        log::warn!(
            "Dispersion estimation failed for {} genes; they will not be tested",
            estimates.n_failed()
        );
    }
    log::info!("{} dispersion outliers kept at their gene-wise value", estimates.n_outliers());

    Ok(estimates)
}
