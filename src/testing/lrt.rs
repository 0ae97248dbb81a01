//! Likelihood ratio test between nested negative binomial GLMs
//!
//! For each gene the statistic is `2 * (ll_full - ll_reduced)`, referred to
//! a chi-squared distribution with `p_full - p_reduced` degrees of freedom.
//! Adjusted p-values are computed only across the genes tested here.

use statrs::distribution::{ChiSquared, ContinuousCDF};

use super::fdr::benjamini_hochberg;
use crate::error::{NbLrtError, Result};
use crate::glm::GeneFit;

/// Test outcome for one gene
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrtOutcome {
    pub stat: f64,
    pub pvalue: f64,
    pub padj: f64,
}

/// `max(0, 2 * (ll_full - ll_reduced))`.
///
/// A reduced fit can end up marginally better than the full one through
/// optimizer tolerance; that is reported as no evidence, not a negative
/// statistic.
pub fn lrt_statistic(ll_full: f64, ll_reduced: f64) -> f64 {
    let stat = 2.0 * (ll_full - ll_reduced);
    if stat.is_nan() {
        return f64::NAN;
    }
    stat.max(0.0)
}

fn chi_squared(df: usize) -> Result<ChiSquared> {
    if df == 0 {
        return Err(NbLrtError::InvalidDesign {
            reason: "likelihood ratio test needs at least one degree of freedom".to_string(),
        });
    }
    ChiSquared::new(df as f64).map_err(|e| NbLrtError::InvalidDesign {
        reason: format!("chi-squared distribution with {} df: {}", df, e),
    })
}

/// Upper-tail chi-squared probability of `stat`
pub fn chi_squared_pvalue(stat: f64, df: usize) -> Result<f64> {
    let dist = chi_squared(df)?;
    Ok(upper_tail(&dist, stat))
}

fn upper_tail(dist: &ChiSquared, stat: f64) -> f64 {
    if stat.is_nan() {
        return f64::NAN;
    }
    dist.sf(stat).clamp(0.0, 1.0)
}

/// Runs the test over `(full, reduced)` fit pairs and adjusts the p-values
/// across exactly these pairs. Output order follows the input.
pub fn likelihood_ratio_test(pairs: &[(&GeneFit, &GeneFit)], df: usize) -> Result<Vec<LrtOutcome>> {
    let dist = chi_squared(df)?;

    let (stats, pvalues): (Vec<f64>, Vec<f64>) = pairs
        .iter()
        .map(|(full, reduced)| {
            let stat = lrt_statistic(full.log_likelihood, reduced.log_likelihood);
            (stat, upper_tail(&dist, stat))
        })
        .unzip();
    let padj = benjamini_hochberg(&pvalues);

    log::info!(
        "Likelihood ratio test on {} genes with {} degree(s) of freedom",
        pairs.len(),
        df
    );

    Ok(stats
        .into_iter()
        .zip(pvalues)
        .zip(padj)
        .map(|((stat, pvalue), padj)| LrtOutcome { stat, pvalue, padj })
        .collect())
}
