//! Size factor estimation using the median of ratios method

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::data::CountMatrix;
use crate::error::{NbLrtError, Result};
use crate::stats::median;

/// Method for size factor estimation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SizeFactorMethod {
    /// Median of ratios over genes with no zero count
    #[default]
    Ratio,
    /// Zero-tolerant variant: geometric means over positive counts only
    PosCounts,
}

/// Estimate one scaling factor per sample
pub fn estimate_size_factors(counts: &CountMatrix, method: SizeFactorMethod) -> Result<Array1<f64>> {
    let view = counts.counts();
    let (n_genes, n_samples) = view.dim();
    if n_samples < 2 {
        return Err(NbLrtError::DegenerateInput {
            reason: format!("size factors need at least 2 samples, got {}", n_samples),
        });
    }
    if n_genes == 0 {
        return Err(NbLrtError::DegenerateInput {
            reason: "count matrix has no genes".to_string(),
        });
    }

    let size_factors = match method {
        SizeFactorMethod::Ratio => median_of_ratios(view)?,
        SizeFactorMethod::PosCounts => median_of_ratios_poscounts(view)?,
    };

    if let Some((j, sf)) = size_factors
        .iter()
        .enumerate()
        .find(|(_, &s)| !(s.is_finite() && s > 0.0))
    {
        return Err(NbLrtError::DegenerateInput {
            reason: format!(
                "size factor for sample '{}' is {}",
                counts.sample_ids()[j],
                sf
            ),
        });
    }

    log::info!(
        "Size factors ({:?}): {}",
        method,
        size_factors
            .iter()
            .map(|s| format!("{:.4}", s))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(size_factors)
}

/// Standard median of ratios.
///
/// The reference is the per-gene geometric mean over genes whose counts are
/// all positive; each sample's factor is the median of its ratios to it.
fn median_of_ratios(counts: ArrayView2<f64>) -> Result<Array1<f64>> {
    let n_samples = counts.ncols();

    let reference: Vec<(usize, f64)> = counts
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, row)| row.iter().all(|&x| x > 0.0))
        .map(|(i, row)| (i, row.iter().map(|&x| x.ln()).sum::<f64>() / n_samples as f64))
        .collect();

    if reference.len() < 2 {
        return Err(NbLrtError::DegenerateInput {
            reason: format!(
                "median of ratios needs at least 2 genes with a non-zero geometric mean, found {}",
                reference.len()
            ),
        });
    }

    let factors = (0..n_samples)
        .map(|j| {
            let log_ratios: Vec<f64> = reference
                .iter()
                .map(|&(i, log_geo)| counts[[i, j]].ln() - log_geo)
                .collect();
            median(&log_ratios).exp()
        })
        .collect();

    Ok(Array1::from_vec(factors))
}

/// Geometric means over positive counts (zeros contribute nothing to the
/// log sum but still count in the denominator), ratios over positive counts,
/// then rescaled to a geometric mean of one.
fn median_of_ratios_poscounts(counts: ArrayView2<f64>) -> Result<Array1<f64>> {
    let n_samples = counts.ncols();

    let reference: Vec<(usize, f64)> = counts
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, row)| row.iter().any(|&x| x > 0.0))
        .map(|(i, row)| {
            let log_sum: f64 = row.iter().filter(|&&x| x > 0.0).map(|&x| x.ln()).sum();
            (i, log_sum / n_samples as f64)
        })
        .collect();

    if reference.len() < 2 {
        return Err(NbLrtError::DegenerateInput {
            reason: format!(
                "poscounts size factors need at least 2 genes with a positive count, found {}",
                reference.len()
            ),
        });
    }

    let mut factors = Vec::with_capacity(n_samples);
    for j in 0..n_samples {
        let ratios: Vec<f64> = reference
            .iter()
            .filter(|&&(i, _)| counts[[i, j]] > 0.0)
            .map(|&(i, log_geo)| counts[[i, j]] / log_geo.exp())
            .collect();
        if ratios.is_empty() {
            return Err(NbLrtError::DegenerateInput {
                reason: format!("sample {} has no positive counts", j),
            });
        }
        factors.push(median(&ratios));
    }

    let log_center = factors.iter().map(|s| s.ln()).sum::<f64>() / n_samples as f64;
    Ok(factors.iter().map(|s| s / log_center.exp()).collect())
}

/// Validates caller-supplied size factors against the count matrix
pub fn validate_size_factors(values: &[f64], counts: &CountMatrix) -> Result<Array1<f64>> {
    if values.len() != counts.n_samples() {
        return Err(NbLrtError::DimensionMismatch {
            expected: format!("{} size factors", counts.n_samples()),
            got: values.len().to_string(),
        });
    }
    if let Some(bad) = values.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
        return Err(NbLrtError::InvalidInput {
            reason: format!("size factors must be positive and finite, got {}", bad),
        });
    }
    Ok(Array1::from_vec(values.to_vec()))
}

/// Counts divided by their sample's size factor
pub fn normalized_counts(counts: &CountMatrix, size_factors: &Array1<f64>) -> Array2<f64> {
    let mut normalized = counts.counts().to_owned();
    for (mut col, &sf) in normalized.axis_iter_mut(Axis(1)).zip(size_factors.iter()) {
        col.mapv_inplace(|x| x / sf);
    }
    normalized
}

/// Mean of normalized counts per gene
pub fn base_means(counts: &CountMatrix, size_factors: &Array1<f64>) -> Vec<f64> {
    normalized_counts(counts, size_factors)
        .mean_axis(Axis(1))
        .map(|m| m.to_vec())
        .unwrap_or_default()
}
