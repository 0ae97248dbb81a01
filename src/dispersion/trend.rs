//! Dispersion trend fitting
//!
//! The trend is the one cross-gene synchronization point of the pipeline:
//! it needs every gene-wise estimate before any gene can be shrunk.

use serde::{Deserialize, Serialize};

use crate::error::{NbLrtError, Result};
use crate::stats::trimmed_mean;

/// Estimates at or below this are treated as "zero dispersion" and left out
/// of the parametric fit
const MIN_TREND_DISP: f64 = 1e-6;
const OUTER_ITERATIONS: usize = 11;
const OUTER_TOL: f64 = 1e-6;
const GAMMA_IRLS_MAXIT: usize = 25;
const GAMMA_IRLS_TOL: f64 = 1e-8;
const MEAN_TRIM: f64 = 0.001;

/// Method for fitting the dispersion-mean trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrendFitMethod {
    /// `disp = asymptDisp + extraPois / mean`
    #[default]
    Parametric,
    /// A single trimmed-mean dispersion for all genes
    Mean,
}

/// A fitted dispersion trend
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DispersionTrend {
    Parametric { asympt_disp: f64, extra_pois: f64 },
    Mean { value: f64 },
}

impl DispersionTrend {
    /// Trended dispersion at a given mean of normalized counts
    pub fn eval(&self, mean: f64) -> f64 {
        match *self {
            DispersionTrend::Parametric {
                asympt_disp,
                extra_pois,
            } => {
                if mean > 0.0 {
                    asympt_disp + extra_pois / mean
                } else {
                    asympt_disp
                }
            }
            DispersionTrend::Mean { value } => value,
        }
    }

    pub fn describe(&self) -> String {
        match *self {
            DispersionTrend::Parametric {
                asympt_disp,
                extra_pois,
            } => format!("parametric: {:.6} + {:.6}/mean", asympt_disp, extra_pois),
            DispersionTrend::Mean { value } => format!("mean: {:.6}", value),
        }
    }
}

/// Fit the dispersion trend from gene-wise estimates.
///
/// `means` and `dispersions` are paired per gene; non-finite estimates are
/// ignored. The parametric fit falls back to the mean trend when it fails.
pub fn fit_dispersion_trend(
    means: &[f64],
    dispersions: &[f64],
    method: TrendFitMethod,
    min_disp: f64,
) -> Result<DispersionTrend> {
    if means.len() != dispersions.len() {
        return Err(NbLrtError::DimensionMismatch {
            expected: format!("{} dispersion estimates", means.len()),
            got: dispersions.len().to_string(),
        });
    }

    match method {
        TrendFitMethod::Parametric => match fit_parametric_trend(means, dispersions) {
            Ok(trend) => Ok(trend),
            Err(e) => {
                log::info!("{}; using the mean dispersion as trend", e);
                fit_mean_trend(dispersions, min_disp)
            }
        },
        TrendFitMethod::Mean => fit_mean_trend(dispersions, min_disp),
    }
}

fn fit_mean_trend(dispersions: &[f64], min_disp: f64) -> Result<DispersionTrend> {
    let finite: Vec<f64> = dispersions.iter().copied().filter(|d| d.is_finite()).collect();
    let usable: Vec<f64> = finite
        .iter()
        .copied()
        .filter(|&d| d > 10.0 * min_disp)
        .collect();

    let value = if usable.is_empty() {
        if finite.is_empty() {
            return Err(NbLrtError::DegenerateInput {
                reason: "no gene produced a usable dispersion estimate".to_string(),
            });
        }
        finite.iter().sum::<f64>() / finite.len() as f64
    } else {
        trimmed_mean(&usable, MEAN_TRIM)
    };

    Ok(DispersionTrend::Mean {
        value: value.max(min_disp),
    })
}

fn fit_parametric_trend(means: &[f64], dispersions: &[f64]) -> Result<DispersionTrend> {
    let data: Vec<(f64, f64)> = means
        .iter()
        .zip(dispersions)
        .filter(|(&m, &d)| m > 0.0 && d > MIN_TREND_DISP && d.is_finite())
        .map(|(&m, &d)| (m, d))
        .collect();

    if data.len() < 3 {
        return Err(NbLrtError::TrendFittingFailed {
            reason: format!("only {} genes usable for the parametric trend", data.len()),
        });
    }

    let mut coefs = (0.1_f64, 1.0_f64);
    for iter in 0..OUTER_ITERATIONS {
        let old = coefs;

        let good: Vec<(f64, f64)> = data
            .iter()
            .copied()
            .filter(|&(m, d)| {
                let fitted = coefs.0 + coefs.1 / m;
                if fitted <= 0.0 {
                    return false;
                }
                let ratio = d / fitted;
                ratio > 1e-4 && ratio < 15.0
            })
            .collect();

        if good.len() < 3 {
            return Err(NbLrtError::TrendFittingFailed {
                reason: "too few genes with acceptable residuals".to_string(),
            });
        }

        let (new_coefs, glm_converged) = fit_gamma_identity(&good, coefs);
        coefs = new_coefs;
        log::debug!(
            "parametric trend iteration {}: {} genes, a0={:.6}, a1={:.6}",
            iter + 1,
            good.len(),
            coefs.0,
            coefs.1
        );

        if !(coefs.0 > 0.0 && coefs.1 > 0.0) {
            return Err(NbLrtError::TrendFittingFailed {
                reason: format!(
                    "parametric coefficients not positive (a0={:.4}, a1={:.4})",
                    coefs.0, coefs.1
                ),
            });
        }

        let change = (coefs.0 / old.0).ln().powi(2) + (coefs.1 / old.1).ln().powi(2);
        if change < OUTER_TOL && glm_converged {
            return Ok(DispersionTrend::Parametric {
                asympt_disp: coefs.0,
                extra_pois: coefs.1,
            });
        }
    }

    Err(NbLrtError::TrendFittingFailed {
        reason: "parametric dispersion fit did not converge".to_string(),
    })
}

fn gamma_deviance(data: &[(f64, f64)], a0: f64, a1: f64) -> f64 {
    data.iter()
        .map(|&(m, d)| {
            let mu = (a0 + a1 / m).max(1e-8);
            2.0 * (-(d / mu).ln() + (d - mu) / mu)
        })
        .sum()
}

/// Gamma-family GLM with identity link, `disp ~ 1 + I(1/mean)`.
/// Returns the coefficients and whether the deviance converged.
fn fit_gamma_identity(data: &[(f64, f64)], start: (f64, f64)) -> ((f64, f64), bool) {
    let (mut a0, mut a1) = start;
    let mut dev_old = gamma_deviance(data, a0, a1);

    for _ in 0..GAMMA_IRLS_MAXIT {
        let (mut sw, mut swx, mut swz, mut swxx, mut swxz) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for &(m, d) in data {
            let x = 1.0 / m;
            let mu = (a0 + a1 * x).max(1e-8);
            let w = 1.0 / (mu * mu);
            sw += w;
            swx += w * x;
            swz += w * d;
            swxx += w * x * x;
            swxz += w * x * d;
        }

        let det = sw * swxx - swx * swx;
        if det.abs() < 1e-10 {
            return ((a0, a1), false);
        }
        a0 = (swxx * swz - swx * swxz) / det;
        a1 = (sw * swxz - swx * swz) / det;

        let dev = gamma_deviance(data, a0, a1);
        if (dev_old - dev).abs() / (0.1 + dev.abs()) < GAMMA_IRLS_TOL {
            return ((a0, a1), true);
        }
        dev_old = dev;
    }

    ((a0, a1), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gamma_glm_identity_recovers_curve() {
        let data: Vec<(f64, f64)> = (1..50)
            .map(|i| {
                let x = i as f64 * 20.0 + 100.0;
                (x, 0.1 + 10.0 / x)
            })
            .collect();
        let ((a0, a1), converged) = fit_gamma_identity(&data, (0.1, 1.0));
        assert!(converged);
        assert!((a0 - 0.1).abs() < 1e-6);
        assert!((a1 - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_parametric_trend_on_noisy_curve() {
        let means: Vec<f64> = (1..200).map(|i| i as f64 * 5.0).collect();
        let disps: Vec<f64> = means
            .iter()
            .enumerate()
            .map(|(i, &m)| {
                let noise = if i % 2 == 0 { 1.2 } else { 0.85 };
                (0.05 + 2.0 / m) * noise
            })
            .collect();
        let trend = fit_dispersion_trend(&means, &disps, TrendFitMethod::Parametric, 1e-8).unwrap();
        match trend {
            DispersionTrend::Parametric {
                asympt_disp,
                extra_pois,
            } => {
                assert!(asympt_disp > 0.0 && asympt_disp < 0.1);
                assert!(extra_pois > 1.0 && extra_pois < 3.0);
            }
            other => panic!("expected parametric trend, got {:?}", other),
        }
        assert!(trend.eval(10.0) > trend.eval(500.0));
    }

    #[test]
    fn test_parametric_falls_back_to_mean_with_too_few_genes() {
        let trend =
            fit_dispersion_trend(&[10.0, 20.0], &[0.2, 0.4], TrendFitMethod::Parametric, 1e-8)
                .unwrap();
        match trend {
            DispersionTrend::Mean { value } => assert!((value - 0.3).abs() < 1e-12),
            other => panic!("expected mean trend, got {:?}", other),
        }
    }

    #[test]
    fn test_mean_trend_ignores_near_zero_estimates() {
        let trend = fit_dispersion_trend(
            &[1.0, 2.0, 3.0],
            &[1e-8, 0.1, 0.3],
            TrendFitMethod::Mean,
            1e-8,
        )
        .unwrap();
        assert!((trend.eval(5.0) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_no_usable_estimate_is_degenerate() {
        let err = fit_dispersion_trend(&[1.0], &[f64::NAN], TrendFitMethod::Mean, 1e-8).unwrap_err();
        assert!(matches!(err, NbLrtError::DegenerateInput { .. }));
    }
}
