//! Maximum a posteriori dispersion shrinkage toward the fitted trend

use ndarray::Array2;

use super::cox_reid::{armijo_line_search, grid_search, LogDispersionPrior};
use super::DispersionParams;

/// Upper bound on the MAP starting point in log space
const MAX_START_LOG_ALPHA: f64 = 10.0;

/// MAP estimate for one gene
#[derive(Debug, Clone, Copy)]
pub struct MapFit {
    pub alpha: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Maximizes the Cox-Reid likelihood plus a normal prior on `ln(alpha)`
/// centred at `ln(trended)` with variance `prior_var`.
///
/// Starts from the gene-wise estimate unless it is below a tenth of the
/// trend, in which case the trend is the better starting point.
#[allow(clippy::too_many_arguments)]
pub fn fit_map_dispersion(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    gene_wise: f64,
    trended: f64,
    prior_var: f64,
    max_disp: f64,
    params: &DispersionParams,
) -> Result<MapFit, String> {
    if !(trended.is_finite() && trended > 0.0) {
        return Err(format!("trended dispersion {} is not positive", trended));
    }

    let prior = LogDispersionPrior {
        mean: trended.ln(),
        variance: prior_var,
    };
    let start = if gene_wise > 0.1 * trended {
        gene_wise
    } else {
        trended
    };
    let start_log = start
        .ln()
        .clamp((params.min_disp / 10.0).ln(), MAX_START_LOG_ALPHA);

    let search = armijo_line_search(counts, design, mu, start_log, Some(&prior), params);
    let converged = !search.hit_maxit(params.maxit);
    let alpha = if converged {
        search.log_alpha.exp()
    } else if params.grid_fallback {
        grid_search(counts, design, mu, params.min_disp, max_disp, Some(&prior))
    } else {
        return Err(format!(
            "MAP line search did not converge ({} iterations)",
            search.iterations
        ));
    };

    if !alpha.is_finite() {
        return Err(format!("non-finite MAP estimate {}", alpha));
    }

    Ok(MapFit {
        alpha: alpha.clamp(params.min_disp, max_disp),
        iterations: search.iterations,
        converged,
    })
}

/// True when the gene-wise estimate lies more than `outlier_sd` robust
/// standard deviations above the trend
pub fn is_dispersion_outlier(
    gene_wise: f64,
    trended: f64,
    var_log_disp_ests: f64,
    outlier_sd: f64,
) -> bool {
    let excess = gene_wise.ln() - trended.ln();
    excess.is_finite() && excess > outlier_sd * var_log_disp_ests.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn two_group(n_per: usize) -> Array2<f64> {
        let mut x = Array2::zeros((2 * n_per, 2));
        for i in 0..2 * n_per {
            x[[i, 0]] = 1.0;
            if i >= n_per {
                x[[i, 1]] = 1.0;
            }
        }
        x
    }

    #[test]
    fn test_map_lies_between_gene_wise_and_trend() {
        let counts = [20.0, 60.0, 35.0, 90.0, 30.0, 55.0];
        let mu = [38.3, 38.3, 38.3, 58.3, 58.3, 58.3];
        let x = two_group(3);
        let params = DispersionParams::default();

        let gene_wise = armijo_line_search(&counts, &x, &mu, (0.1f64).ln(), None, &params)
            .log_alpha
            .exp();
        let trended = 0.02;
        let map = fit_map_dispersion(&counts, &x, &mu, gene_wise, trended, 0.5, 10.0, &params).unwrap();
        assert!(map.alpha < gene_wise, "{} !< {}", map.alpha, gene_wise);
        assert!(map.alpha > trended);
    }

    #[test]
    fn test_narrow_prior_pins_to_trend() {
        let counts = [20.0, 60.0, 35.0, 90.0, 30.0, 55.0];
        let mu = [38.3, 38.3, 38.3, 58.3, 58.3, 58.3];
        let x = two_group(3);
        let params = DispersionParams::default();
        let map = fit_map_dispersion(&counts, &x, &mu, 0.3, 0.05, 1e-4, 10.0, &params).unwrap();
        assert!((map.alpha.ln() - (0.05f64).ln()).abs() < 0.1);
    }

    #[test]
    fn test_invalid_trend_is_rejected() {
        let x = two_group(2);
        let params = DispersionParams::default();
        assert!(fit_map_dispersion(&[1.0, 2.0, 3.0, 4.0], &x, &[2.0; 4], 0.1, 0.0, 0.5, 10.0, &params).is_err());
    }

    #[test]
    fn test_outlier_rule() {
        // one robust SD = 0.5 in log space
        assert!(is_dispersion_outlier(0.1 * (1.2f64).exp(), 0.1, 0.25, 2.0));
        assert!(!is_dispersion_outlier(0.1 * (0.8f64).exp(), 0.1, 0.25, 2.0));
        // shrinkage never flags genes below the trend
        assert!(!is_dispersion_outlier(0.001, 0.1, 0.25, 2.0));
        assert!(!is_dispersion_outlier(f64::NAN, 0.1, 0.25, 2.0));
    }
}
