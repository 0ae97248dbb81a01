//! Negative binomial distribution utilities

use statrs::function::gamma::ln_gamma;

/// Lower bound on mu when forming IRLS weights and working responses
pub const MIN_MU: f64 = 0.5;

/// Any |beta| above this aborts IRLS (about 43 on the log2 scale)
pub const MAX_LFC_BETA: f64 = 30.0;

/// Clamp on the linear predictor to keep `exp` finite
pub const MAX_ETA: f64 = 700.0;

/// mu = size_factor * exp(eta)
pub fn nb_mean(eta: f64, size_factor: f64) -> f64 {
    size_factor * eta.clamp(-MAX_ETA, MAX_ETA).exp()
}

/// Var(Y) = mu + alpha * mu^2
pub fn nb_variance(mu: f64, alpha: f64) -> f64 {
    mu + alpha * mu * mu
}

/// Log probability of count `y` under NB(mean `mu`, dispersion `alpha`).
///
/// Uses the size parameterisation `size = 1/alpha`. A zero mean gives
/// probability one for `y = 0`; a non-positive `alpha` is treated as the
/// Poisson limit.
pub fn nb_log_likelihood(y: f64, mu: f64, alpha: f64) -> f64 {
    if mu <= 0.0 {
        return if y == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }
    if alpha <= 0.0 {
        return y * mu.ln() - mu - ln_gamma(y + 1.0);
    }

    let size = 1.0 / alpha;
    let log_denom = (size + mu).ln();
    let mut ll = ln_gamma(y + size) - ln_gamma(size) - ln_gamma(y + 1.0)
        + size * (size.ln() - log_denom);
    if y > 0.0 {
        ll += y * (mu.ln() - log_denom);
    }
    ll
}

/// Sum of [`nb_log_likelihood`] over a gene's samples
pub fn nb_total_log_likelihood(counts: &[f64], mu: &[f64], alpha: f64) -> f64 {
    counts
        .iter()
        .zip(mu)
        .map(|(&y, &m)| nb_log_likelihood(y, m, alpha))
        .sum()
}

/// IRLS weight `mu / (1 + alpha * mu)`; `mu` should already be floored at [`MIN_MU`]
pub fn nb_weight(mu: f64, alpha: f64) -> f64 {
    mu / (1.0 + alpha * mu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nb_mean() {
        let mu = nb_mean(2.0, 1.0);
        assert!((mu - 2.0_f64.exp()).abs() < 1e-10);
        assert!(nb_mean(1e6, 1.0).is_finite());
    }

    #[test]
    fn test_nb_variance() {
        assert!((nb_variance(10.0, 0.1) - 20.0).abs() < 1e-10);
    }

    #[test]
    fn test_nb_log_likelihood_matches_pmf() {
        // NB(mu = 2, alpha = 1) is geometric with p = 1/3: P(0) = 1/3, P(1) = 2/9
        let p0 = nb_log_likelihood(0.0, 2.0, 1.0).exp();
        let p1 = nb_log_likelihood(1.0, 2.0, 1.0).exp();
        assert!((p0 - 1.0 / 3.0).abs() < 1e-12);
        assert!((p1 - 2.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_nb_log_likelihood_poisson_limit() {
        let nb = nb_log_likelihood(5.0, 5.0, 1e-9);
        let pois = nb_log_likelihood(5.0, 5.0, 0.0);
        assert!((nb - pois).abs() < 1e-6);
    }

    #[test]
    fn test_zero_mean() {
        assert_eq!(nb_log_likelihood(0.0, 0.0, 0.1), 0.0);
        assert_eq!(nb_log_likelihood(3.0, 0.0, 0.1), f64::NEG_INFINITY);
    }

    #[test]
    fn test_nb_weight() {
        let w = nb_weight(10.0, 0.1);
        assert!((w - 5.0).abs() < 1e-10);
    }
}
