//! Statistical utility functions shared across modules
//!
//! Robust location/scale summaries used by the dispersion trend and the
//! dispersion prior, plus the trigamma function which `statrs` does not
//! provide.

/// Consistency constant making the MAD an estimate of the normal SD
pub const MAD_SCALE: f64 = 1.4826;

fn sorted_finite(values: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| !x.is_nan()).collect();
    v.sort_by(|a, b| a.total_cmp(b));
    v
}

fn median_of_sorted(v: &[f64]) -> f64 {
    let n = v.len();
    if n == 0 {
        return f64::NAN;
    }
    if n % 2 == 0 {
        (v[n / 2 - 1] + v[n / 2]) / 2.0
    } else {
        v[n / 2]
    }
}

/// Median ignoring NaN entries. Returns NaN for empty input.
pub fn median(values: &[f64]) -> f64 {
    median_of_sorted(&sorted_finite(values))
}

/// Squared median absolute deviation, scaled by [`MAD_SCALE`]
pub fn mad_squared(values: &[f64]) -> f64 {
    let sorted = sorted_finite(values);
    if sorted.is_empty() {
        return 0.0;
    }
    let center = median_of_sorted(&sorted);
    let deviations: Vec<f64> = sorted.iter().map(|&x| (x - center).abs()).collect();
    let mad = median(&deviations) * MAD_SCALE;
    mad * mad
}

/// Mean after dropping `floor(n * trim)` observations from each end.
/// Falls back to the median when nothing would remain.
pub fn trimmed_mean(values: &[f64], trim: f64) -> f64 {
    let sorted = sorted_finite(values);
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    let lo = ((n as f64) * trim.clamp(0.0, 0.5)).floor() as usize;
    let hi = n.saturating_sub(lo);
    if lo >= hi {
        return median_of_sorted(&sorted);
    }
    let kept = &sorted[lo..hi];
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Trigamma function, the derivative of digamma
pub fn trigamma(x: f64) -> f64 {
    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).powi(2) - trigamma(1.0 - x);
    }

    // asymptotic expansion once x is large enough
    if x >= 8.0 {
        let x2 = x * x;
        return 1.0 / x + 0.5 / x2 + 1.0 / (6.0 * x2 * x) - 1.0 / (30.0 * x2 * x2 * x);
    }

    let mut result = 0.0;
    let mut z = x;
    while z < 8.0 {
        result += 1.0 / (z * z);
        z += 1.0;
    }
    result + trigamma(z)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert!(median(&[]).is_nan());
        assert_eq!(median(&[f64::NAN, 5.0]), 5.0);
    }

    #[test]
    fn test_mad_squared() {
        // deviations from median 3: 2,1,0,1,2 -> MAD 1
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((mad_squared(&v) - MAD_SCALE * MAD_SCALE).abs() < 1e-12);
        assert_eq!(mad_squared(&[7.0, 7.0, 7.0]), 0.0);
    }

    #[test]
    fn test_trimmed_mean_drops_extremes() {
        let v = [1.0, 2.0, 3.0, 4.0, 100.0];
        assert!((trimmed_mean(&v, 0.0) - 22.0).abs() < 1e-12);
        assert!((trimmed_mean(&v, 0.2) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_trigamma_known_values() {
        // trigamma(1) = pi^2 / 6
        let expected = std::f64::consts::PI.powi(2) / 6.0;
        assert!((trigamma(1.0) - expected).abs() < 1e-6);
        // trigamma(x + 1) = trigamma(x) - 1/x^2
        assert!((trigamma(2.5) - (trigamma(1.5) - 1.0 / 2.25)).abs() < 1e-6);
    }
}
