//! P-value adjustment for multiple testing

/// Benjamini-Hochberg adjusted p-values.
///
/// NaN p-values stay NaN and do not count toward the number of tests.
/// Ties keep their input order when ranked.
pub fn benjamini_hochberg(pvalues: &[f64]) -> Vec<f64> {
    let n = pvalues.len();
    let mut padj = vec![f64::NAN; n];

    let mut indices: Vec<usize> = (0..n).filter(|&i| !pvalues[i].is_nan()).collect();
    let m = indices.len();
    if m == 0 {
        return padj;
    }
    indices.sort_by(|&a, &b| pvalues[a].total_cmp(&pvalues[b]));

    let mut cummin = f64::INFINITY;
    for (rank0, &i) in indices.iter().enumerate().rev() {
        let adj = (pvalues[i] * m as f64 / (rank0 + 1) as f64).min(1.0);
        cummin = cummin.min(adj);
        padj[i] = cummin;
    }
    padj
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bh_known_values() {
        let padj = benjamini_hochberg(&[0.01, 0.04, 0.03, 0.02]);
        for adj in &padj {
            assert!((adj - 0.04).abs() < 1e-12);
        }

        let padj = benjamini_hochberg(&[0.001, 0.01, 0.5, 0.9]);
        let expected = [0.004, 0.02, 2.0 / 3.0, 0.9];
        for (a, e) in padj.iter().zip(expected) {
            assert!((a - e).abs() < 1e-12, "{} vs {}", a, e);
        }
    }

    #[test]
    fn test_bh_with_nan() {
        let padj = benjamini_hochberg(&[0.01, f64::NAN, 0.03, 0.02]);
        assert!(padj[1].is_nan());
        // three tests, not four
        assert!((padj[0] - 0.03).abs() < 1e-12);
        assert!((padj[2] - 0.03).abs() < 1e-12);
    }

    #[test]
    fn test_bh_bounds_and_monotonicity() {
        let pvalues = vec![0.2, 0.001, 0.8, 0.04, 0.04, 0.6, 1.0, 0.0];
        let padj = benjamini_hochberg(&pvalues);

        let mut order: Vec<usize> = (0..pvalues.len()).collect();
        order.sort_by(|&a, &b| pvalues[a].total_cmp(&pvalues[b]));
        for w in order.windows(2) {
            assert!(padj[w[0]] <= padj[w[1]]);
        }
        for (p, q) in pvalues.iter().zip(&padj) {
            assert!(q >= p && *q <= 1.0);
        }
    }

    #[test]
    fn test_bh_empty() {
        assert!(benjamini_hochberg(&[]).is_empty());
        assert!(benjamini_hochberg(&[f64::NAN])[0].is_nan());
    }
}
