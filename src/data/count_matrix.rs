//! Gene × sample count matrix

use std::collections::{HashMap, HashSet};

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{NbLrtError, Result};

/// Make gene names unique by suffixing repeats with `_1`, `_2`, ...
///
/// A suffix already taken by another input name is skipped.
fn deduplicate_names(names: Vec<String>) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::with_capacity(names.len());
    if names.iter().all(|n| used.insert(n.clone())) {
        return names;
    }
    used.clear();
    let mut next_suffix: HashMap<String, usize> = HashMap::new();
    names
        .into_iter()
        .map(|name| {
            if used.insert(name.clone()) {
                return name;
            }
            let suffix = next_suffix.entry(name.clone()).or_insert(1);
            let mut renamed = format!("{}_{}", name, suffix);
            while used.contains(&renamed) {
                *suffix += 1;
                renamed = format!("{}_{}", name, suffix);
            }
            *suffix += 1;
            used.insert(renamed.clone());
            log::warn!("Duplicate gene id '{}' renamed to '{}'", name, renamed);
            renamed
        })
        .collect()
}

/// Non-negative integer read counts, genes in rows and samples in columns
#[derive(Debug, Clone, PartialEq)]
pub struct CountMatrix {
    counts: Array2<f64>,
    gene_ids: Vec<String>,
    sample_ids: Vec<String>,
}

impl CountMatrix {
    /// Validates shape, values and identifiers.
    ///
    /// Counts must be finite, non-negative whole numbers. Duplicate sample ids
    /// are an error; duplicate gene ids are renamed.
    pub fn new(counts: Array2<f64>, gene_ids: Vec<String>, sample_ids: Vec<String>) -> Result<Self> {
        let (n_genes, n_samples) = counts.dim();

        if gene_ids.len() != n_genes {
            return Err(NbLrtError::DimensionMismatch {
                expected: format!("{} gene IDs", n_genes),
                got: format!("{} gene IDs", gene_ids.len()),
            });
        }
        if sample_ids.len() != n_samples {
            return Err(NbLrtError::DimensionMismatch {
                expected: format!("{} sample IDs", n_samples),
                got: format!("{} sample IDs", sample_ids.len()),
            });
        }

        if let Some(((g, s), v)) = counts
            .indexed_iter()
            .find(|(_, &x)| !x.is_finite() || x < 0.0 || x.fract() != 0.0)
        {
            return Err(NbLrtError::InvalidCountMatrix {
                reason: format!(
                    "count {} for gene '{}' in sample '{}' is not a non-negative integer",
                    v, gene_ids[g], sample_ids[s]
                ),
            });
        }

        let mut seen = HashSet::new();
        if let Some(dup) = sample_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(NbLrtError::InvalidCountMatrix {
                reason: format!("duplicate sample id '{}'", dup),
            });
        }

        Ok(Self {
            counts,
            gene_ids: deduplicate_names(gene_ids),
            sample_ids,
        })
    }

    pub fn n_genes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.counts.ncols()
    }

    pub fn counts(&self) -> ArrayView2<'_, f64> {
        self.counts.view()
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn gene_counts(&self, gene_idx: usize) -> ArrayView1<'_, f64> {
        self.counts.row(gene_idx)
    }

    /// Indices of genes with at least one non-zero count
    pub fn nonzero_gene_indices(&self) -> Vec<usize> {
        (0..self.n_genes())
            .filter(|&i| self.counts.row(i).iter().any(|&x| x > 0.0))
            .collect()
    }

    /// Removes genes whose counts are zero in every sample.
    ///
    /// Returns the filtered matrix and the ids of the removed genes, in input
    /// order. Fails when no gene has a non-zero count.
    pub fn drop_zero_genes(&self) -> Result<(Self, Vec<String>)> {
        let keep = self.nonzero_gene_indices();
        if keep.is_empty() {
            return Err(NbLrtError::DegenerateInput {
                reason: "every gene has zero counts in all samples".to_string(),
            });
        }

        let mut kept = keep.iter().peekable();
        let mut removed = Vec::with_capacity(self.n_genes() - keep.len());
        for (i, id) in self.gene_ids.iter().enumerate() {
            if kept.peek() == Some(&&i) {
                kept.next();
            } else {
                removed.push(id.clone());
            }
        }

        Ok((self.subset_genes(&keep)?, removed))
    }

    /// Subset to specific genes, in the given order
    fn subset_genes(&self, gene_indices: &[usize]) -> Result<Self> {
        let counts = self.counts.select(Axis(0), gene_indices);
        let gene_ids = gene_indices.iter().map(|&i| self.gene_ids[i].clone()).collect();
        Self::new(counts, gene_ids, self.sample_ids.clone())
    }

    /// Reorders and subsets columns to match `sample_ids`.
    ///
    /// Columns not named in `sample_ids` are dropped with a warning. A name
    /// with no matching column is an error.
    pub fn select_samples(&self, sample_ids: &[String]) -> Result<Self> {
        let mut indices = Vec::with_capacity(sample_ids.len());
        for id in sample_ids {
            let idx = self.sample_ids.iter().position(|s| s == id).ok_or_else(|| {
                NbLrtError::InvalidSampleTable {
                    reason: format!("sample '{}' has no column in the count matrix", id),
                }
            })?;
            indices.push(idx);
        }

        let dropped = self.n_samples() - indices.len();
        if dropped > 0 {
            log::warn!(
                "{} count matrix column(s) not listed in the sample table were dropped",
                dropped
            );
        }

        let counts = self.counts.select(Axis(1), &indices);
        Self::new(counts, self.gene_ids.clone(), sample_ids.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn test_count_matrix_creation() {
        let counts = array![[10.0, 20.0, 30.0], [5.0, 15.0, 25.0]];
        let matrix = CountMatrix::new(counts, ids("gene", 2), ids("s", 3)).unwrap();
        assert_eq!(matrix.n_genes(), 2);
        assert_eq!(matrix.n_samples(), 3);
        assert_eq!(matrix.gene_counts(1).to_vec(), vec![5.0, 15.0, 25.0]);
    }

    #[test]
    fn test_negative_and_fractional_counts_rejected() {
        let negative = array![[10.0, -5.0], [5.0, 15.0]];
        assert!(CountMatrix::new(negative, ids("gene", 2), ids("s", 2)).is_err());

        let fractional = array![[10.0, 2.5], [5.0, 15.0]];
        let err = CountMatrix::new(fractional, ids("gene", 2), ids("s", 2)).unwrap_err();
        assert!(matches!(err, NbLrtError::InvalidCountMatrix { .. }));
    }

    #[test]
    fn test_duplicate_ids() {
        let counts = array![[1.0, 2.0], [3.0, 4.0]];
        let genes = vec!["g".to_string(), "g".to_string()];
        let m = CountMatrix::new(counts.clone(), genes, ids("s", 2)).unwrap();
        assert_eq!(m.gene_ids(), &["g".to_string(), "g_1".to_string()]);

        let genes: Vec<String> = ["a", "a", "a_1"].iter().map(|s| s.to_string()).collect();
        let m = CountMatrix::new(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]], genes, ids("s", 2))
            .unwrap();
        let unique: HashSet<&String> = m.gene_ids().iter().collect();
        assert_eq!(unique.len(), 3);
        assert_eq!(m.gene_ids()[1], "a_1");
        assert_eq!(m.gene_ids()[2], "a_1_1");

        let samples = vec!["s".to_string(), "s".to_string()];
        assert!(CountMatrix::new(counts, ids("gene", 2), samples).is_err());
    }

    #[test]
    fn test_drop_zero_genes() {
        let counts = array![[0.0, 0.0, 0.0], [1.0, 0.0, 3.0], [0.0, 0.0, 0.0], [4.0, 5.0, 6.0]];
        let m = CountMatrix::new(counts, ids("gene", 4), ids("s", 3)).unwrap();
        let (kept, removed) = m.drop_zero_genes().unwrap();
        assert_eq!(kept.gene_ids(), &["gene2".to_string(), "gene4".to_string()]);
        assert_eq!(removed, vec!["gene1".to_string(), "gene3".to_string()]);

        let zeros = CountMatrix::new(Array2::zeros((2, 2)), ids("gene", 2), ids("s", 2)).unwrap();
        assert!(matches!(
            zeros.drop_zero_genes().unwrap_err(),
            NbLrtError::DegenerateInput { .. }
        ));
    }

    #[test]
    fn test_select_samples_reorders_columns() {
        let counts = array![[1.0, 2.0, 3.0]];
        let m = CountMatrix::new(counts, ids("gene", 1), ids("s", 3)).unwrap();
        let order = vec!["s3".to_string(), "s1".to_string()];
        let aligned = m.select_samples(&order).unwrap();
        assert_eq!(aligned.sample_ids(), order.as_slice());
        assert_eq!(aligned.gene_counts(0).to_vec(), vec![3.0, 1.0]);

        assert!(m.select_samples(&["missing".to_string()]).is_err());
    }
}
