//! Per-sample categorical annotations (grouping factor and covariates)

use std::collections::HashSet;

use crate::error::{NbLrtError, Result};

/// A categorical variable with an explicit level order.
///
/// The first level is the reference level for treatment contrasts.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    name: String,
    levels: Vec<String>,
    codes: Vec<usize>,
}

impl Factor {
    /// Builds a factor from per-sample values.
    ///
    /// Without `levels`, the levels are the sorted unique values. With
    /// `levels`, every value must be one of them, levels must be unique and
    /// every level must occur at least once.
    pub fn new(name: &str, values: &[String], levels: Option<&[String]>) -> Result<Self> {
        let levels: Vec<String> = match levels {
            Some(given) => {
                let mut seen = HashSet::new();
                if let Some(dup) = given.iter().find(|l| !seen.insert(l.as_str())) {
                    return Err(NbLrtError::InvalidSampleTable {
                        reason: format!("factor '{}' lists level '{}' twice", name, dup),
                    });
                }
                given.to_vec()
            }
            None => {
                let mut uniq: Vec<String> = values.to_vec();
                uniq.sort();
                uniq.dedup();
                uniq
            }
        };

        let mut codes = Vec::with_capacity(values.len());
        for v in values {
            let code = levels.iter().position(|l| l == v).ok_or_else(|| {
                NbLrtError::InvalidSampleTable {
                    reason: format!("value '{}' of factor '{}' is not a declared level", v, name),
                }
            })?;
            codes.push(code);
        }

        if let Some(unused) = levels
            .iter()
            .enumerate()
            .find(|(i, _)| !codes.contains(i))
            .map(|(_, l)| l)
        {
            return Err(NbLrtError::InvalidSampleTable {
                reason: format!("level '{}' of factor '{}' has no samples", unused, name),
            });
        }

        Ok(Self {
            name: name.to_string(),
            levels,
            codes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// The reference (first) level
    pub fn reference(&self) -> &str {
        &self.levels[0]
    }

    /// Level index per sample
    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    pub fn value(&self, sample_idx: usize) -> &str {
        &self.levels[self.codes[sample_idx]]
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    fn select(&self, indices: &[usize]) -> Result<Self> {
        let values: Vec<String> = indices.iter().map(|&i| self.value(i).to_string()).collect();
        let levels: Vec<String> = self
            .levels
            .iter()
            .filter(|l| values.contains(l))
            .cloned()
            .collect();
        Factor::new(&self.name, &values, Some(&levels))
    }
}

/// Sample ids with their named categorical attributes
#[derive(Debug, Clone, PartialEq)]
pub struct SampleTable {
    sample_ids: Vec<String>,
    factors: Vec<Factor>,
}

impl SampleTable {
    pub fn new(sample_ids: Vec<String>) -> Result<Self> {
        if sample_ids.is_empty() {
            return Err(NbLrtError::EmptyData {
                reason: "sample table has no samples".to_string(),
            });
        }
        let mut seen = HashSet::new();
        if let Some(dup) = sample_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(NbLrtError::InvalidSampleTable {
                reason: format!("duplicate sample id '{}'", dup),
            });
        }
        Ok(Self {
            sample_ids,
            factors: Vec::new(),
        })
    }

    /// Adds a factor whose values follow the sample order
    pub fn add_factor(&mut self, factor: Factor) -> Result<()> {
        if factor.len() != self.sample_ids.len() {
            return Err(NbLrtError::DimensionMismatch {
                expected: format!("{} values for factor '{}'", self.sample_ids.len(), factor.name()),
                got: factor.len().to_string(),
            });
        }
        if self.factors.iter().any(|f| f.name() == factor.name()) {
            return Err(NbLrtError::InvalidSampleTable {
                reason: format!("factor '{}' defined twice", factor.name()),
            });
        }
        self.factors.push(factor);
        Ok(())
    }

    /// Convenience wrapper around [`Factor::new`] + [`SampleTable::add_factor`]
    pub fn add_values(&mut self, name: &str, values: &[String], levels: Option<&[String]>) -> Result<()> {
        let factor = Factor::new(name, values, levels)?;
        self.add_factor(factor)
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    pub fn factor(&self, name: &str) -> Option<&Factor> {
        self.factors.iter().find(|f| f.name() == name)
    }

    /// Rows reordered (and subset) to follow `sample_ids`
    pub fn reorder(&self, sample_ids: &[String]) -> Result<Self> {
        let mut indices = Vec::with_capacity(sample_ids.len());
        for id in sample_ids {
            let idx = self.sample_ids.iter().position(|s| s == id).ok_or_else(|| {
                NbLrtError::InvalidSampleTable {
                    reason: format!("sample '{}' is not in the sample table", id),
                }
            })?;
            indices.push(idx);
        }

        let mut table = SampleTable::new(sample_ids.to_vec())?;
        for factor in &self.factors {
            table.add_factor(factor.select(&indices)?)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_levels_are_sorted() {
        let f = Factor::new("group", &strings(&["b", "a", "c", "a"]), None).unwrap();
        assert_eq!(f.levels(), strings(&["a", "b", "c"]).as_slice());
        assert_eq!(f.codes(), &[1, 0, 2, 0]);
        assert_eq!(f.reference(), "a");
    }

    #[test]
    fn test_explicit_level_order() {
        let levels = strings(&["classical", "intermediate", "nonclassical"]);
        let values = strings(&["nonclassical", "classical", "intermediate"]);
        let f = Factor::new("subtype", &values, Some(&levels)).unwrap();
        assert_eq!(f.reference(), "classical");
        assert_eq!(f.codes(), &[2, 0, 1]);

        let missing = strings(&["classical", "intermediate"]);
        assert!(Factor::new("subtype", &values, Some(&missing)).is_err());

        let extra = strings(&["classical", "intermediate", "nonclassical", "other"]);
        assert!(Factor::new("subtype", &values, Some(&extra)).is_err());
    }

    #[test]
    fn test_sample_table_reorder() {
        let mut table = SampleTable::new(strings(&["s1", "s2", "s3"])).unwrap();
        table
            .add_values("batch", &strings(&["x", "y", "x"]), None)
            .unwrap();
        let reordered = table.reorder(&strings(&["s3", "s2"])).unwrap();
        let batch = reordered.factor("batch").unwrap();
        assert_eq!(batch.value(0), "x");
        assert_eq!(batch.value(1), "y");
        assert!(table.reorder(&strings(&["s9"])).is_err());
    }

    #[test]
    fn test_factor_length_checked() {
        let mut table = SampleTable::new(strings(&["s1", "s2"])).unwrap();
        assert!(table.add_values("g", &strings(&["a"]), None).is_err());
        assert!(SampleTable::new(strings(&["s1", "s1"])).is_err());
    }
}
