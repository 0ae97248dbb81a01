//! Design formulas, model matrices and the full/reduced design pair

use std::fmt;
use std::ops::Range;

use ndarray::Array2;

use crate::data::{Factor, SampleTable};
use crate::error::{NbLrtError, Result};

pub const INTERCEPT: &str = "Intercept";

/// A main-effects design formula such as `~ batch + group`.
///
/// Only categorical main effects with an intercept are supported; `~ 1`
/// (or a bare `~`) is the intercept-only model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignFormula {
    terms: Vec<String>,
}

impl DesignFormula {
    pub fn new(terms: Vec<String>) -> Result<Self> {
        let mut seen: Vec<&str> = Vec::new();
        for t in &terms {
            if seen.contains(&t.as_str()) {
                return Err(NbLrtError::InvalidDesign {
                    reason: format!("term '{}' appears twice in the formula", t),
                });
            }
            seen.push(t);
        }
        Ok(Self { terms })
    }

    pub fn intercept_only() -> Self {
        Self { terms: Vec::new() }
    }

    pub fn parse(formula: &str) -> Result<Self> {
        let rhs = formula
            .trim()
            .strip_prefix('~')
            .ok_or_else(|| NbLrtError::InvalidDesign {
                reason: format!("formula '{}' must start with '~'", formula),
            })?
            .trim();

        if rhs.is_empty() {
            return Ok(Self::intercept_only());
        }

        let mut terms = Vec::new();
        for raw in rhs.split('+') {
            let term = raw.trim();
            if term == "1" {
                continue;
            }
            let valid = !term.is_empty()
                && term
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '.');
            if !valid {
                return Err(NbLrtError::InvalidDesign {
                    reason: format!("unsupported term '{}' in formula '{}'", term, formula),
                });
            }
            terms.push(term.to_string());
        }
        Self::new(terms)
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    pub fn is_intercept_only(&self) -> bool {
        self.terms.is_empty()
    }
}

impl fmt::Display for DesignFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            write!(f, "~ 1")
        } else {
            write!(f, "~ {}", self.terms.join(" + "))
        }
    }
}

/// A numeric model matrix with named columns
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMatrix {
    pub matrix: Array2<f64>,
    pub coef_names: Vec<String>,
    /// Column range for each formula term, in formula order
    pub term_columns: Vec<(String, Range<usize>)>,
}

impl ModelMatrix {
    pub fn n_coefs(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn coef_index(&self, name: &str) -> Option<usize> {
        self.coef_names.iter().position(|c| c == name)
    }
}

/// Coefficient name of a non-reference level under treatment contrasts
pub fn contrast_name(factor: &Factor, level: &str) -> String {
    format!("{}_{}_vs_{}", factor.name(), level, factor.reference())
}

/// Builds an intercept plus treatment-contrast indicators for every term.
///
/// The result is checked for full column rank.
pub fn build_model_matrix(table: &SampleTable, formula: &DesignFormula) -> Result<ModelMatrix> {
    let n = table.n_samples();

    let mut factors = Vec::with_capacity(formula.terms().len());
    for term in formula.terms() {
        let factor = table.factor(term).ok_or_else(|| NbLrtError::InvalidDesign {
            reason: format!("formula term '{}' is not a column of the sample table", term),
        })?;
        factors.push(factor);
    }

    let n_coefs = 1 + factors.iter().map(|f| f.n_levels() - 1).sum::<usize>();
    let mut matrix = Array2::<f64>::zeros((n, n_coefs));
    let mut coef_names = Vec::with_capacity(n_coefs);
    let mut term_columns = Vec::with_capacity(factors.len());

    matrix.column_mut(0).fill(1.0);
    coef_names.push(INTERCEPT.to_string());

    let mut col = 1;
    for factor in factors {
        let start = col;
        for (level_idx, level) in factor.levels().iter().enumerate().skip(1) {
            for (i, &code) in factor.codes().iter().enumerate() {
                if code == level_idx {
                    matrix[[i, col]] = 1.0;
                }
            }
            coef_names.push(contrast_name(factor, level));
            col += 1;
        }
        term_columns.push((factor.name().to_string(), start..col));
    }

    check_full_rank(&matrix)?;

    Ok(ModelMatrix {
        matrix,
        coef_names,
        term_columns,
    })
}

/// Nested full/reduced designs for the likelihood-ratio test
#[derive(Debug, Clone)]
pub struct DesignPair {
    pub full: ModelMatrix,
    pub reduced: ModelMatrix,
    pub full_formula: DesignFormula,
    pub reduced_formula: DesignFormula,
    /// Full-design columns absent from the reduced design
    pub tested_columns: Vec<usize>,
    /// Full-design column reported as the log2 fold change
    pub lfc_column: usize,
}

impl DesignPair {
    /// `~ covariates + grouping` against `~ covariates`
    pub fn new(table: &SampleTable, covariates: &[String], grouping: &str) -> Result<Self> {
        let factor = table.factor(grouping).ok_or_else(|| NbLrtError::InvalidDesign {
            reason: format!("grouping factor '{}' is not in the sample table", grouping),
        })?;
        if factor.n_levels() < 2 {
            return Err(NbLrtError::InvalidDesign {
                reason: format!(
                    "grouping factor '{}' needs at least 2 levels, found {}",
                    grouping,
                    factor.n_levels()
                ),
            });
        }
        if covariates.iter().any(|c| c == grouping) {
            return Err(NbLrtError::InvalidDesign {
                reason: format!("'{}' is both a covariate and the grouping factor", grouping),
            });
        }

        let reduced = DesignFormula::new(covariates.to_vec())?;
        let mut full_terms = covariates.to_vec();
        full_terms.push(grouping.to_string());
        let full = DesignFormula::new(full_terms)?;

        Self::from_formulas(table, &full, &reduced)
    }

    /// General nested pair. Fails unless every reduced coefficient is also
    /// a full coefficient and the full design has strictly more columns.
    pub fn from_formulas(
        table: &SampleTable,
        full_formula: &DesignFormula,
        reduced_formula: &DesignFormula,
    ) -> Result<Self> {
        let full = build_model_matrix(table, full_formula)?;
        let reduced = build_model_matrix(table, reduced_formula)?;

        if let Some(missing) = reduced
            .coef_names
            .iter()
            .find(|name| full.coef_index(name).is_none())
        {
            return Err(NbLrtError::InvalidDesign {
                reason: format!(
                    "reduced design {} is not nested in {}: coefficient '{}' is missing",
                    reduced_formula, full_formula, missing
                ),
            });
        }

        if full.n_coefs() <= reduced.n_coefs() {
            return Err(NbLrtError::InvalidDesign {
                reason: format!(
                    "full design {} has {} coefficients and reduced design {} has {}; \
                     the test needs at least one degree of freedom",
                    full_formula,
                    full.n_coefs(),
                    reduced_formula,
                    reduced.n_coefs()
                ),
            });
        }

        if table.n_samples() <= full.n_coefs() {
            return Err(NbLrtError::InvalidDesign {
                reason: format!(
                    "{} samples cannot support {} coefficients; \
                     replicates are required to estimate dispersion",
                    table.n_samples(),
                    full.n_coefs()
                ),
            });
        }

        let tested_columns: Vec<usize> = (0..full.n_coefs())
            .filter(|&j| reduced.coef_index(&full.coef_names[j]).is_none())
            .collect();
        let lfc_column = *tested_columns.last().ok_or_else(|| NbLrtError::InvalidDesign {
            reason: "no coefficient is tested".to_string(),
        })?;

        Ok(Self {
            full,
            reduced,
            full_formula: full_formula.clone(),
            reduced_formula: reduced_formula.clone(),
            tested_columns,
            lfc_column,
        })
    }

    /// Degrees of freedom of the likelihood-ratio test
    pub fn df(&self) -> usize {
        self.full.n_coefs() - self.reduced.n_coefs()
    }

    /// Reports the named coefficient as the fold change; it must be tested
    pub fn set_lfc_coefficient(&mut self, name: &str) -> Result<()> {
        let idx = self
            .full
            .coef_index(name)
            .filter(|idx| self.tested_columns.contains(idx))
            .ok_or_else(|| NbLrtError::InvalidDesign {
                reason: format!(
                    "'{}' is not a tested coefficient; choose one of: {}",
                    name,
                    self.tested_columns
                        .iter()
                        .map(|&j| self.full.coef_names[j].as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            })?;
        self.lfc_column = idx;
        Ok(())
    }

    pub fn lfc_coefficient(&self) -> &str {
        &self.full.coef_names[self.lfc_column]
    }
}

/// Check that the model matrix has full column rank.
///
/// Distinguishes all-zero columns (level combinations without samples) from
/// linear dependence between terms.
pub fn check_full_rank(matrix: &Array2<f64>) -> Result<()> {
    let ncol = matrix.ncols();
    if matrix.nrows() == 0 || ncol == 0 {
        return Err(NbLrtError::InvalidDesign {
            reason: "design matrix has zero rows or columns".to_string(),
        });
    }

    if qr_rank(matrix) < ncol {
        let has_zero_column = (0..ncol).any(|j| matrix.column(j).iter().all(|&v| v == 0.0));
        let reason = if has_zero_column {
            "the model matrix is not full rank: levels or combinations of levels \
             without any samples produce columns of zeros"
        } else {
            "the model matrix is not full rank: one or more terms are linear \
             combinations of the others and must be removed"
        };
        return Err(NbLrtError::InvalidDesign {
            reason: reason.to_string(),
        });
    }

    Ok(())
}

/// Numerical rank via Householder QR with column pivoting.
///
/// Counts diagonal entries of R above `max(n, p) * eps * max|diag(R)|`.
fn qr_rank(matrix: &Array2<f64>) -> usize {
    let nrow = matrix.nrows();
    let ncol = matrix.ncols();
    let k = nrow.min(ncol);

    let mut r = matrix.to_owned();
    let mut col_norms_sq: Vec<f64> = (0..ncol)
        .map(|j| r.column(j).iter().map(|&v| v * v).sum())
        .collect();

    for step in 0..k {
        let best_col = (step..ncol)
            .max_by(|&a, &b| col_norms_sq[a].total_cmp(&col_norms_sq[b]))
            .unwrap_or(step);
        if best_col != step {
            for i in 0..nrow {
                r.swap([i, step], [i, best_col]);
            }
            col_norms_sq.swap(step, best_col);
        }

        let mut alpha = (step..nrow).map(|i| r[[i, step]].powi(2)).sum::<f64>().sqrt();
        if alpha < f64::EPSILON * 1e3 {
            break;
        }
        if r[[step, step]] > 0.0 {
            alpha = -alpha;
        }

        let v0 = r[[step, step]] - alpha;
        r[[step, step]] = alpha;

        let v_norm_sq = v0 * v0 + ((step + 1)..nrow).map(|i| r[[i, step]].powi(2)).sum::<f64>();
        if v_norm_sq.abs() < f64::MIN_POSITIVE {
            continue;
        }
        let tau = 2.0 / v_norm_sq;

        for j in (step + 1)..ncol {
            let dot = v0 * r[[step, j]]
                + ((step + 1)..nrow).map(|i| r[[i, step]] * r[[i, j]]).sum::<f64>();
            let scale = tau * dot;
            r[[step, j]] -= scale * v0;
            for i in (step + 1)..nrow {
                let v = r[[i, step]];
                r[[i, j]] -= scale * v;
            }
        }

        for j in (step + 1)..ncol {
            col_norms_sq[j] = (col_norms_sq[j] - r[[step, j]].powi(2)).max(0.0);
        }
    }

    let max_abs_diag = (0..k).map(|i| r[[i, i]].abs()).fold(0.0f64, f64::max);
    let tol = nrow.max(ncol) as f64 * f64::EPSILON * max_abs_diag;
    (0..k).filter(|&i| r[[i, i]].abs() > tol).count()
}
