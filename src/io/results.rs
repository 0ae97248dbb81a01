//! Result table for a likelihood ratio analysis

use std::fmt;

use ndarray::Array1;
use serde::Serialize;

use crate::error::{FitStage, NbLrtError};

/// One tested gene
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeResultRow {
    pub gene_id: String,
    pub symbol: Option<String>,
    pub entrez_id: Option<u64>,
    /// Mean of normalized counts across all samples
    #[serde(rename = "baseMean")]
    pub base_mean: f64,
    /// Log2 fold change of the reported coefficient in the full model
    #[serde(rename = "log2FoldChange")]
    pub log2_fold_change: f64,
    #[serde(rename = "lfcSE")]
    pub lfc_se: f64,
    /// Likelihood ratio statistic
    pub stat: f64,
    pub pvalue: f64,
    pub padj: f64,
    /// Dispersion the GLM fits were run with
    pub dispersion: f64,
    #[serde(rename = "dispersionOutlier")]
    pub dispersion_outlier: bool,
}

impl DeResultRow {
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.padj.is_finite() && self.padj < alpha
    }
}

/// What happened to one input gene
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum GeneStatus {
    Tested,
    AllZero,
    DispersionDiverged(String),
    FullFitDiverged(String),
    ReducedFitDiverged(String),
}

impl GeneStatus {
    /// Maps a per-gene error onto its exclusion status
    pub fn from_error(err: &NbLrtError) -> Option<Self> {
        match err {
            NbLrtError::FitDivergence { stage, reason, .. } => Some(match stage {
                FitStage::Dispersion => GeneStatus::DispersionDiverged(reason.clone()),
                FitStage::FullModel => GeneStatus::FullFitDiverged(reason.clone()),
                FitStage::ReducedModel => GeneStatus::ReducedFitDiverged(reason.clone()),
            }),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GeneStatus::Tested => "tested",
            GeneStatus::AllZero => "all_zero",
            GeneStatus::DispersionDiverged(_) => "dispersion_diverged",
            GeneStatus::FullFitDiverged(_) => "full_fit_diverged",
            GeneStatus::ReducedFitDiverged(_) => "reduced_fit_diverged",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            GeneStatus::DispersionDiverged(r)
            | GeneStatus::FullFitDiverged(r)
            | GeneStatus::ReducedFitDiverged(r) => Some(r),
            GeneStatus::Tested | GeneStatus::AllZero => None,
        }
    }

    pub fn is_non_convergent(&self) -> bool {
        self.reason().is_some()
    }
}

/// Per-stage counts of genes excluded for non-convergence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NonConvergence {
    pub dispersion: usize,
    pub full_model: usize,
    pub reduced_model: usize,
}

impl NonConvergence {
    pub fn total(&self) -> usize {
        self.dispersion + self.full_model + self.reduced_model
    }
}

/// Run-level diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub n_total: usize,
    pub n_all_zero: usize,
    pub n_non_convergent: usize,
    pub non_convergent_by_stage: NonConvergence,
    pub n_tested: usize,
    pub n_significant: usize,
    pub alpha: f64,
    pub n_dispersion_outliers: usize,
    pub df: usize,
    pub lfc_coefficient: String,
    pub full_design: String,
    pub reduced_design: String,
    pub trend: String,
    pub prior_variance: f64,
}

impl RunSummary {
    /// Tallies gene statuses; design and dispersion fields are left for
    /// the caller to fill in
    pub fn from_statuses(statuses: &[(String, GeneStatus)], rows: &[DeResultRow], alpha: f64) -> Self {
        let mut by_stage = NonConvergence::default();
        let mut n_all_zero = 0;
        let mut n_tested = 0;
        for (_, status) in statuses {
            match status {
                GeneStatus::Tested => n_tested += 1,
                GeneStatus::AllZero => n_all_zero += 1,
                GeneStatus::DispersionDiverged(_) => by_stage.dispersion += 1,
                GeneStatus::FullFitDiverged(_) => by_stage.full_model += 1,
                GeneStatus::ReducedFitDiverged(_) => by_stage.reduced_model += 1,
            }
        }

        Self {
            n_total: statuses.len(),
            n_all_zero,
            n_non_convergent: by_stage.total(),
            non_convergent_by_stage: by_stage,
            n_tested,
            n_significant: rows.iter().filter(|r| r.is_significant(alpha)).count(),
            alpha,
            n_dispersion_outliers: rows.iter().filter(|r| r.dispersion_outlier).count(),
            df: 0,
            lfc_coefficient: String::new(),
            full_design: String::new(),
            reduced_design: String::new(),
            trend: String::new(),
            prior_variance: f64::NAN,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Likelihood Ratio Test Summary")?;
        writeln!(f, "=============================")?;
        writeln!(f, "Full design: {}", self.full_design)?;
        writeln!(f, "Reduced design: {}", self.reduced_design)?;
        writeln!(f, "Degrees of freedom: {}", self.df)?;
        writeln!(f, "Log2 fold change reported for: {}", self.lfc_coefficient)?;
        writeln!(f, "Total genes: {}", self.n_total)?;
        writeln!(f, "  All-zero (excluded): {}", self.n_all_zero)?;
        writeln!(f, "  Non-convergent (excluded): {}", self.n_non_convergent)?;
        writeln!(f, "    dispersion: {}", self.non_convergent_by_stage.dispersion)?;
        writeln!(f, "    full model: {}", self.non_convergent_by_stage.full_model)?;
        writeln!(f, "    reduced model: {}", self.non_convergent_by_stage.reduced_model)?;
        writeln!(f, "  Tested: {}", self.n_tested)?;
        writeln!(f, "Significant (padj < {}): {}", self.alpha, self.n_significant)?;
        writeln!(f, "Dispersion outliers: {}", self.n_dispersion_outliers)?;
        writeln!(f, "Dispersion trend: {}", self.trend)?;
        writeln!(f, "Prior variance: {:.4}", self.prior_variance)?;
        Ok(())
    }
}

/// Output of a complete run
#[derive(Debug, Clone)]
pub struct DeResultTable {
    rows: Vec<DeResultRow>,
    statuses: Vec<(String, GeneStatus)>,
    summary: RunSummary,
    size_factors: Array1<f64>,
    lfc_coefficient: String,
}

impl DeResultTable {
    /// Sorts `rows` by ascending p-value. The sort is stable, so ties keep
    /// the order they were given in.
    pub fn new(
        mut rows: Vec<DeResultRow>,
        statuses: Vec<(String, GeneStatus)>,
        summary: RunSummary,
        size_factors: Array1<f64>,
        lfc_coefficient: String,
    ) -> Self {
        rows.sort_by(|a, b| a.pvalue.total_cmp(&b.pvalue));
        Self {
            rows,
            statuses,
            summary,
            size_factors,
            lfc_coefficient,
        }
    }

    pub fn rows(&self) -> &[DeResultRow] {
        &self.rows
    }

    /// One entry per input gene, in input order
    pub fn statuses(&self) -> &[(String, GeneStatus)] {
        &self.statuses
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn size_factors(&self) -> &Array1<f64> {
        &self.size_factors
    }

    pub fn lfc_coefficient(&self) -> &str {
        &self.lfc_coefficient
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, gene_id: &str) -> Option<&DeResultRow> {
        self.rows.iter().find(|r| r.gene_id == gene_id)
    }

    pub fn status(&self, gene_id: &str) -> Option<&GeneStatus> {
        self.statuses
            .iter()
            .find(|(id, _)| id == gene_id)
            .map(|(_, s)| s)
    }

    pub fn significant(&self, alpha: f64) -> impl Iterator<Item = &DeResultRow> {
        self.rows.iter().filter(move |r| r.is_significant(alpha))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, pvalue: f64, padj: f64) -> DeResultRow {
        DeResultRow {
            gene_id: id.to_string(),
            symbol: None,
            entrez_id: None,
            base_mean: 10.0,
            log2_fold_change: 0.0,
            lfc_se: 0.1,
            stat: 0.0,
            pvalue,
            padj,
            dispersion: 0.1,
            dispersion_outlier: false,
        }
    }

    #[test]
    fn test_rows_sorted_stably_by_pvalue() {
        let rows = vec![
            row("a", 0.5, 0.5),
            row("b", 0.01, 0.03),
            row("c", 0.5, 0.5),
            row("d", 0.2, 0.3),
        ];
        let table = DeResultTable::new(
            rows,
            Vec::new(),
            RunSummary::from_statuses(&[], &[], 0.05),
            Array1::ones(2),
            "x".to_string(),
        );
        let order: Vec<&str> = table.rows().iter().map(|r| r.gene_id.as_str()).collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
        assert_eq!(table.significant(0.05).count(), 1);
    }

    #[test]
    fn test_status_from_error() {
        let err = NbLrtError::divergence("g1", FitStage::ReducedModel, "no convergence");
        assert_eq!(
            GeneStatus::from_error(&err),
            Some(GeneStatus::ReducedFitDiverged("no convergence".to_string()))
        );
        let fatal = NbLrtError::InvalidDesign { reason: "x".into() };
        assert_eq!(GeneStatus::from_error(&fatal), None);
    }

    #[test]
    fn test_summary_counts() {
        let statuses = vec![
            ("a".to_string(), GeneStatus::Tested),
            ("b".to_string(), GeneStatus::AllZero),
            ("c".to_string(), GeneStatus::FullFitDiverged("x".into())),
            ("d".to_string(), GeneStatus::DispersionDiverged("y".into())),
            ("e".to_string(), GeneStatus::Tested),
        ];
        let rows = vec![row("a", 0.001, 0.002), row("e", 0.4, 0.4)];
        let summary = RunSummary::from_statuses(&statuses, &rows, 0.05);
        assert_eq!(summary.n_total, 5);
        assert_eq!(summary.n_all_zero, 1);
        assert_eq!(summary.n_non_convergent, 2);
        assert_eq!(summary.non_convergent_by_stage.full_model, 1);
        assert_eq!(summary.n_tested, 2);
        assert_eq!(summary.n_significant, 1);
    }
}
