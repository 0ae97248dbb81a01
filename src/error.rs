//! Error types for rust_nblrt

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Pipeline stage at which a per-gene fit can diverge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStage {
    Dispersion,
    FullModel,
    ReducedModel,
}

impl fmt::Display for FitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitStage::Dispersion => write!(f, "dispersion estimation"),
            FitStage::FullModel => write!(f, "full model fit"),
            FitStage::ReducedModel => write!(f, "reduced model fit"),
        }
    }
}

/// Main error type for likelihood-ratio analyses
#[derive(Error, Debug)]
pub enum NbLrtError {
    #[error("Invalid count matrix: {reason}")]
    InvalidCountMatrix { reason: String },

    #[error("Invalid sample table: {reason}")]
    InvalidSampleTable { reason: String },

    #[error("Invalid annotation: {reason}")]
    InvalidAnnotation { reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: String, got: String },

    #[error("Degenerate input: {reason}")]
    DegenerateInput { reason: String },

    /// Per-gene failure; recorded and skipped, never fatal to a run
    #[error("Fit diverged for gene {gene_id} during {stage}: {reason}")]
    FitDivergence {
        gene_id: String,
        stage: FitStage,
        reason: String,
    },

    #[error("Invalid design: {reason}")]
    InvalidDesign { reason: String },

    #[error("Trend fitting failed: {reason}")]
    TrendFittingFailed { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Empty data: {reason}")]
    EmptyData { reason: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl NbLrtError {
    pub fn divergence(gene_id: &str, stage: FitStage, reason: impl Into<String>) -> Self {
        NbLrtError::FitDivergence {
            gene_id: gene_id.to_string(),
            stage,
            reason: reason.into(),
        }
    }

    /// True for errors that only affect a single gene
    pub fn is_per_gene(&self) -> bool {
        matches!(self, NbLrtError::FitDivergence { .. })
    }
}

/// Result type alias for rust_nblrt operations
pub type Result<T> = std::result::Result<T, NbLrtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divergence_message_names_gene_and_stage() {
        let err = NbLrtError::divergence("ENSG01", FitStage::ReducedModel, "beta exceeded bound");
        assert!(err.is_per_gene());
        let msg = err.to_string();
        assert!(msg.contains("ENSG01"));
        assert!(msg.contains("reduced model fit"));
    }

    #[test]
    fn test_run_level_errors_are_not_per_gene() {
        let err = NbLrtError::InvalidDesign {
            reason: "df = 0".to_string(),
        };
        assert!(!err.is_per_gene());
    }
}
