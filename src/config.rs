//! Analysis configuration

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dispersion::{DispersionParams, TrendFitMethod};
use crate::error::{NbLrtError, Result};
use crate::glm::GlmFitParams;
use crate::normalization::SizeFactorMethod;

/// Everything a likelihood ratio run needs besides the data.
///
/// Loadable from JSON; every field is optional there and falls back to its
/// default. Command-line options override values read from a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Factor whose effect is tested
    pub grouping: String,
    /// Factors present in both the full and reduced designs
    pub covariates: Vec<String>,
    /// Explicit level order per factor; the first level is the reference
    pub factor_levels: BTreeMap<String, Vec<String>>,
    /// Full-design coefficient reported as the log2 fold change
    pub lfc_coefficient: Option<String>,
    pub size_factor_method: SizeFactorMethod,
    /// Known size factors, one per sample in sample table order
    pub size_factors: Option<Vec<f64>>,
    pub fit_type: TrendFitMethod,
    pub dispersion: DispersionParams,
    pub glm: GlmFitParams,
    /// Adjusted p-value threshold used for the significance count
    pub alpha: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            grouping: "condition".to_string(),
            covariates: Vec::new(),
            factor_levels: BTreeMap::new(),
            lfc_coefficient: None,
            size_factor_method: SizeFactorMethod::default(),
            size_factors: None,
            fit_type: TrendFitMethod::default(),
            dispersion: DispersionParams::default(),
            glm: GlmFitParams::default(),
            alpha: 0.05,
        }
    }
}

impl AnalysisConfig {
    pub fn new(grouping: &str) -> Self {
        Self {
            grouping: grouping.to_string(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: AnalysisConfig = serde_json::from_str(&content)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Factor columns the sample table must provide
    pub fn factor_names(&self) -> Vec<String> {
        let mut names = self.covariates.clone();
        names.push(self.grouping.clone());
        names
    }

    pub fn validate(&self) -> Result<()> {
        if self.grouping.trim().is_empty() {
            return Err(NbLrtError::InvalidConfig {
                reason: "grouping factor name is empty".to_string(),
            });
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(NbLrtError::InvalidConfig {
                reason: format!("alpha must be in (0, 1), got {}", self.alpha),
            });
        }
        if self.glm.maxit == 0 {
            return Err(NbLrtError::InvalidConfig {
                reason: "GLM maxit must be at least 1".to_string(),
            });
        }
        if !(self.glm.beta_tol > 0.0) || !(self.glm.ridge >= 0.0) {
            return Err(NbLrtError::InvalidConfig {
                reason: format!(
                    "GLM beta_tol must be positive and ridge non-negative, got {} and {}",
                    self.glm.beta_tol, self.glm.ridge
                ),
            });
        }
        self.dispersion.validate()
    }
}
