//! Command-line interface for rust_nblrt

use std::collections::BTreeMap;

use clap::{Args, Parser, Subcommand};

use crate::config::AnalysisConfig;
use crate::dispersion::TrendFitMethod;
use crate::error::{NbLrtError, Result};
use crate::normalization::SizeFactorMethod;

#[derive(Parser)]
#[command(name = "rust_nblrt")]
#[command(version)]
#[command(about = "Negative binomial likelihood ratio tests for RNA-seq counts")]
#[command(disable_help_flag = true)]
#[command(disable_version_flag = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the likelihood ratio analysis
    #[command(
        about = "Run the likelihood ratio analysis",
        long_about = "Run the likelihood ratio analysis\n\n\
            Estimates size factors and dispersions, fits the full design\n\
            (~ covariates + grouping) and the reduced design (~ covariates) for\n\
            every gene, and tests the grouping factor with a likelihood ratio test.",
        after_long_help = "\
Examples:
  # Test a three-level treatment factor
  rust_nblrt run -c counts.tsv -s samples.tsv -g treatment -o results.csv

  # Adjust for batch, fix the reference level, annotate genes
  rust_nblrt run -c counts.tsv -s samples.tsv -g treatment --covariate batch \\
    --levels treatment=control,low,high -a genes.tsv -o results.csv

  # Settings from a JSON file, with a per-gene status report
  rust_nblrt run -c counts.tsv -s samples.tsv --config analysis.json \\
    --status status.csv --summary summary.json"
    )]
    Run(RunArgs),

    /// Normalize count data only
    #[command(
        long_about = "Normalize count data by median of ratios.\n\n\
            Logs the size factors and writes raw counts divided by them.",
        after_long_help = "\
Examples:
  rust_nblrt normalize -c counts.tsv -o normalized.csv
  rust_nblrt normalize -c counts.tsv -o normalized.csv -m poscounts"
    )]
    Normalize {
        /// Path to count matrix file
        #[arg(short, long)]
        counts: String,

        /// Output file path
        #[arg(short, long)]
        output: String,

        /// Normalization method [default: ratio]
        #[arg(short, long, default_value = "ratio",
            long_help = "Normalization method.\n\
                ratio:     Median of ratios over genes with no zero count\n\
                poscounts: Geometric means over positive counts only")]
        method: String,
    },
}

/// Options of the `run` subcommand. Unset options keep the value from
/// `--config`, or the default when no file is given.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Path to count matrix file
    #[arg(short, long,
        long_help = "Path to count matrix file.\n\
            Format: first column = gene IDs, remaining columns = raw counts per sample.\n\
            Supports both CSV (comma) and TSV (tab) delimiters (auto-detected).")]
    pub counts: String,

    /// Path to sample table file
    #[arg(short, long,
        long_help = "Path to sample table file.\n\
            Format: first column = sample IDs (matching count matrix columns),\n\
            remaining columns = sample attributes.")]
    pub samples: String,

    /// Path to gene annotation file
    #[arg(short, long,
        long_help = "Gene annotation with columns gene_id, symbol, entrez_id.\n\
            Empty or NA cells are reported as missing.")]
    pub annotation: Option<String>,

    /// Grouping factor to test
    #[arg(short, long)]
    pub grouping: Option<String>,

    /// Covariate kept in both designs
    #[arg(long, value_name = "VAR",
        long_help = "Categorical covariate present in both the full and reduced design.\n\
            Can be specified multiple times: --covariate batch --covariate sex")]
    pub covariate: Vec<String>,

    /// Level order of a factor (format: factor=a,b,c)
    #[arg(long, value_name = "FACTOR=LEVELS",
        long_help = "Level order of a factor; the first level is the reference.\n\
            Format: factor=a,b,c (e.g., --levels treatment=control,low,high)\n\
            Without this, levels are sorted alphabetically.")]
    pub levels: Vec<String>,

    /// Coefficient reported as log2 fold change
    #[arg(long,
        long_help = "Full-design coefficient reported in log2FoldChange, e.g.\n\
            treatment_high_vs_control. Defaults to the last tested coefficient.")]
    pub lfc_coefficient: Option<String>,

    /// JSON configuration file
    #[arg(long)]
    pub config: Option<String>,

    /// Dispersion trend: parametric or mean
    #[arg(long)]
    pub fit_type: Option<String>,

    /// Size factor method: ratio or poscounts
    #[arg(long)]
    pub sf_type: Option<String>,

    /// Robust SDs above the trend for a dispersion outlier
    #[arg(long)]
    pub outlier_sd: Option<f64>,

    /// Maximum GLM iterations
    #[arg(long)]
    pub maxit: Option<usize>,

    /// Significance threshold for the summary
    #[arg(long)]
    pub alpha: Option<f64>,

    /// Output file path [default: nblrt_results.csv]
    #[arg(short, long, default_value = "nblrt_results.csv")]
    pub output: String,

    /// Write the run summary as JSON
    #[arg(long)]
    pub summary: Option<String>,

    /// Write the per-gene status table
    #[arg(long)]
    pub status: Option<String>,

    /// Number of threads (0 = all cores)
    #[arg(short = 't', long, default_value = "0")]
    pub threads: usize,
}

impl RunArgs {
    /// Builds the analysis configuration: file values first, then any
    /// option given on the command line
    pub fn to_config(&self) -> Result<AnalysisConfig> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::from_json_file(path)?,
            None => AnalysisConfig::default(),
        };

        if let Some(grouping) = &self.grouping {
            config.grouping = grouping.clone();
        }
        if !self.covariate.is_empty() {
            config.covariates = self.covariate.clone();
        }
        config.factor_levels.extend(parse_levels(&self.levels)?);
        if let Some(name) = &self.lfc_coefficient {
            config.lfc_coefficient = Some(name.clone());
        }
        if let Some(fit_type) = &self.fit_type {
            config.fit_type = parse_fit_type(fit_type)?;
        }
        if let Some(sf_type) = &self.sf_type {
            config.size_factor_method = parse_sf_type(sf_type)?;
        }
        if let Some(outlier_sd) = self.outlier_sd {
            config.dispersion.outlier_sd = outlier_sd;
        }
        if let Some(maxit) = self.maxit {
            config.glm.maxit = maxit;
        }
        if let Some(alpha) = self.alpha {
            config.alpha = alpha;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parses `factor=a,b,c` specifications
pub fn parse_levels(specs: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
    let mut levels = BTreeMap::new();
    for spec in specs {
        let (factor, list) = spec.split_once('=').ok_or_else(|| NbLrtError::InvalidInput {
            reason: format!("--levels '{}' must look like factor=a,b,c", spec),
        })?;
        let order: Vec<String> = list
            .split(',')
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if factor.trim().is_empty() || order.is_empty() {
            return Err(NbLrtError::InvalidInput {
                reason: format!("--levels '{}' names no factor or no levels", spec),
            });
        }
        levels.insert(factor.trim().to_string(), order);
    }
    Ok(levels)
}

pub fn parse_fit_type(value: &str) -> Result<TrendFitMethod> {
    match value {
        "parametric" => Ok(TrendFitMethod::Parametric),
        "mean" => Ok(TrendFitMethod::Mean),
        other => Err(NbLrtError::InvalidInput {
            reason: format!("Unknown fit type '{}'. Use 'parametric' or 'mean'.", other),
        }),
    }
}

pub fn parse_sf_type(value: &str) -> Result<SizeFactorMethod> {
    match value {
        "ratio" => Ok(SizeFactorMethod::Ratio),
        "poscounts" => Ok(SizeFactorMethod::PosCounts),
        other => Err(NbLrtError::InvalidInput {
            reason: format!("Unknown size factor type '{}'. Use 'ratio' or 'poscounts'.", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels() {
        let levels = parse_levels(&["treatment=control, low,high".to_string()]).unwrap();
        assert_eq!(levels["treatment"], vec!["control", "low", "high"]);
        assert!(parse_levels(&["treatment".to_string()]).is_err());
        assert!(parse_levels(&["treatment=".to_string()]).is_err());
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = Cli::parse_from([
            "rust_nblrt",
            "run",
            "-c",
            "counts.tsv",
            "-s",
            "samples.tsv",
            "-g",
            "treatment",
            "--covariate",
            "batch",
            "--levels",
            "treatment=ctrl,drug",
            "--fit-type",
            "mean",
            "--alpha",
            "0.1",
        ]);
        let args = match cli.command {
            Some(Commands::Run(args)) => args,
            _ => panic!("expected run"),
        };
        let config = args.to_config().unwrap();
        assert_eq!(config.grouping, "treatment");
        assert_eq!(config.covariates, vec!["batch".to_string()]);
        assert_eq!(config.factor_levels["treatment"], vec!["ctrl", "drug"]);
        assert_eq!(config.fit_type, TrendFitMethod::Mean);
        assert_eq!(config.alpha, 0.1);
        assert_eq!(args.output, "nblrt_results.csv");
    }

    #[test]
    fn test_unknown_method_names() {
        assert!(parse_fit_type("local").is_err());
        assert_eq!(parse_sf_type("poscounts").unwrap(), SizeFactorMethod::PosCounts);
        assert!(parse_sf_type("iterate").is_err());
    }
}
