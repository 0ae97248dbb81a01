//! rust_nblrt: likelihood ratio tests for differential expression of
//! RNA-seq counts under a negative binomial GLM
//!
//! The pipeline normalizes library sizes by median of ratios, estimates and
//! shrinks per-gene dispersions, fits nested full and reduced models, and
//! tests each gene with a likelihood ratio test followed by
//! Benjamini-Hochberg adjustment.
//!
//! # Example
//!
//! ```ignore
//! use std::collections::BTreeMap;
//! use rust_nblrt::prelude::*;
//!
//! let counts = read_count_matrix("counts.tsv")?;
//! let samples = read_sample_table("samples.tsv", &["condition".to_string()], &BTreeMap::new())?;
//! let counts = counts.select_samples(samples.sample_ids())?;
//!
//! let config = AnalysisConfig::new("condition");
//! let table = run_lrt_analysis(&counts, &samples, &AnnotationTable::new(), &config)?;
//! write_results("results.csv", &table)?;
//! println!("{}", table.summary());
//! ```

pub mod cli;
pub mod config;
pub mod data;
pub mod dispersion;
pub mod error;
pub mod glm;
pub mod io;
pub mod linalg;
pub mod normalization;
pub mod stats;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::AnalysisConfig;
    pub use crate::data::{AnnotationTable, CountMatrix, Factor, GeneAnnotation, SampleTable};
    pub use crate::dispersion::{estimate_dispersions, DispersionParams, TrendFitMethod};
    pub use crate::error::{FitStage, NbLrtError, Result};
    pub use crate::glm::{DesignFormula, DesignPair, GlmFitParams};
    pub use crate::io::{
        read_annotation, read_count_matrix, read_sample_table, write_gene_status, write_results,
        write_summary, DeResultRow, DeResultTable, GeneStatus, RunSummary,
    };
    pub use crate::normalization::{estimate_size_factors, SizeFactorMethod};
    pub use crate::testing::{benjamini_hochberg, likelihood_ratio_test};
    pub use crate::run_lrt_analysis;
}

use std::collections::{BTreeMap, HashMap};

use ndarray::Array1;

use crate::dispersion::GeneDispersion;
use crate::glm::{fit_genes, GeneFit};
use crate::normalization::validate_size_factors;
use prelude::*;

/// Rebuilds factors that have an explicit level order in `levels`
fn apply_factor_levels(table: &SampleTable, levels: &BTreeMap<String, Vec<String>>) -> Result<SampleTable> {
    if levels.is_empty() {
        return Ok(table.clone());
    }
    let mut releveled = SampleTable::new(table.sample_ids().to_vec())?;
    for factor in table.factors() {
        match levels.get(factor.name()) {
            Some(order) => {
                let values: Vec<String> = (0..factor.len()).map(|i| factor.value(i).to_string()).collect();
                releveled.add_values(factor.name(), &values, Some(order.as_slice()))?;
            }
            None => releveled.add_factor(factor.clone())?,
        }
    }
    Ok(releveled)
}

fn record_exclusion(status: &mut GeneStatus, err: &NbLrtError, stage: FitStage) {
    *status = GeneStatus::from_error(err).unwrap_or_else(|| {
        let reason = err.to_string();
        match stage {
            FitStage::Dispersion => GeneStatus::DispersionDiverged(reason),
            FitStage::FullModel => GeneStatus::FullFitDiverged(reason),
            FitStage::ReducedModel => GeneStatus::ReducedFitDiverged(reason),
        }
    });
}

/// Run the complete likelihood ratio pipeline.
///
/// `counts` columns must match `samples` ids in order. Run-level problems
/// (degenerate input, invalid design, bad configuration) abort with `Err` and
/// no partial table. Genes that fail to converge are excluded from the rows
/// and from the multiple-testing correction, and listed in the statuses.
pub fn run_lrt_analysis(
    counts: &CountMatrix,
    samples: &SampleTable,
    annotation: &AnnotationTable,
    config: &AnalysisConfig,
) -> Result<DeResultTable> {
    config.validate()?;
    if counts.sample_ids() != samples.sample_ids() {
        return Err(NbLrtError::InvalidInput {
            reason: "count matrix columns do not match the sample table ids in order".to_string(),
        });
    }

    let samples = apply_factor_levels(samples, &config.factor_levels)?;
    let mut design = DesignPair::new(&samples, &config.covariates, &config.grouping)?;
    if let Some(name) = &config.lfc_coefficient {
        design.set_lfc_coefficient(name)?;
    }
    let df = design.df();
    let lfc_column = design.lfc_column;
    log::info!(
        "Full design {} vs reduced design {} ({} df); reporting {}",
        design.full_formula,
        design.reduced_formula,
        df,
        design.lfc_coefficient()
    );

    let (kept, all_zero) = counts.drop_zero_genes()?;
    if !all_zero.is_empty() {
        log::info!("{} genes with zero counts in every sample excluded", all_zero.len());
    }

    let size_factors: Array1<f64> = match &config.size_factors {
        Some(values) => validate_size_factors(values, &kept)?,
        None => estimate_size_factors(&kept, config.size_factor_method)?,
    };
    let sf = size_factors.to_vec();

    let estimates = estimate_dispersions(
        &kept,
        &size_factors,
        &design.full.matrix,
        config.fit_type,
        &config.dispersion,
    )?;

    let n = kept.n_genes();
    let mut status = vec![GeneStatus::Tested; n];
    let mut dispersions: Vec<Option<GeneDispersion>> = vec![None; n];
    for (g, est) in estimates.genes.iter().enumerate() {
        match est {
            Ok(d) => dispersions[g] = Some(*d),
            Err(e) => record_exclusion(&mut status[g], e, FitStage::Dispersion),
        }
    }

    log::info!("Fitting full model");
    let stage_genes: Vec<usize> = (0..n).filter(|&g| dispersions[g].is_some()).collect();
    let alphas: Vec<f64> = stage_genes
        .iter()
        .filter_map(|&g| dispersions[g].map(|d| d.final_value))
        .collect();
    let full_fits = fit_genes(&kept, &sf, &design.full, &stage_genes, &alphas, FitStage::FullModel, &config.glm);

    let mut full_ok: Vec<(usize, f64, GeneFit)> = Vec::with_capacity(full_fits.len());
    for ((&g, &alpha), fit) in stage_genes.iter().zip(&alphas).zip(full_fits) {
        match fit {
            Ok(fit) => full_ok.push((g, alpha, fit)),
            Err(e) => record_exclusion(&mut status[g], &e, FitStage::FullModel),
        }
    }

    log::info!("Fitting reduced model");
    let reduced_genes: Vec<usize> = full_ok.iter().map(|(g, _, _)| *g).collect();
    let reduced_alphas: Vec<f64> = full_ok.iter().map(|(_, a, _)| *a).collect();
    let reduced_fits = fit_genes(
        &kept,
        &sf,
        &design.reduced,
        &reduced_genes,
        &reduced_alphas,
        FitStage::ReducedModel,
        &config.glm,
    );

    let mut tested: Vec<(usize, GeneFit, GeneFit)> = Vec::with_capacity(full_ok.len());
    for ((g, _, full), reduced) in full_ok.into_iter().zip(reduced_fits) {
        match reduced {
            Ok(reduced) => tested.push((g, full, reduced)),
            Err(e) => record_exclusion(&mut status[g], &e, FitStage::ReducedModel),
        }
    }

    let pairs: Vec<(&GeneFit, &GeneFit)> = tested.iter().map(|(_, f, r)| (f, r)).collect();
    let outcomes = likelihood_ratio_test(&pairs, df)?;

    let mut rows = Vec::with_capacity(tested.len());
    for ((g, full, _), outcome) in tested.iter().zip(&outcomes) {
        let disp = match dispersions[*g] {
            Some(d) => d,
            None => continue,
        };
        let gene_id = &kept.gene_ids()[*g];
        let ann = annotation.get(gene_id).cloned().unwrap_or_default();
        rows.push(DeResultRow {
            gene_id: gene_id.clone(),
            symbol: ann.symbol,
            entrez_id: ann.entrez_id,
            base_mean: disp.base_mean,
            log2_fold_change: full.log2_coefficient(lfc_column),
            lfc_se: full.log2_standard_error(lfc_column),
            stat: outcome.stat,
            pvalue: outcome.pvalue,
            padj: outcome.padj,
            dispersion: disp.final_value,
            dispersion_outlier: disp.outlier,
        });
    }

    let mut by_id: HashMap<&str, GeneStatus> = kept
        .gene_ids()
        .iter()
        .map(String::as_str)
        .zip(status)
        .collect();
    let statuses: Vec<(String, GeneStatus)> = counts
        .gene_ids()
        .iter()
        .map(|id| {
            let s = by_id.remove(id.as_str()).unwrap_or(GeneStatus::AllZero);
            (id.clone(), s)
        })
        .collect();

    let mut summary = RunSummary::from_statuses(&statuses, &rows, config.alpha);
    summary.df = df;
    summary.lfc_coefficient = design.lfc_coefficient().to_string();
    summary.full_design = design.full_formula.to_string();
    summary.reduced_design = design.reduced_formula.to_string();
    summary.trend = estimates.trend.describe();
    summary.prior_variance = estimates.prior_variance;

    if summary.n_non_convergent > 0 {
        log::warn!(
            "{} genes excluded for non-convergence ({} dispersion, {} full model, {} reduced model)",
            summary.n_non_convergent,
            summary.non_convergent_by_stage.dispersion,
            summary.non_convergent_by_stage.full_model,
            summary.non_convergent_by_stage.reduced_model
        );
    }
    log::info!(
        "{} genes tested, {} with padj < {}",
        summary.n_tested,
        summary.n_significant,
        config.alpha
    );

    let lfc_coefficient = summary.lfc_coefficient.clone();
    Ok(DeResultTable::new(rows, statuses, summary, size_factors, lfc_coefficient))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, Axis};

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn three_groups() -> SampleTable {
        let mut table = SampleTable::new(ids("s", 6)).unwrap();
        table
            .add_values("group", &strings(&["A", "A", "B", "B", "C", "C"]), None)
            .unwrap();
        table
    }

    fn uniform_config() -> AnalysisConfig {
        AnalysisConfig {
            size_factors: Some(vec![1.0; 6]),
            ..AnalysisConfig::new("group")
        }
    }

    fn two_group_dataset() -> (CountMatrix, SampleTable) {
        let counts = CountMatrix::new(
            array![
                [100.0, 110.0, 90.0, 400.0, 420.0, 380.0],
                [500.0, 520.0, 480.0, 500.0, 510.0, 490.0],
                [300.0, 310.0, 290.0, 75.0, 80.0, 70.0],
                [50.0, 55.0, 45.0, 50.0, 52.0, 48.0],
                [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                [200.0, 220.0, 180.0, 200.0, 210.0, 190.0],
                [150.0, 160.0, 140.0, 300.0, 320.0, 280.0],
                [80.0, 85.0, 75.0, 80.0, 82.0, 78.0],
                [600.0, 620.0, 580.0, 600.0, 610.0, 590.0],
                [250.0, 260.0, 240.0, 500.0, 520.0, 480.0],
            ],
            strings(&[
                "gene_up", "gene_nc1", "gene_down", "gene_nc2", "gene_zero", "gene_nc3", "gene_up2",
                "gene_nc4", "gene_nc5", "gene_up3",
            ]),
            ids("s", 6),
        )
        .unwrap();
        let mut samples = SampleTable::new(ids("s", 6)).unwrap();
        samples
            .add_values(
                "treatment",
                &strings(&["control", "control", "control", "treated", "treated", "treated"]),
                None,
            )
            .unwrap();
        (counts, samples)
    }

    #[test]
    fn test_three_group_scenario() {
        let counts = CountMatrix::new(
            array![
                [10.0, 12.0, 100.0, 95.0, 10.0, 11.0],
                [50.0, 50.0, 50.0, 50.0, 50.0, 50.0],
                [20.0, 25.0, 22.0, 18.0, 24.0, 21.0],
            ],
            strings(&["de", "flat", "noise"]),
            ids("s", 6),
        )
        .unwrap();

        let table = run_lrt_analysis(&counts, &three_groups(), &AnnotationTable::new(), &uniform_config()).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.summary().df, 2);
        let de = table.get("de").unwrap();
        let flat = table.get("flat").unwrap();
        assert!(de.pvalue < 0.01, "DE gene p = {}", de.pvalue);
        assert!(flat.pvalue > 0.5, "flat gene p = {}", flat.pvalue);
        assert_eq!(table.rows()[0].gene_id, "de");
        assert_eq!(table.lfc_coefficient(), "group_C_vs_A");
    }

    #[test]
    fn test_two_groups_of_three_scenario() {
        let counts = CountMatrix::new(
            array![
                [10.0, 10.0, 10.0, 100.0, 100.0, 100.0],
                [50.0, 50.0, 50.0, 50.0, 50.0, 50.0],
                [20.0, 25.0, 22.0, 18.0, 24.0, 21.0],
            ],
            strings(&["de", "flat", "noise"]),
            ids("s", 6),
        )
        .unwrap();
        let mut samples = SampleTable::new(ids("s", 6)).unwrap();
        samples
            .add_values("group", &strings(&["A", "A", "A", "B", "B", "B"]), None)
            .unwrap();

        let table = run_lrt_analysis(&counts, &samples, &AnnotationTable::new(), &uniform_config()).unwrap();

        assert_eq!(table.summary().df, 1);
        let de = table.get("de").unwrap();
        let flat = table.get("flat").unwrap();
        assert!(de.pvalue < 0.01, "DE gene p = {}", de.pvalue);
        assert!(flat.pvalue > 0.5, "flat gene p = {}", flat.pvalue);
        assert!((de.log2_fold_change - 10.0f64.log2()).abs() < 0.01);
        assert_eq!(table.rows()[0].gene_id, "de");
    }

    #[test]
    fn test_two_group_pipeline() {
        let (counts, samples) = two_group_dataset();
        let mut annotation = AnnotationTable::new();
        annotation.insert(
            "gene_up",
            GeneAnnotation {
                symbol: Some("UP1".to_string()),
                entrez_id: Some(1001),
            },
        );

        let table =
            run_lrt_analysis(&counts, &samples, &annotation, &AnalysisConfig::new("treatment")).unwrap();

        let up = table.get("gene_up").unwrap();
        assert!(up.log2_fold_change > 1.5);
        assert!(up.pvalue < 1e-3);
        assert_eq!(up.symbol.as_deref(), Some("UP1"));
        assert_eq!(up.entrez_id, Some(1001));
        assert!(table.get("gene_down").unwrap().log2_fold_change < -1.5);

        let nc = table.get("gene_nc1").unwrap();
        assert!(nc.symbol.is_none());
        assert!(nc.log2_fold_change.abs() < 0.5);
        assert_eq!(table.size_factors().len(), 6);
    }

    #[test]
    fn test_all_zero_gene_is_excluded_from_rows_and_correction() {
        let (counts, samples) = two_group_dataset();
        let config = AnalysisConfig::new("treatment");
        let table = run_lrt_analysis(&counts, &samples, &AnnotationTable::new(), &config).unwrap();

        assert!(table.get("gene_zero").is_none());
        assert_eq!(table.status("gene_zero"), Some(&GeneStatus::AllZero));
        assert_eq!(table.summary().n_all_zero, 1);
        assert_eq!(table.summary().n_total, 10);
        assert_eq!(table.statuses().len(), 10);
        assert_eq!(table.statuses()[4].0, "gene_zero");

        // adjustment over the tested genes only
        let pvalues: Vec<f64> = table.rows().iter().map(|r| r.pvalue).collect();
        let expected = benjamini_hochberg(&pvalues);
        for (row, padj) in table.rows().iter().zip(expected) {
            assert!((row.padj - padj).abs() < 1e-12);
        }
        assert_eq!(
            table.summary().n_tested + table.summary().n_non_convergent + table.summary().n_all_zero,
            10
        );
    }

    #[test]
    fn test_unfittable_genes_are_excluded_from_rows_and_correction() {
        let (counts, samples) = two_group_dataset();
        // log means past the coefficient bound
        let extra = array![
            [1e14, 1e14, 1e14, 1e14, 1e14, 1e14],
            [1e14, 1e14, 1e14, 2e14, 2e14, 2e14],
        ];
        let mut gene_ids = counts.gene_ids().to_vec();
        gene_ids.extend(strings(&["gene_huge1", "gene_huge2"]));
        let stacked = ndarray::concatenate(Axis(0), &[counts.counts(), extra.view()]).unwrap();
        let counts = CountMatrix::new(stacked, gene_ids, ids("s", 6)).unwrap();
        let config = AnalysisConfig {
            size_factors: Some(vec![1.0; 6]),
            ..AnalysisConfig::new("treatment")
        };

        let table = run_lrt_analysis(&counts, &samples, &AnnotationTable::new(), &config).unwrap();

        for id in ["gene_huge1", "gene_huge2"] {
            assert!(table.get(id).is_none());
            assert!(matches!(table.status(id), Some(GeneStatus::FullFitDiverged(_))));
        }
        let summary = table.summary();
        assert_eq!(summary.non_convergent_by_stage.full_model, 2);
        assert_eq!(summary.n_non_convergent, 2);
        assert_eq!(summary.n_tested, table.len());
        assert_eq!(summary.n_tested + summary.n_non_convergent + summary.n_all_zero, 12);
        assert!(table.get("gene_up").is_some());

        let pvalues: Vec<f64> = table.rows().iter().map(|r| r.pvalue).collect();
        let expected = benjamini_hochberg(&pvalues);
        for (row, padj) in table.rows().iter().zip(expected) {
            assert!((row.padj - padj).abs() < 1e-12);
        }
        let outliers = table.rows().iter().filter(|r| r.dispersion_outlier).count();
        assert_eq!(summary.n_dispersion_outliers, outliers);
    }

    #[test]
    fn test_padj_monotone_in_pvalue_order() {
        let (counts, samples) = two_group_dataset();
        let table =
            run_lrt_analysis(&counts, &samples, &AnnotationTable::new(), &AnalysisConfig::new("treatment"))
                .unwrap();
        for row in table.rows() {
            assert!(row.padj >= row.pvalue);
            assert!(row.padj <= 1.0);
        }
        for w in table.rows().windows(2) {
            assert!(w[0].pvalue <= w[1].pvalue);
            assert!(w[0].padj <= w[1].padj);
        }
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let (counts, samples) = two_group_dataset();
        let config = AnalysisConfig::new("treatment");
        let first = run_lrt_analysis(&counts, &samples, &AnnotationTable::new(), &config).unwrap();
        let second = run_lrt_analysis(&counts, &samples, &AnnotationTable::new(), &config).unwrap();
        assert_eq!(first.rows(), second.rows());
        assert_eq!(first.statuses(), second.statuses());
        assert_eq!(first.summary(), second.summary());
    }

    #[test]
    fn test_identical_counts_have_no_fold_change() {
        let counts = CountMatrix::new(
            array![
                [30.0, 30.0, 30.0, 30.0, 30.0, 30.0],
                [10.0, 12.0, 100.0, 95.0, 10.0, 11.0],
                [40.0, 35.0, 45.0, 38.0, 42.0, 36.0],
            ],
            strings(&["same", "de", "other"]),
            ids("s", 6),
        )
        .unwrap();
        let table = run_lrt_analysis(&counts, &three_groups(), &AnnotationTable::new(), &uniform_config()).unwrap();

        let same = table.get("same").unwrap();
        let de = table.get("de").unwrap();
        assert!(same.log2_fold_change.abs() < 1e-6);
        assert!(same.stat < 1e-6);
        assert!(same.pvalue >= de.pvalue);
    }

    #[test]
    fn test_lfc_coefficient_override() {
        let counts = CountMatrix::new(
            array![
                [10.0, 12.0, 100.0, 95.0, 10.0, 11.0],
                [20.0, 25.0, 22.0, 18.0, 24.0, 21.0],
                [50.0, 48.0, 52.0, 47.0, 51.0, 49.0],
            ],
            strings(&["de", "noise", "flat"]),
            ids("s", 6),
        )
        .unwrap();
        let config = AnalysisConfig {
            lfc_coefficient: Some("group_B_vs_A".to_string()),
            ..uniform_config()
        };
        let table = run_lrt_analysis(&counts, &three_groups(), &AnnotationTable::new(), &config).unwrap();
        assert_eq!(table.lfc_coefficient(), "group_B_vs_A");
        assert!(table.get("de").unwrap().log2_fold_change > 2.5);

        let bad = AnalysisConfig {
            lfc_coefficient: Some("Intercept".to_string()),
            ..uniform_config()
        };
        assert!(matches!(
            run_lrt_analysis(&counts, &three_groups(), &AnnotationTable::new(), &bad).unwrap_err(),
            NbLrtError::InvalidDesign { .. }
        ));
    }

    #[test]
    fn test_factor_levels_change_the_reference() {
        let (counts, samples) = two_group_dataset();
        let mut config = AnalysisConfig::new("treatment");
        config
            .factor_levels
            .insert("treatment".to_string(), strings(&["treated", "control"]));
        let table = run_lrt_analysis(&counts, &samples, &AnnotationTable::new(), &config).unwrap();
        assert_eq!(table.lfc_coefficient(), "treatment_control_vs_treated");
        assert!(table.get("gene_up").unwrap().log2_fold_change < -1.5);
    }

    #[test]
    fn test_run_level_errors_abort() {
        let (counts, samples) = two_group_dataset();

        let missing = AnalysisConfig::new("genotype");
        assert!(matches!(
            run_lrt_analysis(&counts, &samples, &AnnotationTable::new(), &missing).unwrap_err(),
            NbLrtError::InvalidDesign { .. }
        ));

        let zeros = CountMatrix::new(Array2::zeros((3, 6)), ids("g", 3), ids("s", 6)).unwrap();
        assert!(matches!(
            run_lrt_analysis(&zeros, &samples, &AnnotationTable::new(), &AnalysisConfig::new("treatment"))
                .unwrap_err(),
            NbLrtError::DegenerateInput { .. }
        ));

        let reordered = counts.select_samples(&strings(&["s2", "s1", "s3", "s4", "s5", "s6"])).unwrap();
        assert!(matches!(
            run_lrt_analysis(&reordered, &samples, &AnnotationTable::new(), &AnalysisConfig::new("treatment"))
                .unwrap_err(),
            NbLrtError::InvalidInput { .. }
        ));
    }

    #[test]
    fn test_single_level_grouping_is_invalid_design() {
        let counts = CountMatrix::new(array![[5.0, 6.0, 7.0], [1.0, 2.0, 3.0]], ids("g", 2), ids("s", 3)).unwrap();
        let mut samples = SampleTable::new(ids("s", 3)).unwrap();
        samples.add_values("group", &strings(&["A", "A", "A"]), None).unwrap();
        assert!(matches!(
            run_lrt_analysis(&counts, &samples, &AnnotationTable::new(), &AnalysisConfig::new("group"))
                .unwrap_err(),
            NbLrtError::InvalidDesign { .. }
        ));
    }
}
