//! rust_nblrt command-line interface

use clap::Parser;
use log::{info, LevelFilter};

use rust_nblrt::cli::{parse_sf_type, Cli, Commands, RunArgs};
use rust_nblrt::io::write_normalized_counts;
use rust_nblrt::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Find the first non-flag argument (potential subcommand)
    let first_positional = args.iter().skip(1).find(|a| !a.starts_with('-'));
    let subcommands = ["run", "normalize", "help"];
    let has_subcommand = first_positional.map_or(false, |a| subcommands.contains(&a.as_str()));

    if !has_subcommand {
        if args.iter().any(|a| a == "--help") {
            print_long_help();
        } else if args.iter().any(|a| a == "-h") {
            print_short_help();
        } else if args.iter().any(|a| a == "-V" || a == "--version") {
            println!("rust_nblrt {}", VERSION);
        } else {
            print_no_args();
        }
        return;
    }

    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        Some(Commands::Run(run)) => run_analysis(&run),
        Some(Commands::Normalize {
            counts,
            output,
            method,
        }) => run_normalize(&counts, &output, &method),
        None => {
            print_no_args();
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Custom help output
// ---------------------------------------------------------------------------

fn print_no_args() {
    println!("rust_nblrt v{}", VERSION);
    println!("Run `rust_nblrt -h` for usage or `rust_nblrt --help` for detailed information.");
}

fn print_short_help() {
    println!("rust_nblrt v{}", VERSION);
    println!();
    println!("Usage: rust_nblrt <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  run        Run the likelihood ratio analysis");
    println!("  normalize  Normalize count data only");
    println!();
    println!("Run `rust_nblrt <COMMAND> -h` for command-specific options.");
}

fn print_long_help() {
    println!("rust_nblrt v{}", VERSION);
    println!("Negative binomial likelihood ratio tests for RNA-seq counts");
    println!();
    println!("Usage: rust_nblrt <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  run        Run the likelihood ratio analysis");
    println!("               - Full design ~ covariates + grouping vs reduced ~ covariates");
    println!("               - Dispersion trend: parametric or mean");
    println!("               - Per-gene status report and JSON run summary");
    println!("  normalize  Normalize count data using median-of-ratios method");
    println!();
    println!("Global Options:");
    println!("  -v, --verbose    Enable verbose output");
    println!("  -h               Print short help");
    println!("      --help       Print detailed help");
    println!("  -V, --version    Print version");
    println!();
    println!("Examples:");
    println!("  rust_nblrt run -c counts.tsv -s samples.tsv -g treatment -o results.csv");
    println!();
    println!("  rust_nblrt run -c counts.tsv -s samples.tsv -g treatment --covariate batch \\");
    println!("    --levels treatment=control,low,high --summary summary.json");
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn run_analysis(args: &RunArgs) -> Result<()> {
    if args.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.threads)
            .build_global()
            .ok();
    }

    let config = args.to_config()?;

    info!("Loading count matrix from: {}", args.counts);
    let counts = read_count_matrix(&args.counts)?;

    info!("Loading sample table from: {}", args.samples);
    let samples = read_sample_table(&args.samples, &config.factor_names(), &config.factor_levels)?;
    let counts = counts.select_samples(samples.sample_ids())?;

    let annotation = match &args.annotation {
        Some(path) => {
            info!("Loading annotation from: {}", path);
            read_annotation(path)?
        }
        None => AnnotationTable::new(),
    };

    let table = run_lrt_analysis(&counts, &samples, &annotation, &config)?;

    info!("Writing {} results to: {}", table.len(), args.output);
    write_results(&args.output, &table)?;
    if let Some(path) = &args.status {
        info!("Writing gene status to: {}", path);
        write_gene_status(path, &table)?;
    }
    if let Some(path) = &args.summary {
        info!("Writing run summary to: {}", path);
        write_summary(path, table.summary())?;
    }

    println!("{}", table.summary());
    Ok(())
}

fn run_normalize(counts_path: &str, output_path: &str, method: &str) -> Result<()> {
    info!("Loading count matrix from: {}", counts_path);
    let counts = read_count_matrix(counts_path)?;

    let size_method = parse_sf_type(method)?;
    info!("Estimating size factors using {} method", method);
    let size_factors = estimate_size_factors(&counts, size_method)?;
    for (sample, sf) in counts.sample_ids().iter().zip(size_factors.iter()) {
        info!("  {}: {:.4}", sample, sf);
    }

    info!("Writing normalized counts to: {}", output_path);
    write_normalized_counts(output_path, &counts, &size_factors)?;
    Ok(())
}
