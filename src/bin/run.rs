//! Run: full confidence-scoring analysis
//!
//! Loads a feature table and a sample sheet, builds the condition and
//! block layouts, computes statistics and their null distribution, and
//! writes per-feature confidence scores.

use clap::Parser;
use csv::WriterBuilder;
use flate2::write::GzEncoder;
use flate2::Compression;
use pade_rust::{
    analysis::{equalize_means, run_analysis, run_analysis_with_indexes},
    io::{
        layout_for_factors, load_feature_ids, load_sample_indexes, load_sample_sheet, load_table,
        save_results, save_sample_indexes, write_results,
    },
    ordering::{DEFAULT_SUMMARY_MIN_CONF, DEFAULT_SUMMARY_STEP_SIZE},
    sampling::{SampleFrom, SamplingConfig, SamplingMode, DEFAULT_MAX_DRAWS, DEFAULT_SEED},
    stat::StatName,
    AnalysisResults, Settings, DEFAULT_NUM_BINS, DEFAULT_TUNING_PARAMS,
};
use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pade-run",
    version,
    about = "Scores features for differential effects using permutation or bootstrap resampling"
)]
struct Cli {
    /// Tab-separated feature table (first column feature ids, one column per sample)
    #[arg(long, required = true)]
    infile: PathBuf,

    /// Tab-separated sample sheet: a sample column, then one column per factor
    #[arg(long, required = true)]
    sample_sheet: PathBuf,

    /// Factor(s) to test for differential effects. May be given more than once
    #[arg(long)]
    condition: Vec<String>,

    /// Blocking (nuisance) factor(s). May be given more than once
    #[arg(long)]
    block: Vec<String>,

    /// Statistic: 'f', 't', 'paired-t', 'one-sample-t', or 'means-ratio'
    #[arg(long, default_value = "f")]
    stat: StatName,

    /// Tuning parameter for the statistic. Give it more than once to search over several
    #[arg(long = "tuning-param")]
    tuning_params: Vec<f64>,

    /// Number of bins used to discretize statistic space
    #[arg(long, default_value_t = DEFAULT_NUM_BINS)]
    num_bins: usize,

    /// Maximum number of permutations or bootstrap draws
    #[arg(long, default_value_t = DEFAULT_MAX_DRAWS)]
    num_samples: usize,

    /// 'permutation' or 'bootstrap'
    #[arg(long, default_value = "permutation")]
    sampling: SamplingMode,

    /// Bootstrap from 'raw' values or from model 'residuals'
    #[arg(long, default_value = "raw")]
    sample_from: SampleFrom,

    /// Seed for random draws
    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// Report the means ratio as-is instead of max(r, 1/r)
    #[arg(long)]
    asymmetric: bool,

    /// Shift every feature so each block x condition group has mean 0
    #[arg(long)]
    equalize_means: bool,

    /// File of feature ids (one per line) to equalize means for
    #[arg(long)]
    equalize_means_ids: Option<PathBuf>,

    /// Use the draws in this file instead of generating them
    #[arg(long)]
    sample_indexes: Option<PathBuf>,

    /// Save the draws used to this file
    #[arg(long)]
    save_sample_indexes: Option<PathBuf>,

    /// Lowest confidence level in the summary
    #[arg(long, default_value_t = DEFAULT_SUMMARY_MIN_CONF)]
    min_conf: f64,

    /// Step between confidence levels in the summary
    #[arg(long, default_value_t = DEFAULT_SUMMARY_STEP_SIZE)]
    conf_interval: f64,

    /// Path for the output results file (gzipped)
    #[arg(long, default_value = "pade_results.txt.gz")]
    output_file: PathBuf,

    /// Also save the full results in binary format
    #[arg(long)]
    results_bin: Option<PathBuf>,

    /// Number of threads to use
    #[arg(long, default_value_t = 1)]
    n_threads: usize,
}

fn print_summary(results: &AnalysisResults) {
    println!();
    println!("Summary of features by confidence level:");
    println!();
    println!("Confidence |   Num.   | Tuning");
    println!("   Level   | Features | Param.");
    println!("-----------+----------+-------");
    let summary = &results.summary;
    for i in 0..summary.len() {
        println!(
            "{:9.1}% | {:8} | {:0.4}",
            summary.levels[i] * 100.0,
            summary.num_above[i],
            results.tuning_params[summary.best_param_idxs[i]]
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    log::info!("Starting analysis of {:?}", cli.infile);
    log::info!("Using {} threads", cli.n_threads);

    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.n_threads)
        .build_global()?;

    // ===================================================================
    // 1. Load Input and Build Layouts
    // ===================================================================
    let input = load_table(&cli.infile)?;
    let sheet = load_sample_sheet(&cli.sample_sheet)?;

    let condition_factors = if cli.condition.is_empty() {
        if sheet.factors.len() != 1 {
            return Err(format!(
                "Please pick the condition factor(s) with --condition; the sample sheet has factors {:?}",
                sheet.factors
            )
            .into());
        }
        log::info!("Using the only factor '{}' as the condition", sheet.factors[0]);
        sheet.factors.clone()
    } else {
        cli.condition.clone()
    };

    let (condition_layout, condition_labels) =
        layout_for_factors(&sheet, &input.sample_names, &condition_factors)?;
    let (block_layout, _) = layout_for_factors(&sheet, &input.sample_names, &cli.block)?;
    log::info!("Conditions: {:?}", condition_labels);

    // ===================================================================
    // 2. Settings
    // ===================================================================
    let tuning_params = if cli.tuning_params.is_empty() {
        DEFAULT_TUNING_PARAMS.to_vec()
    } else {
        cli.tuning_params.clone()
    };
    let settings = Settings {
        stat: cli.stat,
        tuning_params,
        num_bins: cli.num_bins,
        sampling: SamplingConfig {
            mode: cli.sampling,
            max_draws: cli.num_samples,
            sample_from: cli.sample_from,
            seed: cli.seed,
        },
        symmetric: !cli.asymmetric,
        summary_min_conf: cli.min_conf,
        summary_step_size: cli.conf_interval,
    };
    log::debug!("Settings: {:?}", settings);

    // ===================================================================
    // 3. Optional Mean Equalization
    // ===================================================================
    let table = if cli.equalize_means || cli.equalize_means_ids.is_some() {
        let full_layout = block_layout.intersect(&condition_layout)?;
        let mask = match &cli.equalize_means_ids {
            Some(path) => {
                let ids: HashSet<String> = load_feature_ids(path)?.into_iter().collect();
                let mask: Vec<bool> = input.feature_ids.iter().map(|id| ids.contains(id)).collect();
                log::info!(
                    "Equalizing means for {} of {} features",
                    mask.iter().filter(|&&m| m).count(),
                    mask.len()
                );
                Some(mask)
            }
            None => {
                log::info!("Equalizing means for all features");
                None
            }
        };
        equalize_means(input.table.view(), &full_layout, mask.as_deref())
    } else {
        input.table.clone()
    };

    // ===================================================================
    // 4. Run Analysis
    // ===================================================================
    let results = match &cli.sample_indexes {
        Some(path) => {
            let indexes = load_sample_indexes(path, table.ncols())?;
            run_analysis_with_indexes(
                table.view(),
                &condition_layout,
                &block_layout,
                &settings,
                indexes,
            )?
        }
        None => run_analysis(table.view(), &condition_layout, &block_layout, &settings)?,
    };

    // ===================================================================
    // 5. Save Output
    // ===================================================================
    if let Some(path) = &cli.save_sample_indexes {
        save_sample_indexes(path, &results.sample_indexes)?;
    }

    let out_file = File::create(&cli.output_file)?;
    let out_writer_gz = GzEncoder::new(out_file, Compression::default());
    let mut csv_writer = WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(out_writer_gz);
    write_results(&mut csv_writer, &input, &results, &condition_labels)?;
    csv_writer
        .into_inner()
        .map_err(|e| e.into_error())?
        .finish()?;

    if let Some(path) = &cli.results_bin {
        save_results(path, &results)?;
    }

    print_summary(&results);
    log::info!("Analysis complete. Results written to {:?}", cli.output_file);
    Ok(())
}
