//! Make Samples: generate the draws for a run without running it
//!
//! Writes one draw per line, each followed by the condition of the sample
//! placed in every column. The file can be edited and handed back to
//! `pade-run --sample-indexes`.

use clap::Parser;
use pade_rust::{
    io::{layout_for_factors, load_sample_sheet, read_sample_names, write_sample_indexes},
    sampling::{
        block_slots, new_sample_indexes, num_orderings, SampleFrom, SamplingConfig, SamplingMode,
        DEFAULT_MAX_DRAWS, DEFAULT_SEED,
    },
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pade-makesamples",
    version,
    about = "Generates permutation or bootstrap sample indexes for a pade-run analysis"
)]
struct Cli {
    /// Tab-separated feature table; only its header is read
    #[arg(long, required = true)]
    infile: PathBuf,

    /// Tab-separated sample sheet: a sample column, then one column per factor
    #[arg(long, required = true)]
    sample_sheet: PathBuf,

    /// Factor(s) to test for differential effects
    #[arg(long, required = true)]
    condition: Vec<String>,

    /// Blocking (nuisance) factor(s)
    #[arg(long)]
    block: Vec<String>,

    /// Maximum number of draws
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

    /// Output file. Defaults to stdout
    #[arg(long)]
    output_file: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    log::info!("Generating sample indexes for {:?}", cli.infile);

    let sample_names = read_sample_names(&cli.infile)?;
    let sheet = load_sample_sheet(&cli.sample_sheet)?;
    let (condition_layout, condition_labels) =
        layout_for_factors(&sheet, &sample_names, &cli.condition)?;
    let (block_layout, block_labels) = layout_for_factors(&sheet, &sample_names, &cli.block)?;

    let total = num_orderings(&block_slots(&condition_layout, &block_layout));
    log::info!("Permutation space size: {}", total);

    let config = SamplingConfig {
        mode: cli.sampling,
        max_draws: cli.num_samples,
        sample_from: cli.sample_from,
        seed: cli.seed,
    };
    let indexes = new_sample_indexes(&condition_layout, &block_layout, sample_names.len(), &config)?;
    log::info!("Generated {} draws", indexes.num_draws());

    let mut output: Box<dyn Write> = match &cli.output_file {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(std::io::stdout().lock()),
    };

    writeln!(output, "# Block layout:     {:?}", block_layout.groups())?;
    writeln!(output, "# Condition layout: {:?}", condition_layout.groups())?;
    for (g, label) in condition_labels.iter().enumerate() {
        let symbol = if g < 26 { (b'A' + g as u8) as char } else { '?' };
        writeln!(output, "# {}: {}", symbol, label)?;
    }
    if !cli.block.is_empty() {
        writeln!(output, "# Blocks: {}", block_labels.join(" | "))?;
    }
    write_sample_indexes(&mut output, &indexes, Some(&condition_layout))?;
    output.flush()?;

    Ok(())
}
