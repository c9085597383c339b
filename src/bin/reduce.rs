//! Reduction driver: read a learning-set data file, compute the irredundant
//! difference matrix and its column weights, and write the result file.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin reduce -- input.txt output.txt
//! cargo run --release --bin reduce -- - - --no-transfer < in.txt > out.txt
//! ```

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::time::Instant;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use confluence::datafile::DataFile;
use confluence::sweep::{SweepConfig, sweep};

#[derive(Parser, Debug)]
#[command(about = "Reduce a learning set to its irredundant difference matrix")]
struct Args {
    /// Input data file, or `-` for stdin.
    input: String,

    /// Output data file, or `-` for stdout.
    output: String,

    /// Emit only the computed result blocks, without transferring the input
    /// blocks to the output.
    #[arg(long)]
    no_transfer: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut datafile = if args.input == "-" {
        DataFile::load(io::stdin().lock())?
    } else {
        DataFile::load(BufReader::new(File::open(&args.input)?))?
    };

    let dataset = datafile.to_dataset()?;
    let classes = dataset.class_count();
    info!(
        "loaded {} rows, {} feature columns, {} classes",
        dataset.len(),
        dataset.feature_width(),
        classes
    );

    let start = Instant::now();
    let accumulator = sweep(&dataset, &SweepConfig::default())?;
    let (weights, rows) = accumulator.into_parts();
    info!(
        "swept {} class pairs in {:.2?}: {} irredundant rows",
        classes * classes.saturating_sub(1) / 2,
        start.elapsed(),
        rows.len()
    );

    if args.no_transfer {
        datafile.reset();
    }
    datafile.set_result(rows, weights);

    if args.output == "-" {
        let stdout = io::stdout();
        datafile.save(&mut stdout.lock())?;
    } else {
        let mut writer = BufWriter::new(File::create(&args.output)?);
        datafile.save(&mut writer)?;
        writer.flush()?;
    }

    Ok(())
}
