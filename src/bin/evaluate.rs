//! Evaluate a trained checkpoint on a split and write per-example
//! prediction artifacts.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin evaluate -- \
//!     --data data/test.jsonl --tables data/test_tables.jsonl \
//!     --checkpoint runs/base/model_best.safetensors \
//!     --artifacts runs/base/test_predictions.jsonl
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use nl2sql::data::Dataset;
use nl2sql::encoder::{BertEncoder, BertEncoderConfig, DEFAULT_ENCODER_REPO, DEFAULT_MAX_SEQ_LEN};
use nl2sql::engine::{BoundedEngine, MemEngine};
use nl2sql::train::{RunConfig, Trainer};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Evaluate a trained parser checkpoint")]
struct Args {
    /// Examples to evaluate (jsonl).
    #[arg(long)]
    data: PathBuf,

    /// Tables for the split (jsonl).
    #[arg(long)]
    tables: PathBuf,

    /// Trained decoder parameters (safetensors).
    #[arg(long)]
    checkpoint: PathBuf,

    /// Where to write one prediction record per example (jsonl).
    #[arg(long)]
    artifacts: Option<PathBuf>,

    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Decode greedily instead of with execution guidance.
    #[arg(long)]
    no_execution_guidance: bool,

    #[arg(long, default_value_t = 4)]
    beam_width: usize,

    /// Per-query execution deadline during decoding and scoring.
    #[arg(long, default_value_t = 10_000)]
    exec_timeout_ms: u64,

    /// Encoder repository on HuggingFace.
    #[arg(long, default_value = DEFAULT_ENCODER_REPO)]
    model_repo: String,

    #[arg(long, default_value_t = DEFAULT_MAX_SEQ_LEN)]
    max_seq_len: usize,
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    info!("Data:       {}", args.data.display());
    info!("Checkpoint: {}", args.checkpoint.display());

    let data = Dataset::load(&args.data, &args.tables)?;
    let encoder = BertEncoder::load(
        BertEncoderConfig::default()
            .with_model(&args.model_repo)
            .with_max_seq_len(args.max_seq_len),
    )?;

    let config = RunConfig {
        batch_size: args.batch_size,
        beam_width: args.beam_width,
        execution_guided: !args.no_execution_guidance,
        exec_timeout_ms: args.exec_timeout_ms,
        ..Default::default()
    };
    let beam = config.execution_guided.then(|| config.beam_config());
    let timeout = Duration::from_millis(config.exec_timeout_ms);
    let mut trainer = Trainer::new(config, Box::new(encoder))?;
    trainer.load_checkpoint(&args.checkpoint)?;

    let engine = BoundedEngine::new(MemEngine::new(data.tables.clone()), timeout);

    let mut artifacts: Option<BufWriter<File>> = args
        .artifacts
        .as_ref()
        .map(File::create)
        .transpose()?
        .map(BufWriter::new);
    let metrics = trainer.evaluate(
        &data,
        &engine,
        beam.as_ref(),
        artifacts.as_mut().map(|w| w as &mut dyn Write),
    )?;
    if let Some(mut w) = artifacts {
        w.flush()?;
    }

    info!("Metrics: {metrics}");
    if let Some(path) = &args.artifacts {
        info!("Artifacts written to {}", path.display());
    }
    Ok(())
}
