//! Train the semantic parser and keep the best checkpoint by dev
//! logical-form accuracy.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin train -- \
//!     --train-data data/train.jsonl --train-tables data/train_tables.jsonl \
//!     --dev-data data/dev.jsonl --dev-tables data/dev_tables.jsonl \
//!     --save-dir runs/base
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use nl2sql::data::Dataset;
use nl2sql::encoder::{BertEncoder, BertEncoderConfig, DEFAULT_ENCODER_REPO, DEFAULT_MAX_SEQ_LEN};
use nl2sql::engine::{BoundedEngine, MemEngine};
use nl2sql::score::Metrics;
use nl2sql::train::{EpochStats, ProgressSink, RunConfig, Trainer};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Train the table-question semantic parser")]
struct Args {
    /// Training examples (jsonl).
    #[arg(long)]
    train_data: PathBuf,

    /// Tables for the training split (jsonl).
    #[arg(long)]
    train_tables: PathBuf,

    /// Dev examples (jsonl).
    #[arg(long)]
    dev_data: PathBuf,

    /// Tables for the dev split (jsonl).
    #[arg(long)]
    dev_tables: PathBuf,

    /// Directory for checkpoints and the run configuration.
    #[arg(long, default_value = "runs/nl2sql")]
    save_dir: PathBuf,

    #[arg(long, default_value_t = 20)]
    epochs: usize,

    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Batches per optimizer step.
    #[arg(long, default_value_t = 4)]
    accumulate_gradients: usize,

    #[arg(long, default_value_t = 1e-3)]
    lr: f64,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Disable teacher forcing of the predicate heads on gold columns.
    #[arg(long)]
    no_constraint: bool,

    /// Disable execution-guided decoding during dev evaluation.
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
// Progress Bar
// ============================================================================

struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "  Epoch {msg} {bar:40.cyan/blue} {pos}/{len} batches [{elapsed_precise}]",
            )
            .unwrap()
            .progress_chars("##-"),
        );
        BarSink { bar }
    }
}

impl ProgressSink for BarSink {
    fn on_batch(&self, epoch: usize, batch: usize, num_batches: usize, loss: f32) {
        if self.bar.length() != Some(num_batches as u64) {
            self.bar.set_length(num_batches as u64);
        }
        self.bar.set_position((batch + 1) as u64);
        self.bar.set_message(format!("{epoch} (loss {loss:.4})"));
    }

    fn on_epoch(&self, epoch: usize, stats: &EpochStats, dev: &Metrics, dev_eg: Option<&Metrics>) {
        self.bar.println(format!(
            "epoch {epoch}: loss {:.4} | train {} | dev {dev}",
            stats.mean_loss, stats.train
        ));
        if let Some(eg) = dev_eg {
            self.bar.println(format!("epoch {epoch}: dev (guided) {eg}"));
        }
        self.bar.set_position(0);
    }

    fn on_best(&self, epoch: usize, logical_form_accuracy: f64, path: &std::path::Path) {
        self.bar.println(format!(
            "epoch {epoch}: new best dev logical-form accuracy {logical_form_accuracy:.4} -> {}",
            path.display()
        ));
    }
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

    info!("Train data: {}", args.train_data.display());
    info!("Dev data:   {}", args.dev_data.display());
    info!("Save dir:   {}", args.save_dir.display());

    let train = Dataset::load(&args.train_data, &args.train_tables)?;
    let dev = Dataset::load(&args.dev_data, &args.dev_tables)?;

    let encoder = BertEncoder::load(
        BertEncoderConfig::default()
            .with_model(&args.model_repo)
            .with_max_seq_len(args.max_seq_len),
    )?;

    let config = RunConfig {
        seed: args.seed,
        epochs: args.epochs,
        batch_size: args.batch_size,
        accumulate_gradients: args.accumulate_gradients,
        learning_rate: args.lr,
        constraint: !args.no_constraint,
        beam_width: args.beam_width,
        execution_guided: !args.no_execution_guidance,
        exec_timeout_ms: args.exec_timeout_ms,
        save_dir: args.save_dir,
        ..Default::default()
    };
    let timeout = Duration::from_millis(config.exec_timeout_ms);
    let mut trainer = Trainer::new(config, Box::new(encoder))?;

    let engine = BoundedEngine::new(MemEngine::new(dev.tables.clone()), timeout);
    let report = trainer.fit(&train, &dev, &engine, &BarSink::new())?;

    match report.best_epoch {
        Some(epoch) => info!(
            "Done. Best dev logical-form accuracy {:.4} at epoch {epoch}, checkpoint: {}",
            report.best_logical_form,
            report.checkpoint.display()
        ),
        None => info!("Done. No epoch improved on the initial accuracy."),
    }
    info!("Final dev metrics: {}", report.final_dev);
    if let Some(eg) = &report.final_dev_eg {
        info!("Final dev metrics (execution-guided): {eg}");
    }
    Ok(())
}
