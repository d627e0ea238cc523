//! Training and evaluation orchestration.
//!
//! One `Trainer` owns the decoder parameters and an encoder, and drives the
//! per-batch pipeline: sub-word split, alignment, label building, encoding,
//! the forward pass, and the loss. Gradients are accumulated over a fixed
//! number of batches before each optimizer step; a leftover window at the
//! end of an epoch still steps. Evaluation decodes freely or with execution
//! guidance, scores with the shared metrics, and optionally streams one
//! jsonl artifact line per example.

use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::align::AlignmentMap;
use crate::beam::{beam_decode, BeamConfig};
use crate::data::{Batcher, DataError, Dataset, Example};
use crate::decode::{decode_example, sort_conds_to_gold};
use crate::encoder::{EncodeInput, EncoderError, SentenceEncoder};
use crate::engine::QueryEngine;
use crate::labels::{LabelError, Labels};
use crate::model::{CondForcing, ModelError, SqlDecoder, SqlDecoderConfig};
use crate::score::{compare_fields, execution_match, Metrics};
use crate::sql::{RawSql, SqlAnnotation};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Seed for every source of randomness in a run.
    pub seed: u64,
    pub epochs: usize,
    pub batch_size: usize,
    /// Batches per optimizer step.
    pub accumulate_gradients: usize,
    pub learning_rate: f64,
    /// Teacher-force the predicate-operator and span heads on the
    /// ground-truth predicate columns.
    pub constraint: bool,
    pub beam_width: usize,
    pub prune_empty: bool,
    /// Use execution-guided decoding during dev evaluation.
    pub execution_guided: bool,
    pub exec_timeout_ms: u64,
    pub save_dir: PathBuf,
    pub proj_dim: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            seed: 1,
            epochs: 20,
            batch_size: 8,
            accumulate_gradients: 4,
            learning_rate: 1e-3,
            constraint: true,
            beam_width: 4,
            prune_empty: true,
            execution_guided: true,
            exec_timeout_ms: 10_000,
            save_dir: PathBuf::from("runs/nl2sql"),
            proj_dim: 100,
        }
    }
}

impl RunConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be positive");
        self.batch_size = batch_size;
        self
    }

    pub fn with_accumulate_gradients(mut self, n: usize) -> Self {
        assert!(n > 0, "accumulate_gradients must be positive");
        self.accumulate_gradients = n;
        self
    }

    pub fn with_save_dir(mut self, dir: &Path) -> Self {
        self.save_dir = dir.to_path_buf();
        self
    }

    pub fn beam_config(&self) -> BeamConfig {
        BeamConfig::default()
            .with_width(self.beam_width)
            .with_prune_empty(self.prune_empty)
    }
}

// ============================================================================
// Progress Reporting
// ============================================================================

/// Receives training progress. Implementations decide how to surface it
/// (logs, progress bars); the trainer never prints directly.
pub trait ProgressSink: Send + Sync {
    fn on_batch(&self, _epoch: usize, _batch: usize, _num_batches: usize, _loss: f32) {}
    fn on_epoch(&self, _epoch: usize, _stats: &EpochStats, _dev: &Metrics, _dev_eg: Option<&Metrics>) {
    }
    fn on_best(&self, _epoch: usize, _logical_form_accuracy: f64, _path: &Path) {}
}

/// Progress via `tracing`: per-batch at debug, per-epoch at info.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn on_batch(&self, epoch: usize, batch: usize, num_batches: usize, loss: f32) {
        debug!(epoch, batch, num_batches, loss, "batch done");
    }

    fn on_epoch(&self, epoch: usize, stats: &EpochStats, dev: &Metrics, dev_eg: Option<&Metrics>) {
        match dev_eg {
            Some(eg) => info!(
                epoch,
                mean_loss = stats.mean_loss,
                train = %stats.train,
                %dev,
                dev_guided = %eg,
                "epoch done"
            ),
            None => info!(epoch, mean_loss = stats.mean_loss, train = %stats.train, %dev, "epoch done"),
        }
    }

    fn on_best(&self, epoch: usize, logical_form_accuracy: f64, path: &Path) {
        info!(
            epoch,
            logical_form_accuracy,
            path = %path.display(),
            "new best checkpoint"
        );
    }
}

// ============================================================================
// Artifacts
// ============================================================================

#[derive(Serialize)]
struct PredictionRecord<'a> {
    query: RawSql,
    table_id: &'a str,
    nlu: &'a str,
}

#[derive(Serialize)]
struct SkipRecord<'a> {
    error: String,
    nlu: &'a str,
    table_id: &'a str,
}

// ============================================================================
// Batch Preparation
// ============================================================================

/// One example made encoder-ready: sub-word pieces and the token alignment
/// that truncation was computed under.
struct Prepared<'a> {
    example: &'a Example,
    question_pieces: Vec<Vec<String>>,
    header_pieces: Vec<Vec<String>>,
    map: AlignmentMap,
}

impl Prepared<'_> {
    fn encode_input(&self) -> EncodeInput<'_> {
        EncodeInput {
            question_pieces: &self.question_pieces[..self.map.kept_tokens()],
            header_pieces: &self.header_pieces,
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Per-epoch training summary.
#[derive(Debug, Clone, Copy)]
pub struct EpochStats {
    pub mean_loss: f32,
    pub optimizer_steps: usize,
    /// Examples dropped from updates because their labels could not be
    /// built (span lost to truncation).
    pub skipped: usize,
    /// Per-field accuracy of free decoding over the training batches.
    /// Execution is not scored here, so its counter stays zero.
    pub train: Metrics,
}

/// Outcome of a full training run.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub best_epoch: Option<usize>,
    pub best_logical_form: f64,
    /// Last epoch's dev metrics under free decoding.
    pub final_dev: Metrics,
    /// Last epoch's dev metrics under execution-guided decoding, when on.
    pub final_dev_eg: Option<Metrics>,
    pub checkpoint: PathBuf,
}

// ============================================================================
// Trainer
// ============================================================================

pub struct Trainer {
    config: RunConfig,
    encoder: Box<dyn SentenceEncoder>,
    decoder: SqlDecoder,
    varmap: VarMap,
    device: Device,
}

impl Trainer {
    /// Build a trainer with freshly initialized decoder parameters.
    pub fn new(config: RunConfig, encoder: Box<dyn SentenceEncoder>) -> Result<Trainer> {
        let device = Device::cuda_if_available(0)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder_cfg =
            SqlDecoderConfig::new(encoder.hidden_dim()).with_proj_dim(config.proj_dim);
        let decoder = SqlDecoder::new(&decoder_cfg, vb, &device)?;
        Ok(Trainer {
            config,
            encoder,
            decoder,
            varmap,
            device,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Restore decoder parameters from a checkpoint.
    pub fn load_checkpoint(&mut self, path: &Path) -> Result<()> {
        self.varmap.load(path)?;
        info!(path = %path.display(), "checkpoint loaded");
        Ok(())
    }

    /// Sub-word budget left for the question once the headers and special
    /// tokens are accounted for.
    fn question_budget(&self, header_pieces: &[Vec<String>]) -> usize {
        let header_total: usize = header_pieces.iter().map(Vec::len).sum();
        self.encoder
            .max_seq_len()
            .saturating_sub(header_total + header_pieces.len() + 2)
    }

    fn prepare<'a>(&self, batch: &[&'a Example], data: &Dataset) -> Result<Vec<Prepared<'a>>> {
        batch
            .iter()
            .map(|&example| {
                let table = data.table(example);
                let question_pieces = self.encoder.subword_split(&example.question.ref_tokens)?;
                let header_pieces = self.encoder.subword_split(&table.headers)?;
                let budget = self.question_budget(&header_pieces);
                let map = AlignmentMap::build(&question_pieces, budget);
                Ok(Prepared {
                    example,
                    question_pieces,
                    header_pieces,
                    map,
                })
            })
            .collect()
    }

    // ========================================================================
    // Training
    // ========================================================================

    /// Run one epoch of training over a fresh shuffle of `data`.
    pub fn train_epoch(
        &mut self,
        data: &Dataset,
        opt: &mut AdamW,
        rng: &mut SmallRng,
        epoch: usize,
        sink: &dyn ProgressSink,
    ) -> Result<EpochStats> {
        let mut batcher = Batcher::new(data.examples.len(), self.config.batch_size);
        batcher.shuffle(rng);
        let num_batches = batcher.num_batches();

        let mut window: Option<Tensor> = None;
        let mut window_len = 0usize;
        let mut loss_sum = 0f32;
        let mut loss_count = 0usize;
        let mut optimizer_steps = 0usize;
        let mut skipped = 0usize;
        let mut train_metrics = Metrics::default();

        for (batch_idx, batch) in batcher.iter(&data.examples).enumerate() {
            let prepared = self.prepare(&batch, data)?;

            // Build labels, dropping examples whose gold span did not
            // survive truncation.
            let mut kept = Vec::with_capacity(prepared.len());
            let mut labels = Vec::with_capacity(prepared.len());
            for p in &prepared {
                if p.map.kept_tokens() == 0 {
                    skipped += 1;
                    continue;
                }
                match Labels::build(&p.example.gold, &p.map) {
                    Ok(l) => {
                        labels.push(l);
                        kept.push(p);
                    }
                    Err(err) => {
                        warn!(question = %p.example.question.raw, %err, "example dropped");
                        skipped += 1;
                    }
                }
            }
            if kept.is_empty() {
                continue;
            }

            let inputs: Vec<EncodeInput> = kept.iter().map(|p| p.encode_input()).collect();
            let encoded = self.encoder.encode(&inputs)?;

            let forcing: Option<Vec<CondForcing>> = self.config.constraint.then(|| {
                labels
                    .iter()
                    .map(|l| CondForcing {
                        cond_cols: l.cond_cols.clone(),
                    })
                    .collect()
            });
            let scores = self.decoder.forward_train(&encoded, forcing.as_deref())?;
            let loss = self.decoder.loss(&scores, &labels)?;

            let loss_value: f32 = loss.detach().to_vec0()?;
            loss_sum += loss_value;
            loss_count += 1;
            sink.on_batch(epoch, batch_idx, num_batches, loss_value);

            // Free-decoding accuracy over the same batch, execution aside.
            // Predicates are reordered to the gold column order first, since
            // the conditioned heads were trained against that order.
            let infer = self.decoder.forward_infer(&encoded)?;
            for (p, field_scores) in kept.iter().zip(&infer) {
                let mut pred = decode_example(field_scores, &p.example.question, &p.map);
                sort_conds_to_gold(&mut pred, &p.example.gold);
                train_metrics.record(compare_fields(&pred, &p.example.gold), false);
            }

            window = Some(match window.take() {
                Some(acc) => (acc + loss)?,
                None => loss,
            });
            window_len += 1;
            if window_len == self.config.accumulate_gradients {
                self.step(opt, window.take().expect("window is non-empty"), window_len)?;
                optimizer_steps += 1;
                window_len = 0;
            }
        }

        // Leftover window still contributes an update.
        if let Some(acc) = window.take() {
            self.step(opt, acc, window_len)?;
            optimizer_steps += 1;
        }

        Ok(EpochStats {
            mean_loss: if loss_count == 0 {
                0.0
            } else {
                loss_sum / loss_count as f32
            },
            optimizer_steps,
            skipped,
            train: train_metrics,
        })
    }

    fn step(&self, opt: &mut AdamW, window_sum: Tensor, window_len: usize) -> Result<()> {
        let scaled = (window_sum / window_len as f64)?;
        opt.backward_step(&scaled)?;
        Ok(())
    }

    /// Full training loop: epochs of updates, a dev evaluation after each,
    /// and an atomic best-checkpoint keyed on dev logical-form accuracy.
    pub fn fit(
        &mut self,
        train: &Dataset,
        dev: &Dataset,
        engine: &dyn QueryEngine,
        sink: &dyn ProgressSink,
    ) -> Result<FitReport> {
        std::fs::create_dir_all(&self.config.save_dir)?;
        let config_path = self.config.save_dir.join("config.json");
        std::fs::write(&config_path, serde_json::to_string_pretty(&self.config)?)?;

        let checkpoint = self.config.save_dir.join("model_best.safetensors");
        let mut opt = AdamW::new(
            self.varmap.all_vars(),
            ParamsAdamW {
                lr: self.config.learning_rate,
                ..Default::default()
            },
        )?;
        let mut rng = SmallRng::seed_from_u64(self.config.seed);
        let beam = self.config.execution_guided.then(|| self.config.beam_config());

        let mut best_epoch = None;
        let mut best_lf = f64::NEG_INFINITY;
        let mut final_dev = Metrics::default();
        let mut final_dev_eg = None;
        for epoch in 0..self.config.epochs {
            let stats = self.train_epoch(train, &mut opt, &mut rng, epoch, sink)?;
            let dev_metrics = self.evaluate(dev, engine, None, None)?;
            let dev_eg = match beam.as_ref() {
                Some(cfg) => Some(self.evaluate(dev, engine, Some(cfg), None)?),
                None => None,
            };
            sink.on_epoch(epoch, &stats, &dev_metrics, dev_eg.as_ref());

            // Best is keyed on the unguided dev logical-form accuracy, so
            // checkpoint selection is independent of the decoding mode.
            if dev_metrics.logical_form_accuracy() > best_lf {
                best_lf = dev_metrics.logical_form_accuracy();
                best_epoch = Some(epoch);
                self.save_checkpoint(&checkpoint)?;
                sink.on_best(epoch, best_lf, &checkpoint);
            }
            final_dev = dev_metrics;
            final_dev_eg = dev_eg;
        }

        Ok(FitReport {
            best_epoch,
            best_logical_form: if best_lf.is_finite() { best_lf } else { 0.0 },
            final_dev,
            final_dev_eg,
            checkpoint,
        })
    }

    /// Write decoder parameters atomically: a crash mid-save never leaves a
    /// torn checkpoint behind.
    fn save_checkpoint(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("safetensors.tmp");
        self.varmap.save(&tmp)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Evaluate on a split. `beam` switches on execution-guided decoding;
    /// `artifacts` receives one jsonl line per example (a prediction record,
    /// or an error record for examples that could not be decoded).
    pub fn evaluate(
        &self,
        data: &Dataset,
        engine: &dyn QueryEngine,
        beam: Option<&BeamConfig>,
        mut artifacts: Option<&mut dyn Write>,
    ) -> Result<Metrics> {
        let batcher = Batcher::new(data.examples.len(), self.config.batch_size);
        let mut metrics = Metrics::default();

        for batch in batcher.iter(&data.examples) {
            let prepared = self.prepare(&batch, data)?;

            let mut decodable: Vec<&Prepared> = Vec::with_capacity(prepared.len());
            for p in &prepared {
                if p.map.kept_tokens() == 0 {
                    metrics.record_skipped();
                    if let Some(w) = artifacts.as_deref_mut() {
                        write_skip(w, p.example, "question truncated to nothing")?;
                    }
                    continue;
                }
                // Gold labels that cannot be built (a value span lost to
                // truncation) make the example unscorable; it stays in the
                // denominator as wrong on every field.
                if let Err(err) = Labels::build(&p.example.gold, &p.map) {
                    metrics.record_skipped();
                    if let Some(w) = artifacts.as_deref_mut() {
                        write_skip(w, p.example, &err.to_string())?;
                    }
                    continue;
                }
                decodable.push(p);
            }
            if decodable.is_empty() {
                continue;
            }

            let inputs: Vec<EncodeInput> = decodable.iter().map(|p| p.encode_input()).collect();
            let encoded = self.encoder.encode(&inputs)?;
            let all_scores = self.decoder.forward_infer(&encoded)?;

            let predictions: Vec<(&Prepared, SqlAnnotation)> = decodable
                .iter()
                .zip(&all_scores)
                .map(|(p, scores)| {
                    let pred = match beam {
                        Some(cfg) => beam_decode(
                            scores,
                            &p.example.question,
                            &p.map,
                            &p.example.table_id,
                            engine,
                            cfg,
                        ),
                        None => decode_example(scores, &p.example.question, &p.map),
                    };
                    let table = data.table(p.example);
                    debug!(sql = %pred.to_sql(&table.id, &table.headers), "decoded");
                    (*p, pred)
                })
                .collect();

            let batch_metrics = predictions
                .par_iter()
                .map(|(p, pred)| {
                    let fields = compare_fields(pred, &p.example.gold);
                    let executed =
                        execution_match(pred, &p.example.gold, &p.example.table_id, engine);
                    let mut m = Metrics::default();
                    m.record(fields, executed);
                    m
                })
                .reduce(Metrics::default, Metrics::merge);
            metrics = metrics.merge(batch_metrics);

            if let Some(w) = artifacts.as_deref_mut() {
                for (p, pred) in &predictions {
                    let record = PredictionRecord {
                        query: RawSql::from(pred),
                        table_id: &p.example.table_id,
                        nlu: &p.example.question.raw,
                    };
                    serde_json::to_writer(&mut *w, &record)?;
                    writeln!(w)?;
                }
            }
        }

        Ok(metrics)
    }
}

fn write_skip(w: &mut dyn Write, example: &Example, error: &str) -> Result<()> {
    let record = SkipRecord {
        error: error.to_string(),
        nlu: &example.question.raw,
        table_id: &example.table_id,
    };
    serde_json::to_writer(&mut *w, &record)?;
    writeln!(w)?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::data::{ColumnKind, Question, Table};
    use crate::encoder::HashEncoder;
    use crate::engine::MemEngine;
    use crate::sql::{AggOp, CellValue, CondOp, Condition, Span};

    fn capitals_table() -> Arc<Table> {
        Arc::new(Table {
            id: "capitals".into(),
            headers: vec!["country".into(), "capital".into()],
            kinds: vec![ColumnKind::Text, ColumnKind::Text],
            rows: vec![
                vec![
                    CellValue::Text("France".into()),
                    CellValue::Text("Paris".into()),
                ],
                vec![
                    CellValue::Text("Japan".into()),
                    CellValue::Text("Tokyo".into()),
                ],
            ],
        })
    }

    fn example(country: &str) -> Example {
        let tokens: Vec<String> = ["what", "is", "the", "capital", "of", country, "?"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Example {
            question: Question {
                raw: format!("What is the capital of {country}?"),
                ref_tokens: tokens,
            },
            table_id: "capitals".into(),
            gold: SqlAnnotation {
                agg: AggOp::None,
                sel: 1,
                conds: vec![Condition {
                    col: 0,
                    op: CondOp::Eq,
                    value: CellValue::Text(country.into()),
                    span: Some(Span::new(5, 5)),
                }],
            },
        }
    }

    fn dataset(n: usize) -> Dataset {
        let table = capitals_table();
        let mut tables = HashMap::new();
        tables.insert(table.id.clone(), table);
        Dataset {
            examples: (0..n)
                .map(|i| example(if i % 2 == 0 { "france" } else { "japan" }))
                .collect(),
            tables,
        }
    }

    fn trainer(config: RunConfig) -> Trainer {
        Trainer::new(config, Box::new(HashEncoder::new(16))).unwrap()
    }

    fn optimizer(t: &Trainer) -> AdamW {
        AdamW::new(
            t.varmap.all_vars(),
            ParamsAdamW {
                lr: t.config.learning_rate,
                ..Default::default()
            },
        )
        .unwrap()
    }

    /// Every parameter by name, sorted, so two independently built trainers
    /// compare like for like.
    fn named_params(t: &Trainer) -> Vec<(String, Vec<f32>)> {
        let data = t.varmap.data().lock().unwrap();
        let mut out: Vec<(String, Vec<f32>)> = data
            .iter()
            .map(|(name, var)| {
                let values = var.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
                (name.clone(), values)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// The var with the lexicographically first name.
    fn tracked_var(t: &Trainer) -> candle_core::Var {
        let data = t.varmap.data().lock().unwrap();
        let name = data.keys().min().unwrap();
        data[name].clone()
    }

    fn first_param(t: &Trainer) -> Vec<f32> {
        tracked_var(t)
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    #[test]
    fn test_accumulation_steps_once_per_window() {
        // 5 batches, window of 2: two full windows plus a leftover flush.
        let mut t = trainer(
            RunConfig::default()
                .with_batch_size(1)
                .with_accumulate_gradients(2),
        );
        let data = dataset(5);
        let mut opt = optimizer(&t);
        let mut rng = SmallRng::seed_from_u64(1);
        let stats = t
            .train_epoch(&data, &mut opt, &mut rng, 0, &TracingSink)
            .unwrap();
        assert_eq!(stats.optimizer_steps, 3);
        assert_eq!(stats.skipped, 0);
        assert!(stats.mean_loss.is_finite());
        assert_eq!(stats.train.n, 5);
        assert_eq!(stats.train.execution, 0);
    }

    /// Records the first decoder parameter at every batch callback, which
    /// fires before that batch's window bookkeeping.
    struct SnapshotSink {
        var: candle_core::Var,
        snaps: std::sync::Mutex<Vec<Vec<f32>>>,
    }

    impl ProgressSink for SnapshotSink {
        fn on_batch(&self, _epoch: usize, _batch: usize, _num_batches: usize, _loss: f32) {
            let snap = self
                .var
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            self.snaps.lock().unwrap().push(snap);
        }
    }

    #[test]
    fn test_parameters_move_exactly_at_window_boundaries() {
        let mut t = trainer(
            RunConfig::default()
                .with_batch_size(1)
                .with_accumulate_gradients(2),
        );
        let data = dataset(4);
        let mut opt = optimizer(&t);
        let mut rng = SmallRng::seed_from_u64(1);
        let sink = SnapshotSink {
            var: tracked_var(&t),
            snaps: std::sync::Mutex::new(Vec::new()),
        };
        let stats = t
            .train_epoch(&data, &mut opt, &mut rng, 0, &sink)
            .unwrap();
        assert_eq!(stats.optimizer_steps, 2);

        let snaps = sink.snaps.into_inner().unwrap();
        assert_eq!(snaps.len(), 4);
        // No step inside the first window, one step at its boundary, none
        // inside the second, and the final boundary after the last batch.
        assert_eq!(snaps[0], snaps[1]);
        assert_ne!(snaps[1], snaps[2]);
        assert_eq!(snaps[2], snaps[3]);
        assert_ne!(snaps[3], first_param(&t));
    }

    #[test]
    fn test_no_update_before_window_boundary() {
        // The window never fills mid-epoch, so parameters move exactly once,
        // at the end-of-epoch flush.
        let mut t = trainer(
            RunConfig::default()
                .with_batch_size(1)
                .with_accumulate_gradients(100),
        );
        let data = dataset(3);
        let mut opt = optimizer(&t);
        let mut rng = SmallRng::seed_from_u64(1);
        let before = first_param(&t);
        let stats = t
            .train_epoch(&data, &mut opt, &mut rng, 0, &TracingSink)
            .unwrap();
        assert_eq!(stats.optimizer_steps, 1);
        assert_ne!(before, first_param(&t));
    }

    #[test]
    fn test_fit_writes_checkpoint_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = trainer(
            RunConfig::default()
                .with_epochs(1)
                .with_batch_size(2)
                .with_save_dir(dir.path()),
        );
        let data = dataset(4);
        let engine = MemEngine::new(data.tables.clone());
        let report = t.fit(&data, &data, &engine, &TracingSink).unwrap();

        assert_eq!(report.best_epoch, Some(0));
        assert!(report.checkpoint.exists());
        assert!(dir.path().join("config.json").exists());
        // No torn temporary left behind.
        assert!(!report.checkpoint.with_extension("safetensors.tmp").exists());
        assert_eq!(report.final_dev.n, 4);

        // The checkpoint round-trips into a fresh trainer.
        let mut t2 = trainer(RunConfig::default().with_save_dir(dir.path()));
        t2.load_checkpoint(&report.checkpoint).unwrap();
        assert_eq!(named_params(&t), named_params(&t2));
    }

    #[test]
    fn test_evaluate_scores_every_example() {
        let t = trainer(RunConfig::default().with_batch_size(3));
        let data = dataset(5);
        let engine = MemEngine::new(data.tables.clone());
        let metrics = t.evaluate(&data, &engine, None, None).unwrap();
        assert_eq!(metrics.n, 5);
        assert_eq!(metrics.skipped, 0);
    }

    #[test]
    fn test_evaluate_writes_artifacts() {
        let t = trainer(RunConfig::default());
        let data = dataset(2);
        let engine = MemEngine::new(data.tables.clone());
        let mut buf = Vec::new();
        let metrics = t
            .evaluate(&data, &engine, Some(&BeamConfig::default()), Some(&mut buf))
            .unwrap();
        assert_eq!(metrics.n, 2);

        let lines: Vec<&str> = std::str::from_utf8(&buf).unwrap().lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(v.get("query").is_some());
            assert_eq!(v["table_id"], "capitals");
            assert!(v["nlu"].as_str().unwrap().starts_with("What is the capital"));
        }
    }

    #[test]
    fn test_evaluate_skips_unresolvable_gold_span() {
        // The gold value sits at token 60, past the encoder budget: the
        // example cannot be scored, counts as wrong in the denominator, and
        // gets an error artifact instead of a prediction record.
        let mut long = example("france");
        let mut tokens: Vec<String> = (0..60).map(|i| format!("tok{i}")).collect();
        tokens.push("france".into());
        long.gold.conds[0].span = Some(Span::new(60, 60));
        long.question.ref_tokens = tokens;

        let mut data = dataset(1);
        data.examples.push(long);

        let t = trainer(RunConfig::default().with_batch_size(2));
        let engine = MemEngine::new(data.tables.clone());
        let mut buf = Vec::new();
        let metrics = t.evaluate(&data, &engine, None, Some(&mut buf)).unwrap();
        assert_eq!(metrics.n, 2);
        assert_eq!(metrics.skipped, 1);

        let lines: Vec<serde_json::Value> = std::str::from_utf8(&buf)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines.iter().filter(|v| v.get("error").is_some()).count(), 1);
        assert_eq!(lines.iter().filter(|v| v.get("query").is_some()).count(), 1);
    }

    #[test]
    fn test_truncated_span_is_dropped_from_updates() {
        // 60 filler tokens push the gold value past the encoder budget.
        let mut long = example("france");
        let mut tokens: Vec<String> = (0..60).map(|i| format!("tok{i}")).collect();
        tokens.push("france".into());
        long.gold.conds[0].span = Some(Span::new(60, 60));
        long.question.ref_tokens = tokens;

        let mut data = dataset(1);
        data.examples.push(long);

        let mut t = trainer(RunConfig::default().with_batch_size(2));
        let mut opt = optimizer(&t);
        let mut rng = SmallRng::seed_from_u64(1);
        let stats = t
            .train_epoch(&data, &mut opt, &mut rng, 0, &TracingSink)
            .unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.optimizer_steps, 1);
    }
}
