//! Structured decoder: score heads over encoder outputs, in two modes.
//!
//! Teacher-forced training (`forward_train` with [`CondForcing`]) computes
//! predicate-operator and value-span scores only for the ground-truth
//! predicate columns, so downstream heads are neither marginalized over nor
//! exposed to upstream mistakes. Free inference (`forward_infer`) scores
//! every field over every header and hands detached `f32` distributions to
//! the decoding and beam-search layers.
//!
//! The network itself is deliberately small (projections plus linear heads);
//! the interesting behavior lives in the decoding and training loops around
//! it, not in the layer shapes.

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};
use thiserror::Error;

use crate::encoder::EncodedExample;
use crate::labels::Labels;
use crate::sql::{MAX_CONDS, N_AGG_OPS, N_COND_OPS};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

// ============================================================================
// Score Containers
// ============================================================================

/// Detached per-example score distributions for free inference. Rows of
/// `cond_op` / `span_start` / `span_end` are indexed by header, so decoding
/// can condition on whichever columns it selects.
#[derive(Debug, Clone)]
pub struct FieldScores {
    pub agg: Vec<f32>,             // [N_AGG_OPS]
    pub sel: Vec<f32>,             // [n_headers]
    pub cond_count: Vec<f32>,      // [MAX_CONDS + 1]
    pub cond_col: Vec<f32>,        // [n_headers]
    pub cond_op: Vec<Vec<f32>>,    // [n_headers][N_COND_OPS]
    pub span_start: Vec<Vec<f32>>, // [n_headers][n_question_subwords]
    pub span_end: Vec<Vec<f32>>,   // [n_headers][n_question_subwords]
}

impl FieldScores {
    pub fn n_headers(&self) -> usize {
        self.sel.len()
    }

    pub fn n_question_tokens(&self) -> usize {
        self.span_start.first().map_or(0, Vec::len)
    }
}

/// Per-example score tensors with the autodiff graph attached. Under
/// forcing, `cond_op` / `span_*` have one row per ground-truth predicate;
/// otherwise one row per header.
pub struct TrainScores {
    pub agg: Tensor,        // [N_AGG_OPS]
    pub sel: Tensor,        // [n_headers]
    pub cond_count: Tensor, // [MAX_CONDS + 1]
    pub cond_col: Tensor,   // [n_headers]
    pub cond_op: Tensor,    // [k, N_COND_OPS]
    pub span_start: Tensor, // [k, n_question_subwords]
    pub span_end: Tensor,   // [k, n_question_subwords]
}

/// Ground-truth upstream choices for the constrained training mode: the
/// predicate columns the operator and span heads are evaluated on.
#[derive(Debug, Clone)]
pub struct CondForcing {
    pub cond_cols: Vec<usize>,
}

// ============================================================================
// Decoder Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SqlDecoderConfig {
    /// Width of the encoder's embedding vectors.
    pub input_dim: usize,
    /// Internal projection width.
    pub proj_dim: usize,
}

impl SqlDecoderConfig {
    pub fn new(input_dim: usize) -> Self {
        Self {
            input_dim,
            proj_dim: 100,
        }
    }

    pub fn with_proj_dim(mut self, proj_dim: usize) -> Self {
        self.proj_dim = proj_dim;
        self
    }
}

// ============================================================================
// Decoder
// ============================================================================

pub struct SqlDecoder {
    q_proj: Linear,
    h_proj: Linear,
    agg_head: Linear,   // proj -> N_AGG_OPS, from the pooled question
    count_head: Linear, // proj -> MAX_CONDS + 1, from the pooled question
    sel_head: Linear,   // proj -> 1, per header fused with the question
    col_head: Linear,   // proj -> 1, per header fused with the question
    op_head: Linear,    // 2*proj -> N_COND_OPS, per header
    start_head: Linear, // proj -> 1, per (header, token)
    end_head: Linear,   // proj -> 1, per (header, token)
    device: Device,
}

impl SqlDecoder {
    pub fn new(cfg: &SqlDecoderConfig, vb: VarBuilder, device: &Device) -> Result<Self> {
        let p = cfg.proj_dim;
        Ok(Self {
            q_proj: linear(cfg.input_dim, p, vb.pp("q_proj"))?,
            h_proj: linear(cfg.input_dim, p, vb.pp("h_proj"))?,
            agg_head: linear(p, N_AGG_OPS, vb.pp("agg_head"))?,
            count_head: linear(p, MAX_CONDS + 1, vb.pp("count_head"))?,
            sel_head: linear(p, 1, vb.pp("sel_head"))?,
            col_head: linear(p, 1, vb.pp("col_head"))?,
            op_head: linear(2 * p, N_COND_OPS, vb.pp("op_head"))?,
            start_head: linear(p, 1, vb.pp("start_head"))?,
            end_head: linear(p, 1, vb.pp("end_head"))?,
            device: device.clone(),
        })
    }

    /// Forward pass for one batch. `forcing`, when present, must be parallel
    /// to `batch`; its ground-truth predicate columns select which rows of
    /// the operator and span heads are computed.
    ///
    /// # Panics
    /// Panics if `forcing` is present with a length different from `batch`
    /// (contract violation).
    pub fn forward_train(
        &self,
        batch: &[EncodedExample],
        forcing: Option<&[CondForcing]>,
    ) -> Result<Vec<TrainScores>> {
        if let Some(f) = forcing {
            assert_eq!(
                f.len(),
                batch.len(),
                "forcing length {} != batch length {}",
                f.len(),
                batch.len()
            );
        }
        batch
            .iter()
            .enumerate()
            .map(|(i, ex)| self.forward_one(ex, forcing.map(|f| &f[i])))
            .collect()
    }

    /// Free inference: score every field over every header, detached.
    pub fn forward_infer(&self, batch: &[EncodedExample]) -> Result<Vec<FieldScores>> {
        self.forward_train(batch, None)?
            .iter()
            .map(|s| self.detach(s))
            .collect()
    }

    fn forward_one(
        &self,
        ex: &EncodedExample,
        forcing: Option<&CondForcing>,
    ) -> Result<TrainScores> {
        let n_tok = ex.question.len();
        let n_hdr = ex.headers.len();
        assert!(n_tok > 0, "example has no question tokens");
        assert!(n_hdr > 0, "example has no headers");
        let dim = ex.question[0].len();

        let q = Tensor::from_vec(
            ex.question.iter().flatten().copied().collect::<Vec<f32>>(),
            (n_tok, dim),
            &self.device,
        )?;
        let h = Tensor::from_vec(
            ex.headers.iter().flatten().copied().collect::<Vec<f32>>(),
            (n_hdr, dim),
            &self.device,
        )?;

        let qp = self.q_proj.forward(&q)?.tanh()?; // [n_tok, p]
        let hp = self.h_proj.forward(&h)?.tanh()?; // [n_hdr, p]
        let q_pool = qp.mean(0)?; // [p]

        // Question-level heads.
        let agg = self.agg_head.forward(&q_pool.unsqueeze(0)?)?.squeeze(0)?;
        let cond_count = self.count_head.forward(&q_pool.unsqueeze(0)?)?.squeeze(0)?;

        // Per-header heads fused with the pooled question.
        let fused = hp.broadcast_add(&q_pool.unsqueeze(0)?)?.tanh()?; // [n_hdr, p]
        let sel = self.sel_head.forward(&fused)?.squeeze(1)?; // [n_hdr]
        let cond_col = self.col_head.forward(&fused)?.squeeze(1)?; // [n_hdr]

        // Header rows the conditioned heads run on: ground truth when
        // forcing, every header otherwise.
        let hp_rows = match forcing {
            Some(f) => {
                let idx: Vec<u32> = f.cond_cols.iter().map(|&c| c as u32).collect();
                let idx = Tensor::from_vec(idx, (f.cond_cols.len(),), &self.device)?;
                hp.index_select(&idx, 0)?
            }
            None => hp.clone(),
        };
        let k = hp_rows.dims()[0];

        let (cond_op, span_start, span_end) = if k == 0 {
            // No predicates under forcing: emit empty score rows.
            (
                Tensor::zeros((0, N_COND_OPS), DType::F32, &self.device)?,
                Tensor::zeros((0, n_tok), DType::F32, &self.device)?,
                Tensor::zeros((0, n_tok), DType::F32, &self.device)?,
            )
        } else {
            let q_rep = q_pool.unsqueeze(0)?.expand((k, q_pool.dims()[0]))?;
            let op_in = Tensor::cat(&[&hp_rows, &q_rep], 1)?; // [k, 2p]
            let cond_op = self.op_head.forward(&op_in)?; // [k, N_COND_OPS]

            // Per (header-row, token) grid for span pointing.
            let grid = qp
                .unsqueeze(0)?
                .broadcast_add(&hp_rows.unsqueeze(1)?)?
                .tanh()?; // [k, n_tok, p]
            let span_start = self.start_head.forward(&grid)?.squeeze(2)?; // [k, n_tok]
            let span_end = self.end_head.forward(&grid)?.squeeze(2)?;
            (cond_op, span_start, span_end)
        };

        Ok(TrainScores {
            agg,
            sel,
            cond_count,
            cond_col,
            cond_op,
            span_start,
            span_end,
        })
    }

    fn detach(&self, s: &TrainScores) -> Result<FieldScores> {
        Ok(FieldScores {
            agg: s.agg.detach().to_vec1()?,
            sel: s.sel.detach().to_vec1()?,
            cond_count: s.cond_count.detach().to_vec1()?,
            cond_col: s.cond_col.detach().to_vec1()?,
            cond_op: s.cond_op.detach().to_vec2()?,
            span_start: s.span_start.detach().to_vec2()?,
            span_end: s.span_end.detach().to_vec2()?,
        })
    }

    // ========================================================================
    // Loss
    // ========================================================================

    /// Summed per-field cross-entropy, averaged over the batch. Predicate
    /// columns use multi-label binary cross-entropy over the header set.
    ///
    /// # Panics
    /// Panics on any shape mismatch between scores and labels (programmer
    /// error, never a data anomaly).
    pub fn loss(&self, scores: &[TrainScores], labels: &[Labels]) -> Result<Tensor> {
        assert_eq!(
            scores.len(),
            labels.len(),
            "scores length {} != labels length {}",
            scores.len(),
            labels.len()
        );
        assert!(!scores.is_empty(), "empty batch has no loss");

        let mut total = Tensor::zeros((), DType::F32, &self.device)?;
        for (s, l) in scores.iter().zip(labels) {
            total = (total + self.example_loss(s, l)?)?;
        }
        Ok((total / scores.len() as f64)?)
    }

    fn example_loss(&self, s: &TrainScores, l: &Labels) -> Result<Tensor> {
        let n_hdr = s.sel.dims()[0];
        assert!(l.sel < n_hdr, "sel label {} out of range {n_hdr}", l.sel);

        let mut loss = self.ce(&s.agg, l.agg)?;
        loss = (loss + self.ce(&s.sel, l.sel)?)?;
        loss = (loss + self.ce(&s.cond_count, l.cond_count)?)?;

        // Multi-hot predicate-column target over all headers.
        let mut hot = vec![0f32; n_hdr];
        for &c in &l.cond_cols {
            assert!(c < n_hdr, "predicate column {c} out of range {n_hdr}");
            hot[c] = 1.0;
        }
        let hot = Tensor::from_vec(hot, (n_hdr,), &self.device)?;
        loss = (loss + candle_nn::loss::binary_cross_entropy_with_logit(&s.cond_col, &hot)?)?;

        if !l.cond_cols.is_empty() {
            // Rows are per predicate under forcing; otherwise select the
            // ground-truth columns' rows out of the per-header grid.
            let rows = |t: &Tensor| -> Result<Tensor> {
                if t.dims()[0] == l.cond_cols.len() {
                    Ok(t.clone())
                } else {
                    let idx: Vec<u32> = l.cond_cols.iter().map(|&c| c as u32).collect();
                    let idx = Tensor::from_vec(idx, (l.cond_cols.len(),), &self.device)?;
                    Ok(t.index_select(&idx, 0)?)
                }
            };
            let ops = rows(&s.cond_op)?;
            let starts = rows(&s.span_start)?;
            let ends = rows(&s.span_end)?;

            let op_t = self.targets(&l.cond_ops)?;
            let st_t = self.targets(&l.spans.iter().map(|&(a, _)| a).collect::<Vec<_>>())?;
            let en_t = self.targets(&l.spans.iter().map(|&(_, b)| b).collect::<Vec<_>>())?;
            loss = (loss + candle_nn::loss::cross_entropy(&ops, &op_t)?)?;
            loss = (loss + candle_nn::loss::cross_entropy(&starts, &st_t)?)?;
            loss = (loss + candle_nn::loss::cross_entropy(&ends, &en_t)?)?;
        }
        Ok(loss)
    }

    fn ce(&self, logits: &Tensor, target: usize) -> Result<Tensor> {
        let target = Tensor::from_vec(vec![target as u32], (1,), &self.device)?;
        Ok(candle_nn::loss::cross_entropy(
            &logits.unsqueeze(0)?,
            &target,
        )?)
    }

    fn targets(&self, values: &[usize]) -> Result<Tensor> {
        let v: Vec<u32> = values.iter().map(|&x| x as u32).collect();
        Ok(Tensor::from_vec(v, (values.len(),), &self.device)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
