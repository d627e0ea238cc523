//! Sentence encoder adapter.
//!
//! The core never touches transformer internals: it sees the
//! [`SentenceEncoder`] trait, which turns sub-word token sequences for a
//! question and its table headers into per-token and per-header embedding
//! vectors. The shipped implementation is a BERT encoder on candle, loaded
//! from the HuggingFace hub.

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use hf_hub::{api::sync::Api, Repo, RepoType};
use thiserror::Error;
use tokenizers::Tokenizer;
use tracing::info;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("failed to initialize encoder: {0}")]
    Init(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("sequence of {actual} sub-word tokens exceeds the maximum {max}")]
    SequenceTooLong { actual: usize, max: usize },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("HF hub error: {0}")]
    HfHub(#[from] hf_hub::api::sync::ApiError),
}

pub type Result<T> = std::result::Result<T, EncoderError>;

// ============================================================================
// Encoder Interface
// ============================================================================

/// One example's input to [`SentenceEncoder::encode`]: sub-word pieces per
/// question reference token (already truncated to the alignment's kept
/// prefix) and sub-word pieces per header.
pub struct EncodeInput<'a> {
    pub question_pieces: &'a [Vec<String>],
    pub header_pieces: &'a [Vec<String>],
}

/// Per-example encoder output. Lengths are implicit in the vector shapes:
/// `question.len()` is the valid question sub-word count, `headers.len()`
/// the header count.
#[derive(Debug, Clone)]
pub struct EncodedExample {
    /// One embedding per question sub-word token.
    pub question: Vec<Vec<f32>>,
    /// One pooled embedding per header.
    pub headers: Vec<Vec<f32>>,
}

/// Contract with the external sentence encoder. Pure with respect to the
/// core: no state persists across calls beyond the encoder's own weights.
pub trait SentenceEncoder {
    /// Width of the returned embedding vectors.
    fn hidden_dim(&self) -> usize;

    /// Total sub-word budget for one assembled sequence (question + headers
    /// + separators).
    fn max_seq_len(&self) -> usize;

    /// Sub-word pieces for each input token, in order. The flattened piece
    /// sequence is exactly what [`encode`](Self::encode) will embed.
    fn subword_split(&self, tokens: &[String]) -> Result<Vec<Vec<String>>>;

    /// Encode a batch of examples in one call.
    fn encode(&self, batch: &[EncodeInput]) -> Result<Vec<EncodedExample>>;
}

// ============================================================================
// BERT Encoder Configuration
// ============================================================================

pub const DEFAULT_ENCODER_REPO: &str = "bert-base-uncased";

/// Default total sequence budget, sized for question plus headers.
pub const DEFAULT_MAX_SEQ_LEN: usize = 222;

#[derive(Debug, Clone)]
pub struct BertEncoderConfig {
    /// Model repository on HuggingFace.
    pub model_repo: String,
    /// Model revision (branch, tag, or commit).
    pub model_revision: String,
    /// CUDA device ordinal; falls back to CPU when unavailable.
    pub cuda_device: usize,
    /// Total sub-word budget per assembled sequence.
    pub max_seq_len: usize,
    /// How many final internal layers to aggregate per token.
    pub num_output_layers: usize,
}

impl Default for BertEncoderConfig {
    fn default() -> Self {
        Self {
            model_repo: DEFAULT_ENCODER_REPO.to_string(),
            model_revision: "main".to_string(),
            cuda_device: 0,
            max_seq_len: DEFAULT_MAX_SEQ_LEN,
            num_output_layers: 1,
        }
    }
}

impl BertEncoderConfig {
    pub fn with_model(mut self, model_repo: &str) -> Self {
        self.model_repo = model_repo.to_string();
        self
    }

    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = max_seq_len;
        self
    }

    pub fn with_cuda_device(mut self, device: usize) -> Self {
        self.cuda_device = device;
        self
    }
}

// ============================================================================
// BERT Encoder
// ============================================================================

/// BERT sentence encoder on candle.
///
/// Assembles `[CLS] question [SEP] header1 [SEP] header2 [SEP] …` with
/// question tokens in segment 0 and headers in segment 1, runs one forward
/// per batch, and slices out per-question-token vectors and mean-pooled
/// per-header vectors.
pub struct BertEncoder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    hidden_dim: usize,
    config: BertEncoderConfig,
    cls_id: u32,
    sep_id: u32,
    unk_id: u32,
}

impl BertEncoder {
    /// Load the encoder from the HuggingFace hub.
    pub fn load(config: BertEncoderConfig) -> Result<Self> {
        // candle's BertModel exposes only the final hidden state, so layer
        // aggregation beyond the last layer is not available here. The trait
        // keeps the knob for encoders that can honor it.
        if config.num_output_layers != 1 {
            return Err(EncoderError::Init(format!(
                "BertEncoder supports num_output_layers = 1, got {}",
                config.num_output_layers
            )));
        }

        info!("Loading encoder from: {}", config.model_repo);
        let device = Device::cuda_if_available(config.cuda_device)?;
        info!("Encoder device: {:?}", device);

        let api = Api::new()?;
        let repo = api.repo(Repo::with_revision(
            config.model_repo.clone(),
            RepoType::Model,
            config.model_revision.clone(),
        ));

        let tokenizer_path = repo.get("tokenizer.json")?;
        let config_path = repo.get("config.json")?;
        let weights_path = repo.get("model.safetensors").or_else(|_| {
            info!("model.safetensors not found, trying pytorch_model.bin...");
            repo.get("pytorch_model.bin")
        })?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EncoderError::Init(format!("failed to load tokenizer: {e}")))?;

        let config_str = std::fs::read_to_string(&config_path)
            .map_err(|e| EncoderError::Init(format!("failed to read config: {e}")))?;
        let model_config: BertConfig = serde_json::from_str(&config_str)
            .map_err(|e| EncoderError::Init(format!("failed to parse config: {e}")))?;
        let hidden_dim = model_config.hidden_size;

        let vb = if weights_path
            .extension()
            .map(|e| e == "safetensors")
            .unwrap_or(false)
        {
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DTYPE, &device)? }
        } else {
            VarBuilder::from_pth(&weights_path, DTYPE, &device)?
        };
        let model = BertModel::load(vb, &model_config)?;

        let special = |tok: &str| {
            tokenizer
                .token_to_id(tok)
                .ok_or_else(|| EncoderError::Init(format!("vocabulary is missing {tok}")))
        };
        let cls_id = special("[CLS]")?;
        let sep_id = special("[SEP]")?;
        let unk_id = special("[UNK]")?;

        info!("Encoder loaded, hidden_dim = {hidden_dim}");
        Ok(Self {
            model,
            tokenizer,
            device,
            hidden_dim,
            config,
            cls_id,
            sep_id,
            unk_id,
        })
    }

    fn piece_id(&self, piece: &str) -> u32 {
        self.tokenizer.token_to_id(piece).unwrap_or(self.unk_id)
    }

    /// Assemble ids and segment ids for one example. Returns the question
    /// sub-word positions and per-header position ranges alongside.
    #[allow(clippy::type_complexity)]
    fn assemble(
        &self,
        input: &EncodeInput,
    ) -> Result<(Vec<u32>, Vec<u32>, (usize, usize), Vec<(usize, usize)>)> {
        let mut ids = vec![self.cls_id];
        let mut segments = vec![0u32];

        let q_start = ids.len();
        for pieces in input.question_pieces {
            for p in pieces {
                ids.push(self.piece_id(p));
                segments.push(0);
            }
        }
        let q_end = ids.len();
        ids.push(self.sep_id);
        segments.push(0);

        let mut header_ranges = Vec::with_capacity(input.header_pieces.len());
        for pieces in input.header_pieces {
            let start = ids.len();
            for p in pieces {
                ids.push(self.piece_id(p));
                segments.push(1);
            }
            header_ranges.push((start, ids.len()));
            ids.push(self.sep_id);
            segments.push(1);
        }

        if ids.len() > self.config.max_seq_len {
            return Err(EncoderError::SequenceTooLong {
                actual: ids.len(),
                max: self.config.max_seq_len,
            });
        }
        Ok((ids, segments, (q_start, q_end), header_ranges))
    }
}

impl SentenceEncoder for BertEncoder {
    fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    fn subword_split(&self, tokens: &[String]) -> Result<Vec<Vec<String>>> {
        tokens
            .iter()
            .map(|tok| {
                let enc = self
                    .tokenizer
                    .encode(tok.as_str(), false)
                    .map_err(|e| EncoderError::Tokenize(e.to_string()))?;
                Ok(enc.get_tokens().to_vec())
            })
            .collect()
    }

    fn encode(&self, batch: &[EncodeInput]) -> Result<Vec<EncodedExample>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut assembled = Vec::with_capacity(batch.len());
        let mut max_len = 0;
        for input in batch {
            let a = self.assemble(input)?;
            max_len = max_len.max(a.0.len());
            assembled.push(a);
        }

        // Pad to the batch maximum and run one forward for the whole batch.
        let b = batch.len();
        let mut ids = vec![0u32; b * max_len];
        let mut segs = vec![0u32; b * max_len];
        let mut mask = vec![0u32; b * max_len];
        for (i, (seq_ids, seq_segs, _, _)) in assembled.iter().enumerate() {
            for (j, (&id, &seg)) in seq_ids.iter().zip(seq_segs.iter()).enumerate() {
                ids[i * max_len + j] = id;
                segs[i * max_len + j] = seg;
                mask[i * max_len + j] = 1;
            }
        }
        let ids = Tensor::from_vec(ids, (b, max_len), &self.device)?;
        let segs = Tensor::from_vec(segs, (b, max_len), &self.device)?;
        let mask = Tensor::from_vec(mask, (b, max_len), &self.device)?;

        let hidden = self
            .model
            .forward(&ids, &segs, Some(&mask))?
            .to_dtype(DType::F32)?;

        let mut out = Vec::with_capacity(b);
        for (i, (_, _, (q_start, q_end), header_ranges)) in assembled.iter().enumerate() {
            let seq = hidden.i(i)?; // [max_len, hidden]
            let question = seq.i(*q_start..*q_end)?.to_vec2::<f32>()?;
            let mut headers = Vec::with_capacity(header_ranges.len());
            for &(start, end) in header_ranges {
                // Headers with no sub-word pieces would make an empty pool;
                // the tokenizer always emits at least [UNK] per token.
                let pooled = seq.i(start..end)?.mean(0)?.to_vec1::<f32>()?;
                headers.push(pooled);
            }
            out.push(EncodedExample { question, headers });
        }
        Ok(out)
    }
}

// ============================================================================
// Deterministic Test Encoder
// ============================================================================

/// Deterministic, dependency-free encoder for tests: embeds each sub-word
/// as a fixed function of its bytes. Pieces are the tokens themselves
/// (whole-word "sub-words").
#[cfg(test)]
pub struct HashEncoder {
    pub dim: usize,
    pub max_seq_len: usize,
}

#[cfg(test)]
impl HashEncoder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            max_seq_len: 64,
        }
    }

    fn embed(&self, piece: &str) -> Vec<f32> {
        use std::hash::{Hash, Hasher};
        (0..self.dim)
            .map(|k| {
                let mut h = std::collections::hash_map::DefaultHasher::new();
                piece.hash(&mut h);
                k.hash(&mut h);
                // Map the hash into [-1, 1).
                (h.finish() % 2000) as f32 / 1000.0 - 1.0
            })
            .collect()
    }
}

#[cfg(test)]
impl SentenceEncoder for HashEncoder {
    fn hidden_dim(&self) -> usize {
        self.dim
    }

    fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    fn subword_split(&self, tokens: &[String]) -> Result<Vec<Vec<String>>> {
        Ok(tokens.iter().map(|t| vec![t.clone()]).collect())
    }

    fn encode(&self, batch: &[EncodeInput]) -> Result<Vec<EncodedExample>> {
        Ok(batch
            .iter()
            .map(|input| EncodedExample {
                question: input
                    .question_pieces
                    .iter()
                    .flat_map(|pieces| pieces.iter().map(|p| self.embed(p)))
                    .collect(),
                headers: input
                    .header_pieces
                    .iter()
                    .map(|pieces| {
                        let mut acc = vec![0.0; self.dim];
                        for p in pieces {
                            for (a, v) in acc.iter_mut().zip(self.embed(p)) {
                                *a += v / pieces.len() as f32;
                            }
                        }
                        acc
                    })
                    .collect(),
            })
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
