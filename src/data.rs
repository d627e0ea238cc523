//! Dataset loading, field extraction, and batching.
//!
//! Examples and tables arrive as jsonl (one record per line). Loading
//! validates everything up front: malformed records and unresolvable table
//! ids are fatal input-format errors, never silent training-time skips.
//! The only per-example recoverable failure in the system is sub-word
//! alignment (see `align`), which is discovered later, per batch.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::info;

use crate::sql::{AggOp, CellValue, CondOp, Condition, SqlAnnotation, Span};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed record at {path}:{line}: {source}")]
    Malformed {
        path: String,
        line: usize,
        source: serde_json::Error,
    },

    #[error("example {index} references unknown table {table_id}")]
    UnknownTable { index: usize, table_id: String },

    #[error("invalid example {index}: {reason}")]
    Invalid { index: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, DataError>;

// ============================================================================
// Core Records
// ============================================================================

/// A natural-language question in its two persistent token streams. The
/// third stream (the encoder's sub-word tokens) is recomputed per batch and
/// never stored here.
#[derive(Debug, Clone)]
pub struct Question {
    /// Original question text.
    pub raw: String,
    /// Reference tokenization (the stream gold value spans index into).
    pub ref_tokens: Vec<String>,
}

/// Column data type, as declared by the table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Real,
}

/// A table: schema here, row data reachable only through the execution
/// engine (which is handed the rows at construction).
#[derive(Debug, Clone)]
pub struct Table {
    pub id: String,
    pub headers: Vec<String>,
    pub kinds: Vec<ColumnKind>,
    pub rows: Vec<Vec<CellValue>>,
}

/// One loaded training/evaluation example.
#[derive(Debug, Clone)]
pub struct Example {
    pub question: Question,
    pub table_id: String,
    pub gold: SqlAnnotation,
}

/// The full dataset for one split, with its table lookup.
pub struct Dataset {
    pub examples: Vec<Example>,
    pub tables: HashMap<String, Arc<Table>>,
}

impl Dataset {
    /// Table for an example. Resolution is guaranteed by [`Dataset::load`],
    /// so a miss here is a programmer error.
    pub fn table(&self, example: &Example) -> &Arc<Table> {
        self.tables
            .get(&example.table_id)
            .unwrap_or_else(|| panic!("table {} vanished after load", example.table_id))
    }

    /// Load examples and tables from jsonl files, validating every record.
    pub fn load(examples_path: &Path, tables_path: &Path) -> Result<Dataset> {
        let tables = load_tables(tables_path)?;

        let raw: Vec<RawExample> = read_jsonl(examples_path)?;
        let mut examples = Vec::with_capacity(raw.len());
        for (index, record) in raw.into_iter().enumerate() {
            let table = tables
                .get(&record.table_id)
                .ok_or_else(|| DataError::UnknownTable {
                    index,
                    table_id: record.table_id.clone(),
                })?;
            examples.push(extract_example(index, record, table)?);
        }

        info!(
            examples = examples.len(),
            tables = tables.len(),
            "dataset loaded"
        );
        Ok(Dataset { examples, tables })
    }
}

// ============================================================================
// Raw Wire Records
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawExample {
    question: String,
    question_tok: Vec<String>,
    table_id: String,
    sql: RawExampleSql,
    /// Gold value spans under the reference tokenization, one `[start, end]`
    /// (inclusive) pair per predicate, in predicate order.
    #[serde(default)]
    wvi_corenlp: Option<Vec<(usize, usize)>>,
}

#[derive(Debug, Deserialize)]
struct RawExampleSql {
    agg: usize,
    sel: usize,
    conds: Vec<(usize, usize, CellValue)>,
}

#[derive(Debug, Deserialize)]
struct RawTable {
    id: String,
    header: Vec<String>,
    types: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<CellValue>>,
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|source| DataError::Io {
        path: display.clone(),
        source,
    })?;
    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| DataError::Io {
            path: display.clone(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| DataError::Malformed {
            path: display.clone(),
            line: i + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

fn load_tables(path: &Path) -> Result<HashMap<String, Arc<Table>>> {
    let raw: Vec<RawTable> = read_jsonl(path)?;
    let mut tables = HashMap::with_capacity(raw.len());
    for (index, t) in raw.into_iter().enumerate() {
        if t.header.len() != t.types.len() {
            return Err(DataError::Invalid {
                index,
                reason: format!(
                    "table {}: {} headers but {} types",
                    t.id,
                    t.header.len(),
                    t.types.len()
                ),
            });
        }
        let kinds = t
            .types
            .iter()
            .map(|s| match s.as_str() {
                "real" => ColumnKind::Real,
                _ => ColumnKind::Text,
            })
            .collect();
        tables.insert(
            t.id.clone(),
            Arc::new(Table {
                id: t.id,
                headers: t.header,
                kinds,
                rows: t.rows,
            }),
        );
    }
    Ok(tables)
}

// ============================================================================
// Field Extraction
// ============================================================================

/// Convert one raw record into a validated [`Example`]. Any inconsistency
/// (out-of-range column, span outside the question, predicate/span count
/// mismatch) is a fatal [`DataError::Invalid`].
fn extract_example(index: usize, raw: RawExample, table: &Arc<Table>) -> Result<Example> {
    let n_tokens = raw.question_tok.len();
    let spans = raw.wvi_corenlp.as_deref().unwrap_or(&[]);
    if !spans.is_empty() && spans.len() != raw.sql.conds.len() {
        return Err(DataError::Invalid {
            index,
            reason: format!(
                "{} predicates but {} value spans",
                raw.sql.conds.len(),
                spans.len()
            ),
        });
    }

    let agg = AggOp::from_index(raw.sql.agg).ok_or_else(|| DataError::Invalid {
        index,
        reason: format!("aggregation id {} out of range", raw.sql.agg),
    })?;

    let mut conds = Vec::with_capacity(raw.sql.conds.len());
    for (slot, (col, op, value)) in raw.sql.conds.into_iter().enumerate() {
        let op = CondOp::from_index(op).ok_or_else(|| DataError::Invalid {
            index,
            reason: format!("operator id {op} out of range"),
        })?;
        let span = match spans.get(slot) {
            Some(&(start, end)) => {
                if end < start || end >= n_tokens {
                    return Err(DataError::Invalid {
                        index,
                        reason: format!(
                            "value span [{start}, {end}] outside question of {n_tokens} tokens"
                        ),
                    });
                }
                Some(Span::new(start, end))
            }
            None => None,
        };
        conds.push(Condition {
            col,
            op,
            value,
            span,
        });
    }

    let gold = SqlAnnotation::try_new(agg, raw.sql.sel, conds, table.headers.len())
        .map_err(|reason| DataError::Invalid { index, reason })?;

    Ok(Example {
        question: Question {
            raw: raw.question,
            ref_tokens: raw.question_tok,
        },
        table_id: raw.table_id,
        gold,
    })
}

// ============================================================================
// Batching
// ============================================================================

/// Index-based batcher. Ordering state lives here; the RNG is owned by the
/// caller and passed in explicitly so runs are reproducible from one seed.
pub struct Batcher {
    order: Vec<usize>,
    batch_size: usize,
}

impl Batcher {
    pub fn new(n_examples: usize, batch_size: usize) -> Batcher {
        assert!(batch_size > 0, "batch_size must be positive");
        Batcher {
            order: (0..n_examples).collect(),
            batch_size,
        }
    }

    /// Reshuffle the iteration order in place.
    pub fn shuffle(&mut self, rng: &mut SmallRng) {
        self.order.shuffle(rng);
    }

    /// Iterate batches of example references in the current order. The last
    /// batch may be short.
    pub fn iter<'a>(&'a self, examples: &'a [Example]) -> impl Iterator<Item = Vec<&'a Example>> {
        self.order
            .chunks(self.batch_size)
            .map(move |chunk| chunk.iter().map(|&i| &examples[i]).collect())
    }

    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

// ============================================================================
// Tests
// ============================================================================
