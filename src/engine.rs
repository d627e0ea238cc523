//! Query execution over in-memory tables.
//!
//! The engine is the ground truth behind execution-guided decoding and
//! execution accuracy: a candidate query is run against the real table and
//! judged by what comes back. Execution failures are values here, not
//! panics, because the beam search treats them as pruning signals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use tracing::warn;

use crate::data::Table;
use crate::sql::{AggOp, CellValue, CondOp, SqlAnnotation};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("unknown table {0}")]
    UnknownTable(String),

    #[error("column {col} out of range ({n_headers} headers)")]
    ColumnOutOfRange { col: usize, n_headers: usize },

    #[error("operator OP is a placeholder and cannot execute")]
    UnsupportedOperator,

    #[error("non-numeric value in a numeric comparison: {value}")]
    TypeMismatch { value: String },

    #[error("query exceeded the execution deadline of {0:?}")]
    Timeout(Duration),

    #[error("execution worker is gone")]
    WorkerGone,
}

pub type Result<T> = std::result::Result<T, ExecError>;

// ============================================================================
// Engine Trait
// ============================================================================

/// Executes a structured query against a named table, returning the result
/// column as a flat list of cells (one per matching row, or a single
/// aggregate cell).
pub trait QueryEngine: Send + Sync {
    fn execute(&self, table_id: &str, query: &SqlAnnotation) -> Result<Vec<CellValue>>;
}

// ============================================================================
// In-Memory Engine
// ============================================================================

/// Direct execution over the loaded table map.
pub struct MemEngine {
    tables: HashMap<String, Arc<Table>>,
}

impl MemEngine {
    pub fn new(tables: HashMap<String, Arc<Table>>) -> MemEngine {
        MemEngine { tables }
    }
}

impl QueryEngine for MemEngine {
    fn execute(&self, table_id: &str, query: &SqlAnnotation) -> Result<Vec<CellValue>> {
        let table = self
            .tables
            .get(table_id)
            .ok_or_else(|| ExecError::UnknownTable(table_id.to_string()))?;

        let n_headers = table.headers.len();
        let check_col = |col: usize| {
            if col < n_headers {
                Ok(())
            } else {
                Err(ExecError::ColumnOutOfRange { col, n_headers })
            }
        };
        check_col(query.sel)?;
        for cond in &query.conds {
            check_col(cond.col)?;
            if cond.op == CondOp::Op {
                return Err(ExecError::UnsupportedOperator);
            }
        }

        let mut selected = Vec::new();
        'rows: for row in &table.rows {
            for cond in &query.conds {
                if !row_matches(&row[cond.col], cond.op, &cond.value)? {
                    continue 'rows;
                }
            }
            selected.push(row[query.sel].clone());
        }

        Ok(aggregate(query.agg, selected))
    }
}

/// Whether one cell satisfies `cell op value`.
///
/// Equality goes through [`CellValue`]'s coercing comparison. Ordering
/// comparisons are numeric only: a predicate value that does not parse as a
/// number is an execution error, while a non-numeric cell simply fails to
/// match (mirroring a NULL comparison).
fn row_matches(cell: &CellValue, op: CondOp, value: &CellValue) -> Result<bool> {
    match op {
        CondOp::Eq => Ok(cell == value),
        CondOp::Gt | CondOp::Lt => {
            let rhs = value.as_number().ok_or_else(|| ExecError::TypeMismatch {
                value: value.as_text(),
            })?;
            let Some(lhs) = cell.as_number() else {
                return Ok(false);
            };
            Ok(if op == CondOp::Gt { lhs > rhs } else { lhs < rhs })
        }
        CondOp::Op => Err(ExecError::UnsupportedOperator),
    }
}

/// Aggregate the selected cells. Numeric aggregates ignore non-numeric
/// cells; an aggregate over nothing yields an empty result (SQL NULL),
/// except COUNT which is always defined.
fn aggregate(agg: AggOp, selected: Vec<CellValue>) -> Vec<CellValue> {
    let numeric = || -> Vec<f64> { selected.iter().filter_map(CellValue::as_number).collect() };
    match agg {
        AggOp::None => selected,
        AggOp::Count => vec![CellValue::Number(selected.len() as f64)],
        AggOp::Max => numeric()
            .into_iter()
            .max_by(f64::total_cmp)
            .map(CellValue::Number)
            .into_iter()
            .collect(),
        AggOp::Min => numeric()
            .into_iter()
            .min_by(f64::total_cmp)
            .map(CellValue::Number)
            .into_iter()
            .collect(),
        AggOp::Sum => {
            let ns = numeric();
            if ns.is_empty() {
                vec![]
            } else {
                vec![CellValue::Number(ns.iter().sum())]
            }
        }
        AggOp::Avg => {
            let ns = numeric();
            if ns.is_empty() {
                vec![]
            } else {
                vec![CellValue::Number(ns.iter().sum::<f64>() / ns.len() as f64)]
            }
        }
    }
}

// ============================================================================
// Result Comparison
// ============================================================================

/// Multiset equality of two execution results. Row order is not part of a
/// result's meaning, so both sides are sorted under a total order before the
/// element-wise coercing comparison.
pub fn results_equal(a: &[CellValue], b: &[CellValue]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let sorted = |xs: &[CellValue]| {
        let mut v = xs.to_vec();
        v.sort_by(cell_order);
        v
    };
    sorted(a).iter().zip(sorted(b).iter()).all(|(x, y)| x == y)
}

fn cell_order(a: &CellValue, b: &CellValue) -> std::cmp::Ordering {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => crate::sql::normalize_value(&a.as_text())
            .cmp(&crate::sql::normalize_value(&b.as_text())),
    }
}

// ============================================================================
// Bounded Engine
// ============================================================================

struct ExecRequest {
    table_id: String,
    query: SqlAnnotation,
    reply: Sender<Result<Vec<CellValue>>>,
}

/// Wraps an engine in a dedicated worker thread and enforces a per-query
/// deadline. A query that outlives the deadline returns [`ExecError::Timeout`];
/// the worker finishes it in the background and its late reply is discarded.
pub struct BoundedEngine {
    requests: Option<Sender<ExecRequest>>,
    handle: Option<std::thread::JoinHandle<()>>,
    deadline: Duration,
}

impl BoundedEngine {
    pub fn new<E>(inner: E, deadline: Duration) -> BoundedEngine
    where
        E: QueryEngine + 'static,
    {
        let (tx, rx) = channel::unbounded::<ExecRequest>();
        let handle = std::thread::Builder::new()
            .name("exec-engine".into())
            .spawn(move || {
                for req in rx.iter() {
                    let result = inner.execute(&req.table_id, &req.query);
                    // Receiver may have timed out and gone away.
                    let _ = req.reply.send(result);
                }
            })
            .expect("failed to spawn execution worker");
        BoundedEngine {
            requests: Some(tx),
            handle: Some(handle),
            deadline,
        }
    }
}

impl QueryEngine for BoundedEngine {
    fn execute(&self, table_id: &str, query: &SqlAnnotation) -> Result<Vec<CellValue>> {
        let requests = self.requests.as_ref().ok_or(ExecError::WorkerGone)?;
        let (reply_tx, reply_rx) = channel::bounded(1);
        requests
            .send(ExecRequest {
                table_id: table_id.to_string(),
                query: query.clone(),
                reply: reply_tx,
            })
            .map_err(|_| ExecError::WorkerGone)?;
        match reply_rx.recv_timeout(self.deadline) {
            Ok(result) => result,
            Err(channel::RecvTimeoutError::Timeout) => {
                warn!(table_id, deadline = ?self.deadline, "query timed out");
                Err(ExecError::Timeout(self.deadline))
            }
            Err(channel::RecvTimeoutError::Disconnected) => Err(ExecError::WorkerGone),
        }
    }
}

impl Drop for BoundedEngine {
    fn drop(&mut self) {
        // Closing the request channel ends the worker's iteration.
        self.requests.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ColumnKind;
    use crate::sql::Condition;

    fn capitals() -> MemEngine {
        let table = Table {
            id: "capitals".into(),
            headers: vec!["country".into(), "capital".into(), "population".into()],
            kinds: vec![ColumnKind::Text, ColumnKind::Text, ColumnKind::Real],
            rows: vec![
                vec![
                    CellValue::Text("France".into()),
                    CellValue::Text("Paris".into()),
                    CellValue::Number(67.0),
                ],
                vec![
                    CellValue::Text("Japan".into()),
                    CellValue::Text("Tokyo".into()),
                    CellValue::Number(125.0),
                ],
                vec![
                    CellValue::Text("Iceland".into()),
                    CellValue::Text("Reykjavik".into()),
                    CellValue::Number(0.4),
                ],
            ],
        };
        let mut tables = HashMap::new();
        tables.insert(table.id.clone(), Arc::new(table));
        MemEngine::new(tables)
    }

    fn eq_query(sel: usize, col: usize, value: &str) -> SqlAnnotation {
        SqlAnnotation {
            agg: AggOp::None,
            sel,
            conds: vec![Condition {
                col,
                op: CondOp::Eq,
                value: CellValue::Text(value.into()),
                span: None,
            }],
        }
    }

    #[test]
    fn test_select_with_equality() {
        let engine = capitals();
        let result = engine.execute("capitals", &eq_query(1, 0, "france")).unwrap();
        assert_eq!(result, vec![CellValue::Text("Paris".into())]);
    }

    #[test]
    fn test_numeric_comparison() {
        let engine = capitals();
        let query = SqlAnnotation {
            agg: AggOp::None,
            sel: 0,
            conds: vec![Condition {
                col: 2,
                op: CondOp::Gt,
                value: CellValue::Text("50".into()),
                span: None,
            }],
        };
        let result = engine.execute("capitals", &query).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_aggregates() {
        let engine = capitals();
        let mut query = SqlAnnotation {
            agg: AggOp::Count,
            sel: 2,
            conds: vec![],
        };
        assert_eq!(
            engine.execute("capitals", &query).unwrap(),
            vec![CellValue::Number(3.0)]
        );
        query.agg = AggOp::Max;
        assert_eq!(
            engine.execute("capitals", &query).unwrap(),
            vec![CellValue::Number(125.0)]
        );
        query.agg = AggOp::Avg;
        let avg = engine.execute("capitals", &query).unwrap();
        assert!(matches!(avg[0], CellValue::Number(n) if (n - 64.133).abs() < 1e-2));
    }

    #[test]
    fn test_empty_result_and_empty_aggregate() {
        let engine = capitals();
        let mut query = eq_query(1, 0, "atlantis");
        assert!(engine.execute("capitals", &query).unwrap().is_empty());
        // COUNT over nothing is still a defined value.
        query.agg = AggOp::Count;
        assert_eq!(
            engine.execute("capitals", &query).unwrap(),
            vec![CellValue::Number(0.0)]
        );
        query.agg = AggOp::Sum;
        query.sel = 2;
        assert!(engine.execute("capitals", &query).unwrap().is_empty());
    }

    #[test]
    fn test_execution_errors() {
        let engine = capitals();
        assert_eq!(
            engine.execute("nope", &eq_query(0, 0, "x")),
            Err(ExecError::UnknownTable("nope".into()))
        );
        assert!(matches!(
            engine.execute("capitals", &eq_query(9, 0, "x")),
            Err(ExecError::ColumnOutOfRange { col: 9, .. })
        ));
        let mut op_query = eq_query(0, 0, "x");
        op_query.conds[0].op = CondOp::Op;
        assert_eq!(
            engine.execute("capitals", &op_query),
            Err(ExecError::UnsupportedOperator)
        );
        let mut bad_cmp = eq_query(0, 2, "lots");
        bad_cmp.conds[0].op = CondOp::Gt;
        assert!(matches!(
            engine.execute("capitals", &bad_cmp),
            Err(ExecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_results_equal_is_order_insensitive() {
        let a = vec![CellValue::Text("Paris".into()), CellValue::Number(2.0)];
        let b = vec![CellValue::Number(2.0), CellValue::Text("paris".into())];
        assert!(results_equal(&a, &b));
        assert!(!results_equal(&a, &a[..1]));
        assert!(!results_equal(
            &[CellValue::Number(1.0)],
            &[CellValue::Number(2.0)]
        ));
    }

    #[test]
    fn test_bounded_engine_passthrough() {
        let engine = BoundedEngine::new(capitals(), Duration::from_secs(5));
        let result = engine.execute("capitals", &eq_query(1, 0, "japan")).unwrap();
        assert_eq!(result, vec![CellValue::Text("Tokyo".into())]);
    }

    #[test]
    fn test_bounded_engine_times_out() {
        struct Stalled;
        impl QueryEngine for Stalled {
            fn execute(&self, _: &str, _: &SqlAnnotation) -> Result<Vec<CellValue>> {
                std::thread::sleep(Duration::from_secs(2));
                Ok(vec![])
            }
        }
        let engine = BoundedEngine::new(Stalled, Duration::from_millis(20));
        assert!(matches!(
            engine.execute("t", &eq_query(0, 0, "x")),
            Err(ExecError::Timeout(_))
        ));
    }
}
