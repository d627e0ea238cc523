//! Accuracy scoring: per-field agreement, logical-form match, and
//! execution match.
//!
//! Logical-form match compares the predicted structure to the gold
//! structure (predicate order does not matter). Execution match runs both
//! queries through the engine and compares result multisets, so two
//! syntactically different queries that retrieve the same cells both count.
//! Per-field counters follow the same conditioning as the loss: operator
//! and value agreement are only judged on predicates whose column was
//! predicted correctly.

use crate::engine::{results_equal, QueryEngine};
use crate::sql::{normalize_value, Condition, SqlAnnotation};

// ============================================================================
// Per-Example Comparison
// ============================================================================

/// Field-level agreement between one prediction and its gold annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMatch {
    pub sel: bool,
    pub agg: bool,
    pub cond_count: bool,
    pub cond_cols: bool,
    pub cond_ops: bool,
    pub cond_values: bool,
}

impl FieldMatch {
    /// Logical-form match: every field agrees.
    pub fn logical_form(&self) -> bool {
        self.sel
            && self.agg
            && self.cond_count
            && self.cond_cols
            && self.cond_ops
            && self.cond_values
    }
}

fn find_by_col(conds: &[Condition], col: usize) -> Option<&Condition> {
    conds.iter().find(|c| c.col == col)
}

/// Compare one prediction against gold, field by field.
pub fn compare_fields(pred: &SqlAnnotation, gold: &SqlAnnotation) -> FieldMatch {
    let cond_count = pred.conds.len() == gold.conds.len();
    let cond_cols = cond_count
        && gold
            .conds
            .iter()
            .all(|g| find_by_col(&pred.conds, g.col).is_some());
    let cond_ops = cond_cols
        && gold
            .conds
            .iter()
            .all(|g| find_by_col(&pred.conds, g.col).is_some_and(|p| p.op == g.op));
    let cond_values = cond_cols
        && gold.conds.iter().all(|g| {
            find_by_col(&pred.conds, g.col).is_some_and(|p| {
                normalize_value(&p.value.as_text()) == normalize_value(&g.value.as_text())
            })
        });
    FieldMatch {
        sel: pred.sel == gold.sel,
        agg: pred.agg == gold.agg,
        cond_count,
        cond_cols,
        cond_ops,
        cond_values,
    }
}

/// Whether both queries retrieve the same result multiset. Any execution
/// error on either side counts as a miss.
pub fn execution_match(
    pred: &SqlAnnotation,
    gold: &SqlAnnotation,
    table_id: &str,
    engine: &dyn QueryEngine,
) -> bool {
    match (engine.execute(table_id, pred), engine.execute(table_id, gold)) {
        (Ok(p), Ok(g)) => results_equal(&p, &g),
        _ => false,
    }
}

// ============================================================================
// Aggregate Metrics
// ============================================================================

/// Running accuracy counters over a split. Merging is associative, so
/// partial counts from parallel shards combine in any order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    pub n: usize,
    pub sel: usize,
    pub agg: usize,
    pub cond_count: usize,
    pub cond_cols: usize,
    pub cond_ops: usize,
    pub cond_values: usize,
    pub logical_form: usize,
    pub execution: usize,
    /// Examples that could not be decoded (for example an unresolvable
    /// value span). Counted in `n` and scored as wrong on every field.
    pub skipped: usize,
}

impl Metrics {
    /// Record one scored example.
    pub fn record(&mut self, fields: FieldMatch, executed: bool) {
        self.n += 1;
        self.sel += fields.sel as usize;
        self.agg += fields.agg as usize;
        self.cond_count += fields.cond_count as usize;
        self.cond_cols += fields.cond_cols as usize;
        self.cond_ops += fields.cond_ops as usize;
        self.cond_values += fields.cond_values as usize;
        self.logical_form += fields.logical_form() as usize;
        self.execution += executed as usize;
    }

    /// Record an example that never produced a prediction.
    pub fn record_skipped(&mut self) {
        self.n += 1;
        self.skipped += 1;
    }

    pub fn merge(mut self, other: Metrics) -> Metrics {
        self.n += other.n;
        self.sel += other.sel;
        self.agg += other.agg;
        self.cond_count += other.cond_count;
        self.cond_cols += other.cond_cols;
        self.cond_ops += other.cond_ops;
        self.cond_values += other.cond_values;
        self.logical_form += other.logical_form;
        self.execution += other.execution;
        self.skipped += other.skipped;
        self
    }

    pub fn logical_form_accuracy(&self) -> f64 {
        ratio(self.logical_form, self.n)
    }

    pub fn execution_accuracy(&self) -> f64 {
        ratio(self.execution, self.n)
    }
}

fn ratio(hits: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

impl std::fmt::Display for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={} sel={:.3} agg={:.3} wn={:.3} wc={:.3} wo={:.3} wv={:.3} lf={:.3} ex={:.3} skipped={}",
            self.n,
            ratio(self.sel, self.n),
            ratio(self.agg, self.n),
            ratio(self.cond_count, self.n),
            ratio(self.cond_cols, self.n),
            ratio(self.cond_ops, self.n),
            ratio(self.cond_values, self.n),
            self.logical_form_accuracy(),
            self.execution_accuracy(),
            self.skipped
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
