//! Free decoding: turn detached score distributions into a structured query.
//!
//! Field order and constraints: aggregation and selected column first
//! (independent), then predicate count, then predicate columns without
//! replacement, then per-column operator and value span with `end >= start`
//! inside the valid question length. Value strings are recovered by mapping
//! the sub-word span back through the inverse alignment to reference tokens.

use crate::align::AlignmentMap;
use crate::data::Question;
use crate::model::FieldScores;
use crate::sql::{AggOp, CellValue, CondOp, Condition, Span, SqlAnnotation};

// ============================================================================
// Score Vector Helpers
// ============================================================================

/// Index of the maximum score. Ties break toward the lower index, which
/// keeps decoding deterministic.
///
/// # Panics
/// Panics on an empty score vector.
pub fn argmax(scores: &[f32]) -> usize {
    assert!(!scores.is_empty(), "argmax over empty scores");
    let mut best = 0;
    for (i, &v) in scores.iter().enumerate().skip(1) {
        if v > scores[best] {
            best = i;
        }
    }
    best
}

/// Indices of the top `k` scores, descending, ties toward the lower index.
pub fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..scores.len()).collect();
    idx.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    idx.truncate(k);
    idx
}

/// Log-softmax over a plain score vector.
pub fn log_softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_z = scores.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
    scores.iter().map(|&v| v - log_z).collect()
}

/// Best (start, end) pair maximizing `start_scores[s] + end_scores[e]`
/// subject to `e >= s`, both within `valid_len`. Single left-to-right pass
/// tracking the best start so far.
pub fn best_span(start_scores: &[f32], end_scores: &[f32], valid_len: usize) -> (usize, usize) {
    let n = valid_len.min(start_scores.len()).min(end_scores.len());
    assert!(n > 0, "no valid positions for span decoding");
    let mut best_start = 0;
    let mut best = (0, 0);
    let mut best_score = f32::NEG_INFINITY;
    for e in 0..n {
        if start_scores[e] > start_scores[best_start] {
            best_start = e;
        }
        let score = start_scores[best_start] + end_scores[e];
        if score > best_score {
            best_score = score;
            best = (best_start, e);
        }
    }
    best
}

// ============================================================================
// Annotation Assembly
// ============================================================================

/// Map an inclusive sub-word span back to reference tokens, yielding the
/// reference span and the recovered value text.
pub fn recover_value(
    question: &Question,
    map: &AlignmentMap,
    start: usize,
    end: usize,
) -> (Span, CellValue) {
    let (rs, re) = map.unproject_span(start, end);
    (
        Span::new(rs, re),
        CellValue::Text(question.ref_tokens[rs..=re].join(" ")),
    )
}

/// Decode one example's scores into a structured query.
pub fn decode_example(
    scores: &FieldScores,
    question: &Question,
    map: &AlignmentMap,
) -> SqlAnnotation {
    let n_headers = scores.n_headers();
    let valid_len = map.num_subwords();
    debug_assert_eq!(scores.n_question_tokens(), valid_len);

    let agg = AggOp::from_index(argmax(&scores.agg)).expect("agg head width mismatch");
    let sel = argmax(&scores.sel);

    // A query cannot reference more distinct predicate columns than exist.
    let count = argmax(&scores.cond_count).min(n_headers);
    let cols = top_k(&scores.cond_col, count);

    let mut conds = Vec::with_capacity(count);
    for col in cols {
        let op = CondOp::from_index(argmax(&scores.cond_op[col])).expect("op head width mismatch");
        let (s, e) = best_span(&scores.span_start[col], &scores.span_end[col], valid_len);
        let (span, value) = recover_value(question, map, s, e);
        conds.push(Condition {
            col,
            op,
            value,
            span: Some(span),
        });
    }

    SqlAnnotation { agg, sel, conds }
}

/// Reorder predicted predicates so columns line up with the gold predicate
/// order where they intersect. Used for training-time metrics: operator and
/// span heads are teacher-forced on gold columns there, so slot order is
/// only meaningful after this alignment.
pub fn sort_conds_to_gold(pred: &mut SqlAnnotation, gold: &SqlAnnotation) {
    let gold_pos = |col: usize| {
        gold.conds
            .iter()
            .position(|c| c.col == col)
            .unwrap_or(usize::MAX)
    };
    pred.conds.sort_by_key(|c| gold_pos(c.col));
}

// ============================================================================
// Tests
// ============================================================================
