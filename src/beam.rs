//! Execution-guided beam decoding.
//!
//! Free decoding commits to the argmax of every head independently; here
//! candidates are kept as a beam of scored hypotheses and the execution
//! engine votes: queries that fail to execute are discarded, and (by
//! default) so are queries that come back empty, since a question always
//! has an answer in this dataset. The highest-scoring surviving hypothesis
//! wins; if execution rejects everything, the best hypothesis is returned
//! anyway rather than nothing.

use crate::align::AlignmentMap;
use crate::data::Question;
use crate::decode::{best_span, log_softmax, recover_value};
use crate::engine::QueryEngine;
use crate::model::FieldScores;
use crate::sql::{AggOp, CondOp, Condition, SqlAnnotation, MAX_CONDS};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct BeamConfig {
    /// Hypotheses kept after each expansion stage.
    pub width: usize,
    /// Treat an empty execution result as a pruning signal. Execution
    /// errors always prune.
    pub prune_empty: bool,
}

impl Default for BeamConfig {
    fn default() -> Self {
        BeamConfig {
            width: 4,
            prune_empty: true,
        }
    }
}

impl BeamConfig {
    pub fn with_width(mut self, width: usize) -> Self {
        assert!(width > 0, "beam width must be positive");
        self.width = width;
        self
    }

    pub fn with_prune_empty(mut self, prune_empty: bool) -> Self {
        self.prune_empty = prune_empty;
        self
    }
}

// ============================================================================
// Hypotheses
// ============================================================================

#[derive(Debug, Clone)]
struct Hypothesis {
    agg: AggOp,
    sel: usize,
    conds: Vec<Condition>,
    /// Predicate slots still to fill.
    remaining: usize,
    logp: f64,
}

impl Hypothesis {
    fn query(&self) -> SqlAnnotation {
        SqlAnnotation {
            agg: self.agg,
            sel: self.sel,
            conds: self.conds.clone(),
        }
    }

    fn uses_col(&self, col: usize) -> bool {
        self.conds.iter().any(|c| c.col == col)
    }
}

/// Keep the `width` best hypotheses. The sort is stable, so equal scores
/// preserve insertion order and decoding stays deterministic.
fn shrink(beam: &mut Vec<Hypothesis>, width: usize) {
    beam.sort_by(|a, b| b.logp.total_cmp(&a.logp));
    beam.truncate(width);
}

/// ln(sigmoid(x)), numerically stable on both tails.
fn log_sigmoid(x: f32) -> f64 {
    let x = x as f64;
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

// ============================================================================
// Search
// ============================================================================

/// Decode one example with execution guidance.
pub fn beam_decode(
    scores: &FieldScores,
    question: &Question,
    map: &AlignmentMap,
    table_id: &str,
    engine: &dyn QueryEngine,
    config: &BeamConfig,
) -> SqlAnnotation {
    let n_headers = scores.n_headers();
    let valid_len = map.num_subwords();

    let survives = |query: &SqlAnnotation| match engine.execute(table_id, query) {
        Ok(result) => !(config.prune_empty && result.is_empty()),
        Err(_) => false,
    };

    // Stage 1: joint (selection, aggregation) candidates, pruned by running
    // the bare aggregation against the table.
    let lp_agg = log_softmax(&scores.agg);
    let lp_sel = log_softmax(&scores.sel);
    let mut pairs: Vec<Hypothesis> = Vec::with_capacity(n_headers * lp_agg.len());
    for sel in 0..n_headers {
        for (agg_idx, &la) in lp_agg.iter().enumerate() {
            pairs.push(Hypothesis {
                agg: AggOp::from_index(agg_idx).expect("agg head width mismatch"),
                sel,
                conds: Vec::new(),
                remaining: 0,
                logp: (lp_sel[sel] + la) as f64,
            });
        }
    }
    shrink(&mut pairs, config.width);
    let fallback = pairs[0].clone();
    pairs.retain(|h| survives(&h.query()));
    if pairs.is_empty() {
        pairs.push(fallback.clone());
    }

    // Stage 2: expand each survivor over predicate counts.
    let lp_count = log_softmax(&scores.cond_count);
    let max_count = MAX_CONDS.min(n_headers);
    let mut beam: Vec<Hypothesis> = Vec::new();
    for hyp in &pairs {
        for (count, &lc) in lp_count.iter().enumerate().take(max_count + 1) {
            let mut h = hyp.clone();
            h.remaining = count;
            h.logp += lc as f64;
            beam.push(h);
        }
    }
    shrink(&mut beam, config.width.max(max_count + 1));

    // Stage 3: fill predicate slots one at a time. Each expansion picks an
    // unused column, an operator, and that column's best value span.
    let lp_ops: Vec<Vec<f32>> = scores.cond_op.iter().map(|row| log_softmax(row)).collect();
    let lp_starts: Vec<Vec<f32>> = scores.span_start.iter().map(|r| log_softmax(r)).collect();
    let lp_ends: Vec<Vec<f32>> = scores.span_end.iter().map(|r| log_softmax(r)).collect();

    loop {
        let mut next: Vec<Hypothesis> = Vec::new();
        let mut expanded: Vec<Hypothesis> = Vec::new();
        for hyp in &beam {
            if hyp.remaining == 0 {
                next.push(hyp.clone());
                continue;
            }
            for col in 0..n_headers {
                if hyp.uses_col(col) {
                    continue;
                }
                let (s, e) = best_span(&scores.span_start[col], &scores.span_end[col], valid_len);
                let (span, value) = recover_value(question, map, s, e);
                let span_lp = (lp_starts[col][s] + lp_ends[col][e]) as f64;
                for (op_idx, &lo) in lp_ops[col].iter().enumerate() {
                    let op = CondOp::from_index(op_idx).expect("op head width mismatch");
                    if op == CondOp::Op {
                        continue;
                    }
                    let mut h = hyp.clone();
                    h.conds.push(Condition {
                        col,
                        op,
                        value: value.clone(),
                        span: Some(span),
                    });
                    h.remaining -= 1;
                    h.logp += log_sigmoid(scores.cond_col[col]) + lo as f64 + span_lp;
                    expanded.push(h);
                }
            }
        }
        if expanded.is_empty() {
            break;
        }
        // Execute every newly extended partial query before narrowing the
        // beam, so execution-invalid states cannot crowd out a lower-scored
        // survivor. If nothing survives, the best unpruned extension is kept
        // so the search can still finish.
        shrink(&mut expanded, usize::MAX);
        let best_unpruned = expanded[0].clone();
        expanded.retain(|h| survives(&h.query()));
        if expanded.is_empty() {
            expanded.push(best_unpruned);
        }
        next.append(&mut expanded);
        shrink(&mut next, config.width);
        beam = next;
    }

    // Final vote: best hypothesis the engine accepts, else best overall.
    shrink(&mut beam, usize::MAX);
    beam.iter()
        .find(|h| survives(&h.query()))
        .unwrap_or(&beam[0])
        .query()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::data::{ColumnKind, Table};
    use crate::decode::decode_example;
    use crate::engine::MemEngine;
    use crate::sql::CellValue;

    fn capitals_engine() -> MemEngine {
        let table = Table {
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
        };
        let mut tables = HashMap::new();
        tables.insert(table.id.clone(), Arc::new(table));
        MemEngine::new(tables)
    }

    fn question() -> (Question, AlignmentMap) {
        let tokens = ["what", "is", "the", "capital", "of", "france", "?"];
        let q = Question {
            raw: "What is the capital of France?".into(),
            ref_tokens: tokens.iter().map(|s| s.to_string()).collect(),
        };
        let pieces: Vec<Vec<String>> = tokens.iter().map(|t| vec![t.to_string()]).collect();
        let map = AlignmentMap::build(&pieces, 64);
        (q, map)
    }

    /// Scores where the argmax predicate column is wrong: the model slightly
    /// prefers putting "france" on the capital column, which matches no row.
    fn misled_scores() -> FieldScores {
        let n_tok = 7;
        let mut span_start = vec![vec![0.0; n_tok]; 2];
        let mut span_end = vec![vec![0.0; n_tok]; 2];
        for col in 0..2 {
            span_start[col][5] = 6.0;
            span_end[col][5] = 6.0;
        }
        FieldScores {
            agg: vec![6.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            sel: vec![0.0, 5.0],
            cond_count: vec![0.0, 4.0, 0.0, 0.0, 0.0],
            cond_col: vec![1.0, 1.5],
            cond_op: vec![vec![4.0, 0.0, 0.0, 0.0], vec![4.0, 0.0, 0.0, 0.0]],
            span_start,
            span_end,
        }
    }

    #[test]
    fn test_free_decode_is_misled() {
        let (q, map) = question();
        let ann = decode_example(&misled_scores(), &q, &map);
        assert_eq!(ann.conds[0].col, 1);
    }

    #[test]
    fn test_execution_guidance_recovers_capital_query() {
        let (q, map) = question();
        let engine = capitals_engine();
        let ann = beam_decode(
            &misled_scores(),
            &q,
            &map,
            "capitals",
            &engine,
            &BeamConfig::default(),
        );
        assert_eq!(ann.agg, AggOp::None);
        assert_eq!(ann.sel, 1);
        assert_eq!(ann.conds.len(), 1);
        assert_eq!(ann.conds[0].col, 0);
        assert_eq!(ann.conds[0].op, CondOp::Eq);
        assert_eq!(ann.conds[0].value.as_text(), "france");
        let result = engine.execute("capitals", &ann).unwrap();
        assert_eq!(result, vec![CellValue::Text("Paris".into())]);
    }

    #[test]
    fn test_without_empty_pruning_keeps_argmax() {
        let (q, map) = question();
        let engine = capitals_engine();
        let config = BeamConfig::default().with_prune_empty(false);
        let ann = beam_decode(&misled_scores(), &q, &map, "capitals", &engine, &config);
        // The empty-but-executable argmax query is no longer pruned away.
        assert_eq!(ann.conds[0].col, 1);
    }

    #[test]
    fn test_partial_queries_are_pruned_before_the_beam_narrows() {
        // Six columns; only column 5 contains the decoded value, but every
        // other column scores higher on the predicate-column head. Without
        // executing each partial query as it is completed, the width-limited
        // beam fills up with the high-scoring empty-result predicates and
        // evicts the only one that matches a row.
        let table = Table {
            id: "wide".into(),
            headers: (0..6).map(|i| format!("c{i}")).collect(),
            kinds: vec![ColumnKind::Text; 6],
            rows: vec![(0..6)
                .map(|i| {
                    CellValue::Text(if i == 5 { "v".into() } else { format!("x{i}") })
                })
                .collect()],
        };
        let mut tables = HashMap::new();
        tables.insert(table.id.clone(), Arc::new(table));
        let engine = MemEngine::new(tables);

        let tokens = ["which", "row", "has", "v"];
        let q = Question {
            raw: "Which row has v?".into(),
            ref_tokens: tokens.iter().map(|s| s.to_string()).collect(),
        };
        let pieces: Vec<Vec<String>> = tokens.iter().map(|t| vec![t.to_string()]).collect();
        let map = AlignmentMap::build(&pieces, 64);

        let n_tok = 4;
        let mut span_start = vec![vec![0.0; n_tok]; 6];
        let mut span_end = vec![vec![0.0; n_tok]; 6];
        for col in 0..6 {
            span_start[col][3] = 6.0;
            span_end[col][3] = 6.0;
        }
        let scores = FieldScores {
            agg: vec![6.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            sel: vec![5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            cond_count: vec![0.0, 8.0, 0.0, 0.0, 0.0],
            cond_col: vec![5.0, 4.0, 3.0, 2.0, 1.0, 0.5],
            cond_op: vec![vec![4.0, 0.0, 0.0, 0.0]; 6],
            span_start,
            span_end,
        };

        let ann = beam_decode(&scores, &q, &map, "wide", &engine, &BeamConfig::default());
        assert_eq!(ann.conds.len(), 1);
        assert_eq!(ann.conds[0].col, 5);
        assert_eq!(ann.conds[0].value.as_text(), "v");
        let result = engine.execute("wide", &ann).unwrap();
        assert!(!result.is_empty());
    }

    #[test]
    fn test_decoding_is_deterministic() {
        let (q, map) = question();
        let engine = capitals_engine();
        let config = BeamConfig::default();
        let first = beam_decode(&misled_scores(), &q, &map, "capitals", &engine, &config);
        for _ in 0..3 {
            let again = beam_decode(&misled_scores(), &q, &map, "capitals", &engine, &config);
            assert_eq!(again, first);
        }
    }

    #[test]
    fn test_unknown_table_falls_back_to_best_hypothesis() {
        let (q, map) = question();
        let engine = capitals_engine();
        let ann = beam_decode(
            &misled_scores(),
            &q,
            &map,
            "missing",
            &engine,
            &BeamConfig::default(),
        );
        // Every execution fails, so the unguided best hypothesis comes back.
        assert_eq!(ann.sel, 1);
        assert_eq!(ann.conds.len(), 1);
    }
}
