//! Ground-truth label construction.
//!
//! Combines a gold [`SqlAnnotation`] with the per-question [`AlignmentMap`]
//! into the flat per-field supervision the loss consumes. Span failures are
//! recoverable per example: the caller drops the example from that step's
//! update (training) or counts it wrong with an error artifact (evaluation).

use crate::align::{AlignError, AlignmentMap};
use crate::sql::{SqlAnnotation, MAX_CONDS};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error(transparent)]
    Align(#[from] AlignError),

    #[error("predicate {slot} carries no gold value span")]
    MissingSpan { slot: usize },
}

pub type Result<T> = std::result::Result<T, LabelError>;

// ============================================================================
// Labels
// ============================================================================

/// Per-example supervision for every decoder head. All spans are inclusive
/// sub-word indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pub agg: usize,
    pub sel: usize,
    pub cond_count: usize,
    /// One column per predicate, in predicate order.
    pub cond_cols: Vec<usize>,
    /// One operator per predicate, parallel to `cond_cols`.
    pub cond_ops: Vec<usize>,
    /// One (start, end) sub-word pair per predicate, parallel to `cond_cols`.
    pub spans: Vec<(usize, usize)>,
}

impl Labels {
    /// Build labels for one example.
    ///
    /// Fails with a span-unresolvable condition when the alignment cannot
    /// place a gold value inside the (possibly truncated) sub-word sequence.
    pub fn build(gold: &SqlAnnotation, map: &AlignmentMap) -> Result<Labels> {
        assert!(
            gold.conds.len() <= MAX_CONDS,
            "annotation carries {} predicates, max is {MAX_CONDS}",
            gold.conds.len()
        );

        let mut cond_cols = Vec::with_capacity(gold.conds.len());
        let mut cond_ops = Vec::with_capacity(gold.conds.len());
        let mut spans = Vec::with_capacity(gold.conds.len());
        for (slot, cond) in gold.conds.iter().enumerate() {
            let span = cond.span.ok_or(LabelError::MissingSpan { slot })?;
            spans.push(map.project_span(span.start, span.end)?);
            cond_cols.push(cond.col);
            cond_ops.push(cond.op.index());
        }

        Ok(Labels {
            agg: gold.agg.index(),
            sel: gold.sel,
            cond_count: gold.conds.len(),
            cond_cols,
            cond_ops,
            spans,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
