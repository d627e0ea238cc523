//! Alignment between the reference tokenization and the encoder's sub-word
//! tokenization.
//!
//! Gold value spans are labeled on reference tokens; the model points into
//! sub-word positions. The map is built from the sub-word pieces of each
//! reference token (in order), so it is monotonic and total by construction
//! over whatever prefix survives the encoder's maximum sequence length.
//! Tokens truncated away have an empty forward image; projecting a span
//! that touches them is the system's one recoverable per-example failure.

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AlignError {
    #[error("value span [{start}, {end}] not present in the sub-word sequence (question truncated at {kept} of {total} tokens)")]
    SpanUnresolvable {
        start: usize,
        end: usize,
        kept: usize,
        total: usize,
    },
}

pub type Result<T> = std::result::Result<T, AlignError>;

// ============================================================================
// Alignment Map
// ============================================================================

/// Bidirectional index map between reference tokens and sub-word tokens for
/// one question. Recomputed per question per batch; never cached.
#[derive(Debug, Clone)]
pub struct AlignmentMap {
    /// `fwd[r]` is the contiguous range of sub-word indices for reference
    /// token `r`. The range is empty when the tokenizer produced no pieces
    /// for the token; truncated tokens have no entry at all.
    fwd: Vec<(usize, usize)>,
    /// `rev[s]` is the reference token that produced sub-word `s`.
    rev: Vec<usize>,
    /// Reference tokens in the full (untruncated) question.
    total_ref: usize,
}

impl AlignmentMap {
    /// Build the map from each reference token's sub-word pieces, keeping at
    /// most `max_subwords` sub-word tokens. A reference token whose pieces
    /// would cross the limit is dropped entirely along with everything after
    /// it, so every kept token keeps a contiguous, complete image.
    pub fn build(pieces_per_token: &[Vec<String>], max_subwords: usize) -> AlignmentMap {
        let mut fwd = Vec::with_capacity(pieces_per_token.len());
        let mut rev = Vec::new();
        for (r, pieces) in pieces_per_token.iter().enumerate() {
            if rev.len() + pieces.len() > max_subwords {
                break;
            }
            let start = rev.len();
            rev.extend(std::iter::repeat(r).take(pieces.len()));
            fwd.push((start, rev.len()));
        }
        AlignmentMap {
            fwd,
            rev,
            total_ref: pieces_per_token.len(),
        }
    }

    /// Number of reference tokens that survived truncation.
    pub fn kept_tokens(&self) -> usize {
        self.fwd.len()
    }

    /// Number of sub-word tokens in the kept prefix.
    pub fn num_subwords(&self) -> usize {
        self.rev.len()
    }

    /// Sub-word indices of reference token `r`, as `[start, end)`.
    /// `None` if `r` was truncated away (or never existed).
    pub fn subwords_of(&self, r: usize) -> Option<(usize, usize)> {
        self.fwd.get(r).copied()
    }

    /// Reference token that produced sub-word `s`.
    ///
    /// # Panics
    /// Panics if `s` is out of bounds (contract violation, not a data issue).
    pub fn ref_of(&self, s: usize) -> usize {
        self.rev[s]
    }

    /// Project an inclusive reference-token span to inclusive sub-word
    /// indices: first sub-word of the start token through last sub-word of
    /// the end token.
    pub fn project_span(&self, start: usize, end: usize) -> Result<(usize, usize)> {
        let unresolvable = || AlignError::SpanUnresolvable {
            start,
            end,
            kept: self.kept_tokens(),
            total: self.total_ref,
        };
        let (s_lo, s_hi) = self.subwords_of(start).ok_or_else(unresolvable)?;
        let (e_lo, e_hi) = self.subwords_of(end).ok_or_else(unresolvable)?;
        // A kept token can still have an empty image when the tokenizer
        // produced no pieces for it; a span anchored there has no sub-word
        // counterpart.
        if s_lo == s_hi || e_lo == e_hi {
            return Err(unresolvable());
        }
        Ok((s_lo, e_hi - 1))
    }

    /// Project an inclusive sub-word span back to inclusive reference-token
    /// indices (the inverse of [`project_span`](Self::project_span), rounded
    /// outward to whole reference tokens).
    ///
    /// # Panics
    /// Panics if either index is out of bounds.
    pub fn unproject_span(&self, start: usize, end: usize) -> (usize, usize) {
        assert!(end >= start, "sub-word span end {end} precedes start {start}");
        (self.rev[start], self.rev[end])
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pieces(words: &[&[&str]]) -> Vec<Vec<String>> {
        words
            .iter()
            .map(|w| w.iter().map(|p| p.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_monotonic_and_total() {
        // "playing" -> play ##ing, "cards" -> cards
        let map = AlignmentMap::build(&pieces(&[&["play", "##ing"], &["cards"]]), 64);
        assert_eq!(map.kept_tokens(), 2);
        assert_eq!(map.num_subwords(), 3);
        assert_eq!(map.subwords_of(0), Some((0, 2)));
        assert_eq!(map.subwords_of(1), Some((2, 3)));
        // Inverse lookup lands back inside the forward image.
        for s in 0..map.num_subwords() {
            let r = map.ref_of(s);
            let (lo, hi) = map.subwords_of(r).unwrap();
            assert!((lo..hi).contains(&s));
        }
    }

    #[test]
    fn test_span_projection_multi_piece_boundaries() {
        let map = AlignmentMap::build(
            &pieces(&[&["what"], &["un", "##bel", "##ievable"], &["year"]]),
            64,
        );
        // Span covering the multi-piece token starts at its first piece and
        // ends at its last.
        assert_eq!(map.project_span(1, 1).unwrap(), (1, 3));
        assert_eq!(map.project_span(0, 2).unwrap(), (0, 4));
    }

    #[test]
    fn test_truncation_makes_span_unresolvable() {
        let map = AlignmentMap::build(&pieces(&[&["a"], &["b", "##b"], &["c"]]), 2);
        // Token 1 needs two sub-words but only one slot remains: it and
        // everything after it are dropped.
        assert_eq!(map.kept_tokens(), 1);
        assert!(map.project_span(0, 0).is_ok());
        assert!(matches!(
            map.project_span(1, 1),
            Err(AlignError::SpanUnresolvable { kept: 1, total: 3, .. })
        ));
        assert!(map.project_span(0, 2).is_err());
    }

    #[test]
    fn test_pieceless_token_makes_span_unresolvable() {
        // A token the tokenizer maps to nothing (a soft hyphen, say) has an
        // empty sub-word image; spans anchored on it cannot be projected,
        // while spans around it still can.
        let map = AlignmentMap::build(&pieces(&[&["what"], &[], &["year"]]), 64);
        assert_eq!(map.kept_tokens(), 3);
        assert!(matches!(
            map.project_span(1, 1),
            Err(AlignError::SpanUnresolvable { start: 1, end: 1, .. })
        ));
        assert!(map.project_span(0, 1).is_err());
        assert_eq!(map.project_span(0, 0).unwrap(), (0, 0));
        assert_eq!(map.project_span(2, 2).unwrap(), (1, 1));
    }

    #[test]
    fn test_unproject_rounds_to_reference_tokens() {
        let map = AlignmentMap::build(&pieces(&[&["new"], &["york", "##ers"]]), 64);
        assert_eq!(map.unproject_span(0, 2), (0, 1));
        assert_eq!(map.unproject_span(1, 1), (1, 1));
    }
}
