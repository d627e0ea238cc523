//! SQL data model: the structured queries the parser predicts and is
//! supervised with.
//!
//! A query over a single table is an aggregation operator, one selected
//! column, and up to [`MAX_CONDS`] where-clause predicates. The operator
//! vocabularies are fixed by the dataset format and shared between the
//! label builder, the decoder heads, and the execution engine.

use serde::{Deserialize, Serialize};

/// Maximum number of where-clause predicates a query may carry.
pub const MAX_CONDS: usize = 4;

// ============================================================================
// Operator Vocabularies
// ============================================================================

/// Aggregation operator. `None` renders as a bare column selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AggOp {
    None = 0,
    Max = 1,
    Min = 2,
    Count = 3,
    Sum = 4,
    Avg = 5,
}

/// Number of aggregation operators (size of the `agg` score head).
pub const N_AGG_OPS: usize = 6;

impl AggOp {
    /// All operators, indexed by their wire id.
    pub const ALL: [AggOp; N_AGG_OPS] = [
        AggOp::None,
        AggOp::Max,
        AggOp::Min,
        AggOp::Count,
        AggOp::Sum,
        AggOp::Avg,
    ];

    /// Operator for a wire id, or `None` if out of range.
    pub fn from_index(idx: usize) -> Option<AggOp> {
        Self::ALL.get(idx).copied()
    }

    /// Wire id of this operator.
    pub fn index(self) -> usize {
        self as usize
    }

    /// SQL keyword, empty for the bare selection.
    pub fn as_str(self) -> &'static str {
        match self {
            AggOp::None => "",
            AggOp::Max => "MAX",
            AggOp::Min => "MIN",
            AggOp::Count => "COUNT",
            AggOp::Sum => "SUM",
            AggOp::Avg => "AVG",
        }
    }
}

/// Where-clause comparison operator.
///
/// `Op` is the dataset's placeholder operator: it appears in the wire format
/// but never in actual annotations. The execution engine rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CondOp {
    Eq = 0,
    Gt = 1,
    Lt = 2,
    Op = 3,
}

/// Number of comparison operators (size of the `cond_op` score head).
pub const N_COND_OPS: usize = 4;

impl CondOp {
    pub const ALL: [CondOp; N_COND_OPS] = [CondOp::Eq, CondOp::Gt, CondOp::Lt, CondOp::Op];

    pub fn from_index(idx: usize) -> Option<CondOp> {
        Self::ALL.get(idx).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CondOp::Eq => "=",
            CondOp::Gt => ">",
            CondOp::Lt => "<",
            CondOp::Op => "OP",
        }
    }
}

// ============================================================================
// Values and Predicates
// ============================================================================

/// A literal cell or predicate value. The dataset stores numbers and strings
/// heterogeneously, so both are kept; comparisons coerce as needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Numeric view of this value, parsing text if possible.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            CellValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Textual view of this value.
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Number(n) => {
                // Render integral floats without the trailing ".0" so that
                // "2008" and 2008.0 compare equal as text.
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            CellValue::Text(s) => s.clone(),
        }
    }
}

impl PartialEq for CellValue {
    fn eq(&self, other: &Self) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => normalize_value(&self.as_text()) == normalize_value(&other.as_text()),
        }
    }
}

/// Inclusive token-index range naming a predicate value inside the question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Span {
        assert!(end >= start, "span end {end} precedes start {start}");
        Span { start, end }
    }
}

/// One where-clause predicate: `column op value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub col: usize,
    pub op: CondOp,
    pub value: CellValue,
    /// Reference-token span of `value` inside the question, when known
    /// (gold annotations carry it; engine execution ignores it).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub span: Option<Span>,
}

// ============================================================================
// Annotations
// ============================================================================

/// A complete structured query: aggregation, selected column, predicates.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlAnnotation {
    pub agg: AggOp,
    pub sel: usize,
    pub conds: Vec<Condition>,
}

impl SqlAnnotation {
    /// Build an annotation, validating column indices against the table's
    /// header count and the predicate count against [`MAX_CONDS`].
    pub fn try_new(
        agg: AggOp,
        sel: usize,
        conds: Vec<Condition>,
        n_headers: usize,
    ) -> Result<SqlAnnotation, String> {
        if sel >= n_headers {
            return Err(format!("selected column {sel} out of range ({n_headers} headers)"));
        }
        if conds.len() > MAX_CONDS {
            return Err(format!("{} predicates exceed the supported maximum {MAX_CONDS}", conds.len()));
        }
        for cond in &conds {
            if cond.col >= n_headers {
                return Err(format!(
                    "predicate column {} out of range ({n_headers} headers)",
                    cond.col
                ));
            }
        }
        Ok(SqlAnnotation { agg, sel, conds })
    }

    /// Render the annotation as SQL text for logs and artifacts.
    pub fn to_sql(&self, table_name: &str, headers: &[String]) -> String {
        let col = |i: usize| headers.get(i).cloned().unwrap_or_else(|| format!("col{i}"));
        let select = match self.agg {
            AggOp::None => col(self.sel),
            agg => format!("{}({})", agg.as_str(), col(self.sel)),
        };
        let mut sql = format!("SELECT {select} FROM {table_name}");
        for (i, cond) in self.conds.iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.push_str(&format!(
                "{} {} {}",
                col(cond.col),
                cond.op.as_str(),
                cond.value.as_text()
            ));
        }
        sql
    }
}

/// Wire form of an annotation: `{"agg": .., "sel": .., "conds": [[col, op, value], ..]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSql {
    pub agg: usize,
    pub sel: usize,
    pub conds: Vec<(usize, usize, CellValue)>,
}

impl From<&SqlAnnotation> for RawSql {
    fn from(ann: &SqlAnnotation) -> RawSql {
        RawSql {
            agg: ann.agg.index(),
            sel: ann.sel,
            conds: ann
                .conds
                .iter()
                .map(|c| (c.col, c.op.index(), c.value.clone()))
                .collect(),
        }
    }
}

// ============================================================================
// Value Normalization
// ============================================================================

/// Canonical form of a value string for exact-match scoring: lowercase with
/// collapsed whitespace.
pub fn normalize_value(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agg_round_trip() {
        for (i, op) in AggOp::ALL.iter().enumerate() {
            assert_eq!(op.index(), i);
            assert_eq!(AggOp::from_index(i), Some(*op));
        }
        assert_eq!(AggOp::from_index(N_AGG_OPS), None);
    }

    #[test]
    fn test_cell_value_equality() {
        assert_eq!(CellValue::Number(2008.0), CellValue::Text("2008".into()));
        assert_eq!(
            CellValue::Text("  New   York ".into()),
            CellValue::Text("new york".into())
        );
        assert_ne!(CellValue::Number(3.0), CellValue::Text("4".into()));
    }

    #[test]
    fn test_annotation_validation() {
        let cond = Condition {
            col: 1,
            op: CondOp::Eq,
            value: CellValue::Text("france".into()),
            span: None,
        };
        assert!(SqlAnnotation::try_new(AggOp::None, 0, vec![cond.clone()], 2).is_ok());
        assert!(SqlAnnotation::try_new(AggOp::None, 2, vec![], 2).is_err());
        assert!(SqlAnnotation::try_new(AggOp::None, 0, vec![cond], 1).is_err());
    }

    #[test]
    fn test_to_sql() {
        let ann = SqlAnnotation {
            agg: AggOp::Count,
            sel: 1,
            conds: vec![Condition {
                col: 0,
                op: CondOp::Eq,
                value: CellValue::Text("France".into()),
                span: None,
            }],
        };
        let headers = vec!["country".to_string(), "capital".to_string()];
        assert_eq!(
            ann.to_sql("t1", &headers),
            "SELECT COUNT(capital) FROM t1 WHERE country = France"
        );
    }

    #[test]
    fn test_raw_sql_wire_format() {
        let raw: RawSql =
            serde_json::from_str(r#"{"agg": 0, "sel": 1, "conds": [[0, 0, "france"]]}"#).unwrap();
        assert_eq!(raw.agg, 0);
        assert_eq!(raw.conds.len(), 1);
        let json = serde_json::to_string(&raw).unwrap();
        assert!(json.contains("\"conds\":[[0,0,\"france\"]]"));
    }
}
