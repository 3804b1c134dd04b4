//! Numeric range derivation for univariate predicates.
//!
//! A range is a strictly ordered list of disjoint segments. Boundary rules:
//! union merging adopts the more-inclusive boundary when endpoints
//! coincide; intersection adopts the less-inclusive one. Zero-width
//! segments are only valid closed-closed.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::expr::{BinaryOp, Expression, UnaryOp};
use super::RefinementError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    Open,
    Closed,
}

impl BoundaryKind {
    fn inverted(self) -> Self {
        match self {
            BoundaryKind::Open => BoundaryKind::Closed,
            BoundaryKind::Closed => BoundaryKind::Open,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Boundary {
    pub val: f64,
    pub kind: BoundaryKind,
}

impl Boundary {
    pub fn open(val: f64) -> Self {
        Self {
            val,
            kind: BoundaryKind::Open,
        }
    }

    pub fn closed(val: f64) -> Self {
        Self {
            val,
            kind: BoundaryKind::Closed,
        }
    }

    fn inverted(self) -> Self {
        Self {
            val: self.val,
            kind: self.kind.inverted(),
        }
    }
}

/// Compare two lower boundaries; Closed starts earlier at equal values.
fn cmp_from(a: &Boundary, b: &Boundary) -> Ordering {
    a.val.total_cmp(&b.val).then_with(|| match (a.kind, b.kind) {
        (BoundaryKind::Closed, BoundaryKind::Open) => Ordering::Less,
        (BoundaryKind::Open, BoundaryKind::Closed) => Ordering::Greater,
        _ => Ordering::Equal,
    })
}

/// Compare two upper boundaries; Closed extends further at equal values.
fn cmp_to(a: &Boundary, b: &Boundary) -> Ordering {
    a.val.total_cmp(&b.val).then_with(|| match (a.kind, b.kind) {
        (BoundaryKind::Open, BoundaryKind::Closed) => Ordering::Less,
        (BoundaryKind::Closed, BoundaryKind::Open) => Ordering::Greater,
        _ => Ordering::Equal,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub from: Boundary,
    pub to: Boundary,
}

impl Segment {
    pub fn new(from: Boundary, to: Boundary) -> Result<Self, RefinementError> {
        if from.val.is_nan() || to.val.is_nan() {
            return Err(RefinementError::InvalidSegment {
                reason: "NaN boundary".to_string(),
            });
        }
        if from.val > to.val {
            return Err(RefinementError::InvalidSegment {
                reason: format!("from {} exceeds to {}", from.val, to.val),
            });
        }
        if from.val == to.val
            && !(from.kind == BoundaryKind::Closed && to.kind == BoundaryKind::Closed)
        {
            return Err(RefinementError::InvalidSegment {
                reason: "zero-width segment must be closed on both ends".to_string(),
            });
        }
        Ok(Self { from, to })
    }

    pub fn point(val: f64) -> Result<Self, RefinementError> {
        Self::new(Boundary::closed(val), Boundary::closed(val))
    }

    fn universe() -> Self {
        Self {
            from: Boundary::open(f64::NEG_INFINITY),
            to: Boundary::open(f64::INFINITY),
        }
    }

    /// Overlapping or touching such that the union is one segment.
    fn merges_with(&self, next: &Segment) -> bool {
        match self.to.val.total_cmp(&next.from.val) {
            Ordering::Greater => true,
            Ordering::Equal => {
                self.to.kind == BoundaryKind::Closed || next.from.kind == BoundaryKind::Closed
            }
            Ordering::Less => false,
        }
    }
}

/// Strictly ordered list of disjoint, unmergeable segments.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    segments: Vec<Segment>,
}

impl NumericRange {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn universe() -> Self {
        Self {
            segments: vec![Segment::universe()],
        }
    }

    pub fn from_segment(segment: Segment) -> Self {
        Self {
            segments: vec![segment],
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut all: Vec<Segment> = self
            .segments
            .iter()
            .chain(other.segments.iter())
            .copied()
            .collect();
        all.sort_by(|a, b| cmp_from(&a.from, &b.from).then_with(|| cmp_to(&a.to, &b.to)));

        let mut merged: Vec<Segment> = Vec::new();
        for seg in all {
            match merged.last_mut() {
                Some(last) if last.merges_with(&seg) => {
                    // More-inclusive upper boundary wins.
                    if cmp_to(&seg.to, &last.to) == Ordering::Greater {
                        last.to = seg.to;
                    }
                }
                _ => merged.push(seg),
            }
        }
        Self { segments: merged }
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.segments.len() && j < other.segments.len() {
            let a = &self.segments[i];
            let b = &other.segments[j];

            // Less-inclusive boundary wins on both ends.
            let from = if cmp_from(&a.from, &b.from) == Ordering::Greater {
                a.from
            } else {
                b.from
            };
            let to = if cmp_to(&a.to, &b.to) == Ordering::Less {
                a.to
            } else {
                b.to
            };
            let non_empty = from.val < to.val
                || (from.val == to.val
                    && from.kind == BoundaryKind::Closed
                    && to.kind == BoundaryKind::Closed);
            if non_empty {
                out.push(Segment { from, to });
            }

            if cmp_to(&a.to, &b.to) == Ordering::Less {
                i += 1;
            } else {
                j += 1;
            }
        }
        Self { segments: out }
    }

    /// Complement with respect to `(-inf, +inf)`.
    pub fn complement(&self) -> Self {
        let mut out = Vec::new();
        let mut cursor = Boundary::open(f64::NEG_INFINITY);
        for seg in &self.segments {
            let upper = seg.from.inverted();
            if gap_non_empty(&cursor, &upper) {
                out.push(Segment {
                    from: cursor,
                    to: upper,
                });
            }
            cursor = seg.to.inverted();
        }
        let tail = Boundary::open(f64::INFINITY);
        if gap_non_empty(&cursor, &tail) {
            out.push(Segment {
                from: cursor,
                to: tail,
            });
        }
        Self { segments: out }
    }

    pub fn difference(&self, other: &Self) -> Self {
        self.intersect(&other.complement())
    }

    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.intersect(other) == *self
    }

    /// Derive the admissible range of `field` from a boolean predicate.
    ///
    /// AND intersects, OR unions, NOT complements; comparisons against a
    /// number literal produce canonical segments whichever side the field
    /// is on, so normalized and raw forms derive equal ranges.
    pub fn from_expression(expr: &Expression, field: &str) -> Result<Self, RefinementError> {
        match expr {
            Expression::BooleanLiteral { value } => Ok(if *value {
                Self::universe()
            } else {
                Self::empty()
            }),
            Expression::Unary {
                op: UnaryOp::Not,
                operand,
                ..
            } => Ok(Self::from_expression(operand, field)?.complement()),
            Expression::Binary {
                op: BinaryOp::And,
                left,
                right,
                ..
            } => Ok(Self::from_expression(left, field)?
                .intersect(&Self::from_expression(right, field)?)),
            Expression::Binary {
                op: BinaryOp::Or,
                left,
                right,
                ..
            } => {
                Ok(Self::from_expression(left, field)?
                    .union(&Self::from_expression(right, field)?))
            }
            Expression::Binary {
                op, left, right, ..
            } if op.is_comparison() => {
                let (op, constant) = match (left.as_ref(), right.as_ref()) {
                    (
                        Expression::Field { name, .. },
                        Expression::NumberLiteral { value },
                    ) if name == field => (*op, *value),
                    (
                        Expression::NumberLiteral { value },
                        Expression::Field { name, .. },
                    ) if name == field => (op.flipped(), *value),
                    _ => {
                        return Err(RefinementError::Unrepresentable {
                            detail: format!(
                                "comparison does not relate `{field}` to a number literal"
                            ),
                        })
                    }
                };
                Self::from_comparison(op, constant)
            }
            _ => Err(RefinementError::Unrepresentable {
                detail: "expression is not a univariate numeric predicate".to_string(),
            }),
        }
    }

    fn from_comparison(op: BinaryOp, constant: f64) -> Result<Self, RefinementError> {
        let segment = |from, to| Segment::new(from, to).map(Self::from_segment);
        match op {
            BinaryOp::LessThan => segment(
                Boundary::open(f64::NEG_INFINITY),
                Boundary::open(constant),
            ),
            BinaryOp::LessThanOrEqual => segment(
                Boundary::open(f64::NEG_INFINITY),
                Boundary::closed(constant),
            ),
            BinaryOp::GreaterThan => {
                segment(Boundary::open(constant), Boundary::open(f64::INFINITY))
            }
            BinaryOp::GreaterThanOrEqual => {
                segment(Boundary::closed(constant), Boundary::open(f64::INFINITY))
            }
            BinaryOp::Equal => Ok(Self::from_segment(Segment::point(constant)?)),
            BinaryOp::NotEqual => {
                Ok(Self::from_segment(Segment::point(constant)?).complement())
            }
            other => Err(RefinementError::Unrepresentable {
                detail: format!("operator {} has no range form", other.as_str()),
            }),
        }
    }
}

fn gap_non_empty(from: &Boundary, to: &Boundary) -> bool {
    from.val < to.val
        || (from.val == to.val
            && from.kind == BoundaryKind::Closed
            && to.kind == BoundaryKind::Closed)
}
