//! Typed refinement expression tree.
//!
//! Every node carries a statically derived evaluation type; construction
//! fails when operand types do not match the operator's signature.
//! Normalization constant-folds literal subtrees, canonicalizes
//! comparisons so the field lands on the left, and applies the boolean
//! identity laws.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::RefinementError;
use crate::schema::SchemaValue;

/// Type environment for field lookups at construction time.
pub type TypeEnv = BTreeMap<String, EvalType>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalType {
    Number,
    Boolean,
    Text,
}

impl EvalType {
    pub fn as_str(self) -> &'static str {
        match self {
            EvalType::Number => "number",
            EvalType::Boolean => "boolean",
            EvalType::Text => "text",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    And,
    Or,
    LessThan,
    GreaterThan,
    LessThanOrEqual,
    GreaterThanOrEqual,
    Equal,
    NotEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::LessThan => "<",
            BinaryOp::GreaterThan => ">",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::LessThan
                | BinaryOp::GreaterThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThanOrEqual
                | BinaryOp::Equal
                | BinaryOp::NotEqual
        )
    }

    /// The operator after swapping operand sides.
    pub fn flipped(self) -> Self {
        match self {
            BinaryOp::LessThan => BinaryOp::GreaterThan,
            BinaryOp::GreaterThan => BinaryOp::LessThan,
            BinaryOp::LessThanOrEqual => BinaryOp::GreaterThanOrEqual,
            BinaryOp::GreaterThanOrEqual => BinaryOp::LessThanOrEqual,
            other => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Negate,
}

impl UnaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryOp::Not => "not",
            UnaryOp::Negate => "neg",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Expression {
    NumberLiteral {
        value: f64,
    },
    BooleanLiteral {
        value: bool,
    },
    TextLiteral {
        value: String,
    },
    Field {
        name: String,
        eval_type: EvalType,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
        eval_type: EvalType,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
        eval_type: EvalType,
    },
}

impl Expression {
    pub fn number(value: f64) -> Self {
        Expression::NumberLiteral { value }
    }

    pub fn boolean(value: bool) -> Self {
        Expression::BooleanLiteral { value }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Expression::TextLiteral {
            value: value.into(),
        }
    }

    /// Field reference; the type comes from the environment.
    pub fn field(name: impl Into<String>, env: &TypeEnv) -> Result<Self, RefinementError> {
        let name = name.into();
        let eval_type = *env
            .get(&name)
            .ok_or_else(|| RefinementError::UnknownField { name: name.clone() })?;
        Ok(Expression::Field { name, eval_type })
    }

    pub fn binary(
        op: BinaryOp,
        left: Expression,
        right: Expression,
    ) -> Result<Self, RefinementError> {
        let lt = left.eval_type();
        let rt = right.eval_type();
        let eval_type = match op {
            BinaryOp::And | BinaryOp::Or => {
                require(op, lt == EvalType::Boolean && rt == EvalType::Boolean, "boolean", lt, rt)?;
                EvalType::Boolean
            }
            BinaryOp::LessThan
            | BinaryOp::GreaterThan
            | BinaryOp::LessThanOrEqual
            | BinaryOp::GreaterThanOrEqual => {
                require(op, lt == EvalType::Number && rt == EvalType::Number, "number", lt, rt)?;
                EvalType::Boolean
            }
            BinaryOp::Equal | BinaryOp::NotEqual => {
                require(op, lt == rt, "same-type", lt, rt)?;
                EvalType::Boolean
            }
            BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide => {
                require(op, lt == EvalType::Number && rt == EvalType::Number, "number", lt, rt)?;
                EvalType::Number
            }
        };
        Ok(Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            eval_type,
        })
    }

    pub fn unary(op: UnaryOp, operand: Expression) -> Result<Self, RefinementError> {
        let ot = operand.eval_type();
        let eval_type = match op {
            UnaryOp::Not => {
                if ot != EvalType::Boolean {
                    return Err(RefinementError::TypeMismatch {
                        op: op.as_str(),
                        expected: "boolean",
                        found: ot.as_str().to_string(),
                    });
                }
                EvalType::Boolean
            }
            UnaryOp::Negate => {
                if ot != EvalType::Number {
                    return Err(RefinementError::TypeMismatch {
                        op: op.as_str(),
                        expected: "number",
                        found: ot.as_str().to_string(),
                    });
                }
                EvalType::Number
            }
        };
        Ok(Expression::Unary {
            op,
            operand: Box::new(operand),
            eval_type,
        })
    }

    pub fn eval_type(&self) -> EvalType {
        match self {
            Expression::NumberLiteral { .. } => EvalType::Number,
            Expression::BooleanLiteral { .. } => EvalType::Boolean,
            Expression::TextLiteral { .. } => EvalType::Text,
            Expression::Field { eval_type, .. }
            | Expression::Binary { eval_type, .. }
            | Expression::Unary { eval_type, .. } => *eval_type,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Expression::NumberLiteral { .. }
                | Expression::BooleanLiteral { .. }
                | Expression::TextLiteral { .. }
        )
    }

    fn as_literal(&self) -> Option<SchemaValue> {
        match self {
            Expression::NumberLiteral { value } => Some(SchemaValue::Number(*value)),
            Expression::BooleanLiteral { value } => Some(SchemaValue::Boolean(*value)),
            Expression::TextLiteral { value } => Some(SchemaValue::Text(value.clone())),
            _ => None,
        }
    }

    fn from_literal(value: SchemaValue) -> Self {
        match value {
            SchemaValue::Number(n) => Expression::number(n),
            SchemaValue::Boolean(b) => Expression::boolean(b),
            SchemaValue::Text(t) => Expression::text(t),
        }
    }

    /// Idempotent canonical rewrite.
    ///
    /// 1. Constant-folds pure-literal subtrees.
    /// 2. Puts the field on the left of comparisons, flipping the operator.
    /// 3. Applies identity laws: `x AND true -> x`, `x AND false -> false`,
    ///    the duals for OR, and `NOT NOT x -> x`.
    pub fn normalize(self) -> Self {
        match self {
            Expression::Binary {
                op,
                left,
                right,
                eval_type,
            } => {
                let left = left.normalize();
                let right = right.normalize();

                if let (Some(l), Some(r)) = (left.as_literal(), right.as_literal()) {
                    if let Ok(value) = apply_binary(op, &l, &r) {
                        return Expression::from_literal(value);
                    }
                }

                let lit = |expr: &Expression, value| {
                    matches!(expr, Expression::BooleanLiteral { value: v } if *v == value)
                };
                match op {
                    BinaryOp::And => {
                        if lit(&left, false) || lit(&right, false) {
                            return Expression::boolean(false);
                        }
                        if lit(&left, true) {
                            return right;
                        }
                        if lit(&right, true) {
                            return left;
                        }
                    }
                    BinaryOp::Or => {
                        if lit(&left, true) || lit(&right, true) {
                            return Expression::boolean(true);
                        }
                        if lit(&left, false) {
                            return right;
                        }
                        if lit(&right, false) {
                            return left;
                        }
                    }
                    _ if op.is_comparison() => {
                        if left.is_literal() && matches!(right, Expression::Field { .. }) {
                            return Expression::Binary {
                                op: op.flipped(),
                                left: Box::new(right),
                                right: Box::new(left),
                                eval_type,
                            };
                        }
                    }
                    _ => {}
                }

                Expression::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                    eval_type,
                }
            }
            Expression::Unary {
                op,
                operand,
                eval_type,
            } => {
                let operand = operand.normalize();
                if let Some(value) = operand.as_literal() {
                    if let Ok(folded) = apply_unary(op, &value) {
                        return Expression::from_literal(folded);
                    }
                }
                let operand = match (op, operand) {
                    (
                        UnaryOp::Not,
                        Expression::Unary {
                            op: UnaryOp::Not,
                            operand: inner,
                            ..
                        },
                    ) => return *inner,
                    (_, operand) => operand,
                };
                Expression::Unary {
                    op,
                    operand: Box::new(operand),
                    eval_type,
                }
            }
            other => other,
        }
    }

    /// Evaluate against a field record.
    pub fn evaluate(
        &self,
        record: &BTreeMap<String, SchemaValue>,
    ) -> Result<SchemaValue, RefinementError> {
        match self {
            Expression::NumberLiteral { value } => Ok(SchemaValue::Number(*value)),
            Expression::BooleanLiteral { value } => Ok(SchemaValue::Boolean(*value)),
            Expression::TextLiteral { value } => Ok(SchemaValue::Text(value.clone())),
            Expression::Field { name, .. } => record
                .get(name)
                .cloned()
                .ok_or_else(|| RefinementError::UnknownField { name: name.clone() }),
            Expression::Binary {
                op, left, right, ..
            } => {
                let l = left.evaluate(record)?;
                let r = right.evaluate(record)?;
                apply_binary(*op, &l, &r)
            }
            Expression::Unary { op, operand, .. } => {
                let value = operand.evaluate(record)?;
                apply_unary(*op, &value)
            }
        }
    }

    /// Evaluate as a predicate; a non-boolean result is an error.
    pub fn validate_data(
        &self,
        record: &BTreeMap<String, SchemaValue>,
    ) -> Result<bool, RefinementError> {
        match self.evaluate(record)? {
            SchemaValue::Boolean(value) => Ok(value),
            other => Err(RefinementError::NonBooleanResult {
                found: format!("{other:?}"),
            }),
        }
    }
}

fn require(
    op: BinaryOp,
    ok: bool,
    expected: &'static str,
    lt: EvalType,
    rt: EvalType,
) -> Result<(), RefinementError> {
    if ok {
        Ok(())
    } else {
        Err(RefinementError::TypeMismatch {
            op: op.as_str(),
            expected,
            found: format!("{} and {}", lt.as_str(), rt.as_str()),
        })
    }
}

fn apply_binary(
    op: BinaryOp,
    left: &SchemaValue,
    right: &SchemaValue,
) -> Result<SchemaValue, RefinementError> {
    use SchemaValue::{Boolean, Number, Text};
    let mismatch = || RefinementError::TypeMismatch {
        op: op.as_str(),
        expected: "matching operand types",
        found: format!("{left:?} and {right:?}"),
    };
    match op {
        BinaryOp::And => match (left, right) {
            (Boolean(l), Boolean(r)) => Ok(Boolean(*l && *r)),
            _ => Err(mismatch()),
        },
        BinaryOp::Or => match (left, right) {
            (Boolean(l), Boolean(r)) => Ok(Boolean(*l || *r)),
            _ => Err(mismatch()),
        },
        BinaryOp::LessThan => numeric(left, right, mismatch).map(|(l, r)| Boolean(l < r)),
        BinaryOp::GreaterThan => numeric(left, right, mismatch).map(|(l, r)| Boolean(l > r)),
        BinaryOp::LessThanOrEqual => numeric(left, right, mismatch).map(|(l, r)| Boolean(l <= r)),
        BinaryOp::GreaterThanOrEqual => {
            numeric(left, right, mismatch).map(|(l, r)| Boolean(l >= r))
        }
        BinaryOp::Equal => equality(left, right).map(Boolean).ok_or_else(mismatch),
        BinaryOp::NotEqual => equality(left, right).map(|b| Boolean(!b)).ok_or_else(mismatch),
        BinaryOp::Add => numeric(left, right, mismatch).map(|(l, r)| Number(l + r)),
        BinaryOp::Subtract => numeric(left, right, mismatch).map(|(l, r)| Number(l - r)),
        BinaryOp::Multiply => numeric(left, right, mismatch).map(|(l, r)| Number(l * r)),
        BinaryOp::Divide => {
            let (l, r) = numeric(left, right, mismatch)?;
            if r == 0.0 {
                Err(RefinementError::DivisionByZero)
            } else {
                Ok(Number(l / r))
            }
        }
    }
}

fn apply_unary(op: UnaryOp, value: &SchemaValue) -> Result<SchemaValue, RefinementError> {
    match (op, value) {
        (UnaryOp::Not, SchemaValue::Boolean(b)) => Ok(SchemaValue::Boolean(!b)),
        (UnaryOp::Negate, SchemaValue::Number(n)) => Ok(SchemaValue::Number(-n)),
        _ => Err(RefinementError::TypeMismatch {
            op: op.as_str(),
            expected: match op {
                UnaryOp::Not => "boolean",
                UnaryOp::Negate => "number",
            },
            found: format!("{value:?}"),
        }),
    }
}

fn numeric(
    left: &SchemaValue,
    right: &SchemaValue,
    mismatch: impl Fn() -> RefinementError,
) -> Result<(f64, f64), RefinementError> {
    match (left, right) {
        (SchemaValue::Number(l), SchemaValue::Number(r)) => Ok((*l, *r)),
        _ => Err(mismatch()),
    }
}

fn equality(left: &SchemaValue, right: &SchemaValue) -> Option<bool> {
    use SchemaValue::{Boolean, Number, Text};
    match (left, right) {
        (Number(l), Number(r)) => Some(l == r),
        (Boolean(l), Boolean(r)) => Some(l == r),
        (Text(l), Text(r)) => Some(l == r),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> TypeEnv {
        TypeEnv::from([
            ("age".to_string(), EvalType::Number),
            ("name".to_string(), EvalType::Text),
            ("active".to_string(), EvalType::Boolean),
        ])
    }

    fn age_cmp(op: BinaryOp, value: f64) -> Expression {
        Expression::binary(op, Expression::field("age", &env()).unwrap(), Expression::number(value))
            .unwrap()
    }

    #[test]
    fn construction_rejects_type_mismatches() {
        let e = env();
        // name < 3 is ill-typed
        let err = Expression::binary(
            BinaryOp::LessThan,
            Expression::field("name", &e).unwrap(),
            Expression::number(3.0),
        )
        .unwrap_err();
        assert!(matches!(err, RefinementError::TypeMismatch { .. }));

        // age AND true is ill-typed
        assert!(Expression::binary(
            BinaryOp::And,
            Expression::field("age", &e).unwrap(),
            Expression::boolean(true),
        )
        .is_err());

        // name == age requires same-type operands
        assert!(Expression::binary(
            BinaryOp::Equal,
            Expression::field("name", &e).unwrap(),
            Expression::field("age", &e).unwrap(),
        )
        .is_err());

        // not(number), neg(text)
        assert!(Expression::unary(UnaryOp::Not, Expression::number(1.0)).is_err());
        assert!(Expression::unary(UnaryOp::Negate, Expression::text("x")).is_err());
    }

    #[test]
    fn unknown_field_rejected_at_construction() {
        let err = Expression::field("missing", &env()).unwrap_err();
        assert_eq!(
            err,
            RefinementError::UnknownField {
                name: "missing".to_string()
            }
        );
    }

    #[test]
    fn normalize_constant_folds() {
        // (2 + 3) * 4 -> 20
        let sum = Expression::binary(BinaryOp::Add, Expression::number(2.0), Expression::number(3.0))
            .unwrap();
        let product =
            Expression::binary(BinaryOp::Multiply, sum, Expression::number(4.0)).unwrap();
        assert_eq!(product.normalize(), Expression::number(20.0));
    }

    #[test]
    fn normalize_puts_field_on_left() {
        let e = env();
        // 18 <= age  ->  age >= 18
        let expr = Expression::binary(
            BinaryOp::LessThanOrEqual,
            Expression::number(18.0),
            Expression::field("age", &e).unwrap(),
        )
        .unwrap();
        let normalized = expr.normalize();
        let Expression::Binary { op, left, right, .. } = &normalized else {
            panic!("expected binary node");
        };
        assert_eq!(*op, BinaryOp::GreaterThanOrEqual);
        assert!(matches!(**left, Expression::Field { .. }));
        assert!(matches!(**right, Expression::NumberLiteral { .. }));
    }

    #[test]
    fn normalize_identity_laws() {
        let e = env();
        let active = Expression::field("active", &e).unwrap();

        let and_true =
            Expression::binary(BinaryOp::And, active.clone(), Expression::boolean(true)).unwrap();
        assert_eq!(and_true.normalize(), active);

        let and_false =
            Expression::binary(BinaryOp::And, active.clone(), Expression::boolean(false)).unwrap();
        assert_eq!(and_false.normalize(), Expression::boolean(false));

        let or_false =
            Expression::binary(BinaryOp::Or, Expression::boolean(false), active.clone()).unwrap();
        assert_eq!(or_false.normalize(), active);

        let or_true =
            Expression::binary(BinaryOp::Or, active.clone(), Expression::boolean(true)).unwrap();
        assert_eq!(or_true.normalize(), Expression::boolean(true));

        let double_not = Expression::unary(
            UnaryOp::Not,
            Expression::unary(UnaryOp::Not, active.clone()).unwrap(),
        )
        .unwrap();
        assert_eq!(double_not.normalize(), active);
    }

    #[test]
    fn normalize_is_idempotent() {
        let expr = Expression::binary(
            BinaryOp::And,
            Expression::binary(
                BinaryOp::LessThan,
                Expression::number(10.0),
                Expression::field("age", &env()).unwrap(),
            )
            .unwrap(),
            Expression::boolean(true),
        )
        .unwrap();
        let once = expr.normalize();
        assert_eq!(once.clone().normalize(), once);
    }

    #[test]
    fn validate_data_checks_predicate() {
        let expr = Expression::binary(
            BinaryOp::And,
            age_cmp(BinaryOp::GreaterThanOrEqual, 18.0),
            age_cmp(BinaryOp::LessThan, 65.0),
        )
        .unwrap();

        let adult = BTreeMap::from([("age".to_string(), SchemaValue::Number(42.0))]);
        assert!(expr.validate_data(&adult).unwrap());
        let minor = BTreeMap::from([("age".to_string(), SchemaValue::Number(12.0))]);
        assert!(!expr.validate_data(&minor).unwrap());
    }

    #[test]
    fn validate_data_rejects_non_boolean_result() {
        let expr = Expression::binary(
            BinaryOp::Add,
            Expression::field("age", &env()).unwrap(),
            Expression::number(1.0),
        )
        .unwrap();
        let record = BTreeMap::from([("age".to_string(), SchemaValue::Number(1.0))]);
        assert!(matches!(
            expr.validate_data(&record).unwrap_err(),
            RefinementError::NonBooleanResult { .. }
        ));
    }

    #[test]
    fn division_by_zero_is_an_evaluation_error() {
        let expr = Expression::binary(
            BinaryOp::Divide,
            Expression::field("age", &env()).unwrap(),
            Expression::number(0.0),
        )
        .unwrap();
        let record = BTreeMap::from([("age".to_string(), SchemaValue::Number(7.0))]);
        assert_eq!(
            expr.evaluate(&record).unwrap_err(),
            RefinementError::DivisionByZero
        );
    }

    #[test]
    fn text_equality_evaluates() {
        let expr = Expression::binary(
            BinaryOp::Equal,
            Expression::field("name", &env()).unwrap(),
            Expression::text("bob"),
        )
        .unwrap();
        let record = BTreeMap::from([("name".to_string(), SchemaValue::Text("bob".into()))]);
        assert!(expr.validate_data(&record).unwrap());
    }
}
