//! Caller-composed filter expressions and their compilation into predicate SQL.
//!
//! A [`FilterExpression`] is an ordered list of [`Condition`]s with one [`LogicalOperator`]
//! between each adjacent pair. [`compile`] turns it into a [`CompiledFilter`]: a predicate
//! fragment with `?` placeholders plus the ordered, typed parameters to bind for them.
//!
//! ```
//! use seedkeeper::filter::{compile, ColumnWhitelist, Condition, FilterExpression, Operator};
//! use seedkeeper::SqlType;
//!
//! let whitelist = ColumnWhitelist::new(["status", "country"]);
//! let expr = FilterExpression::new(Condition::new("status", Operator::Equal, ["active"], SqlType::String))
//!     .and(Condition::new("country", Operator::Equal, ["DE"], SqlType::String));
//!
//! let compiled = compile(&expr, &whitelist).unwrap();
//! assert_eq!(compiled.fragment(), "(status = ?) AND (country = ?)");
//! assert_eq!(compiled.len(), 2);
//! ```

mod compiler;
mod whitelist;

pub use compiler::{compile, CompiledFilter};
pub use whitelist::ColumnWhitelist;

use crate::binder::SqlType;
use crate::error::QueryError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison applied by one condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Like,
    In,
    NotIn,
    Between,
    IsNull,
    IsNotNull,
}

/// Number of values an operator takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Zero,
    One,
    Two,
    AtLeastOne,
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Zero => count == 0,
            Arity::One => count == 1,
            Arity::Two => count == 2,
            Arity::AtLeastOne => count >= 1,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Zero => f.write_str("no values"),
            Arity::One => f.write_str("exactly one value"),
            Arity::Two => f.write_str("exactly two values"),
            Arity::AtLeastOne => f.write_str("at least one value"),
        }
    }
}

impl Operator {
    pub fn arity(self) -> Arity {
        match self {
            Operator::IsNull | Operator::IsNotNull => Arity::Zero,
            Operator::Between => Arity::Two,
            Operator::In | Operator::NotIn => Arity::AtLeastOne,
            _ => Arity::One,
        }
    }

    /// SQL comparison token for the single-value operators.
    pub(crate) fn comparison(self) -> Option<&'static str> {
        match self {
            Operator::Equal => Some("="),
            Operator::NotEqual => Some("<>"),
            Operator::LessThan => Some("<"),
            Operator::LessThanOrEqual => Some("<="),
            Operator::GreaterThan => Some(">"),
            Operator::GreaterThanOrEqual => Some(">="),
            Operator::Like => Some("LIKE"),
            _ => None,
        }
    }
}

/// Connector between two adjacent conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    And,
    Or,
}

impl LogicalOperator {
    pub fn as_sql(self) -> &'static str {
        match self {
            LogicalOperator::And => "AND",
            LogicalOperator::Or => "OR",
        }
    }
}

/// One `column operator value(s)` test. Values stay raw strings until compilation coerces
/// them to `declared_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
    pub declared_type: SqlType,
}

impl Condition {
    pub fn new<I, S>(column: impl Into<String>, operator: Operator, values: I, declared_type: SqlType) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            column: column.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
            declared_type,
        }
    }

    /// Condition for a zero-arity operator.
    pub fn unary(column: impl Into<String>, operator: Operator, declared_type: SqlType) -> Self {
        Self::new(column, operator, Vec::<String>::new(), declared_type)
    }
}

/// Conditions plus the connectors between them, consumed strictly left to right.
///
/// The constructors keep the two lists in step; [`FilterExpression::from_parts`] and
/// deserialization do not, so [`compile`] re-checks the connector count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterExpression {
    conditions: Vec<Condition>,
    #[serde(default)]
    operators: Vec<LogicalOperator>,
}

impl FilterExpression {
    pub fn new(first: Condition) -> Self {
        Self {
            conditions: vec![first],
            operators: Vec::new(),
        }
    }

    pub fn from_parts(conditions: Vec<Condition>, operators: Vec<LogicalOperator>) -> Self {
        Self {
            conditions,
            operators,
        }
    }

    /// Parses the JSON posted by a filter builder.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidFilter`] for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, QueryError> {
        serde_json::from_str(json).map_err(|e| QueryError::InvalidFilter(format!("malformed filter JSON: {e}")))
    }

    pub fn and(self, next: Condition) -> Self {
        self.then(LogicalOperator::And, next)
    }

    pub fn or(self, next: Condition) -> Self {
        self.then(LogicalOperator::Or, next)
    }

    pub fn then(mut self, connector: LogicalOperator, next: Condition) -> Self {
        self.operators.push(connector);
        self.conditions.push(next);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn operators(&self) -> &[LogicalOperator] {
        &self.operators
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}
