//! Engine-neutral result rows and typed value extraction.
//!
//! Drivers decode every column into a `sea_query::Value`, so parsers read rows the same way
//! whether they come from PostgreSQL or the scripted test driver.
//!
//! ```rust
//! use seedkeeper::row::{Row, ValueExtractionError};
//! use sea_query::Value;
//!
//! let row = Row::from_pairs([("id", Value::BigInt(Some(7))), ("name", Value::String(None))]);
//! let id: i64 = row.try_get("id").unwrap();
//! assert_eq!(id, 7);
//! assert_eq!(row.try_get_opt::<String, _>("name"), Ok(None));
//! assert!(matches!(row.try_get::<String, _>("name"), Err(ValueExtractionError::NullValue)));
//! ```

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_query::Value;
use std::sync::Arc;

/// Error type for value extraction failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueExtractionError {
    /// The value is null (None variant)
    NullValue,
    /// The value type doesn't match the expected type
    TypeMismatch { expected: String, actual: String },
    /// Value conversion failed (e.g., overflow)
    ConversionError(String),
    /// No column with this name or index
    MissingColumn(String),
}

impl std::fmt::Display for ValueExtractionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueExtractionError::NullValue => write!(f, "Value is null"),
            ValueExtractionError::TypeMismatch { expected, actual } => {
                write!(f, "Type mismatch: expected {expected}, got {actual}")
            }
            ValueExtractionError::ConversionError(msg) => write!(f, "Conversion error: {msg}"),
            ValueExtractionError::MissingColumn(column) => write!(f, "No such column: {column}"),
        }
    }
}

impl std::error::Error for ValueExtractionError {}

/// Safe extraction of a Rust value from a `sea_query::Value`.
pub trait TryGetable: Sized {
    /// Returns `NullValue` for SQL NULL and `TypeMismatch` for another variant.
    fn try_get(value: &Value) -> Result<Self, ValueExtractionError>;

    fn try_get_opt(value: &Value) -> Result<Option<Self>, ValueExtractionError> {
        match Self::try_get(value) {
            Ok(v) => Ok(Some(v)),
            Err(ValueExtractionError::NullValue) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn mismatch(expected: &str, value: &Value) -> ValueExtractionError {
    ValueExtractionError::TypeMismatch {
        expected: expected.to_string(),
        actual: format!("{value:?}"),
    }
}

macro_rules! impl_try_getable {
    ($type:ty, $expected:expr, $($variant:ident),+) => {
        impl TryGetable for $type {
            fn try_get(value: &Value) -> Result<Self, ValueExtractionError> {
                match value {
                    $(
                        Value::$variant(Some(v)) => Ok(<$type>::from(v.clone())),
                        Value::$variant(None) => Err(ValueExtractionError::NullValue),
                    )+
                    _ => Err(mismatch($expected, value)),
                }
            }
        }
    };
}

impl_try_getable!(i32, "Int", Int, SmallInt, TinyInt);
impl_try_getable!(i64, "BigInt", BigInt, Int, SmallInt, TinyInt);
impl_try_getable!(bool, "Bool", Bool);
impl_try_getable!(String, "String", String);

impl TryGetable for f64 {
    fn try_get(value: &Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::Double(Some(v)) => Ok(*v),
            Value::Float(Some(v)) => Ok(f64::from(*v)),
            Value::Decimal(Some(d)) => d.to_f64().ok_or_else(|| {
                ValueExtractionError::ConversionError(format!("{d} does not fit in f64"))
            }),
            Value::Double(None) | Value::Float(None) | Value::Decimal(None) => {
                Err(ValueExtractionError::NullValue)
            }
            _ => Err(mismatch("Double", value)),
        }
    }
}

impl TryGetable for Decimal {
    fn try_get(value: &Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::Decimal(Some(d)) => Ok(copied::<Decimal>(d)),
            Value::Decimal(None) => Err(ValueExtractionError::NullValue),
            _ => Err(mismatch("Decimal", value)),
        }
    }
}

// Deref coercion keeps these independent of whether the variant boxes its payload.
pub(crate) fn copied<T: Copy>(v: &T) -> T {
    *v
}

impl TryGetable for NaiveDate {
    fn try_get(value: &Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::ChronoDate(Some(d)) => Ok(copied::<NaiveDate>(d)),
            Value::ChronoDate(None) => Err(ValueExtractionError::NullValue),
            _ => Err(mismatch("ChronoDate", value)),
        }
    }
}

impl TryGetable for NaiveDateTime {
    fn try_get(value: &Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::ChronoDateTime(Some(d)) => Ok(copied::<NaiveDateTime>(d)),
            Value::ChronoDateTime(None) => Err(ValueExtractionError::NullValue),
            _ => Err(mismatch("ChronoDateTime", value)),
        }
    }
}

/// Column selector: a 0-based index or a column name.
pub trait RowIndex {
    fn index_in(&self, row: &Row) -> Option<usize>;

    fn describe(&self) -> String;
}

impl RowIndex for usize {
    fn index_in(&self, row: &Row) -> Option<usize> {
        (*self < row.len()).then_some(*self)
    }

    fn describe(&self) -> String {
        format!("#{self}")
    }
}

impl RowIndex for &str {
    fn index_in(&self, row: &Row) -> Option<usize> {
        row.columns
            .iter()
            .position(|c| c == self)
            .or_else(|| row.columns.iter().position(|c| c.eq_ignore_ascii_case(self)))
    }

    fn describe(&self) -> String {
        (*self).to_string()
    }
}

/// One decoded result row. Column names are shared by every row of a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(c, v)| (c.into(), v)).unzip();
        Self::new(Arc::new(columns), values)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        column.index_in(self).is_some()
    }

    /// # Errors
    ///
    /// Returns [`ValueExtractionError::MissingColumn`] for an unknown selector.
    pub fn value<I: RowIndex>(&self, index: I) -> Result<&Value, ValueExtractionError> {
        index
            .index_in(self)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| ValueExtractionError::MissingColumn(index.describe()))
    }

    /// # Errors
    ///
    /// Fails for an unknown column, SQL NULL, or a value of another type.
    pub fn try_get<T: TryGetable, I: RowIndex>(&self, index: I) -> Result<T, ValueExtractionError> {
        T::try_get(self.value(index)?)
    }

    /// Like [`Row::try_get`] but SQL NULL reads as `None`.
    ///
    /// # Errors
    ///
    /// Fails for an unknown column or a value of another type.
    pub fn try_get_opt<T: TryGetable, I: RowIndex>(
        &self,
        index: I,
    ) -> Result<Option<T>, ValueExtractionError> {
        T::try_get_opt(self.value(index)?)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Removes `column` from the row, returning the remaining row and the removed value.
    pub fn split_column(self, column: &str) -> (Row, Option<Value>) {
        let Some(at) = column.index_in(&self) else {
            return (self, None);
        };
        let mut columns = Vec::clone(&self.columns);
        columns.remove(at);
        let mut values = self.values;
        let removed = values.remove(at);
        (Row::new(Arc::new(columns), values), Some(removed))
    }
}
