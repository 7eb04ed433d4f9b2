//! Parameter binder.
//!
//! Values travel as `sea_query::Value`, whose variants already carry a typed NULL
//! (`Value::Int(None)`, `Value::ChronoDate(None)`, ...). A [`Param`] pairs a value with the
//! declared [`SqlType`] it must bind as, and [`BoundParams`] is the explicit, ordered list the
//! executor binds in one pass: static template parameters and compiled filter values in the
//! exact order their `?` placeholders appear.

use crate::error::QueryError;
use chrono::{NaiveDate, NaiveDateTime};
use sea_query::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Integer,
    Long,
    Double,
    String,
    Date,
    Timestamp,
    Boolean,
}

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

impl SqlType {
    /// SQL NULL of this declared type.
    pub fn null(self) -> Value {
        match self {
            SqlType::Integer => Value::Int(None),
            SqlType::Long => Value::BigInt(None),
            SqlType::Double => Value::Double(None),
            SqlType::String => Value::String(None),
            SqlType::Date => Value::ChronoDate(None),
            SqlType::Timestamp => Value::ChronoDateTime(None),
            SqlType::Boolean => Value::Bool(None),
        }
    }

    /// Coerce a raw filter string into a value of this type.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidArgument`] when `raw` does not parse.
    pub fn coerce(self, raw: &str) -> Result<Value, QueryError> {
        let raw = raw.trim();
        let invalid = || {
            QueryError::InvalidArgument(format!("The value '{raw}' is not a valid {self}"))
        };
        let value = match self {
            SqlType::Integer => Value::from(raw.parse::<i32>().map_err(|_| invalid())?),
            SqlType::Long => Value::from(raw.parse::<i64>().map_err(|_| invalid())?),
            SqlType::Double => {
                let parsed = raw.parse::<f64>().map_err(|_| invalid())?;
                if !parsed.is_finite() {
                    return Err(invalid());
                }
                Value::from(parsed)
            }
            SqlType::String => Value::from(raw.to_string()),
            SqlType::Date => {
                Value::from(NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| invalid())?)
            }
            SqlType::Timestamp => {
                let parsed = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
                    .or_else(|_| {
                        NaiveDate::parse_from_str(raw, DATE_FORMAT)
                            .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
                    })
                    .map_err(|_| invalid())?;
                Value::from(parsed)
            }
            SqlType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" => Value::from(true),
                "false" | "0" => Value::from(false),
                _ => return Err(invalid()),
            },
        };
        Ok(value)
    }

    /// Declared type a value binds as, or `None` for variants this layer does not bind.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Int(_) => Some(SqlType::Integer),
            Value::BigInt(_) => Some(SqlType::Long),
            Value::Double(_) => Some(SqlType::Double),
            Value::String(_) => Some(SqlType::String),
            Value::ChronoDate(_) => Some(SqlType::Date),
            Value::ChronoDateTime(_) => Some(SqlType::Timestamp),
            Value::Bool(_) => Some(SqlType::Boolean),
            _ => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, SqlType::Integer | SqlType::Long | SqlType::Double)
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlType::Integer => "integer",
            SqlType::Long => "long",
            SqlType::Double => "double",
            SqlType::String => "string",
            SqlType::Date => "date (yyyy-MM-dd)",
            SqlType::Timestamp => "timestamp",
            SqlType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// One value to bind, with the declared type it binds as.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    value: Value,
    ty: SqlType,
}

impl Param {
    /// Pairs `value` with `ty`. A NULL of another type is rebound as a NULL of `ty`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidArgument`] when a non-null value is of another type.
    pub fn new(value: Value, ty: SqlType) -> Result<Self, QueryError> {
        match SqlType::of(&value) {
            Some(actual) if actual == ty => Ok(Self { value, ty }),
            _ if is_null(&value) => Ok(Self::null(ty)),
            actual => Err(QueryError::InvalidArgument(format!(
                "cannot bind {value:?} ({}) as {ty}",
                actual.map_or_else(|| "unsupported".to_string(), |t| t.to_string())
            ))),
        }
    }

    /// Declared type taken from the value's own variant.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidArgument`] for variants this layer does not bind.
    pub fn infer(value: Value) -> Result<Self, QueryError> {
        let ty = SqlType::of(&value).ok_or_else(|| {
            QueryError::InvalidArgument(format!("unsupported parameter value {value:?}"))
        })?;
        Ok(Self { value, ty })
    }

    pub fn null(ty: SqlType) -> Self {
        Self {
            value: ty.null(),
            ty,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn sql_type(&self) -> SqlType {
        self.ty
    }

    pub fn is_null(&self) -> bool {
        is_null(&self.value)
    }
}

macro_rules! impl_param_from {
    ($($t:ty => $ty:expr),* $(,)?) => {
        $(
            impl From<$t> for Param {
                fn from(v: $t) -> Self {
                    Param { value: Value::from(v), ty: $ty }
                }
            }

            impl From<Option<$t>> for Param {
                fn from(v: Option<$t>) -> Self {
                    match v {
                        Some(v) => Param::from(v),
                        None => Param::null($ty),
                    }
                }
            }
        )*
    };
}

impl_param_from!(
    i32 => SqlType::Integer,
    i64 => SqlType::Long,
    f64 => SqlType::Double,
    String => SqlType::String,
    bool => SqlType::Boolean,
    NaiveDate => SqlType::Date,
    NaiveDateTime => SqlType::Timestamp,
);

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::from(v.to_string())
    }
}

pub(crate) fn is_null(value: &Value) -> bool {
    matches!(
        value,
        Value::Bool(None)
            | Value::TinyInt(None)
            | Value::SmallInt(None)
            | Value::Int(None)
            | Value::BigInt(None)
            | Value::Float(None)
            | Value::Double(None)
            | Value::String(None)
            | Value::ChronoDate(None)
            | Value::ChronoDateTime(None)
            | Value::Decimal(None)
            | Value::Json(None)
    )
}

/// Ordered `(value, declared type)` list bound positionally, 1-based, in one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundParams {
    params: Vec<Param>,
}

impl BoundParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, param: impl Into<Param>) -> &mut Self {
        self.params.push(param.into());
        self
    }

    /// Inserts `params` so the first of them binds at 1-based `position`.
    pub fn splice_at(&mut self, position: usize, params: impl IntoIterator<Item = Param>) {
        let at = position.saturating_sub(1).min(self.params.len());
        self.params.splice(at..at, params);
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    /// Values in binding order, as handed to the driver.
    pub fn values(&self) -> Vec<Value> {
        self.params.iter().map(|p| p.value.clone()).collect()
    }

    pub fn types(&self) -> Vec<SqlType> {
        self.params.iter().map(|p| p.ty).collect()
    }
}

impl FromIterator<Param> for BoundParams {
    fn from_iter<I: IntoIterator<Item = Param>>(iter: I) -> Self {
        Self {
            params: iter.into_iter().collect(),
        }
    }
}

impl Extend<Param> for BoundParams {
    fn extend<I: IntoIterator<Item = Param>>(&mut self, iter: I) {
        self.params.extend(iter);
    }
}

/// Positional slots of one prepared statement.
///
/// Slots are 1-based like the engine's placeholders; every slot must be filled before
/// execution.
#[derive(Debug, Clone)]
pub struct ParamSlots {
    slots: Vec<Option<Param>>,
}

impl ParamSlots {
    pub fn new(placeholders: usize) -> Self {
        Self {
            slots: vec![None; placeholders],
        }
    }

    /// Binds `value` as `ty` at 1-based `index`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidArgument`] for an index outside the statement's
    /// placeholders or a value that does not bind as `ty`.
    pub fn bind(&mut self, index: usize, value: Value, ty: SqlType) -> Result<(), QueryError> {
        let count = self.slots.len();
        let slot = index
            .checked_sub(1)
            .and_then(|i| self.slots.get_mut(i))
            .ok_or_else(|| {
                QueryError::InvalidArgument(format!(
                    "parameter index {index} out of range (statement has {count} placeholders)"
                ))
            })?;
        *slot = Some(Param::new(value, ty)?);
        Ok(())
    }

    /// Binds every parameter in order, starting at slot 1.
    ///
    /// # Errors
    ///
    /// Fails when the list is longer than the statement's placeholders.
    pub fn bind_all(&mut self, params: &BoundParams) -> Result<(), QueryError> {
        for (i, param) in params.iter().enumerate() {
            self.bind(i + 1, param.value.clone(), param.ty)?;
        }
        Ok(())
    }

    /// Values in slot order.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidArgument`] naming the first unbound slot.
    pub fn values(&self) -> Result<Vec<Value>, QueryError> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.as_ref().map(|p| p.value.clone()).ok_or_else(|| {
                    QueryError::InvalidArgument(format!("parameter {} was never bound", i + 1))
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
