//! Error taxonomy for the query layer.
//!
//! Two levels exist:
//! - [`DriverError`] is what an engine driver reports (open, prepare, execute, fetch, close).
//! - [`QueryError`] is what callers see. The lifecycle manager maps a driver failure into the
//!   family matching the step that failed.
//!
//! Compile-time failures (`InvalidColumn`, `InvalidFilter`, `InvalidArgument`) are raised before
//! any connection is opened.

use crate::diagnostics::Diagnostics;
use std::fmt;

/// Failure reported by an engine driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverError {
    message: String,
    sql_state: Option<String>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
        }
    }

    pub fn with_sql_state(message: impl Into<String>, sql_state: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: Some(sql_state.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Five character SQLSTATE code, when the engine supplied one.
    pub fn sql_state(&self) -> Option<&str> {
        self.sql_state.as_deref()
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql_state {
            Some(state) => write!(f, "{} (SQLSTATE {})", self.message, state),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<may_postgres::Error> for DriverError {
    fn from(err: may_postgres::Error) -> Self {
        match err.code() {
            Some(state) => DriverError::with_sql_state(err.to_string(), state.code()),
            None => DriverError::new(err.to_string()),
        }
    }
}

/// Error type returned by every public operation of the query layer.
#[derive(Debug)]
pub enum QueryError {
    /// A filter or sort column is not whitelisted
    InvalidColumn(String),
    /// Operator/value arity mismatch, empty value or malformed logical-operator count
    InvalidFilter(String),
    /// A value does not parse as the declared type the operator requires
    InvalidArgument(String),
    /// No connection could be opened (or no permit became free in time)
    DatabaseUnavailable(DriverError),
    /// The engine rejected the statement at prepare time
    QueryCompilation {
        cause: DriverError,
        diagnostics: Diagnostics,
    },
    /// The engine rejected execution, or a fetch failed mid-stream
    DatabaseExecution {
        cause: DriverError,
        diagnostics: Diagnostics,
    },
    /// A row could not be hydrated into its domain object
    Parse {
        message: String,
        diagnostics: Diagnostics,
    },
    /// Raised by the session collaborator before anything is compiled
    SessionInvalid(String),
}

impl QueryError {
    /// Diagnostics gathered before the failure, when the failure happened after compilation.
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            QueryError::QueryCompilation { diagnostics, .. }
            | QueryError::DatabaseExecution { diagnostics, .. }
            | QueryError::Parse { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    /// `true` for the failures that never reach the engine.
    pub fn is_compile_time(&self) -> bool {
        matches!(
            self,
            QueryError::InvalidColumn(_)
                | QueryError::InvalidFilter(_)
                | QueryError::InvalidArgument(_)
                | QueryError::SessionInvalid(_)
        )
    }

    pub(crate) fn execution(cause: DriverError, diagnostics: &Diagnostics) -> Self {
        QueryError::DatabaseExecution {
            cause,
            diagnostics: diagnostics.clone(),
        }
    }

    pub(crate) fn compilation(cause: DriverError, diagnostics: &Diagnostics) -> Self {
        QueryError::QueryCompilation {
            cause,
            diagnostics: diagnostics.clone(),
        }
    }

    pub(crate) fn parse(message: impl Into<String>, diagnostics: &Diagnostics) -> Self {
        QueryError::Parse {
            message: message.into(),
            diagnostics: diagnostics.clone(),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::InvalidColumn(column) => write!(f, "Invalid column: {column}"),
            QueryError::InvalidFilter(msg) => write!(f, "Invalid filter: {msg}"),
            QueryError::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            QueryError::DatabaseUnavailable(cause) => {
                write!(f, "Database unavailable: {cause}")
            }
            QueryError::QueryCompilation { cause, .. } => {
                write!(f, "Query compilation error: {cause}")
            }
            QueryError::DatabaseExecution { cause, .. } => {
                write!(f, "Database execution error: {cause}")
            }
            QueryError::Parse { message, .. } => write!(f, "Parse error: {message}"),
            QueryError::SessionInvalid(msg) => write!(f, "Invalid session: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueryError::DatabaseUnavailable(cause)
            | QueryError::QueryCompilation { cause, .. }
            | QueryError::DatabaseExecution { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_display() {
        let err = QueryError::InvalidColumn("nonexistent_col".to_string());
        assert_eq!(err.to_string(), "Invalid column: nonexistent_col");

        let err = QueryError::DatabaseUnavailable(DriverError::new("connection refused"));
        assert!(err.to_string().contains("Database unavailable"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_driver_error_sql_state() {
        let err = DriverError::with_sql_state("syntax error at or near \"FORM\"", "42601");
        assert_eq!(err.sql_state(), Some("42601"));
        assert!(err.to_string().ends_with("(SQLSTATE 42601)"));
        assert_eq!(DriverError::new("boom").sql_state(), None);
    }

    #[test]
    fn test_compile_time_classification() {
        assert!(QueryError::InvalidFilter("x".into()).is_compile_time());
        assert!(QueryError::SessionInvalid("expired".into()).is_compile_time());
        let diagnostics = Diagnostics::disabled();
        let err = QueryError::execution(DriverError::new("lost"), &diagnostics);
        assert!(!err.is_compile_time());
        assert!(err.diagnostics().is_some());
    }

    #[test]
    fn test_execution_error_keeps_partial_diagnostics() {
        let mut diagnostics = Diagnostics::enabled();
        diagnostics.add("SELECT 1");
        let err = QueryError::execution(DriverError::new("lost"), &diagnostics);
        let carried = err.diagnostics().expect("diagnostics attached");
        assert_eq!(carried.entries(), ["SELECT 1".to_string()]);
        assert!(std::error::Error::source(&err).is_some());
    }
}
