use crate::error::QueryError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// `Table.column` reference; the column part must itself be whitelisted.
static QUALIFIED_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\.([A-Za-z_][A-Za-z0-9_]*)$")
        .unwrap_or_else(|e| panic!("qualified column pattern: {e}"))
});

/// Columns a caller lets filters and sorts refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnWhitelist {
    columns: HashSet<String>,
}

impl ColumnWhitelist {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    /// Accepts an exact entry or `Table.column` with a whitelisted `column`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidColumn`] for anything else.
    pub fn check(&self, column: &str) -> Result<(), QueryError> {
        let column = column.trim();
        if self.contains(column) {
            return Ok(());
        }
        let qualified = QUALIFIED_COLUMN
            .captures(column)
            .and_then(|caps| caps.get(1))
            .is_some_and(|name| self.contains(name.as_str()));
        if qualified {
            Ok(())
        } else {
            Err(QueryError::InvalidColumn(column.to_string()))
        }
    }

    /// Resolves the ORDER BY columns: `fallback` when empty, otherwise each comma-separated
    /// entry must pass [`ColumnWhitelist::check`]. An empty result means no ordering.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidColumn`] naming the first rejected entry.
    pub fn check_sort(&self, column: Option<&str>, fallback: &str) -> Result<Vec<String>, QueryError> {
        let column = column.map(str::trim).unwrap_or_default();
        if column.is_empty() {
            return Ok(fallback
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect());
        }
        let parts: Vec<&str> = column.split(',').map(str::trim).collect();
        for part in &parts {
            if part.is_empty() {
                return Err(QueryError::InvalidColumn(column.to_string()));
            }
            self.check(part)?;
        }
        Ok(parts.into_iter().map(str::to_string).collect())
    }
}

impl<S: Into<String>> FromIterator<S> for ColumnWhitelist {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}
