//! Page windows and the total-matching count.
//!
//! A page is rendered as ` ORDER BY <col> ASC|DESC LIMIT ? OFFSET ?`. The total ignoring
//! the window comes from the same execution where possible: `COUNT(*) OVER ()` is added to
//! the first `SELECT`, and window functions are evaluated before `LIMIT`. Statements where
//! that count would be wrong (`SELECT DISTINCT`) or cannot be injected (`WITH ...`) fall back
//! to a `SELECT COUNT(*)` over the unwindowed statement on the same snapshot.

use crate::binder::{BoundParams, Param};
use crate::error::QueryError;
use crate::filter::ColumnWhitelist;
use serde::{Deserialize, Serialize};

/// Column the injected window count is read from.
pub const FOUND_ROWS_COLUMN: &str = "found_rows";

/// Requested page of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub start: u64,
    /// `None` is unbounded
    pub length: Option<u64>,
    #[serde(default)]
    pub sort_column: Option<String>,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
    /// Total from an earlier request with the same filter; no count is issued when present.
    #[serde(default)]
    pub known_result_size: Option<u64>,
}

fn default_ascending() -> bool {
    true
}

impl Default for Pagination {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl Pagination {
    pub fn page(start: u64, length: u64) -> Self {
        Self {
            start,
            length: Some(length),
            sort_column: None,
            ascending: true,
            known_result_size: None,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            length: None,
            ..Self::page(0, 0)
        }
    }

    pub fn sort_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.sort_column = Some(column.into());
        self.ascending = ascending;
        self
    }

    pub fn with_known_result_size(mut self, total: u64) -> Self {
        self.known_result_size = Some(total);
        self
    }

    /// Appends the ORDER BY and window clauses to `sql` and their parameters to `params`.
    ///
    /// # Errors
    ///
    /// [`QueryError::InvalidArgument`] for a zero length or a value beyond the engine's
    /// range, [`QueryError::InvalidColumn`] for a sort column outside `sortable`.
    pub(crate) fn apply(
        &self,
        sql: &mut String,
        params: &mut BoundParams,
        sortable: &ColumnWhitelist,
        default_sort: &str,
    ) -> Result<(), QueryError> {
        // The direction applies to every sort column.
        let sort = sortable.check_sort(self.sort_column.as_deref(), default_sort)?;
        if !sort.is_empty() {
            let direction = if self.ascending { "ASC" } else { "DESC" };
            let ordered: Vec<String> = sort.iter().map(|c| format!("{c} {direction}")).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&ordered.join(", "));
        }

        let start = to_i64(self.start, "start")?;
        match self.length {
            Some(0) => {
                return Err(QueryError::InvalidArgument(
                    "page length must be positive".to_string(),
                ))
            }
            Some(length) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                params.push(Param::from(to_i64(length, "length")?));
                params.push(Param::from(start));
            }
            None => {
                sql.push_str(" OFFSET ?");
                params.push(Param::from(start));
            }
        }
        Ok(())
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64, QueryError> {
    i64::try_from(value)
        .map_err(|_| QueryError::InvalidArgument(format!("page {what} {value} is out of range")))
}

/// How the total-matching count of a page is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FoundRows {
    /// Supplied by the caller
    Known(u64),
    /// Read from the injected window column of the page
    Window,
    /// `SELECT COUNT(*)` over the unwindowed statement
    SideQuery,
}

/// Adds `COUNT(*) OVER () AS found_rows` to a statement's first `SELECT`.
///
/// Returns `None` when the statement does not start with a plain `SELECT`, or combines
/// several with `UNION`/`INTERSECT`/`EXCEPT` (the column would land in one branch only).
pub(crate) fn inject_found_rows(sql: &str) -> Option<String> {
    if has_set_operation(sql) {
        return None;
    }
    let trimmed = sql.trim_start();
    let lead = sql.len() - trimmed.len();
    let head = trimmed.get(..6)?;
    if !head.eq_ignore_ascii_case("SELECT") {
        return None;
    }
    let rest = &trimmed[6..];
    if !rest.starts_with(|c: char| c.is_whitespace()) {
        return None;
    }
    let next_word: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if next_word.eq_ignore_ascii_case("DISTINCT") {
        return None;
    }
    Some(format!(
        "{}SELECT COUNT(*) OVER () AS {FOUND_ROWS_COLUMN},{rest}",
        &sql[..lead]
    ))
}

/// `true` for a set operation outside parentheses, quoted text and comments.
fn has_set_operation(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b if b.is_ascii_alphabetic() || b == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let word = &sql[start..i];
                if depth == 0
                    && ["UNION", "INTERSECT", "EXCEPT"]
                        .iter()
                        .any(|k| word.eq_ignore_ascii_case(k))
                {
                    return true;
                }
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    false
}

/// Counts the rows `unwindowed` matches.
pub(crate) fn count_sql(unwindowed: &str) -> String {
    format!("SELECT COUNT(*) FROM ({unwindowed}) AS {FOUND_ROWS_COLUMN}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_query::Value;

    fn sortable() -> ColumnWhitelist {
        ColumnWhitelist::new(["name", "number", "acqdate"])
    }

    #[test]
    fn test_apply_page() {
        let mut sql = "SELECT * FROM germinatebase WHERE 1=1".to_string();
        let mut params = BoundParams::new();
        Pagination::page(20, 10)
            .sort_by("number", false)
            .apply(&mut sql, &mut params, &sortable(), "name")
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM germinatebase WHERE 1=1 ORDER BY number DESC LIMIT ? OFFSET ?"
        );
        assert_eq!(params.values(), vec![Value::BigInt(Some(10)), Value::BigInt(Some(20))]);
    }

    #[test]
    fn test_direction_applies_to_every_sort_column() {
        let mut sql = "SELECT * FROM germinatebase".to_string();
        Pagination::page(0, 10)
            .sort_by("number, name", false)
            .apply(&mut sql, &mut BoundParams::new(), &sortable(), "name")
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM germinatebase ORDER BY number DESC, name DESC LIMIT ? OFFSET ?"
        );

        let mut sql = "SELECT * FROM germinatebase".to_string();
        Pagination::unbounded()
            .apply(&mut sql, &mut BoundParams::new(), &sortable(), "acqdate,name")
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM germinatebase ORDER BY acqdate ASC, name ASC OFFSET ?"
        );
    }

    #[test]
    fn test_apply_unbounded_with_default_sort() {
        let mut sql = "SELECT * FROM t".to_string();
        let mut params = BoundParams::new();
        Pagination::unbounded()
            .apply(&mut sql, &mut params, &sortable(), "name")
            .unwrap();
        assert_eq!(sql, "SELECT * FROM t ORDER BY name ASC OFFSET ?");
        assert_eq!(params.len(), 1);

        let mut sql = "SELECT * FROM t".to_string();
        Pagination::page(0, 5)
            .apply(&mut sql, &mut BoundParams::new(), &sortable(), "")
            .unwrap();
        assert_eq!(sql, "SELECT * FROM t LIMIT ? OFFSET ?");
    }

    #[test]
    fn test_apply_rejects_bad_windows() {
        let mut sql = String::new();
        let err = Pagination::page(0, 0)
            .apply(&mut sql, &mut BoundParams::new(), &sortable(), "name")
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgument(_)));

        let err = Pagination::page(0, 10)
            .sort_by("name; DROP TABLE users", true)
            .apply(&mut String::new(), &mut BoundParams::new(), &sortable(), "name")
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidColumn(_)));

        let err = Pagination::page(u64::MAX, 10)
            .apply(&mut String::new(), &mut BoundParams::new(), &sortable(), "name")
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgument(_)));
    }

    #[test]
    fn test_inject_found_rows() {
        assert_eq!(
            inject_found_rows("SELECT id, name FROM t LIMIT ? OFFSET ?").unwrap(),
            "SELECT COUNT(*) OVER () AS found_rows, id, name FROM t LIMIT ? OFFSET ?"
        );
        assert_eq!(
            inject_found_rows("  select\n* FROM t").unwrap(),
            "  SELECT COUNT(*) OVER () AS found_rows,\n* FROM t"
        );
        assert!(inject_found_rows("SELECT DISTINCT name FROM t").is_none());
        assert!(inject_found_rows("select distinct(name) FROM t").is_none());
        assert!(inject_found_rows("WITH x AS (SELECT 1) SELECT * FROM x").is_none());
        assert!(inject_found_rows("SELECTED").is_none());
    }

    #[test]
    fn test_set_operations_are_not_injected() {
        assert!(inject_found_rows(
            "SELECT name FROM germinatebase WHERE 1=1 UNION SELECT name FROM synonyms ORDER BY name ASC LIMIT ? OFFSET ?"
        )
        .is_none());
        assert!(inject_found_rows("select id from a intersect select id from b").is_none());
        assert!(inject_found_rows("SELECT id FROM a EXCEPT ALL SELECT id FROM b").is_none());

        // Nested or quoted set operations leave the outer statement injectable.
        assert!(inject_found_rows(
            "SELECT * FROM (SELECT id FROM a UNION SELECT id FROM b) AS ids WHERE 1=1 LIMIT ? OFFSET ?"
        )
        .is_some());
        assert!(inject_found_rows("SELECT * FROM t WHERE note = 'a union b' -- union\n LIMIT ? OFFSET ?").is_some());
        assert!(inject_found_rows("SELECT union_id /* UNION */ FROM t").is_some());
    }

    #[test]
    fn test_count_sql() {
        assert_eq!(
            count_sql("SELECT * FROM t WHERE (a = ?)"),
            "SELECT COUNT(*) FROM (SELECT * FROM t WHERE (a = ?)) AS found_rows"
        );
    }

    #[test]
    fn test_deserialize_defaults() {
        let page: Pagination = serde_json::from_str(r#"{"start": 10, "length": 25}"#).unwrap();
        assert_eq!(page, Pagination::page(10, 25));
        let all: Pagination = serde_json::from_str(r#"{"start": 0, "length": null}"#).unwrap();
        assert_eq!(all.length, None);
    }
}
