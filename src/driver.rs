//! Engine-facing seam.
//!
//! The lifecycle manager, executor and streaming cursor only talk to these traits. The
//! PostgreSQL implementation lives in [`crate::postgres`]; tests use the scripted
//! [`crate::mock::MockDriver`].
//!
//! Statement text always uses `?` placeholders. Drivers translate them to the engine's own
//! syntax when preparing.

use crate::error::DriverError;
use crate::row::Row;
use sea_query::Value;

/// Opens connections to one engine.
pub trait Driver: Send + Sync {
    fn connect(&self, url: &str) -> Result<Box<dyn RawConnection>, DriverError>;
}

/// One open engine session.
pub trait RawConnection: Send {
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn RawStatement>, DriverError>;

    /// Runs parameterless control statements (`BEGIN`, `COMMIT`, `CLOSE ...`).
    fn batch_execute(&mut self, sql: &str) -> Result<(), DriverError>;

    fn close(&mut self) -> Result<(), DriverError>;

    /// Must not fail, and must be safe to call after any error.
    fn is_closed(&self) -> bool;
}

/// A prepared statement owned by one connection.
pub trait RawStatement: Send {
    /// Placeholders the statement expects.
    fn param_count(&self) -> usize;

    /// Rows to buffer per round trip; zero buffers the whole result.
    fn set_fetch_size(&mut self, rows: usize);

    fn query(&mut self, params: &[Value]) -> Result<Box<dyn RowCursor>, DriverError>;

    /// Runs a write and returns the generated keys (first column of any returned rows).
    fn execute(&mut self, params: &[Value]) -> Result<Vec<i64>, DriverError>;
}

/// Forward-only rows of one execution.
pub trait RowCursor: Send {
    fn next_row(&mut self) -> Result<Option<Row>, DriverError>;

    /// Releases engine-side resources early. Exhausted cursors are already released.
    fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Buffered rows, for drivers that materialize a result client-side.
pub struct VecCursor {
    rows: std::vec::IntoIter<Row>,
}

impl VecCursor {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl RowCursor for VecCursor {
    fn next_row(&mut self) -> Result<Option<Row>, DriverError> {
        Ok(self.rows.next())
    }
}

/// Counts `?` placeholders outside quoted literals, identifiers and comments.
pub fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    scan_placeholders(sql, |_| count += 1);
    count
}

/// Rewrites `?` placeholders as `$1..$n`, leaving quoted text and comments untouched.
pub fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut last = 0;
    let mut n = 0;
    scan_placeholders(sql, |at| {
        n += 1;
        out.push_str(&sql[last..at]);
        out.push('$');
        out.push_str(&n.to_string());
        last = at + 1;
    });
    out.push_str(&sql[last..]);
    out
}

/// Calls `found` with the byte offset of every placeholder.
pub(crate) fn scan_placeholders(sql: &str, mut found: impl FnMut(usize)) {
    #[derive(PartialEq)]
    enum State {
        Code,
        Literal,
        Identifier,
        LineComment,
        BlockComment,
    }

    let bytes = sql.as_bytes();
    let mut state = State::Code;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match state {
            State::Code => match b {
                b'?' => found(i),
                b'\'' => state = State::Literal,
                b'"' => state = State::Identifier,
                b'-' if next == Some(b'-') => {
                    state = State::LineComment;
                    i += 1;
                }
                b'/' if next == Some(b'*') => {
                    state = State::BlockComment;
                    i += 1;
                }
                _ => {}
            },
            State::Literal if b == b'\'' => {
                if next == Some(b'\'') {
                    i += 1;
                } else {
                    state = State::Code;
                }
            }
            State::Identifier if b == b'"' => {
                if next == Some(b'"') {
                    i += 1;
                } else {
                    state = State::Code;
                }
            }
            State::LineComment if b == b'\n' => state = State::Code,
            State::BlockComment if b == b'*' && next == Some(b'/') => {
                state = State::Code;
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_placeholders() {
        assert_eq!(
            number_placeholders("SELECT * FROM t WHERE a = ? AND b IN (?, ?)"),
            "SELECT * FROM t WHERE a = $1 AND b IN ($2, $3)"
        );
        assert_eq!(number_placeholders("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn test_quoted_question_marks_untouched() {
        let sql = "SELECT '?', \"who?\" FROM t WHERE a = ? AND b = 'it''s ?' -- why?\n AND c = ? /* ? */";
        assert_eq!(count_placeholders(sql), 2);
        assert_eq!(
            number_placeholders(sql),
            "SELECT '?', \"who?\" FROM t WHERE a = $1 AND b = 'it''s ?' -- why?\n AND c = $2 /* ? */"
        );
    }

    #[test]
    fn test_vec_cursor_drains_in_order() {
        let mut cursor = VecCursor::new(vec![
            Row::from_pairs([("id", Value::Int(Some(1)))]),
            Row::from_pairs([("id", Value::Int(Some(2)))]),
        ]);
        assert_eq!(cursor.next_row().unwrap().unwrap().try_get::<i32, _>("id"), Ok(1));
        assert_eq!(cursor.next_row().unwrap().unwrap().try_get::<i32, _>("id"), Ok(2));
        assert!(cursor.next_row().unwrap().is_none());
        assert!(cursor.next_row().unwrap().is_none());
    }
}
