//! In-memory scripted engine.
//!
//! [`MockDriver`] records every connection, statement, parameter list and close, and
//! answers queries through a handler. [`MockDriver::with_rows`] installs a handler that
//! behaves like a table of already-filtered rows: it honours `LIMIT ? OFFSET ?`, the
//! `COUNT(*) OVER ()` found-rows column and the `SELECT COUNT(*) FROM (...)` side query.

use crate::driver::{count_placeholders, Driver, RawConnection, RawStatement, RowCursor};
use crate::error::DriverError;
use crate::row::{Row, TryGetable};
use sea_query::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

type QueryHandler = dyn Fn(&str, &[Value]) -> Result<Vec<Row>, DriverError> + Send + Sync;

/// Everything the engine was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    Connect { conn: usize, url: String },
    Prepare { conn: usize, sql: String },
    Query {
        conn: usize,
        sql: String,
        params: Vec<Value>,
        fetch_size: usize,
    },
    Execute {
        conn: usize,
        sql: String,
        params: Vec<Value>,
    },
    Control { conn: usize, sql: String },
    Close { conn: usize },
}

#[derive(Default)]
struct MockState {
    next_conn: usize,
    open: HashSet<usize>,
    max_concurrent: usize,
    events: Vec<MockEvent>,
    refuse_connections: bool,
    fail_prepare: Vec<String>,
    fail_query: Vec<String>,
    fail_fetch_after: Option<usize>,
    fail_close: bool,
    block_query: Vec<String>,
    generated_keys: Vec<i64>,
    handler: Option<Arc<QueryHandler>>,
}

/// Cloneable; clones share one recorded history.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockDriver {
    /// Every query returns no rows until a handler is installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers queries as a table holding exactly `rows`.
    pub fn with_rows(rows: Vec<Row>) -> Self {
        let driver = Self::new();
        driver.on_query(move |sql, params| Ok(answer_from_table(&rows, sql, params)));
        driver
    }

    pub fn on_query<F>(&self, handler: F)
    where
        F: Fn(&str, &[Value]) -> Result<Vec<Row>, DriverError> + Send + Sync + 'static,
    {
        lock(&self.state).handler = Some(Arc::new(handler));
    }

    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse_connections = refuse;
    }

    /// Prepare fails for statements containing `needle`.
    pub fn fail_prepare_containing(&self, needle: impl Into<String>) {
        lock(&self.state).fail_prepare.push(needle.into());
    }

    /// Execution fails for statements containing `needle`.
    pub fn fail_query_containing(&self, needle: impl Into<String>) {
        lock(&self.state).fail_query.push(needle.into());
    }

    /// Cursors fail once they have produced `rows` rows.
    pub fn fail_fetch_after(&self, rows: usize) {
        lock(&self.state).fail_fetch_after = Some(rows);
    }

    /// Queries containing `needle` hang until their connection is closed, then fail as a
    /// cancelled statement.
    pub fn block_queries_containing(&self, needle: impl Into<String>) {
        lock(&self.state).block_query.push(needle.into());
    }

    /// `true` once a query containing `needle` has reached the engine.
    pub fn query_started(&self, needle: &str) -> bool {
        self.count(|e| matches!(e, MockEvent::Query { sql, .. } if sql.contains(needle))) > 0
    }

    pub fn fail_close(&self, fail: bool) {
        lock(&self.state).fail_close = fail;
    }

    pub fn set_generated_keys(&self, keys: Vec<i64>) {
        lock(&self.state).generated_keys = keys;
    }

    /// Drops every open connection engine-side, as a server restart would.
    pub fn kill_connections(&self) {
        lock(&self.state).open.clear();
    }

    pub fn events(&self) -> Vec<MockEvent> {
        lock(&self.state).events.clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Connect { url, .. } => Some(url),
                _ => None,
            })
            .collect()
    }

    /// SQL of every executed query, in order.
    pub fn queries(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Query { sql, .. } | MockEvent::Execute { sql, .. } => Some(sql),
                _ => None,
            })
            .collect()
    }

    pub fn last_params(&self) -> Option<Vec<Value>> {
        self.events().into_iter().rev().find_map(|e| match e {
            MockEvent::Query { params, .. } | MockEvent::Execute { params, .. } => Some(params),
            _ => None,
        })
    }

    pub fn last_fetch_size(&self) -> Option<usize> {
        self.events().into_iter().rev().find_map(|e| match e {
            MockEvent::Query { fetch_size, .. } => Some(fetch_size),
            _ => None,
        })
    }

    pub fn connect_count(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Connect { .. }))
    }

    pub fn close_count(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Close { .. }))
    }

    /// Closes recorded for connection `conn`.
    pub fn closes_of(&self, conn: usize) -> usize {
        self.count(|e| matches!(e, MockEvent::Close { conn: c } if *c == conn))
    }

    /// Connections opened and not closed through the driver.
    pub fn open_connections(&self) -> usize {
        self.connect_count() - self.close_count()
    }

    pub fn max_concurrent_open(&self) -> usize {
        lock(&self.state).max_concurrent
    }

    fn count(&self, pred: impl Fn(&MockEvent) -> bool) -> usize {
        lock(&self.state).events.iter().filter(|e| pred(e)).count()
    }
}

impl Driver for MockDriver {
    fn connect(&self, url: &str) -> Result<Box<dyn RawConnection>, DriverError> {
        let mut state = lock(&self.state);
        if state.refuse_connections {
            return Err(DriverError::with_sql_state("connection refused", "08001"));
        }
        state.next_conn += 1;
        let conn = state.next_conn;
        state.open.insert(conn);
        state.max_concurrent = state.max_concurrent.max(state.open.len());
        state.events.push(MockEvent::Connect {
            conn,
            url: url.to_string(),
        });
        Ok(Box::new(MockConnection {
            id: conn,
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

struct MockConnection {
    id: usize,
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

impl RawConnection for MockConnection {
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn RawStatement>, DriverError> {
        let mut state = lock(&self.state);
        state.events.push(MockEvent::Prepare {
            conn: self.id,
            sql: sql.to_string(),
        });
        if state.fail_prepare.iter().any(|n| sql.contains(n.as_str())) {
            return Err(DriverError::with_sql_state(
                format!("syntax error in \"{sql}\""),
                "42601",
            ));
        }
        Ok(Box::new(MockStatement {
            conn: self.id,
            sql: sql.to_string(),
            params: count_placeholders(sql),
            fetch_size: 0,
            state: Arc::clone(&self.state),
        }))
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), DriverError> {
        lock(&self.state).events.push(MockEvent::Control {
            conn: self.id,
            sql: sql.to_string(),
        });
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.closed = true;
        let mut state = lock(&self.state);
        state.open.remove(&self.id);
        state.events.push(MockEvent::Close { conn: self.id });
        if state.fail_close {
            return Err(DriverError::new("broken pipe while closing"));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed || !lock(&self.state).open.contains(&self.id)
    }
}

struct MockStatement {
    conn: usize,
    sql: String,
    params: usize,
    fetch_size: usize,
    state: Arc<Mutex<MockState>>,
}

impl MockStatement {
    fn check(&self, state: &MockState) -> Result<(), DriverError> {
        if !state.open.contains(&self.conn) {
            return Err(DriverError::with_sql_state("connection is closed", "08003"));
        }
        if state.fail_query.iter().any(|n| self.sql.contains(n.as_str())) {
            return Err(DriverError::with_sql_state(
                format!("relation does not exist in \"{}\"", self.sql),
                "42P01",
            ));
        }
        Ok(())
    }

    fn wait_if_blocked(&self) -> Result<(), DriverError> {
        if !lock(&self.state).block_query.iter().any(|n| self.sql.contains(n.as_str())) {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if !lock(&self.state).open.contains(&self.conn) {
                return Err(DriverError::with_sql_state(
                    "canceling statement due to user request",
                    "57014",
                ));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

impl RawStatement for MockStatement {
    fn param_count(&self) -> usize {
        self.params
    }

    fn set_fetch_size(&mut self, rows: usize) {
        self.fetch_size = rows;
    }

    fn query(&mut self, params: &[Value]) -> Result<Box<dyn RowCursor>, DriverError> {
        let (handler, fail_after) = {
            let mut state = lock(&self.state);
            state.events.push(MockEvent::Query {
                conn: self.conn,
                sql: self.sql.clone(),
                params: params.to_vec(),
                fetch_size: self.fetch_size,
            });
            self.check(&state)?;
            (state.handler.clone(), state.fail_fetch_after)
        };
        self.wait_if_blocked()?;
        let rows = match handler {
            Some(handler) => handler(&self.sql, params)?,
            None => Vec::new(),
        };
        Ok(Box::new(MockCursor {
            rows: rows.into_iter(),
            produced: 0,
            fail_after,
        }))
    }

    fn execute(&mut self, params: &[Value]) -> Result<Vec<i64>, DriverError> {
        let mut state = lock(&self.state);
        state.events.push(MockEvent::Execute {
            conn: self.conn,
            sql: self.sql.clone(),
            params: params.to_vec(),
        });
        self.check(&state)?;
        Ok(state.generated_keys.clone())
    }
}

struct MockCursor {
    rows: std::vec::IntoIter<Row>,
    produced: usize,
    fail_after: Option<usize>,
}

impl RowCursor for MockCursor {
    fn next_row(&mut self) -> Result<Option<Row>, DriverError> {
        if self.fail_after == Some(self.produced) {
            return Err(DriverError::with_sql_state("server closed the connection unexpectedly", "57P01"));
        }
        let row = self.rows.next();
        if row.is_some() {
            self.produced += 1;
        }
        Ok(row)
    }
}

fn param_i64(params: &[Value], from_end: usize) -> Option<i64> {
    params
        .len()
        .checked_sub(from_end)
        .and_then(|i| params.get(i))
        .and_then(|v| i64::try_get(v).ok())
}

/// Table semantics for [`MockDriver::with_rows`].
fn answer_from_table(rows: &[Row], sql: &str, params: &[Value]) -> Vec<Row> {
    let total = rows.len() as i64;
    if sql.starts_with("SELECT COUNT(*) FROM (") {
        return vec![Row::from_pairs([("found_rows", Value::BigInt(Some(total)))])];
    }

    let (limit, offset) = if sql.contains("LIMIT ? OFFSET ?") {
        (param_i64(params, 2), param_i64(params, 1).unwrap_or(0))
    } else if sql.contains("OFFSET ?") {
        (None, param_i64(params, 1).unwrap_or(0))
    } else {
        (None, 0)
    };
    let start = usize::try_from(offset.max(0)).unwrap_or(usize::MAX).min(rows.len());
    let end = match limit {
        Some(limit) => start.saturating_add(usize::try_from(limit.max(0)).unwrap_or(0)).min(rows.len()),
        None => rows.len(),
    };

    let with_count = sql.contains("COUNT(*) OVER ()");
    rows[start..end]
        .iter()
        .map(|row| {
            if with_count {
                // The window column leads, as it does on PostgreSQL.
                let pairs = std::iter::once(("found_rows".to_string(), Value::BigInt(Some(total)))).chain(
                    row.columns()
                        .iter()
                        .cloned()
                        .zip(row.values().iter().cloned()),
                );
                Row::from_pairs(pairs)
            } else {
                row.clone()
            }
        })
        .collect()
}
