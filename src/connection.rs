//! Connection and statement lifecycle.
//!
//! [`ConnectionManager::acquire`] opens a fresh connection for a [`QueryPurpose`]. The
//! connection is owned by exactly one [`DbConnection`] until it is closed: explicitly, by
//! [`ConnectionManager::release`], or on drop. Closing is idempotent and never fails; a
//! failing engine close is logged and swallowed.
//!
//! Open connections per purpose are capped by `max_connections`. A caller waits for a free
//! slot at most `pool_timeout_seconds`, then gets [`QueryError::DatabaseUnavailable`].

use crate::binder::{BoundParams, ParamSlots, SqlType};
use crate::config::DatabaseConfig;
use crate::diagnostics::Diagnostics;
use crate::driver::{Driver, RawConnection, RawStatement, RowCursor};
use crate::error::{DriverError, QueryError};
use crate::transaction::{TransactionMode, COMMIT, ROLLBACK};
use crossbeam_channel::{bounded, Receiver, Sender};
use sea_query::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Which credential set a query runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryPurpose {
    Authentication,
    #[default]
    Data,
}

impl QueryPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryPurpose::Authentication => "authentication",
            QueryPurpose::Data => "data",
        }
    }
}

impl fmt::Display for QueryPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded slots for one purpose. A token in the channel is a free slot.
struct Slots {
    free: Receiver<()>,
    returned: Sender<()>,
}

impl Slots {
    fn new(capacity: usize) -> Self {
        let (returned, free) = bounded(capacity);
        for _ in 0..capacity {
            // Capacity matches the loop, so this cannot block or fail.
            let _ = returned.try_send(());
        }
        Self { free, returned }
    }
}

/// Held by an open connection; frees its slot when dropped.
struct Permit {
    returned: Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.returned.try_send(());
    }
}

struct ManagerInner {
    driver: Arc<dyn Driver>,
    config: DatabaseConfig,
    authentication: Slots,
    data: Slots,
}

/// Opens connections per purpose. Cheap to clone; clones share the slot limits.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("max_connections", &self.inner.config.max_connections)
            .field("pool_timeout_seconds", &self.inner.config.pool_timeout_seconds)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(driver: Arc<dyn Driver>, config: DatabaseConfig) -> Self {
        let capacity = config.max_connections.max(1);
        Self {
            inner: Arc::new(ManagerInner {
                driver,
                authentication: Slots::new(capacity),
                data: Slots::new(capacity),
                config,
            }),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Opens a connection for `purpose`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::DatabaseUnavailable`] when no slot frees up in time or the
    /// engine refuses the connection.
    pub fn acquire(&self, purpose: QueryPurpose) -> Result<DbConnection, QueryError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::acquire_connection_span(purpose.as_str()).entered();

        let start = Instant::now();
        let (slots, url) = match purpose {
            QueryPurpose::Authentication => {
                (&self.inner.authentication, self.inner.config.authentication_url())
            }
            QueryPurpose::Data => (&self.inner.data, self.inner.config.url.as_str()),
        };

        let timeout = self.inner.config.pool_timeout();
        slots.free.recv_timeout(timeout).map_err(|_| {
            log::warn!("no {purpose} connection slot free within {timeout:?}");
            QueryError::DatabaseUnavailable(DriverError::new(format!(
                "no {purpose} connection available within {}s",
                timeout.as_secs()
            )))
        })?;
        let permit = Permit {
            returned: slots.returned.clone(),
        };

        // The permit is dropped with the error, freeing the slot again.
        let raw = self.inner.driver.connect(url).map_err(|e| {
            log::warn!("failed to open {purpose} connection: {e}");
            QueryError::DatabaseUnavailable(e)
        })?;

        #[cfg(feature = "metrics")]
        {
            METRICS.record_acquire_wait(start.elapsed());
            METRICS.record_connection_opened();
        }
        log::debug!("opened {purpose} connection in {:?}", start.elapsed());

        Ok(DbConnection::new(raw, permit, purpose))
    }

    /// Closes `connection`; the same as dropping it.
    pub fn release(&self, connection: DbConnection) {
        connection.close();
    }
}

struct ConnState {
    raw: Option<Box<dyn RawConnection>>,
    permit: Option<Permit>,
    in_transaction: bool,
}

fn lock(state: &Mutex<ConnState>) -> MutexGuard<'_, ConnState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn close_state(state: &Mutex<ConnState>, purpose: QueryPurpose) -> bool {
    let mut guard = lock(state);
    let Some(mut raw) = guard.raw.take() else {
        return false;
    };
    guard.in_transaction = false;
    let permit = guard.permit.take();
    drop(guard);

    if let Err(e) = raw.close() {
        log::warn!("ignoring failure while closing {purpose} connection: {e}");
    }
    drop(permit);

    #[cfg(feature = "metrics")]
    METRICS.record_connection_closed();
    log::debug!("closed {purpose} connection");
    true
}

/// An open connection owned by one logical query or stream.
pub struct DbConnection {
    state: Arc<Mutex<ConnState>>,
    purpose: QueryPurpose,
}

impl fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConnection")
            .field("purpose", &self.purpose)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DbConnection {
    fn new(raw: Box<dyn RawConnection>, permit: Permit, purpose: QueryPurpose) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnState {
                raw: Some(raw),
                permit: Some(permit),
                in_transaction: false,
            })),
            purpose,
        }
    }

    pub fn purpose(&self) -> QueryPurpose {
        self.purpose
    }

    /// `true` once closed here, through a [`ConnectionHandle`], or by the engine.
    pub fn is_closed(&self) -> bool {
        lock(&self.state)
            .raw
            .as_ref()
            .map_or(true, |raw| raw.is_closed())
    }

    /// Closes the connection. Later calls do nothing.
    pub fn close(&self) {
        close_state(&self.state, self.purpose);
    }

    /// Handle a supervisor can use to close this connection from elsewhere.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            state: Arc::clone(&self.state),
            purpose: self.purpose,
        }
    }

    /// Closes the connection, then hands back `err`.
    pub(crate) fn fail(&self, err: QueryError) -> QueryError {
        self.close();
        err
    }

    fn closed_error(&self, diagnostics: &Diagnostics) -> QueryError {
        QueryError::execution(
            DriverError::new(format!("{} connection is closed", self.purpose)),
            diagnostics,
        )
    }

    /// Prepares `sql`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::QueryCompilation`] when the engine rejects the statement; the
    /// connection is closed first.
    pub fn prepare(&self, sql: &str, diagnostics: &Diagnostics) -> Result<PreparedQuery, QueryError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::prepare_statement_span(sql).entered();

        let mut guard = lock(&self.state);
        let Some(raw) = guard.raw.as_mut() else {
            drop(guard);
            return Err(self.closed_error(diagnostics));
        };
        match raw.prepare(sql) {
            Ok(statement) => Ok(PreparedQuery::new(sql, statement)),
            Err(e) => {
                drop(guard);
                #[cfg(feature = "metrics")]
                METRICS.record_query_error();
                log::debug!("prepare failed for {sql}: {e}");
                Err(self.fail(QueryError::compilation(e, diagnostics)))
            }
        }
    }

    /// Runs a bound statement and returns its rows.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::DatabaseExecution`] (connection closed first) when the
    /// statement has unbound slots or the engine rejects it.
    pub fn query(
        &self,
        prepared: &mut PreparedQuery,
        diagnostics: &Diagnostics,
    ) -> Result<Box<dyn RowCursor>, QueryError> {
        if self.is_closed() {
            return Err(self.closed_error(diagnostics));
        }
        let values = prepared.values().map_err(|e| self.fail(e))?;

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(&prepared.sql).entered();

        let start = Instant::now();
        let result = prepared.statement.query(&values);
        #[cfg(feature = "metrics")]
        METRICS.record_query(start.elapsed());
        log::debug!("executed in {:?}: {}", start.elapsed(), prepared.sql);

        result.map_err(|e| {
            #[cfg(feature = "metrics")]
            METRICS.record_query_error();
            self.fail(QueryError::execution(e, diagnostics))
        })
    }

    /// Runs a bound write and returns generated keys.
    ///
    /// # Errors
    ///
    /// As [`DbConnection::query`].
    pub fn execute(
        &self,
        prepared: &mut PreparedQuery,
        diagnostics: &Diagnostics,
    ) -> Result<Vec<i64>, QueryError> {
        if self.is_closed() {
            return Err(self.closed_error(diagnostics));
        }
        let values = prepared.values().map_err(|e| self.fail(e))?;

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(&prepared.sql).entered();

        let start = Instant::now();
        let result = prepared.statement.execute(&values);
        #[cfg(feature = "metrics")]
        METRICS.record_query(start.elapsed());
        log::debug!("executed in {:?}: {}", start.elapsed(), prepared.sql);

        result.map_err(|e| {
            #[cfg(feature = "metrics")]
            METRICS.record_query_error();
            self.fail(QueryError::execution(e, diagnostics))
        })
    }

    /// Starts an internal transaction.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::DatabaseExecution`]; the connection is closed first.
    pub fn begin(&self, mode: TransactionMode, diagnostics: &Diagnostics) -> Result<(), QueryError> {
        self.control(&mode.begin_sql(), diagnostics)?;
        lock(&self.state).in_transaction = true;
        Ok(())
    }

    /// Commits the transaction started by [`DbConnection::begin`], if any.
    ///
    /// # Errors
    ///
    /// As [`DbConnection::begin`].
    pub fn commit(&self, diagnostics: &Diagnostics) -> Result<(), QueryError> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.control(COMMIT, diagnostics)?;
        lock(&self.state).in_transaction = false;
        Ok(())
    }

    /// Best-effort rollback; failures are logged.
    pub fn rollback(&self) {
        if !self.in_transaction() {
            return;
        }
        let mut guard = lock(&self.state);
        guard.in_transaction = false;
        if let Some(raw) = guard.raw.as_mut() {
            if let Err(e) = raw.batch_execute(ROLLBACK) {
                log::warn!("ignoring rollback failure: {e}");
            }
        }
    }

    pub fn in_transaction(&self) -> bool {
        lock(&self.state).in_transaction
    }

    /// Runs a parameterless control statement such as `CLOSE cursor`.
    pub(crate) fn control(&self, sql: &str, diagnostics: &Diagnostics) -> Result<(), QueryError> {
        let mut guard = lock(&self.state);
        let Some(raw) = guard.raw.as_mut() else {
            drop(guard);
            return Err(self.closed_error(diagnostics));
        };
        let result = raw.batch_execute(sql);
        drop(guard);
        result.map_err(|e| self.fail(QueryError::execution(e, diagnostics)))
    }
}

impl Drop for DbConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shared handle to a [`DbConnection`], for closing it from a watchdog.
#[derive(Clone)]
pub struct ConnectionHandle {
    state: Arc<Mutex<ConnState>>,
    purpose: QueryPurpose,
}

impl ConnectionHandle {
    /// Returns `true` when this call did the closing.
    pub fn close(&self) -> bool {
        close_state(&self.state, self.purpose)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state)
            .raw
            .as_ref()
            .map_or(true, |raw| raw.is_closed())
    }
}

/// A prepared statement plus its positional parameter slots.
pub struct PreparedQuery {
    sql: String,
    statement: Box<dyn RawStatement>,
    slots: ParamSlots,
}

impl fmt::Debug for PreparedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedQuery")
            .field("sql", &self.sql)
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl PreparedQuery {
    fn new(sql: &str, statement: Box<dyn RawStatement>) -> Self {
        let slots = ParamSlots::new(statement.param_count());
        Self {
            sql: sql.to_string(),
            statement,
            slots,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Binds `value` as `ty` at 1-based `index`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidArgument`] for a bad index or a mistyped value.
    pub fn bind(&mut self, index: usize, value: Value, ty: SqlType) -> Result<&mut Self, QueryError> {
        self.slots.bind(index, value, ty)?;
        Ok(self)
    }

    /// Binds every parameter in order from slot 1.
    ///
    /// # Errors
    ///
    /// As [`PreparedQuery::bind`], and when `params` does not fill every slot.
    pub fn bind_all(&mut self, params: &BoundParams) -> Result<&mut Self, QueryError> {
        if params.len() != self.slots.len() {
            return Err(QueryError::InvalidArgument(format!(
                "statement expects {} parameters, {} supplied",
                self.slots.len(),
                params.len()
            )));
        }
        self.slots.bind_all(params)?;
        Ok(self)
    }

    pub fn set_fetch_size(&mut self, rows: usize) {
        self.statement.set_fetch_size(rows);
    }

    fn values(&self) -> Result<Vec<Value>, QueryError> {
        self.slots.values()
    }
}
