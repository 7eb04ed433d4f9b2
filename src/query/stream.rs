//! Forward-only, incrementally fetched results.

use crate::connection::{ConnectionHandle, DbConnection};
use crate::diagnostics::Diagnostics;
use crate::driver::RowCursor;
use crate::error::QueryError;
use crate::materializer::{ParseContext, RowParser};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Where a [`StreamCursor`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Advancing,
    ValueReady,
    Exhausted,
    Closed,
}

impl StreamState {
    fn is_terminal(self) -> bool {
        matches!(self, StreamState::Exhausted | StreamState::Closed)
    }
}

/// A result set and its connection, read one object at a time.
///
/// Not shareable between threads while in use; hand it off instead. Once [`StreamCursor::next`]
/// has returned `Ok(None)` it keeps doing so.
pub struct StreamCursor<P: RowParser> {
    conn: Option<DbConnection>,
    cursor: Option<Box<dyn RowCursor>>,
    parser: P,
    ctx: ParseContext,
    keep_open: bool,
    diagnostics: Diagnostics,
    state: StreamState,
    fetch_size: usize,
}

impl<P: RowParser> std::fmt::Debug for StreamCursor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCursor")
            .field("state", &self.state)
            .field("keep_open", &self.keep_open)
            .field("fetch_size", &self.fetch_size)
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl<P: RowParser> StreamCursor<P> {
    pub(crate) fn new(
        conn: DbConnection,
        cursor: Box<dyn RowCursor>,
        parser: P,
        mut ctx: ParseContext,
        keep_open: bool,
        diagnostics: Diagnostics,
        fetch_size: usize,
    ) -> Self {
        ctx.clear_cache();
        Self {
            conn: Some(conn),
            cursor: Some(cursor),
            parser,
            ctx,
            keep_open,
            diagnostics,
            state: StreamState::Open,
            fetch_size,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Diagnostics recorded when the stream was opened.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Handle for closing the underlying connection from a watchdog.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.conn.as_ref().map(DbConnection::handle)
    }

    /// The next object, or `Ok(None)` once the stream is exhausted or closed.
    ///
    /// A connection closed from outside ends the stream quietly.
    ///
    /// # Errors
    ///
    /// [`QueryError::DatabaseExecution`] when a fetch fails and [`QueryError::Parse`] when a
    /// row cannot be hydrated. The stream is closed first.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<P::Output>, QueryError> {
        if self.state.is_terminal() {
            return Ok(None);
        }
        if self.closed_externally() {
            return Ok(None);
        }

        self.state = StreamState::Advancing;
        let fetched = {
            #[cfg(feature = "tracing")]
            let _span = tracing_helpers::fetch_rows_span(self.fetch_size).entered();
            match self.cursor.as_mut() {
                Some(cursor) => cursor.next_row(),
                None => Ok(None),
            }
        };

        match fetched {
            Ok(Some(row)) => match self.parser.parse(&row, &mut self.ctx) {
                Ok(item) => {
                    #[cfg(feature = "metrics")]
                    METRICS.record_stream_row();
                    self.state = StreamState::ValueReady;
                    Ok(Some(item))
                }
                Err(e) => {
                    let err = QueryError::parse(e.to_string(), &self.diagnostics);
                    self.close();
                    Err(err)
                }
            },
            Ok(None) => {
                self.exhaust();
                Ok(None)
            }
            // A watchdog close cancels the fetch in flight.
            Err(_) if self.closed_externally() => Ok(None),
            Err(e) => {
                let err = QueryError::execution(e, &self.diagnostics);
                self.close();
                Err(err)
            }
        }
    }

    fn closed_externally(&mut self) -> bool {
        if !self.conn.as_ref().map_or(true, DbConnection::is_closed) {
            return false;
        }
        log::debug!("stream connection closed externally, ending stream");
        self.cursor = None;
        self.ctx.clear_cache();
        self.state = StreamState::Exhausted;
        true
    }

    /// Reads the rest of the stream into a list.
    ///
    /// # Errors
    ///
    /// As [`StreamCursor::next`].
    pub fn collect_remaining(&mut self) -> Result<Vec<P::Output>, QueryError> {
        let mut items = Vec::new();
        while let Some(item) = self.next()? {
            items.push(item);
        }
        Ok(items)
    }

    fn exhaust(&mut self) {
        self.ctx.clear_cache();
        self.release_cursor();
        if self.keep_open {
            if let Some(conn) = self.conn.as_ref() {
                if let Err(e) = conn.commit(&self.diagnostics) {
                    log::warn!("failed to end stream transaction: {e}");
                }
            }
        } else if let Some(conn) = self.conn.take() {
            conn.close();
        }
        self.state = StreamState::Exhausted;
    }

    fn release_cursor(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            if let Err(e) = cursor.close() {
                log::warn!("ignoring failure while closing stream cursor: {e}");
            }
        }
    }

    /// Closes the stream. With `keep_open` the connection survives for
    /// [`StreamCursor::into_connection`]; otherwise it is closed too. Later calls do nothing.
    pub fn close(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        self.ctx.clear_cache();
        self.release_cursor();
        match self.conn.take() {
            Some(conn) if self.keep_open && !conn.is_closed() => {
                conn.rollback();
                self.conn = Some(conn);
            }
            Some(conn) => conn.close(),
            None => {}
        }
        self.state = StreamState::Closed;
    }

    /// Ends the stream and hands back its connection for the next query, if still open.
    pub fn into_connection(mut self) -> Option<DbConnection> {
        if !self.state.is_terminal() {
            self.close();
        }
        self.conn.take().filter(|conn| !conn.is_closed())
    }
}

impl<P: RowParser> Drop for StreamCursor<P> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::connection::ConnectionManager;
    use crate::mock::{MockDriver, MockEvent};
    use crate::query::Query;
    use crate::row::{Row, ValueExtractionError};
    use fake::faker::lorem::en::Word;
    use fake::Fake;
    use sea_query::Value;
    use std::sync::Arc;

    fn accession_name(row: &Row, _: &mut ParseContext) -> Result<String, ValueExtractionError> {
        row.try_get("name")
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let word: String = Word().fake();
                Row::from_pairs([
                    ("id", Value::BigInt(Some(i as i64))),
                    ("name", Value::String(Some(format!("{word}-{i}")))),
                ])
            })
            .collect()
    }

    fn manager(driver: &MockDriver) -> ConnectionManager {
        let config = DatabaseConfig {
            pool_timeout_seconds: 0,
            stream_fetch_size: 250,
            ..DatabaseConfig::default()
        };
        ConnectionManager::new(Arc::new(driver.clone()), config)
    }

    fn controls(driver: &MockDriver) -> Vec<String> {
        driver
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Control { sql, .. } => Some(sql),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_empty_table_closes_on_first_next() {
        let driver = MockDriver::with_rows(Vec::new());
        let mut stream = Query::new("SELECT * FROM germinatebase")
            .stream(&manager(&driver), &mut Diagnostics::disabled(), accession_name)
            .unwrap();
        assert_eq!(stream.state(), StreamState::Open);
        assert!(stream.next().unwrap().is_none());
        assert_eq!(stream.state(), StreamState::Exhausted);
        assert_eq!(driver.open_connections(), 0);
    }

    #[test]
    fn test_exhausted_stream_stays_quiet() {
        let driver = MockDriver::with_rows(rows(2));
        let mut stream = Query::new("SELECT * FROM germinatebase")
            .stream(&manager(&driver), &mut Diagnostics::disabled(), accession_name)
            .unwrap();
        assert!(stream.next().unwrap().is_some());
        assert_eq!(stream.state(), StreamState::ValueReady);
        assert!(stream.next().unwrap().is_some());
        for _ in 0..5 {
            assert!(stream.next().unwrap().is_none());
        }
        stream.close();
        stream.close();
        assert!(stream.next().unwrap().is_none());
        assert_eq!(driver.close_count(), 1);
    }

    #[test]
    fn test_streams_every_row_with_fetch_hint() {
        let driver = MockDriver::with_rows(rows(23));
        let mut stream = Query::new("SELECT * FROM germinatebase")
            .stream(&manager(&driver), &mut Diagnostics::disabled(), accession_name)
            .unwrap();
        let names = stream.collect_remaining().unwrap();
        assert_eq!(names.len(), 23);
        assert!(names[22].ends_with("-22"));
        assert_eq!(driver.last_fetch_size(), Some(250));
        assert_eq!(controls(&driver), vec!["BEGIN ISOLATION LEVEL READ COMMITTED, READ ONLY".to_string()]);
        assert_eq!(driver.open_connections(), 0);
    }

    #[test]
    fn test_zero_fetch_size_buffers_without_transaction() {
        let driver = MockDriver::with_rows(rows(3));
        let mut stream = Query::new("SELECT * FROM germinatebase")
            .fetch_size(0)
            .stream(&manager(&driver), &mut Diagnostics::disabled(), accession_name)
            .unwrap();
        assert_eq!(stream.collect_remaining().unwrap().len(), 3);
        assert_eq!(driver.last_fetch_size(), Some(0));
        assert!(controls(&driver).is_empty());
    }

    #[test]
    fn test_keep_open_chains_streams_on_one_connection() {
        let driver = MockDriver::with_rows(rows(4));
        let mut diagnostics = Diagnostics::enabled();
        let mut first = Query::new("SELECT * FROM germinatebase")
            .keep_open(true)
            .stream(&manager(&driver), &mut diagnostics, accession_name)
            .unwrap();
        assert_eq!(first.collect_remaining().unwrap().len(), 4);
        assert_eq!(driver.open_connections(), 1);

        let conn = first.into_connection().unwrap();
        let mut second = Query::new("SELECT * FROM germinatebase WHERE id > ?")
            .param(1i64)
            .stream_on(conn, &mut diagnostics, accession_name, 100)
            .unwrap();
        assert_eq!(second.collect_remaining().unwrap().len(), 4);

        assert_eq!(driver.connect_count(), 1);
        assert_eq!(driver.open_connections(), 0);
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(
            controls(&driver),
            vec![
                "BEGIN ISOLATION LEVEL READ COMMITTED, READ ONLY".to_string(),
                "COMMIT".to_string(),
                "BEGIN ISOLATION LEVEL READ COMMITTED, READ ONLY".to_string(),
            ]
        );
    }

    #[test]
    fn test_external_close_ends_stream() {
        let driver = MockDriver::with_rows(rows(10));
        let mut stream = Query::new("SELECT * FROM germinatebase")
            .stream(&manager(&driver), &mut Diagnostics::disabled(), accession_name)
            .unwrap();
        assert!(stream.next().unwrap().is_some());

        let handle = stream.handle().unwrap();
        assert!(handle.close());
        assert!(stream.next().unwrap().is_none());
        assert_eq!(stream.state(), StreamState::Exhausted);
        drop(stream);
        assert_eq!(driver.close_count(), 1);
    }

    #[test]
    fn test_engine_dropping_connection_ends_stream() {
        let driver = MockDriver::with_rows(rows(10));
        let mut stream = Query::new("SELECT * FROM germinatebase")
            .stream(&manager(&driver), &mut Diagnostics::disabled(), accession_name)
            .unwrap();
        driver.kill_connections();
        assert!(stream.next().unwrap().is_none());
        assert!(stream.next().unwrap().is_none());
    }

    #[test]
    fn test_fetch_failure_mid_stream() {
        let driver = MockDriver::with_rows(rows(10));
        driver.fail_fetch_after(3);
        let mut stream = Query::new("SELECT * FROM germinatebase")
            .stream(&manager(&driver), &mut Diagnostics::disabled(), accession_name)
            .unwrap();
        for _ in 0..3 {
            assert!(stream.next().unwrap().is_some());
        }
        let err = stream.next().unwrap_err();
        assert!(matches!(err, QueryError::DatabaseExecution { .. }));
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.next().unwrap().is_none());
        assert_eq!(driver.close_count(), 1);
    }

    #[test]
    fn test_parse_failure_closes_stream() {
        let driver = MockDriver::new();
        driver.on_query(|_, _| Ok(vec![Row::from_pairs([("id", Value::BigInt(Some(1)))])]));
        let mut stream = Query::new("SELECT id FROM germinatebase")
            .stream(&manager(&driver), &mut Diagnostics::disabled(), accession_name)
            .unwrap();
        assert!(matches!(stream.next(), Err(QueryError::Parse { .. })));
        assert_eq!(driver.open_connections(), 0);
    }

    #[test]
    fn test_dropping_open_stream_closes_connection() {
        let driver = MockDriver::with_rows(rows(10));
        let stream = Query::new("SELECT * FROM germinatebase")
            .stream(&manager(&driver), &mut Diagnostics::disabled(), accession_name)
            .unwrap();
        drop(stream);
        assert_eq!(driver.open_connections(), 0);
        assert_eq!(driver.close_count(), 1);
    }
}
