//! One execution, consumed by exactly one materialization mode.

use super::{describe, side_count, CompiledQuery};
use crate::connection::DbConnection;
use crate::diagnostics::Diagnostics;
use crate::driver::RowCursor;
use crate::error::QueryError;
use crate::materializer::{ParseContext, RowParser};
use crate::pagination::{FoundRows, FOUND_ROWS_COLUMN};
use crate::row::{Row, RowIndex, TryGetable};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Payload plus the diagnostics recorded while producing it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub diagnostics: Diagnostics,
    pub payload: T,
}

/// One page of a result and the number of rows the query matches ignoring the page window.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginatedQueryResult<T> {
    pub diagnostics: Diagnostics,
    /// `None` when the page is empty
    pub payload: Option<Vec<T>>,
    /// `None` only when the query was not paginated
    pub total_matching: Option<u64>,
}

/// An executed statement and the connection that owns it.
///
/// Every mode closes the connection before returning, successfully or not. Dropping an
/// unconsumed `ExecutedQuery` closes it too.
///
/// Rows never show the injected found-rows column; column positions are those of the
/// caller's own statement.
pub struct ExecutedQuery<'d> {
    conn: DbConnection,
    cursor: Box<dyn RowCursor>,
    compiled: CompiledQuery,
    ctx: ParseContext,
    diagnostics: &'d mut Diagnostics,
    injected_count: bool,
    window_count: Option<u64>,
    peeked: Option<Row>,
}

impl std::fmt::Debug for ExecutedQuery<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutedQuery")
            .field("sql", &self.compiled.sql)
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl<'d> ExecutedQuery<'d> {
    pub(crate) fn new(
        conn: DbConnection,
        cursor: Box<dyn RowCursor>,
        compiled: CompiledQuery,
        mut ctx: ParseContext,
        diagnostics: &'d mut Diagnostics,
    ) -> Self {
        ctx.clear_cache();
        let injected_count = compiled
            .window
            .as_ref()
            .is_some_and(|w| w.found_rows == FoundRows::Window);
        Self {
            conn,
            cursor,
            compiled,
            ctx,
            diagnostics,
            injected_count,
            window_count: None,
            peeked: None,
        }
    }

    /// Column names of the result, taken from its first row; empty when there are no rows.
    ///
    /// # Errors
    ///
    /// [`QueryError::DatabaseExecution`] when the first fetch fails.
    pub fn column_names(&mut self) -> Result<Vec<String>, QueryError> {
        if self.peeked.is_none() {
            self.peeked = self.fetch()?;
        }
        Ok(self
            .peeked
            .as_ref()
            .map(|row| row.columns().to_vec())
            .unwrap_or_default())
    }

    /// The first row as an object, or `None` for an empty result.
    ///
    /// # Errors
    ///
    /// [`QueryError::DatabaseExecution`] when the fetch fails, [`QueryError::Parse`] when the
    /// row cannot be hydrated.
    pub fn single<P: RowParser>(mut self, parser: &P) -> Result<QueryResult<Option<P::Output>>, QueryError> {
        let parsed = match self.fetch()? {
            Some(row) => Some(self.parse(parser, &row)?),
            None => None,
        };
        self.finish()?;
        Ok(QueryResult {
            diagnostics: self.diagnostics.clone(),
            payload: parsed,
        })
    }

    /// Every row in order, or `None` when there are none.
    ///
    /// # Errors
    ///
    /// As [`ExecutedQuery::single`].
    pub fn list<P: RowParser>(mut self, parser: &P) -> Result<QueryResult<Option<Vec<P::Output>>>, QueryError> {
        let items = self.drain(parser)?;
        self.finish()?;
        Ok(QueryResult {
            diagnostics: self.diagnostics.clone(),
            payload: (!items.is_empty()).then_some(items),
        })
    }

    /// Like [`ExecutedQuery::list`], with the total number of matching rows.
    ///
    /// # Errors
    ///
    /// As [`ExecutedQuery::single`], and when the count cannot be obtained.
    pub fn paginated<P: RowParser>(
        mut self,
        parser: &P,
    ) -> Result<PaginatedQueryResult<P::Output>, QueryError> {
        let items = self.drain(parser)?;

        let plan = self.compiled.window.as_ref().map(|w| (w.found_rows.clone(), w.start));
        let total_matching = match plan {
            None => None,
            Some((FoundRows::Known(total), _)) => Some(total),
            Some((FoundRows::Window, _)) if self.window_count.is_some() => self.window_count,
            // Nothing on the first page means nothing at all.
            Some((FoundRows::Window, 0)) if items.is_empty() => Some(0),
            Some(_) => Some(self.count_matching()?),
        };

        self.finish()?;
        Ok(PaginatedQueryResult {
            diagnostics: self.diagnostics.clone(),
            payload: (!items.is_empty()).then_some(items),
            total_matching,
        })
    }

    /// Column `index` of the first row, `None` for no rows or a NULL.
    ///
    /// # Errors
    ///
    /// As [`ExecutedQuery::single`]; an unknown column is a [`QueryError::Parse`].
    pub fn value<T: TryGetable, I: RowIndex>(mut self, index: I) -> Result<QueryResult<Option<T>>, QueryError> {
        let value = match self.fetch()? {
            Some(row) => row
                .try_get_opt::<T, _>(index)
                .map_err(|e| self.conn.fail(QueryError::parse(e.to_string(), self.diagnostics)))?,
            None => None,
        };
        self.finish()?;
        Ok(QueryResult {
            diagnostics: self.diagnostics.clone(),
            payload: value,
        })
    }

    /// Column `index` of every row; NULLs are skipped.
    ///
    /// # Errors
    ///
    /// As [`ExecutedQuery::value`].
    pub fn values<T: TryGetable, I: RowIndex + Copy>(mut self, index: I) -> Result<QueryResult<Vec<T>>, QueryError> {
        let mut values = Vec::new();
        while let Some(row) = self.fetch()? {
            let value = row
                .try_get_opt::<T, _>(index)
                .map_err(|e| self.conn.fail(QueryError::parse(e.to_string(), self.diagnostics)))?;
            values.extend(value);
        }
        self.finish()?;
        Ok(QueryResult {
            diagnostics: self.diagnostics.clone(),
            payload: values,
        })
    }

    /// Next row, with the injected found-rows column taken out.
    fn fetch(&mut self) -> Result<Option<Row>, QueryError> {
        if let Some(row) = self.peeked.take() {
            return Ok(Some(row));
        }
        let row = self
            .cursor
            .next_row()
            .map_err(|e| self.conn.fail(QueryError::execution(e, self.diagnostics)))?;
        Ok(row.map(|row| self.strip_found_rows(row)))
    }

    fn strip_found_rows(&mut self, row: Row) -> Row {
        if !self.injected_count {
            return row;
        }
        let (row, count) = row.split_column(FOUND_ROWS_COLUMN);
        if self.window_count.is_none() {
            self.window_count = count
                .and_then(|v| i64::try_get(&v).ok())
                .and_then(|n| u64::try_from(n).ok());
        }
        row
    }

    fn parse<P: RowParser>(&mut self, parser: &P, row: &Row) -> Result<P::Output, QueryError> {
        parser.parse(row, &mut self.ctx).map_err(|e| {
            self.ctx.clear_cache();
            self.conn.fail(QueryError::parse(e.to_string(), self.diagnostics))
        })
    }

    fn drain<P: RowParser>(&mut self, parser: &P) -> Result<Vec<P::Output>, QueryError> {
        let mut items = Vec::new();
        while let Some(row) = self.fetch()? {
            items.push(self.parse(parser, &row)?);
        }
        Ok(items)
    }

    /// Counts the unwindowed statement on this connection and snapshot.
    fn count_matching(&mut self) -> Result<u64, QueryError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::count_rows_span().entered();

        if let Err(e) = self.cursor.close() {
            log::debug!("ignoring failure while closing page cursor: {e}");
        }
        let (sql, params) = side_count(&self.compiled);
        self.diagnostics.add_with(|| describe(&sql, &params));

        let mut prepared = self.conn.prepare(&sql, self.diagnostics)?;
        prepared.bind_all(&params).map_err(|e| self.conn.fail(e))?;
        let mut cursor = self.conn.query(&mut prepared, self.diagnostics)?;
        let row = cursor
            .next_row()
            .map_err(|e| self.conn.fail(QueryError::execution(e, self.diagnostics)))?;

        let count = row
            .as_ref()
            .and_then(|r| r.try_get_opt::<i64, _>(0usize).ok().flatten())
            .unwrap_or(0);
        u64::try_from(count).map_err(|_| {
            self.conn
                .fail(QueryError::parse(format!("negative row count {count}"), self.diagnostics))
        })
    }

    /// Ends the snapshot, drops cached sub-objects and closes the connection.
    fn finish(&mut self) -> Result<(), QueryError> {
        self.ctx.clear_cache();
        self.peeked = None;
        if let Err(e) = self.cursor.close() {
            log::debug!("ignoring failure while closing result cursor: {e}");
        }
        let committed = self.conn.commit(self.diagnostics);
        self.conn.close();
        committed
    }
}
