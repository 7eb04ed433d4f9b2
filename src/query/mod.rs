//! Caller-facing query API.
//!
//! A [`Query`] is a SQL template with `?` placeholders, optionally containing the
//! [`FILTER_MARKER`]. The marker becomes ` WHERE (<compiled filter>)`, or ` WHERE 1=1` without
//! a filter, so templates can continue with `AND ...`. Static parameters are given in
//! template order; the filter's values are bound at the marker's position.
//!
//! Everything that can be rejected without the engine (columns, arity, values, parameter
//! count) is checked before a connection is opened.
//!
//! ```no_run
//! use seedkeeper::filter::{ColumnWhitelist, Condition, FilterExpression, Operator};
//! use seedkeeper::{ConnectionManager, DatabaseConfig, Diagnostics, Pagination, Query, Row, SqlType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = seedkeeper::postgres::connection_manager(DatabaseConfig::load()?);
//! let columns = ColumnWhitelist::new(["status", "country", "name"]);
//! let filter = FilterExpression::new(Condition::new("status", Operator::Equal, ["active"], SqlType::String))
//!     .and(Condition::new("country", Operator::Equal, ["DE"], SqlType::String));
//!
//! let mut diagnostics = Diagnostics::disabled();
//! let page = Query::new("SELECT * FROM accessions {{FILTER}}")
//!     .filter(filter, &columns)
//!     .paginate(Pagination::page(0, 10), &columns, "name")
//!     .run(&manager, &mut diagnostics)?
//!     .paginated(&|row: &Row, _: &mut seedkeeper::ParseContext| row.try_get::<String, _>("name"))?;
//!
//! println!("{} of {:?}", page.payload.map_or(0, |p| p.len()), page.total_matching);
//! # Ok(())
//! # }
//! ```

mod executed;
mod stream;

pub use executed::{ExecutedQuery, PaginatedQueryResult, QueryResult};
pub use stream::{StreamCursor, StreamState};

use crate::binder::{BoundParams, Param};
use crate::connection::{ConnectionManager, DbConnection, QueryPurpose};
use crate::diagnostics::{CallerIdentity, Diagnostics};
use crate::driver::count_placeholders;
use crate::error::QueryError;
use crate::filter::{self, ColumnWhitelist, FilterExpression};
use crate::materializer::{ParseContext, RowParser};
use crate::pagination::{count_sql, inject_found_rows, FoundRows, Pagination};
use crate::transaction::TransactionMode;
use sea_query::Value;

/// Placeholder in a query template for the compiled filter.
pub const FILTER_MARKER: &str = "{{FILTER}}";

#[derive(Debug, Clone)]
struct PageRequest {
    pagination: Pagination,
    sortable: ColumnWhitelist,
    default_sort: String,
}

/// Builder for one logical query.
#[derive(Debug, Clone)]
pub struct Query {
    template: String,
    purpose: QueryPurpose,
    params: Vec<Param>,
    filter: Option<(FilterExpression, ColumnWhitelist)>,
    page: Option<PageRequest>,
    caller: Option<CallerIdentity>,
    resolve_foreign_keys: bool,
    fetch_size: Option<usize>,
    keep_open: bool,
}

/// Final statement text and parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompiledQuery {
    /// Filter applied, no page window
    pub sql: String,
    pub params: BoundParams,
    pub window: Option<Window>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Window {
    pub sql: String,
    pub params: BoundParams,
    pub found_rows: FoundRows,
    pub start: u64,
}

impl CompiledQuery {
    /// Statement and parameters actually executed first.
    fn statement(&self) -> (&str, &BoundParams) {
        match &self.window {
            Some(window) => (&window.sql, &window.params),
            None => (&self.sql, &self.params),
        }
    }
}

impl Query {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            purpose: QueryPurpose::Data,
            params: Vec::new(),
            filter: None,
            page: None,
            caller: None,
            resolve_foreign_keys: true,
            fetch_size: None,
            keep_open: false,
        }
    }

    pub fn purpose(mut self, purpose: QueryPurpose) -> Self {
        self.purpose = purpose;
        self
    }

    /// Next static parameter, in template order.
    pub fn param(mut self, param: impl Into<Param>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn params<I, P>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Param>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    pub fn filter(mut self, expr: FilterExpression, whitelist: &ColumnWhitelist) -> Self {
        self.filter = Some((expr, whitelist.clone()));
        self
    }

    /// Pages the result; `default_sort` orders it when the page names no column (empty for none).
    pub fn paginate(mut self, pagination: Pagination, sortable: &ColumnWhitelist, default_sort: &str) -> Self {
        self.page = Some(PageRequest {
            pagination,
            sortable: sortable.clone(),
            default_sort: default_sort.to_string(),
        });
        self
    }

    /// Identity handed to row parsers.
    pub fn caller(mut self, identity: CallerIdentity) -> Self {
        self.caller = Some(identity);
        self
    }

    pub fn resolve_foreign_keys(mut self, resolve: bool) -> Self {
        self.resolve_foreign_keys = resolve;
        self
    }

    /// Rows a stream buffers per fetch; the configured default otherwise.
    pub fn fetch_size(mut self, rows: usize) -> Self {
        self.fetch_size = Some(rows);
        self
    }

    /// Keeps a stream's connection open after the last row, for chained streaming.
    pub fn keep_open(mut self, keep: bool) -> Self {
        self.keep_open = keep;
        self
    }

    /// Renders the final statements.
    ///
    /// # Errors
    ///
    /// Filter and pagination errors, and [`QueryError::InvalidArgument`] when the parameter
    /// count does not match the placeholders or a filter is given without a marker.
    pub(crate) fn compile(&self) -> Result<CompiledQuery, QueryError> {
        let mut params: BoundParams = self.params.iter().cloned().collect();

        let sql = match self.template.find(FILTER_MARKER) {
            Some(at) => {
                let before = &self.template[..at];
                let after = &self.template[at + FILTER_MARKER.len()..];
                if after.contains(FILTER_MARKER) {
                    return Err(QueryError::InvalidArgument(format!(
                        "query template contains {FILTER_MARKER} more than once"
                    )));
                }
                match &self.filter {
                    Some((expr, whitelist)) => {
                        let (fragment, filter_params) = filter::compile(expr, whitelist)?.into_parts();
                        params.splice_at(count_placeholders(before) + 1, filter_params);
                        format!("{} WHERE ({fragment}){after}", before.trim_end())
                    }
                    None => format!("{} WHERE 1=1{after}", before.trim_end()),
                }
            }
            None if self.filter.is_some() => {
                return Err(QueryError::InvalidArgument(format!(
                    "a filter was given but the query template has no {FILTER_MARKER}"
                )))
            }
            None => self.template.clone(),
        };

        let expected = count_placeholders(&sql);
        if expected != params.len() {
            return Err(QueryError::InvalidArgument(format!(
                "query has {expected} placeholders but {} parameters",
                params.len()
            )));
        }

        let window = match &self.page {
            Some(page) => {
                let mut window_sql = sql.clone();
                let mut window_params = params.clone();
                page.pagination.apply(
                    &mut window_sql,
                    &mut window_params,
                    &page.sortable,
                    &page.default_sort,
                )?;
                let found_rows = match page.pagination.known_result_size {
                    Some(total) => FoundRows::Known(total),
                    None => match inject_found_rows(&window_sql) {
                        Some(injected) => {
                            window_sql = injected;
                            FoundRows::Window
                        }
                        None => FoundRows::SideQuery,
                    },
                };
                Some(Window {
                    sql: window_sql,
                    params: window_params,
                    found_rows,
                    start: page.pagination.start,
                })
            }
            None => None,
        };

        Ok(CompiledQuery { sql, params, window })
    }

    /// Compiles, acquires a connection and executes.
    ///
    /// # Errors
    ///
    /// Compile-time errors before any connection is opened, then
    /// [`QueryError::DatabaseUnavailable`], [`QueryError::QueryCompilation`] or
    /// [`QueryError::DatabaseExecution`]. The connection is closed on every error.
    pub fn run<'d>(
        self,
        manager: &ConnectionManager,
        diagnostics: &'d mut Diagnostics,
    ) -> Result<ExecutedQuery<'d>, QueryError> {
        let compiled = self.compile()?;
        let conn = manager.acquire(self.purpose)?;
        self.execute_compiled(compiled, conn, diagnostics)
    }

    /// As [`Query::run`], on a connection the caller already owns.
    ///
    /// # Errors
    ///
    /// As [`Query::run`]; `conn` is closed on error.
    pub fn run_on<'d>(
        self,
        conn: DbConnection,
        diagnostics: &'d mut Diagnostics,
    ) -> Result<ExecutedQuery<'d>, QueryError> {
        let compiled = self.compile().map_err(|e| conn.fail(e))?;
        self.execute_compiled(compiled, conn, diagnostics)
    }

    fn execute_compiled<'d>(
        self,
        compiled: CompiledQuery,
        conn: DbConnection,
        diagnostics: &'d mut Diagnostics,
    ) -> Result<ExecutedQuery<'d>, QueryError> {
        // The count may need a second statement; both must see the same rows.
        let counted = compiled
            .window
            .as_ref()
            .is_some_and(|w| !matches!(w.found_rows, FoundRows::Known(_)));
        if counted {
            conn.begin(TransactionMode::SNAPSHOT, diagnostics)?;
        }

        let (sql, params) = compiled.statement();
        diagnostics.add_with(|| describe(sql, params));
        let mut prepared = conn.prepare(sql, diagnostics)?;
        prepared.bind_all(params).map_err(|e| conn.fail(e))?;
        let cursor = conn.query(&mut prepared, diagnostics)?;

        Ok(ExecutedQuery::new(
            conn,
            cursor,
            compiled,
            ParseContext::new(self.caller, self.resolve_foreign_keys),
            diagnostics,
        ))
    }

    /// Opens a forward-only stream over the result.
    ///
    /// # Errors
    ///
    /// As [`Query::run`].
    pub fn stream<P: RowParser>(
        self,
        manager: &ConnectionManager,
        diagnostics: &mut Diagnostics,
        parser: P,
    ) -> Result<StreamCursor<P>, QueryError> {
        let compiled = self.compile()?;
        let fetch_size = self.fetch_size.unwrap_or(manager.config().stream_fetch_size);
        let conn = manager.acquire(self.purpose)?;
        self.open_stream(compiled, conn, diagnostics, parser, fetch_size)
    }

    /// As [`Query::stream`], on a connection the caller already owns (e.g. one kept open by a
    /// previous stream).
    ///
    /// # Errors
    ///
    /// As [`Query::run`]; `conn` is closed on error.
    pub fn stream_on<P: RowParser>(
        self,
        conn: DbConnection,
        diagnostics: &mut Diagnostics,
        parser: P,
        fetch_size: usize,
    ) -> Result<StreamCursor<P>, QueryError> {
        let compiled = self.compile().map_err(|e| conn.fail(e))?;
        let fetch_size = self.fetch_size.unwrap_or(fetch_size);
        self.open_stream(compiled, conn, diagnostics, parser, fetch_size)
    }

    fn open_stream<P: RowParser>(
        self,
        compiled: CompiledQuery,
        conn: DbConnection,
        diagnostics: &mut Diagnostics,
        parser: P,
        fetch_size: usize,
    ) -> Result<StreamCursor<P>, QueryError> {
        let (sql, params) = compiled.statement();
        diagnostics.add_with(|| describe(sql, params));

        // Server-side cursors only live inside a transaction.
        if fetch_size > 0 {
            conn.begin(TransactionMode::CURSOR, diagnostics)?;
        }
        let mut prepared = conn.prepare(sql, diagnostics)?;
        prepared.bind_all(params).map_err(|e| conn.fail(e))?;
        prepared.set_fetch_size(fetch_size);
        let cursor = conn.query(&mut prepared, diagnostics)?;

        Ok(StreamCursor::new(
            conn,
            cursor,
            parser,
            ParseContext::new(self.caller, self.resolve_foreign_keys),
            self.keep_open,
            diagnostics.clone(),
            fetch_size,
        ))
    }

    /// Runs a write and returns the generated keys.
    ///
    /// # Errors
    ///
    /// As [`Query::run`].
    pub fn execute(
        self,
        manager: &ConnectionManager,
        diagnostics: &mut Diagnostics,
    ) -> Result<QueryResult<Vec<i64>>, QueryError> {
        let compiled = self.compile()?;
        let conn = manager.acquire(self.purpose)?;

        diagnostics.add_with(|| describe(&compiled.sql, &compiled.params));
        let mut prepared = conn.prepare(&compiled.sql, diagnostics)?;
        prepared.bind_all(&compiled.params).map_err(|e| conn.fail(e))?;
        let keys = conn.execute(&mut prepared, diagnostics)?;
        conn.close();

        Ok(QueryResult {
            diagnostics: diagnostics.clone(),
            payload: keys,
        })
    }
}

/// Statement text with its bound values, as recorded in diagnostics.
pub(crate) fn describe(sql: &str, params: &BoundParams) -> String {
    if params.is_empty() {
        return sql.to_string();
    }
    let values: Vec<String> = params.iter().map(|p| render_value(p.value())).collect();
    format!("{sql} -- [{}]", values.join(", "))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Bool(Some(v)) => v.to_string(),
        Value::Int(Some(v)) => v.to_string(),
        Value::BigInt(Some(v)) => v.to_string(),
        Value::Double(Some(v)) => v.to_string(),
        Value::String(Some(v)) => format!("'{}'", v.replace('\'', "''")),
        Value::ChronoDate(Some(v)) => format!("'{v}'"),
        Value::ChronoDateTime(Some(v)) => format!("'{v}'"),
        v if crate::binder::is_null(v) => "NULL".to_string(),
        other => format!("{other:?}"),
    }
}

/// SQL of the found-rows side query for a window.
pub(crate) fn side_count(compiled: &CompiledQuery) -> (String, BoundParams) {
    (count_sql(&compiled.sql), compiled.params.clone())
}
