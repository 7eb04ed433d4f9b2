//! # Seedkeeper
//!
//! Filter compiler and paginated/streaming data access for genebank databases.
//!
//! A caller composes a [`filter::FilterExpression`] of column/operator/value conditions, the
//! compiler turns it into a parameterized predicate checked against a column whitelist, and a
//! [`Query`] runs it on PostgreSQL through `may_postgres`. Results come back as a single
//! object, a list, a page with its total match count, or a forward-only [`StreamCursor`].
//!
//! Every logical query owns one connection from open to close; connections are closed on
//! every exit path.

pub mod binder;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod filter;
pub mod materializer;
pub mod metrics;
pub mod pagination;
pub mod postgres;
pub mod query;
pub mod row;
pub mod transaction;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use binder::{BoundParams, Param, ParamSlots, SqlType};
pub use config::DatabaseConfig;
pub use connection::{ConnectionHandle, ConnectionManager, DbConnection, PreparedQuery, QueryPurpose};
pub use diagnostics::{CallerIdentity, Diagnostics, SessionGuard};
pub use error::{DriverError, QueryError};
pub use materializer::{ForeignKeyCache, ParseContext, RowParser};
pub use pagination::Pagination;
pub use query::{
    ExecutedQuery, PaginatedQueryResult, Query, QueryResult, StreamCursor, StreamState, FILTER_MARKER,
};
pub use row::{Row, RowIndex, TryGetable, ValueExtractionError};
pub use transaction::{AccessMode, IsolationLevel, TransactionMode};
