//! # Tabular Backend Abstraction
//!
//! The data-access layer never speaks a wire protocol itself. Everything it
//! needs from the hosted database is expressed by [`TableBackend`]: column
//! selection, equality / membership / comparison filters, a keyset boundary
//! for cursors, a best-effort text search, ordering, limit, insert, upsert,
//! filtered delete and named server-side routines.

pub mod memory;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use hx_core::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BackendError;

/// Server-side routine pre-aggregating a user's analyses over a time range.
pub const AGGREGATES_ROUTINE: &str = "analysis_aggregates";
/// Server-side routine reducing a user's lifetime statistics.
pub const USER_STATISTICS_ROUTINE: &str = "analysis_user_statistics";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Desc,
        }
    }
}

/// A single row predicate. All filters of a [`TableQuery`] are ANDed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Filter {
    Eq {
        column: String,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    /// Case-insensitive substring match on any of `columns`.
    Search {
        columns: Vec<String>,
        term: String,
    },
    /// Rows strictly past the `(value, tie_value)` boundary when walking in
    /// `direction`. Without a tie value only `column` is compared.
    Keyset {
        column: String,
        value: Value,
        tie_column: String,
        tie_value: Option<Value>,
        direction: Direction,
    },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn one_of(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            column: column.into(),
            values,
        }
    }

    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Whether this is an equality filter on `column` with exactly `value`.
    pub fn is_eq(&self, column: &str, value: &Value) -> bool {
        matches!(self, Self::Eq { column: c, value: v } if c == column && v == value)
    }
}

/// A fully-resolved backend read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TableQuery {
    /// `None` selects every column.
    pub columns: Option<Vec<String>>,
    pub filters: Vec<Filter>,
    pub order: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl TableQuery {
    /// Whether the query is restricted to rows owned by `user_id`.
    pub fn is_scoped_to(&self, column: &str, user_id: &str) -> bool {
        let expected = Value::String(user_id.to_string());
        self.filters.iter().any(|f| f.is_eq(column, &expected))
    }
}

impl fmt::Display for TableQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// The capability the core is written against. Implementations wrap a hosted
/// database client; [`memory::MemoryBackend`] keeps tables in process.
#[async_trait::async_trait]
pub trait TableBackend: Send + Sync {
    async fn select(&self, table: &str, query: &TableQuery) -> Result<Vec<Row>, BackendError>;

    /// Insert all rows or none of them. Returns the number of rows written.
    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<usize, BackendError>;

    /// Insert-or-replace keyed on the `key` column.
    async fn upsert(&self, table: &str, key: &str, rows: Vec<Row>) -> Result<usize, BackendError>;

    /// Delete every row matching all `filters`. Returns the number removed.
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<usize, BackendError>;

    /// Invoke a named server-side routine.
    async fn call(&self, routine: &str, params: Value) -> Result<Value, BackendError>;
}

/// Await a backend future, bounded by `timeout` when one is configured.
pub(crate) async fn bounded<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(limit)),
        },
        None => fut.await,
    }
}
