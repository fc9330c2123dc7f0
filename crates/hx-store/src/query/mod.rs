//! # Declarative Queries and Cursor Pages
//!
//! [`QueryOptions`] describes a read the way callers think about it: which
//! columns, which `where` clauses per column, which order, how many rows and
//! where to resume. The [`executor::QueryExecutor`] lowers it to a backend
//! [`TableQuery`](crate::backend::TableQuery).

pub mod executor;

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::backend::{CompareOp, Filter, OrderBy};
use crate::error::StoreError;

/// Hard cap on rows per page.
pub const MAX_PAGE_SIZE: usize = 100;
/// Page size used when a caller leaves `limit` at 0.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Condition on one column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WhereClause {
    Equals(Value),
    OneOf(Vec<Value>),
    Compare { op: CompareOp, value: Value },
    /// Inclusive on both ends.
    Between { from: Value, to: Value },
}

impl WhereClause {
    pub fn to_filters(&self, column: &str) -> Vec<Filter> {
        match self {
            Self::Equals(value) => vec![Filter::eq(column, value.clone())],
            Self::OneOf(values) => vec![Filter::one_of(column, values.clone())],
            Self::Compare { op, value } => vec![Filter::compare(column, *op, value.clone())],
            Self::Between { from, to } => vec![
                Filter::compare(column, CompareOp::Gte, from.clone()),
                Filter::compare(column, CompareOp::Lte, to.clone()),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextSearch {
    pub columns: Vec<String>,
    pub term: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// `None` selects every column.
    pub select: Option<Vec<String>>,
    /// One clause per column, applied in column order.
    pub filters: BTreeMap<String, WhereClause>,
    /// Empty means the executor's sort key, descending.
    pub order_by: Vec<OrderBy>,
    /// Capped at [`MAX_PAGE_SIZE`]; 0 means [`DEFAULT_PAGE_SIZE`].
    pub limit: usize,
    pub cursor: Option<PageCursor>,
    pub search: Option<TextSearch>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn filter(mut self, column: impl Into<String>, clause: WhereClause) -> Self {
        self.filters.insert(column.into(), clause);
        self
    }

    pub fn where_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, WhereClause::Equals(value.into()))
    }

    pub fn where_in(self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.filter(column, WhereClause::OneOf(values))
    }

    pub fn where_cmp(self, column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        self.filter(
            column,
            WhereClause::Compare {
                op,
                value: value.into(),
            },
        )
    }

    pub fn where_between(
        self,
        column: impl Into<String>,
        from: impl Into<Value>,
        to: impl Into<Value>,
    ) -> Self {
        self.filter(
            column,
            WhereClause::Between {
                from: from.into(),
                to: to.into(),
            },
        )
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn cursor(mut self, cursor: Option<PageCursor>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn search<I, S>(mut self, columns: I, term: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search = Some(TextSearch {
            columns: columns.into_iter().map(Into::into).collect(),
            term: term.into(),
        });
        self
    }

    pub fn effective_limit(&self) -> usize {
        match self.limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }

    /// The equality value required for `column`, if any.
    pub fn required_eq(&self, column: &str) -> Option<&Value> {
        match self.filters.get(column) {
            Some(WhereClause::Equals(value)) => Some(value),
            _ => None,
        }
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// Resume point of a paginated listing: the sort-key value of the last row
/// handed out plus that row's id as tie-breaker.
///
/// On the wire the cursor is an opaque hex string. A token that is not hex
/// is taken as a bare sort-key value without tie-breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct PageCursor {
    pub sort_value: Value,
    pub id: Option<Value>,
}

impl PageCursor {
    pub fn new(sort_value: impl Into<Value>, id: Option<Value>) -> Self {
        Self {
            sort_value: sort_value.into(),
            id,
        }
    }

    pub fn encode(&self) -> String {
        hex::encode(serde_json::json!([self.sort_value, self.id]).to_string())
    }

    pub fn parse(token: &str) -> Result<Self, StoreError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(StoreError::invalid_input("empty cursor"));
        }
        let composite = hex::decode(token)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<(Value, Option<Value>)>(&bytes).ok());
        Ok(match composite {
            Some((sort_value, id)) => Self { sort_value, id },
            None => Self {
                sort_value: bare_sort_value(token),
                id: None,
            },
        })
    }
}

/// A legacy token is the sort value itself: numeric columns get a number so
/// the keyset compares numerically, everything else stays text.
fn bare_sort_value(token: &str) -> Value {
    match token.parse::<serde_json::Number>() {
        Ok(n) => Value::Number(n),
        Err(_) => Value::String(token.to_string()),
    }
}

impl Serialize for PageCursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for PageCursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        PageCursor::parse(&token).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Page
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResult<T> {
    pub data: Vec<T>,
    pub has_more: bool,
    /// Present iff `has_more` and `data` is non-empty.
    pub next_cursor: Option<PageCursor>,
    pub total_count: Option<u64>,
}

impl<T> PaginatedResult<T> {
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            has_more: false,
            next_cursor: None,
            total_count: None,
        }
    }

    pub fn try_map<U, E, F>(self, f: F) -> Result<PaginatedResult<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        Ok(PaginatedResult {
            data: self.data.into_iter().map(f).collect::<Result<_, _>>()?,
            has_more: self.has_more,
            next_cursor: self.next_cursor,
            total_count: self.total_count,
        })
    }
}
