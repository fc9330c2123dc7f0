//! # Query Executor
//!
//! Lowers [`QueryOptions`] onto one backend read and pages with the
//! limit + 1 probe: fetch one row more than requested, and if it arrives
//! there is another page. No count query is ever issued.
//!
//! Cursors are keyset boundaries `(sort value, id)`. Rows inserted ahead of
//! the boundary never shift pages already handed out, and rows sharing a
//! sort value are ordered by id so they are neither skipped nor repeated.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hx_core::Row;
use serde_json::Value;

use super::{PageCursor, PaginatedResult, QueryOptions, MAX_PAGE_SIZE};
use crate::backend::{bounded, Filter, OrderBy, TableBackend, TableQuery};
use crate::error::{Result, StoreError};
use crate::monitor::{QueryContext, QueryMetrics, QueryPerformanceMonitor};

/// Default pagination key: newest first, id as tie-breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub column: String,
    pub tie_breaker: String,
}

impl Default for SortKey {
    fn default() -> Self {
        Self {
            column: hx_core::columns::CREATED_AT.to_string(),
            tie_breaker: hx_core::columns::ID.to_string(),
        }
    }
}

pub struct QueryExecutor {
    backend: Arc<dyn TableBackend>,
    monitor: Arc<QueryPerformanceMonitor>,
    table: String,
    sort: SortKey,
    timeout: Option<Duration>,
}

impl QueryExecutor {
    pub fn new(
        backend: Arc<dyn TableBackend>,
        monitor: Arc<QueryPerformanceMonitor>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            monitor,
            table: table.into(),
            sort: SortKey::default(),
            timeout: None,
        }
    }

    pub fn with_sort_key(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// The ordering a page of `options` is walked in: the first `order_by`
    /// entry (or the sort key, descending) followed by the tie-breaker.
    fn ordering(&self, options: &QueryOptions) -> Vec<OrderBy> {
        let mut order = if options.order_by.is_empty() {
            vec![OrderBy::desc(&self.sort.column)]
        } else {
            options.order_by.clone()
        };
        if !order.iter().any(|o| o.column == self.sort.tie_breaker) {
            let direction = order[0].direction;
            order.push(OrderBy {
                column: self.sort.tie_breaker.clone(),
                direction,
            });
        }
        order
    }

    /// Build the backend read for one page. Pure; no I/O.
    pub fn build_query(&self, options: &QueryOptions) -> TableQuery {
        let order = self.ordering(options);
        let primary = &order[0];

        // The cursor is cut from the primary and tie columns, so they must
        // come back even when the caller narrowed the selection.
        let columns = options.select.clone().map(|mut cols| {
            for needed in [&primary.column, &self.sort.tie_breaker] {
                if !cols.iter().any(|c| c == needed) {
                    cols.push(needed.clone());
                }
            }
            cols
        });

        let mut filters: Vec<Filter> = options
            .filters
            .iter()
            .flat_map(|(column, clause)| clause.to_filters(column))
            .collect();

        if let Some(search) = &options.search {
            filters.push(Filter::Search {
                columns: search.columns.clone(),
                term: search.term.clone(),
            });
        }

        if let Some(cursor) = &options.cursor {
            filters.push(Filter::Keyset {
                column: primary.column.clone(),
                value: cursor.sort_value.clone(),
                tie_column: self.sort.tie_breaker.clone(),
                tie_value: cursor.id.clone(),
                direction: primary.direction,
            });
        }

        TableQuery {
            columns,
            filters,
            limit: Some(options.effective_limit() + 1),
            order,
        }
    }

    /// Fetch one page.
    pub async fn page(
        &self,
        query_name: &str,
        options: &QueryOptions,
        ctx: &QueryContext,
    ) -> Result<PaginatedResult<Row>> {
        let limit = options.effective_limit();
        let query = self.build_query(options);
        let primary_column = query.order[0].column.clone();

        let mut rows = self.select(query_name, query, ctx).await?;

        let has_more = rows.len() > limit;
        if has_more {
            rows.truncate(limit);
        }
        let next_cursor = if has_more {
            rows.last().map(|last| PageCursor {
                sort_value: last.get(&primary_column).cloned().unwrap_or(Value::Null),
                id: last.get(&self.sort.tie_breaker).cloned(),
            })
        } else {
            None
        };

        Ok(PaginatedResult {
            data: rows,
            has_more,
            next_cursor,
            total_count: None,
        })
    }

    /// Fetch at most one row.
    pub async fn fetch_one(
        &self,
        query_name: &str,
        options: &QueryOptions,
        ctx: &QueryContext,
    ) -> Result<Option<Row>> {
        let mut query = self.build_query(options);
        query.limit = Some(1);
        let rows = self.select(query_name, query, ctx).await?;
        Ok(rows.into_iter().next())
    }

    /// Walk every page of `options` at the maximum page size, folding each
    /// page into `acc`. Only one page is held at a time.
    pub async fn fold_pages<A, F>(
        &self,
        query_name: &str,
        options: &QueryOptions,
        ctx: &QueryContext,
        mut acc: A,
        mut fold: F,
    ) -> Result<A>
    where
        F: FnMut(A, Vec<Row>) -> A,
    {
        let mut options = options.clone().limit(MAX_PAGE_SIZE);
        loop {
            let page = self.page(query_name, &options, ctx).await?;
            acc = fold(acc, page.data);
            match page.next_cursor {
                Some(cursor) if page.has_more => options.cursor = Some(cursor),
                _ => return Ok(acc),
            }
        }
    }

    /// Collect every row matching `options`.
    pub async fn fetch_all(
        &self,
        query_name: &str,
        options: &QueryOptions,
        ctx: &QueryContext,
    ) -> Result<Vec<Row>> {
        self.fold_pages(query_name, options, ctx, Vec::new(), |mut all, page| {
            all.extend(page);
            all
        })
        .await
    }

    /// Delete rows matching every filter.
    pub async fn delete(
        &self,
        query_name: &str,
        filters: Vec<Filter>,
        ctx: &QueryContext,
    ) -> Result<usize> {
        let start = Instant::now();
        let result = bounded(self.timeout, self.backend.delete(&self.table, &filters)).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match result {
            Ok(removed) => {
                tracing::debug!(query = query_name, removed, elapsed_ms = elapsed, "delete");
                self.monitor
                    .record(QueryMetrics::new(query_name, elapsed, removed).with_context(ctx))
                    .await;
                Ok(removed)
            }
            Err(e) => {
                tracing::error!(query = query_name, "Delete failed: {}", e);
                self.monitor
                    .record(QueryMetrics::failed(query_name, elapsed, e.to_string()).with_context(ctx))
                    .await;
                Err(StoreError::Write {
                    query: query_name.to_string(),
                    source: e,
                })
            }
        }
    }

    async fn select(
        &self,
        query_name: &str,
        query: TableQuery,
        ctx: &QueryContext,
    ) -> Result<Vec<Row>> {
        let start = Instant::now();
        let result = bounded(self.timeout, self.backend.select(&self.table, &query)).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match result {
            Ok(rows) => {
                tracing::debug!(
                    query = query_name,
                    rows = rows.len(),
                    elapsed_ms = elapsed,
                    "select"
                );
                self.monitor
                    .record(QueryMetrics::new(query_name, elapsed, rows.len()).with_context(ctx))
                    .await;
                Ok(rows)
            }
            Err(e) => {
                tracing::error!(query = query_name, params = %query, "Query failed: {}", e);
                self.monitor
                    .record(QueryMetrics::failed(query_name, elapsed, e.to_string()).with_context(ctx))
                    .await;
                Err(StoreError::Query {
                    query: query_name.to_string(),
                    params: query.to_string(),
                    source: e,
                })
            }
        }
    }
}
