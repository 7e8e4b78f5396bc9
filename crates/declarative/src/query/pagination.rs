//! Page-at-a-time access to query results.

use crate::error::ModelResult;
use crate::record::Record;
use crate::session::Session;

use super::Query;

/// Page size used when none is given.
pub const DEFAULT_PER_PAGE: i64 = 50;

/// One page of results plus the arithmetic around it.
#[derive(Debug, Clone)]
pub struct Pagination {
    /// The unlimited query this page was cut from
    pub query: Query,
    /// Current page number, 1-indexed
    pub page: i64,
    pub per_page: i64,
    /// Number of items matching the query
    pub total: i64,
    pub items: Vec<Record>,
    pub pages: i64,
    pub prev_num: i64,
    pub has_prev: bool,
    pub next_num: i64,
    pub has_next: bool,
}

impl Pagination {
    pub fn new(query: Query, page: i64, per_page: i64, total: i64, items: Vec<Record>) -> Self {
        let pages = if per_page <= 0 {
            0
        } else {
            (total as f64 / per_page as f64).ceil() as i64
        };
        Self {
            query,
            page,
            per_page,
            total,
            items,
            pages,
            prev_num: page.saturating_sub(1),
            has_prev: page > 1,
            next_num: page.saturating_add(1),
            has_next: page < pages,
        }
    }

    /// Pagination for the previous page.
    pub async fn prev(&self, session: &mut Session, error_out: bool) -> ModelResult<Pagination> {
        self.query
            .paginate(session, self.prev_num, Some(self.per_page), error_out)
            .await
    }

    /// Pagination for the next page.
    pub async fn next(&self, session: &mut Session, error_out: bool) -> ModelResult<Pagination> {
        self.query
            .paginate(session, self.next_num, Some(self.per_page), error_out)
            .await
    }
}
