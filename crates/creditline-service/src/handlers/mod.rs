//! HTTP request handlers.

pub mod accounts;
pub mod admin;
pub mod credits;
pub mod health;
pub mod jobs;
pub mod payments;
pub mod referrals;
pub mod webhooks;

use serde::Deserialize;

/// Largest page a list endpoint returns.
pub const MAX_PAGE_SIZE: usize = 100;

/// List query parameters.
#[derive(Debug, Deserialize)]
pub struct Pagination {
    /// Maximum number of items to return (default: 50, at most 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

impl Pagination {
    /// Effective page size.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    /// Split a page fetched with `limit() + 1` rows into items and `has_more`.
    #[must_use]
    pub fn page<T>(&self, mut rows: Vec<T>) -> (Vec<T>, bool) {
        let has_more = rows.len() > self.limit();
        rows.truncate(self.limit());
        (rows, has_more)
    }
}
