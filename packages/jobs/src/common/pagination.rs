//! Offset-based pagination types for admin listings.
//!
//! # Usage
//!
//! ```rust,ignore
//! let args = PageArgs { limit: Some(100), offset: None };
//! let validated = args.validate()?;
//! let (jobs, total) = store.list(&filter, validated).await?;
//! let page = Page::new(jobs, total, validated);
//! ```

use serde::{Deserialize, Serialize};

/// Default number of rows returned when no limit is given.
pub const DEFAULT_PAGE_LIMIT: i64 = 50;

/// Largest page a caller may request.
pub const MAX_PAGE_LIMIT: i64 = 1000;

/// Raw pagination input as received from a caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageArgs {
    /// Maximum rows to return (1-1000, default 50).
    pub limit: Option<i64>,
    /// Rows to skip (>= 0, default 0).
    pub offset: Option<i64>,
}

impl PageArgs {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: Some(limit),
            offset: Some(offset),
        }
    }

    /// Validate bounds and apply defaults.
    pub fn validate(&self) -> Result<ValidatedPageArgs, &'static str> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err("limit must be between 1 and 1000");
        }

        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err("offset must not be negative");
        }

        Ok(ValidatedPageArgs { limit, offset })
    }
}

/// Validated and normalized pagination arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedPageArgs {
    pub limit: i64,
    pub offset: i64,
}

impl Default for ValidatedPageArgs {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

/// One page of results plus the unpaginated total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, args: ValidatedPageArgs) -> Self {
        Self {
            items,
            total,
            limit: args.limit,
            offset: args.offset,
        }
    }

    /// Whether rows remain past this page.
    pub fn has_more(&self) -> bool {
        self.offset + (self.items.len() as i64) < self.total
    }
}
