use serde::{Deserialize, Serialize};

use crate::api::middleware::AppError;
use crate::models::PaginationConfig;

/// One result row: column name to value, in select-list order
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Rows returned by a driver plus timing
#[derive(Debug, Clone)]
pub struct RowSet {
    pub rows: Vec<Row>,
    pub execution_time_ms: u64,
}

/// Page metadata of a paginated result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub page: u64,
    pub size: u64,
    pub total_elements: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_previous: bool,
}

impl PaginationInfo {
    pub fn new(page: u64, size: u64, total_elements: u64) -> Self {
        let total_pages = if size == 0 { 0 } else { total_elements.div_ceil(size) };
        Self {
            page,
            size,
            total_elements,
            total_pages,
            has_next: page + 1 < total_pages,
            has_previous: page > 0,
        }
    }
}

/// Discriminated result handed to the boundary layer for serialization
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum QueryResult {
    Simple {
        data: Vec<Row>,
        cached: bool,
    },
    Paged {
        data: Vec<Row>,
        pagination: PaginationInfo,
        cached: bool,
    },
}

impl QueryResult {
    pub fn data(&self) -> &[Row] {
        match self {
            QueryResult::Simple { data, .. } | QueryResult::Paged { data, .. } => data,
        }
    }

    pub fn is_cached(&self) -> bool {
        match self {
            QueryResult::Simple { cached, .. } | QueryResult::Paged { cached, .. } => *cached,
        }
    }

    pub fn pagination(&self) -> Option<&PaginationInfo> {
        match self {
            QueryResult::Paged { pagination, .. } => Some(pagination),
            QueryResult::Simple { .. } => None,
        }
    }
}

/// Raw page request as supplied by the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    pub page: Option<i64>,
    pub size: Option<i64>,
}

/// A page request after validation against the endpoint's policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPage {
    pub page: u64,
    pub size: u64,
}

impl ResolvedPage {
    /// Rows skipped before this page. `resolve` guarantees it fits an `i64`.
    pub fn offset(&self) -> Option<i64> {
        self.page
            .checked_mul(self.size)
            .and_then(|offset| i64::try_from(offset).ok())
    }
}

impl PageRequest {
    pub fn new(page: i64, size: i64) -> Self {
        Self {
            page: Some(page),
            size: Some(size),
        }
    }

    /// Negative pages are rejected; sizes are clamped into `[1, max_size]`.
    pub fn resolve(&self, policy: &PaginationConfig) -> Result<ResolvedPage, AppError> {
        let page = self.page.unwrap_or(0);
        if page < 0 {
            return Err(AppError::Validation(format!(
                "Page index must not be negative, got {}",
                page
            )));
        }
        let max = i64::from(policy.max_size.max(1));
        let size = self
            .size
            .unwrap_or_else(|| i64::from(policy.default_size))
            .clamp(1, max);

        if page.checked_mul(size).is_none() {
            return Err(AppError::Validation(format!(
                "Page index {} is too large for page size {}",
                page, size
            )));
        }

        Ok(ResolvedPage {
            page: page as u64,
            size: size as u64,
        })
    }
}
