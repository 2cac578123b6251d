use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::AuditLog;

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

/// `GET /organizations/:org_id/audit` query string.
///
/// Dates and the user id stay strings here so malformed values surface as
/// `ValidationError` with a field-specific message.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    #[serde(default = "default_page")]
    #[validate(range(min = 1, message = "page must be at least 1"))]
    pub page: u32,

    #[serde(default = "default_limit")]
    #[validate(range(min = 1, max = 100, message = "limit must be between 1 and 100"))]
    pub limit: u32,

    pub action: Option<String>,
    pub resource: Option<String>,
    pub user_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
            action: None,
            resource: None,
            user_id: None,
            start_date: None,
            end_date: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub total_pages: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Pagination {
    pub fn new(page: u32, limit: u32, total: i64) -> Self {
        let per_page = i64::from(limit.max(1));
        Self {
            page,
            limit,
            total,
            total_pages: (total + per_page - 1) / per_page,
            has_next: i64::from(page) * per_page < total,
            has_prev: page > 1,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPage {
    pub entries: Vec<AuditLog>,
    pub pagination: Pagination,
}

/// `DELETE /organizations/:org_id/audit` body. At least one field is required.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PurgeRequest {
    pub older_than: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResponse {
    pub deleted_count: u64,
}

/// Parse an RFC 3339 timestamp or name the offending field.
pub fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("{} must be an RFC 3339 date-time", field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_math() {
        let p = Pagination::new(1, 20, 45);
        assert_eq!(p.total_pages, 3);
        assert!(p.has_next);
        assert!(!p.has_prev);

        let p = Pagination::new(3, 20, 45);
        assert!(!p.has_next);
        assert!(p.has_prev);

        let p = Pagination::new(1, 20, 0);
        assert_eq!(p.total_pages, 0);
        assert!(!p.has_next);

        let p = Pagination::new(2, 10, 20);
        assert_eq!(p.total_pages, 2);
        assert!(!p.has_next);
    }

    #[test]
    fn limit_above_hundred_is_rejected() {
        let query = AuditQuery {
            limit: 101,
            ..AuditQuery::default()
        };
        assert!(query.validate().is_err());
        assert!(AuditQuery::default().validate().is_ok());
    }

    #[test]
    fn timestamps_must_be_rfc3339() {
        assert!(parse_timestamp("olderThan", "2024-01-01T00:00:00Z").is_ok());
        assert_eq!(
            parse_timestamp("olderThan", "yesterday").unwrap_err(),
            "olderThan must be an RFC 3339 date-time"
        );
    }
}
