//! Audit trail: recording, paginated reads with redaction, and guarded purges.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::access::{AccessControl, ANY_MEMBER, ELEVATED, OWNER_ONLY};
use super::identity::{Actor, CallerIdentity};
use super::metrics::Metrics;
use super::store::{AuditFilter, AuditFilterOptions, PurgeFilter, Store};
use super::ServiceError;
use crate::dtos::audit::{parse_timestamp, AuditPage, AuditQuery, Pagination, PurgeRequest};
use crate::models::{AuditAction, AuditLog, AuditResource, Role, Scope};
use crate::utils::validation::{non_blank, parse_uuid};

pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_TERMS: [&str; 2] = ["secret", "password"];
const CLIENT_FIELDS: [&str; 2] = ["ip", "userAgent"];

fn is_sensitive(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_TERMS.iter().any(|term| key.contains(term))
}

/// Hide metadata the reader may not see.
///
/// Keys naming a secret or password are hidden from everyone, at any depth.
/// Request origin (`ip`, `userAgent`) is hidden from callers below admin.
pub fn redact_metadata(metadata: &Value, reader: Role) -> Value {
    match metadata {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let hidden = is_sensitive(key)
                        || (!reader.is_elevated() && CLIENT_FIELDS.contains(&key.as_str()));
                    let value = if hidden {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_metadata(value, reader)
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| redact_metadata(item, reader))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn Store>,
    access: AccessControl,
    metrics: Metrics,
    protected_actions: Arc<Vec<String>>,
}

impl AuditTrail {
    pub fn new(
        store: Arc<dyn Store>,
        access: AccessControl,
        metrics: Metrics,
        protected_actions: Vec<String>,
    ) -> Self {
        Self {
            store,
            access,
            metrics,
            protected_actions: Arc::new(protected_actions),
        }
    }

    /// Append one entry. The caller's ip and user agent are merged into the
    /// metadata. A failed write fails the calling operation.
    pub async fn record(
        &self,
        actor: &Actor,
        org_id: Uuid,
        action: AuditAction,
        resource: AuditResource,
        metadata: Value,
    ) -> Result<(), ServiceError> {
        self.write(Some(actor.user_id()), actor, org_id, action, resource, metadata)
            .await
    }

    /// Like [`record`](Self::record) but without a user reference, for
    /// events written after the acting user no longer exists.
    pub async fn record_detached(
        &self,
        actor: &Actor,
        org_id: Uuid,
        action: AuditAction,
        resource: AuditResource,
        metadata: Value,
    ) -> Result<(), ServiceError> {
        self.write(None, actor, org_id, action, resource, metadata)
            .await
    }

    async fn write(
        &self,
        user_id: Option<Uuid>,
        actor: &Actor,
        org_id: Uuid,
        action: AuditAction,
        resource: AuditResource,
        metadata: Value,
    ) -> Result<(), ServiceError> {
        let mut fields = match metadata {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("details".to_string(), other);
                map
            }
        };
        fields.insert("ip".to_string(), json!(actor.client.ip));
        fields.insert("userAgent".to_string(), json!(actor.client.user_agent));

        let mut entry = AuditLog::new(
            actor.user_id(),
            org_id,
            action,
            resource,
            Value::Object(fields),
        );
        entry.user_id = user_id;

        self.store.insert_audit_log(&entry).await.map_err(|e| {
            tracing::error!(
                org_id = %org_id,
                action = %entry.qualified_action(),
                error = %e,
                "Failed to write audit log"
            );
            e
        })?;

        self.metrics
            .record_audit_event(resource.as_str(), action.as_str());
        tracing::debug!(
            org_id = %org_id,
            user_id = %actor.user_id(),
            action = %entry.qualified_action(),
            "Audit event recorded"
        );
        Ok(())
    }

    /// Newest-first page of the organization's log. Any member may read;
    /// metadata is redacted for the caller's role.
    #[tracing::instrument(skip(self, caller, query), fields(user_id = %caller.user_id))]
    pub async fn query(
        &self,
        caller: &CallerIdentity,
        org_id: Uuid,
        query: AuditQuery,
    ) -> Result<AuditPage, ServiceError> {
        let membership = self
            .access
            .require_role(caller.user_id, Scope::Organization(org_id), ANY_MEMBER)
            .await?;

        if query.page < 1 {
            return Err(ServiceError::Validation("page must be at least 1".to_string()));
        }
        if !(1..=100).contains(&query.limit) {
            return Err(ServiceError::Validation(
                "limit must be between 1 and 100".to_string(),
            ));
        }

        let filter = AuditFilter {
            action: non_blank(query.action),
            resource: non_blank(query.resource),
            user_id: non_blank(query.user_id)
                .map(|id| parse_uuid("userId", &id))
                .transpose()?,
            start_date: non_blank(query.start_date)
                .map(|d| parse_timestamp("startDate", &d))
                .transpose()
                .map_err(ServiceError::Validation)?,
            end_date: non_blank(query.end_date)
                .map(|d| parse_timestamp("endDate", &d))
                .transpose()
                .map_err(ServiceError::Validation)?,
        };

        let limit = i64::from(query.limit);
        let offset = i64::from(query.page - 1) * limit;
        let (logs, total) = self
            .store
            .find_audit_logs(org_id, &filter, limit, offset)
            .await?;

        let entries = logs
            .into_iter()
            .map(|mut log| {
                log.metadata = redact_metadata(&log.metadata, membership.role);
                log
            })
            .collect();

        Ok(AuditPage {
            entries,
            pagination: Pagination::new(query.page, query.limit, total),
        })
    }

    /// Owner-only bulk delete. Requires at least one filter; protected
    /// actions are never deleted. A non-zero purge is itself audited.
    #[tracing::instrument(skip(self, actor, request), fields(user_id = %actor.user_id()))]
    pub async fn purge(
        &self,
        actor: &Actor,
        org_id: Uuid,
        request: PurgeRequest,
    ) -> Result<u64, ServiceError> {
        self.access
            .require_role(actor.user_id(), Scope::Organization(org_id), OWNER_ONLY)
            .await?;

        let filter = PurgeFilter {
            older_than: non_blank(request.older_than)
                .map(|d| parse_timestamp("olderThan", &d))
                .transpose()
                .map_err(ServiceError::Validation)?,
            action: non_blank(request.action),
            resource: non_blank(request.resource),
            user_id: non_blank(request.user_id)
                .map(|id| parse_uuid("userId", &id))
                .transpose()?,
        };
        if filter.is_empty() {
            return Err(ServiceError::Validation(
                "At least one filter (olderThan, action, resource, userId) is required".to_string(),
            ));
        }

        let deleted = self
            .store
            .purge_audit_logs(org_id, &filter, &self.protected_actions)
            .await?;

        if deleted > 0 {
            tracing::info!(org_id = %org_id, deleted, "Audit logs purged");
            self.record(
                actor,
                org_id,
                AuditAction::Delete,
                AuditResource::AuditLogs,
                json!({ "filters": filter, "deletedCount": deleted }),
            )
            .await?;
        }

        Ok(deleted)
    }

    /// Distinct actions, resources and users for filter pickers. Owner/admin only.
    pub async fn filter_options(
        &self,
        caller: &CallerIdentity,
        org_id: Uuid,
    ) -> Result<AuditFilterOptions, ServiceError> {
        self.access
            .require_role(caller.user_id, Scope::Organization(org_id), ELEVATED)
            .await?;
        self.store.audit_filter_options(org_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_sees_sensitive_and_client_fields_redacted() {
        let metadata = json!({
            "password": "x",
            "other": "y",
            "ip": "203.0.113.7",
            "userAgent": "curl/8.0"
        });

        let view = redact_metadata(&metadata, Role::Member);
        assert_eq!(view["password"], REDACTED);
        assert_eq!(view["other"], "y");
        assert_eq!(view["ip"], REDACTED);
        assert_eq!(view["userAgent"], REDACTED);
    }

    #[test]
    fn owner_sees_client_fields_but_not_passwords() {
        let metadata = json!({
            "password": "x",
            "other": "y",
            "ip": "203.0.113.7",
            "userAgent": "curl/8.0"
        });

        let view = redact_metadata(&metadata, Role::Owner);
        assert_eq!(view["password"], REDACTED);
        assert_eq!(view["ip"], "203.0.113.7");
        assert_eq!(view["userAgent"], "curl/8.0");
    }

    #[test]
    fn heuristic_is_case_insensitive_and_recursive() {
        let metadata = json!({
            "changes": [{ "ClientSecret": "abc", "name": "api" }],
            "nested": { "DB_PASSWORD_HINT": "pets", "key": "DATABASE_URL" }
        });

        let view = redact_metadata(&metadata, Role::Admin);
        assert_eq!(view["changes"][0]["ClientSecret"], REDACTED);
        assert_eq!(view["changes"][0]["name"], "api");
        assert_eq!(view["nested"]["DB_PASSWORD_HINT"], REDACTED);
        assert_eq!(view["nested"]["key"], "DATABASE_URL");
    }
}
