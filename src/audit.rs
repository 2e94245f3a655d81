//! Append-only audit log (spec.md §3 `AuditLog`). The transport that ships
//! these events elsewhere is out of scope (spec.md §1); this module only
//! appends rows within the same transaction as the action they describe.

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::TenantContext;

pub struct AuditEvent<'a> {
    pub action: &'a str,
    pub entity_type: &'a str,
    pub entity_id: Option<Uuid>,
    pub request_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: Value,
}

pub async fn record(pool: &SqlitePool, ctx: &TenantContext, event: AuditEvent<'_>) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO audit_log (id, tenant_id, action, actor_id, entity_type, entity_id, request_id, \
         ip_address, user_agent, details, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(ctx.tenant_id.to_string())
    .bind(event.action)
    .bind(ctx.actor_id.map(|id| id.to_string()))
    .bind(event.entity_type)
    .bind(event.entity_id.map(|id| id.to_string()))
    .bind(event.request_id)
    .bind(event.ip_address)
    .bind(event.user_agent)
    .bind(event.details.to_string())
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}
