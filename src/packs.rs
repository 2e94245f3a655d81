//! Evidence-pack CRUD and export (spec.md §6 "Evidence: … evidence-pack
//! CRUD and export"). A pack is a named, curated set of span/claim/metric
//! references; exporting one materializes those references into a
//! structured JSON tree rather than just handing back the id lists.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::models::EvidencePack;

#[derive(Debug, Clone, Default)]
pub struct PackEdit {
    pub name: Option<String>,
    pub description: Option<String>,
    pub span_ids: Option<Vec<Uuid>>,
    pub claim_ids: Option<Vec<Uuid>>,
    pub metric_ids: Option<Vec<Uuid>>,
}

#[derive(FromRow)]
struct PackRow {
    id: String,
    tenant_id: String,
    project_id: Option<String>,
    name: String,
    description: Option<String>,
    span_ids: String,
    claim_ids: String,
    metric_ids: String,
    created_at: String,
    updated_at: String,
}

impl PackRow {
    fn into_pack(self) -> anyhow::Result<EvidencePack> {
        Ok(EvidencePack {
            id: Uuid::parse_str(&self.id)?,
            tenant_id: Uuid::parse_str(&self.tenant_id)?,
            project_id: self.project_id.map(|p| Uuid::parse_str(&p)).transpose()?,
            name: self.name,
            description: self.description,
            span_ids: parse_uuid_list(&self.span_ids)?,
            claim_ids: parse_uuid_list(&self.claim_ids)?,
            metric_ids: parse_uuid_list(&self.metric_ids)?,
            created_at: chrono::DateTime::parse_from_rfc3339(&self.created_at)?.with_timezone(&Utc),
            updated_at: chrono::DateTime::parse_from_rfc3339(&self.updated_at)?.with_timezone(&Utc),
        })
    }
}

fn parse_uuid_list(s: &str) -> anyhow::Result<Vec<Uuid>> {
    let raw: Vec<String> = serde_json::from_str(s)?;
    Ok(raw.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect())
}

fn to_json_list(ids: &[Uuid]) -> String {
    serde_json::to_string(&ids.iter().map(|id| id.to_string()).collect::<Vec<_>>()).unwrap_or_else(|_| "[]".into())
}

pub async fn create_pack(
    pool: &SqlitePool,
    tenant_id: Uuid,
    project_id: Option<Uuid>,
    name: &str,
    description: Option<&str>,
) -> anyhow::Result<EvidencePack> {
    let id = Uuid::new_v4();
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO evidence_packs (id, tenant_id, project_id, name, description, span_ids, claim_ids, metric_ids, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, '[]', '[]', '[]', ?, ?)",
    )
    .bind(id.to_string())
    .bind(tenant_id.to_string())
    .bind(project_id.map(|p| p.to_string()))
    .bind(name)
    .bind(description)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    get_pack(pool, tenant_id, id).await?.ok_or_else(|| anyhow::anyhow!("pack vanished after insert"))
}

pub async fn get_pack(pool: &SqlitePool, tenant_id: Uuid, pack_id: Uuid) -> anyhow::Result<Option<EvidencePack>> {
    let row = sqlx::query_as::<_, PackRow>(
        "SELECT id, tenant_id, project_id, name, description, span_ids, claim_ids, metric_ids, created_at, updated_at \
         FROM evidence_packs WHERE id = ? AND tenant_id = ?",
    )
    .bind(pack_id.to_string())
    .bind(tenant_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(|r| r.into_pack()).transpose()
}

pub async fn list_packs(pool: &SqlitePool, tenant_id: Uuid, project_id: Option<Uuid>) -> anyhow::Result<Vec<EvidencePack>> {
    let rows = if let Some(project_id) = project_id {
        sqlx::query_as::<_, PackRow>(
            "SELECT id, tenant_id, project_id, name, description, span_ids, claim_ids, metric_ids, created_at, updated_at \
             FROM evidence_packs WHERE tenant_id = ? AND project_id = ? ORDER BY created_at DESC",
        )
        .bind(tenant_id.to_string())
        .bind(project_id.to_string())
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, PackRow>(
            "SELECT id, tenant_id, project_id, name, description, span_ids, claim_ids, metric_ids, created_at, updated_at \
             FROM evidence_packs WHERE tenant_id = ? ORDER BY created_at DESC",
        )
        .bind(tenant_id.to_string())
        .fetch_all(pool)
        .await?
    };
    rows.into_iter().map(|r| r.into_pack()).collect()
}

pub async fn update_pack(pool: &SqlitePool, tenant_id: Uuid, pack_id: Uuid, edit: PackEdit) -> anyhow::Result<Option<EvidencePack>> {
    let Some(existing) = get_pack(pool, tenant_id, pack_id).await? else {
        return Ok(None);
    };
    let name = edit.name.unwrap_or(existing.name);
    let description = edit.description.or(existing.description);
    let span_ids = edit.span_ids.unwrap_or(existing.span_ids);
    let claim_ids = edit.claim_ids.unwrap_or(existing.claim_ids);
    let metric_ids = edit.metric_ids.unwrap_or(existing.metric_ids);
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        "UPDATE evidence_packs SET name = ?, description = ?, span_ids = ?, claim_ids = ?, metric_ids = ?, updated_at = ? \
         WHERE id = ? AND tenant_id = ?",
    )
    .bind(&name)
    .bind(&description)
    .bind(to_json_list(&span_ids))
    .bind(to_json_list(&claim_ids))
    .bind(to_json_list(&metric_ids))
    .bind(&now)
    .bind(pack_id.to_string())
    .bind(tenant_id.to_string())
    .execute(pool)
    .await?;

    get_pack(pool, tenant_id, pack_id).await
}

pub async fn delete_pack(pool: &SqlitePool, tenant_id: Uuid, pack_id: Uuid) -> anyhow::Result<bool> {
    let result = sqlx::query("DELETE FROM evidence_packs WHERE id = ? AND tenant_id = ?")
        .bind(pack_id.to_string())
        .bind(tenant_id.to_string())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PackExport {
    pub pack_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub spans: Vec<serde_json::Value>,
    pub claims: Vec<serde_json::Value>,
    pub metrics: Vec<serde_json::Value>,
}

/// Materialize a pack's id references into the full rows they point at
/// (spec.md §6: "the export is the pack materialized to a structured JSON
/// tree of span + claim + metric blocks").
pub async fn export_pack(pool: &SqlitePool, tenant_id: Uuid, pack_id: Uuid) -> anyhow::Result<Option<PackExport>> {
    let Some(pack) = get_pack(pool, tenant_id, pack_id).await? else {
        return Ok(None);
    };

    let spans = fetch_rows(pool, tenant_id, "spans", "id, locator, end_locator, text_content, span_type, metadata", &pack.span_ids).await?;
    let claims = fetch_rows(pool, tenant_id, "claims", "id, subject, predicate, object, certainty, source_reliability, span_refs", &pack.claim_ids).await?;
    let metrics = fetch_rows(
        pool,
        tenant_id,
        "metrics",
        "id, entity, name, value_numeric, unit, currency, period_start, period_end, as_of, certainty, source_reliability, span_refs",
        &pack.metric_ids,
    )
    .await?;

    Ok(Some(PackExport {
        pack_id: pack.id,
        name: pack.name,
        description: pack.description,
        spans,
        claims,
        metrics,
    }))
}

async fn fetch_rows(
    pool: &SqlitePool,
    tenant_id: Uuid,
    table: &str,
    columns: &str,
    ids: &[Uuid],
) -> anyhow::Result<Vec<serde_json::Value>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("SELECT {columns} FROM {table} WHERE tenant_id = ? AND id IN ({placeholders})");
    let mut q = sqlx::query(&sql).bind(tenant_id.to_string());
    for id in ids {
        q = q.bind(id.to_string());
    }
    let rows = q.fetch_all(pool).await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(row_to_json(&row, columns));
    }
    Ok(out)
}

fn row_to_json(row: &sqlx::sqlite::SqliteRow, columns: &str) -> serde_json::Value {
    use sqlx::Row;
    let mut map = serde_json::Map::new();
    for (idx, name) in columns.split(',').map(|c| c.trim()).enumerate() {
        let value: serde_json::Value = row
            .try_get::<String, _>(idx)
            .map(serde_json::Value::from)
            .or_else(|_| row.try_get::<i64, _>(idx).map(serde_json::Value::from))
            .or_else(|_| row.try_get::<f64, _>(idx).map(serde_json::Value::from))
            .unwrap_or(serde_json::Value::Null);
        map.insert(name.to_string(), value);
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_list_roundtrips_through_json() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let json = to_json_list(&ids);
        assert_eq!(parse_uuid_list(&json).unwrap(), ids);
    }
}
