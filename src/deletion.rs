//! Cascading deletion as a two-phase protocol over a declarative
//! dependency graph rather than a hardcoded imperative sequence: marking
//! a document enumerates every dependent resource as a [`DeletionTask`]
//! row ordered by [`DeletionTaskType::processing_order`]; execution walks
//! the graph level by level, running every task at a level concurrently
//! and only advancing once all of them reach a terminal state.
//!
//! Execution is resumable — a crash mid-run leaves `pending`/`in_progress`
//! rows behind, and [`run_deletion`] re-queries by `processing_order` on
//! every call, so restarting it picks up exactly where it left off.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::models::{DeletionStatus, DeletionTaskStatus, DeletionTaskType};

const MAX_RETRIES: i32 = 3;

/// Phase 1: mark a document for deletion and enumerate every dependent
/// resource as a task row. Idempotent — calling this twice on the same
/// document is a no-op the second time (the document is already marked).
pub async fn mark_for_deletion(pool: &SqlitePool, tenant_id: Uuid, document_id: Uuid, requested_by: Uuid) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;

    let status: Option<(String,)> = sqlx::query_as("SELECT deletion_status FROM documents WHERE id = ? AND tenant_id = ?")
        .bind(document_id.to_string())
        .bind(tenant_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
    let Some((status,)) = status else {
        anyhow::bail!("document not found");
    };
    if status != "active" {
        tx.commit().await?;
        return Ok(0);
    }

    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        "UPDATE documents SET deletion_status = 'marked_for_deletion', deletion_requested_by = ?, deletion_requested_at = ? WHERE id = ?",
    )
    .bind(requested_by.to_string())
    .bind(&now)
    .bind(document_id.to_string())
    .execute(&mut *tx)
    .await?;

    let mut created = 0usize;
    for task_type in DeletionTaskType::all_in_order() {
        let resource_ids = enumerate_resources(&mut tx, document_id, task_type).await?;
        if resource_ids.is_empty() {
            // Tasks with no per-resource granularity (e.g. the final
            // `document_record` step) still get exactly one row so the
            // level always has something to advance past.
            if matches!(
                task_type,
                DeletionTaskType::DocumentRecord | DeletionTaskType::ProjectDocuments | DeletionTaskType::DocumentVersions
            ) {
                insert_task(&mut tx, tenant_id, document_id, task_type, None).await?;
                created += 1;
            }
            continue;
        }
        for resource_id in resource_ids {
            insert_task(&mut tx, tenant_id, document_id, task_type, Some(resource_id)).await?;
            created += 1;
        }
    }

    tx.commit().await?;
    info!(%document_id, created, "document marked for deletion");
    Ok(created)
}

async fn insert_task(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    tenant_id: Uuid,
    document_id: Uuid,
    task_type: DeletionTaskType,
    resource_id: Option<Uuid>,
) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let type_str = serde_json::to_value(task_type)?.as_str().unwrap().to_string();
    sqlx::query(
        "INSERT INTO deletion_tasks (id, tenant_id, document_id, task_type, resource_id, processing_order, status, retry_count, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(tenant_id.to_string())
    .bind(document_id.to_string())
    .bind(&type_str)
    .bind(resource_id.map(|id| id.to_string()))
    .bind(task_type.processing_order())
    .bind(&now)
    .bind(&now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn enumerate_resources(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: Uuid,
    task_type: DeletionTaskType,
) -> anyhow::Result<Vec<Uuid>> {
    let rows: Vec<(String,)> = match task_type {
        DeletionTaskType::StorageFile => {
            sqlx::query_as("SELECT id FROM document_versions WHERE document_id = ?")
                .bind(document_id.to_string())
                .fetch_all(&mut **tx)
                .await?
        }
        DeletionTaskType::EmbeddingChunks => {
            sqlx::query_as(
                "SELECT e.id FROM embedding_chunks e JOIN document_versions v ON v.id = e.version_id WHERE v.document_id = ?",
            )
            .bind(document_id.to_string())
            .fetch_all(&mut **tx)
            .await?
        }
        DeletionTaskType::Spans => {
            sqlx::query_as("SELECT s.id FROM spans s JOIN document_versions v ON v.id = s.version_id WHERE v.document_id = ?")
                .bind(document_id.to_string())
                .fetch_all(&mut **tx)
                .await?
        }
        DeletionTaskType::FactsClaims => {
            sqlx::query_as("SELECT c.id FROM claims c JOIN document_versions v ON v.id = c.version_id WHERE v.document_id = ?")
                .bind(document_id.to_string())
                .fetch_all(&mut **tx)
                .await?
        }
        DeletionTaskType::FactsMetrics => {
            sqlx::query_as("SELECT m.id FROM metrics m JOIN document_versions v ON v.id = m.version_id WHERE v.document_id = ?")
                .bind(document_id.to_string())
                .fetch_all(&mut **tx)
                .await?
        }
        DeletionTaskType::FactsConstraints => {
            sqlx::query_as(
                "SELECT c.id FROM constraints c JOIN document_versions v ON v.id = c.version_id WHERE v.document_id = ?",
            )
            .bind(document_id.to_string())
            .fetch_all(&mut **tx)
            .await?
        }
        DeletionTaskType::FactsRisks => {
            sqlx::query_as("SELECT r.id FROM risks r JOIN document_versions v ON v.id = r.version_id WHERE v.document_id = ?")
                .bind(document_id.to_string())
                .fetch_all(&mut **tx)
                .await?
        }
        DeletionTaskType::QualityConflicts => {
            sqlx::query_as(
                "SELECT c.id FROM conflicts c JOIN document_versions v ON v.id = c.version_id WHERE v.document_id = ?",
            )
            .bind(document_id.to_string())
            .fetch_all(&mut **tx)
            .await?
        }
        DeletionTaskType::QualityOpenQuestions => {
            sqlx::query_as(
                "SELECT q.id FROM open_questions q JOIN document_versions v ON v.id = q.version_id WHERE v.document_id = ?",
            )
            .bind(document_id.to_string())
            .fetch_all(&mut **tx)
            .await?
        }
        DeletionTaskType::ExtractionRuns => {
            sqlx::query_as(
                "SELECT e.id FROM extraction_runs e JOIN document_versions v ON v.id = e.version_id WHERE v.document_id = ?",
            )
            .bind(document_id.to_string())
            .fetch_all(&mut **tx)
            .await?
        }
        DeletionTaskType::ProjectDocuments | DeletionTaskType::DocumentVersions | DeletionTaskType::DocumentRecord => {
            Vec::new()
        }
    };
    Ok(rows.into_iter().filter_map(|(id,)| Uuid::parse_str(&id).ok()).collect())
}

/// Phase 2: execute pending tasks in ascending `processing_order`. Tasks
/// sharing an order run concurrently; the engine advances a level only
/// once every task in it is terminal (`completed`, `failed` past retry
/// budget, or `skipped`). Safe to call repeatedly — a prior crash just
/// means some tasks are still `pending`/`in_progress` and get re-claimed.
pub async fn run_deletion(pool: &SqlitePool, blob_store: Arc<dyn BlobStore>, tenant_id: Uuid, document_id: Uuid) -> anyhow::Result<()> {
    for task_type in DeletionTaskType::all_in_order() {
        let order = task_type.processing_order();
        loop {
            let pending = claim_tasks_at_level(pool, tenant_id, document_id, order).await?;
            if pending.is_empty() {
                break;
            }
            let mut set = JoinSet::new();
            for task in pending {
                let pool = pool.clone();
                let blob_store = blob_store.clone();
                set.spawn(async move {
                    let task_id = task.id;
                    let result = execute_task(&pool, blob_store.as_ref(), &task).await;
                    (task_id, result)
                });
            }
            while let Some(joined) = set.join_next().await {
                let (task_id, result) = joined?;
                if let Err(e) = result {
                    warn!(%task_id, error = %e, "deletion task failed");
                }
            }
        }

        let unresolved = count_unresolved(pool, document_id, order).await?;
        if unresolved > 0 {
            sqlx::query("UPDATE documents SET deletion_status = 'deletion_failed' WHERE id = ?")
                .bind(document_id.to_string())
                .execute(pool)
                .await?;
            anyhow::bail!("deletion stalled at processing order {order}: {unresolved} task(s) exhausted retries");
        }
    }

    finalize_document_record(pool, document_id).await?;
    info!(%document_id, "document deletion complete");
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TaskRow {
    id: String,
    task_type: String,
    resource_id: Option<String>,
    retry_count: i32,
}

struct ClaimedTask {
    id: Uuid,
    task_type: DeletionTaskType,
    resource_id: Option<Uuid>,
    retry_count: i32,
}

async fn claim_tasks_at_level(pool: &SqlitePool, tenant_id: Uuid, document_id: Uuid, order: i32) -> anyhow::Result<Vec<ClaimedTask>> {
    let rows: Vec<TaskRow> = sqlx::query_as(
        "SELECT id, task_type, resource_id, retry_count FROM deletion_tasks \
         WHERE document_id = ? AND processing_order = ? AND status IN ('pending', 'in_progress')",
    )
    .bind(document_id.to_string())
    .bind(order)
    .fetch_all(pool)
    .await?;

    let now = chrono::Utc::now().to_rfc3339();
    let mut claimed = Vec::new();
    for row in rows {
        if row.retry_count > MAX_RETRIES {
            continue;
        }
        sqlx::query("UPDATE deletion_tasks SET status = 'in_progress', updated_at = ? WHERE id = ? AND tenant_id = ?")
            .bind(&now)
            .bind(&row.id)
            .bind(tenant_id.to_string())
            .execute(pool)
            .await?;
        let Ok(id) = Uuid::parse_str(&row.id) else { continue };
        let task_type: DeletionTaskType = serde_json::from_value(serde_json::Value::String(row.task_type.clone()))?;
        claimed.push(ClaimedTask {
            id,
            task_type,
            resource_id: row.resource_id.as_deref().and_then(|s| Uuid::parse_str(s).ok()),
            retry_count: row.retry_count,
        });
    }
    Ok(claimed)
}

async fn execute_task(pool: &SqlitePool, blob_store: &dyn BlobStore, task: &ClaimedTask) -> anyhow::Result<()> {
    let result = delete_resource(pool, blob_store, task).await;
    let now = chrono::Utc::now().to_rfc3339();
    match result {
        Ok(()) => {
            sqlx::query("UPDATE deletion_tasks SET status = 'completed', updated_at = ? WHERE id = ?")
                .bind(&now)
                .bind(task.id.to_string())
                .execute(pool)
                .await?;
        }
        Err(e) => {
            let new_retry = task.retry_count + 1;
            let status = if new_retry > MAX_RETRIES { "failed" } else { "pending" };
            sqlx::query("UPDATE deletion_tasks SET status = ?, retry_count = ?, error = ?, updated_at = ? WHERE id = ?")
                .bind(status)
                .bind(new_retry)
                .bind(e.to_string())
                .bind(&now)
                .bind(task.id.to_string())
                .execute(pool)
                .await?;
            return Err(e);
        }
    }
    Ok(())
}

async fn delete_resource(pool: &SqlitePool, blob_store: &dyn BlobStore, task: &ClaimedTask) -> anyhow::Result<()> {
    use DeletionTaskType::*;
    match task.task_type {
        StorageFile => {
            let Some(version_id) = task.resource_id else { return Ok(()) };
            let row: Option<(String,)> = sqlx::query_as("SELECT blob_key FROM document_versions WHERE id = ?")
                .bind(version_id.to_string())
                .fetch_optional(pool)
                .await?;
            if let Some((key,)) = row {
                blob_store.delete(&key).await?;
            }
            Ok(())
        }
        EmbeddingChunks => delete_by_id(pool, "embedding_chunks", task.resource_id).await,
        Spans => {
            if let Some(span_id) = task.resource_id {
                sqlx::query("DELETE FROM spans_fts WHERE span_id = ?")
                    .bind(span_id.to_string())
                    .execute(pool)
                    .await?;
            }
            delete_by_id(pool, "spans", task.resource_id).await
        }
        FactsClaims => delete_by_id(pool, "claims", task.resource_id).await,
        FactsMetrics => delete_by_id(pool, "metrics", task.resource_id).await,
        FactsConstraints => delete_by_id(pool, "constraints", task.resource_id).await,
        FactsRisks => delete_by_id(pool, "risks", task.resource_id).await,
        QualityConflicts => delete_by_id(pool, "conflicts", task.resource_id).await,
        QualityOpenQuestions => delete_by_id(pool, "open_questions", task.resource_id).await,
        ExtractionRuns => delete_by_id(pool, "extraction_runs", task.resource_id).await,
        ProjectDocuments => {
            let doc_id = document_id_for_task(pool, task.id).await?;
            sqlx::query("DELETE FROM project_documents WHERE document_id = ?")
                .bind(doc_id.to_string())
                .execute(pool)
                .await?;
            Ok(())
        }
        DocumentVersions => {
            let doc_id = document_id_for_task(pool, task.id).await?;
            sqlx::query("DELETE FROM document_versions WHERE document_id = ?")
                .bind(doc_id.to_string())
                .execute(pool)
                .await?;
            Ok(())
        }
        DocumentRecord => Ok(()), // handled by `finalize_document_record` once every other level is clear
    }
}

async fn delete_by_id(pool: &SqlitePool, table: &str, resource_id: Option<Uuid>) -> anyhow::Result<()> {
    let Some(id) = resource_id else { return Ok(()) };
    let stmt = format!("DELETE FROM {table} WHERE id = ?");
    sqlx::query(&stmt).bind(id.to_string()).execute(pool).await?;
    Ok(())
}

async fn document_id_for_task(pool: &SqlitePool, task_id: Uuid) -> anyhow::Result<Uuid> {
    let row: (Option<String>,) = sqlx::query_as("SELECT document_id FROM deletion_tasks WHERE id = ?")
        .bind(task_id.to_string())
        .fetch_one(pool)
        .await?;
    row.0
        .and_then(|s| Uuid::parse_str(&s).ok())
        .ok_or_else(|| anyhow::anyhow!("deletion task has no document_id"))
}

async fn count_unresolved(pool: &SqlitePool, document_id: Uuid, order: i32) -> anyhow::Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM deletion_tasks WHERE document_id = ? AND processing_order = ? AND status = 'failed'",
    )
    .bind(document_id.to_string())
    .bind(order)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

/// The last step: delete the document row itself and clear the FK on
/// every surviving task row so they persist as a headless audit trail
/// rather than cascading away with the document.
async fn finalize_document_record(pool: &SqlitePool, document_id: Uuid) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE deletion_tasks SET status = 'completed', updated_at = ? \
         WHERE document_id = ? AND task_type = 'document_record' AND status IN ('pending', 'in_progress')",
    )
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(document_id.to_string())
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(document_id.to_string())
        .execute(&mut *tx)
        .await?;

    sqlx::query("UPDATE deletion_tasks SET document_id = NULL WHERE document_id = ?")
        .bind(document_id.to_string())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Accepted but unused directly — kept so callers can assert the
/// terminal deletion_status variant without importing `models` too.
pub fn terminal_status() -> DeletionStatus {
    DeletionStatus::Deleted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_order_matches_declared_graph_levels() {
        let ordered: Vec<i32> = DeletionTaskType::all_in_order().iter().map(|t| t.processing_order()).collect();
        for window in ordered.windows(2) {
            assert!(window[0] <= window[1], "task order must be non-decreasing");
        }
    }

    #[test]
    fn task_status_terminal_set_excludes_pending_and_in_progress() {
        assert_ne!(DeletionTaskStatus::Pending, DeletionTaskStatus::Completed);
        assert_ne!(DeletionTaskStatus::InProgress, DeletionTaskStatus::Failed);
    }
}
