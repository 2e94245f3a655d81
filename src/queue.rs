//! The job queue: three priority lanes (`high` > `normal` > `low`) backed
//! by the `jobs` table, claimed by whichever worker mode is active.
//!
//! Two worker modes exist — a broker-backed mode (an external queue, e.g.
//! Redis, wakes a worker up) and a DB-polling mode — but both claim work
//! through the functions in this module, so neither duplicates the other's
//! claim/dispatch/retry discipline. `Config::queue.redis_url` only decides
//! which mode a deployment runs; no client for it is wired up yet, so an
//! `external_queue_id` written here is a placeholder seam for that future
//! integration, not a live broker push.

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{Job, JobPriority, JobStatus, JobType};

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: String,
    tenant_id: String,
    job_type: String,
    status: String,
    priority: i64,
    payload: String,
    result: Option<String>,
    error: Option<String>,
    attempts: i32,
    max_attempts: i32,
    progress: i32,
    progress_message: Option<String>,
    worker_id: Option<String>,
    external_queue_id: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl JobRow {
    fn into_job(self) -> anyhow::Result<Job> {
        Ok(Job {
            id: Uuid::parse_str(&self.id)?,
            tenant_id: Uuid::parse_str(&self.tenant_id)?,
            job_type: serde_json::from_value(Value::String(self.job_type))?,
            status: serde_json::from_value(Value::String(self.status))?,
            priority: self.priority,
            payload: serde_json::from_str(&self.payload)?,
            result: self.result.map(|r| serde_json::from_str(&r)).transpose()?,
            error: self.error,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            progress: self.progress,
            progress_message: self.progress_message,
            worker_id: self.worker_id,
            external_queue_id: self.external_queue_id,
            created_at: chrono::DateTime::parse_from_rfc3339(&self.created_at)?.with_timezone(&Utc),
            started_at: self.started_at.map(|s| chrono::DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc))).transpose()?,
            finished_at: self.finished_at.map(|s| chrono::DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc))).transpose()?,
        })
    }
}

/// The fixed parameter names a job type's payload is allowed to carry.
/// Anything else in a caller-supplied payload is dropped at enqueue time
/// rather than stored verbatim, so a job's shape is self-documenting and
/// a typo'd key never silently does nothing downstream.
pub fn allowed_payload_keys(job_type: JobType) -> &'static [&'static str] {
    use JobType::*;
    match job_type {
        Ingest => &["document_id", "source_url", "filename", "content_type"],
        Extract => &["version_id"],
        Embed => &["version_id", "force_reembed"],
        ProcessFull => &["version_id", "profile", "level", "process_context"],
        ProcessVersion => &["version_id", "reprocess"],
        BulkFolder => &["folder_path", "project_id"],
        BulkUrl => &["urls", "project_id"],
        MultilevelExtract => &["version_id", "profile", "levels", "process_context"],
        UpgradeExtractionLevel => &["version_id", "profile", "from_level", "to_level", "process_context"],
        DeleteDocument => &["document_id", "requested_by"],
    }
}

pub fn filter_payload(job_type: JobType, payload: Value) -> Value {
    let allowed = allowed_payload_keys(job_type);
    match payload {
        Value::Object(map) => Value::Object(map.into_iter().filter(|(k, _)| allowed.contains(&k.as_str())).collect()),
        other => other,
    }
}

pub async fn enqueue(pool: &SqlitePool, tenant_id: Uuid, job_type: JobType, payload: Value, priority: i64) -> anyhow::Result<Job> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let payload = filter_payload(job_type, payload);
    let type_str = serde_json::to_value(job_type)?.as_str().unwrap().to_string();

    sqlx::query(
        "INSERT INTO jobs (id, tenant_id, job_type, status, priority, payload, attempts, max_attempts, progress, created_at) \
         VALUES (?, ?, ?, 'queued', ?, ?, 0, 3, 0, ?)",
    )
    .bind(id.to_string())
    .bind(tenant_id.to_string())
    .bind(&type_str)
    .bind(priority)
    .bind(payload.to_string())
    .bind(now.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(Job {
        id,
        tenant_id,
        job_type,
        status: JobStatus::Queued,
        priority,
        payload,
        result: None,
        error: None,
        attempts: 0,
        max_attempts: 3,
        progress: 0,
        progress_message: None,
        worker_id: None,
        external_queue_id: None,
        created_at: now,
        started_at: None,
        finished_at: None,
    })
}

/// Claim the oldest queued job, preferring `high` priority over `normal`
/// over `low` (spec's `JobPriority::from_priority_integer` banding). Sets
/// `status = running`, stamps `started_at`/`worker_id`, and bumps
/// `attempts` in the same statement so two workers racing for the same
/// row can't both win — the `UPDATE ... WHERE status = 'queued'` only
/// succeeds for whichever worker gets there first.
pub async fn claim_next(pool: &SqlitePool, worker_id: &str) -> anyhow::Result<Option<Job>> {
    for queue_name in ["high", "normal", "low"] {
        let (lo, hi) = match queue_name {
            "high" => (10i64, i64::MAX),
            "low" => (i64::MIN, -1),
            _ => (0, 9),
        };

        let candidate: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM jobs WHERE status = 'queued' AND priority >= ? AND priority <= ? \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(lo)
        .bind(hi)
        .fetch_optional(pool)
        .await?;

        let Some((id,)) = candidate else { continue };
        let now = Utc::now().to_rfc3339();
        let claimed = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = ?, worker_id = ?, attempts = attempts + 1 \
             WHERE id = ? AND status = 'queued'",
        )
        .bind(&now)
        .bind(worker_id)
        .bind(&id)
        .execute(pool)
        .await?;

        if claimed.rows_affected() == 0 {
            continue; // lost the race to another worker; try the next lane
        }

        let row: JobRow = sqlx::query_as("SELECT * FROM jobs WHERE id = ?").bind(&id).fetch_one(pool).await?;
        return Ok(Some(row.into_job()?));
    }
    Ok(None)
}

pub async fn get_job(pool: &SqlitePool, job_id: Uuid) -> anyhow::Result<Option<Job>> {
    let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?").bind(job_id.to_string()).fetch_optional(pool).await?;
    row.map(|r| r.into_job()).transpose()
}

pub async fn list_jobs(pool: &SqlitePool, tenant_id: Uuid, status: Option<JobStatus>) -> anyhow::Result<Vec<Job>> {
    let rows: Vec<JobRow> = if let Some(status) = status {
        let status_str = serde_json::to_value(status)?.as_str().unwrap().to_string();
        sqlx::query_as("SELECT * FROM jobs WHERE tenant_id = ? AND status = ? ORDER BY created_at DESC")
            .bind(tenant_id.to_string())
            .bind(status_str)
            .fetch_all(pool)
            .await?
    } else {
        sqlx::query_as("SELECT * FROM jobs WHERE tenant_id = ? ORDER BY created_at DESC")
            .bind(tenant_id.to_string())
            .fetch_all(pool)
            .await?
    };
    rows.into_iter().map(|r| r.into_job()).collect()
}

pub async fn update_progress(pool: &SqlitePool, job_id: Uuid, progress: i32, message: Option<&str>) -> anyhow::Result<()> {
    sqlx::query("UPDATE jobs SET progress = ?, progress_message = ? WHERE id = ?")
        .bind(progress.clamp(0, 100))
        .bind(message)
        .bind(job_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Terminal states never regress (spec's "job terminal idempotence"): if
/// the job is already `succeeded`/`failed`/`canceled`, these calls do
/// nothing rather than overwrite history.
pub async fn complete_job(pool: &SqlitePool, job_id: Uuid, result: Value) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'succeeded', result = ?, progress = 100, finished_at = ? \
         WHERE id = ? AND status NOT IN ('succeeded', 'failed', 'canceled')",
    )
    .bind(result.to_string())
    .bind(Utc::now().to_rfc3339())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// On failure, a job that still has retry budget goes back to `queued`
/// rather than `failed` — it stays in its lane and gets reclaimed later;
/// only exhausting `max_attempts` is a terminal `failed`.
pub async fn fail_job(pool: &SqlitePool, job_id: Uuid, error: &str) -> anyhow::Result<()> {
    let job = get_job(pool, job_id).await?;
    let Some(job) = job else { return Ok(()) };
    if job.status.is_terminal() {
        return Ok(());
    }

    let now = Utc::now().to_rfc3339();
    if job.can_retry() {
        sqlx::query("UPDATE jobs SET status = 'queued', error = ?, started_at = NULL, worker_id = NULL WHERE id = ?")
            .bind(error)
            .bind(job_id.to_string())
            .execute(pool)
            .await?;
    } else {
        sqlx::query("UPDATE jobs SET status = 'failed', error = ?, finished_at = ? WHERE id = ?")
            .bind(error)
            .bind(&now)
            .bind(job_id.to_string())
            .execute(pool)
            .await?;
    }
    Ok(())
}

pub async fn cancel_job(pool: &SqlitePool, job_id: Uuid) -> anyhow::Result<bool> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'canceled', finished_at = ? WHERE id = ? AND status NOT IN ('succeeded', 'failed', 'canceled')",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Remove terminal jobs older than `older_than_days` for one tenant,
/// returning the number of rows removed.
pub async fn cleanup_old_jobs(pool: &SqlitePool, tenant_id: Uuid, older_than_days: i64) -> anyhow::Result<u64> {
    let cutoff = (Utc::now() - chrono::Duration::days(older_than_days)).to_rfc3339();
    let result = sqlx::query(
        "DELETE FROM jobs WHERE tenant_id = ? AND status IN ('succeeded', 'failed', 'canceled') AND finished_at IS NOT NULL AND finished_at < ?",
    )
    .bind(tenant_id.to_string())
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Batch-enqueue convenience used by the bulk ingestion job types: one
/// row per item, all in the same priority lane.
pub async fn enqueue_batch(
    pool: &SqlitePool,
    tenant_id: Uuid,
    job_type: JobType,
    payloads: Vec<Value>,
    priority: i64,
) -> anyhow::Result<Vec<Job>> {
    let mut jobs = Vec::with_capacity(payloads.len());
    for payload in payloads {
        jobs.push(enqueue(pool, tenant_id, job_type, payload, priority).await?);
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_banding_matches_queue_names() {
        assert_eq!(JobPriority::from_priority_integer(10).queue_name(), "high");
        assert_eq!(JobPriority::from_priority_integer(5).queue_name(), "normal");
        assert_eq!(JobPriority::from_priority_integer(-1).queue_name(), "low");
    }

    #[test]
    fn filter_payload_drops_unknown_keys() {
        let payload = serde_json::json!({"version_id": "abc", "hunter2": "dropped"});
        let filtered = filter_payload(JobType::Extract, payload);
        let obj = filtered.as_object().unwrap();
        assert!(obj.contains_key("version_id"));
        assert!(!obj.contains_key("hunter2"));
    }

    #[test]
    fn allowed_keys_are_distinct_per_job_type() {
        assert_ne!(allowed_payload_keys(JobType::Ingest), allowed_payload_keys(JobType::Embed));
    }
}
