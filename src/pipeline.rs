//! The per-version processing pipeline: a linear state machine driving a
//! [`ProcessingStatus`] from `uploaded` through `quality_checked`, with a
//! `failed` branch reachable from any stage.
//!
//! Each loop iteration performs exactly the work for one
//! [`ProcessingStatus::next`] transition and commits the new status before
//! moving on, so a crash mid-pipeline leaves the version at a well-defined
//! status that a later call resumes from rather than restarting. Every
//! stage is individually idempotent: spans upsert by hash, embeddings are
//! existence-checked by span id, and facts/quality are keyed to the
//! extraction run that produced them, so re-entering a stage that already
//! ran is a no-op rather than a duplicate.

use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::extract::{self, NoOpOcrProvider};
use crate::facts::{self, FactLlm};
use crate::models::{Profile, ProcessingStatus};
use crate::quality;
use crate::span;

pub struct Pipeline<'a> {
    pub pool: &'a SqlitePool,
    pub config: &'a Config,
    pub blob_store: &'a dyn crate::blob::BlobStore,
    pub embedder: Option<&'a dyn Embedder>,
    pub fact_llm: Option<&'a dyn FactLlm>,
}

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub profile: Profile,
    pub level: i32,
    pub process_context: String,
    /// Force derived state (spans, embeddings, facts, quality artifacts)
    /// to be torn down and recomputed from scratch, even though the
    /// version is already past those stages.
    pub reprocess: bool,
}

struct VersionRow {
    document_id: Uuid,
    blob_key: String,
    processing_status: ProcessingStatus,
}

async fn load_version(pool: &SqlitePool, version_id: Uuid, tenant_id: Uuid) -> anyhow::Result<VersionRow> {
    #[derive(sqlx::FromRow)]
    struct Row {
        document_id: String,
        blob_key: String,
        processing_status: String,
    }
    let row: Row = sqlx::query_as(
        "SELECT document_id, blob_key, processing_status FROM document_versions WHERE id = ? AND tenant_id = ?",
    )
    .bind(version_id.to_string())
    .bind(tenant_id.to_string())
    .fetch_one(pool)
    .await?;

    Ok(VersionRow {
        document_id: Uuid::parse_str(&row.document_id)?,
        blob_key: row.blob_key,
        processing_status: serde_json::from_value(serde_json::Value::String(row.processing_status))?,
    })
}

async fn document_meta(pool: &SqlitePool, document_id: Uuid) -> anyhow::Result<(String, String)> {
    let row: (String, String) = sqlx::query_as("SELECT original_filename, content_type FROM documents WHERE id = ?")
        .bind(document_id.to_string())
        .fetch_one(pool)
        .await?;
    Ok(row)
}

async fn set_status(pool: &SqlitePool, version_id: Uuid, status: ProcessingStatus, error: Option<&str>) -> anyhow::Result<()> {
    let status_str = serde_json::to_value(status)?.as_str().unwrap().to_string();
    sqlx::query("UPDATE document_versions SET processing_status = ?, last_error = ?, updated_at = ? WHERE id = ?")
        .bind(status_str)
        .bind(error)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(version_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

async fn fetch_artifact(pipeline: &Pipeline<'_>, version: &VersionRow) -> anyhow::Result<extract::ExtractionArtifact> {
    let bytes = pipeline.blob_store.get(&version.blob_key).await?;
    let (filename, content_type) = document_meta(pipeline.pool, version.document_id).await?;
    let artifact = extract::extract(
        &bytes,
        &content_type,
        Some(&filename),
        &NoOpOcrProvider,
        &pipeline.config.extraction,
    )
    .await?;
    Ok(artifact.finalize())
}

async fn run_extract_stage(pipeline: &Pipeline<'_>, version_id: Uuid, version: &VersionRow) -> anyhow::Result<ProcessingStatus> {
    let artifact = fetch_artifact(pipeline, version).await?;
    sqlx::query("UPDATE document_versions SET extracted_text = ?, page_count = ? WHERE id = ?")
        .bind(&artifact.text)
        .bind(artifact.page_count)
        .bind(version_id.to_string())
        .execute(pipeline.pool)
        .await?;
    Ok(ProcessingStatus::Extracted)
}

async fn run_spans_stage(pipeline: &Pipeline<'_>, tenant_id: Uuid, version_id: Uuid, version: &VersionRow) -> anyhow::Result<ProcessingStatus> {
    let artifact = fetch_artifact(pipeline, version).await?;
    let (_, content_type) = document_meta(pipeline.pool, version.document_id).await?;
    let spans = if matches!(content_type.as_str(), extract::MIME_XLSX | extract::MIME_XLS) {
        span::excel::generate_excel_spans(&artifact.tables, None)
    } else {
        span::generate_spans_for_text_artifact(&artifact, pipeline.config.ingestion.chunk_size, pipeline.config.ingestion.chunk_overlap)
    };

    let now = chrono::Utc::now().to_rfc3339();
    for s in &spans {
        let span_type_str = serde_json::to_value(s.span_type)?.as_str().unwrap().to_string();
        let (span_id,): (String,) = sqlx::query_as(
            "INSERT INTO spans (id, version_id, tenant_id, locator, end_locator, text_content, span_type, span_hash, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(version_id, span_hash) DO UPDATE SET text_content = excluded.text_content, metadata = excluded.metadata \
             RETURNING id",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(version_id.to_string())
        .bind(tenant_id.to_string())
        .bind(serde_json::to_string(&s.locator)?)
        .bind(s.end_locator.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&s.text_content)
        .bind(span_type_str)
        .bind(&s.span_hash)
        .bind(s.metadata.to_string())
        .bind(&now)
        .fetch_one(pipeline.pool)
        .await?;

        // spans_fts is a content-less index keyed by span id; re-upserting a
        // span (same version_id + span_hash) replaces its indexed text too.
        sqlx::query("DELETE FROM spans_fts WHERE span_id = ?")
            .bind(&span_id)
            .execute(pipeline.pool)
            .await?;
        sqlx::query("INSERT INTO spans_fts (span_id, version_id, tenant_id, text_content) VALUES (?, ?, ?, ?)")
            .bind(&span_id)
            .bind(version_id.to_string())
            .bind(tenant_id.to_string())
            .bind(&s.text_content)
            .execute(pipeline.pool)
            .await?;
    }
    Ok(ProcessingStatus::SpansBuilt)
}

async fn run_embed_stage(pipeline: &Pipeline<'_>, tenant_id: Uuid, version_id: Uuid) -> anyhow::Result<ProcessingStatus> {
    if let Some(embedder) = pipeline.embedder {
        if pipeline.config.embedding.is_enabled() {
            let count = crate::embedding::embed_pending_spans_for_version(
                pipeline.pool,
                &pipeline.config.embedding,
                embedder,
                tenant_id,
                version_id,
                false,
            )
            .await?;
            info!(%version_id, count, "embedded spans");
        }
    }
    Ok(ProcessingStatus::Embedded)
}

async fn run_facts_stage(pipeline: &Pipeline<'_>, tenant_id: Uuid, version_id: Uuid, opts: &ProcessOptions) -> anyhow::Result<ProcessingStatus> {
    let outcome = facts::run_extraction(
        pipeline.pool,
        pipeline.fact_llm,
        tenant_id,
        version_id,
        opts.profile,
        opts.level,
        &opts.process_context,
    )
    .await?;
    if !outcome.warnings.is_empty() {
        warn!(%version_id, warnings = ?outcome.warnings, "fact extraction run completed with warnings");
    }
    Ok(ProcessingStatus::FactsExtracted)
}

async fn run_quality_stage(pipeline: &Pipeline<'_>, tenant_id: Uuid, version_id: Uuid, opts: &ProcessOptions) -> anyhow::Result<ProcessingStatus> {
    if let Some(run_id) = facts::latest_completed_run(pipeline.pool, version_id, opts.profile, &opts.process_context).await? {
        quality::analyze_version(pipeline.pool, tenant_id, version_id, run_id).await?;
    }

    let text: Option<String> = sqlx::query_scalar("SELECT extracted_text FROM document_versions WHERE id = ?")
        .bind(version_id.to_string())
        .fetch_one(pipeline.pool)
        .await?;
    if let Some(text) = text {
        let truthfulness = quality::score_truthfulness(&text);
        let bias = quality::score_bias(&text);
        sqlx::query("UPDATE document_versions SET truthfulness_score = ?, bias_score = ? WHERE id = ?")
            .bind(truthfulness.score)
            .bind(bias)
            .bind(version_id.to_string())
            .execute(pipeline.pool)
            .await?;
    }
    Ok(ProcessingStatus::QualityChecked)
}

/// Delete every derived artifact for a version and rewind it to
/// `uploaded`, so the next call to [`process_version`] recomputes
/// everything from the stored blob. Used when `reprocess = true`.
async fn reset_derived_state(pool: &SqlitePool, version_id: Uuid) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    let run_ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM extraction_runs WHERE version_id = ?")
        .bind(version_id.to_string())
        .fetch_all(&mut *tx)
        .await?;
    for (run_id,) in &run_ids {
        for table in ["claims", "metrics", "constraints", "risks"] {
            let stmt = format!("DELETE FROM {table} WHERE extraction_run_id = ?");
            sqlx::query(&stmt).bind(run_id).execute(&mut *tx).await?;
        }
    }
    sqlx::query("DELETE FROM extraction_runs WHERE version_id = ?").bind(version_id.to_string()).execute(&mut *tx).await?;
    sqlx::query("DELETE FROM conflicts WHERE version_id = ?").bind(version_id.to_string()).execute(&mut *tx).await?;
    sqlx::query("DELETE FROM open_questions WHERE version_id = ?").bind(version_id.to_string()).execute(&mut *tx).await?;
    sqlx::query("DELETE FROM embedding_chunks WHERE version_id = ?").bind(version_id.to_string()).execute(&mut *tx).await?;
    sqlx::query("DELETE FROM spans WHERE version_id = ?").bind(version_id.to_string()).execute(&mut *tx).await?;
    sqlx::query(
        "UPDATE document_versions SET processing_status = 'uploaded', extracted_text = NULL, \
         truthfulness_score = NULL, bias_score = NULL, last_error = NULL WHERE id = ?",
    )
    .bind(version_id.to_string())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Drive a version through every remaining stage of the pipeline,
/// returning the status it ends at (`quality_checked` on success,
/// `failed` if a stage errored).
pub async fn process_version(pipeline: &Pipeline<'_>, tenant_id: Uuid, version_id: Uuid, opts: &ProcessOptions) -> anyhow::Result<ProcessingStatus> {
    if opts.reprocess {
        reset_derived_state(pipeline.pool, version_id).await?;
    }

    let mut version = load_version(pipeline.pool, version_id, tenant_id).await?;

    loop {
        let stage_result = match version.processing_status {
            ProcessingStatus::Pending | ProcessingStatus::Uploaded => run_extract_stage(pipeline, version_id, &version).await,
            ProcessingStatus::Extracted => run_spans_stage(pipeline, tenant_id, version_id, &version).await,
            ProcessingStatus::SpansBuilt => run_embed_stage(pipeline, tenant_id, version_id).await,
            ProcessingStatus::Embedded => run_facts_stage(pipeline, tenant_id, version_id, opts).await,
            ProcessingStatus::FactsExtracted => run_quality_stage(pipeline, tenant_id, version_id, opts).await,
            ProcessingStatus::QualityChecked | ProcessingStatus::Failed => return Ok(version.processing_status),
        };

        match stage_result {
            Ok(next_status) => {
                set_status(pipeline.pool, version_id, next_status, None).await?;
                version.processing_status = next_status;
                if next_status == ProcessingStatus::QualityChecked {
                    return Ok(next_status);
                }
            }
            Err(e) => {
                warn!(%version_id, error = %e, "pipeline stage failed");
                set_status(pipeline.pool, version_id, ProcessingStatus::Failed, Some(&e.to_string())).await?;
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_sequence_matches_processing_status_next() {
        let mut status = ProcessingStatus::Pending;
        let mut seen = vec![status];
        while let Some(next) = status.next() {
            seen.push(next);
            status = next;
        }
        assert_eq!(
            seen,
            vec![
                ProcessingStatus::Pending,
                ProcessingStatus::Uploaded,
                ProcessingStatus::Extracted,
                ProcessingStatus::SpansBuilt,
                ProcessingStatus::Embedded,
                ProcessingStatus::FactsExtracted,
                ProcessingStatus::QualityChecked,
            ]
        );
    }
}
