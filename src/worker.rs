//! Job execution: turns a claimed [`Job`] row into calls against
//! [`pipeline`], [`facts`], [`quality`], and [`deletion`].
//!
//! A [`Worker`] owns every vendor-swappable dependency (embedder, fact LLM,
//! blob store) for the lifetime of the process and is shared between the
//! polling loop driven by `evidctl worker` and any future in-process
//! dispatch path; nothing here assumes how a job was claimed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::facts::{self, FactLlm};
use crate::models::{Job, JobType, Profile};
use crate::pipeline::{self, Pipeline, ProcessOptions};
use crate::quality;
use crate::queue;
use crate::validation;

pub struct Worker {
    pub pool: SqlitePool,
    pub config: Config,
    pub blob_store: Arc<dyn BlobStore>,
    pub embedder: Option<Box<dyn Embedder>>,
    pub fact_llm: Option<Box<dyn FactLlm>>,
}

impl Worker {
    pub fn new(pool: SqlitePool, config: Config) -> Result<Self> {
        let blob_store: Arc<dyn BlobStore> = Arc::from(crate::blob::build_blob_store(&config.storage)?);
        let embedder = crate::embedding::build_embedder(&config.embedding)?;
        let fact_llm = crate::facts::build_fact_llm(&config.extraction);
        Ok(Worker { pool, config, blob_store, embedder, fact_llm })
    }

    fn as_pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            pool: &self.pool,
            config: &self.config,
            blob_store: self.blob_store.as_ref(),
            embedder: self.embedder.as_deref(),
            fact_llm: self.fact_llm.as_deref(),
        }
    }

    /// Claim and run at most one job. Returns `true` if a job was claimed
    /// (regardless of whether it ultimately succeeded), `false` if the
    /// queue was empty.
    pub async fn run_once(&self, worker_id: &str) -> Result<bool> {
        let job = match queue::claim_next(&self.pool, worker_id).await? {
            Some(job) => job,
            None => return Ok(false),
        };

        info!(job_id = %job.id, job_type = ?job.job_type, tenant_id = %job.tenant_id, "claimed job");
        match self.dispatch(&job).await {
            Ok(result) => {
                queue::complete_job(&self.pool, job.id, result.unwrap_or(serde_json::Value::Null)).await?;
                info!(job_id = %job.id, "job succeeded");
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "job failed");
                queue::fail_job(&self.pool, job.id, &e.to_string()).await?;
            }
        }
        Ok(true)
    }

    /// Poll the queue until `shutdown` is set, sleeping `poll_interval`
    /// between empty polls. Checked between every claim attempt so a
    /// SIGINT/SIGTERM during an idle wait exits within one sleep interval.
    pub async fn run_polling_loop(&self, worker_id: &str, poll_interval: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!(worker_id, "worker starting poll loop");
        while !shutdown.load(Ordering::SeqCst) {
            match self.run_once(worker_id).await {
                Ok(true) => continue,
                Ok(false) => tokio::time::sleep(poll_interval).await,
                Err(e) => {
                    warn!(error = %e, "worker loop iteration errored, backing off");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
        info!(worker_id, "worker received shutdown signal, exiting poll loop");
        Ok(())
    }

    async fn dispatch(&self, job: &Job) -> Result<Option<serde_json::Value>> {
        match job.job_type {
            JobType::Ingest => self.run_ingest(job).await.map(Some),
            JobType::Extract | JobType::Embed | JobType::ProcessVersion => {
                self.run_process_version(job).await.map(Some)
            }
            JobType::ProcessFull => self.run_process_full(job).await.map(Some),
            JobType::BulkFolder => self.run_bulk_folder(job).await.map(Some),
            JobType::BulkUrl => self.run_bulk_url(job).await.map(Some),
            JobType::MultilevelExtract => self.run_multilevel_extract(job).await.map(Some),
            JobType::UpgradeExtractionLevel => self.run_upgrade_level(job).await.map(Some),
            JobType::DeleteDocument => self.run_delete_document(job).await.map(Some),
        }
    }

    async fn run_ingest(&self, job: &Job) -> Result<serde_json::Value> {
        let payload = &job.payload;
        let document_id = parse_uuid_field(payload, "document_id")?;
        let source_url = payload.get("source_url").and_then(|v| v.as_str());
        let filename = payload
            .get("filename")
            .and_then(|v| v.as_str())
            .unwrap_or("upload")
            .to_string();
        let content_type = payload
            .get("content_type")
            .and_then(|v| v.as_str())
            .unwrap_or("application/octet-stream")
            .to_string();

        let bytes = match source_url {
            Some(url) => {
                validation::validate_url_for_ssrf(url).context("blocked source url")?;
                let client = reqwest::Client::new();
                let resp = client.get(url).send().await.context("downloading source_url")?;
                resp.bytes().await.context("reading source_url body")?.to_vec()
            }
            None => return Err(anyhow!("ingest job requires source_url")),
        };

        let sanitized = validation::sanitize_filename(&filename);
        let version_id = create_document_version(
            &self.pool,
            job.tenant_id,
            document_id,
            self.blob_store.as_ref(),
            &sanitized,
            &content_type,
            &bytes,
        )
        .await?;

        let status = pipeline::process_version(
            &self.as_pipeline(),
            job.tenant_id,
            version_id,
            &ProcessOptions {
                profile: Profile::General,
                level: self.config.extraction.default_level,
                process_context: "general".to_string(),
                reprocess: false,
            },
        )
        .await?;

        Ok(serde_json::json!({"version_id": version_id, "processing_status": status}))
    }

    async fn run_process_version(&self, job: &Job) -> Result<serde_json::Value> {
        let version_id = parse_uuid_field(&job.payload, "version_id")?;
        let reprocess = job.payload.get("reprocess").and_then(|v| v.as_bool()).unwrap_or(false);
        let opts = ProcessOptions {
            profile: Profile::General,
            level: self.config.extraction.default_level,
            process_context: "general".to_string(),
            reprocess,
        };
        let status = pipeline::process_version(&self.as_pipeline(), job.tenant_id, version_id, &opts).await?;
        Ok(serde_json::json!({"processing_status": status}))
    }

    async fn run_process_full(&self, job: &Job) -> Result<serde_json::Value> {
        let version_id = parse_uuid_field(&job.payload, "version_id")?;
        let profile = parse_profile(&job.payload).unwrap_or(Profile::General);
        let level = job.payload.get("level").and_then(|v| v.as_i64()).unwrap_or(1) as i32;
        let process_context = job
            .payload
            .get("process_context")
            .and_then(|v| v.as_str())
            .unwrap_or("general")
            .to_string();
        let opts = ProcessOptions { profile, level, process_context, reprocess: false };
        let status = pipeline::process_version(&self.as_pipeline(), job.tenant_id, version_id, &opts).await?;
        Ok(serde_json::json!({"processing_status": status}))
    }

    /// Extracts facts at every level in `levels`, on top of whatever level
    /// the base pipeline run already produced. Each additional level is an
    /// independent extraction run keyed to `(version, profile, level,
    /// process_context)`, not a replay of the whole pipeline.
    async fn run_multilevel_extract(&self, job: &Job) -> Result<serde_json::Value> {
        let version_id = parse_uuid_field(&job.payload, "version_id")?;
        let profile = parse_profile(&job.payload).unwrap_or(Profile::General);
        let process_context = job
            .payload
            .get("process_context")
            .and_then(|v| v.as_str())
            .unwrap_or("general")
            .to_string();
        let levels: Vec<i32> = job
            .payload
            .get("levels")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_i64()).map(|n| n as i32).collect())
            .unwrap_or_else(|| vec![1]);

        let mut outcomes = Vec::new();
        for level in levels {
            let outcome = facts::run_extraction(
                &self.pool,
                self.fact_llm.as_deref(),
                job.tenant_id,
                version_id,
                profile,
                level,
                &process_context,
            )
            .await?;
            if let Some(run_id) = facts::latest_completed_run(&self.pool, version_id, profile, &process_context).await? {
                quality::analyze_version(&self.pool, job.tenant_id, version_id, run_id).await?;
            }
            outcomes.push(serde_json::json!({
                "level": level,
                "run_id": outcome.run_id,
                "claim_count": outcome.claim_count,
                "metric_count": outcome.metric_count,
                "constraint_count": outcome.constraint_count,
                "risk_count": outcome.risk_count,
            }));
        }
        Ok(serde_json::json!({"levels": outcomes}))
    }

    async fn run_upgrade_level(&self, job: &Job) -> Result<serde_json::Value> {
        let version_id = parse_uuid_field(&job.payload, "version_id")?;
        let profile = parse_profile(&job.payload).unwrap_or(Profile::General);
        let to_level = job.payload.get("to_level").and_then(|v| v.as_i64()).unwrap_or(2) as i32;
        let process_context = job
            .payload
            .get("process_context")
            .and_then(|v| v.as_str())
            .unwrap_or("general")
            .to_string();

        let outcome = facts::run_extraction(
            &self.pool,
            self.fact_llm.as_deref(),
            job.tenant_id,
            version_id,
            profile,
            to_level,
            &process_context,
        )
        .await?;
        if let Some(run_id) = facts::latest_completed_run(&self.pool, version_id, profile, &process_context).await? {
            quality::analyze_version(&self.pool, job.tenant_id, version_id, run_id).await?;
        }
        Ok(serde_json::json!({"run_id": outcome.run_id, "level": to_level}))
    }

    async fn run_delete_document(&self, job: &Job) -> Result<serde_json::Value> {
        let document_id = parse_uuid_field(&job.payload, "document_id")?;
        let requested_by = parse_uuid_field(&job.payload, "requested_by")?;
        crate::deletion::mark_for_deletion(&self.pool, job.tenant_id, document_id, requested_by).await?;
        crate::deletion::run_deletion(&self.pool, self.blob_store.clone(), job.tenant_id, document_id).await?;
        Ok(serde_json::json!({"document_id": document_id, "deleted": true}))
    }

    async fn run_bulk_folder(&self, job: &Job) -> Result<serde_json::Value> {
        let folder_path = job
            .payload
            .get("folder_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("bulk_folder job requires folder_path"))?;

        let extension_glob = build_extension_glob(&self.config.ingestion.supported_extensions)?;

        let mut enqueued = 0usize;
        for entry in walkdir::WalkDir::new(folder_path).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !extension_glob.is_match(path) {
                continue;
            }
            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("upload").to_string();
            let content_type = guess_content_type(&filename);
            let bytes = tokio::fs::read(path).await.with_context(|| format!("reading {}", path.display()))?;
            let document_id = Uuid::new_v4();
            register_document(&self.pool, job.tenant_id, document_id, &filename, &content_type, "bulk_folder", None).await?;
            let sanitized = validation::sanitize_filename(&filename);
            let version_id = create_document_version(
                &self.pool,
                job.tenant_id,
                document_id,
                self.blob_store.as_ref(),
                &sanitized,
                &content_type,
                &bytes,
            )
            .await?;
            queue::enqueue(
                &self.pool,
                job.tenant_id,
                JobType::ProcessVersion,
                serde_json::json!({"version_id": version_id, "reprocess": false}),
                0,
            )
            .await?;
            enqueued += 1;
        }
        Ok(serde_json::json!({"enqueued": enqueued}))
    }

    async fn run_bulk_url(&self, job: &Job) -> Result<serde_json::Value> {
        let urls: Vec<String> = job
            .payload
            .get("urls")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        let mut enqueued = 0usize;
        for url in urls {
            if validation::validate_url_for_ssrf(&url).is_err() {
                warn!(url, "skipping blocked url in bulk_url job");
                continue;
            }
            let document_id = Uuid::new_v4();
            let filename = url.rsplit('/').next().unwrap_or("download").to_string();
            register_document(&self.pool, job.tenant_id, document_id, &filename, "application/octet-stream", "bulk_url", Some(&url))
                .await?;
            queue::enqueue(
                &self.pool,
                job.tenant_id,
                JobType::Ingest,
                serde_json::json!({"document_id": document_id, "source_url": url, "filename": filename}),
                0,
            )
            .await?;
            enqueued += 1;
        }
        Ok(serde_json::json!({"enqueued": enqueued}))
    }
}

fn parse_uuid_field(payload: &serde_json::Value, field: &str) -> Result<Uuid> {
    let raw = payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("job payload missing required field '{field}'"))?;
    Uuid::parse_str(raw).with_context(|| format!("field '{field}' is not a valid uuid"))
}

fn parse_profile(payload: &serde_json::Value) -> Option<Profile> {
    match payload.get("profile").and_then(|v| v.as_str()) {
        Some("vc") => Some(Profile::Vc),
        Some("pharma") => Some(Profile::Pharma),
        Some("insurance") => Some(Profile::Insurance),
        Some("general") => Some(Profile::General),
        _ => None,
    }
}

/// Builds a glob set matching any of the configured extensions (e.g.
/// `.pdf` → `*.pdf`), used to skip files a `bulk_folder` job's walk
/// shouldn't pick up.
fn build_extension_glob(extensions: &[String]) -> Result<globset::GlobSet> {
    let mut builder = globset::GlobSetBuilder::new();
    for ext in extensions {
        let pattern = format!("*{ext}");
        builder.add(globset::Glob::new(&pattern).with_context(|| format!("invalid extension pattern '{pattern}'"))?);
    }
    builder.build().context("building extension glob set")
}

fn guess_content_type(filename: &str) -> String {
    let lower = filename.to_lowercase();
    if lower.ends_with(".pdf") {
        crate::extract::MIME_PDF.to_string()
    } else if lower.ends_with(".csv") {
        crate::extract::MIME_CSV.to_string()
    } else if lower.ends_with(".xlsx") {
        crate::extract::MIME_XLSX.to_string()
    } else if lower.ends_with(".xls") {
        crate::extract::MIME_XLS.to_string()
    } else if lower.ends_with(".md") {
        crate::extract::MIME_MARKDOWN.to_string()
    } else if lower.ends_with(".png") {
        crate::extract::MIME_PNG.to_string()
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        crate::extract::MIME_JPEG.to_string()
    } else {
        crate::extract::MIME_TEXT.to_string()
    }
}

/// Register a brand-new document row, deduplicating on `(tenant_id,
/// content_hash)` is the caller's job for content already in hand; this
/// helper is used by bulk paths where the hash isn't known until the bytes
/// are fetched, so it always inserts a fresh row.
pub async fn register_document(
    pool: &SqlitePool,
    tenant_id: Uuid,
    document_id: Uuid,
    filename: &str,
    content_type: &str,
    source_type: &str,
    source_url: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO documents (id, tenant_id, original_filename, content_type, content_hash, source_type, source_url, created_at, updated_at) \
         VALUES (?, ?, ?, ?, '', ?, ?, ?, ?)",
    )
    .bind(document_id.to_string())
    .bind(tenant_id.to_string())
    .bind(filename)
    .bind(content_type)
    .bind(source_type)
    .bind(source_url)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Store `bytes` in the blob backend and insert the next `document_versions`
/// row for `document_id`, defaulting its content hash onto the parent
/// document when this is the first version (spec.md §4.1 dedup key).
pub async fn create_document_version(
    pool: &SqlitePool,
    tenant_id: Uuid,
    document_id: Uuid,
    blob_store: &dyn BlobStore,
    sanitized_filename: &str,
    content_type: &str,
    bytes: &[u8],
) -> Result<Uuid> {
    use sha2::{Digest, Sha256};

    let next_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version_number), 0) + 1 FROM document_versions WHERE document_id = ?")
            .bind(document_id.to_string())
            .fetch_one(pool)
            .await?;

    let blob_key = crate::blob::storage_key(&document_id, next_version, sanitized_filename);
    blob_store.put(&blob_key, bytes, content_type).await?;

    let content_hash = hex::encode(Sha256::digest(bytes));
    let version_id = Uuid::new_v4();
    let now = chrono::Utc::now().to_rfc3339();

    if next_version == 1 {
        sqlx::query("UPDATE documents SET content_hash = ?, content_type = ?, updated_at = ? WHERE id = ?")
            .bind(&content_hash)
            .bind(content_type)
            .bind(&now)
            .bind(document_id.to_string())
            .execute(pool)
            .await?;
    }

    sqlx::query(
        "INSERT INTO document_versions \
         (id, document_id, tenant_id, version_number, blob_key, size_bytes, content_hash, upload_status, processing_status, extraction_status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'UPLOADED', 'UPLOADED', 'pending', ?, ?)",
    )
    .bind(version_id.to_string())
    .bind(document_id.to_string())
    .bind(tenant_id.to_string())
    .bind(next_version)
    .bind(&blob_key)
    .bind(bytes.len() as i64)
    .bind(&content_hash)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(version_id)
}
