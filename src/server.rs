//! The evidence repository's HTTP surface (spec.md §6): documents,
//! projects/folders, search, evidence (spans/claims/metrics/packs),
//! extraction, jobs, and tenants, behind API-key authentication.
//!
//! Every handler resolves an [`AuthedTenant`] first and threads it through
//! every query; nothing here reads or writes a row without a tenant
//! predicate. Failures convert to [`crate::error::AppError`] and are
//! rendered as the `{error, message, details}` envelope from spec.md §6.
//!
//! # CORS
//!
//! Origins, methods, and headers are governed by `[server]` in the TOML
//! configuration; `cors_origins = ["*"]` opts into allowing any origin.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Multipart, Path, Query, State};
use axum::http::{header, request::Parts, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use sqlx::FromRow;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::AppError;
use crate::facts::FactLlm;
use crate::models::{Job, JobStatus, JobType, Profile, SpanType, TenantContext};
use crate::packs::{self, PackEdit};
use crate::pipeline::{Pipeline, ProcessOptions};
use crate::search::{SearchFilters, SearchMode, SearchQuery};
use crate::validation;
use crate::worker;

#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::SqlitePool,
    pub config: Arc<Config>,
    pub blob_store: Arc<dyn crate::blob::BlobStore>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub fact_llm: Option<Arc<dyn FactLlm>>,
}

impl AppState {
    fn pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            pool: &self.pool,
            config: &self.config,
            blob_store: self.blob_store.as_ref(),
            embedder: self.embedder.as_deref(),
            fact_llm: self.fact_llm.as_deref(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Authentication
// ═══════════════════════════════════════════════════════════════════════

/// Authenticated principal, resolved once per request from the
/// `X-API-Key` or `Authorization: Bearer` header (spec.md §6). A bootstrap
/// key from `[server] api_keys` authenticates as the tenant named by the
/// `X-Tenant-Id` header it's presented alongside, since bootstrap keys
/// carry no tenant binding of their own — only a database-issued key does.
pub struct AuthedTenant(pub TenantContext);

fn presented_key(headers: &HeaderMap) -> Option<String> {
    if let Some(v) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(v.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

impl FromRequestParts<AppState> for AuthedTenant {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let key = presented_key(&parts.headers).ok_or(AppError::Unauthorized)?;

        if state.config.server.api_keys.contains(&key) {
            let tenant_id = parts
                .headers
                .get("x-tenant-id")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| Uuid::parse_str(v).ok())
                .ok_or_else(|| AppError::Validation("bootstrap key requires X-Tenant-Id header".to_string()))?;
            return Ok(AuthedTenant(TenantContext { tenant_id, actor_id: None, scopes: vec!["*".to_string()] }));
        }

        match crate::tenant::authenticate_api_key(&state.pool, &key).await {
            Ok(principal) => Ok(AuthedTenant(principal.into())),
            Err(_) => Err(AppError::Unauthorized),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Error rendering
// ═══════════════════════════════════════════════════════════════════════

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4();
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = self.into_body(request_id);
        (status, Json(body)).into_response()
    }
}

/// Service-layer code returns `anyhow::Result`; handlers fold an opaque
/// failure into `AppError::Internal` here so a panic deep in a query
/// doesn't leak implementation detail in the response body, only in logs.
fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %err, "internal error");
    AppError::Internal(err.to_string())
}

// ═══════════════════════════════════════════════════════════════════════
// Entrypoint
// ═══════════════════════════════════════════════════════════════════════

pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::run_migrations_on(&pool).await?;

    let blob_store: Arc<dyn crate::blob::BlobStore> = Arc::from(crate::blob::build_blob_store(&config.storage)?);
    let embedder: Option<Arc<dyn Embedder>> = crate::embedding::build_embedder(&config.embedding)?.map(Arc::from);
    let fact_llm: Option<Arc<dyn FactLlm>> = crate::facts::build_fact_llm(&config.extraction).map(Arc::from);

    let state = AppState { pool, config: Arc::new(config.clone()), blob_store, embedder, fact_llm };

    let cors = build_cors(config);
    let app = router(state).layer(cors).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "evidence repository listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_cors(config: &Config) -> CorsLayer {
    let origin = if config.server.cors_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<header::HeaderValue> =
            config.server.cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(origins)
    };
    CorsLayer::new().allow_origin(origin).allow_credentials(false)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/documents", post(handle_upload_document).get(handle_list_documents))
        .route("/documents/:id", get(handle_get_document).delete(handle_delete_document))
        .route("/documents/:id/status", get(handle_document_status))
        .route("/documents/:id/versions", get(handle_list_versions).post(handle_upload_version))
        .route("/documents/:id/versions/:version_id/download", get(handle_download_version))
        .route("/documents/:id/versions/:version_id/process", post(handle_trigger_process))
        .route("/documents/:id/versions/:version_id/extract", post(handle_trigger_extraction))
        .route("/documents/:id/versions/:version_id/facts", get(handle_list_facts))
        .route("/documents/:id/versions/:version_id/quality", get(handle_quality))
        .route("/documents/:id/versions/:version_id/spans", get(handle_list_spans))
        .route("/projects", post(handle_create_project).get(handle_list_projects))
        .route("/projects/:id", get(handle_get_project).patch(handle_update_project).delete(handle_delete_project))
        .route("/projects/:id/documents", post(handle_attach_document).get(handle_list_project_documents))
        .route("/projects/:id/documents/:document_id", delete(handle_detach_document))
        .route("/projects/:id/folders", post(handle_create_folder).get(handle_list_folders))
        .route("/projects/:id/folders/:folder_id", delete(handle_delete_folder))
        .route("/search", post(handle_search))
        .route("/packs", post(handle_create_pack).get(handle_list_packs))
        .route("/packs/:id", get(handle_get_pack).patch(handle_update_pack).delete(handle_delete_pack))
        .route("/packs/:id/export", get(handle_export_pack))
        .route("/jobs", post(handle_enqueue_job).get(handle_list_jobs))
        .route("/jobs/:id", get(handle_get_job))
        .route("/jobs/:id/cancel", post(handle_cancel_job))
        .route("/jobs/cleanup", post(handle_cleanup_jobs))
        .route("/tenants", post(handle_create_tenant))
        .route("/tenants/:id/keys", post(handle_issue_key).get(handle_list_keys))
        .route("/tenants/:id/keys/:key_id", delete(handle_revoke_key))
        .with_state(state)
}

// ═══════════════════════════════════════════════════════════════════════
// Health
// ═══════════════════════════════════════════════════════════════════════

async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn handle_ready(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&state.pool).await.is_ok();
    let status = if db_ok { "ok" } else { "degraded" };
    let code = if db_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(json!({ "status": status, "dependencies": { "database": db_ok } })))
}

// ═══════════════════════════════════════════════════════════════════════
// Documents
// ═══════════════════════════════════════════════════════════════════════

#[derive(FromRow)]
struct DocumentRow {
    id: String,
    original_filename: String,
    content_type: String,
    content_hash: String,
    classification: Option<String>,
    source_type: String,
    source_url: Option<String>,
    sectors: String,
    topics: String,
    geographies: String,
    companies: String,
    authors: String,
    publishing_organization: Option<String>,
    published_at: Option<String>,
    deletion_status: String,
    created_at: String,
    updated_at: String,
}

fn document_row_to_json(row: DocumentRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "original_filename": row.original_filename,
        "content_type": row.content_type,
        "content_hash": row.content_hash,
        "classification": row.classification,
        "source_type": row.source_type,
        "source_url": row.source_url,
        "sectors": serde_json::from_str::<serde_json::Value>(&row.sectors).unwrap_or(json!([])),
        "topics": serde_json::from_str::<serde_json::Value>(&row.topics).unwrap_or(json!([])),
        "geographies": serde_json::from_str::<serde_json::Value>(&row.geographies).unwrap_or(json!([])),
        "companies": serde_json::from_str::<serde_json::Value>(&row.companies).unwrap_or(json!([])),
        "authors": serde_json::from_str::<serde_json::Value>(&row.authors).unwrap_or(json!([])),
        "publishing_organization": row.publishing_organization,
        "published_at": row.published_at,
        "deletion_status": row.deletion_status,
        "created_at": row.created_at,
        "updated_at": row.updated_at,
    })
}

const DOCUMENT_COLUMNS: &str = "id, original_filename, content_type, content_hash, classification, source_type, source_url, \
     sectors, topics, geographies, companies, authors, publishing_organization, published_at, \
     deletion_status, created_at, updated_at";

async fn handle_upload_document(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut filename = None;
    let mut content_type = None;
    let mut bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| AppError::Validation(e.to_string()))? {
        if field.name() == Some("file") {
            filename = field.file_name().map(|s| s.to_string());
            content_type = field.content_type().map(|s| s.to_string());
            bytes = Some(field.bytes().await.map_err(|e| AppError::Validation(e.to_string()))?.to_vec());
        }
    }

    let bytes = bytes.ok_or_else(|| AppError::Validation("multipart field 'file' is required".to_string()))?;
    let max_bytes = state.config.ingestion.max_file_size_mb * 1024 * 1024;
    if bytes.len() as u64 > max_bytes {
        return Err(AppError::Validation(format!("file exceeds max_file_size_mb ({})", state.config.ingestion.max_file_size_mb)));
    }

    let original_filename = filename.unwrap_or_else(|| "unnamed_file".to_string());
    let sanitized = validation::sanitize_filename(&original_filename);
    let content_type = content_type.unwrap_or_else(|| "application/octet-stream".to_string());

    let document_id = Uuid::new_v4();
    worker::register_document(&state.pool, ctx.tenant_id, document_id, &sanitized, &content_type, "upload", None)
        .await
        .map_err(internal)?;
    let version_id = worker::create_document_version(
        &state.pool,
        ctx.tenant_id,
        document_id,
        state.blob_store.as_ref(),
        &sanitized,
        &content_type,
        &bytes,
    )
    .await
    .map_err(internal)?;

    enqueue_process_version(&state, ctx.tenant_id, version_id).await.map_err(internal)?;

    crate::audit::record(
        &state.pool,
        &ctx,
        crate::audit::AuditEvent {
            action: "document.upload",
            entity_type: "document",
            entity_id: Some(document_id),
            request_id: None,
            ip_address: None,
            user_agent: None,
            details: json!({ "version_id": version_id }),
        },
    )
    .await
    .map_err(internal)?;

    Ok((StatusCode::CREATED, Json(json!({ "document_id": document_id, "version_id": version_id }))).into_response())
}

async fn enqueue_process_version(state: &AppState, tenant_id: Uuid, version_id: Uuid) -> anyhow::Result<()> {
    crate::queue::enqueue(
        &state.pool,
        tenant_id,
        JobType::ProcessVersion,
        json!({ "version_id": version_id, "reprocess": false }),
        0,
    )
    .await?;
    Ok(())
}

#[derive(Deserialize, Default)]
struct ListDocumentsQuery {
    deletion_status: Option<String>,
    limit: Option<i64>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Query(q): Query<ListDocumentsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = q.deletion_status.unwrap_or_else(|| "active".to_string());
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE tenant_id = ? AND deletion_status = ? ORDER BY created_at DESC LIMIT ?");
    let rows = sqlx::query_as::<_, DocumentRow>(&sql)
        .bind(ctx.tenant_id.to_string())
        .bind(&status)
        .bind(limit)
        .fetch_all(&state.pool)
        .await
        .map_err(|e| internal(e.into()))?;

    Ok(Json(json!({ "documents": rows.into_iter().map(document_row_to_json).collect::<Vec<_>>() })))
}

async fn handle_get_document(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ? AND tenant_id = ?");
    let row = sqlx::query_as::<_, DocumentRow>(&sql)
        .bind(id.to_string())
        .bind(ctx.tenant_id.to_string())
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| internal(e.into()))?
        .ok_or_else(|| AppError::NotFound("document".to_string()))?;

    Ok(Json(document_row_to_json(row)))
}

async fn handle_document_status(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let row: Option<(String, String, String, Option<String>)> = sqlx::query_as(
        "SELECT processing_status, upload_status, extraction_status, last_error FROM document_versions \
         WHERE document_id = ? AND tenant_id = ? ORDER BY version_number DESC LIMIT 1",
    )
    .bind(id.to_string())
    .bind(ctx.tenant_id.to_string())
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;

    let (processing_status, upload_status, extraction_status, last_error) =
        row.ok_or_else(|| AppError::NotFound("document".to_string()))?;
    Ok(Json(json!({
        "processing_status": processing_status,
        "upload_status": upload_status,
        "extraction_status": extraction_status,
        "last_error": last_error,
    })))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let actor = ctx.actor_id.unwrap_or(ctx.tenant_id);
    let marked = crate::deletion::mark_for_deletion(&state.pool, ctx.tenant_id, id, actor).await.map_err(internal)?;
    if marked == 0 {
        return Err(AppError::NotFound("document".to_string()));
    }

    crate::queue::enqueue(&state.pool, ctx.tenant_id, JobType::DeleteDocument, json!({ "document_id": id }), 5)
        .await
        .map_err(internal)?;

    Ok(Json(json!({ "deletion_status": "marked_for_deletion", "tasks_created": marked })))
}

#[derive(FromRow)]
struct VersionRow {
    id: String,
    version_number: i64,
    size_bytes: i64,
    content_hash: String,
    upload_status: String,
    processing_status: String,
    extraction_status: String,
    truthfulness_score: Option<f64>,
    bias_score: Option<f64>,
    last_error: Option<String>,
    created_at: String,
}

fn version_row_to_json(row: VersionRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "version_number": row.version_number,
        "size_bytes": row.size_bytes,
        "content_hash": row.content_hash,
        "upload_status": row.upload_status,
        "processing_status": row.processing_status,
        "extraction_status": row.extraction_status,
        "truthfulness_score": row.truthfulness_score,
        "bias_score": row.bias_score,
        "last_error": row.last_error,
        "created_at": row.created_at,
    })
}

async fn handle_list_versions(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let rows = sqlx::query_as::<_, VersionRow>(
        "SELECT id, version_number, size_bytes, content_hash, upload_status, processing_status, extraction_status, \
         truthfulness_score, bias_score, last_error, created_at \
         FROM document_versions WHERE document_id = ? AND tenant_id = ? ORDER BY version_number DESC",
    )
    .bind(id.to_string())
    .bind(ctx.tenant_id.to_string())
    .fetch_all(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;

    Ok(Json(json!({ "versions": rows.into_iter().map(version_row_to_json).collect::<Vec<_>>() })))
}

async fn handle_upload_version(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let exists: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE id = ? AND tenant_id = ?")
        .bind(id.to_string())
        .bind(ctx.tenant_id.to_string())
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| internal(e.into()))?;
    if exists.is_none() {
        return Err(AppError::NotFound("document".to_string()));
    }

    let mut filename = None;
    let mut content_type = None;
    let mut bytes: Option<Vec<u8>> = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| AppError::Validation(e.to_string()))? {
        if field.name() == Some("file") {
            filename = field.file_name().map(|s| s.to_string());
            content_type = field.content_type().map(|s| s.to_string());
            bytes = Some(field.bytes().await.map_err(|e| AppError::Validation(e.to_string()))?.to_vec());
        }
    }
    let bytes = bytes.ok_or_else(|| AppError::Validation("multipart field 'file' is required".to_string()))?;
    let sanitized = validation::sanitize_filename(&filename.unwrap_or_else(|| "unnamed_file".to_string()));
    let content_type = content_type.unwrap_or_else(|| "application/octet-stream".to_string());

    let version_id =
        worker::create_document_version(&state.pool, ctx.tenant_id, id, state.blob_store.as_ref(), &sanitized, &content_type, &bytes)
            .await
            .map_err(internal)?;
    enqueue_process_version(&state, ctx.tenant_id, version_id).await.map_err(internal)?;

    Ok((StatusCode::CREATED, Json(json!({ "version_id": version_id }))).into_response())
}

async fn handle_download_version(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path((id, version_id)): Path<(Uuid, Uuid)>,
) -> Result<Response, AppError> {
    let row: Option<(String, String)> = sqlx::query_as(
        "SELECT dv.blob_key, d.original_filename FROM document_versions dv \
         JOIN documents d ON d.id = dv.document_id \
         WHERE dv.id = ? AND dv.document_id = ? AND dv.tenant_id = ?",
    )
    .bind(version_id.to_string())
    .bind(id.to_string())
    .bind(ctx.tenant_id.to_string())
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;

    let (blob_key, filename) = row.ok_or_else(|| AppError::NotFound("document version".to_string()))?;
    let bytes = state.blob_store.get(&blob_key).await.map_err(|e| AppError::TransientIo(e.to_string()))?;

    let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
    Ok(([(header::CONTENT_DISPOSITION, disposition)], bytes).into_response())
}

#[derive(Deserialize, Default)]
struct TriggerProcessBody {
    profile: Option<Profile>,
    level: Option<i32>,
    process_context: Option<String>,
    reprocess: Option<bool>,
}

async fn handle_trigger_process(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path((_id, version_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<TriggerProcessBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let opts = ProcessOptions {
        profile: body.profile.unwrap_or(Profile::General),
        level: body.level.unwrap_or(1),
        process_context: body.process_context.unwrap_or_else(|| "general".to_string()),
        reprocess: body.reprocess.unwrap_or(false),
    };
    let pipeline = state.pipeline();
    let status = crate::pipeline::process_version(&pipeline, ctx.tenant_id, version_id, &opts).await.map_err(internal)?;
    Ok(Json(json!({ "processing_status": status })))
}

#[derive(Deserialize, Default)]
struct TriggerExtractionBody {
    profile: Option<Profile>,
    levels: Option<Vec<i32>>,
    process_context: Option<String>,
}

async fn handle_trigger_extraction(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path((_id, version_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<TriggerExtractionBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let profile = body.profile.unwrap_or(Profile::General);
    let job = crate::queue::enqueue(
        &state.pool,
        ctx.tenant_id,
        JobType::MultilevelExtract,
        json!({
            "version_id": version_id,
            "profile": profile,
            "levels": body.levels.unwrap_or_else(|| vec![1]),
            "process_context": body.process_context.unwrap_or_else(|| "general".to_string()),
        }),
        0,
    )
    .await
    .map_err(internal)?;
    Ok(Json(json!({ "job_id": job.id })))
}

#[derive(FromRow)]
struct FactRow {
    id: String,
    kind: String,
    summary: String,
    certainty: Option<String>,
    source_reliability: Option<String>,
    span_refs: String,
}

async fn handle_list_facts(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path((_id, version_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let run_id: Option<String> = sqlx::query_scalar(
        "SELECT id FROM extraction_runs WHERE version_id = ? AND tenant_id = ? AND status = 'completed' \
         ORDER BY finished_at DESC LIMIT 1",
    )
    .bind(version_id.to_string())
    .bind(ctx.tenant_id.to_string())
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;

    let Some(run_id) = run_id else {
        return Ok(Json(json!({ "claims": [], "metrics": [], "constraints": [], "risks": [] })));
    };

    let claims = fetch_facts(&state, &run_id, "claims", "subject || ' ' || predicate || ' ' || object AS summary").await?;
    let metrics = fetch_facts(&state, &run_id, "metrics", "name || ' (' || entity || ')' AS summary").await?;
    let constraints = fetch_facts(&state, &run_id, "constraints", "description AS summary").await?;
    let risks = fetch_facts(&state, &run_id, "risks", "statement AS summary").await?;

    Ok(Json(json!({ "claims": claims, "metrics": metrics, "constraints": constraints, "risks": risks })))
}

async fn fetch_facts(state: &AppState, run_id: &str, table: &str, summary_expr: &str) -> Result<Vec<serde_json::Value>, AppError> {
    let sql = format!(
        "SELECT id, '{table}' AS kind, {summary_expr}, certainty, source_reliability, span_refs FROM {table} WHERE extraction_run_id = ?"
    );
    let rows = sqlx::query_as::<_, FactRow>(&sql)
        .bind(run_id)
        .fetch_all(&state.pool)
        .await
        .map_err(|e| internal(e.into()))?;
    Ok(rows
        .into_iter()
        .map(|r| {
            json!({
                "id": r.id,
                "kind": r.kind,
                "summary": r.summary,
                "certainty": r.certainty,
                "source_reliability": r.source_reliability,
                "span_refs": serde_json::from_str::<serde_json::Value>(&r.span_refs).unwrap_or(json!([])),
            })
        })
        .collect())
}

async fn handle_quality(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path((_id, version_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let conflicts: Vec<(String, String, String, String)> =
        sqlx::query_as("SELECT id, conflict_type, severity, reason FROM conflicts WHERE version_id = ? AND tenant_id = ?")
            .bind(version_id.to_string())
            .bind(ctx.tenant_id.to_string())
            .fetch_all(&state.pool)
            .await
            .map_err(|e| internal(e.into()))?;

    let questions: Vec<(String, String, String)> =
        sqlx::query_as("SELECT id, category, question FROM open_questions WHERE version_id = ? AND tenant_id = ?")
            .bind(version_id.to_string())
            .bind(ctx.tenant_id.to_string())
            .fetch_all(&state.pool)
            .await
            .map_err(|e| internal(e.into()))?;

    Ok(Json(json!({
        "conflicts": conflicts.into_iter().map(|(id, conflict_type, severity, reason)| json!({
            "id": id, "conflict_type": conflict_type, "severity": severity, "reason": reason,
        })).collect::<Vec<_>>(),
        "open_questions": questions.into_iter().map(|(id, category, question)| json!({
            "id": id, "category": category, "question": question,
        })).collect::<Vec<_>>(),
    })))
}

#[derive(FromRow)]
struct SpanRow {
    id: String,
    locator: String,
    span_type: String,
    text_content: String,
}

async fn handle_list_spans(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path((_id, version_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let rows = sqlx::query_as::<_, SpanRow>(
        "SELECT id, locator, span_type, text_content FROM spans WHERE version_id = ? AND tenant_id = ? ORDER BY created_at ASC",
    )
    .bind(version_id.to_string())
    .bind(ctx.tenant_id.to_string())
    .fetch_all(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;

    Ok(Json(json!({ "spans": rows.into_iter().map(|r| json!({
        "id": r.id,
        "locator": serde_json::from_str::<serde_json::Value>(&r.locator).unwrap_or(serde_json::Value::Null),
        "span_type": r.span_type,
        "text_content": r.text_content,
    })).collect::<Vec<_>>() })))
}

// ═══════════════════════════════════════════════════════════════════════
// Projects & folders
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct CreateProjectBody {
    name: String,
    description: Option<String>,
}

async fn handle_create_project(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Json(body): Json<CreateProjectBody>,
) -> Result<Response, AppError> {
    let id = Uuid::new_v4();
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query("INSERT INTO projects (id, tenant_id, name, description, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)")
        .bind(id.to_string())
        .bind(ctx.tenant_id.to_string())
        .bind(&body.name)
        .bind(&body.description)
        .bind(&now)
        .bind(&now)
        .execute(&state.pool)
        .await
        .map_err(|e| internal(e.into()))?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id, "name": body.name, "description": body.description }))).into_response())
}

async fn handle_list_projects(State(state): State<AppState>, AuthedTenant(ctx): AuthedTenant) -> Result<Json<serde_json::Value>, AppError> {
    let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
        "SELECT id, name, description FROM projects WHERE tenant_id = ? AND deleted_at IS NULL ORDER BY created_at DESC",
    )
    .bind(ctx.tenant_id.to_string())
    .fetch_all(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;
    Ok(Json(
        json!({ "projects": rows.into_iter().map(|(id, name, description)| json!({ "id": id, "name": name, "description": description })).collect::<Vec<_>>() }),
    ))
}

async fn handle_get_project(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let row: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT name, description FROM projects WHERE id = ? AND tenant_id = ? AND deleted_at IS NULL")
            .bind(id.to_string())
            .bind(ctx.tenant_id.to_string())
            .fetch_optional(&state.pool)
            .await
            .map_err(|e| internal(e.into()))?;
    let (name, description) = row.ok_or_else(|| AppError::NotFound("project".to_string()))?;
    Ok(Json(json!({ "id": id, "name": name, "description": description })))
}

#[derive(Deserialize, Default)]
struct UpdateProjectBody {
    name: Option<String>,
    description: Option<String>,
}

async fn handle_update_project(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateProjectBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let result = sqlx::query(
        "UPDATE projects SET name = COALESCE(?, name), description = COALESCE(?, description), updated_at = ? \
         WHERE id = ? AND tenant_id = ? AND deleted_at IS NULL",
    )
    .bind(&body.name)
    .bind(&body.description)
    .bind(&now)
    .bind(id.to_string())
    .bind(ctx.tenant_id.to_string())
    .execute(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("project".to_string()));
    }
    handle_get_project(State(state), AuthedTenant(ctx), Path(id)).await
}

async fn handle_delete_project(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let result = sqlx::query("UPDATE projects SET deleted_at = ? WHERE id = ? AND tenant_id = ? AND deleted_at IS NULL")
        .bind(&now)
        .bind(id.to_string())
        .bind(ctx.tenant_id.to_string())
        .execute(&state.pool)
        .await
        .map_err(|e| internal(e.into()))?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("project".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct AttachDocumentBody {
    document_id: Uuid,
    pinned_version_id: Option<Uuid>,
    folder_id: Option<Uuid>,
}

async fn handle_attach_document(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(project_id): Path<Uuid>,
    Json(body): Json<AttachDocumentBody>,
) -> Result<Response, AppError> {
    let id = Uuid::new_v4();
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO project_documents (id, project_id, document_id, tenant_id, pinned_version_id, folder_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(project_id, document_id) DO UPDATE SET pinned_version_id = excluded.pinned_version_id, folder_id = excluded.folder_id",
    )
    .bind(id.to_string())
    .bind(project_id.to_string())
    .bind(body.document_id.to_string())
    .bind(ctx.tenant_id.to_string())
    .bind(body.pinned_version_id.map(|v| v.to_string()))
    .bind(body.folder_id.map(|v| v.to_string()))
    .bind(&now)
    .execute(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn handle_detach_document(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path((project_id, document_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    let result = sqlx::query("DELETE FROM project_documents WHERE project_id = ? AND document_id = ? AND tenant_id = ?")
        .bind(project_id.to_string())
        .bind(document_id.to_string())
        .bind(ctx.tenant_id.to_string())
        .execute(&state.pool)
        .await
        .map_err(|e| internal(e.into()))?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("project-document attachment".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_list_project_documents(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(project_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT document_id, pinned_version_id, folder_id FROM project_documents WHERE project_id = ? AND tenant_id = ?",
    )
    .bind(project_id.to_string())
    .bind(ctx.tenant_id.to_string())
    .fetch_all(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;
    Ok(Json(json!({ "documents": rows.into_iter().map(|(document_id, pinned_version_id, folder_id)| json!({
        "document_id": document_id, "pinned_version_id": pinned_version_id, "folder_id": folder_id,
    })).collect::<Vec<_>>() })))
}

#[derive(Deserialize)]
struct CreateFolderBody {
    name: String,
    parent_folder_id: Option<Uuid>,
}

async fn handle_create_folder(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(project_id): Path<Uuid>,
    Json(body): Json<CreateFolderBody>,
) -> Result<Response, AppError> {
    let id = Uuid::new_v4();
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query("INSERT INTO folders (id, project_id, tenant_id, parent_folder_id, name, created_at) VALUES (?, ?, ?, ?, ?, ?)")
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(ctx.tenant_id.to_string())
        .bind(body.parent_folder_id.map(|v| v.to_string()))
        .bind(&body.name)
        .bind(&now)
        .execute(&state.pool)
        .await
        .map_err(|e| internal(e.into()))?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id, "name": body.name }))).into_response())
}

async fn handle_list_folders(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(project_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
        "SELECT id, name, parent_folder_id FROM folders WHERE project_id = ? AND tenant_id = ? AND deleted_at IS NULL",
    )
    .bind(project_id.to_string())
    .bind(ctx.tenant_id.to_string())
    .fetch_all(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;
    Ok(Json(json!({ "folders": rows.into_iter().map(|(id, name, parent_folder_id)| json!({
        "id": id, "name": name, "parent_folder_id": parent_folder_id,
    })).collect::<Vec<_>>() })))
}

async fn handle_delete_folder(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path((_project_id, folder_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let result = sqlx::query("UPDATE folders SET deleted_at = ? WHERE id = ? AND tenant_id = ? AND deleted_at IS NULL")
        .bind(&now)
        .bind(folder_id.to_string())
        .bind(ctx.tenant_id.to_string())
        .execute(&state.pool)
        .await
        .map_err(|e| internal(e.into()))?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("folder".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ═══════════════════════════════════════════════════════════════════════
// Search
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct SearchRequestBody {
    query: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    exclude_keywords: Vec<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    similarity_threshold: Option<f64>,
    #[serde(default)]
    project_id: Option<Uuid>,
    #[serde(default)]
    document_ids: Vec<Uuid>,
    #[serde(default)]
    spans_only: bool,
    #[serde(default)]
    span_types: Vec<SpanType>,
    #[serde(default)]
    sectors: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    document_types: Vec<String>,
    #[serde(default)]
    geographies: Vec<String>,
    #[serde(default)]
    companies: Vec<String>,
}

fn default_mode() -> String {
    "keyword".to_string()
}

async fn handle_search(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Json(body): Json<SearchRequestBody>,
) -> Result<Json<crate::search::SearchResult>, AppError> {
    if body.query.trim().is_empty() {
        return Err(AppError::Validation("query must not be empty".to_string()));
    }
    let mode: SearchMode = body.mode.parse().map_err(AppError::Validation)?;

    let query = SearchQuery {
        text: body.query,
        keywords: body.keywords,
        exclude_keywords: body.exclude_keywords,
        limit: body.limit.unwrap_or(0),
        similarity_threshold: body.similarity_threshold,
        filters: SearchFilters {
            project_id: body.project_id,
            document_ids: body.document_ids,
            spans_only: body.spans_only,
            span_types: body.span_types,
            sectors: body.sectors,
            topics: body.topics,
            document_types: body.document_types,
            geographies: body.geographies,
            companies: body.companies,
        },
    };

    let result = crate::search::search(&state.pool, state.embedder.as_deref(), &state.config, ctx.tenant_id, mode, &query)
        .await
        .map_err(internal)?;
    Ok(Json(result))
}

// ═══════════════════════════════════════════════════════════════════════
// Evidence packs
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct CreatePackBody {
    name: String,
    description: Option<String>,
    project_id: Option<Uuid>,
}

async fn handle_create_pack(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Json(body): Json<CreatePackBody>,
) -> Result<Response, AppError> {
    let pack = packs::create_pack(&state.pool, ctx.tenant_id, body.project_id, &body.name, body.description.as_deref())
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(pack)).into_response())
}

#[derive(Deserialize, Default)]
struct ListPacksQuery {
    project_id: Option<Uuid>,
}

async fn handle_list_packs(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Query(q): Query<ListPacksQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let items = packs::list_packs(&state.pool, ctx.tenant_id, q.project_id).await.map_err(internal)?;
    Ok(Json(json!({ "packs": items })))
}

async fn handle_get_pack(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
) -> Result<Json<crate::models::EvidencePack>, AppError> {
    packs::get_pack(&state.pool, ctx.tenant_id, id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("evidence pack".to_string()))
}

#[derive(Deserialize, Default)]
struct UpdatePackBody {
    name: Option<String>,
    description: Option<String>,
    span_ids: Option<Vec<Uuid>>,
    claim_ids: Option<Vec<Uuid>>,
    metric_ids: Option<Vec<Uuid>>,
}

async fn handle_update_pack(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdatePackBody>,
) -> Result<Json<crate::models::EvidencePack>, AppError> {
    let edit = PackEdit {
        name: body.name,
        description: body.description,
        span_ids: body.span_ids,
        claim_ids: body.claim_ids,
        metric_ids: body.metric_ids,
    };
    packs::update_pack(&state.pool, ctx.tenant_id, id, edit)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("evidence pack".to_string()))
}

async fn handle_delete_pack(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let deleted = packs::delete_pack(&state.pool, ctx.tenant_id, id).await.map_err(internal)?;
    if !deleted {
        return Err(AppError::NotFound("evidence pack".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_export_pack(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
) -> Result<Json<packs::PackExport>, AppError> {
    packs::export_pack(&state.pool, ctx.tenant_id, id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("evidence pack".to_string()))
}

// ═══════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct EnqueueJobBody {
    job_type: JobType,
    payload: serde_json::Value,
    #[serde(default)]
    priority: i64,
}

async fn handle_enqueue_job(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Json(body): Json<EnqueueJobBody>,
) -> Result<Response, AppError> {
    let job = crate::queue::enqueue(&state.pool, ctx.tenant_id, body.job_type, body.payload, body.priority)
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(job)).into_response())
}

#[derive(Deserialize, Default)]
struct ListJobsQuery {
    status: Option<String>,
}

async fn handle_list_jobs(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status: Option<JobStatus> = q
        .status
        .map(|s| serde_json::from_value(serde_json::Value::String(s)))
        .transpose()
        .map_err(|_| AppError::Validation("invalid status filter".to_string()))?;
    let jobs = crate::queue::list_jobs(&state.pool, ctx.tenant_id, status).await.map_err(internal)?;
    Ok(Json(json!({ "jobs": jobs })))
}

async fn handle_get_job(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    let job = crate::queue::get_job(&state.pool, id).await.map_err(internal)?.ok_or_else(|| AppError::NotFound("job".to_string()))?;
    if job.tenant_id != ctx.tenant_id {
        return Err(AppError::NotFound("job".to_string()));
    }
    Ok(Json(job))
}

async fn handle_cancel_job(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let job = crate::queue::get_job(&state.pool, id).await.map_err(internal)?.ok_or_else(|| AppError::NotFound("job".to_string()))?;
    if job.tenant_id != ctx.tenant_id {
        return Err(AppError::NotFound("job".to_string()));
    }
    let canceled = crate::queue::cancel_job(&state.pool, id).await.map_err(internal)?;
    Ok(Json(json!({ "canceled": canceled })))
}

#[derive(Deserialize, Default)]
struct CleanupJobsBody {
    #[serde(default = "default_cleanup_days")]
    older_than_days: i64,
}

fn default_cleanup_days() -> i64 {
    30
}

async fn handle_cleanup_jobs(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Json(body): Json<CleanupJobsBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = crate::queue::cleanup_old_jobs(&state.pool, ctx.tenant_id, body.older_than_days)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "removed": removed })))
}

// ═══════════════════════════════════════════════════════════════════════
// Tenants
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct CreateTenantBody {
    name: String,
}

async fn handle_create_tenant(State(state): State<AppState>, Json(body): Json<CreateTenantBody>) -> Result<Response, AppError> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO tenants (id, name, created_at) VALUES (?, ?, ?)")
        .bind(id.to_string())
        .bind(&body.name)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&state.pool)
        .await
        .map_err(|e| internal(e.into()))?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id, "name": body.name }))).into_response())
}

#[derive(Deserialize, Default)]
struct IssueKeyBody {
    #[serde(default)]
    scopes: Vec<String>,
}

async fn handle_issue_key(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<IssueKeyBody>,
) -> Result<Response, AppError> {
    if ctx.tenant_id != tenant_id {
        return Err(AppError::Forbidden);
    }
    let scopes = if body.scopes.is_empty() { vec!["*".to_string()] } else { body.scopes };
    let (plaintext, row) = crate::tenant::issue_api_key(tenant_id, scopes);
    sqlx::query(
        "INSERT INTO tenant_api_keys (id, tenant_id, key_hash, display_prefix, scopes, activated_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(row.id.to_string())
    .bind(row.tenant_id.to_string())
    .bind(&row.key_hash)
    .bind(&row.display_prefix)
    .bind(serde_json::to_string(&row.scopes).map_err(|e| internal(e.into()))?)
    .bind(row.activated_at.map(|t| t.to_rfc3339()))
    .bind(row.created_at.to_rfc3339())
    .execute(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;

    Ok((StatusCode::CREATED, Json(json!({ "api_key": plaintext, "display_prefix": row.display_prefix, "id": row.id }))).into_response())
}

async fn handle_list_keys(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    if ctx.tenant_id != tenant_id {
        return Err(AppError::Forbidden);
    }
    let rows: Vec<(String, String, Option<String>, Option<String>)> =
        sqlx::query_as("SELECT id, display_prefix, expires_at, revoked_at FROM tenant_api_keys WHERE tenant_id = ?")
            .bind(tenant_id.to_string())
            .fetch_all(&state.pool)
            .await
            .map_err(|e| internal(e.into()))?;
    Ok(Json(json!({ "keys": rows.into_iter().map(|(id, display_prefix, expires_at, revoked_at)| json!({
        "id": id, "display_prefix": display_prefix, "expires_at": expires_at, "revoked_at": revoked_at,
    })).collect::<Vec<_>>() })))
}

async fn handle_revoke_key(
    State(state): State<AppState>,
    AuthedTenant(ctx): AuthedTenant,
    Path((tenant_id, key_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    if ctx.tenant_id != tenant_id {
        return Err(AppError::Forbidden);
    }
    let now = chrono::Utc::now().to_rfc3339();
    let result = sqlx::query("UPDATE tenant_api_keys SET revoked_at = ? WHERE id = ? AND tenant_id = ? AND revoked_at IS NULL")
        .bind(&now)
        .bind(key_id.to_string())
        .bind(tenant_id.to_string())
        .execute(&state.pool)
        .await
        .map_err(|e| internal(e.into()))?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("api key".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}
