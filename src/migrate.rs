//! Database schema migrations.
//!
//! Creates every table named in the data model, each as an idempotent
//! `CREATE TABLE IF NOT EXISTS`, plus the two partial unique indexes the
//! concurrency model depends on: at-most-one active extraction run per
//! `(version, profile, process_context, level)`, and unique project-document
//! attachment. Run via `evidctl init`.

use anyhow::Result;
use sqlx::sqlite::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    run_migrations_on(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an already-open pool. Split out from
/// [`run_migrations`] so integration tests can migrate an in-memory/tempdir
/// database without going through [`db::connect`] twice.
pub async fn run_migrations_on(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenant_api_keys (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            key_hash TEXT NOT NULL UNIQUE,
            display_prefix TEXT NOT NULL,
            scopes TEXT NOT NULL DEFAULT '[]',
            activated_at TEXT,
            expires_at TEXT,
            revoked_at TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (tenant_id) REFERENCES tenants(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            original_filename TEXT NOT NULL,
            content_type TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            classification TEXT,
            source_type TEXT NOT NULL,
            source_url TEXT,
            sectors TEXT NOT NULL DEFAULT '[]',
            topics TEXT NOT NULL DEFAULT '[]',
            geographies TEXT NOT NULL DEFAULT '[]',
            companies TEXT NOT NULL DEFAULT '[]',
            authors TEXT NOT NULL DEFAULT '[]',
            publishing_organization TEXT,
            published_at TEXT,
            deletion_status TEXT NOT NULL DEFAULT 'active',
            deletion_requested_by TEXT,
            deletion_requested_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(tenant_id, content_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_tenant_status ON documents(tenant_id, deletion_status)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_versions (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            version_number INTEGER NOT NULL,
            blob_key TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            upload_status TEXT NOT NULL DEFAULT 'PENDING',
            processing_status TEXT NOT NULL DEFAULT 'PENDING',
            extraction_status TEXT NOT NULL DEFAULT 'pending',
            extracted_text TEXT,
            page_count INTEGER,
            truthfulness_score REAL,
            bias_score REAL,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(document_id, version_number),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_versions_tenant_status ON document_versions(tenant_id, processing_status)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_versions_extraction_status ON document_versions(extraction_status)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS spans (
            id TEXT PRIMARY KEY,
            version_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            locator TEXT NOT NULL,
            end_locator TEXT,
            text_content TEXT NOT NULL,
            span_type TEXT NOT NULL,
            span_hash TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            UNIQUE(version_id, span_hash),
            FOREIGN KEY (version_id) REFERENCES document_versions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_spans_tenant ON spans(tenant_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_spans_version ON spans(version_id)")
        .execute(pool)
        .await?;

    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='spans_fts'",
    )
    .fetch_one(pool)
    .await?;
    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE spans_fts USING fts5(
                span_id UNINDEXED,
                version_id UNINDEXED,
                tenant_id UNINDEXED,
                text_content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_chunks (
            id TEXT PRIMARY KEY,
            version_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            span_id TEXT,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            vector BLOB NOT NULL,
            dims INTEGER NOT NULL,
            offset_start INTEGER NOT NULL,
            offset_end INTEGER NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            FOREIGN KEY (version_id) REFERENCES document_versions(id),
            FOREIGN KEY (span_id) REFERENCES spans(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embedding_chunks_tenant ON embedding_chunks(tenant_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_embedding_chunks_span ON embedding_chunks(span_id) WHERE span_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extraction_runs (
            id TEXT PRIMARY KEY,
            version_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            extractor_name TEXT NOT NULL,
            extractor_version TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            profile TEXT,
            level INTEGER,
            process_context TEXT,
            schema_version TEXT,
            vocabulary_version TEXT,
            artifact_path TEXT,
            counts TEXT NOT NULL DEFAULT '{}',
            warnings TEXT NOT NULL DEFAULT '[]',
            error_message TEXT,
            started_at TEXT,
            finished_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At-most-one queued|running extraction run per (version, profile,
    // process_context, level) -- spec.md §5, §4.5.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_extraction_runs_active
        ON extraction_runs(version_id, profile, process_context, level)
        WHERE status IN ('pending', 'running')
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_extraction_runs_tenant ON extraction_runs(tenant_id)",
    )
    .execute(pool)
    .await?;

    for (table, extra_cols) in [
        ("claims", "subject TEXT NOT NULL, predicate TEXT NOT NULL, object TEXT NOT NULL"),
        (
            "metrics",
            "entity TEXT NOT NULL, name TEXT NOT NULL, value_numeric REAL, unit TEXT, currency TEXT, \
             period_start TEXT, period_end TEXT, as_of TEXT, period_type TEXT, calculation_method TEXT, \
             quality_flags TEXT NOT NULL DEFAULT '[]'",
        ),
        (
            "constraints",
            "kind TEXT NOT NULL, description TEXT NOT NULL, modifies_claim_ids TEXT NOT NULL DEFAULT '[]', \
             modifies_metric_ids TEXT NOT NULL DEFAULT '[]'",
        ),
        (
            "risks",
            "risk_type TEXT NOT NULL, severity TEXT NOT NULL, statement TEXT NOT NULL, rationale TEXT, \
             related_fact_ids TEXT NOT NULL DEFAULT '[]'",
        ),
    ] {
        let stmt = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                extraction_run_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                version_id TEXT NOT NULL,
                {extra_cols},
                certainty TEXT,
                source_reliability TEXT,
                process_context TEXT NOT NULL DEFAULT 'general',
                span_refs TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                FOREIGN KEY (extraction_run_id) REFERENCES extraction_runs(id)
            )
            "#
        );
        sqlx::query(&stmt).execute(pool).await?;
        let idx = format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_tenant ON {table}(tenant_id)"
        );
        sqlx::query(&idx).execute(pool).await?;
        let idx_version = format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_version ON {table}(version_id)"
        );
        sqlx::query(&idx_version).execute(pool).await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conflicts (
            id TEXT PRIMARY KEY,
            version_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            conflict_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            reason TEXT NOT NULL,
            fact_ids TEXT NOT NULL DEFAULT '[]',
            content_key TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(version_id, content_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS open_questions (
            id TEXT PRIMARY KEY,
            version_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            category TEXT NOT NULL,
            question TEXT NOT NULL,
            fact_ids TEXT NOT NULL DEFAULT '[]',
            content_key TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(version_id, content_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            deleted_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS folders (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            parent_folder_id TEXT,
            name TEXT NOT NULL,
            deleted_at TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_documents (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            pinned_version_id TEXT,
            folder_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_project_documents_unique ON project_documents(project_id, document_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS evidence_packs (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            project_id TEXT,
            name TEXT NOT NULL,
            description TEXT,
            span_ids TEXT NOT NULL DEFAULT '[]',
            claim_ids TEXT NOT NULL DEFAULT '[]',
            metric_ids TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_evidence_packs_tenant ON evidence_packs(tenant_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            job_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            priority INTEGER NOT NULL DEFAULT 0,
            payload TEXT NOT NULL DEFAULT '{}',
            result TEXT,
            error TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            progress INTEGER NOT NULL DEFAULT 0,
            progress_message TEXT,
            worker_id TEXT,
            external_queue_id TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_status_priority ON jobs(status, priority DESC, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_tenant ON jobs(tenant_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deletion_tasks (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            document_id TEXT,
            task_type TEXT NOT NULL,
            resource_id TEXT,
            processing_order INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_deletion_tasks_doc_order ON deletion_tasks(document_id, processing_order)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_deletion_tasks_status ON deletion_tasks(status)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            action TEXT NOT NULL,
            actor_id TEXT,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            request_id TEXT,
            ip_address TEXT,
            user_agent TEXT,
            details TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_log_tenant ON audit_log(tenant_id, created_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
