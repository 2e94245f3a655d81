//! `evidctl` — the evidence repository's CLI and process entrypoint.
//!
//! Three long-running modes and a handful of operator utilities:
//!
//! - `evidctl init` creates the schema and seeds any tenants configured
//!   under `[tenancy]`.
//! - `evidctl serve` runs the HTTP API (`evidence_repository::server`).
//! - `evidctl worker` runs the polling job processor
//!   (`evidence_repository::worker`), claiming from the `jobs` table until
//!   it receives SIGINT/SIGTERM.
//!
//! `tenant` and `job` subcommands exist for local operation without a
//! running server: issuing a first API key, or inspecting/canceling queued
//! work.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use evidence_repository::config::{self, Config};
use evidence_repository::models::JobStatus;
use evidence_repository::{db, deletion, migrate, queue, server, tenant, worker::Worker};

#[derive(Parser)]
#[command(
    name = "evidctl",
    about = "Evidence repository: ingestion, search, and fact extraction with full provenance",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/evidctl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and seed configured tenants
    Init,

    /// Start the HTTP API server
    Serve,

    /// Run the polling job worker until interrupted
    Worker {
        /// Identifier recorded on claimed jobs; defaults to a generated one
        #[arg(long)]
        worker_id: Option<String>,

        /// Milliseconds to sleep between empty queue polls
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },

    /// Tenant and API key management
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },

    /// Job queue inspection and control
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum TenantAction {
    /// Create a new tenant
    Create {
        /// Display name for the tenant
        name: String,
    },
    /// Issue a new API key for an existing tenant
    IssueKey {
        /// Tenant UUID
        tenant_id: String,
        /// Comma-separated scopes, e.g. "read,write". Defaults to "*".
        #[arg(long)]
        scopes: Option<String>,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// List jobs for a tenant, optionally filtered by status
    List {
        /// Tenant UUID
        tenant_id: String,
        /// One of: queued, running, succeeded, failed, canceled, retrying
        #[arg(long)]
        status: Option<String>,
    },
    /// Cancel a queued or retrying job
    Cancel {
        /// Job UUID
        job_id: String,
    },
    /// Delete terminal jobs older than the given number of days
    Cleanup {
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },
    /// Request cascading deletion of a document, synchronously
    DeleteDocument {
        tenant_id: String,
        document_id: String,
        requested_by: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Worker { worker_id, poll_interval_ms } => run_worker(&cfg, worker_id, poll_interval_ms).await?,
        Commands::Tenant { action } => run_tenant_action(&cfg, action).await?,
        Commands::Job { action } => run_job_action(&cfg, action).await?,
    }

    Ok(())
}

async fn run_init(cfg: &Config) -> anyhow::Result<()> {
    migrate::run_migrations(cfg).await?;
    println!("Database schema initialized.");

    if !cfg.tenancy.seed_tenants.is_empty() {
        let pool = db::connect(cfg).await?;
        for name in &cfg.tenancy.seed_tenants {
            let id = Uuid::new_v4();
            sqlx::query("INSERT INTO tenants (id, name, created_at) VALUES (?, ?, ?)")
                .bind(id.to_string())
                .bind(name)
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&pool)
                .await?;
            println!("Seeded tenant '{name}' ({id})");
        }
        pool.close().await;
    }

    Ok(())
}

/// Runs until SIGINT/SIGTERM. On either signal, sets the shutdown flag that
/// [`Worker::run_polling_loop`] checks between claim attempts, so the
/// process exits after finishing any job already in flight rather than
/// mid-task.
async fn run_worker(cfg: &Config, worker_id: Option<String>, poll_interval_ms: Option<u64>) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let worker_id = worker_id.unwrap_or_else(|| format!("evidctl-{}", Uuid::new_v4()));
    let poll_interval = Duration::from_millis(poll_interval_ms.unwrap_or(cfg.queue.poll_interval_ms));

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_shutdown_listener(shutdown.clone());

    let worker = Worker::new(pool, cfg.clone())?;
    worker.run_polling_loop(&worker_id, poll_interval, shutdown).await
}

fn spawn_shutdown_listener(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        shutdown.store(true, Ordering::SeqCst);
    });
}

async fn run_tenant_action(cfg: &Config, action: TenantAction) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    match action {
        TenantAction::Create { name } => {
            let id = Uuid::new_v4();
            sqlx::query("INSERT INTO tenants (id, name, created_at) VALUES (?, ?, ?)")
                .bind(id.to_string())
                .bind(&name)
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&pool)
                .await?;
            println!("Created tenant '{name}' ({id})");
        }
        TenantAction::IssueKey { tenant_id, scopes } => {
            let tenant_uuid = Uuid::parse_str(&tenant_id)?;
            let scopes: Vec<String> = scopes
                .map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
                .unwrap_or_else(|| vec!["*".to_string()]);
            let (plaintext, row) = tenant::issue_api_key(tenant_uuid, scopes);
            sqlx::query(
                "INSERT INTO tenant_api_keys (id, tenant_id, key_hash, display_prefix, scopes, activated_at, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(row.id.to_string())
            .bind(row.tenant_id.to_string())
            .bind(&row.key_hash)
            .bind(&row.display_prefix)
            .bind(serde_json::to_string(&row.scopes)?)
            .bind(row.activated_at.map(|t| t.to_rfc3339()))
            .bind(row.created_at.to_rfc3339())
            .execute(&pool)
            .await?;
            println!("Issued API key: {plaintext}");
            println!("Store this now; it will not be shown again.");
        }
    }
    pool.close().await;
    Ok(())
}

async fn run_job_action(cfg: &Config, action: JobAction) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    match action {
        JobAction::List { tenant_id, status } => {
            let tenant_uuid = Uuid::parse_str(&tenant_id)?;
            let status = status.map(|s| parse_job_status(&s)).transpose()?;
            let jobs = queue::list_jobs(&pool, tenant_uuid, status).await?;
            for job in jobs {
                println!(
                    "{}  {:?}  {:?}  priority={}  attempts={}/{}",
                    job.id, job.job_type, job.status, job.priority, job.attempts, job.max_attempts
                );
            }
        }
        JobAction::Cancel { job_id } => {
            let job_uuid = Uuid::parse_str(&job_id)?;
            let canceled = queue::cancel_job(&pool, job_uuid).await?;
            if canceled {
                println!("Canceled job {job_id}");
            } else {
                println!("Job {job_id} was not queued/retrying; nothing to cancel");
            }
        }
        JobAction::Cleanup { older_than_days } => {
            let removed = queue::cleanup_old_jobs(&pool, older_than_days).await?;
            println!("Removed {removed} terminal jobs older than {older_than_days} days");
        }
        JobAction::DeleteDocument { tenant_id, document_id, requested_by } => {
            let tenant_uuid = Uuid::parse_str(&tenant_id)?;
            let document_uuid = Uuid::parse_str(&document_id)?;
            let requested_by_uuid = Uuid::parse_str(&requested_by)?;
            deletion::mark_for_deletion(&pool, tenant_uuid, document_uuid, requested_by_uuid).await?;
            let blob_store: Arc<dyn evidence_repository::blob::BlobStore> =
                Arc::from(evidence_repository::blob::build_blob_store(&cfg.storage)?);
            deletion::run_deletion(&pool, blob_store, tenant_uuid, document_uuid).await?;
            println!("Deleted document {document_id}");
        }
    }
    pool.close().await;
    Ok(())
}

fn parse_job_status(s: &str) -> anyhow::Result<JobStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| anyhow::anyhow!("unknown job status '{s}'"))
}
