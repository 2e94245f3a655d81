//! Configuration parsing and validation.
//!
//! The evidence repository is configured via a TOML file (default:
//! `config/evidctl.toml`). Secrets (`openai_api_key`, `lovepdf_secret_key`)
//! are read from the environment and override whatever the file contains.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub tenancy: TenancyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// `sqlx` connection string, e.g. `sqlite:evidence.db` (spec.md §6
    /// `database_url`).
    #[serde(default = "default_database_url")]
    pub database_url: String,
    pub path: PathBuf,
}

fn default_database_url() -> String {
    "sqlite:evidence.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_root")]
    pub file_storage_root: PathBuf,
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            file_storage_root: default_storage_root(),
            s3: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    S3,
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Local
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3StorageConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Read from `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` if absent here.
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// `redis_url` (spec.md §6); `None` selects the broker-less polling
    /// worker mode.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_queue_name")]
    pub redis_queue_name: String,
    #[serde(default = "default_job_timeout")]
    pub redis_job_timeout_secs: u64,
    #[serde(default = "default_result_ttl")]
    pub redis_result_ttl_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_queue_name: default_queue_name(),
            redis_job_timeout_secs: default_job_timeout(),
            redis_result_ttl_secs: default_result_ttl(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_queue_name() -> String {
    "evidence-repository".to_string()
}
fn default_job_timeout() -> u64 {
    600
}
fn default_result_ttl() -> u64 {
    86_400
}
fn default_poll_interval() -> u64 {
    2_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub openai_embedding_model: Option<String>,
    #[serde(default)]
    pub openai_embedding_dimensions: Option<usize>,
    /// Never read from the TOML file in practice; [`Config::load`]
    /// overrides this from `OPENAI_API_KEY` if set.
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            openai_embedding_model: None,
            openai_embedding_dimensions: None,
            openai_api_key: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub lovepdf_public_key: Option<String>,
    #[serde(default)]
    pub lovepdf_secret_key: Option<String>,
    /// Directory embedded PDF images are written to. `None` (the default)
    /// skips image extraction entirely rather than writing to an implicit
    /// location (spec.md §4.2: "optionally extracts embedded images").
    #[serde(default)]
    pub pdf_image_dir: Option<String>,
    /// Vendor backing the fact extractor's structured-output calls
    /// ("openai" is the only one implemented; spec.md §4.5 treats the
    /// provider as swappable).
    #[serde(default = "default_llm_provider")]
    pub llm_provider: String,
    #[serde(default)]
    pub llm_model: Option<String>,
    /// Never read from the TOML file in practice; [`Config::load`]
    /// overrides this from `OPENAI_API_KEY` if set (same key the embedder
    /// uses — vendor account, not purpose, scopes the credential).
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extraction level run when a caller doesn't specify one (spec.md
    /// §4.5's 1-4 level hierarchy).
    #[serde(default = "default_extraction_level")]
    pub default_level: i32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            lovepdf_public_key: None,
            lovepdf_secret_key: None,
            pdf_image_dir: None,
            llm_provider: default_llm_provider(),
            llm_model: None,
            openai_api_key: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            default_level: default_extraction_level(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_extraction_level() -> i32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_bulk_batch_size")]
    pub bulk_ingestion_batch_size: usize,
    #[serde(default = "default_url_timeout")]
    pub url_download_timeout_secs: u64,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            bulk_ingestion_batch_size: default_bulk_batch_size(),
            url_download_timeout_secs: default_url_timeout(),
            max_file_size_mb: default_max_file_size_mb(),
            supported_extensions: default_supported_extensions(),
        }
    }
}

fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    100
}
fn default_bulk_batch_size() -> usize {
    20
}
fn default_url_timeout() -> u64 {
    30
}
fn default_max_file_size_mb() -> u64 {
    100
}
fn default_supported_extensions() -> Vec<String> {
    [
        ".pdf", ".txt", ".md", ".csv", ".xlsx", ".xls", ".png", ".jpg", ".jpeg", ".gif", ".webp",
        ".tiff", ".bmp",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bootstrap API keys accepted at startup (spec.md §6 `api_keys`), in
    /// addition to whatever is issued through `tenant_api_keys`.
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_cors_methods")]
    pub cors_allow_methods: Vec<String>,
    #[serde(default = "default_cors_headers")]
    pub cors_allow_headers: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_keys: Vec::new(),
            cors_origins: default_cors_origins(),
            cors_allow_methods: default_cors_methods(),
            cors_allow_headers: default_cors_headers(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_cors_headers() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_hybrid_semantic_weight")]
    pub hybrid_semantic_weight: f64,
    #[serde(default = "default_hybrid_keyword_weight")]
    pub hybrid_keyword_weight: f64,
    #[serde(default = "default_two_stage_metadata_weight")]
    pub two_stage_metadata_weight: f64,
    #[serde(default = "default_two_stage_semantic_weight")]
    pub two_stage_semantic_weight: f64,
    #[serde(default = "default_final_limit")]
    pub default_limit: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            hybrid_semantic_weight: default_hybrid_semantic_weight(),
            hybrid_keyword_weight: default_hybrid_keyword_weight(),
            two_stage_metadata_weight: default_two_stage_metadata_weight(),
            two_stage_semantic_weight: default_two_stage_semantic_weight(),
            default_limit: default_final_limit(),
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.7
}
fn default_hybrid_semantic_weight() -> f64 {
    0.7
}
fn default_hybrid_keyword_weight() -> f64 {
    0.3
}
// Fixed canonical per spec.md §9 ("open questions to flag, not guess") --
// kept configurable only so tests can exercise non-default weights; the
// server always starts from this canonical default.
fn default_two_stage_metadata_weight() -> f64 {
    0.3
}
fn default_two_stage_semantic_weight() -> f64 {
    0.7
}
fn default_final_limit() -> i64 {
    20
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TenancyConfig {
    /// Tenants to seed on `evidctl init` for local development.
    #[serde(default)]
    pub seed_tenants: Vec<String>,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides for secrets
    /// and validate cross-field invariants.
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file")?;

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.embedding.openai_api_key = Some(key.clone());
            config.extraction.openai_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("LOVEPDF_SECRET_KEY") {
            config.extraction.lovepdf_secret_key = Some(key);
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.db.database_url = url;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.queue.redis_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ingestion.chunk_size == 0 {
            anyhow::bail!("ingestion.chunk_size must be > 0");
        }
        if self.retrieval.default_limit < 1 {
            anyhow::bail!("retrieval.default_limit must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            anyhow::bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
        }

        if self.embedding.is_enabled() {
            if self.embedding.openai_embedding_dimensions.is_none()
                || self.embedding.openai_embedding_dimensions == Some(0)
            {
                anyhow::bail!(
                    "embedding.openai_embedding_dimensions must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.openai_embedding_model.is_none() {
                anyhow::bail!(
                    "embedding.openai_embedding_model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "local" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or local.",
                other
            ),
        }

        if self.storage.backend == StorageBackend::S3 && self.storage.s3.is_none() {
            anyhow::bail!("storage.s3 must be configured when storage.backend = \"s3\"");
        }

        Ok(())
    }
}

/// Free-function alias kept alongside the associated method, matching the
/// bare-function call style the rest of the crate uses elsewhere.
pub fn load_config(path: &Path) -> Result<Config> {
    Config::load(path)
}
