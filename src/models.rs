//! Core data model for the evidence repository.
//!
//! Every entity here is tenant-scoped: it carries a `tenant_id` field (or,
//! for child rows, inherits scope transitively through its parent) and no
//! query builder in this crate is allowed to omit the tenant predicate.
//! Identifiers are opaque UUIDs, serialized as strings at rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════
// Enums
// ═══════════════════════════════════════════════════════════════════════

/// Pipeline stage marker on a [`DocumentVersion`]. Advances strictly forward
/// or to `Failed`; never backward except through an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    Uploaded,
    Extracted,
    SpansBuilt,
    Embedded,
    FactsExtracted,
    QualityChecked,
    Failed,
}

impl ProcessingStatus {
    /// The stage immediately following this one, or `None` at the terminal
    /// success stage. `Failed` has no successor.
    pub fn next(self) -> Option<ProcessingStatus> {
        use ProcessingStatus::*;
        match self {
            Pending => Some(Uploaded),
            Uploaded => Some(Extracted),
            Extracted => Some(SpansBuilt),
            SpansBuilt => Some(Embedded),
            Embedded => Some(FactsExtracted),
            FactsExtracted => Some(QualityChecked),
            QualityChecked | Failed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeletionStatus {
    Active,
    MarkedForDeletion,
    Deleted,
    DeletionFailed,
}

impl Default for DeletionStatus {
    fn default() -> Self {
        DeletionStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    Text,
    Heading,
    Citation,
    Footnote,
    Table,
    Figure,
    Other,
}

impl SpanType {
    /// Span types the embedder is willing to vectorize (spec.md §4.4).
    pub fn is_embeddable(self) -> bool {
        matches!(
            self,
            SpanType::Text | SpanType::Heading | SpanType::Citation | SpanType::Footnote
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CertaintyLevel {
    Definite,
    Probable,
    Possible,
    Speculative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SourceReliability {
    Audited,
    Official,
    Internal,
    ThirdParty,
    Unknown,
}

/// Business process that partitions coexisting extractions over the same
/// `(version, profile, level)`. Unknown values deserialize to `Unspecified`
/// rather than failing, per spec.md §9.
// No `sqlx::Type` derive here: the macro only supports fieldless enums,
// and `Unspecified(String)` carries data. Query code binds/reads this
// type via the `From<String>`/`Into<String>` conversions below instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProcessContext {
    General,
    VcIcDecision,
    PharmaClinicalTrial,
    InsuranceUnderwriting,
    Unspecified(String),
}

impl From<String> for ProcessContext {
    fn from(s: String) -> Self {
        match s.as_str() {
            "general" => ProcessContext::General,
            "vc.ic_decision" => ProcessContext::VcIcDecision,
            "pharma.clinical_trial" => ProcessContext::PharmaClinicalTrial,
            "insurance.underwriting" => ProcessContext::InsuranceUnderwriting,
            other => ProcessContext::Unspecified(other.to_string()),
        }
    }
}

impl From<ProcessContext> for String {
    fn from(p: ProcessContext) -> String {
        match p {
            ProcessContext::General => "general".to_string(),
            ProcessContext::VcIcDecision => "vc.ic_decision".to_string(),
            ProcessContext::PharmaClinicalTrial => "pharma.clinical_trial".to_string(),
            ProcessContext::InsuranceUnderwriting => "insurance.underwriting".to_string(),
            ProcessContext::Unspecified(s) => s,
        }
    }
}

/// Vocabulary/prompt bundle keyed to a domain (spec.md glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    General,
    Vc,
    Pharma,
    Insurance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum ExtractionRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Retrying,
}

impl JobStatus {
    /// Terminal states never transition to a different terminal state
    /// (spec.md §8, "job terminal idempotence").
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    Normal,
    Low,
}

impl JobPriority {
    /// `>=10` high, `<0` low, otherwise normal (spec.md §4.9).
    pub fn from_priority_integer(priority: i64) -> JobPriority {
        if priority >= 10 {
            JobPriority::High
        } else if priority < 0 {
            JobPriority::Low
        } else {
            JobPriority::Normal
        }
    }

    pub fn queue_name(self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Ingest,
    Extract,
    Embed,
    ProcessFull,
    ProcessVersion,
    BulkFolder,
    BulkUrl,
    MultilevelExtract,
    UpgradeExtractionLevel,
    DeleteDocument,
}

/// Ordered resource kinds in the cascading deletion protocol (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeletionTaskType {
    StorageFile,
    EmbeddingChunks,
    Spans,
    FactsClaims,
    FactsMetrics,
    FactsConstraints,
    FactsRisks,
    QualityConflicts,
    QualityOpenQuestions,
    ExtractionRuns,
    ProjectDocuments,
    DocumentVersions,
    DocumentRecord,
}

impl DeletionTaskType {
    /// Topological level in the deletion dependency graph (spec.md §4.8,
    /// §9 "deletion as a graph walk"); tasks sharing a level run
    /// concurrently and the engine advances once all at a level are
    /// terminal.
    pub fn processing_order(self) -> i32 {
        use DeletionTaskType::*;
        match self {
            StorageFile => 1,
            EmbeddingChunks => 2,
            Spans => 3,
            FactsClaims | FactsMetrics | FactsConstraints | FactsRisks => 4,
            QualityConflicts | QualityOpenQuestions => 5,
            ExtractionRuns => 6,
            ProjectDocuments => 7,
            DocumentVersions => 8,
            DocumentRecord => 9,
        }
    }

    pub fn all_in_order() -> [DeletionTaskType; 13] {
        use DeletionTaskType::*;
        [
            StorageFile,
            EmbeddingChunks,
            Spans,
            FactsClaims,
            FactsMetrics,
            FactsConstraints,
            FactsRisks,
            QualityConflicts,
            QualityOpenQuestions,
            ExtractionRuns,
            ProjectDocuments,
            DocumentVersions,
            DocumentRecord,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum DeletionTaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

// ═══════════════════════════════════════════════════════════════════════
// Locators
// ═══════════════════════════════════════════════════════════════════════

/// Format-specific polymorphic record pinpointing a span within its source
/// document. Stored as canonical JSON; code interpreting a locator must
/// exhaustively match every variant (spec.md §9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Locator {
    Text {
        offset_start: i64,
        offset_end: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        page_hint: Option<i64>,
    },
    Csv {
        row_start: i64,
        row_end: i64,
        col_start: i64,
        col_end: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        table_index: Option<i64>,
    },
    Excel {
        sheet: String,
        cell_range: String,
    },
    Image {
        filename: String,
        image_index: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        width: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        height: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        page_number: Option<i64>,
    },
}

impl Locator {
    /// Canonical JSON for hashing: serde_json's map output follows the
    /// struct's declared field order, which is stable across runs because
    /// the enum shape never changes at runtime.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("Locator always serializes")
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Tenant-scoped entities
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub original_filename: String,
    pub content_type: String,
    /// SHA-256 of the first uploaded version's bytes; used for tenant-scoped
    /// dedup so re-uploading identical bytes reuses this document.
    pub content_hash: String,
    pub classification: Option<String>,
    pub source_type: String,
    pub source_url: Option<String>,
    pub sectors: Vec<String>,
    pub topics: Vec<String>,
    pub geographies: Vec<String>,
    pub companies: Vec<String>,
    pub authors: Vec<String>,
    pub publishing_organization: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub deletion_status: DeletionStatus,
    pub deletion_requested_by: Option<Uuid>,
    pub deletion_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: Uuid,
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub version_number: i64,
    pub blob_key: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub upload_status: UploadStatus,
    pub processing_status: ProcessingStatus,
    pub extraction_status: ExtractionRunStatus,
    pub extracted_text: Option<String>,
    pub page_count: Option<i64>,
    pub truthfulness_score: Option<f64>,
    pub bias_score: Option<f64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: Uuid,
    pub version_id: Uuid,
    pub tenant_id: Uuid,
    pub locator: Locator,
    pub end_locator: Option<Locator>,
    pub text_content: String,
    pub span_type: SpanType,
    /// `SHA-256(json_canonical(locator) ∥ "|" ∥ first_1000_chars(text))`.
    pub span_hash: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingChunk {
    pub id: Uuid,
    pub version_id: Uuid,
    pub tenant_id: Uuid,
    pub span_id: Option<Uuid>,
    pub chunk_index: i64,
    pub text: String,
    /// Little-endian f32 blob, dimensionality fixed per tenant config.
    pub vector: Vec<u8>,
    pub dims: i64,
    pub offset_start: i64,
    pub offset_end: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRun {
    pub id: Uuid,
    pub version_id: Uuid,
    pub tenant_id: Uuid,
    pub extractor_name: String,
    pub extractor_version: String,
    pub status: ExtractionRunStatus,
    pub profile: Option<Profile>,
    pub level: Option<i32>,
    pub process_context: Option<ProcessContext>,
    pub schema_version: Option<String>,
    pub vocabulary_version: Option<String>,
    pub artifact_path: Option<String>,
    pub counts: serde_json::Value,
    pub warnings: Vec<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    pub extraction_run_id: Uuid,
    pub tenant_id: Uuid,
    pub version_id: Uuid,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub certainty: CertaintyLevel,
    pub source_reliability: SourceReliability,
    pub process_context: ProcessContext,
    pub span_refs: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: Uuid,
    pub extraction_run_id: Uuid,
    pub tenant_id: Uuid,
    pub version_id: Uuid,
    pub entity: String,
    pub name: String,
    pub value_numeric: Option<f64>,
    pub unit: Option<String>,
    pub currency: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub as_of: Option<DateTime<Utc>>,
    pub period_type: Option<String>,
    pub calculation_method: Option<String>,
    pub quality_flags: Vec<String>,
    pub certainty: CertaintyLevel,
    pub source_reliability: SourceReliability,
    pub process_context: ProcessContext,
    pub span_refs: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub id: Uuid,
    pub extraction_run_id: Uuid,
    pub tenant_id: Uuid,
    pub version_id: Uuid,
    pub kind: String,
    pub description: String,
    pub modifies_claim_ids: Vec<Uuid>,
    pub modifies_metric_ids: Vec<Uuid>,
    pub certainty: CertaintyLevel,
    pub process_context: ProcessContext,
    pub span_refs: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Risk {
    pub id: Uuid,
    pub extraction_run_id: Uuid,
    pub tenant_id: Uuid,
    pub version_id: Uuid,
    pub risk_type: String,
    pub severity: String,
    pub statement: String,
    pub rationale: Option<String>,
    pub related_fact_ids: Vec<Uuid>,
    pub process_context: ProcessContext,
    pub span_refs: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    pub version_id: Uuid,
    pub tenant_id: Uuid,
    pub conflict_type: String,
    pub severity: ConflictSeverity,
    pub reason: String,
    pub fact_ids: Vec<Uuid>,
    /// Stable key over the involved fact ids and kind, used to deduplicate
    /// identical conflicts across re-runs (spec.md §4.6).
    pub content_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OpenQuestionCategory {
    MissingData,
    Ambiguous,
    Verification,
    Methodology,
    Temporal,
    Clarification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenQuestion {
    pub id: Uuid,
    pub version_id: Uuid,
    pub tenant_id: Uuid,
    pub category: OpenQuestionCategory,
    pub question: String,
    pub fact_ids: Vec<Uuid>,
    pub content_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: Uuid,
    pub project_id: Uuid,
    pub tenant_id: Uuid,
    pub parent_folder_id: Option<Uuid>,
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDocument {
    pub id: Uuid,
    pub project_id: Uuid,
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    /// `None` means "track the latest version".
    pub pinned_version_id: Option<Uuid>,
    pub folder_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A curated, exportable bundle of spans/claims/metrics (spec.md §6
/// "evidence-pack CRUD and export"). The pack itself only stores
/// references; `export` (see [`crate::packs::export_pack`]) is what
/// materializes those references into a structured JSON tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePack {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub span_ids: Vec<Uuid>,
    pub claim_ids: Vec<Uuid>,
    pub metric_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i64,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub progress: i32,
    pub progress_message: Option<String>,
    pub worker_id: Option<String>,
    pub external_queue_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some((finished - started).num_seconds()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Cleared (set to `None`) once the final `document_record` task
    /// completes; the row itself persists as audit trail.
    pub document_id: Option<Uuid>,
    pub task_type: DeletionTaskType,
    pub resource_id: Option<Uuid>,
    pub processing_order: i32,
    pub status: DeletionTaskStatus,
    pub retry_count: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub action: String,
    pub actor_id: Option<Uuid>,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub request_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantApiKey {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// SHA-256 hash of the plaintext key; the plaintext is returned only at
    /// creation time and never stored.
    pub key_hash: String,
    pub display_prefix: String,
    pub scopes: Vec<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TenantApiKey {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return false;
            }
        }
        match self.activated_at {
            Some(activated_at) => activated_at <= now,
            None => true,
        }
    }
}

/// An authenticated principal, resolved once per request and threaded
/// explicitly through every handler and query builder (spec.md §9). Never
/// held as process-wide or task-local implicit state.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub scopes: Vec<String>,
}

impl TenantContext {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "*")
    }
}
