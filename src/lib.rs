//! # Evidence Repository
//!
//! A content-addressable document store: ingest PDFs, spreadsheets, images,
//! and plain text; extract structured content; segment it into
//! citation-grade spans; embed and index those spans; and expose semantic,
//! keyword, hybrid, two-stage, and discovery search alongside multi-level
//! structured fact extraction (claims, metrics, constraints, risks). Every
//! returned fact traces back through a span to an exact locator within a
//! specific document version.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌───────────┐
//! │  Upload   │──▶│ Extractor │──▶│  Spans  │──▶│ Embeddings │
//! │ (blob.rs) │   │(extract/) │   │ (span/) │   │(embedding.rs)│
//! └──────────┘   └───────────┘   └─────────┘   └─────┬─────┘
//!                                                      │
//!                      ┌───────────────────────────────┤
//!                      ▼                               ▼
//!                ┌───────────┐                  ┌────────────┐
//!                │  facts.rs  │                  │  search.rs  │
//!                │ (claims,   │                  │ (5 modes)   │
//!                │  metrics…) │                  └────────────┘
//!                └─────┬─────┘
//!                      ▼
//!                ┌───────────┐
//!                │ quality.rs │
//!                └───────────┘
//! ```
//!
//! Every stage above is driven by [`pipeline`] as a linear state machine
//! over [`models::ProcessingStatus`]; every query and mutation is scoped by
//! a [`models::TenantContext`] resolved once per request in [`tenant`] and
//! threaded explicitly, never held as ambient state.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: entities, enums, locators, tenant context |
//! | [`db`] | SQLite connection pool (WAL mode) |
//! | [`migrate`] | Database schema migrations (idempotent) |
//! | [`blob`] | Local/S3 blob storage behind a narrow interface |
//! | [`extract`] | Per-format content extraction (PDF, text, CSV, XLSX, image) |
//! | [`span`] | Citation-grade span segmentation with format-specific locators |
//! | [`embedding`] | Embedding provider trait, OpenAI implementation, vector utilities |
//! | [`facts`] | Vocabulary-driven, level-gated structured fact extraction |
//! | [`quality`] | Conflict/open-question detection and truthfulness/bias scoring |
//! | [`search`] | Semantic, keyword, hybrid, two-stage, and discovery search |
//! | [`deletion`] | Cascading two-phase deletion protocol |
//! | [`queue`] | Priority job queue backed by the `jobs` table |
//! | [`pipeline`] | The per-version processing state machine |
//! | [`worker`] | Job dispatch: turns a claimed job into pipeline/facts/quality/deletion calls |
//! | [`tenant`] | Principal resolution and API key lifecycle |
//! | [`audit`] | Append-only audit log |
//! | [`validation`] | SSRF protection and filename sanitization |
//! | [`error`] | HTTP-boundary error taxonomy |
//! | [`packs`] | Evidence-pack CRUD and export |
//! | [`server`] | HTTP surface (Axum) with CORS |
//!
//! ## Configuration
//!
//! The evidence repository is configured via a TOML file (default:
//! `config/evidctl.toml`). See [`config`] for all available options and
//! [`config::load_config`] for validation rules.

pub mod audit;
pub mod blob;
pub mod config;
pub mod db;
pub mod deletion;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod facts;
pub mod migrate;
pub mod models;
pub mod packs;
pub mod pipeline;
pub mod quality;
pub mod queue;
pub mod search;
pub mod server;
pub mod span;
pub mod tenant;
pub mod validation;
pub mod worker;
