//! Multi-mode search over spans and their embeddings (spec.md §4.7).
//!
//! Every mode shares one candidate-fetch path (`fetch_candidates`), which
//! applies tenant scope, project/document scope, `spans_only`, span-type
//! filter, and (for two-stage) the document-array metadata filter, before
//! the mode-specific ranking runs. Modes never see unscoped rows — scoping
//! happens once, in SQL, not as a post-filter in Rust.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{blob_to_vec, cosine_similarity, embed_query, Embedder};
use crate::models::SpanType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Semantic,
    Keyword,
    Hybrid,
    TwoStage,
    Discovery,
}

impl std::str::FromStr for SearchMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(SearchMode::Semantic),
            "keyword" => Ok(SearchMode::Keyword),
            "hybrid" => Ok(SearchMode::Hybrid),
            "two_stage" | "two-stage" => Ok(SearchMode::TwoStage),
            "discovery" => Ok(SearchMode::Discovery),
            other => Err(format!("unknown search mode '{other}'")),
        }
    }
}

/// Everything a query can be narrowed by (spec.md §4.7 "All modes honor…").
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub project_id: Option<Uuid>,
    pub document_ids: Vec<Uuid>,
    pub spans_only: bool,
    pub span_types: Vec<SpanType>,
    pub sectors: Vec<String>,
    pub topics: Vec<String>,
    pub document_types: Vec<String>,
    pub geographies: Vec<String>,
    pub companies: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub text: String,
    pub keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub limit: i64,
    pub similarity_threshold: Option<f64>,
    pub filters: SearchFilters,
}

#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub span_id: Uuid,
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    pub document_filename: String,
    pub span_type: SpanType,
    pub locator: serde_json::Value,
    pub text_excerpt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub similarity: f64,
    pub citation: Citation,
    pub matched_text: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub query: String,
    pub mode: SearchMode,
    pub results: Vec<SearchResultItem>,
    pub total: usize,
    pub search_time_ms: u64,
    pub timestamp: String,
    pub filters_applied: serde_json::Value,
}

#[derive(Debug, FromRow)]
struct CandidateRow {
    span_id: String,
    version_id: String,
    document_id: String,
    original_filename: String,
    locator: String,
    span_type: String,
    text_content: String,
    span_metadata: String,
    vector: Option<Vec<u8>>,
}

struct Candidate {
    span_id: Uuid,
    version_id: Uuid,
    document_id: Uuid,
    filename: String,
    locator: serde_json::Value,
    span_type: SpanType,
    text: String,
    metadata: serde_json::Value,
    vector: Option<Vec<f32>>,
}

impl Candidate {
    fn citation(&self) -> Citation {
        Citation {
            span_id: self.span_id,
            document_id: self.document_id,
            document_version_id: self.version_id,
            document_filename: self.filename.clone(),
            span_type: self.span_type,
            locator: self.locator.clone(),
            text_excerpt: excerpt(&self.text, 280),
        }
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}…")
    }
}

/// Fetches every span a tenant's filters allow, joined against its
/// embedding vector when one exists. Shared by every mode so scoping lives
/// in exactly one query.
async fn fetch_candidates(
    pool: &SqlitePool,
    tenant_id: Uuid,
    filters: &SearchFilters,
) -> anyhow::Result<Vec<Candidate>> {
    let mut sql = String::from(
        "SELECT s.id AS span_id, s.version_id AS version_id, dv.document_id AS document_id, \
         d.original_filename AS original_filename, s.locator AS locator, s.span_type AS span_type, \
         s.text_content AS text_content, s.metadata AS span_metadata, e.vector AS vector \
         FROM spans s \
         JOIN document_versions dv ON dv.id = s.version_id \
         JOIN documents d ON d.id = dv.document_id \
         LEFT JOIN embedding_chunks e ON e.span_id = s.id \
         WHERE s.tenant_id = ? AND d.deletion_status = 'active'",
    );
    let mut binds: Vec<String> = vec![tenant_id.to_string()];

    if let Some(project_id) = filters.project_id {
        sql.push_str(
            " AND dv.document_id IN (SELECT document_id FROM project_documents WHERE project_id = ?)",
        );
        binds.push(project_id.to_string());
    }

    if !filters.document_ids.is_empty() {
        let placeholders = filters.document_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        sql.push_str(&format!(" AND dv.document_id IN ({placeholders})"));
        binds.extend(filters.document_ids.iter().map(|id| id.to_string()));
    }

    if !filters.span_types.is_empty() {
        let placeholders = filters.span_types.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        sql.push_str(&format!(" AND s.span_type IN ({placeholders})"));
        for t in &filters.span_types {
            binds.push(serde_json::to_value(t)?.as_str().unwrap().to_string());
        }
    }

    if filters.spans_only {
        sql.push_str(" AND e.id IS NOT NULL");
    }

    for (column, values) in [
        ("sectors", &filters.sectors),
        ("topics", &filters.topics),
        ("geographies", &filters.geographies),
        ("companies", &filters.companies),
    ] {
        if !values.is_empty() {
            let clause = values.iter().map(|_| format!("d.{column} LIKE ?")).collect::<Vec<_>>().join(" OR ");
            sql.push_str(&format!(" AND ({clause})"));
            for v in values {
                binds.push(format!("%\"{v}\"%"));
            }
        }
    }
    if !filters.document_types.is_empty() {
        let clause = filters.document_types.iter().map(|_| "d.content_type = ?").collect::<Vec<_>>().join(" OR ");
        sql.push_str(&format!(" AND ({clause})"));
        for v in &filters.document_types {
            binds.push(v.clone());
        }
    }

    sql.push_str(" ORDER BY s.created_at ASC");

    let mut q = sqlx::query_as::<_, CandidateRow>(&sql);
    for b in &binds {
        q = q.bind(b);
    }
    let rows = q.fetch_all(pool).await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in rows {
        let Ok(span_id) = Uuid::parse_str(&row.span_id) else { continue };
        let Ok(version_id) = Uuid::parse_str(&row.version_id) else { continue };
        let Ok(document_id) = Uuid::parse_str(&row.document_id) else { continue };
        let Ok(span_type) = serde_json::from_value::<SpanType>(serde_json::Value::String(row.span_type)) else {
            continue;
        };
        let locator = serde_json::from_str(&row.locator).unwrap_or(serde_json::Value::Null);
        let metadata = serde_json::from_str(&row.span_metadata).unwrap_or(serde_json::json!({}));
        let vector = row.vector.map(|v| blob_to_vec(&v));
        candidates.push(Candidate {
            span_id,
            version_id,
            document_id,
            filename: row.original_filename,
            locator,
            span_type,
            text: row.text_content,
            metadata,
            vector,
        });
    }
    Ok(candidates)
}

fn keyword_score(text: &str, keywords: &[String], exclude_keywords: &[String]) -> Option<f64> {
    let lower = text.to_lowercase();
    if keywords.is_empty() {
        return None;
    }
    for excluded in exclude_keywords {
        if !excluded.is_empty() && lower.contains(&excluded.to_lowercase()) {
            return None;
        }
    }
    let mut total = 0usize;
    for kw in keywords {
        let kw_lower = kw.to_lowercase();
        let count = lower.matches(&kw_lower).count();
        if count == 0 {
            return None; // AND semantics: every keyword must appear
        }
        total += count;
    }
    Some(total as f64)
}

fn normalize_scores(scored: &[(usize, f64)]) -> HashMap<usize, f64> {
    let max = scored.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return scored.iter().map(|(i, _)| (*i, 0.0)).collect();
    }
    scored.iter().map(|(i, s)| (*i, s / max)).collect()
}

async fn run_semantic(
    embedder: &dyn Embedder,
    config: &Config,
    query: &SearchQuery,
    candidates: &[Candidate],
) -> anyhow::Result<Vec<(usize, f64)>> {
    let query_vector = embed_query(embedder, &config.embedding, &query.text).await?;
    let threshold = query.similarity_threshold.unwrap_or(config.retrieval.similarity_threshold);
    let mut scored = Vec::new();
    for (idx, c) in candidates.iter().enumerate() {
        let Some(vector) = &c.vector else { continue };
        let sim = cosine_similarity(&query_vector, vector) as f64;
        if sim >= threshold {
            scored.push((idx, sim));
        }
    }
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scored)
}

fn run_keyword(query: &SearchQuery, candidates: &[Candidate]) -> Vec<(usize, f64)> {
    let keywords = if query.keywords.is_empty() {
        query.text.split_whitespace().map(|s| s.to_string()).collect()
    } else {
        query.keywords.clone()
    };
    let mut scored: Vec<(usize, f64)> = candidates
        .iter()
        .enumerate()
        .filter_map(|(idx, c)| keyword_score(&c.text, &keywords, &query.exclude_keywords).map(|s| (idx, s)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

fn build_filters_applied(query: &SearchQuery) -> serde_json::Value {
    serde_json::json!({
        "project_id": query.filters.project_id,
        "document_ids": query.filters.document_ids,
        "spans_only": query.filters.spans_only,
        "span_types": query.filters.span_types.iter().map(|t| serde_json::to_value(t).unwrap()).collect::<Vec<_>>(),
        "sectors": query.filters.sectors,
        "topics": query.filters.topics,
        "document_types": query.filters.document_types,
        "geographies": query.filters.geographies,
        "companies": query.filters.companies,
        "exclude_keywords": query.exclude_keywords,
    })
}

/// Run a search (spec.md §4.7). `embedder` is required for `semantic`,
/// `hybrid`, and `two_stage`; its absence surfaces as an error for those
/// modes rather than silently degrading to keyword-only ranking.
pub async fn search(
    pool: &SqlitePool,
    embedder: Option<&dyn Embedder>,
    config: &Config,
    tenant_id: Uuid,
    mode: SearchMode,
    query: &SearchQuery,
) -> anyhow::Result<SearchResult> {
    let started = Instant::now();
    let candidates = fetch_candidates(pool, tenant_id, &query.filters).await?;
    let limit = if query.limit > 0 { query.limit as usize } else { config.retrieval.default_limit as usize };

    let scored: Vec<(usize, f64)> = match mode {
        SearchMode::Keyword => run_keyword(query, &candidates),
        SearchMode::Semantic => {
            let embedder = embedder.ok_or_else(|| anyhow::anyhow!("semantic search requires an embedding provider"))?;
            run_semantic(embedder, config, query, &candidates).await?
        }
        SearchMode::Hybrid => {
            let embedder = embedder.ok_or_else(|| anyhow::anyhow!("hybrid search requires an embedding provider"))?;
            let semantic = run_semantic(embedder, config, query, &candidates).await?;
            let keyword = run_keyword(query, &candidates);
            let sem_norm = normalize_scores(&semantic);
            let kw_norm = normalize_scores(&keyword);
            let mut indices: std::collections::HashSet<usize> = sem_norm.keys().copied().collect();
            indices.extend(kw_norm.keys());
            let (alpha, beta) = (config.retrieval.hybrid_semantic_weight, config.retrieval.hybrid_keyword_weight);
            let total_weight = alpha + beta;
            let mut combined: Vec<(usize, f64)> = indices
                .into_iter()
                .map(|idx| {
                    let sem = sem_norm.get(&idx).copied().unwrap_or(0.0);
                    let kw = kw_norm.get(&idx).copied().unwrap_or(0.0);
                    (idx, (alpha * sem + beta * kw) / total_weight.max(1e-9))
                })
                .collect();
            combined.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            combined
        }
        SearchMode::TwoStage => {
            // Stage 1 (the metadata filter over sectors/topics/document_types/
            // geographies/companies/project/document scope) already ran in
            // `fetch_candidates`; stage 2 is semantic ranking within that
            // candidate set, reweighted by `two_stage_metadata_weight` so a
            // perfect metadata match still outranks a marginal one.
            let embedder = embedder.ok_or_else(|| anyhow::anyhow!("two_stage search requires an embedding provider"))?;
            let semantic = run_semantic(embedder, config, query, &candidates).await?;
            let sem_norm = normalize_scores(&semantic);
            let metadata_weight = config.retrieval.two_stage_metadata_weight;
            let semantic_weight = config.retrieval.two_stage_semantic_weight;
            let mut combined: Vec<(usize, f64)> = sem_norm
                .iter()
                .map(|(idx, sem)| (*idx, metadata_weight + semantic_weight * sem))
                .collect();
            combined.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            combined
        }
        SearchMode::Discovery => {
            // Optimizes for document coverage: rank all candidates (keyword
            // if no embedder is configured, else semantic), then keep only
            // the first (highest-scoring) span per distinct document.
            let ranked = if let Some(embedder) = embedder {
                run_semantic(embedder, config, query, &candidates).await?
            } else {
                run_keyword(query, &candidates)
            };
            let mut seen_documents = std::collections::HashSet::new();
            let mut per_document = Vec::new();
            for (idx, score) in ranked {
                let document_id = candidates[idx].document_id;
                if seen_documents.insert(document_id) {
                    per_document.push((idx, score));
                }
            }
            per_document
        }
    };

    let total = scored.len();
    let results: Vec<SearchResultItem> = scored
        .into_iter()
        .take(limit)
        .map(|(idx, score)| {
            let candidate = &candidates[idx];
            SearchResultItem {
                similarity: score,
                citation: candidate.citation(),
                matched_text: excerpt(&candidate.text, 500),
                metadata: candidate.metadata.clone(),
            }
        })
        .collect();

    Ok(SearchResult {
        query: query.text.clone(),
        mode,
        results,
        total,
        search_time_ms: started.elapsed().as_millis() as u64,
        timestamp: chrono::Utc::now().to_rfc3339(),
        filters_applied: build_filters_applied(query),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_score_requires_all_keywords() {
        let text = "quarterly revenue increased across all regions";
        assert!(keyword_score(text, &["revenue".into(), "regions".into()], &[]).is_some());
        assert!(keyword_score(text, &["revenue".into(), "profit".into()], &[]).is_none());
    }

    #[test]
    fn keyword_score_honors_exclude_list() {
        let text = "revenue declined due to one-time charges";
        assert!(keyword_score(text, &["revenue".into()], &["declined".into()]).is_none());
    }

    #[test]
    fn normalize_scores_divides_by_max() {
        let scored = vec![(0, 4.0), (1, 2.0), (2, 0.0)];
        let normalized = normalize_scores(&scored);
        assert_eq!(normalized[&0], 1.0);
        assert_eq!(normalized[&1], 0.5);
        assert_eq!(normalized[&2], 0.0);
    }

    #[test]
    fn search_mode_parses_hyphen_and_underscore_two_stage() {
        assert_eq!("two_stage".parse::<SearchMode>().unwrap(), SearchMode::TwoStage);
        assert_eq!("two-stage".parse::<SearchMode>().unwrap(), SearchMode::TwoStage);
        assert!("bogus".parse::<SearchMode>().is_err());
    }
}
