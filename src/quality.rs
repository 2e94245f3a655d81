//! Quality analysis: conflict detection across the current fact set, open
//! question surfacing, and deterministic truthfulness/bias scoring.
//!
//! Conflict and question rows are deduplicated by a stable `content_key`
//! so re-running analysis after a re-extraction doesn't pile up duplicate
//! rows for the same underlying disagreement — the unique index on
//! `(version_id, content_key)` (see `migrate.rs`) makes the insert an
//! upsert.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{ConflictSeverity, OpenQuestionCategory};

/// Numeric disagreement at or above this fraction of the larger value is
/// a `high` severity conflict; below it, `medium`.
const HIGH_SEVERITY_THRESHOLD: f64 = 0.25;

#[derive(Debug, Clone, sqlx::FromRow)]
struct MetricRow {
    id: String,
    entity: String,
    name: String,
    value_numeric: Option<f64>,
    unit: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ClaimRow {
    id: String,
    subject: String,
    predicate: String,
    object: String,
}

fn content_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedConflict {
    pub conflict_type: String,
    pub severity: ConflictSeverity,
    pub reason: String,
    pub fact_ids: Vec<Uuid>,
    pub content_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedQuestion {
    pub category: OpenQuestionCategory,
    pub question: String,
    pub fact_ids: Vec<Uuid>,
    pub content_key: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QualitySummary {
    pub total_metrics: usize,
    pub total_claims: usize,
    pub metric_conflicts_count: usize,
    pub claim_conflicts_count: usize,
    pub open_questions_count: usize,
    pub critical_conflicts: usize,
    pub high_conflicts: usize,
}

pub struct QualityAnalysisResult {
    pub conflicts: Vec<DetectedConflict>,
    pub questions: Vec<DetectedQuestion>,
    pub summary: QualitySummary,
}

async fn load_metrics(pool: &SqlitePool, extraction_run_id: Uuid) -> anyhow::Result<Vec<MetricRow>> {
    Ok(sqlx::query_as(
        "SELECT id, entity, name, value_numeric, unit FROM metrics WHERE extraction_run_id = ?",
    )
    .bind(extraction_run_id.to_string())
    .fetch_all(pool)
    .await?)
}

async fn load_claims(pool: &SqlitePool, extraction_run_id: Uuid) -> anyhow::Result<Vec<ClaimRow>> {
    Ok(sqlx::query_as(
        "SELECT id, subject, predicate, object FROM claims WHERE extraction_run_id = ?",
    )
    .bind(extraction_run_id.to_string())
    .fetch_all(pool)
    .await?)
}

/// Group metrics sharing an (entity, name) key and flag numeric
/// disagreements between them.
fn detect_metric_conflicts(metrics: &[MetricRow]) -> Vec<DetectedConflict> {
    let mut groups: HashMap<(String, String), Vec<&MetricRow>> = HashMap::new();
    for m in metrics {
        groups.entry((m.entity.clone(), m.name.clone())).or_default().push(m);
    }

    let mut conflicts = Vec::new();
    for ((entity, name), rows) in groups {
        let values: Vec<&MetricRow> = rows.iter().filter(|r| r.value_numeric.is_some()).copied().collect();
        if values.len() < 2 {
            continue;
        }
        let nums: Vec<f64> = values.iter().map(|r| r.value_numeric.unwrap()).collect();
        let max = nums.iter().cloned().fold(f64::MIN, f64::max);
        let min = nums.iter().cloned().fold(f64::MAX, f64::min);
        if max == min {
            continue;
        }
        let denom = max.abs().max(1e-9);
        let disagreement = (max - min) / denom;
        if disagreement < 0.01 {
            continue;
        }
        let severity = if disagreement >= HIGH_SEVERITY_THRESHOLD {
            ConflictSeverity::High
        } else {
            ConflictSeverity::Medium
        };
        let fact_ids: Vec<Uuid> = values.iter().filter_map(|r| Uuid::parse_str(&r.id).ok()).collect();
        let mut id_strs: Vec<String> = fact_ids.iter().map(|id| id.to_string()).collect();
        id_strs.sort();
        let key = content_key(&["metric", &entity, &name, &id_strs.join(",")]);
        conflicts.push(DetectedConflict {
            conflict_type: "metric_disagreement".to_string(),
            severity,
            reason: format!(
                "{name} for {entity} disagrees across {} sources ({:.1}% spread)",
                values.len(),
                disagreement * 100.0
            ),
            fact_ids,
            content_key: key,
        });
    }
    conflicts
}

/// Group claims sharing a (subject, predicate) key and flag disagreeing
/// objects.
fn detect_claim_conflicts(claims: &[ClaimRow]) -> Vec<DetectedConflict> {
    let mut groups: HashMap<(String, String), Vec<&ClaimRow>> = HashMap::new();
    for c in claims {
        groups.entry((c.subject.clone(), c.predicate.clone())).or_default().push(c);
    }

    let mut conflicts = Vec::new();
    for ((subject, predicate), rows) in groups {
        let distinct_objects: std::collections::HashSet<&str> = rows.iter().map(|r| r.object.as_str()).collect();
        if distinct_objects.len() < 2 {
            continue;
        }
        let fact_ids: Vec<Uuid> = rows.iter().filter_map(|r| Uuid::parse_str(&r.id).ok()).collect();
        let mut id_strs: Vec<String> = fact_ids.iter().map(|id| id.to_string()).collect();
        id_strs.sort();
        let key = content_key(&["claim", &subject, &predicate, &id_strs.join(",")]);
        conflicts.push(DetectedConflict {
            conflict_type: "claim_disagreement".to_string(),
            severity: ConflictSeverity::Medium,
            reason: format!(
                "\"{predicate}\" asserted about {subject} with {} distinct values across sources",
                distinct_objects.len()
            ),
            fact_ids,
            content_key: key,
        });
    }
    conflicts
}

/// Open questions are raised, not guessed at: a metric with no numeric
/// value present, or an entity with exactly one source for a claim type
/// typically corroborated by more than one, becomes a question rather
/// than a silently-accepted single-source fact.
fn detect_open_questions(metrics: &[MetricRow]) -> Vec<DetectedQuestion> {
    let mut questions = Vec::new();
    for m in metrics {
        if m.value_numeric.is_none() {
            let Ok(id) = Uuid::parse_str(&m.id) else { continue };
            let key = content_key(&["missing_value", &m.entity, &m.name, &m.id]);
            questions.push(DetectedQuestion {
                category: OpenQuestionCategory::MissingData,
                question: format!("{} for {} was extracted without a parseable numeric value", m.name, m.entity),
                fact_ids: vec![id],
                content_key: key,
            });
        }
    }
    questions
}

pub async fn analyze_version(
    pool: &SqlitePool,
    tenant_id: Uuid,
    version_id: Uuid,
    extraction_run_id: Uuid,
) -> anyhow::Result<QualityAnalysisResult> {
    let metrics = load_metrics(pool, extraction_run_id).await?;
    let claims = load_claims(pool, extraction_run_id).await?;

    let metric_conflicts = detect_metric_conflicts(&metrics);
    let claim_conflicts = detect_claim_conflicts(&claims);
    let questions = detect_open_questions(&metrics);

    let critical_conflicts = 0; // no `critical` severity is produced by the deterministic detectors today
    let high_conflicts = metric_conflicts.iter().chain(&claim_conflicts).filter(|c| c.severity == ConflictSeverity::High).count();

    let now = Utc::now().to_rfc3339();
    let mut all_conflicts = metric_conflicts;
    all_conflicts.extend(claim_conflicts);

    for conflict in &all_conflicts {
        let severity_str = serde_json::to_value(conflict.severity)?.as_str().unwrap().to_string();
        let fact_ids: Vec<String> = conflict.fact_ids.iter().map(|id| id.to_string()).collect();
        sqlx::query(
            "INSERT INTO conflicts (id, version_id, tenant_id, conflict_type, severity, reason, fact_ids, content_key, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(version_id, content_key) DO UPDATE SET severity = excluded.severity, reason = excluded.reason, fact_ids = excluded.fact_ids",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(version_id.to_string())
        .bind(tenant_id.to_string())
        .bind(&conflict.conflict_type)
        .bind(&severity_str)
        .bind(&conflict.reason)
        .bind(serde_json::to_string(&fact_ids)?)
        .bind(&conflict.content_key)
        .bind(&now)
        .execute(pool)
        .await?;
    }

    for question in &questions {
        let category_str = serde_json::to_value(question.category)?.as_str().unwrap().to_string();
        let fact_ids: Vec<String> = question.fact_ids.iter().map(|id| id.to_string()).collect();
        sqlx::query(
            "INSERT INTO open_questions (id, version_id, tenant_id, category, question, fact_ids, content_key, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(version_id, content_key) DO UPDATE SET question = excluded.question, fact_ids = excluded.fact_ids",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(version_id.to_string())
        .bind(tenant_id.to_string())
        .bind(&category_str)
        .bind(&question.question)
        .bind(serde_json::to_string(&fact_ids)?)
        .bind(&question.content_key)
        .bind(&now)
        .execute(pool)
        .await?;
    }

    let summary = QualitySummary {
        total_metrics: metrics.len(),
        total_claims: claims.len(),
        metric_conflicts_count: all_conflicts.iter().filter(|c| c.conflict_type == "metric_disagreement").count(),
        claim_conflicts_count: all_conflicts.iter().filter(|c| c.conflict_type == "claim_disagreement").count(),
        open_questions_count: questions.len(),
        critical_conflicts,
        high_conflicts,
    };

    Ok(QualityAnalysisResult { conflicts: all_conflicts, questions, summary })
}

// ═══════════════════════════════════════════════════════════════════════
// Truthfulness / bias scoring
// ═══════════════════════════════════════════════════════════════════════

const HEDGING_WORDS: &[&str] = &["allegedly", "reportedly", "claims", "sources say", "may be", "could be"];
const ABSOLUTE_WORDS: &[&str] = &["always", "never", "definitely", "certainly", "100%", "guaranteed"];
const EMOTIONAL_WORDS: &[&str] = &[
    "amazing", "terrible", "shocking", "incredible", "outrageous", "disgusting", "wonderful", "horrible",
    "fantastic", "devastating",
];

#[derive(Debug, Clone, Serialize)]
pub struct TruthfulnessFlag {
    pub flag_type: String,
    pub severity: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TruthfulnessAssessment {
    pub citation_count: usize,
    pub hedging_count: usize,
    pub absolute_claim_count: usize,
    pub emotional_language_count: usize,
    pub flags: Vec<TruthfulnessFlag>,
    /// 0.0 (least trustworthy) to 1.0 (most trustworthy); `None` if the
    /// text was too short to score meaningfully.
    pub score: Option<f64>,
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}

/// Count `[1]`-style or `(2024)`-style citation markers.
fn count_citations(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut count = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j] == b']' {
                count += 1;
                i = j + 1;
                continue;
            }
        } else if bytes[i] == b'(' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j == i + 5 && j < bytes.len() && bytes[j] == b')' {
                count += 1;
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    count
}

/// Deterministic, no-vendor-call truthfulness heuristic: citation
/// density, hedging language, absolute claims and emotional language.
/// Used both as the fallback when no LLM credential is configured and
/// as the scoring applied during the quality-check pipeline stage.
pub fn score_truthfulness(text: &str) -> TruthfulnessAssessment {
    let lower = text.to_lowercase();
    let citation_count = count_citations(text);
    let hedging_count = HEDGING_WORDS.iter().filter(|w| lower.contains(*w)).count();
    let absolute_count = ABSOLUTE_WORDS.iter().map(|w| count_occurrences(&lower, w)).sum::<usize>();
    let emotional_count = EMOTIONAL_WORDS.iter().map(|w| count_occurrences(&lower, w)).sum::<usize>();

    let mut flags = Vec::new();
    if citation_count == 0 && text.chars().count() > 2000 {
        flags.push(TruthfulnessFlag {
            flag_type: "no_citations".to_string(),
            severity: "medium".to_string(),
            message: "Document lacks citations or references".to_string(),
        });
    }
    if absolute_count > 5 {
        flags.push(TruthfulnessFlag {
            flag_type: "excessive_absolute_claims".to_string(),
            severity: "low".to_string(),
            message: "Document contains many absolute claims".to_string(),
        });
    }
    if emotional_count > 10 {
        flags.push(TruthfulnessFlag {
            flag_type: "emotional_language".to_string(),
            severity: "medium".to_string(),
            message: "Document contains significant emotional language".to_string(),
        });
    }

    let score = if text.trim().is_empty() {
        None
    } else {
        let mut s = 0.75;
        s -= (absolute_count as f64 * 0.03).min(0.3);
        s -= (emotional_count as f64 * 0.02).min(0.3);
        s += (citation_count as f64 * 0.01).min(0.15);
        Some(s.clamp(0.0, 1.0))
    };

    TruthfulnessAssessment {
        citation_count,
        hedging_count,
        absolute_claim_count: absolute_count,
        emotional_language_count: emotional_count,
        flags,
        score,
    }
}

/// Bias score in `[0.0, 1.0]`, 0 being neutral. Driven by the same
/// emotional/absolute-language signal as [`score_truthfulness`] but
/// weighted to reward hedged, qualified language rather than penalize it
/// (a biased text overstates certainty; a careful one hedges).
pub fn score_bias(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let absolute_count = ABSOLUTE_WORDS.iter().map(|w| count_occurrences(&lower, w)).sum::<usize>();
    let emotional_count = EMOTIONAL_WORDS.iter().map(|w| count_occurrences(&lower, w)).sum::<usize>();
    let hedging_count = HEDGING_WORDS.iter().filter(|w| lower.contains(*w)).count();

    let raw = (absolute_count as f64 * 0.06) + (emotional_count as f64 * 0.04) - (hedging_count as f64 * 0.03);
    raw.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_conflict_flags_high_severity_on_large_spread() {
        let rows = vec![
            MetricRow { id: Uuid::new_v4().to_string(), entity: "acme".into(), name: "revenue".into(), value_numeric: Some(100.0), unit: None },
            MetricRow { id: Uuid::new_v4().to_string(), entity: "acme".into(), name: "revenue".into(), value_numeric: Some(70.0), unit: None },
        ];
        let conflicts = detect_metric_conflicts(&rows);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, ConflictSeverity::High);
    }

    #[test]
    fn metric_conflict_ignores_negligible_spread() {
        let rows = vec![
            MetricRow { id: Uuid::new_v4().to_string(), entity: "acme".into(), name: "revenue".into(), value_numeric: Some(100.0), unit: None },
            MetricRow { id: Uuid::new_v4().to_string(), entity: "acme".into(), name: "revenue".into(), value_numeric: Some(100.001), unit: None },
        ];
        assert!(detect_metric_conflicts(&rows).is_empty());
    }

    #[test]
    fn claim_conflict_detects_disagreeing_objects() {
        let rows = vec![
            ClaimRow { id: Uuid::new_v4().to_string(), subject: "acme".into(), predicate: "operates_in".into(), object: "us".into() },
            ClaimRow { id: Uuid::new_v4().to_string(), subject: "acme".into(), predicate: "operates_in".into(), object: "eu".into() },
        ];
        assert_eq!(detect_claim_conflicts(&rows).len(), 1);
    }

    #[test]
    fn content_key_is_stable_and_order_independent_of_insertion() {
        let k1 = content_key(&["metric", "acme", "revenue", "a,b"]);
        let k2 = content_key(&["metric", "acme", "revenue", "a,b"]);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);
    }

    #[test]
    fn no_citations_flag_requires_long_text() {
        let short = score_truthfulness("no citations here");
        assert!(short.flags.iter().all(|f| f.flag_type != "no_citations"));
        let long_text = "no citations here. ".repeat(150);
        let long = score_truthfulness(&long_text);
        assert!(long.flags.iter().any(|f| f.flag_type == "no_citations"));
    }

    #[test]
    fn excessive_absolute_claims_flag_fires_above_threshold() {
        let text = "always never definitely certainly 100% guaranteed always never definitely";
        let assessment = score_truthfulness(text);
        assert!(assessment.absolute_claim_count > 5);
        assert!(assessment.flags.iter().any(|f| f.flag_type == "excessive_absolute_claims"));
    }

    #[test]
    fn citation_counter_matches_bracket_and_year_forms() {
        assert_eq!(count_citations("see [1] and (2024) for details"), 2);
        assert_eq!(count_citations("no markers here"), 0);
    }

    #[test]
    fn bias_score_is_bounded() {
        let biased = "amazing terrible shocking incredible outrageous always never definitely";
        assert!(score_bias(biased) <= 1.0);
        assert!(score_bias("a perfectly calm, hedged sentence that may be true") >= 0.0);
    }
}
