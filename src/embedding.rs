//! Embedder contract and the span-embedding service (spec.md §4.4).
//!
//! [`Embedder`] is the provider seam; [`OpenAiEmbedder`] is the only
//! concrete implementation today. The contract itself — equal-length
//! output, empty-string zero vectors, whitespace collapsing, batching,
//! jittered backoff — lives in the free functions below so it applies
//! uniformly no matter which provider is plugged in.
//!
//! Vector storage utilities ([`vec_to_blob`], [`blob_to_vec`],
//! [`cosine_similarity`]) are shared with [`crate::search`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::EmbeddingConfig;
use crate::models::{Locator, SpanType};

/// Character cap applied to non-empty inputs before they're sent to the
/// vendor, approximating its token limit (spec.md §4.4).
pub const MAX_INPUT_CHARS: usize = 8000;

const BACKOFF_BASE_SECS: f64 = 1.0;
const BACKOFF_MAX_SECS: f64 = 60.0;
const BACKOFF_MAX_ATTEMPTS: u32 = 5;

/// A provider of text embeddings. `embed_raw` performs exactly one vendor
/// call over `texts` with no normalization or batching — both are applied
/// uniformly by [`embed_texts`] so every provider gets the same contract.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    /// Cumulative input tokens billed so far, if the provider reports usage.
    fn total_tokens(&self) -> u64 {
        0
    }
}

/// Build the configured embedder, or `None` when embeddings are disabled
/// (spec.md §4.4, [`EmbeddingConfig::is_enabled`]).
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Option<Box<dyn Embedder>>> {
    if !config.is_enabled() {
        return Ok(None);
    }
    match config.provider.as_str() {
        "openai" => Ok(Some(Box::new(OpenAiEmbedder::new(config)?))),
        other => bail!("unknown embedding provider: {other}"),
    }
}

/// Collapse runs of whitespace to a single space and truncate to
/// [`MAX_INPUT_CHARS`] characters (spec.md §4.4). Empty and whitespace-only
/// strings collapse to `""`, which the caller maps to a zero vector.
pub fn normalize_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > MAX_INPUT_CHARS {
        collapsed.chars().take(MAX_INPUT_CHARS).collect()
    } else {
        collapsed
    }
}

/// Embed `texts`, applying the full spec.md §4.4 contract: whitespace
/// normalization, empty-string zero vectors at the correct dimension,
/// batching at `config.batch_size`, and index-preserving reassembly.
pub async fn embed_texts(
    embedder: &dyn Embedder,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let normalized: Vec<String> = texts.iter().map(|t| normalize_text(t)).collect();
    let dims = embedder.dims();
    let mut results: Vec<Vec<f32>> = vec![vec![0.0; dims]; normalized.len()];

    // Indices of non-empty inputs, in original order, chunked to batch_size.
    let non_empty: Vec<usize> = normalized
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.is_empty())
        .map(|(i, _)| i)
        .collect();

    let batch_size = config.batch_size.max(1);
    for chunk in non_empty.chunks(batch_size) {
        let batch_texts: Vec<String> = chunk.iter().map(|&i| normalized[i].clone()).collect();
        let vectors = embed_with_retry(embedder, config, &batch_texts).await?;
        if vectors.len() != batch_texts.len() {
            bail!(
                "embedder returned {} vectors for {} inputs",
                vectors.len(),
                batch_texts.len()
            );
        }
        for (&original_index, vector) in chunk.iter().zip(vectors.into_iter()) {
            results[original_index] = vector;
        }
    }

    Ok(results)
}

/// Embed a single query string (a convenience wrapper over [`embed_texts`]).
pub async fn embed_query(
    embedder: &dyn Embedder,
    config: &EmbeddingConfig,
    text: &str,
) -> Result<Vec<f32>> {
    let mut results = embed_texts(embedder, config, &[text.to_string()]).await?;
    results.pop().context("embedder returned no vectors")
}

/// One batch call with bounded exponential backoff and jitter
/// (spec.md §4.4): `delay = clamp(BASE · 2^attempt · (1 + U[0, 0.25]), 0, MAX)`.
/// A vendor-reported `retry-after` overrides the computed delay for that
/// attempt. Connection/timeout errors use the same policy; the provider
/// is expected to return a `RetryAfter` error only for genuinely
/// retryable failures — anything else propagates immediately.
async fn embed_with_retry(
    embedder: &dyn Embedder,
    config: &EmbeddingConfig,
    batch: &[String],
) -> Result<Vec<Vec<f32>>> {
    let max_attempts = config.max_retries.min(BACKOFF_MAX_ATTEMPTS).max(1);
    let mut last_err = None;

    for attempt in 0..max_attempts {
        match embedder.embed_raw(batch).await {
            Ok(vectors) => return Ok(vectors),
            Err(err) => {
                let retry_after = err.chain().find_map(|cause| cause.downcast_ref::<RetryAfter>()).map(|r| r.0);
                last_err = Some(err);
                if attempt + 1 >= max_attempts {
                    break;
                }
                let delay = retry_after.unwrap_or_else(|| backoff_delay(attempt));
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding failed with no recorded error")))
}

/// `RetryAfter` lets a provider's [`Embedder::embed_raw`] signal a
/// vendor-mandated delay that overrides the computed backoff for that
/// attempt (spec.md §4.4).
#[derive(Debug, thiserror::Error)]
#[error("rate limited, retry after {0:?}")]
pub struct RetryAfter(pub Duration);

fn backoff_delay(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    let secs = (BACKOFF_BASE_SECS * 2f64.powi(attempt as i32) * (1.0 + jitter)).clamp(0.0, BACKOFF_MAX_SECS);
    Duration::from_secs_f64(secs)
}

/// OpenAI-compatible embeddings endpoint (spec.md §4.4, §9: "OpenAI is the
/// only embedding vendor wired up today; the trait exists so a second
/// vendor is additive, not a rewrite").
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    tokens_used: AtomicU64,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .clone()
            .context("embedding.openai_api_key (or OPENAI_API_KEY) is required for the openai provider")?;
        let model = config
            .openai_embedding_model
            .clone()
            .context("embedding.openai_embedding_model is required for the openai provider")?;
        let dims = config
            .openai_embedding_dimensions
            .context("embedding.openai_embedding_dimensions is required for the openai provider")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            dims,
            tokens_used: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn total_tokens(&self) -> u64 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    async fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Err(RetryAfter(backoff_delay(0))).context(format!("openai embeddings request failed: {e}"));
            }
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return match retry_after {
                Some(d) => Err(RetryAfter(d)).context(format!("openai embeddings {status}: {body}")),
                None => bail!("openai embeddings {status}: {body}"),
            };
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("openai embeddings {status}: {body}");
        }

        let payload: serde_json::Value = response.json().await?;
        if let Some(usage) = payload.get("usage").and_then(|u| u.get("total_tokens")).and_then(|t| t.as_u64()) {
            self.tokens_used.fetch_add(usage, Ordering::Relaxed);
        }
        parse_openai_response(&payload)
    }
}

fn parse_openai_response(payload: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = payload
        .get("data")
        .and_then(|d| d.as_array())
        .context("openai embeddings response missing data[]")?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for item in data {
        let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(indexed.len() as u64) as usize;
        let vector: Vec<f32> = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .context("openai embeddings item missing embedding[]")?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Encode a float vector as little-endian bytes for storage in
/// `embedding_chunks.vector`.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched-length
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[derive(sqlx::FromRow)]
struct SpanRow {
    id: String,
    text_content: String,
    locator: String,
}

struct EmbeddableSpan {
    id: Uuid,
    text_content: String,
    locator: String,
}

/// Embed every embeddable span of `version_id` that doesn't already have
/// an `embedding_chunks` row, unless `force_reembed` is set (spec.md §4.4:
/// "existing embeddings are detected by `(span_id)` and not regenerated
/// unless the caller requests re-embed"). Returns the number of chunks
/// written.
pub async fn embed_pending_spans_for_version(
    pool: &SqlitePool,
    config: &EmbeddingConfig,
    embedder: &dyn Embedder,
    tenant_id: Uuid,
    version_id: Uuid,
    force_reembed: bool,
) -> Result<usize> {
    let embeddable_types = [
        SpanType::Text,
        SpanType::Heading,
        SpanType::Citation,
        SpanType::Footnote,
    ]
    .iter()
    .map(|t| serde_json::to_value(t).unwrap().as_str().unwrap().to_string())
    .collect::<Vec<_>>();

    let placeholders = embeddable_types.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let query = if force_reembed {
        format!(
            "SELECT id, text_content, locator FROM spans \
             WHERE version_id = ? AND tenant_id = ? AND span_type IN ({placeholders}) \
             ORDER BY created_at ASC"
        )
    } else {
        format!(
            "SELECT s.id, s.text_content, s.locator FROM spans s \
             LEFT JOIN embedding_chunks e ON e.span_id = s.id \
             WHERE s.version_id = ? AND s.tenant_id = ? AND s.span_type IN ({placeholders}) AND e.id IS NULL \
             ORDER BY s.created_at ASC"
        )
    };

    let mut q = sqlx::query_as::<_, SpanRow>(&query)
        .bind(version_id.to_string())
        .bind(tenant_id.to_string());
    for t in &embeddable_types {
        q = q.bind(t);
    }
    let rows = q.fetch_all(pool).await?;

    let spans: Vec<EmbeddableSpan> = rows
        .into_iter()
        .filter_map(|row| {
            Uuid::parse_str(&row.id)
                .ok()
                .map(|id| EmbeddableSpan { id, text_content: row.text_content, locator: row.locator })
        })
        .collect();

    if spans.is_empty() {
        return Ok(0);
    }

    let texts: Vec<String> = spans.iter().map(|s| s.text_content.clone()).collect();
    let vectors = embed_texts(embedder, config, &texts).await?;

    let now = chrono::Utc::now().to_rfc3339();
    let mut written = 0usize;
    for (chunk_index, (span, vector)) in spans.iter().zip(vectors.into_iter()).enumerate() {
        let (offset_start, offset_end) = text_offsets(&span.locator, span.text_content.len());
        let blob = vec_to_blob(&vector);

        sqlx::query(
            "INSERT INTO embedding_chunks \
             (id, version_id, tenant_id, span_id, chunk_index, text, vector, dims, offset_start, offset_end, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '{}', ?) \
             ON CONFLICT(span_id) DO UPDATE SET text = excluded.text, vector = excluded.vector, \
             dims = excluded.dims, chunk_index = excluded.chunk_index",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(version_id.to_string())
        .bind(tenant_id.to_string())
        .bind(span.id.to_string())
        .bind(chunk_index as i64)
        .bind(&span.text_content)
        .bind(blob)
        .bind(embedder.dims() as i64)
        .bind(offset_start)
        .bind(offset_end)
        .bind(&now)
        .execute(pool)
        .await?;
        written += 1;
    }

    Ok(written)
}

fn text_offsets(locator_json: &str, text_len: usize) -> (i64, i64) {
    match serde_json::from_str::<Locator>(locator_json) {
        Ok(Locator::Text { offset_start, offset_end, .. }) => (offset_start, offset_end),
        _ => (0, text_len as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubEmbedder {
        dims: usize,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        fn model_name(&self) -> &str {
            "stub"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.lock().unwrap().push(texts.to_vec());
            Ok(texts.iter().map(|t| vec![t.len() as f32; self.dims]).collect())
        }
    }

    fn test_config() -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "openai".to_string(),
            openai_embedding_model: Some("text-embedding-3-small".to_string()),
            openai_embedding_dimensions: Some(4),
            openai_api_key: None,
            batch_size: 2,
            max_retries: 5,
            timeout_secs: 30,
        }
    }

    #[tokio::test]
    async fn empty_strings_map_to_zero_vector_at_correct_dims() {
        let embedder = StubEmbedder { dims: 4, calls: Mutex::new(vec![]) };
        let config = test_config();
        let texts = vec!["hello".to_string(), "".to_string(), "world".to_string()];
        let result = embed_texts(&embedder, &config, &texts).await.unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[1], vec![0.0; 4]);
        assert_ne!(result[0], vec![0.0; 4]);
    }

    #[tokio::test]
    async fn output_length_matches_input_length() {
        let embedder = StubEmbedder { dims: 3, calls: Mutex::new(vec![]) };
        let config = test_config();
        let texts: Vec<String> = (0..7).map(|i| format!("text {i}")).collect();
        let result = embed_texts(&embedder, &config, &texts).await.unwrap();
        assert_eq!(result.len(), texts.len());
    }

    #[tokio::test]
    async fn batches_respect_configured_batch_size() {
        let embedder = StubEmbedder { dims: 2, calls: Mutex::new(vec![]) };
        let mut config = test_config();
        config.batch_size = 2;
        let texts: Vec<String> = (0..5).map(|i| format!("t{i}")).collect();
        embed_texts(&embedder, &config, &texts).await.unwrap();
        let calls = embedder.calls.lock().unwrap();
        assert_eq!(calls.len(), 3); // 2 + 2 + 1
        assert!(calls.iter().all(|b| b.len() <= 2));
    }

    #[test]
    fn normalize_collapses_whitespace_and_truncates() {
        assert_eq!(normalize_text("  hello   world  "), "hello world");
        let long = "a".repeat(MAX_INPUT_CHARS + 500);
        assert_eq!(normalize_text(&long).chars().count(), MAX_INPUT_CHARS);
    }

    #[test]
    fn vec_blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn cosine_similarity_identical_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn backoff_delay_stays_within_bounds() {
        for attempt in 0..6 {
            let d = backoff_delay(attempt);
            assert!(d.as_secs_f64() <= BACKOFF_MAX_SECS);
        }
    }
}
