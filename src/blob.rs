//! Blob store interface: content I/O under opaque keys.
//!
//! Keys follow `documents/{document_id}/v{version}/{sanitized_filename}`
//! (spec.md §4.1). Implementations must guarantee that `put` is atomic from
//! the reader's perspective; the local backend achieves this with a
//! write-to-temp-then-rename, the S3 backend gets it for free from S3's
//! PUT semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::{S3StorageConfig, StorageBackend, StorageConfig};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob store request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone)]
pub struct BlobHead {
    pub size: u64,
    pub content_type: String,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Narrow abstraction over local filesystem or S3-compatible object store
/// (spec.md §4.2: "the storage backend behind a narrow blob interface").
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, BlobError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    async fn delete(&self, key: &str) -> Result<bool, BlobError>;

    async fn exists(&self, key: &str) -> Result<bool, BlobError>;

    async fn head(&self, key: &str) -> Result<BlobHead, BlobError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError>;

    /// A short-lived URL a client can use to download the object directly.
    /// The local backend has no notion of a signed URL and returns a
    /// `file://` reference instead; only the S3 backend issues a real
    /// presigned GET.
    async fn sign_download_url(&self, key: &str, ttl_seconds: u64) -> Result<String, BlobError>;
}

/// Build the standard storage key for a document version's blob
/// (spec.md §4.1).
pub fn storage_key(document_id: &uuid::Uuid, version_number: i64, sanitized_filename: &str) -> String {
    format!("documents/{document_id}/v{version_number}/{sanitized_filename}")
}

pub fn build_blob_store(config: &StorageConfig) -> Result<Box<dyn BlobStore>, BlobError> {
    match config.backend {
        StorageBackend::Local => Ok(Box::new(LocalBlobStore::new(&config.file_storage_root))),
        StorageBackend::S3 => {
            let s3_config = config
                .s3
                .clone()
                .ok_or_else(|| BlobError::Request("storage.s3 missing".into()))?;
            Ok(Box::new(S3BlobStore::new(s3_config)))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Local filesystem backend
// ═══════════════════════════════════════════════════════════════════════

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String, BlobError> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write to a sibling temp file and rename so a concurrent reader
        // never observes a partially-written blob.
        let tmp_path = path.with_extension(format!(
            "tmp-{}",
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.resolve(key);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobError::NotFound(key.to_string())
            } else {
                BlobError::Io(e)
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.resolve(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        Ok(tokio::fs::metadata(self.resolve(key)).await.is_ok())
    }

    async fn head(&self, key: &str) -> Result<BlobHead, BlobError> {
        let path = self.resolve(key);
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobError::NotFound(key.to_string())
            } else {
                BlobError::Io(e)
            }
        })?;
        let last_modified = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(BlobHead {
            size: metadata.len(),
            content_type: "application/octet-stream".to_string(),
            etag: None,
            last_modified,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let base = self.resolve(prefix);
        let mut keys = Vec::new();
        let walker = walkdir::WalkDir::new(&base).into_iter().filter_map(|e| e.ok());
        for entry in walker {
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    keys.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn sign_download_url(&self, key: &str, _ttl_seconds: u64) -> Result<String, BlobError> {
        Ok(format!("file://{}", self.resolve(key).display()))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// S3-compatible backend
// ═══════════════════════════════════════════════════════════════════════

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
}

pub struct S3BlobStore {
    config: S3StorageConfig,
    client: reqwest::Client,
}

impl S3BlobStore {
    pub fn new(config: S3StorageConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn credentials(&self) -> Result<AwsCredentials, BlobError> {
        let access_key_id = self
            .config
            .access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
            .ok_or_else(|| BlobError::Request("missing AWS access key id".into()))?;
        let secret_access_key = self
            .config
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
            .ok_or_else(|| BlobError::Request("missing AWS secret access key".into()))?;
        Ok(AwsCredentials {
            access_key_id,
            secret_access_key,
        })
    }

    fn host(&self) -> String {
        if let Some(ref endpoint) = self.config.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!(
                "{}.s3.{}.amazonaws.com",
                self.config.bucket, self.config.region
            )
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.config.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.config.prefix.trim_end_matches('/'), key)
        }
    }

    /// Build a signed request for the given verb/key/body, returning the
    /// URL and headers to attach. Shared by `put`/`get`/`delete`/`head` so
    /// the four-step key-derivation chain is written once.
    fn sign(
        &self,
        creds: &AwsCredentials,
        method: &str,
        key: &str,
        body: &[u8],
    ) -> (String, Vec<(String, String)>) {
        let host = self.host();
        let encoded_key = self
            .full_key(key)
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");
        let url = format!("https://{host}/{encoded_key}");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(body);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let canonical_uri = format!("/{encoded_key}");
        let canonical_request = format!(
            "{method}\n{canonical_uri}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&creds.secret_access_key, &date_stamp, &self.config.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            creds.access_key_id
        );

        (
            url,
            vec![
                ("Authorization".to_string(), authorization),
                ("x-amz-content-sha256".to_string(), payload_hash),
                ("x-amz-date".to_string(), amz_date),
            ],
        )
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, BlobError> {
        let creds = self.credentials()?;
        let (url, headers) = self.sign(&creds, "PUT", key, bytes);
        let mut req = self
            .client
            .put(&url)
            .header("content-type", content_type)
            .body(bytes.to_vec());
        for (name, value) in headers {
            req = req.header(name, value);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| BlobError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BlobError::Request(format!(
                "S3 PutObject failed: HTTP {}",
                resp.status()
            )));
        }
        Ok(format!("s3://{}/{}", self.config.bucket, self.full_key(key)))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let creds = self.credentials()?;
        let (url, headers) = self.sign(&creds, "GET", key, b"");
        let mut req = self.client.get(&url);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| BlobError::Request(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BlobError::NotFound(key.to_string()));
        }
        if !resp.status().is_success() {
            return Err(BlobError::Request(format!(
                "S3 GetObject failed: HTTP {}",
                resp.status()
            )));
        }
        Ok(resp
            .bytes()
            .await
            .map_err(|e| BlobError::Request(e.to_string()))?
            .to_vec())
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let creds = self.credentials()?;
        let (url, headers) = self.sign(&creds, "DELETE", key, b"");
        let mut req = self.client.delete(&url);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| BlobError::Request(e.to_string()))?;
        Ok(resp.status().is_success() || resp.status() == reqwest::StatusCode::NO_CONTENT)
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(BlobError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn head(&self, key: &str) -> Result<BlobHead, BlobError> {
        let creds = self.credentials()?;
        let (url, headers) = self.sign(&creds, "HEAD", key, b"");
        let mut req = self.client.head(&url);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| BlobError::Request(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BlobError::NotFound(key.to_string()));
        }
        if !resp.status().is_success() {
            return Err(BlobError::Request(format!(
                "S3 HeadObject failed: HTTP {}",
                resp.status()
            )));
        }
        let size = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let etag = resp
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string());
        Ok(BlobHead {
            size,
            content_type,
            etag,
            last_modified: None,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        // A full ListObjectsV2 implementation would need a paginated scan;
        // omitted here because the evidence pipeline only
        // ever looks up blobs by the exact key it wrote, never by prefix
        // scan, so this degrades to an explicit "not supported" rather than
        // a half-built pagination loop nothing calls.
        let _ = prefix;
        Err(BlobError::Request(
            "S3BlobStore::list is not supported; look up blobs by exact key".into(),
        ))
    }

    async fn sign_download_url(&self, key: &str, ttl_seconds: u64) -> Result<String, BlobError> {
        let creds = self.credentials()?;
        let host = self.host();
        let encoded_key = self
            .full_key(key)
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.config.region);

        let mut query_params = vec![
            ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{credential_scope}", creds.access_key_id),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), ttl_seconds.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        query_params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = query_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n/{encoded_key}\n{canonical_querystring}\nhost:{host}\n\nhost\nUNSIGNED-PAYLOAD"
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&creds.secret_access_key, &date_stamp, &self.config.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        Ok(format!(
            "https://{host}/{encoded_key}?{canonical_querystring}&X-Amz-Signature={signature}"
        ))
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// `kDate -> kRegion -> kService -> kSigning` per the AWS SigV4 spec.
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn uri_encode(s: &str) -> String {
    let mut out = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let key = "documents/doc-1/v1/report.pdf";
        store.put(key, b"hello world", "application/pdf").await.unwrap();
        let bytes = store.get(key).await.unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[tokio::test]
    async fn local_delete_reports_existed() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let key = "documents/doc-1/v1/a.txt";
        store.put(key, b"x", "text/plain").await.unwrap();
        assert!(store.delete(key).await.unwrap());
        assert!(!store.delete(key).await.unwrap());
    }

    #[tokio::test]
    async fn local_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let err = store.get("documents/missing/v1/a.txt").await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[test]
    fn storage_key_matches_spec_layout() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            storage_key(&id, 3, "report.pdf"),
            format!("documents/{id}/v3/report.pdf")
        );
    }

    #[test]
    fn signing_key_derivation_is_deterministic() {
        let key1 = derive_signing_key("secret", "20250101", "us-east-1", "s3");
        let key2 = derive_signing_key("secret", "20250101", "us-east-1", "s3");
        assert_eq!(key1, key2);
        let key3 = derive_signing_key("other", "20250101", "us-east-1", "s3");
        assert_ne!(key1, key3);
    }
}
