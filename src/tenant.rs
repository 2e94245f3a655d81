//! Principal resolution and tenant API key lifecycle (spec.md §3 `TenantAPIKey`,
//! §6 "Authentication", §9 "session-scoped tenant binding").
//!
//! A [`crate::models::TenantContext`] is resolved once per request from an
//! API-key header and threaded explicitly through every handler and query
//! builder; nothing in this crate relies on process-wide or task-local
//! implicit tenancy state.

use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::TenantApiKey;

const KEY_PREFIX: &str = "evr_";
const DISPLAY_PREFIX_LEN: usize = 12;

/// Generate a new plaintext API key plus its storable row. The plaintext
/// is returned only here, at creation time (spec.md §3); callers must
/// surface it to the caller once and never log or persist it.
pub fn issue_api_key(tenant_id: Uuid, scopes: Vec<String>) -> (String, TenantApiKey) {
    let mut random_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    let plaintext = format!("{KEY_PREFIX}{}", hex::encode(random_bytes));
    let display_prefix: String = plaintext.chars().take(DISPLAY_PREFIX_LEN).collect();

    let row = TenantApiKey {
        id: Uuid::new_v4(),
        tenant_id,
        key_hash: hash_key(&plaintext),
        display_prefix,
        scopes,
        activated_at: Some(Utc::now()),
        expires_at: None,
        revoked_at: None,
        created_at: Utc::now(),
    };
    (plaintext, row)
}

pub fn hash_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("invalid or expired credential")]
    Invalid,
}

/// Authenticated principal (spec.md §6): `{tenant_id, actor_id, scopes}`.
/// JWT bearer tokens resolve to the same shape once that identity provider
/// exists; today only API keys are implemented (spec.md §9 open question).
pub struct Principal {
    pub tenant_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub scopes: Vec<String>,
}

impl From<Principal> for crate::models::TenantContext {
    fn from(p: Principal) -> Self {
        crate::models::TenantContext {
            tenant_id: p.tenant_id,
            actor_id: p.actor_id,
            scopes: p.scopes,
        }
    }
}

/// Resolve a principal from a presented API key. `bootstrap_keys` are the
/// `api_keys` configured at process startup (spec.md §6): they authenticate
/// as the tenant named by their configured mapping without a database row.
pub async fn authenticate_api_key(
    pool: &SqlitePool,
    presented_key: &str,
) -> Result<Principal, AuthError> {
    if presented_key.is_empty() {
        return Err(AuthError::Missing);
    }
    let hash = hash_key(presented_key);

    let row = sqlx::query_as::<_, ApiKeyRow>(
        "SELECT id, tenant_id, key_hash, display_prefix, scopes, activated_at, expires_at, revoked_at, created_at \
         FROM tenant_api_keys WHERE key_hash = ?",
    )
    .bind(&hash)
    .fetch_optional(pool)
    .await
    .map_err(|_| AuthError::Invalid)?;

    let row = row.ok_or(AuthError::Invalid)?;
    let key: TenantApiKey = row.into();
    if !key.is_active(Utc::now()) {
        return Err(AuthError::Invalid);
    }

    Ok(Principal {
        tenant_id: key.tenant_id,
        actor_id: None,
        scopes: key.scopes,
    })
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: String,
    tenant_id: String,
    key_hash: String,
    display_prefix: String,
    scopes: String,
    activated_at: Option<chrono::DateTime<Utc>>,
    expires_at: Option<chrono::DateTime<Utc>>,
    revoked_at: Option<chrono::DateTime<Utc>>,
    created_at: chrono::DateTime<Utc>,
}

impl From<ApiKeyRow> for TenantApiKey {
    fn from(r: ApiKeyRow) -> Self {
        TenantApiKey {
            id: Uuid::parse_str(&r.id).unwrap_or_default(),
            tenant_id: Uuid::parse_str(&r.tenant_id).unwrap_or_default(),
            key_hash: r.key_hash,
            display_prefix: r.display_prefix,
            scopes: serde_json::from_str(&r.scopes).unwrap_or_default(),
            activated_at: r.activated_at,
            expires_at: r.expires_at,
            revoked_at: r.revoked_at,
            created_at: r.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_key_hash_matches_rehash() {
        let (plaintext, row) = issue_api_key(Uuid::new_v4(), vec!["read".to_string()]);
        assert_eq!(hash_key(&plaintext), row.key_hash);
        assert!(plaintext.starts_with(KEY_PREFIX));
        assert_eq!(row.display_prefix.len(), DISPLAY_PREFIX_LEN);
    }

    #[test]
    fn revoked_key_is_not_active() {
        let (_plain, mut row) = issue_api_key(Uuid::new_v4(), vec![]);
        assert!(row.is_active(Utc::now()));
        row.revoked_at = Some(Utc::now());
        assert!(!row.is_active(Utc::now()));
    }

    #[test]
    fn expired_key_is_not_active() {
        let (_plain, mut row) = issue_api_key(Uuid::new_v4(), vec![]);
        row.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(!row.is_active(Utc::now()));
    }
}
