//! Idempotency-result cache for mutating operations.
//!
//! Entries live under `idempotency:{op}:{key}` and pair the cached
//! response with a fingerprint of the request payload. A replay with the
//! same fingerprint returns the response verbatim without re-executing;
//! the same key with a different payload is a client error, not a replay.

use crate::kv::KeyValueStore;
use crate::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize)]
struct StoredResult {
    fingerprint: String,
    response: Value,
}

/// Fingerprint a request payload for replay detection.
pub fn fingerprint(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// TTL-bound cache of action responses keyed by client idempotency keys.
pub struct IdempotencyCache {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Look up a prior response for `(op, key)`. Returns the cached
    /// response when the fingerprint matches, `None` when the key is
    /// unseen, and `KeyReuse` when the key was used with another payload.
    pub async fn check(
        &self,
        op: &str,
        key: &str,
        fingerprint: &str,
    ) -> CacheResult<Option<Value>> {
        let stored = self.kv.get(&cache_key(op, key)).await?;
        let Some(raw) = stored else {
            return Ok(None);
        };
        let stored: StoredResult =
            serde_json::from_str(&raw).map_err(|e| CacheError::Serialization(e.to_string()))?;
        if stored.fingerprint != fingerprint {
            return Err(CacheError::KeyReuse(format!(
                "idempotency key `{key}` was already used for a different {op} payload"
            )));
        }
        Ok(Some(stored.response))
    }

    /// Record the response for `(op, key)`.
    pub async fn record(
        &self,
        op: &str,
        key: &str,
        fingerprint: &str,
        response: &Value,
    ) -> CacheResult<()> {
        let stored = StoredResult {
            fingerprint: fingerprint.to_string(),
            response: response.clone(),
        };
        let raw =
            serde_json::to_string(&stored).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.kv.put(&cache_key(op, key), raw, self.ttl).await
    }
}

fn cache_key(op: &str, key: &str) -> String {
    format!("idempotency:{op}:{key}")
}
