//! Key/value seam over an external TTL-capable service.
//!
//! The trait is the boundary a Redis-class backend plugs into; the
//! in-memory implementation mirrors its atomic set-with-TTL semantics for
//! tests and single-process deployments.

use crate::{CacheError, CacheResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Counter state returned by an atomic increment.
#[derive(Debug, Clone, Copy)]
pub struct Counter {
    /// Value after the increment; 1 when the window just opened.
    pub count: u64,
    /// Time until the counter's window expires.
    pub expires_in: Duration,
}

/// Storage interface with TTL-bound entries and an atomic counter.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;
    async fn put(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()>;
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Atomically increment a counter, creating it with the given TTL when
    /// absent or expired.
    async fn incr(&self, key: &str, ttl: Duration) -> CacheResult<Counter>;
}

struct Entry {
    value: String,
    count: u64,
    expires_at: Instant,
}

/// In-memory key/value store with per-entry expiry.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_err() -> CacheError {
    CacheError::Backend("kv lock poisoned".to_string())
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut guard = self.entries.lock().map_err(|_| lock_err())?;
        let now = Instant::now();
        match guard.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                guard.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        let mut guard = self.entries.lock().map_err(|_| lock_err())?;
        guard.insert(
            key.to_string(),
            Entry {
                value,
                count: 0,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut guard = self.entries.lock().map_err(|_| lock_err())?;
        guard.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> CacheResult<Counter> {
        let mut guard = self.entries.lock().map_err(|_| lock_err())?;
        let now = Instant::now();
        let entry = guard.entry(key.to_string()).or_insert_with(|| Entry {
            value: String::new(),
            count: 0,
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            // Window rolled over: restart the counter with a fresh TTL.
            entry.count = 0;
            entry.expires_at = now + ttl;
        }
        entry.count += 1;
        Ok(Counter {
            count: entry.count,
            expires_in: entry.expires_at.saturating_duration_since(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let kv = MemoryKv::new();
        kv.put("k", "v".to_string(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_resets_when_window_rolls_over() {
        let kv = MemoryKv::new();
        let window = Duration::from_secs(60);

        assert_eq!(kv.incr("c", window).await.unwrap().count, 1);
        assert_eq!(kv.incr("c", window).await.unwrap().count, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        let counter = kv.incr("c", window).await.unwrap();
        assert_eq!(counter.count, 1);
        assert!(counter.expires_in <= window);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let kv = MemoryKv::new();
        kv.put("k", "v".to_string(), Duration::from_secs(10))
            .await
            .unwrap();
        kv.delete("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
