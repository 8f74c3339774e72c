//! Query cache and the invalidation hook the coordinator calls after writes.
//!
//! [`QueryCache`] holds server collections keyed by query key. Invalidation
//! marks matching entries stale and bumps a generation counter that
//! subscribers watch to trigger a background refetch.
//!
//! # Key matching
//!
//! Invalidating `assignments` also covers `assignments/42` and
//! `assignments?week=2024-W07`: a key matches when it equals the
//! invalidated key or extends it with a `/` or `?` segment.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

/// Errors returned by cache invalidation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The cache was torn down (logout, view unmounted).
    #[error("query cache is closed")]
    Closed,

    /// The backing store could not process the request.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Receives "these collections changed" notifications.
///
/// Invalidation is best-effort: the coordinator logs an `Err` and moves on.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, keys: &[String]) -> Result<(), CacheError>;
}

/// Invalidator that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInvalidator;

impl CacheInvalidator for NoopInvalidator {
    fn invalidate(&self, _keys: &[String]) -> Result<(), CacheError> {
        Ok(())
    }
}

/// A cached query result.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: serde_json::Value,
    /// Set once the entry has been invalidated and awaits refetch.
    pub stale: bool,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CachedValue>,
    closed: bool,
}

/// Reactive in-memory query cache.
#[derive(Debug)]
pub struct QueryCache {
    inner: Mutex<CacheInner>,
    generation: watch::Sender<u64>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    #[must_use]
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Mutex::new(CacheInner::default()),
            generation,
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<CachedValue> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(key)
            .cloned()
    }

    /// Store a fresh value for `key`.
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .insert(
                key.into(),
                CachedValue {
                    value,
                    stale: false,
                },
            );
    }

    /// Keys currently marked stale, sorted.
    #[must_use]
    pub fn stale_keys(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.stale)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of invalidation rounds so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Watch the invalidation generation; a change means "refetch".
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Tear the cache down; later invalidations fail with [`CacheError::Closed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.closed = true;
        inner.entries.clear();
    }
}

impl CacheInvalidator for QueryCache {
    fn invalidate(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Err(CacheError::Closed);
        }

        let mut marked = 0_usize;
        for (cached_key, entry) in &mut inner.entries {
            if keys.iter().any(|key| key_matches(cached_key, key)) {
                entry.stale = true;
                marked += 1;
            }
        }
        drop(inner);

        self.generation.send_modify(|generation| *generation += 1);
        tracing::debug!(keys = ?keys, marked, "query cache invalidated");
        Ok(())
    }
}

fn key_matches(cached: &str, invalidated: &str) -> bool {
    cached.strip_prefix(invalidated).is_some_and(|rest| {
        rest.is_empty() || rest.starts_with('/') || rest.starts_with('?')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_is_fresh() {
        let cache = QueryCache::new();
        cache.set("assignments", json!([1, 2]));
        let entry = cache.get("assignments").expect("entry");
        assert_eq!(entry.value, json!([1, 2]));
        assert!(!entry.stale);
    }

    #[test]
    fn invalidate_marks_collection_and_children_stale() {
        let cache = QueryCache::new();
        cache.set("assignments", json!([]));
        cache.set("assignments/42", json!({}));
        cache.set("assignments?week=2024-W07", json!([]));
        cache.set("assignments-archive", json!([]));
        cache.set("people", json!([]));

        cache
            .invalidate(&["assignments".to_string()])
            .expect("invalidate");

        assert_eq!(
            cache.stale_keys(),
            ["assignments", "assignments/42", "assignments?week=2024-W07"]
        );
        assert_eq!(cache.generation(), 1);
    }

    #[test]
    fn set_after_invalidate_refreshes_entry() {
        let cache = QueryCache::new();
        cache.set("people", json!([]));
        cache.invalidate(&["people".to_string()]).expect("invalidate");
        cache.set("people", json!(["ada"]));
        assert!(!cache.get("people").expect("entry").stale);
    }

    #[test]
    fn closed_cache_rejects_invalidation() {
        let cache = QueryCache::new();
        cache.close();
        assert_eq!(
            cache.invalidate(&["people".to_string()]),
            Err(CacheError::Closed)
        );
    }

    #[tokio::test]
    async fn subscribers_observe_generation_bumps() {
        let cache = QueryCache::new();
        let mut rx = cache.subscribe();

        cache.invalidate(&["projects".to_string()]).expect("invalidate");

        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn noop_invalidator_accepts_everything() {
        assert!(NoopInvalidator.invalidate(&["x".to_string()]).is_ok());
    }
}
