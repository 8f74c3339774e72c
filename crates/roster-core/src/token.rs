//! Process-wide store of conditional-write tokens.
//!
//! Every call site that writes a resource must see the token left by the
//! last successful write to that resource, whichever call site made it. The
//! store is therefore a single shared map rather than per-component state,
//! with an explicit [`VersionTokenStore::clear`] tied to session teardown.
//!
//! Tokens are opaque and live only in memory.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::model::{ResourceKey, VersionToken};

/// Shared handle to a resource-key → version-token map.
///
/// Cloning the handle shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct VersionTokenStore {
    tokens: Arc<RwLock<HashMap<ResourceKey, VersionToken>>>,
}

impl VersionTokenStore {
    /// Create an empty, independent store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide store shared by every coordinator that does not
    /// bring its own.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<VersionTokenStore> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Latest known token for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<VersionToken> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Record `token` as the latest for `key` (last write wins).
    pub fn set(&self, key: ResourceKey, token: VersionToken) {
        tracing::trace!(%key, %token, "version token updated");
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, token);
    }

    /// Forget the token for one key, or every token when `key` is `None`.
    pub fn clear(&self, key: Option<&ResourceKey>) {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        match key {
            Some(key) => {
                tokens.remove(key);
            }
            None => {
                tracing::debug!(count = tokens.len(), "clearing all version tokens");
                tokens.clear();
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
