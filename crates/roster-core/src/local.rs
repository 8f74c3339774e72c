//! Local (UI-visible) entity state accessors.
//!
//! The coordinator never touches rendering state directly. Each UI surface
//! (hours grid, inline field editor, list row) implements [`LocalState`] over
//! whatever structure it keeps, and the coordinator reads and writes through
//! it. Both operations must be synchronous: an optimistic edit has to be
//! visible before the write is sent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::model::{EntityId, Fields};

/// Synchronous read/write access to one surface's entity state.
pub trait LocalState: Send + Sync {
    /// Current field values for `entity_id` (empty when unknown).
    fn read(&self, entity_id: &EntityId) -> Fields;

    /// Merge `fields` over the entity's current values.
    fn apply(&self, entity_id: &EntityId, fields: &Fields);

    /// Identity of the rows behind this handle.
    ///
    /// Two handles that read and write the same rows must return the same
    /// value. The default is the handle's own address.
    fn store_id(&self) -> usize {
        std::ptr::from_ref(self).cast::<()>().addr()
    }
}

impl<T: LocalState + ?Sized> LocalState for Arc<T> {
    fn read(&self, entity_id: &EntityId) -> Fields {
        (**self).read(entity_id)
    }

    fn apply(&self, entity_id: &EntityId, fields: &Fields) {
        (**self).apply(entity_id, fields);
    }

    fn store_id(&self) -> usize {
        (**self).store_id()
    }
}

/// In-memory normalized table of entity rows.
///
/// Clones share the same table, so a test (or a sibling view) can observe
/// exactly what the coordinator applied.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    rows: Arc<Mutex<BTreeMap<EntityId, Fields>>>,
}

impl MemoryState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the row for `entity_id` wholesale (e.g. after a fetch).
    pub fn insert(&self, entity_id: EntityId, fields: Fields) {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_id, fields);
    }

    /// Value of one field, if present.
    #[must_use]
    pub fn field(&self, entity_id: &EntityId, field: &str) -> Option<serde_json::Value> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .and_then(|row| row.get(field).cloned())
    }

    /// Copy of every row.
    #[must_use]
    pub fn rows(&self) -> BTreeMap<EntityId, Fields> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LocalState for MemoryState {
    fn read(&self, entity_id: &EntityId) -> Fields {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
            .unwrap_or_default()
    }

    fn apply(&self, entity_id: &EntityId, fields: &Fields) {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let row = rows.entry(entity_id.clone()).or_default();
        for (field, value) in fields {
            row.insert(field.clone(), value.clone());
        }
    }

    fn store_id(&self) -> usize {
        Arc::as_ptr(&self.rows).cast::<()>().addr()
    }
}
