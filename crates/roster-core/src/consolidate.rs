//! Edit consolidation and transport-shape selection.
//!
//! A grid interaction (drag-fill, paste, typing across several cells then
//! committing) produces many [`Edit`]s that usually target a handful of
//! entities. [`consolidate`] folds them into one [`Patch`] per entity, and
//! [`EditConsolidator::plan`] picks the cheapest request shape for the
//! resulting set.
//!
//! # Rules
//!
//! - Patches come out in first-encounter order of their entity.
//! - Within an entity, a later edit of the same field replaces the earlier
//!   value (last value wins inside one submission).
//! - A value identical to the current one is still written unless the
//!   unchanged-field filter is switched on.

use std::collections::HashMap;

use crate::local::LocalState;
use crate::model::{Edit, EntityId, Patch};

/// Request shape for one consolidated batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WritePlan {
    /// Nothing to write; no network call is made.
    Empty,
    /// Exactly one entity: a single-entity write.
    Single(Patch),
    /// Several entities and a bulk endpoint: one request carrying every patch.
    Bulk(Vec<Patch>),
    /// Several entities without a bulk endpoint: one request per patch, each
    /// settled independently of its siblings.
    FanOut(Vec<Patch>),
}

impl WritePlan {
    /// All patches in the plan, in consolidation order.
    #[must_use]
    pub fn patches(&self) -> &[Patch] {
        match self {
            Self::Empty => &[],
            Self::Single(patch) => std::slice::from_ref(patch),
            Self::Bulk(patches) | Self::FanOut(patches) => patches,
        }
    }

    /// Consume the plan, yielding its patches.
    #[must_use]
    pub fn into_patches(self) -> Vec<Patch> {
        match self {
            Self::Empty => Vec::new(),
            Self::Single(patch) => vec![patch],
            Self::Bulk(patches) | Self::FanOut(patches) => patches,
        }
    }

    /// Short label for logs.
    #[must_use]
    pub const fn shape(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Single(_) => "single",
            Self::Bulk(_) => "bulk",
            Self::FanOut(_) => "fan_out",
        }
    }
}

/// Fold `edits` into one patch per entity.
#[must_use]
pub fn consolidate(edits: &[Edit]) -> Vec<Patch> {
    let mut index: HashMap<&EntityId, usize> = HashMap::new();
    let mut patches: Vec<Patch> = Vec::new();

    for edit in edits {
        let slot = *index.entry(&edit.entity_id).or_insert_with(|| {
            patches.push(Patch::new(edit.entity_id.clone()));
            patches.len() - 1
        });
        patches[slot]
            .fields
            .insert(edit.field.clone(), edit.value.clone());
    }

    patches
}

/// Consolidation policy for one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditConsolidator {
    /// Use the bulk endpoint for multi-entity batches when the transport has one.
    pub bulk_writes: bool,
    /// Drop fields whose value already equals the local value.
    pub skip_unchanged: bool,
}

impl Default for EditConsolidator {
    fn default() -> Self {
        Self::new(true, false)
    }
}

impl EditConsolidator {
    #[must_use]
    pub const fn new(bulk_writes: bool, skip_unchanged: bool) -> Self {
        Self {
            bulk_writes,
            skip_unchanged,
        }
    }

    /// Consolidate `edits`, applying the unchanged-field filter when enabled.
    #[must_use]
    pub fn consolidate(&self, edits: &[Edit], state: &dyn LocalState) -> Vec<Patch> {
        let patches = consolidate(edits);
        if self.skip_unchanged {
            drop_unchanged(patches, state)
        } else {
            patches
        }
    }

    /// Choose the request shape for `patches`.
    #[must_use]
    pub fn plan(&self, mut patches: Vec<Patch>, bulk_available: bool) -> WritePlan {
        let plan = match patches.len() {
            0 => WritePlan::Empty,
            1 => patches.pop().map_or(WritePlan::Empty, WritePlan::Single),
            _ if self.bulk_writes && bulk_available => WritePlan::Bulk(patches),
            _ => WritePlan::FanOut(patches),
        };
        tracing::debug!(
            shape = plan.shape(),
            entities = plan.patches().len(),
            "write plan chosen"
        );
        plan
    }
}

/// Remove fields equal to their current local value; drop emptied patches.
#[must_use]
pub fn drop_unchanged(patches: Vec<Patch>, state: &dyn LocalState) -> Vec<Patch> {
    patches
        .into_iter()
        .filter_map(|mut patch| {
            let current = state.read(&patch.entity_id);
            patch
                .fields
                .retain(|field, value| current.get(field) != Some(&*value));
            (!patch.is_empty()).then_some(patch)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
