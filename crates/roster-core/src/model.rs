//! Value types that flow through the coordinator.
//!
//! An [`Edit`] is one field-level user intent. Edits are folded into one
//! [`Patch`] per entity, and every applied patch owns a [`Snapshot`] of the
//! values it replaced so a failed write can be undone exactly.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Field values keyed by field name (or grid sub-key such as a week label).
pub type Fields = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of one addressable business record (e.g. an assignment row).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Key under which a conditional-write token is tracked: `collection/entity`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build the key for one entity of a collection.
    #[must_use]
    pub fn for_entity(collection: &str, entity_id: &EntityId) -> Self {
        Self(format!("{collection}/{entity_id}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque conditional-write precondition (ETag equivalent).
///
/// The client never interprets a token; it only remembers the latest one seen
/// for a resource and echoes it back on the next write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Edit / Patch / Snapshot
// ---------------------------------------------------------------------------

/// One field-level user intent, e.g. "set `mon` of assignment 42 to 5".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    pub entity_id: EntityId,
    pub field: String,
    pub value: serde_json::Value,
}

impl Edit {
    pub fn new(
        entity_id: impl Into<EntityId>,
        field: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            field: field.into(),
            value: value.into(),
        }
    }
}

/// The consolidated write payload for one entity within one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub entity_id: EntityId,
    pub fields: Fields,
}

impl Patch {
    #[must_use]
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            fields: Fields::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Pre-patch values of exactly the fields a patch touches.
///
/// A field that was absent from local state is captured as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_id: EntityId,
    pub previous_fields: Fields,
}

impl Snapshot {
    /// Capture the current values of `patch`'s fields from `current`.
    #[must_use]
    pub fn capture(patch: &Patch, current: &Fields) -> Self {
        let previous_fields = patch
            .fields
            .keys()
            .map(|field| {
                let prior = current
                    .get(field)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                (field.clone(), prior)
            })
            .collect();

        Self {
            entity_id: patch.entity_id.clone(),
            previous_fields,
        }
    }
}

// ---------------------------------------------------------------------------
// Patch lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of one patch: `Pending -> Applied -> Committed | RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchState {
    Pending,
    Applied,
    Committed,
    RolledBack,
}

impl PatchState {
    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Applied)
                | (Self::Applied, Self::Committed | Self::RolledBack)
        )
    }
}

impl fmt::Display for PatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
