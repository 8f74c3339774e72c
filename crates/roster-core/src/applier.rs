//! Optimistic application with patch-scoped rollback.
//!
//! [`OptimisticApplier::apply`] is the synchronous half: it snapshots the
//! fields a patch touches, writes the patch into local state, and records the
//! snapshot in a per-entity in-flight ledger. The returned [`AppliedPatch`]
//! is later settled with the write's outcome:
//!
//! - **commit**: store the fresh version token, reconcile server-computed
//!   fields, discard the snapshot;
//! - **revert**: restore exactly the snapshot's fields.
//!
//! # Overlapping patches on one entity
//!
//! Several patches for the same entity can be applied while the first is
//! still in flight (the write queue sends them one at a time, in apply
//! order). When an earlier patch settles, any field that a later in-flight
//! patch also touched belongs to the later intent:
//!
//! - it is not restored (on revert) or overwritten by server values (on
//!   commit);
//! - instead the value the earlier patch would have written back becomes the
//!   later patch's snapshot value, so the later patch's own rollback lands on
//!   the right base.
//!
//! Fields no later patch touched are restored or reconciled immediately.
//! An [`AppliedPatch`] dropped without being settled rolls back.
//!
//! Appliers made with [`OptimisticApplier::sibling`] share one ledger, so
//! the rule above holds across surfaces. Hand-down only happens between
//! patches applied to the same store (see [`LocalState::store_id`]); a
//! surface with its own rows is restored independently.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::WriteFailure;
use crate::local::LocalState;
use crate::model::{EntityId, Fields, Patch, PatchState, ResourceKey, Snapshot};
use crate::token::VersionTokenStore;
use crate::transport::{WriteAck, WriteRequest, WriteTransport};

#[derive(Debug)]
struct InFlight {
    ticket: u64,
    store: usize,
    previous: Fields,
}

#[derive(Debug, Default)]
struct Ledger {
    next_ticket: u64,
    entities: HashMap<EntityId, Vec<InFlight>>,
}

/// Applies patches to one surface's local state and owns their snapshots.
///
/// Cloning shares the in-flight ledger and the local state; [`sibling`]
/// shares only the ledger.
///
/// [`sibling`]: OptimisticApplier::sibling
#[derive(Clone)]
pub struct OptimisticApplier {
    collection: Arc<str>,
    state: Arc<dyn LocalState>,
    ledger: Arc<Mutex<Ledger>>,
}

impl fmt::Debug for OptimisticApplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticApplier")
            .field("collection", &self.collection)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl OptimisticApplier {
    /// `collection` prefixes resource keys (`collection/entity`).
    pub fn new(collection: impl Into<Arc<str>>, state: Arc<dyn LocalState>) -> Self {
        Self {
            collection: collection.into(),
            state,
            ledger: Arc::default(),
        }
    }

    /// An applier over `state` that shares this one's in-flight ledger.
    #[must_use]
    pub fn sibling(&self, state: Arc<dyn LocalState>) -> Self {
        Self {
            collection: Arc::clone(&self.collection),
            state,
            ledger: Arc::clone(&self.ledger),
        }
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The local state this applier writes through.
    #[must_use]
    pub fn state(&self) -> &dyn LocalState {
        self.state.as_ref()
    }

    #[must_use]
    pub fn resource_key(&self, entity_id: &EntityId) -> ResourceKey {
        ResourceKey::for_entity(&self.collection, entity_id)
    }

    /// Snapshot `patch`'s fields and apply it locally.
    ///
    /// Synchronous: the edit is visible to readers of the local state when
    /// this returns.
    pub fn apply(&self, patch: Patch) -> AppliedPatch {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = ledger.next_ticket;
        ledger.next_ticket = ledger.next_ticket.wrapping_add(1);

        let current = self.state.read(&patch.entity_id);
        let snapshot = Snapshot::capture(&patch, &current);
        self.state.apply(&patch.entity_id, &patch.fields);

        ledger
            .entities
            .entry(patch.entity_id.clone())
            .or_default()
            .push(InFlight {
                ticket,
                store: self.state.store_id(),
                previous: snapshot.previous_fields,
            });
        drop(ledger);

        tracing::debug!(
            entity = %patch.entity_id,
            fields = patch.fields.len(),
            ticket,
            "patch applied optimistically"
        );

        AppliedPatch {
            ticket,
            resource_key: self.resource_key(&patch.entity_id),
            patch,
            state: PatchState::Applied,
            owner: self.clone(),
        }
    }

    /// The live snapshot held for `applied`, if it is still in flight.
    #[must_use]
    pub fn snapshot(&self, applied: &AppliedPatch) -> Option<Snapshot> {
        let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger
            .entities
            .get(applied.entity_id())?
            .iter()
            .find(|entry| entry.ticket == applied.ticket)
            .map(|entry| Snapshot {
                entity_id: applied.entity_id().clone(),
                previous_fields: entry.previous.clone(),
            })
    }

    /// Number of applied-but-unsettled patches for `entity_id`, across every
    /// applier sharing this ledger.
    #[must_use]
    pub fn in_flight(&self, entity_id: &EntityId) -> usize {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entities
            .get(entity_id)
            .map_or(0, Vec::len)
    }

    /// Apply `patch`, send it, and settle it with the outcome.
    ///
    /// The caller is responsible for routing this through the entity's write
    /// queue; the applier does not serialize on its own.
    pub async fn apply_and_send(
        &self,
        patch: Patch,
        transport: &dyn WriteTransport,
        tokens: &VersionTokenStore,
    ) -> Result<WriteAck, WriteFailure> {
        let applied = self.apply(patch);
        let result = transport.send(applied.request(tokens)).await;
        applied.settle(result, tokens)
    }

    fn finish(&self, applied: &AppliedPatch, finish: &Finish<'_>) {
        let entity_id = applied.entity_id();
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = ledger.entities.get_mut(entity_id) else {
            return;
        };
        let Some(pos) = entries.iter().position(|e| e.ticket == applied.ticket) else {
            return;
        };
        let entry = entries.remove(pos);
        let store = entry.store;
        let later = &mut entries[pos..];

        let candidates: Fields = match finish {
            Finish::Commit { server_fields } => server_fields.cloned().unwrap_or_default(),
            Finish::Revert => entry.previous,
        };

        let mut local = Fields::new();
        for (field, value) in candidates {
            match later
                .iter_mut()
                .find(|e| e.store == store && e.previous.contains_key(&field))
            {
                Some(successor) => {
                    successor.previous.insert(field, value);
                }
                None => {
                    local.insert(field, value);
                }
            }
        }

        if entries.is_empty() {
            ledger.entities.remove(entity_id);
        }
        if !local.is_empty() {
            self.state.apply(entity_id, &local);
        }
    }
}

enum Finish<'a> {
    Commit { server_fields: Option<&'a Fields> },
    Revert,
}

/// A patch that has been applied locally and awaits its write outcome.
#[derive(Debug)]
pub struct AppliedPatch {
    ticket: u64,
    patch: Patch,
    resource_key: ResourceKey,
    state: PatchState,
    owner: OptimisticApplier,
}

impl AppliedPatch {
    #[must_use]
    pub fn entity_id(&self) -> &EntityId {
        &self.patch.entity_id
    }

    #[must_use]
    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    #[must_use]
    pub fn resource_key(&self) -> &ResourceKey {
        &self.resource_key
    }

    #[must_use]
    pub fn state(&self) -> PatchState {
        self.state
    }

    /// Build the write request, attaching the latest known token.
    ///
    /// Call this when the write is about to go out, not at apply time, so a
    /// patch queued behind another write to the same entity carries the token
    /// that write returned.
    #[must_use]
    pub fn request(&self, tokens: &VersionTokenStore) -> WriteRequest {
        WriteRequest {
            resource_key: self.resource_key.clone(),
            entity_id: self.patch.entity_id.clone(),
            fields: self.patch.fields.clone(),
            if_match: tokens.get(&self.resource_key),
        }
    }

    /// Commit on success, revert on failure; the outcome passes through.
    pub fn settle(
        self,
        result: Result<WriteAck, WriteFailure>,
        tokens: &VersionTokenStore,
    ) -> Result<WriteAck, WriteFailure> {
        match result {
            Ok(ack) => {
                self.commit(&ack, tokens);
                Ok(ack)
            }
            Err(failure) => {
                tracing::warn!(
                    entity = %self.patch.entity_id,
                    reason = %failure.reason,
                    "write failed; rolling back patch"
                );
                self.revert();
                Err(failure)
            }
        }
    }

    /// Record the fresh token, reconcile server fields, drop the snapshot.
    pub fn commit(mut self, ack: &WriteAck, tokens: &VersionTokenStore) -> PatchState {
        if let Some(token) = &ack.token {
            tokens.set(self.resource_key.clone(), token.clone());
        }
        self.owner.finish(
            &self,
            &Finish::Commit {
                server_fields: ack.server_fields.as_ref(),
            },
        );
        self.transition(PatchState::Committed)
    }

    /// Restore exactly the fields this patch touched.
    pub fn revert(mut self) -> PatchState {
        self.owner.finish(&self, &Finish::Revert);
        self.transition(PatchState::RolledBack)
    }

    fn transition(&mut self, next: PatchState) -> PatchState {
        debug_assert!(self.state.can_transition_to(next));
        self.state = next;
        tracing::debug!(entity = %self.patch.entity_id, state = %next, "patch settled");
        next
    }
}

impl Drop for AppliedPatch {
    fn drop(&mut self) {
        if self.state == PatchState::Applied {
            tracing::warn!(
                entity = %self.patch.entity_id,
                "applied patch dropped before its write settled; rolling back"
            );
            self.owner.clone().finish(self, &Finish::Revert);
            self.state = PatchState::RolledBack;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
