//! The mutation facade call sites talk to.
//!
//! [`MutationCoordinator::submit`] takes the raw edits of one user gesture
//! and drives them through consolidation, optimistic application, the
//! per-entity write queue, and settlement:
//!
//! 1. consolidate into one patch per entity (optionally dropping unchanged
//!    fields) and choose single, bulk, or fan-out;
//! 2. apply every patch locally before anything is sent;
//! 3. queue one task per entity (or one bulk task behind every entity it
//!    touches);
//! 4. await all of them (the returned future), never failing fast;
//! 5. report per-entity outcomes in a [`BatchResult`].
//!
//! Committed and conflicted entities trigger cache invalidation of their
//! related keys. Invalidation is best-effort and never changes the result.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, join_all};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::applier::{AppliedPatch, OptimisticApplier};
use crate::cache::{CacheInvalidator, NoopInvalidator};
use crate::config::CoordinatorConfig;
use crate::consolidate::{EditConsolidator, WritePlan};
use crate::error::{FailureReason, WriteFailure};
use crate::local::LocalState;
use crate::model::{Edit, EntityId};
use crate::queue::EntityWriteQueue;
use crate::token::VersionTokenStore;
use crate::transport::{BulkItemResult, WriteAck, WriteTransport};

type EntityOutcome = (EntityId, Result<WriteAck, WriteFailure>);
type WriteTask = BoxFuture<'static, Vec<EntityOutcome>>;

// ---------------------------------------------------------------------------
// BatchResult
// ---------------------------------------------------------------------------

/// One entity whose write failed and was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntity {
    pub entity_id: EntityId,
    pub reason: FailureReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FailedEntity {
    #[must_use]
    pub fn new(entity_id: EntityId, failure: WriteFailure) -> Self {
        Self {
            entity_id,
            reason: failure.reason,
            message: failure.message,
        }
    }

    #[must_use]
    pub fn failure(&self) -> WriteFailure {
        WriteFailure {
            reason: self.reason,
            message: self.message.clone(),
        }
    }

    #[must_use]
    pub const fn should_notify(&self) -> bool {
        !matches!(self.reason, FailureReason::Conflict)
    }
}

/// Per-entity outcome of one [`MutationCoordinator::submit`] call.
///
/// Both lists follow consolidation order. Every consolidated entity appears
/// in exactly one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub succeeded: Vec<EntityId>,
    pub failed: Vec<FailedEntity>,
}

impl BatchResult {
    fn collect(order: &[EntityId], outcomes: impl IntoIterator<Item = EntityOutcome>) -> Self {
        let mut by_entity: HashMap<EntityId, Result<WriteAck, WriteFailure>> =
            outcomes.into_iter().collect();
        let mut result = Self::default();
        for entity_id in order {
            match by_entity.remove(entity_id) {
                Some(Ok(_)) => result.succeeded.push(entity_id.clone()),
                Some(Err(failure)) => result
                    .failed
                    .push(FailedEntity::new(entity_id.clone(), failure)),
                None => result.failed.push(FailedEntity::new(
                    entity_id.clone(),
                    WriteFailure::unknown("write settled without an outcome"),
                )),
            }
        }
        result
    }

    /// True when nothing failed (including the empty batch).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// True when the batch consolidated to nothing and no write was made.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }

    /// Failures worth surfacing to the user; conflicts are left out.
    pub fn notifiable_failures(&self) -> impl Iterator<Item = &FailedEntity> {
        self.failed.iter().filter(|failed| failed.should_notify())
    }

    /// `Some(Ok(()))` if `entity_id` committed, `Some(Err(..))` if it failed,
    /// `None` if it was not part of the batch.
    #[must_use]
    pub fn outcome_for(&self, entity_id: &EntityId) -> Option<Result<(), &FailedEntity>> {
        if self.succeeded.contains(entity_id) {
            return Some(Ok(()));
        }
        self.failed
            .iter()
            .find(|failed| &failed.entity_id == entity_id)
            .map(Err)
    }
}

// ---------------------------------------------------------------------------
// Invalidation
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Invalidation {
    config: Arc<CoordinatorConfig>,
    invalidator: Arc<dyn CacheInvalidator>,
}

impl Invalidation {
    /// Invalidate keys for committed and conflicted entities. Errors are
    /// logged and swallowed.
    fn after_settle(&self, outcomes: &[EntityOutcome]) {
        let mut keys: Vec<String> = Vec::new();
        for (entity_id, outcome) in outcomes {
            let touched = match outcome {
                Ok(_) => true,
                Err(failure) => failure.reason == FailureReason::Conflict,
            };
            if !touched {
                continue;
            }
            for key in self.config.related_keys(entity_id) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        if keys.is_empty() {
            return;
        }
        if let Err(err) = self.invalidator.invalidate(&keys) {
            tracing::warn!(error = %err, keys = ?keys, "cache invalidation failed");
        }
    }
}

// ---------------------------------------------------------------------------
// MutationCoordinator
// ---------------------------------------------------------------------------

/// Optimistic write coordinator for one UI surface.
///
/// Surfaces that edit the same entities should share the write queue and
/// token store; see [`MutationCoordinator::for_surface`].
pub struct MutationCoordinator {
    config: Arc<CoordinatorConfig>,
    consolidator: EditConsolidator,
    queue: EntityWriteQueue,
    applier: OptimisticApplier,
    tokens: VersionTokenStore,
    transport: Arc<dyn WriteTransport>,
    invalidation: Invalidation,
    // Held while applying and registering so apply order matches queue order.
    submit_gate: Arc<Mutex<()>>,
}

impl fmt::Debug for MutationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("config", &self.config)
            .field("consolidator", &self.consolidator)
            .field("queue", &self.queue)
            .field("applier", &self.applier)
            .finish_non_exhaustive()
    }
}

impl MutationCoordinator {
    /// Coordinator over `state`, using the process-wide token store and no
    /// cache invalidation.
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn WriteTransport>,
        state: Arc<dyn LocalState>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            consolidator: EditConsolidator::new(config.bulk_writes, config.skip_unchanged),
            queue: EntityWriteQueue::new(),
            applier: OptimisticApplier::new(config.collection.as_str(), state),
            tokens: VersionTokenStore::global().clone(),
            transport,
            invalidation: Invalidation {
                config: Arc::clone(&config),
                invalidator: Arc::new(NoopInvalidator),
            },
            config,
            submit_gate: Arc::default(),
        }
    }

    /// Use `tokens` instead of the process-wide store.
    #[must_use]
    pub fn with_tokens(mut self, tokens: VersionTokenStore) -> Self {
        self.tokens = tokens;
        self
    }

    /// Send "collection changed" notifications to `invalidator`.
    #[must_use]
    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidation.invalidator = invalidator;
        self
    }

    /// A coordinator for another surface over the same entities.
    ///
    /// The new coordinator writes through `state` but shares this one's
    /// queue, tokens, transport, invalidator and in-flight ledger, so writes
    /// to one entity stay serialized across both surfaces. When both surfaces
    /// sit over the same rows, a failed earlier write never overwrites a
    /// later pending edit made through the other surface.
    #[must_use]
    pub fn for_surface(&self, state: Arc<dyn LocalState>) -> Self {
        Self {
            config: Arc::clone(&self.config),
            consolidator: self.consolidator,
            queue: self.queue.clone(),
            applier: self.applier.sibling(state),
            tokens: self.tokens.clone(),
            transport: Arc::clone(&self.transport),
            invalidation: self.invalidation.clone(),
            submit_gate: Arc::clone(&self.submit_gate),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    #[must_use]
    pub const fn tokens(&self) -> &VersionTokenStore {
        &self.tokens
    }

    #[must_use]
    pub const fn queue(&self) -> &EntityWriteQueue {
        &self.queue
    }

    #[must_use]
    pub const fn applier(&self) -> &OptimisticApplier {
        &self.applier
    }

    /// Forget every version token (identity change or logout).
    pub fn reset_session(&self) {
        let dropped = self.tokens.len();
        self.tokens.clear(None);
        tracing::info!(dropped, "write session reset");
    }

    /// Apply `edits` optimistically and return a future that writes them.
    ///
    /// Consolidation, local application, and queue registration happen
    /// before this returns: the edits are visible immediately and the call
    /// order of `submit` is the per-entity write order. The future resolves
    /// once every entity's write has settled. Partial success is normal:
    /// committed entities keep their new values, failed ones are rolled back
    /// before the result is returned.
    ///
    /// # Cancellation
    ///
    /// Drive the returned future to completion. Dropping it before a write
    /// is sent rolls that patch back and releases its queue slot, so later
    /// writes for the entity proceed. Dropping it while a write is on the
    /// wire also rolls back locally, but the server may still apply the
    /// write; the local row and the stored token then lag the server until
    /// the next conflict triggers a refetch. Spawn the future when the caller
    /// may go away mid-write.
    pub fn submit(&self, edits: &[Edit]) -> impl Future<Output = BatchResult> + Send + use<> {
        let span = tracing::info_span!(
            "submit",
            collection = %self.config.collection,
            edits = edits.len()
        );
        let started = span.in_scope(|| self.start(edits));

        async move {
            let Some((order, tasks)) = started else {
                return BatchResult::default();
            };

            let outcomes = join_all(tasks).instrument(span.clone()).await;
            let result = BatchResult::collect(&order, outcomes.into_iter().flatten());

            span.in_scope(|| {
                if result.is_success() {
                    tracing::info!(succeeded = result.succeeded.len(), "batch settled");
                } else {
                    tracing::warn!(
                        succeeded = result.succeeded.len(),
                        failed = result.failed.len(),
                        "batch settled with failures"
                    );
                }
            });
            result
        }
    }

    /// Synchronous half of `submit`: plan, apply, register.
    fn start(&self, edits: &[Edit]) -> Option<(Vec<EntityId>, Vec<WriteTask>)> {
        let _gate = self
            .submit_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let patches = self.consolidator.consolidate(edits, self.applier.state());
        let plan = self
            .consolidator
            .plan(patches, self.transport.supports_bulk());
        if matches!(plan, WritePlan::Empty) {
            return None;
        }

        let order: Vec<EntityId> = plan
            .patches()
            .iter()
            .map(|patch| patch.entity_id.clone())
            .collect();
        let bulk = matches!(plan, WritePlan::Bulk(_));
        let applied: Vec<AppliedPatch> = plan
            .into_patches()
            .into_iter()
            .map(|patch| self.applier.apply(patch))
            .collect();

        let tasks = if bulk {
            vec![self.bulk_task(applied)]
        } else {
            applied
                .into_iter()
                .map(|patch| self.single_task(patch))
                .collect()
        };
        Some((order, tasks))
    }

    fn single_task(&self, applied: AppliedPatch) -> WriteTask {
        let transport = Arc::clone(&self.transport);
        let tokens = self.tokens.clone();
        let invalidation = self.invalidation.clone();
        let entity_id = applied.entity_id().clone();

        self.queue
            .enqueue(entity_id.clone(), move || async move {
                tracing::debug!(entity = %entity_id, "sending write");
                let result = transport.send(applied.request(&tokens)).await;
                let outcomes = vec![(entity_id, applied.settle(result, &tokens))];
                invalidation.after_settle(&outcomes);
                outcomes
            })
            .boxed()
    }

    fn bulk_task(&self, applied: Vec<AppliedPatch>) -> WriteTask {
        let transport = Arc::clone(&self.transport);
        let tokens = self.tokens.clone();
        let invalidation = self.invalidation.clone();
        let entity_ids = applied
            .iter()
            .map(|patch| patch.entity_id().clone())
            .collect();

        self.queue
            .enqueue_many(entity_ids, move || async move {
                tracing::debug!(entities = applied.len(), "sending bulk write");
                let requests = applied.iter().map(|patch| patch.request(&tokens)).collect();
                let response = transport.send_bulk(requests).await;
                let outcomes = settle_bulk(applied, response, &tokens);
                invalidation.after_settle(&outcomes);
                outcomes
            })
            .boxed()
    }
}

/// Settle every patch of a bulk write with its item result.
///
/// A whole-request failure fails every entity with the same reason. An
/// entity the response omits fails as unknown.
fn settle_bulk(
    applied: Vec<AppliedPatch>,
    response: Result<Vec<BulkItemResult>, WriteFailure>,
    tokens: &VersionTokenStore,
) -> Vec<EntityOutcome> {
    match response {
        Ok(items) => {
            let mut by_entity: HashMap<EntityId, Result<WriteAck, WriteFailure>> = items
                .into_iter()
                .map(|item| (item.entity_id, item.result))
                .collect();
            applied
                .into_iter()
                .map(|patch| {
                    let entity_id = patch.entity_id().clone();
                    let result = by_entity.remove(&entity_id).unwrap_or_else(|| {
                        tracing::warn!(entity = %entity_id, "bulk response omitted entity");
                        Err(WriteFailure::missing_from_bulk(&entity_id))
                    });
                    (entity_id, patch.settle(result, tokens))
                })
                .collect()
        }
        Err(failure) => {
            tracing::warn!(
                entities = applied.len(),
                reason = %failure.reason,
                "bulk write failed as a whole"
            );
            applied
                .into_iter()
                .map(|patch| {
                    let entity_id = patch.entity_id().clone();
                    (entity_id, patch.settle(Err(failure.clone()), tokens))
                })
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
