//! Per-entity write serialization.
//!
//! [`EntityWriteQueue`] keeps, for every entity with outstanding work, the
//! completion signal of the most recently registered entry (the chain
//! "tail"). A new entry swaps itself in as the tail and waits for the
//! previous one to settle before running its task.
//!
//! # Guarantees
//!
//! - Entries for the same entity run strictly in the order [`enqueue`] was
//!   *called*, one at a time. Registration is synchronous, so the order is
//!   fixed before the returned future is ever polled.
//! - A predecessor that fails, panics, or is dropped before running still
//!   releases its successor. Business errors are the task's own output and
//!   never travel along the chain.
//! - Entries for different entities are independent.
//! - Finished chains are removed from the table once their last entry
//!   settles.
//!
//! [`enqueue`]: EntityWriteQueue::enqueue

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::model::EntityId;

#[derive(Debug)]
struct Tail {
    ticket: u64,
    settled: oneshot::Receiver<()>,
}

#[derive(Debug, Default)]
struct Chains {
    next_ticket: u64,
    tails: HashMap<EntityId, Tail>,
}

type SharedChains = Arc<Mutex<Chains>>;

/// Serializes asynchronous tasks per entity id.
///
/// Cloning the queue shares the chain table.
#[derive(Debug, Clone, Default)]
pub struct EntityWriteQueue {
    chains: SharedChains,
}

/// One registered entry. Dropping it settles the entry: successors are
/// released and the chain is collected if this entry is still its tail.
#[derive(Debug)]
struct Slot {
    chains: SharedChains,
    ticket: u64,
    entity_ids: Vec<EntityId>,
    _signals: Vec<oneshot::Sender<()>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        for id in &self.entity_ids {
            if chains
                .tails
                .get(id)
                .is_some_and(|tail| tail.ticket == self.ticket)
            {
                chains.tails.remove(id);
            }
        }
    }
}

impl EntityWriteQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` behind every earlier entry for `entity_id`.
    ///
    /// The returned future resolves to the task's own output; the queue
    /// adds no error of its own.
    pub fn enqueue<F, Fut, T>(
        &self,
        entity_id: EntityId,
        task: F,
    ) -> impl Future<Output = T> + use<F, Fut, T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.enqueue_many(vec![entity_id], task)
    }

    /// Queue one task behind the chains of several entities at once.
    ///
    /// Used for multi-entity bulk writes: the task starts only after every
    /// listed entity's previous entry has settled, and later entries for any
    /// of those entities wait for it.
    pub fn enqueue_many<F, Fut, T>(
        &self,
        entity_ids: Vec<EntityId>,
        task: F,
    ) -> impl Future<Output = T> + use<F, Fut, T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (slot, predecessors) = self.register(entity_ids);

        async move {
            for predecessor in predecessors {
                // Err means the predecessor was dropped, which also settles it.
                predecessor.await.ok();
            }
            let output = task().await;
            drop(slot);
            output
        }
    }

    /// True when no entry for `entity_id` is queued or running.
    #[must_use]
    pub fn is_idle(&self, entity_id: &EntityId) -> bool {
        !self
            .chains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tails
            .contains_key(entity_id)
    }

    /// Number of entities with a live chain.
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.chains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tails
            .len()
    }

    fn register(&self, mut entity_ids: Vec<EntityId>) -> (Slot, Vec<oneshot::Receiver<()>>) {
        entity_ids.sort();
        entity_ids.dedup();

        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = chains.next_ticket;
        chains.next_ticket = chains.next_ticket.wrapping_add(1);

        let mut predecessors = Vec::new();
        let mut signals = Vec::with_capacity(entity_ids.len());
        for id in &entity_ids {
            let (signal, settled) = oneshot::channel();
            if let Some(previous) = chains.tails.insert(id.clone(), Tail { ticket, settled }) {
                predecessors.push(previous.settled);
            }
            signals.push(signal);
        }
        drop(chains);

        tracing::trace!(
            ticket,
            entities = entity_ids.len(),
            waiting_on = predecessors.len(),
            "write queue entry registered"
        );

        let slot = Slot {
            chains: Arc::clone(&self.chains),
            ticket,
            entity_ids,
            _signals: signals,
        };
        (slot, predecessors)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn id(s: &str) -> EntityId {
        EntityId::from(s)
    }

    fn push(log: &Log, entry: &str) {
        log.lock().expect("log lock").push(entry.to_string());
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().expect("log lock").clone()
    }

    #[tokio::test]
    async fn same_entity_runs_in_submission_order_without_overlap() {
        let queue = EntityWriteQueue::new();
        let log: Log = Arc::default();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let first = queue.enqueue(id("e1"), {
            let log = Arc::clone(&log);
            move || async move {
                push(&log, "start-1");
                gate_rx.await.ok();
                push(&log, "end-1");
                1
            }
        });
        let second = queue.enqueue(id("e1"), {
            let log = Arc::clone(&log);
            move || async move {
                push(&log, "start-2");
                tokio::task::yield_now().await;
                push(&log, "end-2");
                2
            }
        });
        let third = queue.enqueue(id("e1"), {
            let log = Arc::clone(&log);
            move || async move {
                push(&log, "start-3");
                push(&log, "end-3");
                3
            }
        });
        let release = async {
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            gate_tx.send(()).ok();
        };

        let (a, b, c, ()) = tokio::join!(first, second, third, release);

        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(
            entries(&log),
            ["start-1", "end-1", "start-2", "end-2", "start-3", "end-3"]
        );
    }

    #[tokio::test]
    async fn order_is_fixed_at_enqueue_not_at_poll() {
        let queue = EntityWriteQueue::new();
        let log: Log = Arc::default();

        let first = queue.enqueue(id("e1"), {
            let log = Arc::clone(&log);
            move || async move { push(&log, "first") }
        });
        let second = queue.enqueue(id("e1"), {
            let log = Arc::clone(&log);
            move || async move { push(&log, "second") }
        });

        // Poll the later entry first.
        tokio::join!(second, first);

        assert_eq!(entries(&log), ["first", "second"]);
    }

    #[tokio::test]
    async fn failed_task_does_not_block_successor() {
        let queue = EntityWriteQueue::new();

        let failing = queue.enqueue(id("e1"), || async { Err::<u32, &str>("boom") });
        let next = queue.enqueue(id("e1"), || async { Ok::<u32, &str>(7) });

        let (a, b) = tokio::join!(failing, next);
        assert_eq!(a, Err("boom"));
        assert_eq!(b, Ok(7));
    }

    #[tokio::test]
    async fn dropped_entry_releases_successor() {
        let queue = EntityWriteQueue::new();

        let abandoned = queue.enqueue(id("e1"), || async { 1 });
        let next = queue.enqueue(id("e1"), || async { 2 });
        drop(abandoned);

        let out = tokio::time::timeout(Duration::from_secs(5), next)
            .await
            .expect("successor must not wait on a dropped entry");
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn different_entities_run_concurrently() {
        let queue = EntityWriteQueue::new();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        // e1 can only finish once e2 has run, so serializing them would hang.
        let blocked = queue.enqueue(id("e1"), move || async move {
            gate_rx.await.expect("gate released");
            "e1"
        });
        let opener = queue.enqueue(id("e2"), move || async move {
            gate_tx.send(()).ok();
            "e2"
        });

        let both = async { tokio::join!(blocked, opener) };
        let (a, b) = tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("entities must not serialize against each other");
        assert_eq!((a, b), ("e1", "e2"));
    }

    #[tokio::test]
    async fn finished_chains_are_collected() {
        let queue = EntityWriteQueue::new();

        let first = queue.enqueue(id("e1"), || async {});
        let second = queue.enqueue(id("e1"), || async {});
        let other = queue.enqueue(id("e2"), || async {});

        assert!(!queue.is_idle(&id("e1")));
        assert_eq!(queue.active_len(), 2);

        first.await;
        assert!(!queue.is_idle(&id("e1")), "second entry is still the tail");

        second.await;
        other.await;
        assert!(queue.is_idle(&id("e1")));
        assert_eq!(queue.active_len(), 0);
    }

    #[tokio::test]
    async fn enqueue_many_waits_for_every_listed_entity() {
        let queue = EntityWriteQueue::new();
        let log: Log = Arc::default();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let e1 = queue.enqueue(id("e1"), {
            let log = Arc::clone(&log);
            move || async move {
                gate_rx.await.ok();
                push(&log, "e1");
            }
        });
        let bulk = queue.enqueue_many(vec![id("e1"), id("e2")], {
            let log = Arc::clone(&log);
            move || async move { push(&log, "bulk") }
        });
        let e2_after = queue.enqueue(id("e2"), {
            let log = Arc::clone(&log);
            move || async move { push(&log, "e2-after") }
        });
        let release = async {
            tokio::task::yield_now().await;
            gate_tx.send(()).ok();
        };

        tokio::join!(e2_after, bulk, e1, release);

        assert_eq!(entries(&log), ["e1", "bulk", "e2-after"]);
        assert_eq!(queue.active_len(), 0);
    }

    #[tokio::test]
    async fn queue_works_across_spawned_tasks() {
        let queue = EntityWriteQueue::new();
        let log: Log = Arc::default();

        let mut handles = Vec::new();
        for n in 0..8 {
            let fut = queue.enqueue(id("shared"), {
                let log = Arc::clone(&log);
                move || async move {
                    push(&log, &format!("start-{n}"));
                    tokio::task::yield_now().await;
                    push(&log, &format!("end-{n}"));
                }
            });
            handles.push(tokio::spawn(fut));
        }
        for handle in handles {
            handle.await.expect("task join");
        }

        let expected: Vec<String> = (0..8)
            .flat_map(|n| [format!("start-{n}"), format!("end-{n}")])
            .collect();
        assert_eq!(entries(&log), expected);
    }
}
