//! Shared fixtures for roster-core integration tests.
//!
//! [`GatedTransport`] parks every write until the test answers it, so tests
//! decide exactly when (and in what order) writes complete.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use roster_core::{
    BulkItemResult, CoordinatorConfig, EntityId, Fields, MemoryState, MutationCoordinator,
    VersionTokenStore, WriteAck, WriteFailure, WriteRequest, WriteTransport,
};
use serde_json::json;
use tokio::sync::{Notify, oneshot};

enum Reply {
    Single(oneshot::Sender<Result<WriteAck, WriteFailure>>),
    Bulk(oneshot::Sender<Result<Vec<BulkItemResult>, WriteFailure>>),
}

/// A write the transport has received and not yet answered.
pub struct PendingCall {
    pub requests: Vec<WriteRequest>,
    reply: Reply,
}

impl PendingCall {
    pub const fn is_bulk(&self) -> bool {
        matches!(self.reply, Reply::Bulk(_))
    }

    /// First (for single writes: only) request of the call.
    pub fn request(&self) -> &WriteRequest {
        &self.requests[0]
    }

    pub fn entity(&self) -> &EntityId {
        &self.request().entity_id
    }

    /// Answer each request with `answer`.
    pub fn respond(self, answer: impl Fn(&WriteRequest) -> Result<WriteAck, WriteFailure>) {
        let Self { requests, reply } = self;
        match reply {
            Reply::Single(tx) => {
                let _ = tx.send(answer(&requests[0]));
            }
            Reply::Bulk(tx) => {
                let items = requests
                    .iter()
                    .map(|request| BulkItemResult {
                        entity_id: request.entity_id.clone(),
                        result: answer(request),
                    })
                    .collect();
                let _ = tx.send(Ok(items));
            }
        }
    }

    pub fn succeed(self, token: &str) {
        self.respond(|_| Ok(WriteAck::with_token(token)));
    }

    pub fn fail(self, failure: WriteFailure) {
        self.respond(|_| Err(failure.clone()));
    }
}

/// Transport whose writes complete only when the test answers them.
#[derive(Default)]
pub struct GatedTransport {
    bulk: bool,
    pending: Mutex<VecDeque<PendingCall>>,
    arrived: Notify,
    log: Mutex<Vec<String>>,
    in_flight: Mutex<HashSet<EntityId>>,
    overlaps: Mutex<Vec<EntityId>>,
    single_calls: Mutex<usize>,
    bulk_calls: Mutex<usize>,
}

impl GatedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_bulk() -> Arc<Self> {
        Arc::new(Self {
            bulk: true,
            ..Self::default()
        })
    }

    fn begin(&self, requests: &[WriteRequest]) {
        let mut in_flight = self.in_flight.lock().expect("lock");
        let mut log = self.log.lock().expect("lock");
        for request in requests {
            log.push(format!("start:{}", request.entity_id));
            if !in_flight.insert(request.entity_id.clone()) {
                self.overlaps
                    .lock()
                    .expect("lock")
                    .push(request.entity_id.clone());
            }
        }
    }

    fn end(&self, requests: &[WriteRequest]) {
        let mut in_flight = self.in_flight.lock().expect("lock");
        let mut log = self.log.lock().expect("lock");
        for request in requests {
            log.push(format!("end:{}", request.entity_id));
            in_flight.remove(&request.entity_id);
        }
    }

    fn park(&self, requests: Vec<WriteRequest>, reply: Reply) {
        self.pending
            .lock()
            .expect("lock")
            .push_back(PendingCall { requests, reply });
        self.arrived.notify_one();
    }

    /// Wait for the oldest unanswered call.
    pub async fn next_call(&self) -> PendingCall {
        self.wait_for(|_| true).await
    }

    /// Wait for an unanswered call touching `entity`.
    pub async fn call_for(&self, entity: &str) -> PendingCall {
        let entity = EntityId::from(entity);
        self.wait_for(|call| call.requests.iter().any(|r| r.entity_id == entity))
            .await
    }

    async fn wait_for(&self, matches: impl Fn(&PendingCall) -> bool) -> PendingCall {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let mut pending = self.pending.lock().expect("lock");
                    if let Some(pos) = pending.iter().position(&matches) {
                        return pending.remove(pos).expect("position is in range");
                    }
                }
                self.arrived.notified().await;
            }
        })
        .await
        .expect("expected write never reached the transport")
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("lock").len()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().expect("lock").clone()
    }

    pub fn overlaps(&self) -> Vec<EntityId> {
        self.overlaps.lock().expect("lock").clone()
    }

    pub fn single_calls(&self) -> usize {
        *self.single_calls.lock().expect("lock")
    }

    pub fn bulk_calls(&self) -> usize {
        *self.bulk_calls.lock().expect("lock")
    }
}

#[async_trait]
impl WriteTransport for GatedTransport {
    async fn send(&self, request: WriteRequest) -> Result<WriteAck, WriteFailure> {
        *self.single_calls.lock().expect("lock") += 1;
        let requests = vec![request];
        self.begin(&requests);
        let (tx, rx) = oneshot::channel();
        self.park(requests.clone(), Reply::Single(tx));
        let result = rx
            .await
            .unwrap_or_else(|_| Err(WriteFailure::network("test dropped the call")));
        self.end(&requests);
        result
    }

    fn supports_bulk(&self) -> bool {
        self.bulk
    }

    async fn send_bulk(
        &self,
        requests: Vec<WriteRequest>,
    ) -> Result<Vec<BulkItemResult>, WriteFailure> {
        *self.bulk_calls.lock().expect("lock") += 1;
        self.begin(&requests);
        let (tx, rx) = oneshot::channel();
        self.park(requests.clone(), Reply::Bulk(tx));
        let result = rx
            .await
            .unwrap_or_else(|_| Err(WriteFailure::network("test dropped the call")));
        self.end(&requests);
        result
    }
}

/// Let spawned tasks run until they block on the transport again.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

pub fn row(pairs: &[(&str, i64)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), json!(v)))
        .collect()
}

/// Grid state with rows `e1..=e{n}`, every weekday at 0.
pub fn grid(n: usize) -> MemoryState {
    let state = MemoryState::new();
    for i in 1..=n {
        state.insert(
            EntityId::new(format!("e{i}")),
            row(&[("mon", 0), ("tue", 0), ("wed", 0)]),
        );
    }
    state
}

/// Coordinator over `state` with a private token store.
pub fn coordinator(
    transport: &Arc<GatedTransport>,
    state: &MemoryState,
    config: CoordinatorConfig,
) -> Arc<MutationCoordinator> {
    Arc::new(
        MutationCoordinator::new(config, Arc::clone(transport) as _, Arc::new(state.clone()))
            .with_tokens(VersionTokenStore::new()),
    )
}

pub fn value(state: &MemoryState, entity: &str, field: &str) -> Option<serde_json::Value> {
    state.field(&EntityId::from(entity), field)
}
