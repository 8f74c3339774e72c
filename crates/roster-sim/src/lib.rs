//! roster-sim library.
//!
//! Deterministic simulation of a grid surface writing through a
//! [`MutationCoordinator`] to a fault-injecting [`SimulatedServer`]. Each
//! round submits a random gesture's worth of edits without waiting for
//! earlier rounds, so writes for the same row pile up in the queue while
//! faults (lost requests, rejected values, concurrent writers) land on them.
//!
//! Everything runs on a current-thread runtime with latency modeled as
//! scheduler yields, so a seed fully determines the run.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod campaign;
pub mod oracle;
pub mod rng;
pub mod server;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use roster_core::{
    BatchResult, CacheInvalidator, CoordinatorConfig, Edit, EntityId, FailureReason, Fields,
    MemoryState, MutationCoordinator, QueryCache, VersionTokenStore, WriteTransport, consolidate,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::rng::DeterministicRng;
use crate::server::{
    FaultConfig, SEQ_FIELD, ServerEvent, ServerRow, ServerStats, SimulatedServer, WEEKDAYS,
};

/// Highest hour value the simulated user types; above the server's clamp.
const MAX_TYPED_HOURS: u64 = 30;

/// Parameters for one simulated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Rows in the grid.
    pub entity_count: usize,
    /// Gestures submitted.
    pub rounds: u64,
    /// Upper bound on cell edits per gesture.
    pub max_edits_per_round: usize,
    /// Upper bound on scheduler yields between gestures.
    pub max_pause_yields: u8,
    /// Whether the server offers a bulk endpoint.
    pub bulk: bool,
    pub fault: FaultConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            entity_count: 6,
            rounds: 40,
            max_edits_per_round: 6,
            max_pause_yields: 3,
            bulk: true,
            fault: FaultConfig::default(),
        }
    }
}

impl SimulationConfig {
    fn validate(&self) -> Result<()> {
        if self.entity_count == 0 {
            bail!("entity_count must be > 0");
        }
        if self.max_edits_per_round == 0 {
            bail!("max_edits_per_round must be > 0");
        }
        Ok(())
    }
}

/// Client-side trace entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u64,
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEventKind {
    Submitted {
        batch: u64,
        entities: Vec<EntityId>,
    },
    Settled {
        batch: u64,
        succeeded: usize,
        failed: usize,
    },
    Refetched {
        entity: EntityId,
    },
}

/// One submitted gesture and how it settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Submission sequence number, stamped into every patch as `edit_seq`.
    pub batch: u64,
    pub round: u64,
    /// Consolidated entities, in consolidation order.
    pub entities: Vec<EntityId>,
    pub result: BatchResult,
}

/// Everything observed during one simulated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub batches: Vec<BatchRecord>,
    pub server_log: Vec<ServerEvent>,
    /// Grid state after every write settled and stale rows were refetched.
    pub local_rows: BTreeMap<EntityId, Fields>,
    pub server_rows: BTreeMap<EntityId, ServerRow>,
    pub stats: ServerStats,
    /// Most patches for one row applied but unsettled at once.
    pub max_queue_depth: usize,
    /// Entity writes rolled back.
    pub rollbacks: usize,
    /// Query-cache invalidation rounds triggered by writes.
    pub invalidations: u64,
    /// A rollback happened while writes were queued behind each other.
    pub interesting_state_reached: bool,
}

struct PendingBatch {
    batch: u64,
    round: u64,
    entities: Vec<EntityId>,
    handle: JoinHandle<BatchResult>,
}

/// Session state threaded through one run.
struct Session {
    server: Arc<SimulatedServer>,
    local: MemoryState,
    tokens: VersionTokenStore,
    cache: Arc<QueryCache>,
    coordinator: MutationCoordinator,
    pending: Vec<PendingBatch>,
    stale: BTreeSet<EntityId>,
    trace: Vec<TraceEvent>,
    batches: Vec<BatchRecord>,
    max_queue_depth: usize,
}

impl Session {
    fn new(config: &SimulationConfig) -> Self {
        let entities: Vec<EntityId> = (0..config.entity_count)
            .map(|i| EntityId::new(format!("a{i}")))
            .collect();
        let server = Arc::new(SimulatedServer::new(
            &entities,
            config.fault,
            DeterministicRng::fork(config.seed, 1),
            config.bulk,
        ));

        let coordinator_config = CoordinatorConfig::default();
        let local = MemoryState::new();
        let tokens = VersionTokenStore::new();
        for (id, row) in server.rows() {
            tokens.set(coordinator_config.resource_key(&id), row.token());
            local.insert(id, row.fields);
        }

        let cache = Arc::new(QueryCache::new());
        let transport: Arc<dyn WriteTransport> = server.clone();
        let invalidator: Arc<dyn CacheInvalidator> = cache.clone();
        let coordinator =
            MutationCoordinator::new(coordinator_config, transport, Arc::new(local.clone()))
                .with_tokens(tokens.clone())
                .with_invalidator(invalidator);

        Self {
            server,
            local,
            tokens,
            cache,
            coordinator,
            pending: Vec::new(),
            stale: BTreeSet::new(),
            trace: Vec::new(),
            batches: Vec::new(),
            max_queue_depth: 0,
        }
    }

    fn submit(&mut self, round: u64, batch: u64, edits: &[Edit]) {
        let entities: Vec<EntityId> = consolidate(edits)
            .into_iter()
            .map(|patch| patch.entity_id)
            .collect();
        let handle = tokio::spawn(self.coordinator.submit(edits));

        for id in &entities {
            self.max_queue_depth = self
                .max_queue_depth
                .max(self.coordinator.applier().in_flight(id));
        }
        self.trace.push(TraceEvent {
            round,
            kind: TraceEventKind::Submitted {
                batch,
                entities: entities.clone(),
            },
        });
        self.pending.push(PendingBatch {
            batch,
            round,
            entities,
            handle,
        });
    }

    /// Record batches whose writes all settled. With `drain`, wait for all.
    async fn collect(&mut self, round: u64, drain: bool) -> Result<()> {
        let mut still_pending = Vec::new();
        for pending in std::mem::take(&mut self.pending) {
            if !drain && !pending.handle.is_finished() {
                still_pending.push(pending);
                continue;
            }
            let result = pending
                .handle
                .await
                .with_context(|| format!("batch {} task failed", pending.batch))?;
            for failed in &result.failed {
                if failed.reason == FailureReason::Conflict {
                    self.stale.insert(failed.entity_id.clone());
                }
            }
            self.trace.push(TraceEvent {
                round,
                kind: TraceEventKind::Settled {
                    batch: pending.batch,
                    succeeded: result.succeeded.len(),
                    failed: result.failed.len(),
                },
            });
            self.batches.push(BatchRecord {
                batch: pending.batch,
                round: pending.round,
                entities: pending.entities,
                result,
            });
        }
        self.pending = still_pending;
        Ok(())
    }

    /// Reload conflicted rows that have no write in flight.
    fn refetch_idle(&mut self, round: u64) -> Result<()> {
        let idle: Vec<EntityId> = self
            .stale
            .iter()
            .filter(|id| self.coordinator.applier().in_flight(id) == 0)
            .cloned()
            .collect();
        for id in idle {
            self.stale.remove(&id);
            let Some(row) = self.server.fetch(&id) else {
                continue;
            };
            let key = self.coordinator.config().resource_key(&id);
            self.cache.set(
                key.as_str(),
                serde_json::to_value(&row.fields).context("row is not JSON")?,
            );
            self.tokens.set(key, row.token());
            self.local.insert(id.clone(), row.fields);
            tracing::debug!(entity = %id, round, "refetched conflicted row");
            self.trace.push(TraceEvent {
                round,
                kind: TraceEventKind::Refetched { entity: id },
            });
        }
        Ok(())
    }

    fn finish(self, seed: u64) -> SimulationResult {
        let rollbacks = self.batches.iter().map(|b| b.result.failed.len()).sum();
        SimulationResult {
            seed,
            trace: self.trace,
            batches: self.batches,
            server_log: self.server.log(),
            local_rows: self.local.rows(),
            server_rows: self.server.rows(),
            stats: self.server.stats(),
            max_queue_depth: self.max_queue_depth,
            rollbacks,
            invalidations: self.cache.generation(),
            interesting_state_reached: rollbacks > 0 && self.max_queue_depth > 1,
        }
    }
}

/// Deterministic simulator for one seed.
#[derive(Debug)]
pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error if the config has no rows or allows no edits.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            rng: DeterministicRng::fork(config.seed, 0),
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Run the session to quiescence.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be built or a write task
    /// panicked.
    pub fn run(&mut self) -> Result<SimulationResult> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .context("failed to build simulation runtime")?;
        runtime.block_on(self.drive())
    }

    async fn drive(&mut self) -> Result<SimulationResult> {
        let mut session = Session::new(&self.config);
        tracing::debug!(seed = self.config.seed, "simulation started");

        for round in 0..self.config.rounds {
            let batch = round + 1;
            let edits = self.generate_edits(batch);
            session.submit(round, batch, &edits);

            let pause = self
                .rng
                .next_bounded(u64::from(self.config.max_pause_yields) + 1);
            for _ in 0..pause {
                tokio::task::yield_now().await;
            }

            session.collect(round, false).await?;
            session.refetch_idle(round)?;
        }

        let last = self.config.rounds;
        session.collect(last, true).await?;
        session.refetch_idle(last)?;

        let result = session.finish(self.config.seed);
        tracing::debug!(
            seed = result.seed,
            batches = result.batches.len(),
            rollbacks = result.rollbacks,
            "simulation finished"
        );
        Ok(result)
    }

    /// One gesture: random cell edits, then an `edit_seq` stamp per row.
    fn generate_edits(&mut self, batch: u64) -> Vec<Edit> {
        let count = 1 + self.rng.next_index(self.config.max_edits_per_round);
        let mut edits = Vec::with_capacity(count * 2);
        for _ in 0..count {
            let entity = EntityId::new(format!(
                "a{}",
                self.rng.next_index(self.config.entity_count)
            ));
            let day = WEEKDAYS[self.rng.next_index(WEEKDAYS.len())];
            let hours = self.rng.next_bounded(MAX_TYPED_HOURS + 1);
            edits.push(Edit::new(entity, day, hours));
        }

        let touched: Vec<EntityId> = consolidate(&edits)
            .into_iter()
            .map(|patch| patch.entity_id)
            .collect();
        edits.extend(
            touched
                .into_iter()
                .map(|entity| Edit::new(entity, SEQ_FIELD, batch)),
        );
        edits
    }
}
