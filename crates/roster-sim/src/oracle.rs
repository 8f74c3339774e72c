use std::collections::{BTreeMap, BTreeSet};

use roster_core::{EntityId, Fields};

use crate::server::{SendOutcome, ServerEvent, ServerRow};
use crate::{BatchRecord, SimulationResult};

// ── Core result types ─────────────────────────────────────────────────────────

/// Oracle result for an invariant check.
///
/// Returned by each invariant checker and by [`WriteOracle::check_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct OracleResult {
    /// `true` iff no violations were found.
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    #[must_use]
    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        if violations.is_empty() {
            Self::pass()
        } else {
            Self {
                passed: false,
                violations,
            }
        }
    }

    /// Merge another result into this one (failures accumulate).
    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

// ── Invariant violation diagnostics ──────────────────────────────────────────

/// Diagnostic information for a single failed invariant check.
#[derive(Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    /// A request for an entity started while another was still in flight.
    ///
    /// Emitted by `check_serialization`.
    OverlappingWrites {
        entity: EntityId,
        /// `edit_seq` carried by the request that started too early.
        edit_seq: u64,
        /// `edit_seq` of the request still in flight.
        in_flight_seq: u64,
    },

    /// Requests for an entity reached the server out of submission order.
    ///
    /// Emitted by `check_serialization`.
    OutOfOrderSend {
        entity: EntityId,
        previous_seq: u64,
        edit_seq: u64,
    },

    /// A precondition failed although nobody else wrote the row since the
    /// client last loaded it.
    ///
    /// Emitted by `check_conflicts`.
    UnexpectedConflict { entity: EntityId, edit_seq: u64 },

    /// After every write settled, the grid disagrees with the server.
    ///
    /// Emitted by `check_convergence`.
    Divergence {
        entity: EntityId,
        field: String,
        local: Option<serde_json::Value>,
        server: Option<serde_json::Value>,
    },

    /// A batch result lost, duplicated, or invented an entity.
    ///
    /// Emitted by `check_batch_accounting`.
    BatchAccounting {
        batch: u64,
        expected: Vec<EntityId>,
        reported: Vec<EntityId>,
    },
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Oracle for the write-coordination invariants of a finished simulation.
pub struct WriteOracle;

impl WriteOracle {
    /// At most one request per entity is in flight, and requests for an
    /// entity start in the order their batches were submitted.
    #[must_use]
    pub fn check_serialization(log: &[ServerEvent]) -> OracleResult {
        let mut in_flight: BTreeMap<&EntityId, u64> = BTreeMap::new();
        let mut last_started: BTreeMap<&EntityId, u64> = BTreeMap::new();
        let mut violations = Vec::new();

        for event in log {
            match event {
                ServerEvent::SendStarted {
                    entity, edit_seq, ..
                } => {
                    if let Some(&in_flight_seq) = in_flight.get(entity) {
                        violations.push(InvariantViolation::OverlappingWrites {
                            entity: entity.clone(),
                            edit_seq: *edit_seq,
                            in_flight_seq,
                        });
                    }
                    match last_started.get(entity) {
                        Some(&previous_seq) if previous_seq >= *edit_seq => {
                            violations.push(InvariantViolation::OutOfOrderSend {
                                entity: entity.clone(),
                                previous_seq,
                                edit_seq: *edit_seq,
                            });
                        }
                        _ => {}
                    }
                    in_flight.insert(entity, *edit_seq);
                    last_started.insert(entity, *edit_seq);
                }
                ServerEvent::SendFinished { entity, .. } => {
                    in_flight.remove(entity);
                }
                ServerEvent::ExternalWrite { .. } | ServerEvent::Fetched { .. } => {}
            }
        }

        OracleResult::from_violations(violations)
    }

    /// Every conflict is explained by an external write the client had not
    /// yet reloaded. Any other conflict means a stale token was sent.
    #[must_use]
    pub fn check_conflicts(log: &[ServerEvent]) -> OracleResult {
        let mut externally_changed: BTreeSet<&EntityId> = BTreeSet::new();
        let mut current_seq: BTreeMap<&EntityId, u64> = BTreeMap::new();
        let mut violations = Vec::new();

        for event in log {
            match event {
                ServerEvent::ExternalWrite { entity, .. } => {
                    externally_changed.insert(entity);
                }
                ServerEvent::Fetched { entity } => {
                    externally_changed.remove(entity);
                }
                ServerEvent::SendStarted {
                    entity, edit_seq, ..
                } => {
                    current_seq.insert(entity, *edit_seq);
                }
                ServerEvent::SendFinished { entity, outcome } => {
                    if *outcome == SendOutcome::Conflict && !externally_changed.contains(entity) {
                        violations.push(InvariantViolation::UnexpectedConflict {
                            entity: entity.clone(),
                            edit_seq: current_seq.get(entity).copied().unwrap_or_default(),
                        });
                    }
                }
            }
        }

        OracleResult::from_violations(violations)
    }

    /// Once quiescent, the local copy of every row equals the server's.
    #[must_use]
    pub fn check_convergence(
        local: &BTreeMap<EntityId, Fields>,
        server: &BTreeMap<EntityId, ServerRow>,
    ) -> OracleResult {
        let empty = Fields::new();
        let mut violations = Vec::new();

        let entities: BTreeSet<&EntityId> = local.keys().chain(server.keys()).collect();
        for entity in entities {
            let local_fields = local.get(entity).unwrap_or(&empty);
            let server_fields = server.get(entity).map_or(&empty, |row| &row.fields);
            let fields: BTreeSet<&String> =
                local_fields.keys().chain(server_fields.keys()).collect();
            for field in fields {
                let local_value = local_fields.get(field);
                let server_value = server_fields.get(field);
                if local_value != server_value {
                    violations.push(InvariantViolation::Divergence {
                        entity: entity.clone(),
                        field: field.clone(),
                        local: local_value.cloned(),
                        server: server_value.cloned(),
                    });
                }
            }
        }

        OracleResult::from_violations(violations)
    }

    /// Every consolidated entity of a batch is reported exactly once, as
    /// succeeded or failed.
    #[must_use]
    pub fn check_batch_accounting(batches: &[BatchRecord]) -> OracleResult {
        let mut violations = Vec::new();

        for record in batches {
            let reported: Vec<EntityId> = record
                .result
                .succeeded
                .iter()
                .cloned()
                .chain(
                    record
                        .result
                        .failed
                        .iter()
                        .map(|failed| failed.entity_id.clone()),
                )
                .collect();

            let mut expected_sorted = record.entities.clone();
            expected_sorted.sort();
            let mut reported_sorted = reported.clone();
            reported_sorted.sort();

            if expected_sorted != reported_sorted {
                violations.push(InvariantViolation::BatchAccounting {
                    batch: record.batch,
                    expected: record.entities.clone(),
                    reported,
                });
            }
        }

        OracleResult::from_violations(violations)
    }

    /// Run every invariant check.
    #[must_use]
    pub fn check_all(result: &SimulationResult) -> OracleResult {
        OracleResult::pass()
            .merge(Self::check_serialization(&result.server_log))
            .merge(Self::check_conflicts(&result.server_log))
            .merge(Self::check_convergence(
                &result.local_rows,
                &result.server_rows,
            ))
            .merge(Self::check_batch_accounting(&result.batches))
    }
}
