//! In-memory stand-in for the scheduling backend.
//!
//! Rows carry a version counter exposed as the token `v{n}`. A write whose
//! `if_match` is stale is rejected as a conflict. Faults are drawn from a
//! [`DeterministicRng`] so a seed reproduces the exact same server behavior.
//!
//! Every send is logged as a start/finish pair so the oracle can check that
//! same-entity writes never overlap and start in submission order.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use roster_core::{
    BulkItemResult, EntityId, FailureReason, Fields, VersionToken, WriteAck, WriteFailure,
    WriteRequest, WriteTransport,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::rng::DeterministicRng;

/// Weekday hour fields every row carries.
pub const WEEKDAYS: [&str; 5] = ["mon", "tue", "wed", "thu", "fri"];

/// Server-computed sum of the weekday fields.
pub const TOTAL_FIELD: &str = "total";

/// Submission sequence number stamped on every patch by the simulator.
pub const SEQ_FIELD: &str = "edit_seq";

/// Hours above this are clamped by the server.
pub const MAX_DAY_HOURS: i64 = 24;

/// Fault injection configuration for the simulated backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Percentage of requests lost before reaching the server.
    pub network_rate_percent: u8,
    /// Percentage of accepted requests rejected by a business rule.
    pub validation_rate_percent: u8,
    /// Percentage of requests preceded by another client's write to the
    /// same row, which makes the request's token stale.
    pub external_write_rate_percent: u8,
    /// Maximum scheduler yields a request spends "on the wire".
    pub max_latency_yields: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            network_rate_percent: 5,
            validation_rate_percent: 5,
            external_write_rate_percent: 3,
            max_latency_yields: 4,
        }
    }
}

impl FaultConfig {
    /// No faults and no latency.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            network_rate_percent: 0,
            validation_rate_percent: 0,
            external_write_rate_percent: 0,
            max_latency_yields: 0,
        }
    }
}

/// How one entity's write ended on the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    Committed,
    Conflict,
    Validation,
    Network,
    Unknown,
}

impl SendOutcome {
    fn of(result: &Result<WriteAck, WriteFailure>) -> Self {
        match result {
            Ok(_) => Self::Committed,
            Err(failure) => match failure.reason {
                FailureReason::Conflict => Self::Conflict,
                FailureReason::Validation => Self::Validation,
                FailureReason::Network => Self::Network,
                FailureReason::Unknown => Self::Unknown,
            },
        }
    }
}

/// Entry in the server's request log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    SendStarted {
        entity: EntityId,
        edit_seq: u64,
        if_match: Option<VersionToken>,
        bulk: bool,
    },
    SendFinished {
        entity: EntityId,
        outcome: SendOutcome,
    },
    ExternalWrite {
        entity: EntityId,
        field: String,
    },
    Fetched {
        entity: EntityId,
    },
}

/// Aggregate request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub single_calls: usize,
    pub bulk_calls: usize,
    pub commits: usize,
    pub conflicts: usize,
    pub validation_failures: usize,
    pub network_failures: usize,
    pub external_writes: usize,
}

/// Authoritative copy of one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRow {
    pub version: u64,
    pub fields: Fields,
}

impl ServerRow {
    #[must_use]
    pub fn token(&self) -> VersionToken {
        VersionToken::new(format!("v{}", self.version))
    }

    fn recompute_total(&mut self) {
        let total: i64 = WEEKDAYS
            .iter()
            .filter_map(|day| self.fields.get(*day).and_then(serde_json::Value::as_i64))
            .sum();
        self.fields.insert(TOTAL_FIELD.to_string(), json!(total));
    }
}

/// A fresh row: every weekday at zero.
#[must_use]
pub fn blank_row() -> Fields {
    let mut fields: Fields = WEEKDAYS
        .iter()
        .map(|day| ((*day).to_string(), json!(0)))
        .collect();
    fields.insert(TOTAL_FIELD.to_string(), json!(0));
    fields.insert(SEQ_FIELD.to_string(), json!(0));
    fields
}

#[derive(Debug)]
struct ServerInner {
    rng: DeterministicRng,
    rows: BTreeMap<EntityId, ServerRow>,
    log: Vec<ServerEvent>,
    stats: ServerStats,
}

/// Fault-injecting backend implementing [`WriteTransport`].
#[derive(Debug)]
pub struct SimulatedServer {
    inner: Mutex<ServerInner>,
    fault: FaultConfig,
    bulk: bool,
}

impl SimulatedServer {
    /// Server holding `entities` blank rows at version 1.
    #[must_use]
    pub fn new(
        entities: &[EntityId],
        fault: FaultConfig,
        rng: DeterministicRng,
        bulk: bool,
    ) -> Self {
        let rows = entities
            .iter()
            .map(|id| {
                let mut row = ServerRow {
                    version: 1,
                    fields: blank_row(),
                };
                row.recompute_total();
                (id.clone(), row)
            })
            .collect();
        Self {
            inner: Mutex::new(ServerInner {
                rng,
                rows,
                log: Vec::new(),
                stats: ServerStats::default(),
            }),
            fault,
            bulk,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    /// Read a row as a refetch would, logging the read.
    #[must_use]
    pub fn fetch(&self, entity: &EntityId) -> Option<ServerRow> {
        let mut inner = self.lock();
        let row = inner.rows.get(entity).cloned()?;
        inner.log.push(ServerEvent::Fetched {
            entity: entity.clone(),
        });
        Some(row)
    }

    /// Copy of every row.
    #[must_use]
    pub fn rows(&self) -> BTreeMap<EntityId, ServerRow> {
        self.lock().rows.clone()
    }

    #[must_use]
    pub fn log(&self) -> Vec<ServerEvent> {
        self.lock().log.clone()
    }

    #[must_use]
    pub fn stats(&self) -> ServerStats {
        self.lock().stats
    }

    fn begin(&self, requests: &[WriteRequest], bulk: bool) -> u64 {
        let mut inner = self.lock();
        if bulk {
            inner.stats.bulk_calls += 1;
        } else {
            inner.stats.single_calls += 1;
        }
        for request in requests {
            let edit_seq = request
                .fields
                .get(SEQ_FIELD)
                .and_then(serde_json::Value::as_u64)
                .unwrap_or_default();
            inner.log.push(ServerEvent::SendStarted {
                entity: request.entity_id.clone(),
                edit_seq,
                if_match: request.if_match.clone(),
                bulk,
            });
        }
        let max = u64::from(self.fault.max_latency_yields);
        inner.rng.next_bounded(max + 1)
    }

    fn finish(&self, entity: &EntityId, result: &Result<WriteAck, WriteFailure>) {
        let mut inner = self.lock();
        let outcome = SendOutcome::of(result);
        match outcome {
            SendOutcome::Committed => inner.stats.commits += 1,
            SendOutcome::Conflict => inner.stats.conflicts += 1,
            SendOutcome::Validation => inner.stats.validation_failures += 1,
            SendOutcome::Network => inner.stats.network_failures += 1,
            SendOutcome::Unknown => {}
        }
        inner.log.push(ServerEvent::SendFinished {
            entity: entity.clone(),
            outcome,
        });
    }

    /// Apply one request that reached the server.
    fn process(&self, request: &WriteRequest) -> Result<WriteAck, WriteFailure> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        if inner.rng.hit_rate_percent(self.fault.external_write_rate_percent) {
            let field = WEEKDAYS[inner.rng.next_index(WEEKDAYS.len())];
            let hours = inner.rng.next_bounded(9);
            if let Some(row) = inner.rows.get_mut(&request.entity_id) {
                row.fields.insert(field.to_string(), json!(hours));
                row.recompute_total();
                row.version += 1;
                inner.stats.external_writes += 1;
                inner.log.push(ServerEvent::ExternalWrite {
                    entity: request.entity_id.clone(),
                    field: field.to_string(),
                });
                tracing::debug!(entity = %request.entity_id, field, "external write");
            }
        }

        let Some(row) = inner.rows.get_mut(&request.entity_id) else {
            return Err(WriteFailure::validation(format!(
                "no such record: {}",
                request.entity_id
            )));
        };

        if request
            .if_match
            .as_ref()
            .is_some_and(|if_match| *if_match != row.token())
        {
            return Err(WriteFailure::conflict());
        }

        if inner.rng.hit_rate_percent(self.fault.validation_rate_percent) {
            return Err(WriteFailure::validation("assignment overlaps a leave period"));
        }

        let mut echoed = Fields::new();
        for (field, value) in &request.fields {
            let value = normalize(field, value);
            row.fields.insert(field.clone(), value.clone());
            echoed.insert(field.clone(), value);
        }
        row.recompute_total();
        row.version += 1;
        if let Some(total) = row.fields.get(TOTAL_FIELD) {
            echoed.insert(TOTAL_FIELD.to_string(), total.clone());
        }

        Ok(WriteAck {
            token: Some(row.token()),
            server_fields: Some(echoed),
        })
    }

    fn lost(&self) -> bool {
        self.lock()
            .rng
            .hit_rate_percent(self.fault.network_rate_percent)
    }
}

/// Clamp weekday hours into `0..=MAX_DAY_HOURS`.
fn normalize(field: &str, value: &serde_json::Value) -> serde_json::Value {
    if !WEEKDAYS.contains(&field) {
        return value.clone();
    }
    value
        .as_i64()
        .map_or_else(|| value.clone(), |hours| json!(hours.clamp(0, MAX_DAY_HOURS)))
}

async fn wire_latency(yields: u64) {
    for _ in 0..yields {
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl WriteTransport for SimulatedServer {
    async fn send(&self, request: WriteRequest) -> Result<WriteAck, WriteFailure> {
        let latency = self.begin(std::slice::from_ref(&request), false);
        wire_latency(latency).await;

        let result = if self.lost() {
            Err(WriteFailure::network("connection reset"))
        } else {
            self.process(&request)
        };
        self.finish(&request.entity_id, &result);
        result
    }

    fn supports_bulk(&self) -> bool {
        self.bulk
    }

    async fn send_bulk(
        &self,
        requests: Vec<WriteRequest>,
    ) -> Result<Vec<BulkItemResult>, WriteFailure> {
        if !self.bulk {
            return Err(WriteFailure::unknown("bulk endpoint not available"));
        }
        let latency = self.begin(&requests, true);
        wire_latency(latency).await;

        if self.lost() {
            let failure = WriteFailure::network("bulk request timed out");
            for request in &requests {
                self.finish(&request.entity_id, &Err(failure.clone()));
            }
            return Err(failure);
        }

        Ok(requests
            .iter()
            .map(|request| {
                let result = self.process(request);
                self.finish(&request.entity_id, &result);
                BulkItemResult {
                    entity_id: request.entity_id.clone(),
                    result,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::ResourceKey;

    fn server(fault: FaultConfig) -> SimulatedServer {
        SimulatedServer::new(
            &[EntityId::from("a1"), EntityId::from("a2")],
            fault,
            DeterministicRng::new(11),
            true,
        )
    }

    fn request(entity: &str, if_match: Option<&str>, pairs: &[(&str, i64)]) -> WriteRequest {
        WriteRequest {
            resource_key: ResourceKey::new(format!("assignments/{entity}")),
            entity_id: EntityId::from(entity),
            fields: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), json!(v)))
                .collect(),
            if_match: if_match.map(VersionToken::from),
        }
    }

    #[tokio::test]
    async fn commit_bumps_version_and_echoes_normalized_fields() {
        let server = server(FaultConfig::none());

        let ack = server
            .send(request("a1", Some("v1"), &[("mon", 30), ("tue", 4)]))
            .await
            .expect("commit");

        assert_eq!(ack.token, Some(VersionToken::from("v2")));
        let echoed = ack.server_fields.expect("server fields");
        assert_eq!(echoed["mon"], json!(24));
        assert_eq!(echoed[TOTAL_FIELD], json!(28));
        assert_eq!(server.rows()[&EntityId::from("a1")].version, 2);
    }

    #[tokio::test]
    async fn stale_token_is_a_conflict() {
        let server = server(FaultConfig::none());
        server
            .send(request("a1", Some("v1"), &[("mon", 1)]))
            .await
            .expect("commit");

        let err = server
            .send(request("a1", Some("v1"), &[("mon", 2)]))
            .await
            .expect_err("stale");

        assert_eq!(err.reason, FailureReason::Conflict);
        assert_eq!(server.rows()[&EntityId::from("a1")].fields["mon"], json!(1));
    }

    #[tokio::test]
    async fn missing_token_skips_precondition() {
        let server = server(FaultConfig::none());
        server
            .send(request("a1", None, &[("mon", 1)]))
            .await
            .expect("commit");
        server
            .send(request("a1", None, &[("mon", 2)]))
            .await
            .expect("commit");
        assert_eq!(server.stats().commits, 2);
    }

    #[tokio::test]
    async fn external_writes_make_tokens_stale() {
        let server = server(FaultConfig {
            external_write_rate_percent: 100,
            ..FaultConfig::none()
        });

        let err = server
            .send(request("a2", Some("v1"), &[("fri", 3)]))
            .await
            .expect_err("external write raced us");

        assert_eq!(err.reason, FailureReason::Conflict);
        assert_eq!(server.stats().external_writes, 1);
        assert!(
            server
                .log()
                .iter()
                .any(|e| matches!(e, ServerEvent::ExternalWrite { .. }))
        );
    }

    #[tokio::test]
    async fn lost_bulk_request_fails_every_item() {
        let server = server(FaultConfig {
            network_rate_percent: 100,
            ..FaultConfig::none()
        });

        let err = server
            .send_bulk(vec![
                request("a1", Some("v1"), &[("mon", 1)]),
                request("a2", Some("v1"), &[("mon", 1)]),
            ])
            .await
            .expect_err("lost");

        assert_eq!(err.reason, FailureReason::Network);
        let finished = server
            .log()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    ServerEvent::SendFinished {
                        outcome: SendOutcome::Network,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(finished, 2);
        assert_eq!(server.rows()[&EntityId::from("a1")].version, 1);
    }

    #[tokio::test]
    async fn log_pairs_starts_with_finishes() {
        let server = server(FaultConfig::none());
        server
            .send(request("a1", None, &[("mon", 1), (SEQ_FIELD, 7)]))
            .await
            .expect("commit");

        assert_eq!(
            server.log(),
            [
                ServerEvent::SendStarted {
                    entity: EntityId::from("a1"),
                    edit_seq: 7,
                    if_match: None,
                    bulk: false,
                },
                ServerEvent::SendFinished {
                    entity: EntityId::from("a1"),
                    outcome: SendOutcome::Committed,
                },
            ]
        );
    }
}
