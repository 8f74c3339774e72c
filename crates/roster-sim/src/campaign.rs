//! Campaign runner for deterministic simulation campaigns.
//!
//! Executes many seeds across configurable parameters, collecting pass/fail
//! results and identifying the first failing seed for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::oracle::{InvariantViolation, OracleResult, WriteOracle};
use crate::server::FaultConfig;
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Campaign-level configuration controlling how many seeds to run and
/// what simulation parameters to use for each seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Range of seeds to execute, e.g., `0..100`.
    pub seed_range: Range<u64>,
    /// Grid rows per seed.
    pub entity_count: usize,
    /// Gestures submitted per seed.
    pub rounds: u64,
    pub max_edits_per_round: usize,
    pub max_pause_yields: u8,
    /// Whether the simulated server offers a bulk endpoint.
    pub bulk: bool,
    /// Lost requests (percent, 0–100).
    pub fault_network_percent: u8,
    /// Server-side rejections (percent, 0–100).
    pub fault_validation_percent: u8,
    /// Concurrent writes by another client (percent, 0–100).
    pub fault_external_percent: u8,
    /// Maximum request latency in scheduler yields.
    pub fault_max_latency: u8,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        Self {
            seed_range: 0..100,
            entity_count: sim.entity_count,
            rounds: sim.rounds,
            max_edits_per_round: sim.max_edits_per_round,
            max_pause_yields: sim.max_pause_yields,
            bulk: sim.bulk,
            fault_network_percent: sim.fault.network_rate_percent,
            fault_validation_percent: sim.fault.validation_rate_percent,
            fault_external_percent: sim.fault.external_write_rate_percent,
            fault_max_latency: sim.fault.max_latency_yields,
        }
    }
}

impl CampaignConfig {
    /// Build a [`SimulationConfig`] for a specific seed.
    #[must_use]
    pub const fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            entity_count: self.entity_count,
            rounds: self.rounds,
            max_edits_per_round: self.max_edits_per_round,
            max_pause_yields: self.max_pause_yields,
            bulk: self.bulk,
            fault: FaultConfig {
                network_rate_percent: self.fault_network_percent,
                validation_rate_percent: self.fault_validation_percent,
                external_write_rate_percent: self.fault_external_percent,
                max_latency_yields: self.fault_max_latency,
            },
        }
    }

    /// Validate configuration before running.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.entity_count == 0 {
            bail!("entity_count must be > 0");
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        if self.max_edits_per_round == 0 {
            bail!("max_edits_per_round must be > 0");
        }
        for (name, percent) in [
            ("fault_network_percent", self.fault_network_percent),
            ("fault_validation_percent", self.fault_validation_percent),
            ("fault_external_percent", self.fault_external_percent),
        ] {
            if percent > 100 {
                bail!("{name} must be at most 100, got {percent}");
            }
        }
        Ok(())
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

/// Aggregate report produced by a campaign run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed (for prioritized replay).
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds where a rollback happened behind a queued write.
    pub interesting_states_reached: usize,
    /// Entity writes rolled back across all seeds.
    pub rollbacks: usize,
}

impl CampaignReport {
    /// True if every seed passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Detailed trace produced by replaying a single seed.
#[derive(Debug, Clone)]
pub struct DetailedTrace {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

/// Run a full campaign across all seeds in the config.
///
/// # Errors
///
/// Returns an error if config validation fails or a simulation encounters
/// an internal error.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
        rollbacks: 0,
    };

    for seed in config.seed_range.clone() {
        report.seeds_run += 1;

        let trace = simulate(seed, config)?;
        if trace.result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }
        report.rollbacks += trace.result.rollbacks;

        if trace.oracle.passed {
            report.seeds_passed += 1;
        } else {
            tracing::warn!(
                seed,
                violations = trace.oracle.violations.len(),
                "seed failed"
            );
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: trace.oracle.violations.iter().map(format_violation).collect(),
            });
        }
    }

    tracing::info!(
        seeds_run = report.seeds_run,
        seeds_passed = report.seeds_passed,
        interesting = report.interesting_states_reached,
        "campaign finished"
    );
    Ok(report)
}

/// Run a single seed and return Ok(()) on pass, Err(violations) on failure.
///
/// # Errors
///
/// Returns an `anyhow::Error` if the simulation itself encounters an internal
/// error (invalid config, etc). The inner `Result` distinguishes pass from
/// invariant violations.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<InvariantViolation>>> {
    let trace = simulate(seed, config)?;
    if trace.oracle.passed {
        Ok(Ok(()))
    } else {
        Ok(Err(trace.oracle.violations))
    }
}

/// Replay a single seed with full trace details for debugging.
///
/// # Errors
///
/// Returns an error when config validation or simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    config.validate()?;
    simulate(seed, config)
}

fn simulate(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    let result = simulator.run()?;
    let oracle = WriteOracle::check_all(&result);
    Ok(DetailedTrace { result, oracle })
}

/// Format an invariant violation into a human-readable string.
#[must_use]
pub fn format_violation(v: &InvariantViolation) -> String {
    match v {
        InvariantViolation::OverlappingWrites {
            entity,
            edit_seq,
            in_flight_seq,
        } => format!(
            "OverlappingWrites: {entity} sent edit {edit_seq} while edit {in_flight_seq} was in flight"
        ),
        InvariantViolation::OutOfOrderSend {
            entity,
            previous_seq,
            edit_seq,
        } => format!("OutOfOrderSend: {entity} sent edit {edit_seq} after edit {previous_seq}"),
        InvariantViolation::UnexpectedConflict { entity, edit_seq } => format!(
            "UnexpectedConflict: {entity} edit {edit_seq} conflicted with no concurrent writer"
        ),
        InvariantViolation::Divergence {
            entity,
            field,
            local,
            server,
        } => format!(
            "Divergence: {entity}.{field} is {} locally but {} on the server",
            display_value(local.as_ref()),
            display_value(server.as_ref())
        ),
        InvariantViolation::BatchAccounting {
            batch,
            expected,
            reported,
        } => format!(
            "BatchAccounting: batch {batch} consolidated {} entities but reported {} \
             (expected={expected:?}, reported={reported:?})",
            expected.len(),
            reported.len()
        ),
    }
}

fn display_value(value: Option<&serde_json::Value>) -> String {
    value.map_or_else(|| "missing".to_string(), ToString::to_string)
}
