#![forbid(unsafe_code)]

use std::env;
use std::io;

use anyhow::{Context, Result, bail};
use clap::Parser;
use roster_sim::campaign::{self, CampaignConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Run deterministic write-coordination campaigns against a simulated server.
#[derive(Parser, Debug)]
#[command(name = "roster-sim", version)]
struct Args {
    /// First seed of the campaign.
    #[arg(long, default_value_t = 0)]
    seed_start: u64,

    /// Number of seeds to run.
    #[arg(long, default_value_t = 100)]
    seeds: u64,

    /// Grid rows per seed.
    #[arg(long, default_value_t = 6)]
    entities: usize,

    /// Gestures submitted per seed.
    #[arg(long, default_value_t = 40)]
    rounds: u64,

    /// Upper bound on cell edits per gesture.
    #[arg(long, default_value_t = 6)]
    edits: usize,

    /// Disable the server's bulk endpoint.
    #[arg(long)]
    no_bulk: bool,

    /// Percent of writes rejected by server validation.
    #[arg(long, default_value_t = 5)]
    validation: u8,

    /// Percent of requests lost in transit.
    #[arg(long, default_value_t = 5)]
    network: u8,

    /// Percent of writes racing a concurrent writer.
    #[arg(long, default_value_t = 3)]
    external: u8,

    /// Maximum request latency in scheduler yields.
    #[arg(long, default_value_t = 4)]
    latency: u8,

    /// Emit the report (or replay trace) as JSON.
    #[arg(long)]
    json: bool,

    /// Replay one seed and print its full trace instead of running a campaign.
    #[arg(long, value_name = "SEED")]
    replay: Option<u64>,
}

impl Args {
    fn campaign_config(&self) -> CampaignConfig {
        CampaignConfig {
            seed_range: self.seed_start..self.seed_start.saturating_add(self.seeds),
            entity_count: self.entities,
            rounds: self.rounds,
            max_edits_per_round: self.edits,
            bulk: !self.no_bulk,
            fault_network_percent: self.network,
            fault_validation_percent: self.validation,
            fault_external_percent: self.external,
            fault_max_latency: self.latency,
            ..CampaignConfig::default()
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.campaign_config();

    if let Some(seed) = args.replay {
        return replay(seed, &config, args.json);
    }

    let report = campaign::run_campaign(&config)?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode report")?
        );
    } else {
        println!(
            "campaign complete: seeds={} passed={} interesting={} rollbacks={}",
            report.seeds_run,
            report.seeds_passed,
            report.interesting_states_reached,
            report.rollbacks
        );
        for failure in &report.failures {
            println!("seed {}:", failure.seed);
            for violation in &failure.violations {
                println!("  {violation}");
            }
        }
    }

    if let Some(seed) = report.first_failure {
        bail!(
            "{} of {} seeds failed; replay with --replay {seed}",
            report.failures.len(),
            report.seeds_run
        );
    }
    Ok(())
}

fn replay(seed: u64, config: &CampaignConfig, json: bool) -> Result<()> {
    let trace = campaign::replay_seed(seed, config)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&trace.result).context("failed to encode trace")?
        );
    } else {
        for event in &trace.result.trace {
            println!("round {:>3}  {:?}", event.round, event.kind);
        }
        for event in &trace.result.server_log {
            println!("server     {event:?}");
        }
        println!(
            "seed {seed}: batches={} rollbacks={} max_queue_depth={} stats={:?}",
            trace.result.batches.len(),
            trace.result.rollbacks,
            trace.result.max_queue_depth,
            trace.result.stats
        );
    }

    if !trace.oracle.passed {
        for violation in &trace.oracle.violations {
            eprintln!("{}", campaign::format_violation(violation));
        }
        bail!("seed {seed} violated {} invariants", trace.oracle.violations.len());
    }
    Ok(())
}

/// Initialize the tracing subscriber based on env vars.
///
/// Logs go to stderr so JSON reports on stdout stay parseable.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("ROSTER_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "roster=debug,info"
        } else {
            "roster=info,warn"
        })
    });

    let format = env::var("ROSTER_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(io::stderr))
                .init();
        }
    }
}
