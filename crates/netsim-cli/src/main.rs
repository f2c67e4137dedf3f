use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use netsim_model::Scenario;
use netsim_simulator::{SimulationReport, Simulator};

#[derive(Parser, Debug)]
#[command(author, version, about = "Discrete-event layered network simulator")]
struct Args {
    /// Scenario file (TOML) describing topology and traffic.
    #[arg(long)]
    scenario: PathBuf,

    /// Override the scenario's virtual end time, in seconds.
    #[arg(long)]
    until: Option<f64>,

    /// Print a per-flow summary after the run.
    #[arg(long, default_value_t = false)]
    summary: bool,

    /// Write a JSON trace of the finished simulation.
    #[arg(long)]
    trace_out: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    info!("netsim-cli starting…");

    let scenario = load_scenario(&args.scenario)?;
    let until = args.until.or(scenario.sim.until);
    if until.is_none() && !scenario.routers.is_empty() {
        anyhow::bail!(
            "scenarios with routers need an end time (sim.until or --until): \
             periodic hello/LSA tasks never drain the event queue"
        );
    }

    let mut sim = Simulator::from_scenario(&scenario)?;
    match until {
        Some(end) => sim.run_until(end),
        None => sim.run(),
    }
    info!(
        duration = sim.now(),
        packets = sim.trace().len(),
        "simulation complete"
    );

    let report = sim.export_report();
    if args.summary {
        print_summary(&report);
    }
    if let Some(path) = &args.trace_out {
        write_trace(path, &report)?;
    }
    Ok(())
}

fn load_scenario(path: &Path) -> Result<Scenario> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
    toml::from_str(&content).context("Failed to parse scenario file")
}

fn print_summary(report: &SimulationReport) {
    for flow in &report.summary {
        println!(
            "{} {} -> {}: sent {} ({} B), received {} ({} B), lost {}",
            flow.packet_type,
            flow.source_ip,
            flow.destination_ip,
            flow.sent_packets,
            flow.sent_bytes,
            flow.received_packets,
            flow.received_bytes,
            flow.lost_packets,
        );
        println!(
            "    avg delay {:.6} s, avg throughput {:.1} bps",
            flow.average_delay, flow.average_throughput_bps,
        );
    }
}

fn write_trace(path: &Path, report: &SimulationReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize simulation trace")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write trace file {}", path.display()))?;
    Ok(())
}
