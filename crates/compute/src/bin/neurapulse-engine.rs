//! neurapulse-engine: replay telemetry through the scheduling engine.
//!
//! Reads one JSON `TelemetrySnapshot` per line, drives every engine stage
//! with the snapshot's own timestamp as the clock, and writes each applied
//! action as a JSON line. Actions go through a dry-run process control, so
//! nothing on the host is touched.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use neurapulse_compute::{DryRunControl, Engine};
use neurapulse_core::config::load_dotenv;
use neurapulse_core::{EngineConfig, TelemetrySnapshot};

// ── CLI ─────────────────────────────────────────────────────────────

/// Replay JSON-lines telemetry through the NeuraPulse engine.
#[derive(Parser, Debug)]
#[command(name = "neurapulse-engine", version, about)]
struct Cli {
    /// Telemetry input, one snapshot per line ("-" for stdin).
    #[arg(long, short, default_value = "-")]
    input: String,

    /// Engine config TOML. Falls back to NEURAPULSE_* environment variables.
    #[arg(long, env = "NEURAPULSE_CONFIG")]
    config: Option<PathBuf>,

    /// Where to write applied actions ("-" for stdout).
    #[arg(long, short, default_value = "-")]
    output: String,
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    match &cli.config {
        Some(path) => {
            let config = EngineConfig::from_toml_file(path)
                .with_context(|| format!("loading config {}", path.display()))?;
            info!(path = %path.display(), "loaded engine config");
            Ok(config)
        }
        None => Ok(EngineConfig::from_env()),
    }
}

fn open_input(input: &str) -> anyhow::Result<Box<dyn BufRead>> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(input).with_context(|| format!("opening input {}", input))?;
    Ok(Box::new(BufReader::new(file)))
}

fn open_output(output: &str) -> anyhow::Result<Box<dyn Write>> {
    if output == "-" {
        return Ok(Box::new(BufWriter::new(io::stdout())));
    }
    let file = File::create(output).with_context(|| format!("creating output {}", output))?;
    Ok(Box::new(BufWriter::new(file)))
}

// ── main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    config.log_summary();

    let engine = Engine::new(Arc::new(config), Arc::new(DryRunControl::new()))
        .context("engine configuration rejected")?;

    let reader = open_input(&cli.input)?;
    let mut writer = open_output(&cli.output)?;

    let mut snapshots = 0u64;
    let mut skipped = 0u64;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.context("reading input")?;
        if line.trim().is_empty() {
            continue;
        }
        let snapshot: TelemetrySnapshot = match serde_json::from_str(&line) {
            Ok(s) => s,
            Err(e) => {
                warn!(line = lineno + 1, error = %e, "skipping unparsable snapshot");
                skipped += 1;
                continue;
            }
        };
        snapshots += 1;

        let report = engine.tick(&snapshot);
        for action in &report.actions {
            serde_json::to_writer(&mut writer, action).context("writing action")?;
            writer.write_all(b"\n").context("writing action")?;
        }
    }
    writer.flush().context("flushing output")?;

    let metrics = engine.metrics();
    info!(
        snapshots,
        skipped,
        actions_executed = metrics.actions_executed,
        actions_failed = metrics.actions_failed,
        actions_filtered = metrics.actions_filtered,
        drift_events = metrics.drift_events,
        anomaly_events = metrics.anomaly_events,
        learning_rate = metrics.learning_rate,
        tracked = metrics.tracked_processes,
        "replay complete"
    );
    Ok(())
}
