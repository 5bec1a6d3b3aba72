// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement Orchestrator CLI
//!
//! Drives measurements against simulated probes and inspects stored runs.
//!
//! # Usage
//!
//! ```bash
//! # Latency from P1 to P2 with the built-in two-probe lab
//! msm-orchestrator simulate --kind latency --source P1 --destination P2
//!
//! # Energy on P1, stopped after 2 seconds
//! msm-orchestrator simulate --config lab.toml --kind energy --source P1 --stop-after 2
//!
//! # Write an example configuration
//! msm-orchestrator gen-config --output lab.toml
//!
//! # Inspect a SQLite store
//! msm-orchestrator list --db lab.db
//! msm-orchestrator show --db lab.db 2c5e7b0e-...
//! ```

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use msm_orchestrator::config::{OrchestratorConfig, ProbeConfig};
use msm_orchestrator::{
    InboundMessage, LoopbackBus, MeasurementId, MeasurementKind, MeasurementParams,
    MeasurementRequest, MeasurementStore, Orchestrator, ProbeTransport, RouterStatsSnapshot,
    SimulatedProbe, SqliteStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Measurement Orchestrator
#[derive(Parser, Debug)]
#[command(name = "msm-orchestrator")]
#[command(about = "Measurement Orchestrator - probe handshakes over publish/subscribe")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one measurement against simulated probes
    Simulate {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Measurement kind
        #[arg(short, long)]
        kind: MeasurementKind,

        /// Source probe id
        #[arg(short, long)]
        source: String,

        /// Destination probe id
        #[arg(short, long)]
        destination: Option<String>,

        /// Stop the measurement after this many seconds instead of
        /// waiting for its results
        #[arg(long)]
        stop_after: Option<u64>,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "orchestrator.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// List measurements in a SQLite store
    List {
        #[arg(long)]
        db: PathBuf,
    },

    /// Show one measurement and its results
    Show {
        #[arg(long)]
        db: PathBuf,

        /// Measurement id
        id: MeasurementId,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.command {
        Commands::Simulate {
            config: Some(path), ..
        } => OrchestratorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        _ => lab_config(),
    };

    // Initialize logging
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.coordinator.log_level.clone());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match args.command {
        Commands::Simulate {
            kind,
            source,
            destination,
            stop_after,
            ..
        } => cmd_simulate(config, kind, source, destination, stop_after).await,
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::Validate { config } => cmd_validate(config),
        Commands::List { db } => cmd_list(db),
        Commands::Show { db, id } => cmd_show(db, id),
    }
}

/// Two probes on a flat lab network.
fn lab_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.probes = vec![
        ProbeConfig::new(
            "P1",
            [10, 0, 0, 11].into(),
            [10, 0, 1, 11].into(),
        ),
        ProbeConfig::new(
            "P2",
            [10, 0, 0, 12].into(),
            [10, 0, 1, 12].into(),
        ),
    ];
    config
}

async fn cmd_simulate(
    config: OrchestratorConfig,
    kind: MeasurementKind,
    source: String,
    destination: Option<String>,
    stop_after: Option<u64>,
) -> anyhow::Result<()> {
    let store = config.store.open()?;
    let bus = Arc::new(LoopbackBus::new());
    let orchestrator = Orchestrator::new(
        Arc::clone(&bus) as Arc<dyn ProbeTransport>,
        Arc::clone(&store),
        config.coordinator.address.clone(),
        config.coordinator.reply_timeout(),
    )?;

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundMessage>();
    let routing = orchestrator.run(inbound_rx);
    for probe in &config.probes {
        SimulatedProbe::from_config(probe, inbound_tx.clone()).spawn(&bus);
    }
    drop(inbound_tx);

    println!("Measurement Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();
    println!("Coordinator: {} ({})", config.coordinator.name, config.coordinator.address);
    println!("Probes:      {}", config.probes.len());
    println!();

    let mut request = MeasurementRequest::new(source, MeasurementParams::default_for(kind));
    if let Some(destination) = destination {
        request = request.destination(destination);
    }

    let response = orchestrator.create_measurement(request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.is_ok() {
        routing.abort();
        anyhow::bail!("measurement was not started");
    }
    let id: MeasurementId = serde_json::from_value(response.body["id"].clone())?;

    match stop_after {
        Some(secs) => {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let response = orchestrator.stop_measurement(id).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        None => {
            println!("Waiting for results (Ctrl+C to stop)...");
            tokio::select! {
                _ = wait_terminal(store.as_ref(), id) => {}
                _ = tokio::signal::ctrl_c() => {
                    println!("\nStopping...");
                    let response = orchestrator.stop_measurement(id).await;
                    println!("{}", serde_json::to_string_pretty(&response)?);
                }
            }
        }
    }

    print_measurement(store.as_ref(), id)?;
    println!("\nFinal Statistics:");
    print_stats(&orchestrator.stats());
    routing.abort();
    Ok(())
}

async fn wait_terminal(store: &dyn MeasurementStore, id: MeasurementId) {
    let mut interval = tokio::time::interval(Duration::from_millis(50));
    loop {
        interval.tick().await;
        match store.find_by_id(&id) {
            Ok(Some(m)) if m.state.is_terminal() => return,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Store lookup failed: {}", e);
                return;
            }
        }
    }
}

fn cmd_gen_config(output: PathBuf) -> anyhow::Result<()> {
    let mut config = lab_config();
    config.coordinator.name = "example-lab".into();
    config.coordinator.address = "10.0.0.1".into();
    config.store.backend = msm_orchestrator::StoreBackend::Sqlite;
    config.store.path = Some("lab.db".into());
    if let Some(p2) = config.probes.get_mut(1) {
        p2.nack.insert("disable_ntp_service".into(), "SENSOR BUSY".into());
    }

    let toml_str = config.to_toml()?;

    // Add comments
    let content = format!(
        r#"# Measurement Orchestrator Configuration
# Generated by msm-orchestrator gen-config
#
# [probes.nack] maps a command to the reason a simulated probe rejects it with.

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match OrchestratorConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Coordinator: {}", config.coordinator.name);
            println!("Reply timeout: {} ms", config.coordinator.reply_timeout_ms);
            println!("Store: {:?}", config.store.backend);
            println!("Probes: {}", config.probes.len());
            for (i, probe) in config.probes.iter().enumerate() {
                println!(
                    "  [{}] {} at {} (clock sync {})",
                    i, probe.id, probe.address, probe.clock_sync_address
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_list(db: PathBuf) -> anyhow::Result<()> {
    let store = SqliteStore::new(&db)?;
    let measurements = store.list()?;
    println!("{} measurement(s) in {}", measurements.len(), db.display());
    for m in measurements {
        println!(
            "  {}  {:<18} {:<9} {} -> {}  ({} results)",
            m.id,
            m.kind().as_str(),
            m.state.as_str(),
            m.source_probe,
            m.destination_probe
                .as_ref()
                .map_or("-", |p| p.as_str()),
            m.results.len()
        );
    }
    Ok(())
}

fn cmd_show(db: PathBuf, id: MeasurementId) -> anyhow::Result<()> {
    let store = SqliteStore::new(&db)?;
    print_measurement(&store, id)
}

fn print_measurement(store: &dyn MeasurementStore, id: MeasurementId) -> anyhow::Result<()> {
    let Some(measurement) = store.find_by_id(&id)? else {
        anyhow::bail!("measurement {} not found", id);
    };
    println!("\n--- Measurement ---");
    println!("{}", serde_json::to_string_pretty(&measurement)?);
    for result in store.results_for(&id)? {
        println!("--- Result {} from {} ---", result.id, result.probe);
        println!("{}", serde_json::to_string_pretty(&result.data)?);
    }
    Ok(())
}

fn print_stats(stats: &RouterStatsSnapshot) {
    println!(
        "  {} routed ({} status, {} result, {} error), {} unsolicited, {} dropped, up {}s",
        stats.total_routed(),
        stats.statuses_routed,
        stats.results_routed,
        stats.errors_routed,
        stats.unsolicited,
        stats.messages_dropped,
        stats.uptime_secs
    );
}
