//! Fleet Node Broker
//!
//! Loads the node inventory, registers every node with the broker and runs
//! the reconciliation loop and status monitor until interrupted.
//!
//! ## Architecture
//!
//! - **Broker**: Owns node state and allocates nodes to inference requests
//! - **Reconciler**: Dispatches commands to nodes that differ from their intent
//! - **Status Monitor**: Probes nodes and records their actual mode
//! - **Node Workers**: Run lifecycle commands one at a time per node

use std::sync::Arc;

use anyhow::Result;
use fleet_reconcile::EpochPhase;
use fleet_node_broker::broker::{Broker, BrokerSettings};
use fleet_node_broker::client::HttpClientFactory;
use fleet_node_broker::config::Config;
use fleet_node_broker::monitor::StatusMonitor;
use fleet_node_broker::phase::StaticPhaseSource;
use fleet_node_broker::reconciler::{Reconciler, ReconcilerConfig};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet node broker");
    info!(
        nodes_file = ?config.nodes_file,
        callback_url = %config.callback_url,
        epoch = config.epoch,
        phase = %config.phase,
        "Configuration loaded"
    );

    let factory = Arc::new(HttpClientFactory::new(config.node_timeout)?);
    let phase_source = Arc::new(StaticPhaseSource::new(config.initial_epoch_state()));
    let broker = Arc::new(Broker::new(
        factory,
        phase_source,
        BrokerSettings::from(&config),
    ));

    for node in config.load_nodes()? {
        let node_id = node.id.clone();
        if let Err(e) = broker.register_node(node).await {
            error!(node_id = %node_id, error = %e, "Failed to register node");
        }
    }
    info!(nodes = broker.node_count().await, "Node inventory registered");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(Arc::clone(&broker), ReconcilerConfig::from(&config));
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    let monitor = StatusMonitor::new(Arc::clone(&broker), config.status_poll_interval);
    let monitor_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            monitor.run(shutdown_rx).await;
        }
    });

    // Bring the fleet into the mode the starting phase expects
    let report = match config.phase {
        EpochPhase::Inference => Some(broker.inference_up_all().await),
        EpochPhase::PocGenerate => Some(broker.start_poc_all().await),
        EpochPhase::PocValidate => Some(broker.start_validation_all().await),
        EpochPhase::PocGenerateWindDown | EpochPhase::PocValidateWindDown => None,
    };
    if let Some(report) = report {
        info!(
            submitted = report.submitted,
            failed_nodes = report.failed_nodes.len(),
            "Initial fleet mode applied"
        );
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Signal shutdown to all loops
    let _ = shutdown_tx.send(true);

    for (name, handle) in [("reconciler", reconciler_handle), ("status monitor", monitor_handle)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task panicked");
        }
    }

    broker.shutdown().await;

    info!("Node broker shutdown complete");
    Ok(())
}
