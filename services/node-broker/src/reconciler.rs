//! Reconciliation loop for converging node state.
//!
//! The reconciler:
//! - Periodically dispatches commands to nodes that differ from their intent
//! - Runs a pass immediately when the broker requests one

use std::sync::Arc;
use std::time::Duration;

use fleet_reconcile::DEFAULT_RECONCILE_INTERVAL;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::config::Config;

/// Reconciliation loop configuration.
pub struct ReconcilerConfig {
    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }
}

impl From<&Config> for ReconcilerConfig {
    fn from(config: &Config) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval,
        }
    }
}

/// Reconciler for converging fleet state.
pub struct Reconciler {
    broker: Arc<Broker>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(broker: Arc<Broker>, config: ReconcilerConfig) -> Self {
        Self { broker, config }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut reconcile_interval = tokio::time::interval(self.config.reconcile_interval);

        loop {
            tokio::select! {
                _ = reconcile_interval.tick() => {
                    self.reconcile().await;
                }
                _ = self.broker.reconciliation_requested() => {
                    debug!("Reconciliation requested");
                    self.reconcile().await;
                    reconcile_interval.reset();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    async fn reconcile(&self) {
        let report = self.broker.reconcile().await;
        if !report.failed_nodes.is_empty() || report.failed > 0 {
            warn!(
                submitted = report.submitted,
                failed = report.failed,
                failed_nodes = ?report.failed_nodes,
                "Reconciliation left nodes failed"
            );
        } else if report.submitted > 0 {
            info!(submitted = report.submitted, "Reconciliation pass complete");
        }
    }
}
