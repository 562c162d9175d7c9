//! Periodic probing of every node's actual runtime mode.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_reconcile::NodeStatus;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::client::MlNodeClient;
use crate::node::{NodeWithState, StatusUpdate};

/// Polls nodes and feeds observed status back into the broker.
pub struct StatusMonitor {
    broker: Arc<Broker>,
    interval: Duration,
}

impl StatusMonitor {
    pub fn new(broker: Arc<Broker>, interval: Duration) -> Self {
        Self { broker, interval }
    }

    /// Poll until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.interval.as_secs(),
            "Starting status monitor"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Status monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every node once and apply the changes. Returns how many applied.
    pub async fn poll_once(&self) -> usize {
        let nodes = self.broker.list_nodes().await;
        let mut updates = Vec::new();

        for entry in nodes {
            let client = self.broker.new_node_client(&entry.node);
            match probe(client.as_ref()).await {
                Ok(status) => {
                    if let Some(update) = observation(&entry, status) {
                        updates.push(update);
                    }
                }
                Err(e) => {
                    warn!(node_id = %entry.node.id, error = %e, "Failed to probe node status");
                }
            }
        }

        if updates.is_empty() {
            debug!("No node status changes observed");
            return 0;
        }

        self.broker.set_nodes_actual_status(updates).await
    }
}

/// Observed status of one node. An unhealthy inference server counts as failed.
async fn probe(client: &dyn MlNodeClient) -> anyhow::Result<NodeStatus> {
    let status = NodeStatus::from(client.node_state().await?);
    if status != NodeStatus::Inference {
        return Ok(status);
    }

    match client.inference_health().await {
        Ok(true) => Ok(NodeStatus::Inference),
        Ok(false) => Ok(NodeStatus::Failed),
        Err(e) => {
            debug!(error = %e, "Inference health check failed");
            Ok(NodeStatus::Failed)
        }
    }
}

fn observation(entry: &NodeWithState, status: NodeStatus) -> Option<StatusUpdate> {
    if entry.state.current_status == status {
        return None;
    }
    Some(StatusUpdate {
        node_id: entry.node.id.clone(),
        prev_status: entry.state.current_status,
        new_status: status,
        timestamp: Utc::now(),
    })
}
