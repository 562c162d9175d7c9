//! Fan-out of commands across node workers.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{NodeWorker, NodeWorkerCommand};

/// Result of submitting one command to several workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutStats {
    /// Workers that accepted the command.
    pub submitted: usize,
    /// Workers that rejected it, or ids with no worker.
    pub failed: usize,
    /// Node ids counted in `failed`.
    pub rejected: Vec<String>,
}

/// Registry of node workers keyed by node id.
#[derive(Default)]
pub struct NodeWorkGroup {
    workers: RwLock<HashMap<String, Arc<NodeWorker>>>,
}

impl NodeWorkGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, shutting down any worker it replaces.
    pub async fn add_worker(&self, worker: Arc<NodeWorker>) {
        let node_id = worker.node_id().to_string();
        let replaced = self.workers.write().await.insert(node_id.clone(), worker);
        if let Some(old) = replaced {
            warn!(node_id = %node_id, "Replacing existing node worker");
            old.shutdown().await;
        }
    }

    /// Remove and drain a worker. Returns false if there was none.
    pub async fn remove_worker(&self, node_id: &str) -> bool {
        let removed = self.workers.write().await.remove(node_id);
        match removed {
            Some(worker) => {
                worker.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn get_worker(&self, node_id: &str) -> Option<Arc<NodeWorker>> {
        self.workers.read().await.get(node_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    /// Submit `cmd` to every worker and wait for all of them to go idle.
    pub async fn execute_on_all(&self, cmd: NodeWorkerCommand) -> FanOutStats {
        let workers: Vec<_> = self.workers.read().await.values().cloned().collect();
        let mut stats = FanOutStats::default();
        let accepted = submit_all(&workers, &cmd, &mut stats);
        wait_all(&accepted).await;
        info!(
            command = cmd.name(),
            submitted = stats.submitted,
            failed = stats.failed,
            "Executed command on all nodes"
        );
        stats
    }

    /// Submit `cmd` to the workers of `node_ids` and wait for them to go idle.
    pub async fn execute_on_nodes(&self, node_ids: &[String], cmd: NodeWorkerCommand) -> FanOutStats {
        let mut stats = FanOutStats::default();
        let workers: Vec<_> = {
            let all = self.workers.read().await;
            node_ids
                .iter()
                .filter_map(|id| {
                    let worker = all.get(id).cloned();
                    if worker.is_none() {
                        warn!(node_id = %id, "No worker for node");
                        stats.failed += 1;
                        stats.rejected.push(id.clone());
                    }
                    worker
                })
                .collect()
        };
        let accepted = submit_all(&workers, &cmd, &mut stats);
        wait_all(&accepted).await;
        debug!(
            command = cmd.name(),
            submitted = stats.submitted,
            failed = stats.failed,
            "Executed command on nodes"
        );
        stats
    }

    /// Drain and stop every worker.
    pub async fn shutdown_all(&self) {
        let workers: Vec<_> = self.workers.write().await.drain().map(|(_, w)| w).collect();
        join_all(workers.iter().map(|w| w.shutdown())).await;
        info!(count = workers.len(), "All node workers stopped");
    }
}

fn submit_all(
    workers: &[Arc<NodeWorker>],
    cmd: &NodeWorkerCommand,
    stats: &mut FanOutStats,
) -> Vec<Arc<NodeWorker>> {
    let mut accepted = Vec::with_capacity(workers.len());
    for worker in workers {
        if worker.submit(cmd.clone()) {
            stats.submitted += 1;
            accepted.push(Arc::clone(worker));
        } else {
            stats.failed += 1;
            stats.rejected.push(worker.node_id().to_string());
        }
    }
    accepted
}

async fn wait_all(workers: &[Arc<NodeWorker>]) {
    join_all(workers.iter().map(|w| w.wait_idle())).await;
}
