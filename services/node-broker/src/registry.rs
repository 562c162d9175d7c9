//! Lock-guarded node registry.
//!
//! All reads and writes of node state go through one `RwLock`. Nothing here
//! performs network I/O, so the lock is never held across a remote call.

use std::collections::BTreeMap;

use chrono::Utc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::node::NodeWithState;
use crate::worker::NodeResult;

pub type NodeMap = BTreeMap<String, NodeWithState>;

/// Registry of nodes keyed by id.
#[derive(Debug, Default)]
pub struct Registry {
    nodes: RwLock<NodeMap>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, NodeMap> {
        self.nodes.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, NodeMap> {
        self.nodes.write().await
    }

    /// Copy of one node, detached from the registry.
    pub async fn snapshot(&self, node_id: &str) -> Option<NodeWithState> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// Copy of every node, sorted by id.
    pub async fn snapshot_all(&self) -> Vec<NodeWithState> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Record the outcome of a worker command on the node.
    ///
    /// A result only lands if its target is the node's in-flight target;
    /// anything else is stale and dropped. Returns whether it was applied.
    pub async fn apply_result(&self, node_id: &str, result: &NodeResult) -> bool {
        let Some(target) = result.original_target else {
            return false;
        };

        let mut nodes = self.nodes.write().await;
        let Some(entry) = nodes.get_mut(node_id) else {
            warn!(node_id = %node_id, "Dropping command result for unknown node");
            return false;
        };

        let in_flight = entry.state.reconcile_target;
        if !in_flight.is_some_and(|t| t.same_target(&target)) {
            info!(
                node_id = %node_id,
                original_target = %target.status,
                original_poc_target = %target.poc_status,
                reconciling = ?in_flight,
                "Ignoring stale command result"
            );
            return false;
        }
        entry.state.reconcile_target = None;

        if result.succeeded {
            if let Some(status) = result.final_status {
                entry.state.update_status(status, Utc::now());
            }
            if let Some(poc_status) = result.final_poc_status {
                entry.state.poc_current_status = poc_status;
            }
            entry.state.failure_reason.clear();
            debug!(
                node_id = %node_id,
                status = %entry.state.current_status,
                "Applied command result"
            );
        } else {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| "command failed".to_string());
            warn!(node_id = %node_id, error = %reason, "Node command failed");
            entry.state.fail(reason);
        }
        true
    }
}
