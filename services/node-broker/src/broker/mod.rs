//! Node broker: registry and allocation authority.
//!
//! The broker owns every node's identity and state. It allocates nodes to
//! inference requests, applies operator overrides and status observations,
//! and drives nodes toward their intended mode through the work group.
//!
//! ## Locking
//!
//! All node state lives in one [`Registry`] behind a single `RwLock`.
//! Allocation is one write-locked section, so the candidate scan and the
//! lock count increment are atomic with respect to every other reader and
//! writer. No network call is made while the lock is held.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleet_reconcile::{EpochState, NodeStatus};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::client::{ClientFactory, MlNodeClient};
use crate::config::Config;
use crate::node::{
    InferenceOutcome, LockRequest, Node, NodeConfig, NodeState, NodeWithState, StatusUpdate,
};
use crate::phase::PhaseSource;
use crate::registry::{NodeMap, Registry};
use crate::worker::{NodeWorkGroup, NodeWorker, DEFAULT_QUEUE_CAPACITY};

mod commands;
mod lease;
mod reconcile;

pub use commands::{response_channel, BrokerCommand, Responder};
pub use lease::{lock_node, NodeLease};
pub use reconcile::ReconcileReport;

/// Broker errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The command's response channel has no buffering.
    #[error("response channel must be buffered")]
    UnbufferedResponse,

    /// No node with this id is registered.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A node with this id is already registered.
    #[error("node already registered: {0}")]
    DuplicateNode(String),

    /// The node configuration cannot be registered.
    #[error("invalid node configuration: {0}")]
    InvalidNode(String),

    /// No registered node can take the request right now.
    #[error("no nodes available")]
    NoNodesAvailable,
}

/// Settings the broker passes on to nodes.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Base URL of the API nodes post PoC batches to.
    pub callback_url: String,
    pub public_key: String,
    /// Participant address sent with training jobs.
    pub participant: String,
    pub worker_queue_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            callback_url: "http://127.0.0.1:9100".to_string(),
            public_key: String::new(),
            participant: String::new(),
            worker_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl From<&Config> for BrokerSettings {
    fn from(config: &Config) -> Self {
        Self {
            callback_url: config.callback_url.clone(),
            public_key: config.public_key.clone(),
            participant: config.participant.clone(),
            worker_queue_capacity: config.worker_queue_capacity,
        }
    }
}

/// Central authority over the node fleet.
pub struct Broker {
    registry: Arc<Registry>,
    work_group: NodeWorkGroup,
    client_factory: Arc<dyn ClientFactory>,
    phase_source: Arc<dyn PhaseSource>,
    settings: BrokerSettings,
    /// Last assigned node number.
    node_counter: AtomicU64,
    /// Held across the registry and work group steps of register/remove.
    membership: Mutex<()>,
    reconcile_trigger: Notify,
}

impl Broker {
    pub fn new(
        client_factory: Arc<dyn ClientFactory>,
        phase_source: Arc<dyn PhaseSource>,
        settings: BrokerSettings,
    ) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            work_group: NodeWorkGroup::new(),
            client_factory,
            phase_source,
            settings,
            node_counter: AtomicU64::new(0),
            membership: Mutex::new(()),
            reconcile_trigger: Notify::new(),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn work_group(&self) -> &NodeWorkGroup {
        &self.work_group
    }

    pub fn epoch_state(&self) -> EpochState {
        self.phase_source.current_epoch_state()
    }

    /// Build a client for talking to `node` directly.
    pub fn new_node_client(&self, node: &Node) -> Arc<dyn MlNodeClient> {
        self.client_factory
            .create_client(&node.poc_url(), &node.inference_url())
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Register a node and start its worker.
    pub async fn register_node(&self, config: NodeConfig) -> Result<NodeWithState, BrokerError> {
        config.validate().map_err(BrokerError::InvalidNode)?;
        let _membership = self.membership.lock().await;

        let entry = {
            let mut nodes = self.registry.write().await;
            if nodes.contains_key(&config.id) {
                return Err(BrokerError::DuplicateNode(config.id));
            }
            let node_num = self.node_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let entry = NodeWithState {
                node: Node::from_config(config, node_num),
                state: NodeState::new(),
            };
            nodes.insert(entry.node.id.clone(), entry.clone());
            entry
        };

        let client = self.new_node_client(&entry.node);
        let worker = NodeWorker::spawn(
            entry.node.id.clone(),
            client,
            Arc::clone(&self.registry),
            self.settings.worker_queue_capacity,
        );
        self.work_group.add_worker(worker).await;

        info!(
            node_id = %entry.node.id,
            node_num = entry.node.node_num,
            host = %entry.node.host,
            models = entry.node.models.len(),
            "Registered node"
        );
        Ok(entry)
    }

    /// Drain the node's worker and delete it. Returns false if unknown.
    pub async fn remove_node(&self, node_id: &str) -> bool {
        let _membership = self.membership.lock().await;
        if !self.registry.read().await.contains_key(node_id) {
            debug!(node_id = %node_id, "Remove requested for unknown node");
            return false;
        }

        self.work_group.remove_worker(node_id).await;
        let removed = self.registry.write().await.remove(node_id).is_some();
        if removed {
            info!(node_id = %node_id, "Removed node");
        }
        removed
    }

    /// Snapshot of every node, sorted by id.
    pub async fn list_nodes(&self) -> Vec<NodeWithState> {
        self.registry.snapshot_all().await
    }

    pub async fn get_node(&self, node_id: &str) -> Option<NodeWithState> {
        self.registry.snapshot(node_id).await
    }

    pub async fn node_count(&self) -> usize {
        self.registry.len().await
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Lease the least-loaded node that can serve `request`.
    ///
    /// When a version is requested and no node runs it, any version is
    /// accepted.
    pub async fn lock_available_node(&self, request: &LockRequest) -> Option<Node> {
        let epoch = self.phase_source.current_epoch_state();
        let mut nodes = self.registry.write().await;

        let chosen = select_node(&nodes, request, &epoch, request.version.as_deref()).or_else(|| {
            request.version.as_ref().and_then(|version| {
                debug!(
                    model = %request.model,
                    version = %version,
                    "No node on requested version, accepting any version"
                );
                select_node(&nodes, request, &epoch, None)
            })
        });

        let Some(node_id) = chosen else {
            debug!(model = %request.model, "No node available");
            return None;
        };

        let entry = nodes.get_mut(&node_id)?;
        entry.state.lock_count += 1;
        debug!(
            node_id = %node_id,
            model = %request.model,
            lock_count = entry.state.lock_count,
            "Locked node"
        );
        Some(entry.node.clone())
    }

    /// Return a lease. A failure outcome marks the node failed.
    pub async fn release_node(&self, node_id: &str, outcome: InferenceOutcome) -> bool {
        let mut nodes = self.registry.write().await;
        let Some(entry) = nodes.get_mut(node_id) else {
            warn!(node_id = %node_id, "Release requested for unknown node");
            return false;
        };

        entry.state.lock_count = entry.state.lock_count.saturating_sub(1);
        if let InferenceOutcome::Failure(reason) = outcome {
            error!(node_id = %node_id, reason = %reason, "Inference failed on node");
            entry.state.fail(reason);
        }
        debug!(
            node_id = %node_id,
            lock_count = entry.state.lock_count,
            "Released node"
        );
        true
    }

    // =========================================================================
    // Overrides and observations
    // =========================================================================

    /// Set the operator override for a node as of `epoch`.
    pub async fn set_node_admin_state(
        &self,
        node_id: &str,
        enabled: bool,
        epoch: u64,
    ) -> Result<(), BrokerError> {
        let mut nodes = self.registry.write().await;
        let entry = nodes
            .get_mut(node_id)
            .ok_or_else(|| BrokerError::NodeNotFound(node_id.to_string()))?;
        entry.state.admin_state.enabled = enabled;
        entry.state.admin_state.epoch = epoch;
        info!(node_id = %node_id, enabled, epoch, "Updated node admin state");
        Ok(())
    }

    /// Apply status observations, skipping stale ones. Returns how many applied.
    pub async fn set_nodes_actual_status(&self, updates: Vec<StatusUpdate>) -> usize {
        let mut nodes = self.registry.write().await;
        let mut applied = 0;

        for update in updates {
            let Some(entry) = nodes.get_mut(&update.node_id) else {
                error!(node_id = %update.node_id, "Cannot set status: node not found");
                continue;
            };
            if entry.state.status_timestamp > update.timestamp {
                debug!(node_id = %update.node_id, "Skipping status update older than current");
                continue;
            }
            entry.state.update_status(update.new_status, update.timestamp);
            if update.new_status != NodeStatus::Failed {
                entry.state.failure_reason.clear();
            }
            info!(
                node_id = %update.node_id,
                prev_status = %update.prev_status,
                status = %update.new_status,
                "Set actual status for node"
            );
            applied += 1;
        }

        applied
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Ask the reconcile loop to run a pass now.
    pub fn trigger_reconciliation(&self) {
        self.reconcile_trigger.notify_one();
    }

    /// Resolves once a reconciliation pass has been requested.
    pub async fn reconciliation_requested(&self) {
        self.reconcile_trigger.notified().await;
    }

    /// Drain and stop every node worker.
    pub async fn shutdown(&self) {
        info!("Shutting down node broker");
        self.work_group.shutdown_all().await;
    }
}

fn select_node(
    nodes: &NodeMap,
    request: &LockRequest,
    epoch: &EpochState,
    version: Option<&str>,
) -> Option<String> {
    nodes
        .values()
        .filter(|entry| is_available(entry, request, epoch, version))
        .min_by_key(|entry| entry.state.lock_count)
        .map(|entry| entry.node.id.clone())
}

fn is_available(
    entry: &NodeWithState,
    request: &LockRequest,
    epoch: &EpochState,
    version: Option<&str>,
) -> bool {
    let state = &entry.state;
    state.current_status.serves_inference()
        && state.intended_status.serves_inference()
        && !state.is_reconciling()
        && state.lock_count < entry.node.max_concurrent
        && state
            .admin_state
            .should_be_operational(epoch.epoch, epoch.phase)
        && version.is_none_or(|v| entry.node.version.as_deref() == Some(v))
        && entry.node.supports_model(&request.model)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use fleet_reconcile::{EpochPhase, FleetMode};

    use super::*;
    use crate::client::mock::MockClientFactory;
    use crate::phase::StaticPhaseSource;

    fn broker() -> Broker {
        Broker::new(
            Arc::new(MockClientFactory::new()),
            Arc::new(StaticPhaseSource::new(EpochState::new(1, EpochPhase::Inference))),
            BrokerSettings::default(),
        )
    }

    fn node(id: &str, max: u32) -> NodeConfig {
        NodeConfig::new(id, format!("{id}.local"), max).with_model("m1", vec![])
    }

    #[tokio::test]
    async fn test_register_assigns_node_numbers() {
        let broker = broker();
        let a = broker.register_node(node("a", 1)).await.unwrap();
        let b = broker.register_node(node("b", 1)).await.unwrap();

        assert_eq!(a.node.node_num, 1);
        assert_eq!(b.node.node_num, 2);
        assert_eq!(a.state.current_status, NodeStatus::Unknown);
        assert!(a.state.admin_state.enabled);
        assert_eq!(broker.work_group().len().await, 2);
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_invalid() {
        let broker = broker();
        broker.register_node(node("a", 1)).await.unwrap();

        assert_eq!(
            broker.register_node(node("a", 1)).await.unwrap_err(),
            BrokerError::DuplicateNode("a".to_string())
        );
        assert!(matches!(
            broker.register_node(node("b", 0)).await,
            Err(BrokerError::InvalidNode(_))
        ));
        assert_eq!(broker.node_count().await, 1);
    }

    #[tokio::test]
    async fn test_release_failure_marks_node_failed() {
        let broker = broker();
        broker.register_node(node("a", 2)).await.unwrap();

        broker.lock_available_node(&LockRequest::new("m1")).await.unwrap();
        assert!(
            broker
                .release_node("a", InferenceOutcome::Failure("timeout".to_string()))
                .await
        );

        let a = broker.get_node("a").await.unwrap();
        assert_eq!(a.state.lock_count, 0);
        assert_eq!(a.state.current_status, NodeStatus::Failed);
        assert_eq!(a.state.failure_reason, "timeout");

        // Failed nodes are not handed out.
        assert!(broker.lock_available_node(&LockRequest::new("m1")).await.is_none());
        assert!(!broker.release_node("missing", InferenceOutcome::Success).await);
    }

    #[tokio::test]
    async fn test_release_never_underflows() {
        let broker = broker();
        broker.register_node(node("a", 1)).await.unwrap();
        assert!(broker.release_node("a", InferenceOutcome::Success).await);
        assert_eq!(broker.get_node("a").await.unwrap().state.lock_count, 0);
    }

    #[tokio::test]
    async fn test_set_admin_state_unknown_node() {
        let broker = broker();
        assert_eq!(
            broker.set_node_admin_state("ghost", false, 3).await,
            Err(BrokerError::NodeNotFound("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_observed_recovery_clears_failure_reason() {
        let broker = broker();
        broker.register_node(node("a", 1)).await.unwrap();
        broker
            .release_node("a", InferenceOutcome::Failure("timeout".to_string()))
            .await;
        assert_eq!(broker.get_node("a").await.unwrap().state.failure_reason, "timeout");

        let still_failed = StatusUpdate {
            node_id: "a".to_string(),
            prev_status: NodeStatus::Failed,
            new_status: NodeStatus::Failed,
            timestamp: Utc::now() + ChronoDuration::seconds(1),
        };
        broker.set_nodes_actual_status(vec![still_failed]).await;
        assert_eq!(broker.get_node("a").await.unwrap().state.failure_reason, "timeout");

        let recovered = StatusUpdate {
            node_id: "a".to_string(),
            prev_status: NodeStatus::Failed,
            new_status: NodeStatus::Inference,
            timestamp: Utc::now() + ChronoDuration::seconds(2),
        };
        assert_eq!(broker.set_nodes_actual_status(vec![recovered]).await, 1);

        let state = broker.get_node("a").await.unwrap().state;
        assert_eq!(state.current_status, NodeStatus::Inference);
        assert!(state.failure_reason.is_empty());
    }

    #[tokio::test]
    async fn test_reconciling_node_not_allocated() {
        let broker = broker();
        broker.register_node(node("a", 2)).await.unwrap();
        broker.registry.write().await.get_mut("a").unwrap().state.reconcile_target =
            Some(FleetMode::Inference.target());

        assert!(broker.lock_available_node(&LockRequest::new("m1")).await.is_none());

        broker.registry.write().await.get_mut("a").unwrap().state.reconcile_target = None;
        assert!(broker.lock_available_node(&LockRequest::new("m1")).await.is_some());
    }

    #[tokio::test]
    async fn test_stale_status_updates_are_ignored() {
        let broker = broker();
        broker.register_node(node("a", 1)).await.unwrap();
        let registered_at = broker.get_node("a").await.unwrap().state.status_timestamp;

        let stale = StatusUpdate {
            node_id: "a".to_string(),
            prev_status: NodeStatus::Unknown,
            new_status: NodeStatus::Stopped,
            timestamp: registered_at - ChronoDuration::seconds(10),
        };
        let fresh = StatusUpdate {
            node_id: "a".to_string(),
            prev_status: NodeStatus::Unknown,
            new_status: NodeStatus::Inference,
            timestamp: Utc::now() + ChronoDuration::seconds(1),
        };
        let unknown = StatusUpdate {
            node_id: "nope".to_string(),
            ..fresh.clone()
        };

        assert_eq!(broker.set_nodes_actual_status(vec![stale]).await, 0);
        assert_eq!(
            broker.get_node("a").await.unwrap().state.current_status,
            NodeStatus::Unknown
        );

        assert_eq!(broker.set_nodes_actual_status(vec![fresh, unknown]).await, 1);
        assert_eq!(
            broker.get_node("a").await.unwrap().state.current_status,
            NodeStatus::Inference
        );
    }
}
