//! Node identity and lifecycle state.
//!
//! A [`Node`] is configuration: where the ML worker lives, which models it
//! can serve and how many leases it takes. A [`NodeState`] is everything the
//! broker learns and decides about it at runtime. The registry stores the two
//! together as a [`NodeWithState`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_reconcile::{classify, AdminState, ConvergenceStatus, Intent, NodeStatus, PocStatus};
use serde::{Deserialize, Serialize};

/// Launch arguments for one model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArgs {
    #[serde(default)]
    pub args: Vec<String>,
}

/// Hardware installed on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hardware {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: u32,
}

/// Node configuration as supplied by the inventory file or an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub inference_segment: String,
    pub inference_port: u16,
    #[serde(default)]
    pub poc_segment: String,
    pub poc_port: u16,
    #[serde(default)]
    pub models: BTreeMap<String, ModelArgs>,
    pub max_concurrent: u32,
    #[serde(default)]
    pub hardware: Vec<Hardware>,
    #[serde(default)]
    pub version: Option<String>,
}

impl NodeConfig {
    /// Minimal configuration, handy for tests and admin tooling.
    pub fn new(id: impl Into<String>, host: impl Into<String>, max_concurrent: u32) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            inference_segment: String::new(),
            inference_port: 5000,
            poc_segment: String::new(),
            poc_port: 8080,
            models: BTreeMap::new(),
            max_concurrent,
            hardware: Vec::new(),
            version: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, args: Vec<String>) -> Self {
        self.models.insert(model.into(), ModelArgs { args });
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Reason this configuration cannot be registered, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("node id must not be empty".to_string());
        }
        if self.host.trim().is_empty() {
            return Err("node host must not be empty".to_string());
        }
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be at least 1".to_string());
        }
        Ok(())
    }
}

/// A registered node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub host: String,
    pub inference_segment: String,
    pub inference_port: u16,
    pub poc_segment: String,
    pub poc_port: u16,
    pub models: BTreeMap<String, ModelArgs>,
    pub max_concurrent: u32,
    pub hardware: Vec<Hardware>,
    pub version: Option<String>,
    /// Position in the fleet, assigned at registration starting from 1.
    pub node_num: u64,
}

impl Node {
    pub fn from_config(config: NodeConfig, node_num: u64) -> Self {
        Self {
            id: config.id,
            host: config.host,
            inference_segment: config.inference_segment,
            inference_port: config.inference_port,
            poc_segment: config.poc_segment,
            poc_port: config.poc_port,
            models: config.models,
            max_concurrent: config.max_concurrent,
            hardware: config.hardware,
            version: config.version,
            node_num,
        }
    }

    pub fn inference_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.host, self.inference_port, self.inference_segment
        )
    }

    pub fn poc_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.poc_port, self.poc_segment)
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    /// First model in id order together with its launch args.
    pub fn first_model(&self) -> Option<(&str, &[String])> {
        self.models
            .iter()
            .next()
            .map(|(name, args)| (name.as_str(), args.args.as_slice()))
    }
}

/// Distributed training task assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingTask {
    pub id: u64,
    pub master_node_addr: String,
    /// Rank of every participating node, keyed by node id.
    pub node_ranks: BTreeMap<String, u32>,
    pub world_size: u32,
}

/// Mutable runtime state of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub current_status: NodeStatus,
    pub intended_status: NodeStatus,
    pub poc_current_status: PocStatus,
    pub poc_intended_status: PocStatus,
    pub admin_state: AdminState,
    /// Empty while healthy.
    pub failure_reason: String,
    pub training_task: Option<TrainingTask>,
    /// Target of the command currently dispatched to the node, if any.
    pub reconcile_target: Option<Intent>,
    pub lock_count: u32,
    /// Time of the last accepted status observation.
    pub status_timestamp: DateTime<Utc>,
    pub last_state_change: DateTime<Utc>,
}

impl NodeState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            current_status: NodeStatus::Unknown,
            intended_status: NodeStatus::Unknown,
            poc_current_status: PocStatus::Idle,
            poc_intended_status: PocStatus::Idle,
            admin_state: AdminState::default(),
            failure_reason: String::new(),
            training_task: None,
            reconcile_target: None,
            lock_count: 0,
            status_timestamp: now,
            last_state_change: now,
        }
    }

    pub fn current(&self) -> Intent {
        Intent::new(self.current_status, self.poc_current_status)
    }

    pub fn intended(&self) -> Intent {
        Intent::new(self.intended_status, self.poc_intended_status)
    }

    /// Replace the intent, returning true if it changed.
    pub fn set_intended(&mut self, intent: Intent) -> bool {
        if self.intended() == intent {
            return false;
        }
        self.intended_status = intent.status;
        self.poc_intended_status = intent.poc_status;
        true
    }

    /// Record a newly observed status.
    pub fn update_status(&mut self, status: NodeStatus, at: DateTime<Utc>) {
        if self.current_status != status {
            self.last_state_change = at;
        }
        self.current_status = status;
        self.status_timestamp = at;
    }

    /// Mark the node failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.update_status(NodeStatus::Failed, Utc::now());
        self.failure_reason = reason.into();
    }

    /// True while a dispatched command has not reported back.
    pub fn is_reconciling(&self) -> bool {
        self.reconcile_target.is_some()
    }

    pub fn training_task_id(&self) -> Option<u64> {
        self.training_task.as_ref().map(|t| t.id)
    }

    pub fn convergence(&self) -> ConvergenceStatus {
        classify(self.current(), self.intended())
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}

/// A node paired with its state; the unit stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeWithState {
    pub node: Node,
    pub state: NodeState,
}

/// Outcome reported when a lease is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceOutcome {
    Success,
    Failure(String),
}

/// A timestamped status observation for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub node_id: String,
    pub prev_status: NodeStatus,
    pub new_status: NodeStatus,
    pub timestamp: DateTime<Utc>,
}

/// Request for an inference lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub model: String,
    /// Preferred node software version; other versions are used as fallback.
    pub version: Option<String>,
}

impl LockRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}
