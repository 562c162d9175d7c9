//! Lifecycle commands a node worker executes against its ML node.
//!
//! Commands probe the node before doing anything disruptive and succeed
//! without side effects when the node is already where they would put it.
//! Errors are reported through [`NodeResult`], never returned.

use fleet_reconcile::{FleetMode, Intent, NodeStatus, PocStatus};
use tracing::{debug, error, info};

use crate::client::{InitDto, MlNodeClient, MlNodeState, PowState, StartTrainingRequest};
use crate::node::{Node, TrainingTask};

/// Block and callback data needed to initialize PoC on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PocParams {
    pub block_height: u64,
    pub block_hash: String,
    pub public_key: String,
    /// Full URL batches are posted to.
    pub callback_url: String,
    pub total_nodes: u64,
}

impl PocParams {
    fn init_dto(&self, node: &Node) -> InitDto {
        InitDto::build(
            self.block_height,
            &self.block_hash,
            &self.public_key,
            node.node_num,
            self.total_nodes,
            &self.callback_url,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingParams {
    pub task: TrainingTask,
    pub participant: String,
}

/// Command executed by a node worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeWorkerCommand {
    Stop,
    StartPoc(PocParams),
    InitValidate(PocParams),
    InferenceUp,
    StartTraining(TrainingParams),
    NoOp { message: String },
}

/// Outcome of one worker command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeResult {
    pub succeeded: bool,
    /// Status the node ended in; `None` leaves the recorded status alone.
    pub final_status: Option<NodeStatus>,
    pub final_poc_status: Option<PocStatus>,
    /// Target the command was built for. Results whose target no longer
    /// matches the node's in-flight target are discarded.
    pub original_target: Option<Intent>,
    pub error: Option<String>,
}

impl NodeResult {
    pub fn success(target: Intent) -> Self {
        Self {
            succeeded: true,
            final_status: Some(target.status),
            final_poc_status: Some(target.poc_status),
            original_target: Some(target),
            error: None,
        }
    }

    pub fn failure(target: Intent, error: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            final_status: Some(NodeStatus::Failed),
            final_poc_status: None,
            original_target: Some(target),
            error: Some(error.into()),
        }
    }

    fn unchanged() -> Self {
        Self {
            succeeded: true,
            final_status: None,
            final_poc_status: None,
            original_target: None,
            error: None,
        }
    }
}

impl NodeWorkerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::StartPoc(_) => "start_poc",
            Self::InitValidate(_) => "init_validate",
            Self::InferenceUp => "inference_up",
            Self::StartTraining(_) => "start_training",
            Self::NoOp { .. } => "noop",
        }
    }

    /// Run the command against `node` through `client`.
    pub async fn execute(&self, node: &Node, client: &dyn MlNodeClient) -> NodeResult {
        match self {
            Self::Stop => stop(node, client).await,
            Self::StartPoc(params) => start_poc(node, client, params).await,
            Self::InitValidate(params) => init_validate(node, client, params).await,
            Self::InferenceUp => inference_up(node, client).await,
            Self::StartTraining(params) => start_training(node, client, params).await,
            Self::NoOp { message } => {
                if !message.is_empty() {
                    debug!(node_id = %node.id, "{}", message);
                }
                NodeResult::unchanged()
            }
        }
    }
}

async fn stop(node: &Node, client: &dyn MlNodeClient) -> NodeResult {
    let target = Intent::stopped();
    if let Ok(MlNodeState::Stopped) = client.node_state().await {
        debug!(node_id = %node.id, "Node already stopped");
        return NodeResult::success(target);
    }

    match client.stop().await {
        Ok(()) => NodeResult::success(target),
        Err(e) => {
            error!(node_id = %node.id, error = %e, "Failed to stop node");
            NodeResult::failure(target, e.to_string())
        }
    }
}

async fn start_poc(node: &Node, client: &dyn MlNodeClient, params: &PocParams) -> NodeResult {
    let target = FleetMode::PocGenerate.target();
    if let Ok(status) = client.pow_status().await {
        if status.status == PowState::Generating {
            info!(node_id = %node.id, "Node already generating PoC");
            return NodeResult::success(target);
        }
    }

    let needs_stop = !matches!(client.node_state().await, Ok(MlNodeState::Stopped));
    if needs_stop {
        if let Err(e) = client.stop().await {
            error!(node_id = %node.id, error = %e, "Failed to stop node for PoC");
            return NodeResult::failure(target, e.to_string());
        }
    }

    match client.init_generate(&params.init_dto(node)).await {
        Ok(()) => {
            info!(
                node_id = %node.id,
                block_height = params.block_height,
                "Started PoC generation on node"
            );
            NodeResult::success(target)
        }
        Err(e) => {
            error!(node_id = %node.id, error = %e, "Failed to start PoC");
            NodeResult::failure(target, e.to_string())
        }
    }
}

async fn init_validate(node: &Node, client: &dyn MlNodeClient, params: &PocParams) -> NodeResult {
    let target = FleetMode::PocValidate.target();
    if let Ok(status) = client.pow_status().await {
        if status.status == PowState::Validating {
            info!(node_id = %node.id, "Node already validating PoC");
            return NodeResult::success(target);
        }
    }

    match client.init_validate(&params.init_dto(node)).await {
        Ok(()) => {
            info!(node_id = %node.id, "Moved node to PoC validation");
            NodeResult::success(target)
        }
        Err(e) => {
            error!(node_id = %node.id, error = %e, "Failed to init PoC validation");
            NodeResult::failure(target, e.to_string())
        }
    }
}

async fn inference_up(node: &Node, client: &dyn MlNodeClient) -> NodeResult {
    let target = FleetMode::Inference.target();
    if let Ok(MlNodeState::Inference) = client.node_state().await {
        if let Ok(true) = client.inference_health().await {
            info!(node_id = %node.id, "Node already serving inference");
            return NodeResult::success(target);
        }
    }

    let Some((model, args)) = node.first_model() else {
        error!(node_id = %node.id, "No models configured for inference");
        return NodeResult::failure(target, "no models configured");
    };

    if let Err(e) = client.stop().await {
        error!(node_id = %node.id, error = %e, "Failed to stop node for inference up");
        return NodeResult::failure(target, e.to_string());
    }

    match client.inference_up(model, args).await {
        Ok(()) => {
            info!(node_id = %node.id, model = %model, "Brought up inference on node");
            NodeResult::success(target)
        }
        Err(e) => {
            error!(node_id = %node.id, model = %model, error = %e, "Failed to bring up inference");
            NodeResult::failure(target, e.to_string())
        }
    }
}

async fn start_training(
    node: &Node,
    client: &dyn MlNodeClient,
    params: &TrainingParams,
) -> NodeResult {
    let target = FleetMode::Training.target();
    let task = &params.task;
    let Some(&rank) = task.node_ranks.get(&node.id) else {
        error!(node_id = %node.id, task_id = task.id, "No training rank for node");
        return NodeResult::failure(target, "rank not found for node");
    };

    if let Err(e) = client.stop().await {
        error!(node_id = %node.id, error = %e, "Failed to stop node for training");
        return NodeResult::failure(target, e.to_string());
    }

    let request = StartTrainingRequest {
        task_id: task.id,
        participant: params.participant.clone(),
        node_id: node.id.clone(),
        master_addr: task.master_node_addr.clone(),
        rank,
        world_size: task.world_size,
    };

    match client.start_training(&request).await {
        Ok(()) => {
            info!(node_id = %node.id, task_id = task.id, rank, "Started training on node");
            NodeResult::success(target)
        }
        Err(e) => {
            error!(node_id = %node.id, task_id = task.id, error = %e, "Failed to start training");
            NodeResult::failure(target, e.to_string())
        }
    }
}
