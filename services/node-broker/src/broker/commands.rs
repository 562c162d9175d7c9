//! Typed command interface to the broker.
//!
//! Callers that talk to the broker by message rather than by method call
//! submit a [`BrokerCommand`] carrying a [`Responder`]. The broker answers
//! with a non-blocking send, so every responder must declare buffering
//! capacity; commands without it are rejected before they run.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Broker, BrokerError, ReconcileReport};
use crate::node::{
    InferenceOutcome, LockRequest, Node, NodeConfig, NodeWithState, StatusUpdate, TrainingTask,
};

/// Sending half of a command's response channel.
#[derive(Debug)]
pub struct Responder<T> {
    tx: mpsc::Sender<T>,
    capacity: usize,
}

/// Create a response channel that buffers `capacity` responses.
///
/// A zero capacity is accepted here so the broker can reject it; such a
/// channel still has room for one message internally.
pub fn response_channel<T>(capacity: usize) -> (Responder<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Responder { tx, capacity }, rx)
}

impl<T> Responder<T> {
    /// Declared buffering capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deliver a response without waiting for the receiver.
    pub fn respond(&self, command: &'static str, value: T) {
        match self.tx.try_send(value) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(command, "Response channel full, dropping response");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(command, "Response channel closed, dropping response");
            }
        }
    }
}

/// Command accepted by [`Broker::queue_message`].
#[derive(Debug)]
pub enum BrokerCommand {
    LockNode {
        request: LockRequest,
        respond: Responder<Option<Node>>,
    },
    ReleaseNode {
        node_id: String,
        outcome: InferenceOutcome,
        respond: Responder<bool>,
    },
    RegisterNode {
        config: NodeConfig,
        respond: Responder<Result<NodeWithState, BrokerError>>,
    },
    RemoveNode {
        node_id: String,
        respond: Responder<bool>,
    },
    ListNodes {
        respond: Responder<Vec<NodeWithState>>,
    },
    SetAdminState {
        node_id: String,
        enabled: bool,
        epoch: u64,
        respond: Responder<Result<(), BrokerError>>,
    },
    StartPocAll {
        respond: Responder<ReconcileReport>,
    },
    StartValidationAll {
        respond: Responder<ReconcileReport>,
    },
    InferenceUpAll {
        respond: Responder<ReconcileReport>,
    },
    StartTraining {
        task: TrainingTask,
        respond: Responder<ReconcileReport>,
    },
    SetNodesActualStatus {
        updates: Vec<StatusUpdate>,
        respond: Responder<usize>,
    },
}

impl BrokerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LockNode { .. } => "lock_node",
            Self::ReleaseNode { .. } => "release_node",
            Self::RegisterNode { .. } => "register_node",
            Self::RemoveNode { .. } => "remove_node",
            Self::ListNodes { .. } => "list_nodes",
            Self::SetAdminState { .. } => "set_admin_state",
            Self::StartPocAll { .. } => "start_poc_all",
            Self::StartValidationAll { .. } => "start_validation_all",
            Self::InferenceUpAll { .. } => "inference_up_all",
            Self::StartTraining { .. } => "start_training",
            Self::SetNodesActualStatus { .. } => "set_nodes_actual_status",
        }
    }

    /// Declared capacity of the command's response channel.
    pub fn response_capacity(&self) -> usize {
        match self {
            Self::LockNode { respond, .. } => respond.capacity(),
            Self::ReleaseNode { respond, .. } => respond.capacity(),
            Self::RegisterNode { respond, .. } => respond.capacity(),
            Self::RemoveNode { respond, .. } => respond.capacity(),
            Self::ListNodes { respond } => respond.capacity(),
            Self::SetAdminState { respond, .. } => respond.capacity(),
            Self::StartPocAll { respond } => respond.capacity(),
            Self::StartValidationAll { respond } => respond.capacity(),
            Self::InferenceUpAll { respond } => respond.capacity(),
            Self::StartTraining { respond, .. } => respond.capacity(),
            Self::SetNodesActualStatus { respond, .. } => respond.capacity(),
        }
    }
}

impl Broker {
    /// Run a command and answer on its response channel.
    ///
    /// Fails synchronously with [`BrokerError::UnbufferedResponse`] when the
    /// response channel has no buffering; the command is not run.
    pub async fn queue_message(&self, command: BrokerCommand) -> Result<(), BrokerError> {
        let name = command.name();
        if command.response_capacity() == 0 {
            warn!(command = name, "Rejecting command with unbuffered response channel");
            return Err(BrokerError::UnbufferedResponse);
        }

        debug!(command = name, "Executing broker command");

        match command {
            BrokerCommand::LockNode { request, respond } => {
                respond.respond(name, self.lock_available_node(&request).await);
            }
            BrokerCommand::ReleaseNode {
                node_id,
                outcome,
                respond,
            } => {
                respond.respond(name, self.release_node(&node_id, outcome).await);
            }
            BrokerCommand::RegisterNode { config, respond } => {
                respond.respond(name, self.register_node(config).await);
            }
            BrokerCommand::RemoveNode { node_id, respond } => {
                respond.respond(name, self.remove_node(&node_id).await);
            }
            BrokerCommand::ListNodes { respond } => {
                respond.respond(name, self.list_nodes().await);
            }
            BrokerCommand::SetAdminState {
                node_id,
                enabled,
                epoch,
                respond,
            } => {
                respond.respond(
                    name,
                    self.set_node_admin_state(&node_id, enabled, epoch).await,
                );
            }
            BrokerCommand::StartPocAll { respond } => {
                respond.respond(name, self.start_poc_all().await);
            }
            BrokerCommand::StartValidationAll { respond } => {
                respond.respond(name, self.start_validation_all().await);
            }
            BrokerCommand::InferenceUpAll { respond } => {
                respond.respond(name, self.inference_up_all().await);
            }
            BrokerCommand::StartTraining { task, respond } => {
                respond.respond(name, self.start_training(task).await);
            }
            BrokerCommand::SetNodesActualStatus { updates, respond } => {
                respond.respond(name, self.set_nodes_actual_status(updates).await);
            }
        }

        Ok(())
    }
}
