//! Per-node workers.
//!
//! Each registered node gets one [`NodeWorker`]: a task that owns a bounded
//! command queue and the node's client, and runs commands strictly one at a
//! time. [`NodeWorkGroup`] fans commands out across workers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::MlNodeClient;
use crate::registry::Registry;

mod commands;
mod group;

pub use commands::{NodeResult, NodeWorkerCommand, PocParams, TrainingParams};
pub use group::{FanOutStats, NodeWorkGroup};

/// Default per-node command queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Reasons a command was not accepted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The command queue is at capacity.
    #[error("queue full")]
    QueueFull,

    /// The worker is shutting down or has stopped.
    #[error("worker stopped")]
    Stopped,
}

/// Serialized command executor for a single node.
pub struct NodeWorker {
    node_id: String,
    tx: mpsc::Sender<NodeWorkerCommand>,
    /// Commands accepted but not yet finished.
    pending: Arc<watch::Sender<usize>>,
    accepting: AtomicBool,
    processed: Arc<AtomicU64>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeWorker {
    /// Spawn a worker for `node_id` on the current runtime.
    pub fn spawn(
        node_id: impl Into<String>,
        client: Arc<dyn MlNodeClient>,
        registry: Arc<Registry>,
        capacity: usize,
    ) -> Arc<Self> {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (pending, _) = watch::channel(0usize);
        let pending = Arc::new(pending);
        let processed = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            WorkerLoop {
                node_id: node_id.clone(),
                client,
                registry,
                pending: Arc::clone(&pending),
                processed: Arc::clone(&processed),
            },
            rx,
            stop_rx,
        ));

        debug!(node_id = %node_id, capacity, "Node worker started");

        Arc::new(Self {
            node_id,
            tx,
            pending,
            accepting: AtomicBool::new(true),
            processed,
            stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Queue a command without blocking.
    pub fn try_submit(&self, cmd: NodeWorkerCommand) -> Result<(), SubmitError> {
        self.pending.send_modify(|n| *n += 1);

        if !self.accepting.load(Ordering::SeqCst) {
            self.release_pending();
            return Err(SubmitError::Stopped);
        }

        self.tx.try_send(cmd).map_err(|e| {
            self.release_pending();
            match e {
                mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SubmitError::Stopped,
            }
        })
    }

    /// Queue a command without blocking, returning false if it was rejected.
    pub fn submit(&self, cmd: NodeWorkerCommand) -> bool {
        match self.try_submit(cmd) {
            Ok(()) => true,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "Command rejected");
                false
            }
        }
    }

    fn release_pending(&self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Number of accepted commands not yet finished.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Number of commands executed so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Wait until every accepted command has finished.
    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop accepting, run everything already queued, then stop the task.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.wait_idle().await;
        let _ = self.stop_tx.send(true);

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(node_id = %self.node_id, error = %e, "Node worker task panicked");
            }
        }

        info!(
            node_id = %self.node_id,
            processed = self.processed(),
            "Node worker stopped"
        );
    }
}

struct WorkerLoop {
    node_id: String,
    client: Arc<dyn MlNodeClient>,
    registry: Arc<Registry>,
    pending: Arc<watch::Sender<usize>>,
    processed: Arc<AtomicU64>,
}

impl WorkerLoop {
    async fn handle(&self, cmd: NodeWorkerCommand) {
        match self.registry.snapshot(&self.node_id).await {
            Some(snapshot) => {
                debug!(node_id = %self.node_id, command = cmd.name(), "Executing command");
                let result = cmd.execute(&snapshot.node, self.client.as_ref()).await;
                self.registry.apply_result(&self.node_id, &result).await;
                self.processed.fetch_add(1, Ordering::SeqCst);
            }
            None => {
                warn!(
                    node_id = %self.node_id,
                    command = cmd.name(),
                    "Node no longer registered, skipping command"
                );
            }
        }
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn run(
    worker: WorkerLoop,
    mut rx: mpsc::Receiver<NodeWorkerCommand>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            cmd = rx.recv() => match cmd {
                Some(cmd) => worker.handle(cmd).await,
                None => break,
            },
            _ = stop_rx.changed() => {
                rx.close();
                while let Some(cmd) = rx.recv().await {
                    worker.handle(cmd).await;
                }
                break;
            }
        }
    }
    debug!(node_id = %worker.node_id, "Node worker loop exited");
}
