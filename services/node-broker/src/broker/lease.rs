//! Scoped inference leases.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{Broker, BrokerError};
use crate::node::{InferenceOutcome, LockRequest, Node};

/// A locked node that is released when the lease is dropped.
///
/// Prefer [`NodeLease::release`] to report an outcome. A lease dropped
/// without release (including on panic or cancellation) is released as a
/// success on a background task.
pub struct NodeLease {
    broker: Arc<Broker>,
    node: Node,
    released: bool,
}

impl NodeLease {
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Return the node to the broker with `outcome`.
    pub async fn release(mut self, outcome: InferenceOutcome) -> bool {
        self.released = true;
        self.broker.release_node(&self.node.id, outcome).await
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let broker = Arc::clone(&self.broker);
        let node_id = self.node.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(node_id = %node_id, "Releasing dropped node lease");
                handle.spawn(async move {
                    broker.release_node(&node_id, InferenceOutcome::Success).await;
                });
            }
            Err(_) => {
                warn!(node_id = %node_id, "Node lease dropped outside a runtime, lock leaked");
            }
        }
    }
}

impl Broker {
    /// Lock a node for `request`, or fail with [`BrokerError::NoNodesAvailable`].
    pub async fn acquire(self: &Arc<Self>, request: &LockRequest) -> Result<NodeLease, BrokerError> {
        let node = self
            .lock_available_node(request)
            .await
            .ok_or(BrokerError::NoNodesAvailable)?;
        Ok(NodeLease {
            broker: Arc::clone(self),
            node,
            released: false,
        })
    }
}

/// Run `action` on a leased node, releasing it afterwards.
///
/// The node is released as a success whatever `action` returns; callers that
/// want to mark a node failed should use [`Broker::acquire`] directly.
pub async fn lock_node<T, E, F, Fut>(
    broker: &Arc<Broker>,
    request: &LockRequest,
    action: F,
) -> Result<T, E>
where
    E: From<BrokerError>,
    F: FnOnce(Node) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let lease = broker.acquire(request).await?;
    let result = action(lease.node().clone()).await;
    lease.release(InferenceOutcome::Success).await;
    result
}
