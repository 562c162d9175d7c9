//! Fleet Node Broker Library
//!
//! The node broker tracks a fleet of remote ML nodes, leases them to
//! inference requests and drives each one through the marketplace's epoch
//! phases (proof-of-compute, inference, training).
//!
//! ## Architecture
//!
//! ```text
//! Broker                     (registry, allocation, fleet modes)
//! ├── NodeWorkGroup          (fan-out across workers)
//! │   └── NodeWorker(id)     (serialized commands for one node)
//! │       └── MlNodeClient   (HTTP to the node)
//! ├── Reconciler             (periodic and triggered passes)
//! └── StatusMonitor          (probes actual node status)
//! ```
//!
//! ## Modules
//!
//! - `broker`: Registry owner, allocation and reconciliation commands
//! - `client`: ML node client trait, HTTP and mock implementations
//! - `worker`: Per-node workers and the work group
//! - `phase`: Epoch/phase source

pub mod broker;
pub mod client;
pub mod config;
pub mod monitor;
pub mod node;
pub mod phase;
pub mod reconciler;
pub mod registry;
pub mod worker;

pub use broker::{lock_node, Broker, BrokerCommand, BrokerError, BrokerSettings, ReconcileReport};
pub use node::{InferenceOutcome, LockRequest, Node, NodeConfig, NodeState, NodeWithState};
