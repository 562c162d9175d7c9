//! Client interface to a remote ML node.
//!
//! Every ML node exposes two HTTP surfaces: the PoC/management API (mode
//! switching, proof-of-compute, training) and the inference API (health and
//! model serving). The [`MlNodeClient`] trait covers both so workers can be
//! driven by the HTTP implementation in production and by
//! [`mock::MockMlNodeClient`] in tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fleet_reconcile::NodeStatus;
use serde::{Deserialize, Serialize};

mod http;
pub mod mock;

pub use http::HttpMlNodeClient;

pub const STOP_PATH: &str = "/api/v1/stop";
pub const STATE_PATH: &str = "/api/v1/state";
pub const POW_STATE_PATH: &str = "/api/v1/pow/state";
pub const INIT_GENERATE_PATH: &str = "/api/v1/pow/init/generate";
pub const INIT_VALIDATE_PATH: &str = "/api/v1/pow/init/validate";
pub const INFERENCE_UP_PATH: &str = "/api/v1/inference/up";
pub const HEALTH_PATH: &str = "/health";
pub const TRAIN_START_PATH: &str = "/api/v1/train/start";
pub const TRAIN_STATUS_PATH: &str = "/api/v1/train/status";

/// Path PoC batches are posted back to, relative to the callback URL.
pub const POC_BATCHES_PATH: &str = "/v1/poc-batches";

pub const DEFAULT_BATCH_SIZE: u32 = 100;
pub const DEFAULT_R_TARGET: f64 = 1.3971164020989417;
pub const DEFAULT_FRAUD_THRESHOLD: f64 = 0.01;

/// Runtime mode reported by an ML node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MlNodeState {
    Pow,
    Inference,
    Train,
    Stopped,
}

impl From<MlNodeState> for NodeStatus {
    fn from(state: MlNodeState) -> Self {
        match state {
            MlNodeState::Pow => NodeStatus::Poc,
            MlNodeState::Inference => NodeStatus::Inference,
            MlNodeState::Train => NodeStatus::Training,
            MlNodeState::Stopped => NodeStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    pub state: MlNodeState,
}

/// Proof-of-work controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowState {
    Idle,
    NoController,
    Loading,
    Generating,
    Validating,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowStatusResponse {
    pub status: PowState,
    #[serde(default)]
    pub is_model_initialized: bool,
}

/// Model shape used for proof-of-compute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowParams {
    pub dim: u32,
    pub n_layers: u32,
    pub n_heads: u32,
    pub n_kv_heads: u32,
    pub vocab_size: u32,
    pub ffn_dim_multiplier: f64,
    pub multiple_of: u32,
    pub norm_eps: f64,
    pub rope_theta: u32,
    pub use_scaled_rope: bool,
    pub seq_len: u32,
}

impl PowParams {
    pub const TESTNET: PowParams = PowParams {
        dim: 1024,
        n_layers: 32,
        n_heads: 32,
        n_kv_heads: 32,
        vocab_size: 8196,
        ffn_dim_multiplier: 10.0,
        multiple_of: 2048,
        norm_eps: 1e-5,
        rope_theta: 10000,
        use_scaled_rope: false,
        seq_len: 128,
    };
}

/// Payload for PoC generate/validate initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitDto {
    pub block_hash: String,
    pub block_height: u64,
    pub public_key: String,
    pub batch_size: u32,
    pub r_target: f64,
    pub fraud_threshold: f64,
    pub params: PowParams,
    /// The node's position in the fleet.
    #[serde(rename = "node_id")]
    pub node_num: u64,
    /// Fleet size.
    #[serde(rename = "node_count")]
    pub total_nodes: u64,
    pub url: String,
}

impl InitDto {
    pub fn build(
        block_height: u64,
        block_hash: &str,
        public_key: &str,
        node_num: u64,
        total_nodes: u64,
        callback_url: &str,
    ) -> Self {
        Self {
            block_hash: block_hash.to_string(),
            block_height,
            public_key: public_key.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            r_target: DEFAULT_R_TARGET,
            fraud_threshold: DEFAULT_FRAUD_THRESHOLD,
            params: PowParams::TESTNET,
            node_num,
            total_nodes,
            url: callback_url.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceUpRequest {
    pub model: String,
    pub dtype: String,
    pub additional_args: Vec<String>,
}

impl InferenceUpRequest {
    pub fn new(model: &str, args: &[String]) -> Self {
        Self {
            model: model.to_string(),
            dtype: "float16".to_string(),
            additional_args: args.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTrainingRequest {
    pub task_id: u64,
    pub participant: String,
    pub node_id: String,
    pub master_addr: String,
    pub rank: u32,
    pub world_size: u32,
}

/// Client for one remote ML node.
#[async_trait]
pub trait MlNodeClient: Send + Sync {
    /// Stop whatever the node is running.
    async fn stop(&self) -> Result<()>;

    /// Current runtime mode.
    async fn node_state(&self) -> Result<MlNodeState>;

    /// Proof-of-work controller status.
    async fn pow_status(&self) -> Result<PowStatusResponse>;

    async fn init_generate(&self, dto: &InitDto) -> Result<()>;

    async fn init_validate(&self, dto: &InitDto) -> Result<()>;

    /// Load `model` and start serving inference.
    async fn inference_up(&self, model: &str, args: &[String]) -> Result<()>;

    /// True if the inference server answers its health check.
    async fn inference_health(&self) -> Result<bool>;

    async fn start_training(&self, request: &StartTrainingRequest) -> Result<()>;

    async fn training_status(&self) -> Result<serde_json::Value>;
}

/// Builds clients for registered nodes.
pub trait ClientFactory: Send + Sync {
    fn create_client(&self, poc_url: &str, inference_url: &str) -> Arc<dyn MlNodeClient>;
}

/// Factory for [`HttpMlNodeClient`]s sharing one connection pool.
pub struct HttpClientFactory {
    client: reqwest::Client,
}

impl HttpClientFactory {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl ClientFactory for HttpClientFactory {
    fn create_client(&self, poc_url: &str, inference_url: &str) -> Arc<dyn MlNodeClient> {
        Arc::new(HttpMlNodeClient::with_client(
            self.client.clone(),
            poc_url,
            inference_url,
        ))
    }
}
