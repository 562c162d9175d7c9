//! In-memory ML node for tests and local development.
//!
//! The mock keeps just enough state to behave like a real node: stopping it
//! clears its mode, init/inference/training calls switch it, and every call
//! is counted so tests can assert which disruptive actions were taken.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{
    ClientFactory, InitDto, MlNodeClient, MlNodeState, PowState, PowStatusResponse,
    StartTrainingRequest,
};
use crate::node::Node;

/// Operations a [`MockMlNodeClient`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Stop,
    NodeState,
    PowStatus,
    InitGenerate,
    InitValidate,
    InferenceUp,
    InferenceHealth,
    StartTraining,
    TrainingStatus,
}

#[derive(Debug)]
struct MockState {
    node_state: MlNodeState,
    pow_status: PowState,
    healthy: bool,
    latency: Duration,
    failures: HashMap<MockOp, String>,
    calls: HashMap<MockOp, u64>,
    last_init_dto: Option<InitDto>,
    last_inference_up: Option<(String, Vec<String>)>,
    last_training_request: Option<StartTrainingRequest>,
}

/// Mock ML node client.
#[derive(Debug)]
pub struct MockMlNodeClient {
    state: Mutex<MockState>,
}

impl MockMlNodeClient {
    /// A stopped node with no latency.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                node_state: MlNodeState::Stopped,
                pow_status: PowState::Idle,
                healthy: false,
                latency: Duration::ZERO,
                failures: HashMap::new(),
                calls: HashMap::new(),
                last_init_dto: None,
                last_inference_up: None,
                last_training_request: None,
            }),
        }
    }

    /// A node whose every call takes `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        let mock = Self::new();
        mock.set_latency(latency);
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_node_state(&self, state: MlNodeState) {
        self.lock().node_state = state;
    }

    pub fn set_pow_status(&self, status: PowState) {
        self.lock().pow_status = status;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.lock().healthy = healthy;
    }

    /// Make every future `op` call fail with `message`.
    pub fn fail(&self, op: MockOp, message: impl Into<String>) {
        self.lock().failures.insert(op, message.into());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Number of times `op` was called.
    pub fn calls(&self, op: MockOp) -> u64 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.lock().calls.values().sum()
    }

    pub fn last_init_dto(&self) -> Option<InitDto> {
        self.lock().last_init_dto.clone()
    }

    pub fn last_inference_up(&self) -> Option<(String, Vec<String>)> {
        self.lock().last_inference_up.clone()
    }

    pub fn last_training_request(&self) -> Option<StartTrainingRequest> {
        self.lock().last_training_request.clone()
    }

    pub fn node_state_now(&self) -> MlNodeState {
        self.lock().node_state
    }

    /// Count the call, then wait out the latency and surface any configured failure.
    async fn record(&self, op: MockOp) -> Result<()> {
        let (latency, failure) = {
            let mut state = self.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            (state.latency, state.failures.get(&op).cloned())
        };

        debug!(op = ?op, "[MOCK] ML node call");

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match failure {
            Some(message) => anyhow::bail!(message),
            None => Ok(()),
        }
    }
}

impl Default for MockMlNodeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MlNodeClient for MockMlNodeClient {
    async fn stop(&self) -> Result<()> {
        self.record(MockOp::Stop).await?;
        let mut state = self.lock();
        state.node_state = MlNodeState::Stopped;
        state.pow_status = PowState::Stopped;
        state.healthy = false;
        Ok(())
    }

    async fn node_state(&self) -> Result<MlNodeState> {
        self.record(MockOp::NodeState).await?;
        Ok(self.lock().node_state)
    }

    async fn pow_status(&self) -> Result<PowStatusResponse> {
        self.record(MockOp::PowStatus).await?;
        let state = self.lock();
        Ok(PowStatusResponse {
            status: state.pow_status,
            is_model_initialized: state.node_state == MlNodeState::Pow,
        })
    }

    async fn init_generate(&self, dto: &InitDto) -> Result<()> {
        self.record(MockOp::InitGenerate).await?;
        let mut state = self.lock();
        state.node_state = MlNodeState::Pow;
        state.pow_status = PowState::Generating;
        state.last_init_dto = Some(dto.clone());
        Ok(())
    }

    async fn init_validate(&self, dto: &InitDto) -> Result<()> {
        self.record(MockOp::InitValidate).await?;
        let mut state = self.lock();
        state.node_state = MlNodeState::Pow;
        state.pow_status = PowState::Validating;
        state.last_init_dto = Some(dto.clone());
        Ok(())
    }

    async fn inference_up(&self, model: &str, args: &[String]) -> Result<()> {
        self.record(MockOp::InferenceUp).await?;
        let mut state = self.lock();
        state.node_state = MlNodeState::Inference;
        state.healthy = true;
        state.last_inference_up = Some((model.to_string(), args.to_vec()));
        Ok(())
    }

    async fn inference_health(&self) -> Result<bool> {
        self.record(MockOp::InferenceHealth).await?;
        Ok(self.lock().healthy)
    }

    async fn start_training(&self, request: &StartTrainingRequest) -> Result<()> {
        self.record(MockOp::StartTraining).await?;
        let mut state = self.lock();
        state.node_state = MlNodeState::Train;
        state.last_training_request = Some(request.clone());
        Ok(())
    }

    async fn training_status(&self) -> Result<serde_json::Value> {
        self.record(MockOp::TrainingStatus).await?;
        let running = self.lock().node_state == MlNodeState::Train;
        Ok(serde_json::json!({ "running": running }))
    }
}

/// Factory handing out one [`MockMlNodeClient`] per PoC URL.
///
/// Clients are created on first use and kept so tests can reach the mock
/// behind any registered node.
#[derive(Debug, Default)]
pub struct MockClientFactory {
    clients: Mutex<HashMap<String, Arc<MockMlNodeClient>>>,
    latency: Duration,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every client this factory creates takes `latency` per call.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            latency,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<MockMlNodeClient>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pre-seed the client used for `poc_url`.
    pub fn insert(&self, poc_url: impl Into<String>, client: Arc<MockMlNodeClient>) {
        self.lock().insert(poc_url.into(), client);
    }

    pub fn client(&self, poc_url: &str) -> Option<Arc<MockMlNodeClient>> {
        self.lock().get(poc_url).cloned()
    }

    /// The mock behind `node`, created if the node has no client yet.
    pub fn client_for(&self, node: &Node) -> Arc<MockMlNodeClient> {
        self.get_or_create(&node.poc_url())
    }

    fn get_or_create(&self, poc_url: &str) -> Arc<MockMlNodeClient> {
        self.lock()
            .entry(poc_url.to_string())
            .or_insert_with(|| Arc::new(MockMlNodeClient::with_latency(self.latency)))
            .clone()
    }
}

impl ClientFactory for MockClientFactory {
    fn create_client(&self, poc_url: &str, _inference_url: &str) -> Arc<dyn MlNodeClient> {
        self.get_or_create(poc_url)
    }
}
