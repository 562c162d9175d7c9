//! HTTP implementation of [`MlNodeClient`].

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use super::{
    InferenceUpRequest, InitDto, MlNodeClient, MlNodeState, PowStatusResponse, StartTrainingRequest,
    StateResponse, HEALTH_PATH, INFERENCE_UP_PATH, INIT_GENERATE_PATH, INIT_VALIDATE_PATH,
    POW_STATE_PATH, STATE_PATH, STOP_PATH, TRAIN_START_PATH, TRAIN_STATUS_PATH,
};

/// ML node API client.
pub struct HttpMlNodeClient {
    client: reqwest::Client,
    poc_url: String,
    inference_url: String,
}

impl HttpMlNodeClient {
    /// Create a client with its own connection pool.
    pub fn new(poc_url: &str, inference_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, poc_url, inference_url))
    }

    /// Create a client sharing an existing connection pool.
    pub fn with_client(client: reqwest::Client, poc_url: &str, inference_url: &str) -> Self {
        Self {
            client,
            poc_url: poc_url.trim_end_matches('/').to_string(),
            inference_url: inference_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B, action: &str) -> Result<()> {
        let url = format!("{}{}", self.poc_url, path);
        debug!(url = %url, "{}", action);

        let response = self.client.post(&url).json(body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, url = %url, "ML node request failed");
            anyhow::bail!("Failed to {}: {} - {}", action, status, body);
        }

        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, action: &str) -> Result<T> {
        let url = format!("{}{}", self.poc_url, path);
        debug!(url = %url, "{}", action);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, url = %url, "ML node request failed");
            anyhow::bail!("Failed to {}: {} - {}", action, status, body);
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl MlNodeClient for HttpMlNodeClient {
    async fn stop(&self) -> Result<()> {
        self.post(STOP_PATH, &serde_json::json!({}), "stop node").await
    }

    async fn node_state(&self) -> Result<MlNodeState> {
        let response: StateResponse = self.get(STATE_PATH, "fetch node state").await?;
        Ok(response.state)
    }

    async fn pow_status(&self) -> Result<PowStatusResponse> {
        self.get(POW_STATE_PATH, "fetch pow status").await
    }

    async fn init_generate(&self, dto: &InitDto) -> Result<()> {
        self.post(INIT_GENERATE_PATH, dto, "init generate").await
    }

    async fn init_validate(&self, dto: &InitDto) -> Result<()> {
        self.post(INIT_VALIDATE_PATH, dto, "init validate").await
    }

    async fn inference_up(&self, model: &str, args: &[String]) -> Result<()> {
        let request = InferenceUpRequest::new(model, args);
        self.post(INFERENCE_UP_PATH, &request, "bring inference up")
            .await
    }

    async fn inference_health(&self) -> Result<bool> {
        let url = format!("{}{}", self.inference_url, HEALTH_PATH);
        debug!(url = %url, "Checking inference health");

        let response = self.client.get(&url).send().await?;
        Ok(response.status().is_success())
    }

    async fn start_training(&self, request: &StartTrainingRequest) -> Result<()> {
        self.post(TRAIN_START_PATH, request, "start training").await
    }

    async fn training_status(&self) -> Result<serde_json::Value> {
        self.get(TRAIN_STATUS_PATH, "fetch training status").await
    }
}
