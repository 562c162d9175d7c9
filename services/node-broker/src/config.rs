//! Configuration for the node broker.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_reconcile::{
    EpochPhase, EpochState, DEFAULT_RECONCILE_INTERVAL, DEFAULT_STATUS_POLL_INTERVAL,
};

use crate::node::NodeConfig;
use crate::worker::DEFAULT_QUEUE_CAPACITY;

/// Node broker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON file holding the initial node inventory.
    pub nodes_file: Option<PathBuf>,

    /// Base URL nodes post PoC batches back to.
    pub callback_url: String,

    /// Public key of the participant the fleet works for.
    pub public_key: String,

    /// Participant address used for training jobs.
    pub participant: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,

    /// Interval between node status probes.
    pub status_poll_interval: Duration,

    /// Per-node command queue capacity.
    pub worker_queue_capacity: usize,

    /// Timeout for a single call to an ML node.
    pub node_timeout: Duration,

    /// Epoch the broker starts in.
    pub epoch: u64,

    /// Phase the broker starts in.
    pub phase: EpochPhase,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes_file: None,
            callback_url: "http://127.0.0.1:9100".to_string(),
            public_key: String::new(),
            participant: String::new(),
            log_level: "info".to_string(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            worker_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            node_timeout: Duration::from_secs(30),
            epoch: 0,
            phase: EpochPhase::Inference,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let nodes_file = std::env::var("FLEET_NODES_FILE").ok().map(PathBuf::from);

        let callback_url =
            std::env::var("FLEET_CALLBACK_URL").unwrap_or(defaults.callback_url);

        let public_key = std::env::var("FLEET_PUBLIC_KEY").unwrap_or_default();

        let participant = std::env::var("FLEET_PARTICIPANT").unwrap_or_default();

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level);

        let reconcile_interval = secs_var("FLEET_RECONCILE_INTERVAL")
            .unwrap_or(defaults.reconcile_interval);

        let status_poll_interval = secs_var("FLEET_STATUS_POLL_INTERVAL")
            .unwrap_or(defaults.status_poll_interval);

        let worker_queue_capacity = std::env::var("FLEET_WORKER_QUEUE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.worker_queue_capacity);

        let node_timeout = secs_var("FLEET_NODE_TIMEOUT").unwrap_or(defaults.node_timeout);

        let epoch = std::env::var("FLEET_EPOCH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.epoch);

        let phase = match std::env::var("FLEET_PHASE") {
            Ok(s) => s.parse().context("invalid FLEET_PHASE")?,
            Err(_) => defaults.phase,
        };

        Ok(Self {
            nodes_file,
            callback_url,
            public_key,
            participant,
            log_level,
            reconcile_interval,
            status_poll_interval,
            worker_queue_capacity,
            node_timeout,
            epoch,
            phase,
        })
    }

    /// Epoch state the broker starts from.
    pub fn initial_epoch_state(&self) -> EpochState {
        EpochState::new(self.epoch, self.phase)
    }

    /// Load the node inventory, if a file is configured.
    pub fn load_nodes(&self) -> Result<Vec<NodeConfig>> {
        let Some(path) = &self.nodes_file else {
            return Ok(Vec::new());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read nodes file {}", path.display()))?;
        parse_nodes(&raw).with_context(|| format!("failed to parse nodes file {}", path.display()))
    }
}

/// Parse a JSON array of node configurations.
pub fn parse_nodes(raw: &str) -> Result<Vec<NodeConfig>> {
    Ok(serde_json::from_str(raw)?)
}

fn secs_var(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert_eq!(config.status_poll_interval, Duration::from_secs(60));
        assert_eq!(config.worker_queue_capacity, 10);
        assert!(config.nodes_file.is_none());
    }

    #[test]
    fn test_parse_nodes() {
        let raw = r#"[
            {
                "id": "node-1",
                "host": "10.0.0.5",
                "inference_port": 5000,
                "poc_port": 8080,
                "max_concurrent": 4,
                "models": {"Qwen/QwQ-32B": {"args": ["--tensor-parallel-size", "4"]}},
                "hardware": [{"type": "H100", "count": 4}]
            }
        ]"#;
        let nodes = parse_nodes(raw).unwrap();
        assert_eq!(nodes.len(), 1);
        let node = &nodes[0];
        assert_eq!(node.id, "node-1");
        assert_eq!(node.inference_segment, "");
        assert_eq!(node.models["Qwen/QwQ-32B"].args.len(), 2);
        assert_eq!(node.hardware[0].count, 4);
        assert!(node.version.is_none());
    }

    #[test]
    fn test_load_nodes_without_file() {
        let config = Config::default();
        assert!(config.load_nodes().unwrap().is_empty());
    }
}
