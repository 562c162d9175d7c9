//! Integration tests for fleet mode changes and the reconcile loop.
//!
//! These tests verify the full flow from a mode change to node commands:
//! 1. The broker rewrites intended status for every node
//! 2. The work group fans the matching command out
//! 3. Results land back in the registry
//!
//! Uses MockClientFactory to stand in for the ML nodes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_node_broker::broker::{response_channel, Broker, BrokerCommand, BrokerError, BrokerSettings};
use fleet_node_broker::client::mock::{MockClientFactory, MockMlNodeClient, MockOp};
use fleet_node_broker::client::MlNodeState;
use fleet_node_broker::node::{InferenceOutcome, LockRequest, NodeConfig, TrainingTask};
use fleet_node_broker::phase::StaticPhaseSource;
use fleet_node_broker::reconciler::{Reconciler, ReconcilerConfig};
use fleet_reconcile::{EpochPhase, EpochState, NodeStatus, PocStatus};
use tokio::sync::watch;

struct Fleet {
    broker: Arc<Broker>,
    factory: Arc<MockClientFactory>,
    phase: Arc<StaticPhaseSource>,
}

impl Fleet {
    async fn new(ids: &[&str]) -> Self {
        let factory = Arc::new(MockClientFactory::new());
        let phase = Arc::new(StaticPhaseSource::new(EpochState::new(2, EpochPhase::Inference)));
        let settings = BrokerSettings {
            callback_url: "http://api.fleet.internal:9100/".to_string(),
            public_key: "pubkey-1".to_string(),
            participant: "participant-1".to_string(),
            ..BrokerSettings::default()
        };
        let broker = Arc::new(Broker::new(factory.clone(), phase.clone(), settings));

        for id in ids {
            broker
                .register_node(
                    NodeConfig::new(*id, format!("{id}.fleet.internal"), 2)
                        .with_model("m1", vec!["--dtype".to_string(), "auto".to_string()]),
                )
                .await
                .unwrap();
        }

        Self {
            broker,
            factory,
            phase,
        }
    }

    async fn mock(&self, id: &str) -> Arc<MockMlNodeClient> {
        let node = self.broker.get_node(id).await.unwrap().node;
        self.factory.client_for(&node)
    }

    async fn status(&self, id: &str) -> (NodeStatus, NodeStatus) {
        let state = self.broker.get_node(id).await.unwrap().state;
        (state.intended_status, state.current_status)
    }

    fn enter_poc(&self, phase: EpochPhase) {
        self.phase
            .set(EpochState::new(2, phase).with_poc_start(1440, "0xblock"));
    }
}

#[tokio::test]
async fn test_start_poc_all() {
    let fleet = Fleet::new(&["a", "b", "c"]).await;
    fleet.enter_poc(EpochPhase::PocGenerate);

    let report = fleet.broker.start_poc_all().await;
    assert_eq!(report.intents_changed, 3);
    assert_eq!(report.submitted, 3);
    assert!(report.failed_nodes.is_empty());

    for (i, id) in ["a", "b", "c"].iter().enumerate() {
        let state = fleet.broker.get_node(id).await.unwrap().state;
        assert_eq!(state.intended_status, NodeStatus::Poc);
        assert_eq!(state.poc_intended_status, PocStatus::Generating);
        assert_eq!(state.current_status, NodeStatus::Poc);
        assert_eq!(state.poc_current_status, PocStatus::Generating);

        let dto = fleet.mock(id).await.last_init_dto().unwrap();
        assert_eq!(dto.block_height, 1440);
        assert_eq!(dto.block_hash, "0xblock");
        assert_eq!(dto.public_key, "pubkey-1");
        assert_eq!(dto.node_num, i as u64 + 1);
        assert_eq!(dto.total_nodes, 3);
        assert_eq!(dto.url, "http://api.fleet.internal:9100/v1/poc-batches");
    }

    // Repeating the command changes nothing and skips the disruptive calls.
    let report = fleet.broker.start_poc_all().await;
    assert_eq!(report.intents_changed, 0);
    assert_eq!(fleet.mock("a").await.calls(MockOp::InitGenerate), 1);
}

#[tokio::test]
async fn test_validation_follows_generation() {
    let fleet = Fleet::new(&["a"]).await;
    fleet.enter_poc(EpochPhase::PocGenerate);
    fleet.broker.start_poc_all().await;

    fleet.enter_poc(EpochPhase::PocValidate);
    let report = fleet.broker.start_validation_all().await;
    assert_eq!(report.intents_changed, 1);

    let state = fleet.broker.get_node("a").await.unwrap().state;
    assert_eq!(state.poc_intended_status, PocStatus::Validating);
    assert_eq!(state.poc_current_status, PocStatus::Validating);
    assert_eq!(fleet.mock("a").await.calls(MockOp::InitValidate), 1);
}

#[tokio::test]
async fn test_poc_without_start_block_is_skipped() {
    let fleet = Fleet::new(&["a", "b"]).await;
    fleet
        .phase
        .set(EpochState::new(2, EpochPhase::PocGenerate));

    let report = fleet.broker.start_poc_all().await;
    assert_eq!(report.intents_changed, 2);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.submitted, 0);
    assert_eq!(fleet.mock("a").await.calls(MockOp::InitGenerate), 0);
    assert_eq!(fleet.status("a").await, (NodeStatus::Poc, NodeStatus::Unknown));

    // Meant for PoC, so not leased even though nothing was sent to it.
    assert!(!fleet.broker.get_node("a").await.unwrap().state.is_reconciling());
    assert!(fleet
        .broker
        .lock_available_node(&LockRequest::new("m1"))
        .await
        .is_none());
}

#[tokio::test]
async fn test_node_leaving_inference_is_not_leased() {
    let fleet = Fleet::new(&["a"]).await;
    let mock = fleet.mock("a").await;
    mock.set_node_state(MlNodeState::Inference);
    mock.set_healthy(true);
    fleet.broker.inference_up_all().await;
    assert_eq!(fleet.status("a").await.1, NodeStatus::Inference);

    mock.set_latency(Duration::from_millis(300));
    fleet.enter_poc(EpochPhase::PocGenerate);
    let broker = Arc::clone(&fleet.broker);
    let handle = tokio::spawn(async move { broker.start_poc_all().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = fleet.broker.get_node("a").await.unwrap().state;
    assert_eq!(state.intended_status, NodeStatus::Poc);
    assert_eq!(state.current_status, NodeStatus::Inference);
    assert!(state.is_reconciling());
    assert!(fleet
        .broker
        .lock_available_node(&LockRequest::new("m1"))
        .await
        .is_none());

    handle.await.unwrap();
    assert_eq!(fleet.status("a").await, (NodeStatus::Poc, NodeStatus::Poc));
    assert!(fleet
        .broker
        .lock_available_node(&LockRequest::new("m1"))
        .await
        .is_none());
}

#[tokio::test]
async fn test_admin_disabled_node_is_stopped_for_every_command() {
    let fleet = Fleet::new(&["a", "b"]).await;
    fleet.broker.set_node_admin_state("a", false, 1).await.unwrap();
    fleet.mock("a").await.set_node_state(MlNodeState::Inference);
    fleet.enter_poc(EpochPhase::PocGenerate);

    fleet.broker.start_poc_all().await;
    assert_eq!(fleet.status("a").await, (NodeStatus::Stopped, NodeStatus::Stopped));
    assert_eq!(fleet.status("b").await.0, NodeStatus::Poc);
    assert_eq!(fleet.mock("a").await.calls(MockOp::InitGenerate), 0);
    assert_eq!(fleet.mock("a").await.calls(MockOp::Stop), 1);

    fleet.enter_poc(EpochPhase::PocValidate);
    fleet.broker.start_validation_all().await;
    assert_eq!(fleet.status("a").await.0, NodeStatus::Stopped);

    fleet.phase.set(EpochState::new(2, EpochPhase::Inference));
    fleet.broker.inference_up_all().await;
    assert_eq!(fleet.status("a").await.0, NodeStatus::Stopped);
    assert_eq!(fleet.status("b").await, (NodeStatus::Inference, NodeStatus::Inference));

    let task = TrainingTask {
        id: 1,
        master_node_addr: "10.0.0.1:29500".to_string(),
        node_ranks: BTreeMap::from([("a".to_string(), 0), ("b".to_string(), 1)]),
        world_size: 2,
    };
    fleet.broker.start_training(task).await;
    assert_eq!(fleet.status("a").await.0, NodeStatus::Stopped);
    assert_eq!(fleet.status("b").await.0, NodeStatus::Training);
}

#[tokio::test]
async fn test_node_enabled_mid_poc_waits_for_inference() {
    let fleet = Fleet::new(&["a"]).await;
    fleet.broker.set_node_admin_state("a", true, 2).await.unwrap();
    fleet.enter_poc(EpochPhase::PocGenerate);

    fleet.broker.start_poc_all().await;
    assert_eq!(fleet.status("a").await.0, NodeStatus::Stopped);

    fleet.phase.set(EpochState::new(2, EpochPhase::Inference));
    fleet.broker.inference_up_all().await;
    assert_eq!(fleet.status("a").await, (NodeStatus::Inference, NodeStatus::Inference));
}

#[tokio::test]
async fn test_inference_up_keeps_training_nodes() {
    let fleet = Fleet::new(&["a", "b"]).await;
    let task = TrainingTask {
        id: 42,
        master_node_addr: "10.0.0.1:29500".to_string(),
        node_ranks: BTreeMap::from([("a".to_string(), 0), ("ghost".to_string(), 1)]),
        world_size: 2,
    };

    let report = fleet.broker.start_training(task).await;
    assert_eq!(report.intents_changed, 1);
    assert_eq!(fleet.status("a").await, (NodeStatus::Training, NodeStatus::Training));
    let request = fleet.mock("a").await.last_training_request().unwrap();
    assert_eq!(request.task_id, 42);
    assert_eq!(request.participant, "participant-1");
    assert_eq!(
        fleet.broker.get_node("a").await.unwrap().state.training_task_id(),
        Some(42)
    );

    let report = fleet.broker.inference_up_all().await;
    assert_eq!(report.intents_changed, 1);
    assert_eq!(fleet.status("a").await.0, NodeStatus::Training);
    assert_eq!(fleet.status("b").await.0, NodeStatus::Inference);
    assert_eq!(fleet.mock("a").await.calls(MockOp::InferenceUp), 0);
}

#[tokio::test]
async fn test_failures_reported_per_node() {
    let fleet = Fleet::new(&["a", "b"]).await;
    fleet.mock("b").await.fail(MockOp::InferenceUp, "CUDA out of memory");

    let report = fleet.broker.inference_up_all().await;
    assert_eq!(report.submitted, 2);
    assert_eq!(report.failed_nodes, vec!["b".to_string()]);

    let b = fleet.broker.get_node("b").await.unwrap().state;
    assert_eq!(b.current_status, NodeStatus::Failed);
    assert_eq!(b.failure_reason, "CUDA out of memory");
    assert_eq!(fleet.status("a").await.1, NodeStatus::Inference);
}

#[tokio::test]
async fn test_reconcile_only_touches_diverged_nodes() {
    let fleet = Fleet::new(&["a", "b"]).await;
    fleet.broker.inference_up_all().await;
    assert_eq!(fleet.mock("a").await.calls(MockOp::InferenceUp), 1);

    // Nothing to do while converged.
    let report = fleet.broker.reconcile().await;
    assert_eq!(report.submitted, 0);

    fleet.mock("b").await.set_healthy(false);
    fleet
        .broker
        .release_node("b", InferenceOutcome::Failure("bad response".to_string()))
        .await;

    let report = fleet.broker.reconcile().await;
    assert_eq!(report.submitted, 1);
    assert_eq!(fleet.status("b").await.1, NodeStatus::Inference);
    assert_eq!(fleet.mock("a").await.calls(MockOp::InferenceUp), 1);
    assert_eq!(fleet.mock("b").await.calls(MockOp::InferenceUp), 2);
}

#[tokio::test]
async fn test_reconcile_leaves_in_flight_nodes_alone() {
    let fleet = Fleet::new(&["a"]).await;
    let mock = fleet.mock("a").await;
    mock.set_latency(Duration::from_millis(200));

    let broker = Arc::clone(&fleet.broker);
    let handle = tokio::spawn(async move { broker.inference_up_all().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = fleet.broker.reconcile().await;
    assert_eq!(report.in_flight, 1);
    assert_eq!(report.submitted, 0);

    assert_eq!(handle.await.unwrap().submitted, 1);
    assert_eq!(mock.calls(MockOp::InferenceUp), 1);
    assert_eq!(mock.node_state_now(), MlNodeState::Inference);

    let state = fleet.broker.get_node("a").await.unwrap().state;
    assert!(state.convergence().is_converged());
    assert!(!state.is_reconciling());
}

#[tokio::test]
async fn test_result_for_replaced_intent_is_discarded() {
    let fleet = Fleet::new(&["a"]).await;
    let mock = fleet.mock("a").await;
    mock.set_latency(Duration::from_millis(100));

    let broker = Arc::clone(&fleet.broker);
    let handle = tokio::spawn(async move { broker.inference_up_all().await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    // The inference command is still running when the fleet moves to PoC.
    fleet.enter_poc(EpochPhase::PocGenerate);
    let report = fleet.broker.start_poc_all().await;
    assert_eq!(report.submitted, 1);
    assert_eq!(report.in_flight, 0);
    handle.await.unwrap();

    assert_eq!(mock.calls(MockOp::InferenceUp), 1);
    assert_eq!(mock.calls(MockOp::InitGenerate), 1);
    let state = fleet.broker.get_node("a").await.unwrap().state;
    assert_eq!(state.current_status, NodeStatus::Poc);
    assert_eq!(state.poc_current_status, PocStatus::Generating);
    assert!(state.convergence().is_converged());
    assert!(!state.is_reconciling());
}

#[tokio::test]
async fn test_reconcile_waits_for_sync() {
    let fleet = Fleet::new(&["a"]).await;
    fleet.broker.inference_up_all().await;
    fleet
        .broker
        .release_node("a", InferenceOutcome::Failure("timeout".to_string()))
        .await;

    let mut unsynced = EpochState::new(2, EpochPhase::Inference);
    unsynced.is_synced = false;
    fleet.phase.set(unsynced);

    let report = fleet.broker.reconcile().await;
    assert_eq!(report.submitted, 0);
    assert_eq!(fleet.status("a").await.1, NodeStatus::Failed);
}

#[tokio::test]
async fn test_reconciler_runs_when_triggered() {
    let fleet = Fleet::new(&["a"]).await;
    fleet.broker.inference_up_all().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = Reconciler::new(
        Arc::clone(&fleet.broker),
        ReconcilerConfig {
            reconcile_interval: Duration::from_secs(3600),
        },
    );
    let handle = tokio::spawn(async move { reconciler.run(shutdown_rx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    fleet.mock("a").await.set_healthy(false);
    fleet
        .broker
        .release_node("a", InferenceOutcome::Failure("timeout".to_string()))
        .await;
    fleet.broker.trigger_reconciliation();

    let mut recovered = false;
    for _ in 0..100 {
        if fleet.status("a").await.1 == NodeStatus::Inference {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(recovered, "triggered reconciliation did not run");

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_queue_message_rejects_unbuffered_response() {
    let fleet = Fleet::new(&["a"]).await;

    let (respond, _rx) = response_channel(0);
    let result = fleet
        .broker
        .queue_message(BrokerCommand::ListNodes { respond })
        .await;
    assert_eq!(result, Err(BrokerError::UnbufferedResponse));

    let (respond, _rx) = response_channel(0);
    let result = fleet
        .broker
        .queue_message(BrokerCommand::LockNode {
            request: LockRequest::new("m1"),
            respond,
        })
        .await;
    assert_eq!(result, Err(BrokerError::UnbufferedResponse));
    assert_eq!(fleet.broker.get_node("a").await.unwrap().state.lock_count, 0);
}

#[tokio::test]
async fn test_queue_message_round_trip() {
    let fleet = Fleet::new(&["a"]).await;

    let (respond, mut rx) = response_channel(2);
    fleet
        .broker
        .queue_message(BrokerCommand::LockNode {
            request: LockRequest::new("m1"),
            respond,
        })
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap().unwrap().id, "a");

    let (respond, mut rx) = response_channel(2);
    fleet
        .broker
        .queue_message(BrokerCommand::RegisterNode {
            config: NodeConfig::new("a", "dup.local", 1),
            respond,
        })
        .await
        .unwrap();
    assert_eq!(
        rx.recv().await.unwrap().unwrap_err(),
        BrokerError::DuplicateNode("a".to_string())
    );

    let (respond, mut rx) = response_channel(1);
    fleet
        .broker
        .queue_message(BrokerCommand::InferenceUpAll { respond })
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap().submitted, 1);

    // A dropped receiver does not fail the command.
    let (respond, rx) = response_channel(1);
    drop(rx);
    fleet
        .broker
        .queue_message(BrokerCommand::ReleaseNode {
            node_id: "a".to_string(),
            outcome: InferenceOutcome::Success,
            respond,
        })
        .await
        .unwrap();
    assert_eq!(fleet.broker.get_node("a").await.unwrap().state.lock_count, 0);
}
