//! Fleet-wide mode changes and reconciliation passes.
//!
//! A mode change rewrites every node's intended status under the registry
//! lock, then dispatches the matching worker command to each node, grouped
//! so that all nodes receiving the same command run in parallel.

use std::collections::{BTreeMap, HashMap};

use fleet_reconcile::{plan_intent, EpochState, FleetMode, Intent, NodeStatus, PocStatus};
use futures_util::future::join_all;
use tracing::{debug, error, info, instrument};

use super::Broker;
use crate::client::POC_BATCHES_PATH;
use crate::node::{NodeWithState, TrainingTask};
use crate::worker::{FanOutStats, NodeWorkerCommand, PocParams, TrainingParams};

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Nodes whose intended status changed.
    pub intents_changed: usize,
    /// Commands accepted by node workers.
    pub submitted: usize,
    /// Commands rejected by node workers.
    pub failed: usize,
    /// Nodes left out because the command could not be built.
    pub skipped: usize,
    /// Nodes left out because a command for the same target is still running.
    pub in_flight: usize,
    /// Dispatched nodes that ended the pass failed, sorted by id.
    pub failed_nodes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CommandGroup {
    Stop,
    Generate,
    Validate,
    Inference,
    Training(u64),
}

impl Broker {
    /// Move every permitted node to PoC generation.
    #[instrument(skip(self))]
    pub async fn start_poc_all(&self) -> ReconcileReport {
        self.apply_fleet_mode(FleetMode::PocGenerate).await
    }

    /// Move every permitted node to PoC validation.
    #[instrument(skip(self))]
    pub async fn start_validation_all(&self) -> ReconcileReport {
        self.apply_fleet_mode(FleetMode::PocValidate).await
    }

    /// Move every permitted node to inference, except nodes meant to train.
    #[instrument(skip(self))]
    pub async fn inference_up_all(&self) -> ReconcileReport {
        self.apply_fleet_mode(FleetMode::Inference).await
    }

    /// Assign the nodes in `task`'s rank map to the training task.
    #[instrument(skip(self, task), fields(task_id = task.id))]
    pub async fn start_training(&self, task: TrainingTask) -> ReconcileReport {
        let epoch = self.epoch_state();

        let (changed, node_ids) = {
            let mut nodes = self.registry.write().await;
            let mut changed = 0;
            let mut node_ids = Vec::new();

            for node_id in task.node_ranks.keys() {
                let Some(entry) = nodes.get_mut(node_id) else {
                    error!(node_id = %node_id, "Training task names unknown node");
                    continue;
                };
                match update_intent(entry, FleetMode::Training, &epoch, Some(&task)) {
                    Some(true) => changed += 1,
                    Some(false) => {}
                    None => continue,
                }
                node_ids.push(node_id.clone());
            }
            (changed, node_ids)
        };

        let mut report = self.dispatch(&epoch, node_ids).await;
        report.intents_changed = changed;
        info!(
            intents_changed = report.intents_changed,
            submitted = report.submitted,
            failed_nodes = report.failed_nodes.len(),
            "Training task dispatched"
        );
        report
    }

    /// Dispatch commands to every node that is not where it should be.
    ///
    /// Skipped entirely while the epoch state is not synced.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> ReconcileReport {
        let epoch = self.epoch_state();
        if !epoch.is_synced {
            debug!("Epoch state not synced, skipping reconciliation");
            return ReconcileReport::default();
        }

        let node_ids: Vec<String> = self
            .registry
            .read()
            .await
            .values()
            .filter(|entry| entry.state.convergence().needs_action())
            .map(|entry| entry.node.id.clone())
            .collect();

        if node_ids.is_empty() {
            debug!("All nodes converged");
            return ReconcileReport::default();
        }

        self.dispatch(&epoch, node_ids).await
    }

    async fn apply_fleet_mode(&self, mode: FleetMode) -> ReconcileReport {
        let epoch = self.epoch_state();

        let (changed, node_ids) = {
            let mut nodes = self.registry.write().await;
            let mut changed = 0;
            let mut node_ids = Vec::new();
            for entry in nodes.values_mut() {
                match update_intent(entry, mode, &epoch, None) {
                    Some(true) => changed += 1,
                    Some(false) => {}
                    None => continue,
                }
                node_ids.push(entry.node.id.clone());
            }
            (changed, node_ids)
        };

        let mut report = self.dispatch(&epoch, node_ids).await;
        report.intents_changed = changed;
        info!(
            mode = %mode,
            epoch = epoch.epoch,
            phase = %epoch.phase,
            intents_changed = report.intents_changed,
            submitted = report.submitted,
            failed = report.failed,
            failed_nodes = report.failed_nodes.len(),
            "Fleet mode applied"
        );
        report
    }

    /// Send each node the command matching its intended status.
    ///
    /// A node whose intended target is already in flight is left alone. A
    /// node in flight toward an older target is redispatched; the older
    /// result is then discarded as stale when it arrives.
    async fn dispatch(&self, epoch: &EpochState, node_ids: Vec<String>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let (groups, targets) = {
            let mut nodes = self.registry.write().await;
            let poc = self.poc_params(epoch, nodes.len() as u64);
            let mut groups: BTreeMap<CommandGroup, (NodeWorkerCommand, Vec<String>)> =
                BTreeMap::new();
            let mut targets: HashMap<String, Intent> = HashMap::new();

            for node_id in &node_ids {
                let Some(entry) = nodes.get_mut(node_id) else {
                    continue;
                };
                let intended = entry.state.intended();
                if entry
                    .state
                    .reconcile_target
                    .is_some_and(|t| t.same_target(&intended))
                {
                    debug!(node_id = %node_id, status = %intended.status, "Command already in flight");
                    report.in_flight += 1;
                    continue;
                }

                match self.command_for(entry, poc.as_ref()) {
                    Ok(Some((group, command))) => {
                        entry.state.reconcile_target = Some(intended);
                        targets.insert(node_id.clone(), intended);
                        groups
                            .entry(group)
                            .or_insert_with(|| (command, Vec::new()))
                            .1
                            .push(node_id.clone());
                    }
                    Ok(None) => {
                        entry.state.reconcile_target = None;
                    }
                    Err(reason) => {
                        error!(node_id = %node_id, reason = %reason, "Skipping node this pass");
                        entry.state.reconcile_target = None;
                        report.skipped += 1;
                    }
                }
            }
            (groups, targets)
        };

        let results: Vec<FanOutStats> = join_all(groups.into_values().map(|(command, ids)| async move {
            self.work_group.execute_on_nodes(&ids, command).await
        }))
        .await;

        let mut nodes = self.registry.write().await;
        for stats in results {
            report.submitted += stats.submitted;
            report.failed += stats.failed;
            for node_id in &stats.rejected {
                let Some(entry) = nodes.get_mut(node_id) else {
                    continue;
                };
                // Never reached a worker, so nothing will report back.
                if entry.state.reconcile_target == targets.get(node_id).copied() {
                    entry.state.reconcile_target = None;
                }
            }
        }

        report.failed_nodes = node_ids
            .into_iter()
            .filter(|id| {
                nodes
                    .get(id)
                    .is_some_and(|entry| entry.state.current_status == NodeStatus::Failed)
            })
            .collect();
        report.failed_nodes.sort();
        report
    }

    fn poc_params(&self, epoch: &EpochState, total_nodes: u64) -> Option<PocParams> {
        let (block_height, block_hash) = epoch.poc_start()?;
        Some(PocParams {
            block_height,
            block_hash: block_hash.to_string(),
            public_key: self.settings.public_key.clone(),
            callback_url: format!(
                "{}{}",
                self.settings.callback_url.trim_end_matches('/'),
                POC_BATCHES_PATH
            ),
            total_nodes,
        })
    }

    fn command_for(
        &self,
        entry: &NodeWithState,
        poc: Option<&PocParams>,
    ) -> Result<Option<(CommandGroup, NodeWorkerCommand)>, String> {
        let state = &entry.state;
        let command = match (state.intended_status, state.poc_intended_status) {
            (NodeStatus::Stopped, _) => (CommandGroup::Stop, NodeWorkerCommand::Stop),
            (NodeStatus::Poc, PocStatus::Generating) => {
                let params = poc.ok_or("PoC start block unknown")?;
                (CommandGroup::Generate, NodeWorkerCommand::StartPoc(params.clone()))
            }
            (NodeStatus::Poc, PocStatus::Validating) => {
                let params = poc.ok_or("PoC start block unknown")?;
                (CommandGroup::Validate, NodeWorkerCommand::InitValidate(params.clone()))
            }
            (NodeStatus::Inference, _) => (CommandGroup::Inference, NodeWorkerCommand::InferenceUp),
            (NodeStatus::Training, _) => {
                let task = state
                    .training_task
                    .clone()
                    .ok_or("training intended without a task")?;
                (
                    CommandGroup::Training(task.id),
                    NodeWorkerCommand::StartTraining(TrainingParams {
                        task,
                        participant: self.settings.participant.clone(),
                    }),
                )
            }
            (NodeStatus::Poc, PocStatus::Idle)
            | (NodeStatus::Unknown, _)
            | (NodeStatus::Failed, _) => return Ok(None),
        };
        Ok(Some(command))
    }
}

/// Recompute one node's intent for `mode`.
///
/// Returns whether the intent changed, or `None` if the node keeps its
/// current intent and should not receive the mode's command.
fn update_intent(
    entry: &mut NodeWithState,
    mode: FleetMode,
    epoch: &EpochState,
    task: Option<&TrainingTask>,
) -> Option<bool> {
    let state = &mut entry.state;
    let Some(intent) = plan_intent(mode, state.intended(), &state.admin_state, epoch) else {
        debug!(node_id = %entry.node.id, "Keeping training intent");
        return None;
    };

    if !state.admin_state.should_be_operational(epoch.epoch, epoch.phase) {
        info!(
            node_id = %entry.node.id,
            admin_enabled = state.admin_state.enabled,
            admin_epoch = state.admin_state.epoch,
            epoch = epoch.epoch,
            phase = %epoch.phase,
            "Node administratively held, stopping"
        );
    }

    state.training_task = match intent.status {
        NodeStatus::Training => task.cloned(),
        _ => None,
    };

    let changed = state.set_intended(intent);
    if changed {
        debug!(
            node_id = %entry.node.id,
            status = %intent.status,
            poc_status = %intent.poc_status,
            "Intended status updated"
        );
    }
    Some(changed)
}
