//! Reconciliation primitives for ML node fleets.
//!
//! This library holds the pure decision logic the broker uses to converge
//! every node's runtime mode toward the mode the marketplace expects for the
//! current epoch and phase. Key concepts:
//!
//! - **Intended state**: What the node should be doing (set by reconciliation).
//! - **Current state**: What the node was last observed doing.
//! - **Admin override**: An operator switch that takes effect per epoch.
//!
//! # Invariants
//!
//! - Planning is deterministic given the same inputs
//! - Planning never touches the network; it only computes intents

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// A node status string that does not name any known status.
    #[error("unknown node status: {0}")]
    UnknownStatus(String),

    /// An epoch phase string that does not name any known phase.
    #[error("unknown epoch phase: {0}")]
    UnknownPhase(String),
}

// =============================================================================
// Statuses
// =============================================================================

/// Runtime mode of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Never observed.
    #[default]
    Unknown,
    /// Serving model inference.
    Inference,
    /// Running proof-of-compute generation or validation.
    Poc,
    /// Participating in a distributed training task.
    Training,
    /// Idle, nothing loaded.
    Stopped,
    /// Last command or probe failed.
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Inference => "INFERENCE",
            Self::Poc => "POC",
            Self::Training => "TRAINING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }

    /// Returns true if a node in this status may take inference leases.
    ///
    /// `Unknown` counts because a freshly registered node has not been
    /// probed yet.
    pub fn serves_inference(&self) -> bool {
        matches!(self, Self::Inference | Self::Unknown)
    }

    /// Returns true for the statuses a node reaches on purpose.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Inference | Self::Poc | Self::Training)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(Self::Unknown),
            "INFERENCE" => Ok(Self::Inference),
            "POC" => Ok(Self::Poc),
            "TRAINING" => Ok(Self::Training),
            "STOPPED" => Ok(Self::Stopped),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ReconcileError::UnknownStatus(s.to_string())),
        }
    }
}

/// Sub-state within [`NodeStatus::Poc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PocStatus {
    #[default]
    Idle,
    Generating,
    Validating,
}

impl fmt::Display for PocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Generating => "GENERATING",
            Self::Validating => "VALIDATING",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Epochs
// =============================================================================

/// Phase within a marketplace epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochPhase {
    #[default]
    Inference,
    PocGenerate,
    PocGenerateWindDown,
    PocValidate,
    PocValidateWindDown,
}

impl fmt::Display for EpochPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inference => "inference",
            Self::PocGenerate => "poc_generate",
            Self::PocGenerateWindDown => "poc_generate_wind_down",
            Self::PocValidate => "poc_validate",
            Self::PocValidateWindDown => "poc_validate_wind_down",
        };
        f.write_str(s)
    }
}

impl FromStr for EpochPhase {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "inference" => Ok(Self::Inference),
            "poc_generate" => Ok(Self::PocGenerate),
            "poc_generate_wind_down" => Ok(Self::PocGenerateWindDown),
            "poc_validate" => Ok(Self::PocValidate),
            "poc_validate_wind_down" => Ok(Self::PocValidateWindDown),
            _ => Err(ReconcileError::UnknownPhase(s.to_string())),
        }
    }
}

/// Snapshot of where the marketplace currently is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EpochState {
    pub epoch: u64,
    pub phase: EpochPhase,
    pub block_height: u64,
    /// Height at which the current PoC stage started; zero when unknown.
    pub poc_start_block_height: u64,
    pub poc_start_block_hash: Option<String>,
    /// False while the chain view is still catching up.
    pub is_synced: bool,
}

impl EpochState {
    /// A synced state at the given epoch and phase with no PoC parameters.
    pub fn new(epoch: u64, phase: EpochPhase) -> Self {
        Self {
            epoch,
            phase,
            is_synced: true,
            ..Default::default()
        }
    }

    /// Attach the block that started the current PoC stage.
    pub fn with_poc_start(mut self, height: u64, hash: impl Into<String>) -> Self {
        self.poc_start_block_height = height;
        self.poc_start_block_hash = Some(hash.into());
        if self.block_height < height {
            self.block_height = height;
        }
        self
    }

    /// The PoC start block, if both height and hash are known.
    pub fn poc_start(&self) -> Option<(u64, &str)> {
        match &self.poc_start_block_hash {
            Some(hash) if self.poc_start_block_height > 0 && !hash.is_empty() => {
                Some((self.poc_start_block_height, hash.as_str()))
            }
            _ => None,
        }
    }
}

// =============================================================================
// Admin gating
// =============================================================================

/// Operator override for a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminState {
    pub enabled: bool,
    /// Epoch at which the override was set.
    pub epoch: u64,
}

impl Default for AdminState {
    fn default() -> Self {
        Self {
            enabled: true,
            epoch: 0,
        }
    }
}

impl AdminState {
    /// Whether the node may run for the given epoch and phase.
    ///
    /// A disable applies from the epoch it was set in onward. An enable set
    /// during the current epoch holds the node back until the inference
    /// phase, so a node never joins a PoC stage halfway through.
    pub fn should_be_operational(&self, epoch: u64, phase: EpochPhase) -> bool {
        if !self.enabled {
            return self.epoch > epoch;
        }
        !(self.epoch == epoch && phase != EpochPhase::Inference)
    }
}

// =============================================================================
// Intent planning
// =============================================================================

/// Target status pair for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Intent {
    pub status: NodeStatus,
    pub poc_status: PocStatus,
}

impl Intent {
    pub fn new(status: NodeStatus, poc_status: PocStatus) -> Self {
        Self { status, poc_status }
    }

    pub fn stopped() -> Self {
        Self::new(NodeStatus::Stopped, PocStatus::Idle)
    }

    /// True if both name the same target. The PoC sub-status only counts
    /// when the target is PoC.
    pub fn same_target(&self, other: &Intent) -> bool {
        self.status == other.status
            && (self.status != NodeStatus::Poc || self.poc_status == other.poc_status)
    }
}

/// Fleet-wide mode requested by a reconciliation command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FleetMode {
    PocGenerate,
    PocValidate,
    Inference,
    Training,
}

impl FleetMode {
    /// Intent a permitted node receives for this mode.
    pub fn target(&self) -> Intent {
        match self {
            Self::PocGenerate => Intent::new(NodeStatus::Poc, PocStatus::Generating),
            Self::PocValidate => Intent::new(NodeStatus::Poc, PocStatus::Validating),
            Self::Inference => Intent::new(NodeStatus::Inference, PocStatus::Idle),
            Self::Training => Intent::new(NodeStatus::Training, PocStatus::Idle),
        }
    }
}

impl fmt::Display for FleetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PocGenerate => "poc_generate",
            Self::PocValidate => "poc_validate",
            Self::Inference => "inference",
            Self::Training => "training",
        };
        f.write_str(s)
    }
}

/// Compute a node's new intent for a fleet mode.
///
/// Returns `None` when the intent must stay as it is: inference never
/// preempts a node that is intended to train.
pub fn plan_intent(
    mode: FleetMode,
    current: Intent,
    admin: &AdminState,
    epoch: &EpochState,
) -> Option<Intent> {
    if !admin.should_be_operational(epoch.epoch, epoch.phase) {
        return Some(Intent::stopped());
    }
    if mode == FleetMode::Inference && current.status == NodeStatus::Training {
        return None;
    }
    Some(mode.target())
}

// =============================================================================
// Convergence
// =============================================================================

/// Convergence status for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Current matches intended.
    Converged,

    /// Current differs from intended and the node is healthy.
    Converging,

    /// The node has failed and needs another command.
    Diverged,

    /// No intent has been set yet.
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the node has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if a command should be dispatched for the node.
    pub fn needs_action(&self) -> bool {
        matches!(self, Self::Converging | Self::Diverged)
    }
}

/// Classify a node by comparing its current and intended state.
///
/// The PoC sub-status only matters while both sides are in PoC.
pub fn classify(current: Intent, intended: Intent) -> ConvergenceStatus {
    if intended.status == NodeStatus::Unknown {
        return ConvergenceStatus::Unknown;
    }
    if current.status == NodeStatus::Failed && intended.status != NodeStatus::Failed {
        return ConvergenceStatus::Diverged;
    }
    if current.status != intended.status {
        return ConvergenceStatus::Converging;
    }
    if intended.status == NodeStatus::Poc && current.poc_status != intended.poc_status {
        return ConvergenceStatus::Converging;
    }
    ConvergenceStatus::Converged
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval between status probes.
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(60);
