//! Source of the marketplace's current epoch and phase.

use std::sync::Arc;

use arc_swap::ArcSwap;
use fleet_reconcile::EpochState;

/// Provides the epoch state reconciliation decisions are made against.
pub trait PhaseSource: Send + Sync {
    fn current_epoch_state(&self) -> EpochState;
}

/// In-process phase source that can be updated at any time.
///
/// Readers never block writers; each read sees one complete state.
pub struct StaticPhaseSource {
    state: ArcSwap<EpochState>,
}

impl StaticPhaseSource {
    pub fn new(state: EpochState) -> Self {
        Self {
            state: ArcSwap::from_pointee(state),
        }
    }

    /// Replace the current epoch state.
    pub fn set(&self, state: EpochState) {
        self.state.store(Arc::new(state));
    }
}

impl PhaseSource for StaticPhaseSource {
    fn current_epoch_state(&self) -> EpochState {
        EpochState::clone(&self.state.load())
    }
}
