//! The service states of a harvest cycle.

use std::sync::Arc;
use tracing::info;

use super::machine::{ActiveFlag, LifecycleState};
use super::StateKind;

/// A service-level state that logs its transitions.
#[derive(Debug)]
pub struct ServiceState {
    kind: StateKind,
    active: ActiveFlag,
}

impl ServiceState {
    pub fn new(kind: StateKind) -> Self {
        Self {
            kind,
            active: ActiveFlag::default(),
        }
    }
}

impl LifecycleState for ServiceState {
    fn kind(&self) -> StateKind {
        self.kind
    }

    fn activity(&self) -> &ActiveFlag {
        &self.active
    }

    fn on_enter(&self) {
        info!(state = %self.kind, "Service state entered");
    }

    fn on_leave(&self) {
        info!(state = %self.kind, "Service state left");
    }
}

/// One instance per [`StateKind`], created at startup and reused for every
/// cycle: Idle → Initializing → Harvesting → Submitting → Idle, with
/// Aborting on cancellation.
#[derive(Debug)]
pub struct ServiceStates {
    idle: Arc<ServiceState>,
    initializing: Arc<ServiceState>,
    harvesting: Arc<ServiceState>,
    submitting: Arc<ServiceState>,
    aborting: Arc<ServiceState>,
}

impl Default for ServiceStates {
    fn default() -> Self {
        Self {
            idle: Arc::new(ServiceState::new(StateKind::Idle)),
            initializing: Arc::new(ServiceState::new(StateKind::Initializing)),
            harvesting: Arc::new(ServiceState::new(StateKind::Harvesting)),
            submitting: Arc::new(ServiceState::new(StateKind::Submitting)),
            aborting: Arc::new(ServiceState::new(StateKind::Aborting)),
        }
    }
}

impl ServiceStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: StateKind) -> Arc<dyn LifecycleState> {
        let state = match kind {
            StateKind::Idle => &self.idle,
            StateKind::Initializing => &self.initializing,
            StateKind::Harvesting => &self.harvesting,
            StateKind::Submitting => &self.submitting,
            StateKind::Aborting => &self.aborting,
        };
        Arc::clone(state) as Arc<dyn LifecycleState>
    }
}
