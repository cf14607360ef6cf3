//! Global lifecycle of the harvesting service.
//!
//! Exactly one [`LifecycleState`] is active at a time; the
//! [`StateMachine`] serializes all transitions between them.

pub mod machine;
pub mod states;

use serde::{Deserialize, Serialize};

pub use machine::{ActiveFlag, LifecycleState, StateMachine};
pub use states::{ServiceState, ServiceStates};

/// Operating modes of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateKind {
    Idle,
    Initializing,
    Harvesting,
    Submitting,
    Aborting,
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StateKind::Idle => "idle",
            StateKind::Initializing => "initializing",
            StateKind::Harvesting => "harvesting",
            StateKind::Submitting => "submitting",
            StateKind::Aborting => "aborting",
        };
        f.write_str(name)
    }
}
