//! ETL phases, health classification and their timelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::traits::StageKind;

/// Phase of an ETL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EtlStatus {
    /// Not (successfully) initialized yet
    Initializing,
    /// Ready, never harvested or last harvest failed
    Idle,
    /// Accepted by the registry, waiting for a worker
    Queued,
    Harvesting,
    /// Abort requested, in-flight work draining
    Aborting,
    Aborted,
    Done,
}

impl EtlStatus {
    /// Whether a harvest currently owns this ETL.
    pub fn is_in_progress(self) -> bool {
        matches!(self, EtlStatus::Queued | EtlStatus::Harvesting | EtlStatus::Aborting)
    }

    /// Allowed moves. Within a harvest phases only move forward; aborting
    /// is the only way out of an in-progress phase other than finishing
    /// or failing.
    pub fn can_transition_to(self, next: EtlStatus) -> bool {
        use EtlStatus::*;

        match (self, next) {
            (from, Initializing) => !from.is_in_progress(),
            (Initializing, Idle) => true,
            (Idle | Done | Aborted, Queued) => true,
            (Queued, Harvesting) => true,
            (Queued | Harvesting, Done) => true,
            (Queued | Harvesting, Aborting) => true,
            (Aborting, Aborted) => true,
            // failures settle back to idle
            (Queued | Harvesting, Idle) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for EtlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EtlStatus::Initializing => "INITIALIZING",
            EtlStatus::Idle => "IDLE",
            EtlStatus::Queued => "QUEUED",
            EtlStatus::Harvesting => "HARVESTING",
            EtlStatus::Aborting => "ABORTING",
            EtlStatus::Aborted => "ABORTED",
            EtlStatus::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Classification of the most recent failure of an ETL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EtlHealth {
    Ok,
    HarvestFailed,
    ExtractionFailed,
    TransformationFailed,
    LoadingFailed,
    InitializationFailed,
}

impl EtlHealth {
    pub fn is_ok(self) -> bool {
        self == EtlHealth::Ok
    }
}

impl From<StageKind> for EtlHealth {
    fn from(stage: StageKind) -> Self {
        match stage {
            StageKind::Initialization => EtlHealth::InitializationFailed,
            StageKind::Extraction => EtlHealth::ExtractionFailed,
            StageKind::Transformation => EtlHealth::TransformationFailed,
            StageKind::Loading => EtlHealth::LoadingFailed,
        }
    }
}

impl std::fmt::Display for EtlHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EtlHealth::Ok => "OK",
            EtlHealth::HarvestFailed => "HARVEST_FAILED",
            EtlHealth::ExtractionFailed => "EXTRACTION_FAILED",
            EtlHealth::TransformationFailed => "TRANSFORMATION_FAILED",
            EtlHealth::LoadingFailed => "LOADING_FAILED",
            EtlHealth::InitializationFailed => "INITIALIZATION_FAILED",
        };
        f.write_str(name)
    }
}

/// A value together with the moment it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    pub value: T,
    pub timestamp: DateTime<Utc>,
}

/// Append-only timeline of a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History<T> {
    entries: Vec<Timestamped<T>>,
}

impl<T: Copy + PartialEq> History<T> {
    pub fn starting_with(value: T) -> Self {
        Self {
            entries: vec![Timestamped {
                value,
                timestamp: Utc::now(),
            }],
        }
    }

    pub fn push(&mut self, value: T) {
        self.entries.push(Timestamped {
            value,
            timestamp: Utc::now(),
        });
    }

    /// Appends only if `value` differs from the latest entry.
    pub fn push_if_changed(&mut self, value: T) -> bool {
        if self.latest() == Some(value) {
            return false;
        }
        self.push(value);
        true
    }

    pub fn latest(&self) -> Option<T> {
        self.entries.last().map(|entry| entry.value)
    }

    pub fn entries(&self) -> &[Timestamped<T>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
