//! Submission of documents to a bulk indexing endpoint.
//!
//! Documents are grouped into size-bounded batches, framed as NDJSON bulk
//! requests and sent one request per batch. Per-document errors in the bulk
//! response are classified; documents failing on a single unparsable field
//! are resubmitted once without that field.

pub mod batch;
pub mod bulk;
pub mod cache;
pub mod client;
pub mod normalize;
pub mod pipeline;
pub mod recovery;

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::events::EventBusError;
use crate::lifecycle::StateKind;

pub use batch::Batch;
pub use bulk::{BulkAction, BulkEntry, BulkItemError, BulkItemResult, BulkResponse};
pub use cache::{CachedHarvest, DocumentCache, SubmissionService};
pub use client::{BulkClient, BulkTarget, Credentials, HttpBulkClient};
pub use normalize::ResponseNormalizer;
pub use pipeline::{SessionId, SubmissionPipeline};
pub use recovery::FieldRecovery;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that stop a whole submission attempt.
#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("No bulk URL is configured")]
    MissingUrl,

    #[error("Cannot submit while cancelling")]
    CannotSubmitWhileCancelling,

    #[error("Cannot submit while the service is {state}")]
    Busy { state: StateKind },

    #[error("Cannot submit before the service is started")]
    NotRunning,

    #[error("Unknown submission session {0}")]
    UnknownSession(SessionId),

    #[error("Cached documents stem from a failed harvest")]
    FailedHarvest,

    #[error("Cached documents are older than the latest harvest")]
    OutdatedDocuments,

    #[error("Bulk endpoint answered {status}: {body}")]
    Http { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid bulk response: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    #[error("Invalid submission configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Bus(#[from] EventBusError),
}

impl SubmissionError {
    /// Refusal of a submission while the service is heading to `state`.
    pub(crate) fn refused_in(state: Option<StateKind>) -> Self {
        match state {
            Some(StateKind::Aborting) => SubmissionError::CannotSubmitWhileCancelling,
            Some(state) => SubmissionError::Busy { state },
            None => SubmissionError::NotRunning,
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Why a document could not be submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Larger than the maximum batch size on its own
    TooLarge { size: usize, max: usize },
    /// Rejected by the index
    Rejected {
        status: u16,
        error_type: String,
        reason: String,
    },
    /// The bulk request carrying the document did not complete
    Request { message: String },
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::TooLarge { size, max } => {
                write!(f, "document of {} bytes exceeds the batch limit of {} bytes", size, max)
            }
            FailureKind::Rejected {
                status,
                error_type,
                reason,
            } => write!(f, "{} ({}): {}", error_type, status, reason),
            FailureKind::Request { message } => write!(f, "request failed: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDocument {
    pub id: String,
    #[serde(flatten)]
    pub kind: FailureKind,
}

/// A document that went through after its unparsable field was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveredDocument {
    pub id: String,
    pub removed_field: String,
}

/// Terminal classification of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// Nothing was submitted
    Empty,
    Succeeded,
    PartiallySucceeded,
    Failed,
}

impl std::fmt::Display for SubmissionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubmissionOutcome::Empty => "nothing to submit",
            SubmissionOutcome::Succeeded => "succeeded",
            SubmissionOutcome::PartiallySucceeded => "partially succeeded",
            SubmissionOutcome::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Accounting of every document handed to the pipeline since the last
/// prepare. Every permanently failed document is listed in `failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubmissionReport {
    pub submitted: usize,
    pub failed: Vec<FailedDocument>,
    pub recovered: Vec<RecoveredDocument>,
    /// Bulk requests sent, retries included
    pub requests: usize,
}

impl SubmissionReport {
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn total(&self) -> usize {
        self.submitted + self.failed.len()
    }

    pub fn outcome(&self) -> SubmissionOutcome {
        match (self.submitted, self.failed.len()) {
            (0, 0) => SubmissionOutcome::Empty,
            (_, 0) => SubmissionOutcome::Succeeded,
            (0, _) => SubmissionOutcome::Failed,
            _ => SubmissionOutcome::PartiallySucceeded,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Submission {}: {}/{} documents submitted, {} recovered, {} failed",
            self.outcome(),
            self.submitted,
            self.total(),
            self.recovered.len(),
            self.failed.len()
        )
    }

    pub(crate) fn record_failure(&mut self, id: impl Into<String>, kind: FailureKind) {
        self.failed.push(FailedDocument { id: id.into(), kind });
    }

    pub(crate) fn merge(&mut self, other: SubmissionReport) {
        self.submitted += other.submitted;
        self.failed.extend(other.failed);
        self.recovered.extend(other.recovered);
        self.requests += other.requests;
    }
}
