//! Events exchanged between the service components.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::bus::{Event, Request};
use crate::etl::{EtlError, HarvestStarted, Loader};
use crate::lifecycle::LifecycleState;
use crate::model::DocumentContent;
use crate::submission::{SessionId, SubmissionError, SubmissionReport};

// ============================================================================
// Harvest
// ============================================================================

/// Starts a harvest of every eligible ETL. The harvest itself runs in the
/// background; the response only reports what was started.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartHarvest {
    /// Harvest even when the source is unchanged since the last harvest
    pub force: bool,
}

impl Request for StartHarvest {
    type Response = Result<HarvestStarted, EtlError>;
}

/// Aborts the running harvest. Responds with the number of ETLs asked to stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortHarvest;

impl Request for AbortHarvest {
    type Response = Result<usize, EtlError>;
}

/// Published once all ETLs of a harvest have settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestFinished {
    pub success: bool,
    /// SHA-256 over all harvested documents
    pub document_checksum: String,
    pub end_timestamp: DateTime<Utc>,
}

impl Event for HarvestFinished {}

// ============================================================================
// Submission
// ============================================================================

/// Submits the documents staged by caching loaders.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartSubmission {
    pub can_submit_outdated_documents: bool,
    pub can_submit_failed_documents: bool,
}

impl Event for StartSubmission {}

/// Opens a submission session on the pipeline. Each session has its own
/// batch and report, so concurrent submitters never see each other's
/// documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareSubmission;

impl Request for PrepareSubmission {
    type Response = Result<SessionId, SubmissionError>;
}

/// Routes one document to a submission session. A `None` document deletes
/// `document_id` from the index.
///
/// Responds `Ok(true)` if the document was accepted into a batch and
/// `Ok(false)` if it was rejected on its own (e.g. too large).
#[derive(Debug, Clone)]
pub struct SubmitDocument {
    pub session: SessionId,
    pub document_id: String,
    pub document: Option<DocumentContent>,
}

impl Request for SubmitDocument {
    type Response = Result<bool, SubmissionError>;
}

/// Sends the pending batch of a session, closes the session and hands back
/// its report.
#[derive(Debug, Clone, Copy)]
pub struct FlushSubmission {
    pub session: SessionId,
}

impl Request for FlushSubmission {
    type Response = Result<SubmissionReport, SubmissionError>;
}

/// Closes a session without sending its pending batch. Responds with the
/// number of discarded documents.
#[derive(Debug, Clone, Copy)]
pub struct CancelSubmission {
    pub session: SessionId,
}

impl Request for CancelSubmission {
    type Response = usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmissionStarted {
    pub document_count: usize,
}

impl Event for SubmissionStarted {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DocumentsSubmitted {
    pub submitted_count: usize,
}

impl Event for DocumentsSubmitted {}

/// Terminal signal of a submission, with the full report.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionFinished {
    pub report: SubmissionReport,
}

impl Event for SubmissionFinished {}

// ============================================================================
// Lifecycle & Loaders
// ============================================================================

/// Installs `state` in the state machine; `None` clears it.
#[derive(Clone)]
pub struct ChangeState {
    pub state: Option<Arc<dyn LifecycleState>>,
}

impl ChangeState {
    pub fn to(state: Arc<dyn LifecycleState>) -> Self {
        Self { state: Some(state) }
    }
}

impl std::fmt::Debug for ChangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeState")
            .field("state", &self.state.as_ref().map(|s| s.kind()))
            .finish()
    }
}

impl Event for ChangeState {}

/// Builds a loader from its registered name.
#[derive(Debug, Clone)]
pub struct CreateLoader {
    pub name: String,
}

impl Request for CreateLoader {
    type Response = Result<Box<dyn Loader>, EtlError>;
}
