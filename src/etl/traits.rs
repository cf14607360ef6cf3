//! Stage traits and error types of an ETL.
//!
//! An ETL is composed of three independent stages:
//! - [`Extractor`]: produces a lazy stream of raw records plus a version hash
//! - [`Transformer`]: maps one raw record to a [`Document`]
//! - [`Loader`]: receives documents, e.g. to submit them to an index

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::events::EventBusError;
use crate::model::Document;
use crate::submission::SubmissionError;

// ============================================================================
// Stage Traits
// ============================================================================

/// Output of [`Extractor::extract`].
pub struct Extraction {
    /// Hash identifying the extracted source version. Equal hashes mean the
    /// source did not change since the previous harvest.
    pub version_hash: String,

    /// Expected number of records, if known
    pub size_estimate: Option<u64>,

    /// Forward-only, non-restartable record stream
    pub records: BoxStream<'static, Result<Value, StageError>>,
}

impl std::fmt::Debug for Extraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extraction")
            .field("version_hash", &self.version_hash)
            .field("size_estimate", &self.size_estimate)
            .finish_non_exhaustive()
    }
}

/// Pulls records out of a source.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Returns the name of this extractor stage.
    fn stage_name(&self) -> &'static str;

    /// One-time setup, run when the ETL is initialized.
    async fn init(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Opens the source for one harvest.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be reached or read. Errors of
    /// individual records are reported through the stream instead.
    async fn extract(&mut self) -> Result<Extraction, StageError>;
}

/// Maps raw records to documents.
pub trait Transformer: Send + Sync {
    /// Returns the name of this transformer stage.
    fn stage_name(&self) -> &'static str;

    /// Transforms one record. `Ok(None)` skips the record.
    fn transform(&self, record: Value) -> Result<Option<Document>, StageError>;
}

/// Result of a completed load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub loaded: usize,
    pub failed: usize,
    pub detail: Option<String>,
}

/// Consumes transformed documents.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Returns the name of this loader stage.
    fn stage_name(&self) -> &'static str;

    /// One-time setup, run when the ETL is initialized.
    async fn init(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Called once per harvest before the first document.
    async fn prepare(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    async fn load(&mut self, document: Document) -> Result<(), StageError>;

    /// Completes the harvest, flushing anything still buffered.
    async fn finish(&mut self) -> Result<LoadSummary, StageError>;

    /// Whether buffered work can be dropped on abort. Loaders that cannot
    /// cancel are drained through [`finish`](Self::finish) instead.
    fn can_cancel(&self) -> bool {
        false
    }

    async fn cancel(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// The stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Initialization,
    Extraction,
    Transformation,
    Loading,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageKind::Initialization => "Initialization",
            StageKind::Extraction => "Extraction",
            StageKind::Transformation => "Transformation",
            StageKind::Loading => "Loading",
        };
        f.write_str(name)
    }
}

/// Errors raised by stage implementations.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A record could not be turned into a document
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Submission failed: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Event bus error: {0}")]
    Bus(#[from] EventBusError),

    #[error("Stage '{stage}' timed out after {timeout_secs}s")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("{0}")]
    Other(String),
}

/// Errors of ETL and registry operations.
#[derive(Error, Debug)]
pub enum EtlError {
    /// The request is invalid in the current context; nothing was changed
    #[error("Precondition failed: {reason}")]
    Precondition { reason: String },

    #[error("Unknown ETL: {0}")]
    UnknownEtl(String),

    #[error("ETL '{0}' is already registered")]
    DuplicateEtl(String),

    #[error("Unknown loader: {0}")]
    UnknownLoader(String),

    #[error("Loader '{0}' is already registered")]
    DuplicateLoader(String),

    #[error("ETL '{etl}' cannot move from {from} to {to}")]
    InvalidTransition {
        etl: String,
        from: super::EtlStatus,
        to: super::EtlStatus,
    },

    #[error("{stage} of ETL '{etl}' failed: {source}")]
    Stage {
        etl: String,
        stage: StageKind,
        #[source]
        source: StageError,
    },

    #[error("Harvest task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Bus(#[from] EventBusError),
}

impl EtlError {
    pub fn precondition(reason: impl Into<String>) -> Self {
        EtlError::Precondition {
            reason: reason.into(),
        }
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, EtlError::Precondition { .. })
    }
}
