//! Extract → transform → load executor of a single ETL.
//!
//! [`EtlPipeline`] owns the three stages and drives one harvest through
//! them with:
//! - a timeout on every non-streaming stage call
//! - incremental change detection via the extractor's version hash
//! - cooperative abort, checked between documents
//! - a SHA-256 checksum over every harvested document

use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::traits::{Extractor, LoadSummary, Loader, StageError, StageKind, Transformer};

/// Default timeout for each stage call (5 minutes).
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

// ============================================================================
// Pipeline Types
// ============================================================================

/// Live counters of the running harvest, shared with the owning ETL.
#[derive(Debug, Default)]
pub struct HarvestProgress {
    harvested: AtomicU64,
    max_documents: AtomicU64,
    abort_requested: AtomicBool,
}

impl HarvestProgress {
    pub fn harvested(&self) -> u64 {
        self.harvested.load(Ordering::Acquire)
    }

    /// Estimated total, 0 when unknown
    pub fn max_documents(&self) -> u64 {
        self.max_documents.load(Ordering::Acquire)
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        self.harvested.store(0, Ordering::Release);
        self.max_documents.store(0, Ordering::Release);
        self.abort_requested.store(false, Ordering::Release);
    }

    fn document_harvested(&self) {
        self.harvested.fetch_add(1, Ordering::AcqRel);
    }

    fn set_max_documents(&self, max: u64) {
        self.max_documents.store(max, Ordering::Release);
    }
}

/// Statistics about one harvest run.
#[derive(Debug, Default, Clone)]
pub struct HarvestStats {
    pub total_duration_ms: u64,
    pub extraction_duration_ms: u64,
    pub documents: u64,
    /// Records the transformer chose to skip
    pub skipped_records: u64,
}

/// How a harvest run ended.
#[derive(Debug)]
pub enum PipelineRun {
    /// Source version equals the previous one; nothing was loaded
    Unchanged { version_hash: String },

    Completed {
        version_hash: String,
        checksum: String,
        load: LoadSummary,
        stats: HarvestStats,
    },

    Aborted { stats: HarvestStats },
}

/// A stage failure of a harvest run.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: StageKind,
    pub error: StageError,
}

impl StageFailure {
    fn at(stage: StageKind) -> impl FnOnce(StageError) -> Self {
        move |error| Self { stage, error }
    }
}

// ============================================================================
// Pipeline Executor
// ============================================================================

pub struct EtlPipeline {
    extractor: Box<dyn Extractor>,
    transformer: Box<dyn Transformer>,
    loader: Box<dyn Loader>,

    /// Timeout for each stage call (default: 5 minutes)
    stage_timeout: Duration,
}

impl EtlPipeline {
    pub fn new(
        extractor: Box<dyn Extractor>,
        transformer: Box<dyn Transformer>,
        loader: Box<dyn Loader>,
    ) -> Self {
        Self {
            extractor,
            transformer,
            loader,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Runs the one-time setup of extractor and loader.
    pub async fn init(&mut self) -> Result<(), StageFailure> {
        let stage_timeout = self.stage_timeout;
        let extractor_name = self.extractor.stage_name();
        let loader_name = self.loader.stage_name();

        with_timeout(stage_timeout, extractor_name, self.extractor.init())
            .await
            .map_err(StageFailure::at(StageKind::Initialization))?;
        with_timeout(stage_timeout, loader_name, self.loader.init())
            .await
            .map_err(StageFailure::at(StageKind::Initialization))?;
        Ok(())
    }

    /// Executes one harvest.
    ///
    /// When `force` is false and the extracted version hash equals
    /// `previous_hash`, no document is loaded.
    pub async fn run(
        &mut self,
        force: bool,
        previous_hash: Option<&str>,
        progress: &HarvestProgress,
    ) -> Result<PipelineRun, StageFailure> {
        let start = Instant::now();
        let mut stats = HarvestStats::default();

        // ====================================================================
        // Stage 1: Extraction
        // ====================================================================

        let extractor_name = self.extractor.stage_name();
        let extraction = with_timeout(self.stage_timeout, extractor_name, self.extractor.extract())
            .await
            .map_err(StageFailure::at(StageKind::Extraction))?;

        stats.extraction_duration_ms = start.elapsed().as_millis() as u64;
        if let Some(estimate) = extraction.size_estimate {
            progress.set_max_documents(estimate);
        }
        info!(
            duration_ms = stats.extraction_duration_ms,
            version_hash = %extraction.version_hash,
            size_estimate = ?extraction.size_estimate,
            "Extraction completed"
        );

        if !force && previous_hash == Some(extraction.version_hash.as_str()) {
            info!("Source unchanged since last harvest, skipping");
            return Ok(PipelineRun::Unchanged {
                version_hash: extraction.version_hash,
            });
        }

        // ====================================================================
        // Stage 2: Transformation & Loading, one document at a time
        // ====================================================================

        let loader_name = self.loader.stage_name();
        with_timeout(self.stage_timeout, loader_name, self.loader.prepare())
            .await
            .map_err(StageFailure::at(StageKind::Loading))?;

        let mut hasher = Sha256::new();
        let mut records = extraction.records;

        while let Some(record) = records.next().await {
            if progress.is_abort_requested() {
                return Ok(self.abort(stats, start).await);
            }

            let record = record.map_err(StageFailure::at(StageKind::Extraction))?;
            let document = match self
                .transformer
                .transform(record)
                .map_err(StageFailure::at(StageKind::Transformation))?
            {
                Some(document) => document,
                None => {
                    stats.skipped_records += 1;
                    continue;
                }
            };

            let content = serde_json::to_vec(&document.content)
                .map_err(|e| StageFailure::at(StageKind::Transformation)(e.into()))?;
            hasher.update(document.id.as_bytes());
            hasher.update([0u8]);
            hasher.update(&content);

            if let Err(error) = self.loader.load(document).await {
                if progress.is_abort_requested() {
                    debug!(error = %error, "Load failed while aborting");
                    return Ok(self.abort(stats, start).await);
                }
                return Err(StageFailure {
                    stage: StageKind::Loading,
                    error,
                });
            }

            progress.document_harvested();
            stats.documents += 1;
        }

        if progress.is_abort_requested() {
            return Ok(self.abort(stats, start).await);
        }

        // ====================================================================
        // Stage 3: Finish loading
        // ====================================================================

        let load = with_timeout(self.stage_timeout, loader_name, self.loader.finish())
            .await
            .map_err(StageFailure::at(StageKind::Loading))?;

        stats.total_duration_ms = start.elapsed().as_millis() as u64;
        info!(
            duration_ms = stats.total_duration_ms,
            documents = stats.documents,
            skipped = stats.skipped_records,
            loaded = load.loaded,
            failed = load.failed,
            "Harvest completed"
        );

        Ok(PipelineRun::Completed {
            version_hash: extraction.version_hash,
            checksum: hex::encode(hasher.finalize()),
            load,
            stats,
        })
    }

    /// Drops or drains buffered loader work, depending on what the loader
    /// supports.
    async fn abort(&mut self, mut stats: HarvestStats, start: Instant) -> PipelineRun {
        let loader_name = self.loader.stage_name();
        let result = if self.loader.can_cancel() {
            with_timeout(self.stage_timeout, loader_name, self.loader.cancel()).await
        } else {
            with_timeout(self.stage_timeout, loader_name, self.loader.finish())
                .await
                .map(|_| ())
        };

        if let Err(e) = result {
            warn!(error = %e, loader = loader_name, "Loader did not settle cleanly on abort");
        }

        stats.total_duration_ms = start.elapsed().as_millis() as u64;
        info!(documents = stats.documents, "Harvest aborted");
        PipelineRun::Aborted { stats }
    }
}

async fn with_timeout<T, F>(limit: Duration, stage: &'static str, call: F) -> Result<T, StageError>
where
    F: Future<Output = Result<T, StageError>>,
{
    timeout(limit, call).await.map_err(|_| StageError::Timeout {
        stage: stage.to_string(),
        timeout_secs: limit.as_secs(),
    })?
}

// ============================================================================
// Tests
// ============================================================================
