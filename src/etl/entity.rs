//! A single source's extract-transform-load unit.

use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, instrument, warn};

use super::pipeline::{EtlPipeline, HarvestProgress, PipelineRun};
use super::status::{EtlHealth, EtlStatus, History, Timestamped};
use super::traits::{EtlError, Extractor, Loader, Transformer};

/// Mutable bookkeeping of an ETL, guarded as one unit.
#[derive(Debug)]
struct EtlRecord {
    enabled: bool,
    version_hash: Option<String>,
    last_checksum: Option<String>,
    status_history: History<EtlStatus>,
    health_history: History<EtlHealth>,
}

impl EtlRecord {
    fn status(&self) -> EtlStatus {
        self.status_history.latest().unwrap_or(EtlStatus::Initializing)
    }

    fn health(&self) -> EtlHealth {
        self.health_history.latest().unwrap_or(EtlHealth::Ok)
    }
}

/// Observable state of an ETL.
#[derive(Debug, Clone, Serialize)]
pub struct EtlSnapshot {
    pub name: String,
    pub enabled: bool,
    pub status: EtlStatus,
    pub health: EtlHealth,
    pub harvested_count: u64,
    pub max_document_count: Option<u64>,
    pub version_hash: Option<String>,
    pub last_checksum: Option<String>,
    pub status_history: Vec<Timestamped<EtlStatus>>,
    pub health_history: Vec<Timestamped<EtlHealth>>,
}

/// Result of harvesting one ETL.
#[derive(Debug, Clone, Serialize)]
pub struct EtlHarvestOutcome {
    pub name: String,
    pub status: EtlStatus,
    pub health: EtlHealth,
    /// Whether documents were (re)loaded
    pub changed: bool,
    pub documents: u64,
    /// Documents the loader could not deliver
    pub failed_documents: usize,
    pub checksum: Option<String>,
    pub error: Option<String>,
}

impl EtlHarvestOutcome {
    pub fn success(&self) -> bool {
        self.health.is_ok() && self.status != EtlStatus::Aborted
    }

    pub fn aborted(&self) -> bool {
        self.status == EtlStatus::Aborted
    }
}

/// One source's ETL: three stages plus status and health tracking.
pub struct Etl {
    name: String,
    record: Mutex<EtlRecord>,
    progress: HarvestProgress,
    pipeline: AsyncMutex<EtlPipeline>,
}

impl std::fmt::Debug for Etl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Etl")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

impl Etl {
    pub fn new(
        name: impl Into<String>,
        extractor: Box<dyn Extractor>,
        transformer: Box<dyn Transformer>,
        loader: Box<dyn Loader>,
    ) -> Self {
        Self::from_pipeline(name, EtlPipeline::new(extractor, transformer, loader))
    }

    pub fn from_pipeline(name: impl Into<String>, pipeline: EtlPipeline) -> Self {
        Self {
            name: name.into(),
            record: Mutex::new(EtlRecord {
                enabled: true,
                version_hash: None,
                last_checksum: None,
                status_history: History::starting_with(EtlStatus::Initializing),
                health_history: History::starting_with(EtlHealth::Ok),
            }),
            progress: HarvestProgress::default(),
            pipeline: AsyncMutex::new(pipeline),
        }
    }

    /// Sets the per-stage timeout. Only valid before the ETL is shared.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let pipeline = self.pipeline.into_inner().with_timeout(timeout);
        Self {
            pipeline: AsyncMutex::new(pipeline),
            ..self
        }
    }

    fn lock(&self) -> MutexGuard<'_, EtlRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> EtlStatus {
        self.lock().status()
    }

    pub fn health(&self) -> EtlHealth {
        self.lock().health()
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    pub fn harvested_count(&self) -> u64 {
        self.progress.harvested()
    }

    pub fn max_document_count(&self) -> Option<u64> {
        Some(self.progress.max_documents()).filter(|max| *max > 0)
    }

    pub fn version_hash(&self) -> Option<String> {
        self.lock().version_hash.clone()
    }

    pub fn snapshot(&self) -> EtlSnapshot {
        let record = self.lock();
        EtlSnapshot {
            name: self.name.clone(),
            enabled: record.enabled,
            status: record.status(),
            health: record.health(),
            harvested_count: self.harvested_count(),
            max_document_count: self.max_document_count(),
            version_hash: record.version_hash.clone(),
            last_checksum: record.last_checksum.clone(),
            status_history: record.status_history.entries().to_vec(),
            health_history: record.health_history.entries().to_vec(),
        }
    }

    // ------------------------------------------------------------------------
    // Status & health
    // ------------------------------------------------------------------------

    /// Moves to `next`, rejecting moves [`EtlStatus::can_transition_to`]
    /// does not allow.
    pub fn transition(&self, next: EtlStatus) -> Result<(), EtlError> {
        let mut record = self.lock();
        Self::transition_locked(&self.name, &mut record, next)
    }

    fn transition_locked(
        name: &str,
        record: &mut EtlRecord,
        next: EtlStatus,
    ) -> Result<(), EtlError> {
        let current = record.status();
        if !current.can_transition_to(next) {
            return Err(EtlError::InvalidTransition {
                etl: name.to_string(),
                from: current,
                to: next,
            });
        }
        record.status_history.push(next);
        info!(etl = %name, from = %current, to = %next, "ETL status changed");
        Ok(())
    }

    /// Records the latest outcome classification.
    pub fn set_health(&self, health: EtlHealth) {
        if self.lock().health_history.push_if_changed(health) {
            info!(etl = %self.name, health = %health, "ETL health changed");
        }
    }

    /// Settles a finished harvest in `target`, or in `Aborted` if an abort
    /// arrived in the meantime.
    fn settle(&self, target: EtlStatus) -> EtlStatus {
        let mut record = self.lock();
        let next = if record.status() == EtlStatus::Aborting {
            EtlStatus::Aborted
        } else {
            target
        };
        if let Err(e) = Self::transition_locked(&self.name, &mut record, next) {
            warn!(error = %e, "Unexpected ETL status on settle");
        }
        record.status()
    }

    /// Why this ETL cannot start a harvest right now, if anything.
    pub fn check_preconditions(&self) -> Result<(), String> {
        let record = self.lock();
        let status = record.status();

        if !record.enabled {
            return Err(format!("ETL '{}' is disabled", self.name));
        }
        if status.is_in_progress() {
            return Err(format!("ETL '{}' is already harvesting ({})", self.name, status));
        }
        if status == EtlStatus::Initializing {
            return Err(match record.health() {
                EtlHealth::InitializationFailed => {
                    format!("ETL '{}' failed to initialize", self.name)
                }
                _ => format!("ETL '{}' is not initialized", self.name),
            });
        }
        Ok(())
    }

    /// Accepts this ETL into a harvest and resets its counters.
    pub(crate) fn queue(&self) -> Result<(), EtlError> {
        self.transition(EtlStatus::Queued)?;
        self.progress.reset();
        Ok(())
    }

    /// Asks a running harvest to stop. Returns whether one was running.
    pub fn request_abort(&self) -> bool {
        let mut record = self.lock();
        match record.status() {
            EtlStatus::Aborting => true,
            EtlStatus::Queued | EtlStatus::Harvesting => {
                self.progress.request_abort();
                Self::transition_locked(&self.name, &mut record, EtlStatus::Aborting).is_ok()
            }
            _ => false,
        }
    }

    pub fn is_abort_requested(&self) -> bool {
        self.progress.is_abort_requested()
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Runs the one-time setup of all stages.
    #[instrument(skip(self), fields(etl = %self.name))]
    pub async fn init(&self) -> Result<(), EtlError> {
        self.transition(EtlStatus::Initializing)?;

        let result = self.pipeline.lock().await.init().await;
        match result {
            Ok(()) => {
                self.set_health(EtlHealth::Ok);
                self.transition(EtlStatus::Idle)?;
                info!("ETL initialized");
                Ok(())
            }
            Err(failure) => {
                self.set_health(EtlHealth::InitializationFailed);
                error!(error = %failure.error, "ETL initialization failed");
                Err(EtlError::Stage {
                    etl: self.name.clone(),
                    stage: failure.stage,
                    source: failure.error,
                })
            }
        }
    }

    /// Harvests a queued ETL. Failures are recorded in the ETL's health and
    /// in the returned outcome; they never propagate to sibling ETLs.
    #[instrument(skip(self), fields(etl = %self.name))]
    pub async fn harvest(&self, force: bool) -> EtlHarvestOutcome {
        if let Err(e) = self.transition(EtlStatus::Harvesting) {
            // aborted while queued
            let status = self.settle(EtlStatus::Idle);
            return self.outcome(status, false, 0, None, Some(e.to_string()));
        }

        let previous_hash = self.version_hash();
        let mut pipeline = self.pipeline.lock().await;

        match pipeline.run(force, previous_hash.as_deref(), &self.progress).await {
            Ok(PipelineRun::Unchanged { .. }) => {
                self.set_health(EtlHealth::Ok);
                let status = self.settle(EtlStatus::Done);
                let checksum = self.lock().last_checksum.clone();
                self.outcome(status, false, 0, checksum, None)
            }
            Ok(PipelineRun::Completed {
                version_hash,
                checksum,
                load,
                ..
            }) => {
                {
                    let mut record = self.lock();
                    record.version_hash = Some(version_hash);
                    record.last_checksum = Some(checksum.clone());
                }
                self.set_health(EtlHealth::Ok);
                let status = self.settle(EtlStatus::Done);
                let mut outcome =
                    self.outcome(status, true, self.harvested_count(), Some(checksum), load.detail);
                outcome.failed_documents = load.failed;
                outcome
            }
            Ok(PipelineRun::Aborted { .. }) => {
                let status = self.settle(EtlStatus::Aborted);
                self.outcome(status, true, self.harvested_count(), None, None)
            }
            Err(failure) => {
                let message = failure.error.to_string();
                if self.is_abort_requested() {
                    let status = self.settle(EtlStatus::Aborted);
                    return self.outcome(status, true, self.harvested_count(), None, Some(message));
                }

                error!(stage = %failure.stage, error = %message, "Harvest failed");
                self.set_health(failure.stage.into());
                let status = self.settle(EtlStatus::Idle);
                self.outcome(status, true, self.harvested_count(), None, Some(message))
            }
        }
    }

    /// Marks a queued harvest as failed without running it.
    pub(crate) fn fail(&self, health: EtlHealth, reason: impl Into<String>) -> EtlHarvestOutcome {
        let reason = reason.into();
        error!(etl = %self.name, reason = %reason, "Harvest could not run");
        self.set_health(health);
        let status = self.settle(EtlStatus::Idle);
        self.outcome(status, false, self.harvested_count(), None, Some(reason))
    }

    fn outcome(
        &self,
        status: EtlStatus,
        changed: bool,
        documents: u64,
        checksum: Option<String>,
        error: Option<String>,
    ) -> EtlHarvestOutcome {
        EtlHarvestOutcome {
            name: self.name.clone(),
            status,
            health: self.health(),
            changed,
            documents,
            failed_documents: 0,
            checksum,
            error,
        }
    }
}
