//! Registry of all ETLs and the cross-ETL harvest operations.
//!
//! Every operation that reads or mutates the state of several ETLs at once
//! runs under the registry lock, so no operation observes another one
//! half-done.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use super::entity::{Etl, EtlHarvestOutcome, EtlSnapshot};
use super::status::EtlHealth;
use super::traits::EtlError;
use crate::events::{
    AbortHarvest, ChangeState, EventBus, HarvestFinished, RequestHandler, StartHarvest,
};
use crate::executor::HarvestExecutor;
use crate::lifecycle::{ServiceStates, StateKind, StateMachine};

// ============================================================================
// Harvest Types
// ============================================================================

/// An ETL left out of a harvest, with the reason why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEtl {
    pub name: String,
    pub reason: String,
}

/// Aggregated result of one harvest over all participating ETLs.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestOutcome {
    /// Every participating ETL finished without failure or abort
    pub success: bool,
    pub aborted: bool,
    /// At least one ETL loaded new documents
    pub changed: bool,
    pub documents: u64,
    pub failed_documents: usize,
    /// SHA-256 over the per-ETL checksums, in registration order
    pub checksum: String,
    pub finished_at: DateTime<Utc>,
    pub etls: Vec<EtlHarvestOutcome>,
}

impl HarvestOutcome {
    fn from_etls(etls: Vec<EtlHarvestOutcome>) -> Self {
        let mut hasher = Sha256::new();
        for etl in &etls {
            if let Some(checksum) = &etl.checksum {
                hasher.update(etl.name.as_bytes());
                hasher.update([0u8]);
                hasher.update(checksum.as_bytes());
            }
        }

        Self {
            success: etls.iter().all(EtlHarvestOutcome::success),
            aborted: etls.iter().any(EtlHarvestOutcome::aborted),
            changed: etls.iter().any(|etl| etl.changed),
            documents: etls.iter().map(|etl| etl.documents).sum(),
            failed_documents: etls.iter().map(|etl| etl.failed_documents).sum(),
            checksum: hex::encode(hasher.finalize()),
            finished_at: Utc::now(),
            etls,
        }
    }

    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        let state = if self.aborted {
            "aborted"
        } else if self.success {
            "succeeded"
        } else {
            "failed"
        };
        format!(
            "Harvest {} ({} ETLs, {} documents, {} failed, {})",
            state,
            self.etls.len(),
            self.documents,
            self.failed_documents,
            if self.changed { "changed" } else { "unchanged" }
        )
    }
}

/// Handle on the background part of a started harvest.
#[derive(Debug)]
pub struct HarvestCompletion(JoinHandle<HarvestOutcome>);

impl HarvestCompletion {
    /// Waits for every ETL of the harvest to settle.
    pub async fn wait(self) -> Result<HarvestOutcome, EtlError> {
        self.0.await.map_err(|e| EtlError::Join(e.to_string()))
    }
}

/// Response to a successfully started harvest.
#[derive(Debug)]
pub struct HarvestStarted {
    pub started: Vec<String>,
    pub skipped: Vec<SkippedEtl>,
    pub completion: HarvestCompletion,
}

/// Observable state of the whole registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub is_harvesting: bool,
    pub harvested_count: u64,
    pub max_document_count: u64,
    pub etls: Vec<EtlSnapshot>,
    pub last_harvest: Option<HarvestOutcome>,
}

// ============================================================================
// Registry
// ============================================================================

struct RegistryInner {
    etls: AsyncMutex<Vec<Arc<Etl>>>,
    bus: Arc<EventBus>,
    machine: Arc<StateMachine>,
    states: Arc<ServiceStates>,
    executor: HarvestExecutor,
    last_harvest: Mutex<Option<HarvestOutcome>>,
}

impl RegistryInner {
    fn change_state(&self, kind: StateKind) {
        self.bus.publish(&ChangeState::to(self.states.get(kind)));
    }

    /// Moves the service from Idle to `kind`, refusing to `action` in any
    /// other state.
    fn enter_from_idle(&self, kind: StateKind, action: &str) -> Result<(), EtlError> {
        self.machine
            .transition_from(&[StateKind::Idle], self.states.get(kind))
            .map_err(|state| match state {
                Some(state) => EtlError::precondition(format!(
                    "Cannot {} while the service is {}",
                    action, state
                )),
                None => EtlError::precondition(format!(
                    "Cannot {} before the service is started",
                    action
                )),
            })
    }

    fn last_harvest(&self) -> Option<HarvestOutcome> {
        self.last_harvest.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Clone)]
pub struct EtlRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for EtlRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtlRegistry").finish_non_exhaustive()
    }
}

impl EtlRegistry {
    pub fn new(
        bus: Arc<EventBus>,
        machine: Arc<StateMachine>,
        states: Arc<ServiceStates>,
        executor: HarvestExecutor,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                etls: AsyncMutex::new(Vec::new()),
                bus,
                machine,
                states,
                executor,
                last_harvest: Mutex::new(None),
            }),
        }
    }

    /// Adds an ETL. Names are unique.
    pub async fn register(&self, etl: Etl) -> Result<Arc<Etl>, EtlError> {
        let mut etls = self.inner.etls.lock().await;
        if etls.iter().any(|known| known.name() == etl.name()) {
            return Err(EtlError::DuplicateEtl(etl.name().to_string()));
        }
        info!(etl = %etl.name(), "ETL registered");
        let etl = Arc::new(etl);
        etls.push(Arc::clone(&etl));
        Ok(etl)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Etl>> {
        let etls = self.inner.etls.lock().await;
        etls.iter().find(|etl| etl.name() == name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let etls = self.inner.etls.lock().await;
        etls.iter().map(|etl| etl.name().to_string()).collect()
    }

    /// Initializes every ETL that is not in progress. Failing ETLs keep an
    /// `INITIALIZATION_FAILED` health; the others become harvestable.
    #[instrument(skip(self))]
    pub async fn init_all(&self) -> Result<usize, EtlError> {
        let etls = self.inner.etls.lock().await;
        if let Some(busy) = etls.iter().find(|etl| etl.status().is_in_progress()) {
            return Err(EtlError::precondition(format!(
                "Cannot initialize while ETL '{}' is harvesting",
                busy.name()
            )));
        }

        self.inner.enter_from_idle(StateKind::Initializing, "initialize")?;
        let mut initialized = 0;
        for etl in etls.iter() {
            match etl.init().await {
                Ok(()) => initialized += 1,
                Err(e) => warn!(etl = %etl.name(), error = %e, "ETL not initialized"),
            }
        }
        self.inner.change_state(StateKind::Idle);

        info!(initialized, total = etls.len(), "ETLs initialized");
        Ok(initialized)
    }

    /// Starts a harvest of every eligible ETL in the background.
    ///
    /// # Errors
    ///
    /// Returns a precondition error, without touching any ETL, if a harvest
    /// is already in progress, if no ETL is eligible, or if the service is
    /// not idle (e.g. submitting). ETLs that are
    /// disabled or not initialized are skipped and listed in the response.
    #[instrument(skip(self))]
    pub async fn harvest(&self, force: bool) -> Result<HarvestStarted, EtlError> {
        let etls = self.inner.etls.lock().await;

        if let Some(busy) = etls.iter().find(|etl| etl.status().is_in_progress()) {
            return Err(EtlError::precondition(format!(
                "Cannot start a harvest: ETL '{}' is already harvesting",
                busy.name()
            )));
        }

        let mut eligible = Vec::new();
        let mut skipped = Vec::new();
        for etl in etls.iter() {
            match etl.check_preconditions() {
                Ok(()) => eligible.push(Arc::clone(etl)),
                Err(reason) => {
                    info!(etl = %etl.name(), reason = %reason, "ETL skipped");
                    skipped.push(SkippedEtl {
                        name: etl.name().to_string(),
                        reason,
                    });
                }
            }
        }

        if eligible.is_empty() {
            let reason = if skipped.is_empty() {
                "Cannot start a harvest: no ETL is registered".to_string()
            } else {
                let reasons: Vec<&str> = skipped.iter().map(|s| s.reason.as_str()).collect();
                format!("Cannot start a harvest: {}", reasons.join("; "))
            };
            return Err(EtlError::precondition(reason));
        }

        self.inner.enter_from_idle(StateKind::Harvesting, "start a harvest")?;
        if let Err(e) = eligible.iter().try_for_each(|etl| etl.queue()) {
            self.inner.change_state(StateKind::Idle);
            return Err(e);
        }

        let started = eligible.iter().map(|etl| etl.name().to_string()).collect();
        info!(started = ?started, skipped = skipped.len(), force, "Harvest started");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_harvest(inner, eligible, force));

        Ok(HarvestStarted {
            started,
            skipped,
            completion: HarvestCompletion(handle),
        })
    }

    /// Asks every in-progress ETL to stop. Returns how many were asked.
    #[instrument(skip(self))]
    pub async fn abort(&self) -> Result<usize, EtlError> {
        let etls = self.inner.etls.lock().await;

        let aborting = etls.iter().filter(|etl| etl.request_abort()).count();
        if aborting == 0 {
            return Err(EtlError::precondition("Cannot abort: no harvest is in progress"));
        }

        self.inner.change_state(StateKind::Aborting);
        info!(aborting, "Harvest abort requested");
        Ok(aborting)
    }

    pub async fn is_harvesting(&self) -> bool {
        let etls = self.inner.etls.lock().await;
        etls.iter().any(|etl| etl.status().is_in_progress())
    }

    /// Whether the last harvest loaded new documents.
    pub async fn has_changes(&self) -> bool {
        let _etls = self.inner.etls.lock().await;
        self.inner.last_harvest().is_some_and(|outcome| outcome.changed)
    }

    /// Whether the last harvest produced documents that still have to be
    /// submitted.
    pub async fn is_submission_required(&self) -> bool {
        let _etls = self.inner.etls.lock().await;
        self.inner
            .last_harvest()
            .is_some_and(|outcome| outcome.changed && !outcome.aborted)
    }

    pub async fn last_harvest(&self) -> Option<HarvestOutcome> {
        let _etls = self.inner.etls.lock().await;
        self.inner.last_harvest()
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let etls = self.inner.etls.lock().await;
        let etl_snapshots: Vec<EtlSnapshot> = etls.iter().map(|etl| etl.snapshot()).collect();

        RegistrySnapshot {
            is_harvesting: etl_snapshots.iter().any(|etl| etl.status.is_in_progress()),
            harvested_count: etl_snapshots.iter().map(|etl| etl.harvested_count).sum(),
            max_document_count: etl_snapshots
                .iter()
                .filter_map(|etl| etl.max_document_count)
                .sum(),
            etls: etl_snapshots,
            last_harvest: self.inner.last_harvest(),
        }
    }
}

async fn run_harvest(
    inner: Arc<RegistryInner>,
    etls: Vec<Arc<Etl>>,
    force: bool,
) -> HarvestOutcome {
    let tasks = etls.iter().map(|etl| {
        let executor = inner.executor.clone();
        let etl = Arc::clone(etl);
        tokio::spawn(async move { executor.execute(etl, force).await })
    });
    let results = join_all(tasks).await;

    let outcomes = results
        .into_iter()
        .zip(&etls)
        .map(|(result, etl)| {
            result.unwrap_or_else(|e| {
                etl.fail(EtlHealth::HarvestFailed, format!("Harvest task failed: {}", e))
            })
        })
        .collect();
    let outcome = HarvestOutcome::from_etls(outcomes);

    // settle under the registry lock so an abort cannot slip in between
    let _etls = inner.etls.lock().await;
    *inner.last_harvest.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome.clone());

    info!(
        success = outcome.success,
        changed = outcome.changed,
        documents = outcome.documents,
        "{}",
        outcome.summary()
    );
    inner.bus.publish(&HarvestFinished {
        success: outcome.success,
        document_checksum: outcome.checksum.clone(),
        end_timestamp: outcome.finished_at,
    });
    inner.change_state(StateKind::Idle);

    outcome
}

// ============================================================================
// Event Handlers
// ============================================================================

#[async_trait]
impl RequestHandler<StartHarvest> for EtlRegistry {
    async fn handle(&self, request: StartHarvest) -> Result<HarvestStarted, EtlError> {
        self.harvest(request.force).await
    }
}

#[async_trait]
impl RequestHandler<AbortHarvest> for EtlRegistry {
    async fn handle(&self, _request: AbortHarvest) -> Result<usize, EtlError> {
        self.abort().await
    }
}
