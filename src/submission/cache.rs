//! Staged documents and their deferred submission.
//!
//! A [`DocumentCache`] keeps the documents of the latest harvest in memory
//! until a `StartSubmission` event asks the [`SubmissionService`] to send
//! them. The cache remembers which harvest produced its documents, so that
//! documents from a failed harvest, or documents older than the latest
//! harvest, are only sent when the caller allows it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, instrument, warn};

use super::pipeline::SubmissionPipeline;
use super::{SubmissionError, SubmissionReport};
use crate::events::{EventBus, EventListener, HarvestFinished, StartSubmission, SubmissionStarted};
use crate::lifecycle::{ServiceStates, StateKind, StateMachine};
use crate::model::DocumentContent;

// ============================================================================
// Document Cache
// ============================================================================

/// The harvest the cached documents belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedHarvest {
    pub success: bool,
    pub checksum: String,
    pub finished_at: DateTime<Utc>,
}

type Partition = BTreeMap<String, Option<DocumentContent>>;

#[derive(Debug, Default)]
struct CacheState {
    partitions: HashMap<u64, Partition>,
    /// A loader wrote to the cache since the last HarvestFinished
    touched: bool,
    harvest: Option<CachedHarvest>,
    /// A later harvest produced other documents than the cached ones
    outdated: bool,
}

/// In-memory staging area filled by caching loaders. Each loader owns one
/// partition, which it replaces on every harvest.
#[derive(Debug, Default)]
pub struct DocumentCache {
    state: Mutex<CacheState>,
    next_partition: AtomicU64,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn new_partition(&self) -> u64 {
        self.next_partition.fetch_add(1, Ordering::Relaxed)
    }

    /// Starts refilling `partition`.
    pub fn begin(&self, partition: u64) {
        let mut state = self.lock();
        state.partitions.insert(partition, Partition::new());
        state.touched = true;
    }

    /// Stages a document, `None` staging its deletion.
    pub fn insert(&self, partition: u64, id: impl Into<String>, document: Option<DocumentContent>) {
        self.lock()
            .partitions
            .entry(partition)
            .or_default()
            .insert(id.into(), document);
    }

    /// Drops everything staged in `partition`.
    pub fn discard(&self, partition: u64) -> usize {
        self.lock()
            .partitions
            .remove(&partition)
            .map_or(0, |documents| documents.len())
    }

    pub fn len(&self) -> usize {
        self.lock().partitions.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn harvest(&self) -> Option<CachedHarvest> {
        self.lock().harvest.clone()
    }

    pub fn is_outdated(&self) -> bool {
        self.lock().outdated
    }

    /// All staged documents, ordered by partition and id.
    pub fn documents(&self) -> Vec<(String, Option<DocumentContent>)> {
        let state = self.lock();
        let mut partitions: Vec<_> = state.partitions.iter().collect();
        partitions.sort_by_key(|(partition, _)| **partition);
        partitions
            .into_iter()
            .flat_map(|(_, documents)| documents.iter().map(|(id, doc)| (id.clone(), doc.clone())))
            .collect()
    }

    /// Associates the staged documents with a finished harvest.
    pub fn harvest_finished(&self, event: &HarvestFinished) {
        let mut state = self.lock();
        if state.touched {
            state.touched = false;
            state.outdated = false;
            state.harvest = Some(CachedHarvest {
                success: event.success,
                checksum: event.document_checksum.clone(),
                finished_at: event.end_timestamp,
            });
            return;
        }

        let differs = state
            .harvest
            .as_ref()
            .is_some_and(|harvest| harvest.checksum != event.document_checksum);
        if differs {
            warn!("Cached documents are older than the latest harvest");
            state.outdated = true;
        }
    }
}

impl EventListener<HarvestFinished> for DocumentCache {
    fn on_event(&self, event: &HarvestFinished) -> anyhow::Result<()> {
        self.harvest_finished(event);
        Ok(())
    }
}

// ============================================================================
// Submission Service
// ============================================================================

/// Sends the cached documents through the submission pipeline.
#[derive(Clone)]
pub struct SubmissionService {
    cache: Arc<DocumentCache>,
    pipeline: Arc<SubmissionPipeline>,
    bus: Arc<EventBus>,
    machine: Arc<StateMachine>,
    states: Arc<ServiceStates>,
}

impl SubmissionService {
    pub fn new(
        cache: Arc<DocumentCache>,
        pipeline: Arc<SubmissionPipeline>,
        bus: Arc<EventBus>,
        machine: Arc<StateMachine>,
        states: Arc<ServiceStates>,
    ) -> Self {
        Self {
            cache,
            pipeline,
            bus,
            machine,
            states,
        }
    }

    fn check_cache(&self, flags: StartSubmission) -> Result<(), SubmissionError> {
        if let Some(harvest) = self.cache.harvest() {
            if !harvest.success && !flags.can_submit_failed_documents {
                return Err(SubmissionError::FailedHarvest);
            }
        }
        if self.cache.is_outdated() && !flags.can_submit_outdated_documents {
            return Err(SubmissionError::OutdatedDocuments);
        }
        Ok(())
    }

    /// Submits every cached document.
    ///
    /// # Errors
    ///
    /// Fails without sending anything if the service is not idle, or if the
    /// cached documents are outdated or stem from a failed harvest and
    /// `flags` do not allow that. Fails part-way on pipeline-fatal errors,
    /// in which case the pending batch is dropped.
    #[instrument(skip(self))]
    pub async fn submit_cached(
        &self,
        flags: StartSubmission,
    ) -> Result<SubmissionReport, SubmissionError> {
        self.check_cache(flags)?;

        let documents = self.cache.documents();
        if documents.is_empty() {
            info!("No cached documents to submit");
            return Ok(SubmissionReport::default());
        }

        self.machine
            .transition_from(&[StateKind::Idle], self.states.get(StateKind::Submitting))
            .map_err(SubmissionError::refused_in)?;
        self.bus.publish(&SubmissionStarted {
            document_count: documents.len(),
        });

        let result = self.send(documents).await;
        // an abort that took over keeps its state
        let _ = self
            .machine
            .transition_from(&[StateKind::Submitting], self.states.get(StateKind::Idle));
        result
    }

    async fn send(
        &self,
        documents: Vec<(String, Option<DocumentContent>)>,
    ) -> Result<SubmissionReport, SubmissionError> {
        let session = self.pipeline.prepare().await?;
        for (id, document) in documents {
            if let Err(e) = self.pipeline.submit(session, id, document).await {
                self.pipeline.discard(session).await;
                return Err(e);
            }
        }
        match self.pipeline.flush(session).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.pipeline.discard(session).await;
                Err(e)
            }
        }
    }
}

impl EventListener<StartSubmission> for SubmissionService {
    fn on_event(&self, event: &StartSubmission) -> anyhow::Result<()> {
        let handle = tokio::runtime::Handle::try_current()?;
        let service = self.clone();
        let flags = *event;

        handle.spawn(async move {
            match service.submit_cached(flags).await {
                Ok(report) => info!("{}", report.summary()),
                Err(e) => error!(error = %e, "Submission failed"),
            }
        });
        Ok(())
    }
}
