//! Loader implementations and the name → loader registry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::traits::{EtlError, LoadSummary, Loader, StageError};
use crate::events::{
    CancelSubmission, CreateLoader, EventBus, FlushSubmission, PrepareSubmission, RequestHandler,
    SubmitDocument,
};
use crate::model::Document;
use crate::submission::{DocumentCache, SessionId};

/// Name of the loader sending documents through the submission pipeline.
pub const SUBMITTING_LOADER: &str = "submit";

/// Name of the loader staging documents in the document cache.
pub const CACHING_LOADER: &str = "cache";

// ============================================================================
// Loader Registry
// ============================================================================

pub type LoaderConstructor = Arc<dyn Fn() -> Box<dyn Loader> + Send + Sync>;

/// Resolves configured loader names to fresh loader instances.
#[derive(Default)]
pub struct LoaderRegistry {
    constructors: RwLock<HashMap<String, LoaderConstructor>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry knowing the `"submit"` and `"cache"` loaders.
    pub fn with_defaults(bus: Arc<EventBus>, cache: Arc<DocumentCache>) -> Result<Self, EtlError> {
        let registry = Self::new();
        registry.register(SUBMITTING_LOADER, move || {
            Box::new(SubmittingLoader::new(Arc::clone(&bus))) as Box<dyn Loader>
        })?;
        registry.register(CACHING_LOADER, move || {
            Box::new(CachingLoader::new(Arc::clone(&cache))) as Box<dyn Loader>
        })?;
        Ok(registry)
    }

    pub fn register<F>(&self, name: impl Into<String>, constructor: F) -> Result<(), EtlError>
    where
        F: Fn() -> Box<dyn Loader> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut constructors = self
            .constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if constructors.contains_key(&name) {
            return Err(EtlError::DuplicateLoader(name));
        }
        debug!(loader = %name, "Loader registered");
        constructors.insert(name, Arc::new(constructor));
        Ok(())
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Loader>, EtlError> {
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| EtlError::UnknownLoader(name.to_string()))?;
        Ok(constructor())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl RequestHandler<CreateLoader> for LoaderRegistry {
    async fn handle(&self, request: CreateLoader) -> Result<Box<dyn Loader>, EtlError> {
        self.create(&request.name)
    }
}

// ============================================================================
// Submitting Loader
// ============================================================================

/// Routes every document through the event bus to the submission pipeline.
/// Each harvest runs in its own submission session, so loaders of ETLs
/// harvested side by side never share a batch or a report.
pub struct SubmittingLoader {
    bus: Arc<EventBus>,
    session: Option<SessionId>,
}

impl SubmittingLoader {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus, session: None }
    }

    fn session(&self) -> Result<SessionId, StageError> {
        self.session
            .ok_or_else(|| StageError::Other("no submission session is open".to_string()))
    }
}

#[async_trait]
impl Loader for SubmittingLoader {
    fn stage_name(&self) -> &'static str {
        "submitting_loader"
    }

    async fn prepare(&mut self) -> Result<(), StageError> {
        if let Some(stale) = self.session.take() {
            let dropped = self.bus.request(CancelSubmission { session: stale }).await?;
            warn!(session = stale, dropped, "Closed unfinished submission session");
        }
        self.session = Some(self.bus.request(PrepareSubmission).await??);
        Ok(())
    }

    async fn load(&mut self, document: Document) -> Result<(), StageError> {
        let id = document.id.clone();
        let accepted = self
            .bus
            .request(SubmitDocument {
                session: self.session()?,
                document_id: document.id,
                document: Some(document.content),
            })
            .await??;
        if !accepted {
            debug!(id = %id, "Document rejected by the submission pipeline");
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<LoadSummary, StageError> {
        let session = self.session()?;
        let report = self.bus.request(FlushSubmission { session }).await??;
        self.session = None;
        info!("{}", report.summary());
        Ok(LoadSummary {
            loaded: report.submitted,
            failed: report.failed_count(),
            detail: (report.failed_count() > 0).then(|| report.summary()),
        })
    }

    fn can_cancel(&self) -> bool {
        true
    }

    async fn cancel(&mut self) -> Result<(), StageError> {
        if let Some(session) = self.session.take() {
            let dropped = self.bus.request(CancelSubmission { session }).await?;
            debug!(session, dropped, "Submission cancelled");
        }
        Ok(())
    }
}

// ============================================================================
// Caching Loader
// ============================================================================

/// Stages documents in a [`DocumentCache`] for a later submission.
pub struct CachingLoader {
    cache: Arc<DocumentCache>,
    partition: u64,
    loaded: usize,
}

impl CachingLoader {
    pub fn new(cache: Arc<DocumentCache>) -> Self {
        let partition = cache.new_partition();
        Self {
            cache,
            partition,
            loaded: 0,
        }
    }
}

#[async_trait]
impl Loader for CachingLoader {
    fn stage_name(&self) -> &'static str {
        "caching_loader"
    }

    async fn prepare(&mut self) -> Result<(), StageError> {
        self.loaded = 0;
        self.cache.begin(self.partition);
        Ok(())
    }

    async fn load(&mut self, document: Document) -> Result<(), StageError> {
        self.cache
            .insert(self.partition, document.id, Some(document.content));
        self.loaded += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<LoadSummary, StageError> {
        Ok(LoadSummary {
            loaded: self.loaded,
            ..LoadSummary::default()
        })
    }

    fn can_cancel(&self) -> bool {
        true
    }

    async fn cancel(&mut self) -> Result<(), StageError> {
        let dropped = self.cache.discard(self.partition);
        debug!(dropped, "Staged documents discarded");
        Ok(())
    }
}
