//! The assembled harvesting service.
//!
//! [`HarvesterService`] creates one event bus, state machine, registry and
//! submission pipeline and connects them through the bus. Callers such as a
//! scheduler or a control surface only talk to the service (or send events
//! on its bus); the components never reference each other directly.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, ServiceConfig, SharedSubmissionConfig, SubmissionConfig};
use crate::etl::{
    Etl, EtlError, EtlRegistry, HarvestStarted, Loader, LoaderRegistry, RegistrySnapshot,
};
use crate::events::{
    AbortHarvest, CancelSubmission, ChangeState, CreateLoader, EventBus, EventBusError,
    FlushSubmission, HarvestFinished, PrepareSubmission, StartHarvest, StartSubmission,
    SubmitDocument,
};
use crate::executor::HarvestExecutor;
use crate::lifecycle::{ServiceStates, StateKind, StateMachine};
use crate::submission::{
    BulkClient, CachedHarvest, DocumentCache, HttpBulkClient, SubmissionError, SubmissionPipeline,
    SubmissionReport, SubmissionService,
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Etl(#[from] EtlError),

    #[error(transparent)]
    Bus(#[from] EventBusError),
}

/// Observable state of the whole service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub state: Option<StateKind>,
    pub registry: RegistrySnapshot,
    pub cached_documents: usize,
    pub cached_harvest: Option<CachedHarvest>,
    pub cache_outdated: bool,
}

pub struct HarvesterService {
    bus: Arc<EventBus>,
    machine: Arc<StateMachine>,
    registry: EtlRegistry,
    loaders: Arc<LoaderRegistry>,
    cache: Arc<DocumentCache>,
    submission: SubmissionService,
    submission_config: SharedSubmissionConfig,
}

impl std::fmt::Debug for HarvesterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvesterService")
            .field("state", &self.machine.current_kind())
            .field("submission_config", &self.submission_config)
            .finish_non_exhaustive()
    }
}

impl HarvesterService {
    /// Builds a service submitting over HTTP.
    pub fn new(config: ServiceConfig) -> Result<Self, ServiceError> {
        let timeout = Duration::from_secs(config.submission.request_timeout_secs);
        let client = HttpBulkClient::new(timeout)?;
        Self::with_client(config, Arc::new(client))
    }

    /// Builds a service submitting through `client`.
    pub fn with_client(
        config: ServiceConfig,
        client: Arc<dyn BulkClient>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let bus = Arc::new(EventBus::new());
        let machine = Arc::new(StateMachine::new());
        let states = Arc::new(ServiceStates::new());
        let submission_config = SharedSubmissionConfig::new(config.submission.clone());

        let registry = EtlRegistry::new(
            Arc::clone(&bus),
            Arc::clone(&machine),
            Arc::clone(&states),
            HarvestExecutor::new(config.max_concurrent_etls),
        );
        let pipeline = Arc::new(SubmissionPipeline::new(
            submission_config.clone(),
            client,
            Arc::clone(&machine),
            Arc::clone(&bus),
        )?);
        let cache = Arc::new(DocumentCache::new());
        let loaders = Arc::new(LoaderRegistry::with_defaults(
            Arc::clone(&bus),
            Arc::clone(&cache),
        )?);
        let submission = SubmissionService::new(
            Arc::clone(&cache),
            Arc::clone(&pipeline),
            Arc::clone(&bus),
            Arc::clone(&machine),
            Arc::clone(&states),
        );

        bus.add_listener::<ChangeState>(machine.clone());
        bus.add_listener::<HarvestFinished>(cache.clone());
        bus.add_listener::<StartSubmission>(Arc::new(submission.clone()));

        bus.register_handler::<StartHarvest>(Arc::new(registry.clone()))?;
        bus.register_handler::<AbortHarvest>(Arc::new(registry.clone()))?;
        bus.register_handler::<CreateLoader>(loaders.clone())?;
        bus.register_handler::<PrepareSubmission>(pipeline.clone())?;
        bus.register_handler::<SubmitDocument>(pipeline.clone())?;
        bus.register_handler::<FlushSubmission>(pipeline.clone())?;
        bus.register_handler::<CancelSubmission>(pipeline)?;

        bus.publish(&ChangeState::to(states.get(StateKind::Idle)));
        info!(
            bulk_url = ?config.submission.url,
            max_batch_bytes = config.submission.max_batch_bytes,
            max_concurrent_etls = config.max_concurrent_etls,
            "Harvester service ready"
        );

        Ok(Self {
            bus,
            machine,
            registry,
            loaders,
            cache,
            submission,
            submission_config,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &EtlRegistry {
        &self.registry
    }

    pub fn loaders(&self) -> &LoaderRegistry {
        &self.loaders
    }

    pub fn state(&self) -> Option<StateKind> {
        self.machine.current_kind()
    }

    // ------------------------------------------------------------------------
    // ETLs
    // ------------------------------------------------------------------------

    pub async fn register_etl(&self, etl: Etl) -> Result<Arc<Etl>, EtlError> {
        self.registry.register(etl).await
    }

    /// Creates a loader from its registered name.
    pub async fn create_loader(&self, name: &str) -> Result<Box<dyn Loader>, EtlError> {
        self.bus
            .request(CreateLoader {
                name: name.to_string(),
            })
            .await?
    }

    /// Initializes every registered ETL. Returns how many succeeded.
    pub async fn init(&self) -> Result<usize, EtlError> {
        self.registry.init_all().await
    }

    // ------------------------------------------------------------------------
    // Harvest & submission
    // ------------------------------------------------------------------------

    /// Starts a harvest. Safe to call from any task; this is the entry
    /// point for schedulers.
    pub async fn trigger_harvest(&self, force: bool) -> Result<HarvestStarted, EtlError> {
        self.bus.request(StartHarvest { force }).await?
    }

    pub async fn abort(&self) -> Result<usize, EtlError> {
        self.bus.request(AbortHarvest).await?
    }

    /// Submits the cached documents and waits for the result.
    pub async fn submit_cached(
        &self,
        flags: StartSubmission,
    ) -> Result<SubmissionReport, SubmissionError> {
        self.submission.submit_cached(flags).await
    }

    /// Starts a submission of the cached documents in the background.
    pub fn start_submission(&self, flags: StartSubmission) {
        self.bus.publish(&flags);
    }

    /// Replaces the submission settings for the following submissions.
    pub fn reconfigure(&self, config: SubmissionConfig) -> Result<(), ConfigError> {
        self.submission_config.replace(config)?;
        info!("Submission configuration replaced");
        Ok(())
    }

    pub async fn status(&self) -> ServiceStatus {
        ServiceStatus {
            state: self.machine.current_kind(),
            registry: self.registry.snapshot().await,
            cached_documents: self.cache.len(),
            cached_harvest: self.cache.harvest(),
            cache_outdated: self.cache.is_outdated(),
        }
    }
}
