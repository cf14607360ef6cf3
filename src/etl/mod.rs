//! Extract-transform-load units and their registry.
//!
//! Each [`Etl`] composes an [`Extractor`], a [`Transformer`] and a
//! [`Loader`] and tracks its own status and health. The [`EtlRegistry`]
//! runs harvests across all ETLs and enforces the preconditions that span
//! them.

pub mod entity;
pub mod jsonl;
pub mod loader;
pub mod pipeline;
pub mod registry;
pub mod status;
pub mod traits;

pub use entity::{Etl, EtlHarvestOutcome, EtlSnapshot};
pub use jsonl::{JsonLinesExtractor, JsonTransformer};
pub use loader::{
    CachingLoader, LoaderConstructor, LoaderRegistry, SubmittingLoader, CACHING_LOADER,
    SUBMITTING_LOADER,
};
pub use pipeline::{EtlPipeline, HarvestProgress, HarvestStats, PipelineRun, StageFailure};
pub use registry::{
    EtlRegistry, HarvestCompletion, HarvestOutcome, HarvestStarted, RegistrySnapshot, SkippedEtl,
};
pub use status::{EtlHealth, EtlStatus, History, Timestamped};
pub use traits::{
    EtlError, Extraction, Extractor, LoadSummary, Loader, StageError, StageKind, Transformer,
};
