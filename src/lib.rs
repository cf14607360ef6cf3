//! Harvesting service core.
//!
//! The crate repeatedly extracts records from pluggable sources, transforms
//! them into documents and submits them to a bulk indexing endpoint:
//! - **Events**: a process-wide [`events::EventBus`] for fire-and-forget and
//!   request/response dispatch
//! - **Lifecycle**: a serialized [`lifecycle::StateMachine`] holding the
//!   single active service state
//! - **ETL**: per-source [`etl::Etl`] units tracked by an [`etl::EtlRegistry`]
//! - **Submission**: the batching [`submission::SubmissionPipeline`] with
//!   bulk error recovery
//!
//! [`service::HarvesterService`] wires them together.

pub mod config;
pub mod etl;
pub mod events;
pub mod executor;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod service;
pub mod submission;

// Re-export common types for convenience
pub use config::{ConfigError, ServiceConfig, SubmissionConfig};
pub use events::{EventBus, EventBusError};
pub use executor::HarvestExecutor;
pub use lifecycle::{LifecycleState, StateKind, StateMachine};
pub use model::{Document, DocumentContent};
pub use service::HarvesterService;
