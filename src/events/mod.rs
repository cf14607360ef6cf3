//! Event bus and the event catalog of the harvesting service.

pub mod bus;
pub mod catalog;

pub use bus::{
    AsyncPublisher, Delivery, Event, EventBus, EventBusError, EventListener, FnListener, Request,
    RequestHandler,
};
pub use catalog::{
    AbortHarvest, CancelSubmission, ChangeState, CreateLoader, DocumentsSubmitted, FlushSubmission,
    HarvestFinished, PrepareSubmission, StartHarvest, StartSubmission, SubmissionFinished,
    SubmissionStarted, SubmitDocument,
};
