//! Batching submission pipeline.
//!
//! Submitters open a session, append documents to it and flush it. Each
//! session frames its documents as bulk entries into its own batch and
//! keeps its own report. A batch is sent before an entry that would push
//! it past the byte limit, and on flush. Items of the bulk response that
//! failed on one unparsable field are resent once, alone, without that
//! field.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use super::batch::Batch;
use super::bulk::{request_body, BulkEntry, BulkItemError, BulkResponse};
use super::client::{BulkClient, BulkTarget};
use super::normalize::ResponseNormalizer;
use super::recovery::FieldRecovery;
use super::{FailureKind, RecoveredDocument, SubmissionError, SubmissionReport};
use crate::config::{SharedSubmissionConfig, SubmissionConfig};
use crate::events::{
    CancelSubmission, DocumentsSubmitted, EventBus, FlushSubmission, PrepareSubmission,
    RequestHandler, SubmissionFinished, SubmitDocument,
};
use crate::lifecycle::StateMachine;
use crate::model::DocumentContent;

/// Identifies one open submission session.
pub type SessionId = u64;

struct Session {
    batch: Batch,
    report: SubmissionReport,
}

type SharedSession = Arc<AsyncMutex<Session>>;

pub struct SubmissionPipeline {
    config: SharedSubmissionConfig,
    client: Arc<dyn BulkClient>,
    machine: Arc<StateMachine>,
    bus: Arc<EventBus>,
    normalizer: ResponseNormalizer,
    recovery: FieldRecovery,
    sessions: Mutex<HashMap<SessionId, SharedSession>>,
    next_session: AtomicU64,
}

impl std::fmt::Debug for SubmissionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SubmissionPipeline {
    pub fn new(
        config: SharedSubmissionConfig,
        client: Arc<dyn BulkClient>,
        machine: Arc<StateMachine>,
        bus: Arc<EventBus>,
    ) -> Result<Self, SubmissionError> {
        Ok(Self {
            config,
            client,
            machine,
            bus,
            normalizer: ResponseNormalizer::new()?,
            recovery: FieldRecovery::new()?,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        })
    }

    fn ensure_not_cancelling(&self) -> Result<(), SubmissionError> {
        if self.machine.is_cancelling() {
            return Err(SubmissionError::CannotSubmitWhileCancelling);
        }
        Ok(())
    }

    fn session(&self, id: SessionId) -> Result<SharedSession, SubmissionError> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(SubmissionError::UnknownSession(id))
    }

    fn close(&self, id: SessionId) -> Option<SharedSession> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Checks that submitting is possible and opens a session with an empty
    /// batch and report.
    ///
    /// # Errors
    ///
    /// Fails if no bulk URL is configured, the credentials are incomplete,
    /// or a cancellation is in progress.
    pub async fn prepare(&self) -> Result<SessionId, SubmissionError> {
        self.ensure_not_cancelling()?;
        let config = self.config.get();
        config.target()?;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            batch: Batch::new(config.max_batch_bytes),
            report: SubmissionReport::default(),
        };
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(AsyncMutex::new(session)));
        debug!(session = id, "Submission session opened");
        Ok(id)
    }

    /// Queues a document in `session`, `None` deleting it from the index.
    ///
    /// Returns `Ok(false)` if the document is too large to ever be sent; it
    /// is then recorded as failed.
    ///
    /// # Errors
    ///
    /// Fails if the session is not open, a cancellation is in progress, or
    /// a batch that had to be sent first has nowhere to go.
    pub async fn submit(
        &self,
        session: SessionId,
        id: impl Into<String>,
        document: Option<DocumentContent>,
    ) -> Result<bool, SubmissionError> {
        self.ensure_not_cancelling()?;
        let config = self.config.get();
        let id = id.into();

        let shared = self.session(session)?;
        let mut state = shared.lock().await;
        if state.batch.is_empty() {
            state.batch.set_max_size(config.max_batch_bytes);
        }

        let entry = match BulkEntry::for_document(id.clone(), document) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(id = %id, error = %e, "Document cannot be serialized");
                state
                    .report
                    .record_failure(id, FailureKind::Request { message: e.to_string() });
                return Ok(false);
            }
        };

        if !state.batch.accepts(&entry) {
            let (size, max) = (entry.size(), state.batch.max_size());
            warn!(id = %id, size, max, "Document exceeds the batch size limit");
            state.report.record_failure(id, FailureKind::TooLarge { size, max });
            return Ok(false);
        }

        if !state.batch.fits(&entry) {
            self.send_batch(&mut state, &config).await?;
        }
        if let Err(entry) = state.batch.push(entry) {
            let (size, max) = (entry.size(), state.batch.max_size());
            state.report.record_failure(id, FailureKind::TooLarge { size, max });
            return Ok(false);
        }
        Ok(true)
    }

    /// Sends the pending batch of `session`, closes it and returns the
    /// report of everything submitted through it.
    ///
    /// # Errors
    ///
    /// Fails if the session is not open or the pending batch cannot be
    /// sent. The session then stays open until it is discarded.
    #[instrument(skip(self))]
    pub async fn flush(&self, session: SessionId) -> Result<SubmissionReport, SubmissionError> {
        self.ensure_not_cancelling()?;
        let config = self.config.get();

        let shared = self.session(session)?;
        let mut state = shared.lock().await;
        self.send_batch(&mut state, &config).await?;
        let report = std::mem::take(&mut state.report);
        drop(state);
        self.close(session);

        info!(
            submitted = report.submitted,
            recovered = report.recovered.len(),
            failed = report.failed_count(),
            requests = report.requests,
            "{}",
            report.summary()
        );
        self.bus.publish(&SubmissionFinished {
            report: report.clone(),
        });
        Ok(report)
    }

    /// Closes `session` without sending its pending batch. Returns the
    /// number of dropped documents.
    pub async fn discard(&self, session: SessionId) -> usize {
        let Some(shared) = self.close(session) else {
            return 0;
        };
        let dropped = shared.lock().await.batch.take().len();
        if dropped > 0 {
            info!(session, dropped, "Pending submission discarded");
        }
        dropped
    }

    /// Number of documents waiting in the batches of all open sessions.
    pub async fn pending(&self) -> usize {
        let sessions: Vec<SharedSession> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut pending = 0;
        for session in sessions {
            pending += session.lock().await.batch.len();
        }
        pending
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    async fn send_batch(
        &self,
        state: &mut Session,
        config: &SubmissionConfig,
    ) -> Result<(), SubmissionError> {
        if state.batch.is_empty() {
            return Ok(());
        }
        let target = config.target()?;
        self.ensure_not_cancelling()?;

        let entries = state.batch.take();
        let report = self.send_entries(&target, entries).await;
        debug!(
            submitted = report.submitted,
            failed = report.failed_count(),
            "Batch sent"
        );
        self.bus.publish(&DocumentsSubmitted {
            submitted_count: report.submitted,
        });
        state.report.merge(report);
        Ok(())
    }

    /// Sends `entries` as one bulk request. Failures are recorded per
    /// document in the returned report.
    async fn send_entries(
        &self,
        target: &BulkTarget,
        entries: Vec<BulkEntry>,
    ) -> SubmissionReport {
        let mut report = SubmissionReport {
            requests: 1,
            ..SubmissionReport::default()
        };

        let response = match self.request(target, request_body(&entries)).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, documents = entries.len(), "Bulk request failed");
                let message = e.to_string();
                for entry in &entries {
                    report.record_failure(
                        entry.id(),
                        FailureKind::Request {
                            message: message.clone(),
                        },
                    );
                }
                return report;
            }
        };

        for (index, entry) in entries.iter().enumerate() {
            let item = response.items.get(index).map(|item| &item.result);
            match item {
                Some(result) => match &result.error {
                    None => report.submitted += 1,
                    Some(error) => {
                        self.recover(target, entry, result.status, error, &mut report).await;
                    }
                },
                None if !response.errors => report.submitted += 1,
                None => report.record_failure(
                    entry.id(),
                    FailureKind::Request {
                        message: "missing item in bulk response".to_string(),
                    },
                ),
            }
        }
        report
    }

    /// Resends `entry` once without the field named in `error`, or records
    /// it as failed if the error is not of that shape.
    async fn recover(
        &self,
        target: &BulkTarget,
        entry: &BulkEntry,
        status: u16,
        error: &BulkItemError,
        report: &mut SubmissionReport,
    ) {
        let stripped = self.recovery.offending_field(error).and_then(|field| {
            match entry.without_field(&field) {
                Ok(Some(stripped)) => Some((field, stripped)),
                _ => None,
            }
        });

        let Some((field, stripped)) = stripped else {
            debug!(id = %entry.id(), reason = %error.reason, "Document rejected");
            report.record_failure(entry.id(), rejected(status, error));
            return;
        };

        info!(id = %entry.id(), field = %field, "Resubmitting document without unparsable field");
        report.requests += 1;

        match self.request(target, stripped.lines().to_string()).await {
            Ok(response) => match response.items.first().map(|item| &item.result) {
                Some(result) => match &result.error {
                    None => {
                        report.submitted += 1;
                        report.recovered.push(RecoveredDocument {
                            id: entry.id().to_string(),
                            removed_field: field,
                        });
                    }
                    Some(second) => {
                        warn!(
                            id = %entry.id(),
                            reason = %second.reason,
                            "Document rejected again"
                        );
                        report.record_failure(entry.id(), rejected(result.status, second));
                    }
                },
                None if !response.errors => {
                    report.submitted += 1;
                    report.recovered.push(RecoveredDocument {
                        id: entry.id().to_string(),
                        removed_field: field,
                    });
                }
                None => report.record_failure(entry.id(), rejected(status, error)),
            },
            Err(e) => {
                warn!(id = %entry.id(), error = %e, "Resubmission failed");
                report.record_failure(
                    entry.id(),
                    FailureKind::Request {
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    async fn request(
        &self,
        target: &BulkTarget,
        body: String,
    ) -> Result<BulkResponse, SubmissionError> {
        let raw = self.client.send_bulk(target, body).await?;
        let normalized = self.normalizer.normalize(&raw);
        Ok(BulkResponse::parse(&normalized)?)
    }
}

fn rejected(status: u16, error: &BulkItemError) -> FailureKind {
    FailureKind::Rejected {
        status,
        error_type: error.error_type.clone(),
        reason: error.reason.clone(),
    }
}

// ============================================================================
// Event Handlers
// ============================================================================

#[async_trait]
impl RequestHandler<PrepareSubmission> for SubmissionPipeline {
    async fn handle(&self, _request: PrepareSubmission) -> Result<SessionId, SubmissionError> {
        self.prepare().await
    }
}

#[async_trait]
impl RequestHandler<SubmitDocument> for SubmissionPipeline {
    async fn handle(&self, request: SubmitDocument) -> Result<bool, SubmissionError> {
        self.submit(request.session, request.document_id, request.document).await
    }
}

#[async_trait]
impl RequestHandler<FlushSubmission> for SubmissionPipeline {
    async fn handle(&self, request: FlushSubmission) -> Result<SubmissionReport, SubmissionError> {
        self.flush(request.session).await
    }
}

#[async_trait]
impl RequestHandler<CancelSubmission> for SubmissionPipeline {
    async fn handle(&self, request: CancelSubmission) -> usize {
        self.discard(request.session).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SubmissionConfig;
    use crate::lifecycle::{ServiceStates, StateKind};
    use crate::submission::SubmissionOutcome;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    type Rejector = dyn Fn(usize, &str, &Value) -> Option<&'static str> + Send + Sync;

    /// Answers bulk requests like an index would. `reject` is called with
    /// the request number, document id and document, and returns the error
    /// reason for documents the index refuses.
    pub(crate) struct FakeBulkClient {
        pub bodies: Mutex<Vec<String>>,
        reject: Box<Rejector>,
        fail_requests: bool,
        hold: Mutex<Option<Arc<Semaphore>>>,
    }

    impl FakeBulkClient {
        pub fn accepting() -> Self {
            Self::rejecting(|_, _, _| None)
        }

        pub fn rejecting<F>(reject: F) -> Self
        where
            F: Fn(usize, &str, &Value) -> Option<&'static str> + Send + Sync + 'static,
        {
            Self {
                bodies: Mutex::new(Vec::new()),
                reject: Box::new(reject),
                fail_requests: false,
                hold: Mutex::new(None),
            }
        }

        /// Makes every following request wait for one permit of the
        /// returned semaphore before it is answered.
        pub fn hold(&self) -> Arc<Semaphore> {
            let permits = Arc::new(Semaphore::new(0));
            *self.hold.lock().unwrap() = Some(Arc::clone(&permits));
            permits
        }

        pub fn failing() -> Self {
            Self {
                fail_requests: true,
                ..Self::accepting()
            }
        }

        pub fn request_count(&self) -> usize {
            self.bodies.lock().unwrap().len()
        }

        pub fn documents_per_request(&self) -> Vec<usize> {
            self.bodies
                .lock()
                .unwrap()
                .iter()
                .map(|body| body.lines().filter(|line| line.starts_with("{\"index\"")).count())
                .collect()
        }
    }

    #[async_trait]
    impl BulkClient for FakeBulkClient {
        async fn send_bulk(
            &self,
            _target: &BulkTarget,
            body: String,
        ) -> Result<String, SubmissionError> {
            let request = {
                let mut bodies = self.bodies.lock().unwrap();
                bodies.push(body.clone());
                bodies.len()
            };
            let hold = self.hold.lock().unwrap().clone();
            if let Some(hold) = hold {
                hold.acquire().await.unwrap().forget();
            }
            if self.fail_requests {
                return Err(SubmissionError::Http {
                    status: 502,
                    body: "bad gateway".to_string(),
                });
            }

            let mut items = Vec::new();
            let mut lines = body.lines();
            while let Some(header) = lines.next() {
                let header: Value = serde_json::from_str(header).unwrap();
                let (action, meta) = header.as_object().unwrap().iter().next().unwrap();
                let id = meta["_id"].as_str().unwrap().to_string();
                let document = if action == "index" {
                    serde_json::from_str(lines.next().unwrap()).unwrap()
                } else {
                    Value::Null
                };

                let item = match (self.reject)(request, &id, &document) {
                    Some(reason) => json!({ action: {
                        "_id": id,
                        "status": 400,
                        "error": {"type": "mapper_parsing_exception", "reason": reason}
                    }}),
                    None => json!({ action: {"_id": id, "status": 201} }),
                };
                items.push(item);
            }

            let errors = items.iter().any(|item| item.to_string().contains("\"error\""));
            Ok(json!({"took": 1, "errors": errors, "items": items}).to_string())
        }
    }

    pub(crate) fn test_config(max_batch_bytes: usize) -> SharedSubmissionConfig {
        SharedSubmissionConfig::new(
            SubmissionConfig::default()
                .with_url("http://index.test/_bulk")
                .with_max_batch_bytes(max_batch_bytes),
        )
    }

    fn pipeline(
        client: &Arc<FakeBulkClient>,
        max_batch_bytes: usize,
    ) -> (SubmissionPipeline, Arc<StateMachine>) {
        let machine = Arc::new(StateMachine::new());
        let pipeline = SubmissionPipeline::new(
            test_config(max_batch_bytes),
            client.clone(),
            Arc::clone(&machine),
            Arc::new(EventBus::new()),
        )
        .unwrap();
        (pipeline, machine)
    }

    fn doc(value: Value) -> Option<DocumentContent> {
        value.as_object().cloned()
    }

    #[tokio::test]
    async fn test_batches_respect_size_limit() {
        let client = Arc::new(FakeBulkClient::accepting());
        let (pipeline, _) = pipeline(&client, 1_048_576);
        let session = pipeline.prepare().await.unwrap();

        let payload = "x".repeat(400 * 1024);
        for i in 1..=3 {
            let accepted = pipeline
                .submit(session, format!("doc{}", i), doc(json!({ "data": payload })))
                .await
                .unwrap();
            assert!(accepted);
        }
        let report = pipeline.flush(session).await.unwrap();

        assert_eq!(client.documents_per_request(), vec![2, 1]);
        for body in client.bodies.lock().unwrap().iter() {
            assert!(body.len() <= 1_048_576);
        }
        assert_eq!(report.submitted, 3);
        assert_eq!(report.outcome(), SubmissionOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_oversized_document_is_rejected() {
        let client = Arc::new(FakeBulkClient::accepting());
        let (pipeline, _) = pipeline(&client, 1024);
        let session = pipeline.prepare().await.unwrap();

        let accepted = pipeline
            .submit(session, "big", doc(json!({ "data": "x".repeat(2048) })))
            .await
            .unwrap();
        assert!(!accepted);
        assert!(pipeline.submit(session, "small", doc(json!({"a": 1}))).await.unwrap());

        let report = pipeline.flush(session).await.unwrap();
        assert_eq!(client.request_count(), 1);
        assert_eq!(report.submitted, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "big");
        assert!(matches!(report.failed[0].kind, FailureKind::TooLarge { max: 1024, .. }));
    }

    #[tokio::test]
    async fn test_field_parse_error_is_recovered() {
        let client = Arc::new(FakeBulkClient::rejecting(|_, _, document| {
            document
                .get("publicationYear")
                .map(|_| "failed to parse [publicationYear] of type [integer]")
        }));
        let (pipeline, _) = pipeline(&client, 1_048_576);
        let session = pipeline.prepare().await.unwrap();

        pipeline.submit(session, "doc1", doc(json!({"title": "A"}))).await.unwrap();
        pipeline
            .submit(session, "doc2", doc(json!({"title": "B", "publicationYear": "MMXX"})))
            .await
            .unwrap();
        pipeline.submit(session, "doc3", doc(json!({"title": "C"}))).await.unwrap();
        let report = pipeline.flush(session).await.unwrap();

        assert_eq!(report.submitted, 3);
        assert_eq!(report.total(), 3);
        assert_eq!(
            report.recovered,
            vec![RecoveredDocument {
                id: "doc2".to_string(),
                removed_field: "publicationYear".to_string()
            }]
        );
        assert!(report.failed.is_empty());

        let bodies = client.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 2);
        assert!(bodies[1].contains("doc2"));
        assert!(!bodies[1].contains("publicationYear"));
        assert!(!bodies[1].contains("doc1"));
    }

    #[tokio::test]
    async fn test_second_failure_is_permanent() {
        let client = Arc::new(FakeBulkClient::rejecting(|_, id, _| {
            (id == "doc2").then_some("failed to parse [publicationYear]")
        }));
        let (pipeline, _) = pipeline(&client, 1_048_576);
        let session = pipeline.prepare().await.unwrap();

        for id in ["doc1", "doc2", "doc3"] {
            pipeline
                .submit(session, id, doc(json!({"title": id, "publicationYear": "MMXX"})))
                .await
                .unwrap();
        }
        let report = pipeline.flush(session).await.unwrap();

        // one batch plus exactly one retry
        assert_eq!(client.request_count(), 2);
        assert_eq!(report.submitted, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "doc2");
        assert_eq!(report.outcome(), SubmissionOutcome::PartiallySucceeded);
    }

    #[tokio::test]
    async fn test_unrecognized_error_is_not_retried() {
        let client = Arc::new(FakeBulkClient::rejecting(|_, id, _| {
            (id == "doc1").then_some("version conflict")
        }));
        let (pipeline, _) = pipeline(&client, 1_048_576);
        let session = pipeline.prepare().await.unwrap();

        pipeline.submit(session, "doc1", doc(json!({"title": "A"}))).await.unwrap();
        let report = pipeline.flush(session).await.unwrap();

        assert_eq!(client.request_count(), 1);
        assert_eq!(report.outcome(), SubmissionOutcome::Failed);
        assert!(matches!(
            &report.failed[0].kind,
            FailureKind::Rejected { status: 400, reason, .. } if reason == "version conflict"
        ));
    }

    #[tokio::test]
    async fn test_failed_request_fails_its_documents_only() {
        let client = Arc::new(FakeBulkClient::failing());
        let (pipeline, _) = pipeline(&client, 1_048_576);
        let session = pipeline.prepare().await.unwrap();

        pipeline.submit(session, "doc1", doc(json!({"title": "A"}))).await.unwrap();
        pipeline.submit(session, "doc2", None).await.unwrap();
        let report = pipeline.flush(session).await.unwrap();

        assert_eq!(report.failed.len(), 2);
        assert!(matches!(report.failed[0].kind, FailureKind::Request { .. }));
    }

    #[tokio::test]
    async fn test_deletions_are_framed() {
        let client = Arc::new(FakeBulkClient::accepting());
        let (pipeline, _) = pipeline(&client, 1_048_576);
        let session = pipeline.prepare().await.unwrap();

        pipeline.submit(session, "gone", None).await.unwrap();
        let report = pipeline.flush(session).await.unwrap();

        assert_eq!(report.submitted, 1);
        assert_eq!(client.bodies.lock().unwrap()[0], "{\"delete\":{\"_id\":\"gone\"}}\n");
    }

    #[tokio::test]
    async fn test_empty_flush_is_a_no_op() {
        let client = Arc::new(FakeBulkClient::accepting());
        let (pipeline, _) = pipeline(&client, 1_048_576);
        let session = pipeline.prepare().await.unwrap();

        let report = pipeline.flush(session).await.unwrap();
        assert_eq!(report.outcome(), SubmissionOutcome::Empty);
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_url_is_fatal() {
        let client = Arc::new(FakeBulkClient::accepting());
        let pipeline = SubmissionPipeline::new(
            SharedSubmissionConfig::default(),
            client,
            Arc::new(StateMachine::new()),
            Arc::new(EventBus::new()),
        )
        .unwrap();

        assert!(matches!(pipeline.prepare().await, Err(SubmissionError::MissingUrl)));
    }

    #[tokio::test]
    async fn test_cannot_submit_while_cancelling() {
        let client = Arc::new(FakeBulkClient::accepting());
        let (pipeline, machine) = pipeline(&client, 1_048_576);
        let session = pipeline.prepare().await.unwrap();
        pipeline.submit(session, "doc1", doc(json!({"title": "A"}))).await.unwrap();

        let states = ServiceStates::new();
        machine.set_state(Some(states.get(StateKind::Aborting)));

        assert!(matches!(
            pipeline.submit(session, "doc2", doc(json!({"title": "B"}))).await,
            Err(SubmissionError::CannotSubmitWhileCancelling)
        ));
        assert!(matches!(
            pipeline.flush(session).await,
            Err(SubmissionError::CannotSubmitWhileCancelling)
        ));
        assert_eq!(pipeline.discard(session).await, 1);
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_requests_through_bus() {
        let client = Arc::new(FakeBulkClient::accepting());
        let bus = Arc::new(EventBus::new());
        let pipeline = Arc::new(
            SubmissionPipeline::new(
                test_config(1_048_576),
                client.clone(),
                Arc::new(StateMachine::new()),
                Arc::clone(&bus),
            )
            .unwrap(),
        );
        bus.register_handler::<PrepareSubmission>(pipeline.clone()).unwrap();
        bus.register_handler::<SubmitDocument>(pipeline.clone()).unwrap();
        bus.register_handler::<FlushSubmission>(pipeline.clone()).unwrap();

        let submitted = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&submitted);
        bus.listen(move |event: &DocumentsSubmitted| {
            *counter.lock().unwrap() += event.submitted_count;
            Ok(())
        });

        let session = bus.request(PrepareSubmission).await.unwrap().unwrap();
        let accepted = bus
            .request(SubmitDocument {
                session,
                document_id: "doc1".to_string(),
                document: doc(json!({"title": "A"})),
            })
            .await
            .unwrap()
            .unwrap();
        assert!(accepted);
        let report = bus.request(FlushSubmission { session }).await.unwrap().unwrap();

        assert_eq!(report.submitted, 1);
        assert_eq!(*submitted.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sessions_keep_their_own_documents() {
        let client = Arc::new(FakeBulkClient::rejecting(|_, id, _| {
            (id == "b2").then_some("version conflict")
        }));
        let (pipeline, _) = pipeline(&client, 1_048_576);

        let first = pipeline.prepare().await.unwrap();
        pipeline.submit(first, "a1", doc(json!({"title": "A1"}))).await.unwrap();
        let second = pipeline.prepare().await.unwrap();
        assert_ne!(first, second);
        pipeline.submit(second, "b1", doc(json!({"title": "B1"}))).await.unwrap();
        pipeline.submit(first, "a2", doc(json!({"title": "A2"}))).await.unwrap();
        pipeline.submit(second, "b2", doc(json!({"title": "B2"}))).await.unwrap();
        assert_eq!(pipeline.pending().await, 4);

        let first_report = pipeline.flush(first).await.unwrap();
        assert_eq!(first_report.submitted, 2);
        assert!(first_report.failed.is_empty());
        assert_eq!(pipeline.pending().await, 2);

        let second_report = pipeline.flush(second).await.unwrap();
        assert_eq!(second_report.submitted, 1);
        assert_eq!(second_report.failed[0].id, "b2");

        assert_eq!(client.documents_per_request(), vec![2, 2]);
        assert_eq!(pipeline.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_discard_leaves_other_sessions_alone() {
        let client = Arc::new(FakeBulkClient::accepting());
        let (pipeline, _) = pipeline(&client, 1_048_576);

        let kept = pipeline.prepare().await.unwrap();
        let dropped = pipeline.prepare().await.unwrap();
        pipeline.submit(kept, "a", doc(json!({"title": "A"}))).await.unwrap();
        pipeline.submit(dropped, "b", doc(json!({"title": "B"}))).await.unwrap();

        assert_eq!(pipeline.discard(dropped).await, 1);
        assert_eq!(pipeline.discard(dropped).await, 0);
        assert!(matches!(
            pipeline.submit(dropped, "c", None).await,
            Err(SubmissionError::UnknownSession(id)) if id == dropped
        ));

        assert_eq!(pipeline.flush(kept).await.unwrap().submitted, 1);
        assert!(matches!(
            pipeline.flush(kept).await,
            Err(SubmissionError::UnknownSession(_))
        ));
    }
}
