//! Process-wide event dispatch.
//!
//! The bus keeps a registration table keyed by event type:
//! - fire-and-forget events go to zero or more [`EventListener`]s, in
//!   registration order
//! - request events go to exactly one [`RequestHandler`], whose response is
//!   returned to the caller
//!
//! Listener identity is the `Arc` allocation, so registering the same `Arc`
//! twice is a no-op and removal needs the same `Arc` back.

use async_trait::async_trait;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

// ============================================================================
// Event Traits
// ============================================================================

/// A fire-and-forget occurrence.
pub trait Event: Send + Sync + 'static {}

/// An event answered by exactly one handler.
pub trait Request: Send + 'static {
    type Response: Send + 'static;
}

/// Receives published events of kind `E`.
///
/// Errors and panics are caught by the bus and logged; they never stop
/// delivery to the remaining listeners.
pub trait EventListener<E: Event>: Send + Sync {
    fn on_event(&self, event: &E) -> anyhow::Result<()>;
}

/// Answers requests of kind `R`. Runs on the requesting task.
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync {
    async fn handle(&self, request: R) -> R::Response;
}

/// Adapts a closure into an [`EventListener`].
pub struct FnListener<E, F> {
    callback: F,
    _event: PhantomData<fn(&E)>,
}

impl<E, F> FnListener<E, F>
where
    E: Event,
    F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            _event: PhantomData,
        }
    }
}

impl<E, F> EventListener<E> for FnListener<E, F>
where
    E: Event,
    F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_event(&self, event: &E) -> anyhow::Result<()> {
        (self.callback)(event)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Nobody answers this request kind
    #[error("No handler registered for request '{kind}'")]
    NoHandler { kind: &'static str },

    /// A different handler already answers this request kind
    #[error("A handler for request '{kind}' is already registered")]
    DuplicateHandler { kind: &'static str },

    /// The async dispatcher task is gone
    #[error("Event dispatcher is closed")]
    DispatcherClosed,
}

// ============================================================================
// Registration Table
// ============================================================================

/// Outcome of one [`EventBus::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

struct Registration {
    key: usize,
    // Holds an `Arc<dyn EventListener<E>>` or `Arc<dyn RequestHandler<R>>`.
    target: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct Table {
    listeners: HashMap<TypeId, Vec<Registration>>,
    handlers: HashMap<TypeId, Registration>,
}

fn identity<T: ?Sized>(target: &Arc<T>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

fn kind_of<T>() -> &'static str {
    let full = type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Event bus shared by every component of one service instance.
#[derive(Default)]
pub struct EventBus {
    table: RwLock<Table>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Fire-and-forget
    // ------------------------------------------------------------------------

    /// Registers a listener. Adding an already registered listener is a no-op.
    pub fn add_listener<E: Event>(&self, listener: Arc<dyn EventListener<E>>) {
        let key = identity(&listener);
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let entries = table.listeners.entry(TypeId::of::<E>()).or_default();

        if entries.iter().any(|entry| entry.key == key) {
            return;
        }

        entries.push(Registration {
            key,
            target: Arc::new(listener),
        });
        debug!(event = kind_of::<E>(), listeners = entries.len(), "Listener added");
    }

    /// Registers a closure and returns the listener handle needed to remove it.
    pub fn listen<E, F>(&self, callback: F) -> Arc<dyn EventListener<E>>
    where
        E: Event,
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let listener: Arc<dyn EventListener<E>> = Arc::new(FnListener::new(callback));
        self.add_listener(Arc::clone(&listener));
        listener
    }

    /// Removes a listener. Unknown listeners are ignored.
    pub fn remove_listener<E: Event>(&self, listener: &Arc<dyn EventListener<E>>) {
        let key = identity(listener);
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = table.listeners.get_mut(&TypeId::of::<E>()) {
            entries.retain(|entry| entry.key != key);
            if entries.is_empty() {
                table.listeners.remove(&TypeId::of::<E>());
            }
        }
    }

    pub fn listener_count<E: Event>(&self) -> usize {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .listeners
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }

    /// Delivers `event` to every listener of its kind on the calling thread.
    pub fn publish<E: Event>(&self, event: &E) -> Delivery {
        // Snapshot so listeners may (un)register while being called.
        let listeners: Vec<Arc<dyn EventListener<E>>> = {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            table
                .listeners
                .get(&TypeId::of::<E>())
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|entry| {
                            entry
                                .target
                                .downcast_ref::<Arc<dyn EventListener<E>>>()
                                .cloned()
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut delivery = Delivery::default();
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => delivery.delivered += 1,
                Ok(Err(e)) => {
                    delivery.failed += 1;
                    error!(event = kind_of::<E>(), error = %e, "Event listener failed");
                }
                Err(_) => {
                    delivery.failed += 1;
                    error!(event = kind_of::<E>(), "Event listener panicked");
                }
            }
        }

        trace!(
            event = kind_of::<E>(),
            delivered = delivery.delivered,
            failed = delivery.failed,
            "Event published"
        );
        delivery
    }

    // ------------------------------------------------------------------------
    // Request/response
    // ------------------------------------------------------------------------

    /// Registers the single handler of request kind `R`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::DuplicateHandler`] if a different handler is
    /// already registered. Re-registering the same handler is a no-op.
    pub fn register_handler<R: Request>(
        &self,
        handler: Arc<dyn RequestHandler<R>>,
    ) -> Result<(), EventBusError> {
        let key = identity(&handler);
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);

        match table.handlers.get(&TypeId::of::<R>()) {
            Some(existing) if existing.key == key => Ok(()),
            Some(_) => Err(EventBusError::DuplicateHandler {
                kind: kind_of::<R>(),
            }),
            None => {
                table.handlers.insert(
                    TypeId::of::<R>(),
                    Registration {
                        key,
                        target: Arc::new(handler),
                    },
                );
                debug!(request = kind_of::<R>(), "Request handler registered");
                Ok(())
            }
        }
    }

    /// Removes the handler of `R` if `handler` is the registered one.
    pub fn remove_handler<R: Request>(&self, handler: &Arc<dyn RequestHandler<R>>) {
        let key = identity(handler);
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table
            .handlers
            .get(&TypeId::of::<R>())
            .is_some_and(|existing| existing.key == key)
        {
            table.handlers.remove(&TypeId::of::<R>());
        }
    }

    pub fn has_handler<R: Request>(&self) -> bool {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.handlers.contains_key(&TypeId::of::<R>())
    }

    /// Sends `request` to its handler and returns the response.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::NoHandler`] immediately when nothing answers
    /// this request kind.
    pub async fn request<R: Request>(&self, request: R) -> Result<R::Response, EventBusError> {
        let handler = {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            table
                .handlers
                .get(&TypeId::of::<R>())
                .and_then(|entry| {
                    entry
                        .target
                        .downcast_ref::<Arc<dyn RequestHandler<R>>>()
                        .cloned()
                })
        }
        .ok_or(EventBusError::NoHandler {
            kind: kind_of::<R>(),
        })?;

        trace!(request = kind_of::<R>(), "Dispatching request");
        Ok(handler.handle(request).await)
    }

    // ------------------------------------------------------------------------
    // Async publishing
    // ------------------------------------------------------------------------

    /// Spawns the task that delivers events handed to the returned
    /// [`AsyncPublisher`]. Must be called inside a tokio runtime.
    ///
    /// Events are delivered one at a time in the order they were published.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> AsyncPublisher {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Dispatch>();
        let bus = Arc::clone(self);

        tokio::spawn(async move {
            while let Some(dispatch) = receiver.recv().await {
                dispatch(&bus);
            }
            debug!("Event dispatcher stopped");
        });

        AsyncPublisher { sender }
    }
}

type Dispatch = Box<dyn FnOnce(&EventBus) + Send>;

/// Queues events for ordered delivery on the dispatcher task.
#[derive(Clone)]
pub struct AsyncPublisher {
    sender: mpsc::UnboundedSender<Dispatch>,
}

impl AsyncPublisher {
    pub fn publish<E: Event>(&self, event: E) -> Result<(), EventBusError> {
        self.sender
            .send(Box::new(move |bus: &EventBus| {
                bus.publish(&event);
            }))
            .map_err(|_| EventBusError::DispatcherClosed)
    }
}

impl std::fmt::Debug for AsyncPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPublisher")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Ping(u32);
    impl Event for Ping {}

    struct Double(u32);
    impl Request for Double {
        type Response = u32;
    }

    struct Doubler;

    #[async_trait]
    impl RequestHandler<Double> for Doubler {
        async fn handle(&self, request: Double) -> u32 {
            request.0 * 2
        }
    }

    fn recorder(
        bus: &EventBus,
        tag: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn EventListener<Ping>> {
        let log = Arc::clone(log);
        bus.listen(move |ping: &Ping| {
            log.lock().unwrap().push(format!("{}:{}", tag, ping.0));
            Ok(())
        })
    }

    #[test]
    fn test_publish_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, "a", &log);
        recorder(&bus, "b", &log);

        let delivery = bus.publish(&Ping(1));

        assert_eq!(delivery, Delivery { delivered: 2, failed: 0 });
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_failing_listener_does_not_stop_delivery() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.listen(|_: &Ping| Err(anyhow::anyhow!("boom")));
        bus.listen(|_: &Ping| -> anyhow::Result<()> { panic!("listener panic") });
        recorder(&bus, "last", &log);

        let delivery = bus.publish(&Ping(7));

        assert_eq!(delivery, Delivery { delivered: 1, failed: 2 });
        assert_eq!(*log.lock().unwrap(), vec!["last:7"]);
    }

    #[test]
    fn test_add_and_remove_are_idempotent() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener = recorder(&bus, "a", &log);

        bus.add_listener(Arc::clone(&listener));
        assert_eq!(bus.listener_count::<Ping>(), 1);

        bus.remove_listener(&listener);
        bus.remove_listener(&listener);
        assert_eq!(bus.listener_count::<Ping>(), 0);

        assert_eq!(bus.publish(&Ping(2)), Delivery::default());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_without_handler_fails() {
        let bus = EventBus::new();
        let result = bus.request(Double(2)).await;
        assert_eq!(result, Err(EventBusError::NoHandler { kind: "Double" }));
    }

    #[tokio::test]
    async fn test_request_returns_handler_response() {
        let bus = EventBus::new();
        bus.register_handler::<Double>(Arc::new(Doubler)).unwrap();
        assert_eq!(bus.request(Double(21)).await, Ok(42));
    }

    #[test]
    fn test_second_handler_rejected_at_registration() {
        let bus = EventBus::new();
        let first: Arc<dyn RequestHandler<Double>> = Arc::new(Doubler);
        bus.register_handler(Arc::clone(&first)).unwrap();

        // same handler again is fine
        bus.register_handler(Arc::clone(&first)).unwrap();

        let second: Arc<dyn RequestHandler<Double>> = Arc::new(Doubler);
        assert_eq!(
            bus.register_handler(second),
            Err(EventBusError::DuplicateHandler { kind: "Double" })
        );

        bus.remove_handler(&first);
        assert!(!bus.has_handler::<Double>());
    }

    #[tokio::test]
    async fn test_async_publisher_preserves_order() {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, "a", &log);
        recorder(&bus, "b", &log);

        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let done_tx = Mutex::new(Some(done_tx));
        bus.listen(move |ping: &Ping| {
            if ping.0 == 3 {
                if let Some(tx) = done_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
            Ok(())
        });

        let publisher = bus.spawn_dispatcher();
        for n in 1..=3 {
            publisher.publish(Ping(n)).unwrap();
        }
        done_rx.await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:1", "b:1", "a:2", "b:2", "a:3", "b:3"]
        );
    }
}
