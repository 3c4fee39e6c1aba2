//! The single dispatcher task.
//!
//! One task drains the request queue in arrival order, so requests are
//! globally ordered and every client sees its responses in the order it
//! sent its requests. Each command is matched exactly once; store
//! commands go to [`Store`], subscription commands to [`EventBus`], and
//! every request produces exactly one response frame.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use stash_core::{code, Command, Frame, Request};

use crate::events::{EventBus, ResponseQueueItem, SubscribeOutcome};
use crate::network::connection::ClientHandle;
use crate::network::shutdown::ShutdownController;
use crate::storage::{Store, StoreError};

/// An item on the request queue: the parsed request and the handle that
/// sent it.
pub type RequestQueueItem = (Arc<ClientHandle>, Request);

/// Routes parsed requests to the store and the event bus.
pub struct Dispatcher {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    response_tx: mpsc::UnboundedSender<ResponseQueueItem>,
    shutdown: Arc<ShutdownController>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        response_tx: mpsc::UnboundedSender<ResponseQueueItem>,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            store,
            bus,
            response_tx,
            shutdown,
        }
    }

    /// Execute one request and build its response frame.
    pub fn handle(&self, handle: &Arc<ClientHandle>, request: Request) -> Frame {
        let Request { id, command } = request;
        metrics::counter!("stash_requests_total", "command" => command.tag()).increment(1);

        if let Some(key) = command_key(&command) {
            if key.is_empty() {
                return Frame::error(id, code::BAD_REQUEST, "key must be a non-empty string");
            }
        }

        match command {
            Command::Create { key, value } => match self.store.create(&key, value, 0) {
                Ok(()) => Frame::response(id, code::OK, format!("Created {key}")),
                Err(e) => store_error_frame(id, &e),
            },
            Command::Add { key, value, ttl } => match self.store.create(&key, value, ttl) {
                Ok(()) => Frame::response(id, code::OK, format!("Created {key}")),
                Err(e) => store_error_frame(id, &e),
            },
            Command::Read { key } => match self.store.read(&key) {
                Ok(value) => Frame::response_with_value(id, code::OK, "Ok", value),
                Err(e) => store_error_frame(id, &e),
            },
            Command::Update { key, value, ttl } => match self.store.update(&key, value, ttl) {
                Ok(()) => Frame::response(id, code::OK, format!("Updated {key}")),
                Err(e) => store_error_frame(id, &e),
            },
            Command::Delete { key } => {
                if self.store.remove(&key, crate::storage::RemovalCause::Explicit) {
                    Frame::response(id, code::OK, "Key Deleted Successfully")
                } else {
                    Frame::error(id, code::NOT_FOUND, format!("key not found: {key}"))
                }
            }
            Command::Mem => {
                let mb = format!("{:.6}", self.store.memory_mb());
                Frame::response_with_value(id, code::OK, mb.clone(), mb)
            }
            Command::FlushAll => {
                let removed = self.store.flush_all();
                Frame::response(id, code::OK, format!("Flushed all entries ({removed} removed)"))
            }
            Command::Sub { kind } => match self.bus.subscribe(handle, kind) {
                SubscribeOutcome::Subscribed => {
                    Frame::response(id, code::OK, format!("Subscribed to {kind}"))
                }
                SubscribeOutcome::AlreadyRegistered => {
                    Frame::response(id, code::OK, format!("Already subscribed to {kind}"))
                }
            },
            Command::Unsub { kind } => {
                self.bus.unsubscribe(handle.id, kind);
                Frame::response(id, code::OK, format!("Unsubscribed from {kind}"))
            }
        }
    }

    /// Worker loop: drain the request queue in order until shutdown. On
    /// the drain signal, already-queued requests are still answered so
    /// no client is left without a response frame.
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<RequestQueueItem>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some((handle, request)) => self.dispatch(handle, request),
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    while let Ok((handle, request)) = rx.try_recv() {
                        self.dispatch(handle, request);
                    }
                    break;
                }
            }
        }
        debug!("dispatcher exited");
    }

    fn dispatch(&self, handle: Arc<ClientHandle>, request: Request) {
        let _guard = self.shutdown.in_flight_guard();
        let frame = self.handle(&handle, request);
        let _ = self.response_tx.send((handle, frame));
    }
}

/// The key a command addresses, if any. Used for non-empty validation;
/// the text parser cannot produce an empty key, but the structured form
/// can.
fn command_key(command: &Command) -> Option<&str> {
    match command {
        Command::Create { key, .. }
        | Command::Add { key, .. }
        | Command::Read { key }
        | Command::Update { key, .. }
        | Command::Delete { key } => Some(key),
        Command::Mem | Command::FlushAll | Command::Sub { .. } | Command::Unsub { .. } => None,
    }
}

fn store_error_frame(id: String, err: &StoreError) -> Frame {
    let code = match err {
        StoreError::DuplicateKey(_) => code::CONFLICT,
        StoreError::NotFound(_) => code::NOT_FOUND,
        StoreError::MemoryLimit => code::INTERNAL,
    };
    Frame::error(id, code, err.to_string())
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use stash_core::FrameType;

    use super::*;
    use crate::config::ExpiryMode;
    use crate::network::connection::{ConnectionRegistry, OUTBOUND_CAPACITY};
    use crate::storage::{CompositeMutationObserver, MemoryAccountant};

    struct Fixture {
        dispatcher: Dispatcher,
        registry: ConnectionRegistry,
        response_rx: mpsc::UnboundedReceiver<ResponseQueueItem>,
    }

    fn fixture(ceiling: u64) -> Fixture {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(EventBus::new(response_tx.clone()));
        let store = Arc::new(Store::new(
            MemoryAccountant::new(ceiling, 0.9),
            CompositeMutationObserver::default(),
            ExpiryMode::Lazy,
        ));
        let shutdown = Arc::new(ShutdownController::new());
        Fixture {
            dispatcher: Dispatcher::new(store, bus, response_tx, shutdown),
            registry: ConnectionRegistry::new(),
            response_rx,
        }
    }

    fn run(fixture: &Fixture, handle: &Arc<ClientHandle>, line: &str) -> Frame {
        let request = Request::parse_frame(line).unwrap();
        fixture.dispatcher.handle(handle, request)
    }

    #[test]
    fn create_read_delete_round_trip() {
        let fixture = fixture(10 * 1_048_576);
        let (handle, _rx) = fixture.registry.register(OUTBOUND_CAPACITY);

        let frame = run(&fixture, &handle, "r1 CREATE k1 hello");
        assert_eq!((frame.code, frame.message.as_str()), (code::OK, "Created k1"));

        let frame = run(&fixture, &handle, "r2 READ k1");
        assert_eq!(frame.code, code::OK);
        assert_eq!(frame.value.as_deref(), Some("hello"));

        let frame = run(&fixture, &handle, "r3 DELETE k1");
        assert_eq!(frame.message, "Key Deleted Successfully");

        let frame = run(&fixture, &handle, "r4 READ k1");
        assert_eq!(frame.code, code::NOT_FOUND);
        assert_eq!(frame.frame_type, FrameType::Error);
    }

    #[test]
    fn duplicate_create_maps_to_conflict() {
        let fixture = fixture(10 * 1_048_576);
        let (handle, _rx) = fixture.registry.register(OUTBOUND_CAPACITY);

        run(&fixture, &handle, "r1 CREATE k v");
        let frame = run(&fixture, &handle, "r2 CREATE k w");
        assert_eq!(frame.code, code::CONFLICT);
    }

    #[test]
    fn memory_limit_maps_to_internal() {
        let fixture = fixture(64);
        let (handle, _rx) = fixture.registry.register(OUTBOUND_CAPACITY);

        let frame = run(&fixture, &handle, "r1 CREATE a aaaaaaaaaaaaaaa");
        assert_eq!(frame.code, code::OK);

        let frame = run(&fixture, &handle, "r2 CREATE b bbbbbbbbbbbbbbbbbbbbbb");
        assert_eq!(frame.code, code::INTERNAL);
        assert!(frame.message.contains("memory limit"));

        // The rejection left the accountant untouched at 32 bytes.
        let frame = run(&fixture, &handle, "r3 MEM");
        assert_eq!(frame.value.as_deref(), Some("0.000031"));
    }

    #[test]
    fn mem_reports_six_decimal_megabytes() {
        let fixture = fixture(10 * 1_048_576);
        let (handle, _rx) = fixture.registry.register(OUTBOUND_CAPACITY);

        let frame = run(&fixture, &handle, "r1 MEM");
        assert_eq!(frame.value.as_deref(), Some("0.000000"));

        run(&fixture, &handle, "r2 CREATE a aaaaaaaaaaaaaaa");
        let frame = run(&fixture, &handle, "r3 MEM");
        assert_eq!(frame.value.as_deref(), Some("0.000031"));
    }

    #[test]
    fn flushall_then_mem_reads_zero() {
        let fixture = fixture(10 * 1_048_576);
        let (handle, _rx) = fixture.registry.register(OUTBOUND_CAPACITY);

        run(&fixture, &handle, "r1 CREATE a 1111");
        run(&fixture, &handle, "r2 CREATE b 2222");
        let frame = run(&fixture, &handle, "r3 FLUSHALL");
        assert_eq!(frame.code, code::OK);

        let frame = run(&fixture, &handle, "r4 MEM");
        assert_eq!(frame.value.as_deref(), Some("0.000000"));
    }

    #[test]
    fn add_with_ttl_and_update_preserving_ttl() {
        let fixture = fixture(10 * 1_048_576);
        let (handle, _rx) = fixture.registry.register(OUTBOUND_CAPACITY);

        let frame = run(&fixture, &handle, "r1 ADD k v 30");
        assert_eq!(frame.code, code::OK);

        let frame = run(&fixture, &handle, "r2 UPDATE k v2");
        assert_eq!(frame.message, "Updated k");

        let frame = run(&fixture, &handle, "r3 READ k");
        assert_eq!(frame.value.as_deref(), Some("v2"));
    }

    #[test]
    fn update_of_missing_key_is_not_found() {
        let fixture = fixture(10 * 1_048_576);
        let (handle, _rx) = fixture.registry.register(OUTBOUND_CAPACITY);

        let frame = run(&fixture, &handle, "r1 UPDATE ghost v");
        assert_eq!(frame.code, code::NOT_FOUND);
    }

    #[test]
    fn empty_key_from_structured_form_is_bad_args() {
        let fixture = fixture(10 * 1_048_576);
        let (handle, _rx) = fixture.registry.register(OUTBOUND_CAPACITY);

        let request = Request::parse_frame(
            r#"{"requestId": "r1", "command": "READ", "args": [""]}"#,
        )
        .unwrap();
        let frame = fixture.dispatcher.handle(&handle, request);
        assert_eq!(frame.code, code::BAD_REQUEST);
    }

    #[test]
    fn sub_is_idempotent_and_unsub_is_silent() {
        let fixture = fixture(10 * 1_048_576);
        let (handle, _rx) = fixture.registry.register(OUTBOUND_CAPACITY);

        let frame = run(&fixture, &handle, "r1 SUB CREATE");
        assert_eq!(frame.message, "Subscribed to CREATE");

        let frame = run(&fixture, &handle, "r2 SUB create");
        assert_eq!(frame.message, "Already subscribed to CREATE");

        let frame = run(&fixture, &handle, "r3 UNSUB CREATE");
        assert_eq!(frame.message, "Unsubscribed from CREATE");

        let frame = run(&fixture, &handle, "r4 UNSUB CREATE");
        assert_eq!(frame.code, code::OK);
    }

    #[test]
    fn own_mutation_reaches_own_subscription() {
        let mut fixture = fixture(10 * 1_048_576);
        // Rewire the store so mutations publish through the bus.
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(EventBus::new(response_tx.clone()));
        let store = Arc::new(Store::new(
            MemoryAccountant::new(10 * 1_048_576, 0.9),
            CompositeMutationObserver::new(vec![Arc::new(
                crate::events::EventPublisher::new(Arc::clone(&bus)),
            )]),
            ExpiryMode::Lazy,
        ));
        fixture.dispatcher = Dispatcher::new(
            store,
            bus,
            response_tx,
            Arc::new(ShutdownController::new()),
        );
        fixture.response_rx = response_rx;

        let (handle, _rx) = fixture.registry.register(OUTBOUND_CAPACITY);
        run(&fixture, &handle, "r1 SUB CREATE");
        run(&fixture, &handle, "r2 CREATE z 1");

        let (target, frame) = fixture.response_rx.try_recv().unwrap();
        assert_eq!(target.id, handle.id);
        assert_eq!(frame.frame_type, FrameType::Event);
        assert!(frame.message.contains('z'));
    }

    #[tokio::test]
    async fn run_loop_answers_queued_requests_in_order() {
        let fixture = fixture(10 * 1_048_576);
        let Fixture {
            dispatcher,
            registry,
            mut response_rx,
        } = fixture;
        let (handle, _hrx) = registry.register(OUTBOUND_CAPACITY);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let shutdown = ShutdownController::new();
        let worker = tokio::spawn(dispatcher.run(request_rx, shutdown.subscribe()));

        for line in ["r1 CREATE k v", "r2 READ k", "r3 DELETE k"] {
            let request = Request::parse_frame(line).unwrap();
            request_tx.send((Arc::clone(&handle), request)).unwrap();
        }

        let mut ids = Vec::new();
        for _ in 0..3 {
            let (_, frame) = response_rx.recv().await.unwrap();
            ids.push(frame.request_id);
        }
        assert_eq!(ids, vec!["r1", "r2", "r3"]);

        drop(request_tx);
        worker.await.unwrap();
    }
}
