//! The single response writer task.
//!
//! Drains the response queue in order, serializes each frame, and moves
//! it onto the owning connection's bounded channel. A connection whose
//! write loop has exited is purged from the event bus and the registry;
//! a connection that is merely slow gets a bounded grace period for
//! responses, while events to it are dropped rather than stalling every
//! other client behind one laggard.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use stash_core::FrameType;

use crate::events::{EventBus, ResponseQueueItem};
use crate::network::connection::{
    ClientHandle, ConnectionRegistry, OutboundFrame, SendError,
};

/// How long a response may wait for space on a slow connection's channel.
const SLOW_CLIENT_GRACE: Duration = Duration::from_secs(5);

/// Serializes response-queue items onto per-connection channels.
pub struct ResponseWriter {
    bus: Arc<EventBus>,
    registry: Arc<ConnectionRegistry>,
}

impl ResponseWriter {
    #[must_use]
    pub fn new(bus: Arc<EventBus>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { bus, registry }
    }

    /// Worker loop: deliver frames until the queue closes or shutdown is
    /// signalled; queued responses are still flushed on drain.
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<ResponseQueueItem>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some((handle, frame)) => self.deliver(&handle, frame).await,
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    while let Ok((handle, frame)) = rx.try_recv() {
                        self.deliver(&handle, frame).await;
                    }
                    break;
                }
            }
        }
        debug!("response writer exited");
    }

    async fn deliver(&self, handle: &Arc<ClientHandle>, frame: stash_core::Frame) {
        let is_event = frame.frame_type == FrameType::Event;
        let line = frame.to_wire();
        match handle.try_send(OutboundFrame::Line(line.clone())) {
            Ok(()) => {}
            Err(SendError::Disconnected) => self.drop_client(handle),
            Err(SendError::Full) if is_event => {
                // Slow subscriber: events are droppable, delivery is
                // best-effort once the channel backs up.
                metrics::counter!("stash_events_dropped_total").increment(1);
                warn!(client = handle.id.0, "dropping event for slow subscriber");
            }
            Err(SendError::Full) => {
                match handle
                    .send_timeout(OutboundFrame::Line(line), SLOW_CLIENT_GRACE)
                    .await
                {
                    Ok(()) => {}
                    Err(_) => {
                        warn!(client = handle.id.0, "response undeliverable, closing handle");
                        self.drop_client(handle);
                    }
                }
            }
            Err(SendError::Timeout) => unreachable!("try_send never times out"),
        }
    }

    fn drop_client(&self, handle: &Arc<ClientHandle>) {
        self.bus.purge(handle.id);
        if self.registry.remove(handle.id).is_some() {
            debug!(client = handle.id.0, "purged disconnected client");
        }
    }
}

#[cfg(test)]
mod tests {
    use stash_core::{code, EventKind, Frame};

    use super::*;
    use crate::network::connection::OUTBOUND_CAPACITY;
    use crate::network::shutdown::ShutdownController;

    fn setup() -> (
        ResponseWriter,
        Arc<ConnectionRegistry>,
        Arc<EventBus>,
        mpsc::UnboundedSender<ResponseQueueItem>,
        mpsc::UnboundedReceiver<ResponseQueueItem>,
    ) {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = Arc::new(EventBus::new(response_tx.clone()));
        let writer = ResponseWriter::new(Arc::clone(&bus), Arc::clone(&registry));
        (writer, registry, bus, response_tx, response_rx)
    }

    #[tokio::test]
    async fn delivers_serialized_frames_to_the_handle() {
        let (writer, registry, _bus, response_tx, response_rx) = setup();
        let (handle, mut conn_rx) = registry.register(OUTBOUND_CAPACITY);

        let shutdown = ShutdownController::new();
        let worker = tokio::spawn(writer.run(response_rx, shutdown.subscribe()));

        response_tx
            .send((Arc::clone(&handle), Frame::response("r1", code::OK, "Ok")))
            .unwrap();

        let frame = conn_rx.recv().await.unwrap();
        let OutboundFrame::Line(line) = frame else {
            panic!("expected a line frame");
        };
        assert!(line.contains("\"requestId\":\"r1\""));

        // The bus keeps a queue sender alive, so the worker exits via
        // the drain signal rather than channel closure.
        shutdown.begin_drain();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn disconnected_handle_is_purged_from_bus_and_registry() {
        let (writer, registry, bus, response_tx, response_rx) = setup();
        let (handle, conn_rx) = registry.register(OUTBOUND_CAPACITY);
        bus.subscribe(&handle, EventKind::Create);

        // The write loop is gone: deliveries must purge, not hang.
        drop(conn_rx);

        let shutdown = ShutdownController::new();
        let worker = tokio::spawn(writer.run(response_rx, shutdown.subscribe()));

        response_tx
            .send((Arc::clone(&handle), Frame::response("r1", code::OK, "Ok")))
            .unwrap();
        shutdown.begin_drain();
        worker.await.unwrap();

        assert_eq!(bus.subscriber_count(EventKind::Create), 0);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn events_to_full_channels_are_dropped_not_blocking() {
        let (writer, registry, _bus, response_tx, response_rx) = setup();
        let (slow, _slow_rx) = registry.register(1);
        let (fast, mut fast_rx) = registry.register(OUTBOUND_CAPACITY);

        // Fill the slow client's channel.
        slow.try_send(OutboundFrame::Line("x".to_string())).unwrap();

        let shutdown = ShutdownController::new();
        let worker = tokio::spawn(writer.run(response_rx, shutdown.subscribe()));

        response_tx
            .send((Arc::clone(&slow), Frame::event("ev-1", "Created key 'k'")))
            .unwrap();
        response_tx
            .send((Arc::clone(&fast), Frame::response("r1", code::OK, "Ok")))
            .unwrap();

        // The fast client is served promptly despite the slow one.
        let frame = tokio::time::timeout(Duration::from_secs(1), fast_rx.recv())
            .await
            .expect("writer must not stall behind a slow subscriber")
            .unwrap();
        assert!(matches!(frame, OutboundFrame::Line(_)));

        shutdown.begin_drain();
        worker.await.unwrap();
    }
}
