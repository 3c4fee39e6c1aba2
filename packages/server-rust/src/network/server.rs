//! Server assembly and lifecycle.
//!
//! Follows the deferred startup pattern: `new()` wires the store, the
//! engines, the event bus, and the queues; `bind()` claims the TCP
//! listener; `serve()` spawns the pipeline tasks and accepts
//! connections until shutdown is signalled.
//!
//! Each accepted connection gets two tasks: a reader that frames bytes,
//! parses requests, and feeds the request queue, and a socket write
//! loop that drains the connection's bounded outbound channel. Frame
//! and grammar failures are answered with error frames; only transport
//! failure closes a connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use stash_core::{code, Frame, Request};

use crate::config::ServerConfig;
use crate::engines::{
    EvictionEngine, EvictionMessage, EvictionObserver, ExpiryEngine, ExpiryMessage,
    ExpiryObserver,
};
use crate::events::{EventBus, EventPublisher, ResponseQueueItem};
use crate::pipeline::{Dispatcher, RequestQueueItem, ResponseWriter};
use crate::storage::{CompositeMutationObserver, MemoryAccountant, MutationObserver, Store};

use super::codec::{CodecError, FrameCodec};
use super::connection::{
    ClientHandle, ConnectionRegistry, OutboundFrame, OUTBOUND_CAPACITY,
};
use super::shutdown::ShutdownController;

/// How long shutdown waits for in-flight requests before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The assembled cache server.
pub struct CacheServer {
    config: ServerConfig,
    listener: Option<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    expiry: Arc<ExpiryEngine>,
    eviction: Arc<EvictionEngine>,
    request_tx: mpsc::UnboundedSender<RequestQueueItem>,
    request_rx: mpsc::UnboundedReceiver<RequestQueueItem>,
    response_tx: mpsc::UnboundedSender<ResponseQueueItem>,
    response_rx: mpsc::UnboundedReceiver<ResponseQueueItem>,
    expiry_rx: mpsc::UnboundedReceiver<ExpiryMessage>,
    eviction_rx: mpsc::UnboundedReceiver<EvictionMessage>,
}

impl CacheServer {
    /// Wire up the store, engines, event bus, and queues. No port is
    /// bound and no task is spawned yet.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let (eviction_tx, eviction_rx) = mpsc::unbounded_channel();

        let bus = Arc::new(EventBus::new(response_tx.clone()));
        let observers = CompositeMutationObserver::new(vec![
            Arc::new(ExpiryObserver::new(expiry_tx)) as Arc<dyn MutationObserver>,
            Arc::new(EvictionObserver::new(eviction_tx)),
            Arc::new(EventPublisher::new(Arc::clone(&bus))),
        ]);
        let store = Arc::new(Store::new(
            MemoryAccountant::new(config.ceiling_bytes(), config.eviction_threshold),
            observers,
            config.expiry_mode(),
        ));
        let expiry = Arc::new(ExpiryEngine::new(
            Arc::clone(&store),
            config.sweep_interval_secs,
            config.expiry_mode(),
        ));
        let eviction = Arc::new(EvictionEngine::new(
            Arc::clone(&store),
            config.eviction_factor,
        ));

        Self {
            config,
            listener: None,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            store,
            bus,
            expiry,
            eviction,
            request_tx,
            request_rx,
            response_tx,
            response_rx,
            expiry_rx,
            eviction_rx,
        }
    }

    /// The store backing this server. Used by embedding code and tests.
    #[must_use]
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// The shutdown controller shared with every pipeline task.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// The live-connection registry.
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind the client listener. Returns the actual bound port, which
    /// differs from the configured one when port 0 was requested.
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be bound; the binary
    /// treats that as unrecoverable.
    pub async fn bind(&mut self) -> anyhow::Result<u16> {
        let addr = ("0.0.0.0", self.config.client_port);
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        info!(port, "client listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Spawn the pipeline tasks and accept connections until
    /// `shutdown_signal` resolves, then drain: stop accepting, close
    /// every connection, and wait for in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns an error on a fatal listener failure.
    ///
    /// # Panics
    ///
    /// Panics if `bind()` was not called first.
    pub async fn serve(
        self,
        shutdown_signal: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        // Extract every field up front: the queue receivers move into
        // their tasks, which a method on `&self` could not express.
        let Self {
            config: _,
            listener,
            registry,
            shutdown,
            store,
            bus,
            expiry,
            eviction,
            request_tx,
            request_rx,
            response_tx,
            response_rx,
            expiry_rx,
            eviction_rx,
        } = self;
        let listener = listener.expect("bind() must be called before serve()");

        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            response_tx.clone(),
            Arc::clone(&shutdown),
        );
        tokio::spawn(dispatcher.run(request_rx, shutdown.subscribe()));

        let writer = ResponseWriter::new(Arc::clone(&bus), Arc::clone(&registry));
        tokio::spawn(writer.run(response_rx, shutdown.subscribe()));

        tokio::spawn(expiry.run(expiry_rx, shutdown.subscribe()));
        tokio::spawn(eviction.run(eviction_rx, shutdown.subscribe()));

        info!("cache server serving");
        tokio::pin!(shutdown_signal);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "client connected");
                        spawn_connection(
                            stream,
                            &registry,
                            &bus,
                            &request_tx,
                            &response_tx,
                            &shutdown,
                        );
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                () = &mut shutdown_signal => break,
            }
        }

        drain(&registry, &shutdown).await;
        Ok(())
    }
}

fn spawn_connection(
    stream: TcpStream,
    registry: &Arc<ConnectionRegistry>,
    bus: &Arc<EventBus>,
    request_tx: &mpsc::UnboundedSender<RequestQueueItem>,
    response_tx: &mpsc::UnboundedSender<ResponseQueueItem>,
    shutdown: &Arc<ShutdownController>,
) {
    let (handle, conn_rx) = registry.register(OUTBOUND_CAPACITY);
    let (read_half, write_half) = stream.into_split();

    tokio::spawn(write_loop(write_half, conn_rx));
    tokio::spawn(read_loop(
        read_half,
        handle,
        Arc::clone(registry),
        Arc::clone(bus),
        request_tx.clone(),
        response_tx.clone(),
        shutdown.subscribe(),
    ));
    metrics::gauge!("stash_connections").increment(1.0);
}

/// Stop accepting, close every connection, and wait for in-flight
/// requests to finish.
async fn drain(registry: &Arc<ConnectionRegistry>, shutdown: &Arc<ShutdownController>) {
    shutdown.begin_drain();

    let handles = registry.drain_all();
    if !handles.is_empty() {
        info!(connections = handles.len(), "draining connections");
        for handle in &handles {
            let _ = handle.try_send(OutboundFrame::Close);
        }
    }

    if shutdown.wait_for_drain(DRAIN_TIMEOUT).await {
        info!("drain complete");
    } else {
        warn!("drain timeout expired with requests in flight");
    }
}

/// Per-connection reader: frames bytes, parses requests, feeds the
/// request queue. Grammar and frame failures are answered on the
/// response queue; only transport failure ends the loop early.
async fn read_loop(
    read_half: OwnedReadHalf,
    handle: Arc<ClientHandle>,
    registry: Arc<ConnectionRegistry>,
    bus: Arc<EventBus>,
    request_tx: mpsc::UnboundedSender<RequestQueueItem>,
    response_tx: mpsc::UnboundedSender<ResponseQueueItem>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    loop {
        tokio::select! {
            item = frames.next() => match item {
                Some(Ok(line)) => match Request::parse_frame(&line) {
                    Ok(request) => {
                        let _ = request_tx.send((Arc::clone(&handle), request));
                    }
                    Err(e) => {
                        let frame =
                            Frame::error(e.response_id(), code::BAD_REQUEST, e.to_string());
                        let _ = response_tx.send((Arc::clone(&handle), frame));
                    }
                },
                Some(Err(CodecError::FrameTooLong)) => {
                    let frame = Frame::error("0", code::BAD_REQUEST, "frame too long");
                    let _ = response_tx.send((Arc::clone(&handle), frame));
                }
                Some(Err(CodecError::Io(e))) => {
                    debug!(client = handle.id.0, error = %e, "read failed");
                    break;
                }
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        }
    }

    // Connection gone: forget the handle everywhere and stop its writer.
    registry.remove(handle.id);
    bus.purge(handle.id);
    let _ = handle.try_send(OutboundFrame::Close);
    metrics::gauge!("stash_connections").decrement(1.0);
    debug!(client = handle.id.0, "client disconnected");
}

/// Per-connection socket write loop: drains the bounded outbound channel
/// onto the wire.
async fn write_loop(write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<OutboundFrame>) {
    let mut sink = FramedWrite::new(write_half, FrameCodec::new());
    while let Some(frame) = rx.recv().await {
        match frame {
            OutboundFrame::Line(line) => {
                if sink.send(line).await.is_err() {
                    break;
                }
            }
            OutboundFrame::Close => {
                let _ = sink.flush().await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            client_port: 0,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn new_creates_server_without_binding() {
        let server = CacheServer::new(test_config());
        assert!(server.listener.is_none());
        assert_eq!(server.registry().count(), 0);
    }

    #[tokio::test]
    async fn bind_claims_an_os_assigned_port() {
        let mut server = CacheServer::new(test_config());
        let port = server.bind().await.expect("bind should succeed");
        assert!(port > 0);
        assert!(server.listener.is_some());
    }

    #[tokio::test]
    async fn bind_fails_on_a_taken_port() {
        let mut first = CacheServer::new(test_config());
        let port = first.bind().await.unwrap();

        let mut second = CacheServer::new(ServerConfig {
            client_port: port,
            ..ServerConfig::default()
        });
        assert!(second.bind().await.is_err());
    }

    #[tokio::test]
    #[should_panic(expected = "bind() must be called before serve()")]
    async fn serve_panics_without_bind() {
        let server = CacheServer::new(test_config());
        let _ = server.serve(std::future::pending::<()>()).await;
    }
}
