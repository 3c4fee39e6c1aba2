//! Per-kind subscriber tables and event fan-out.
//!
//! Each event kind owns an independent copy-on-write subscriber list:
//! publishers load the current snapshot lock-free and never hold any
//! lock across an enqueue, while subscribe/unsubscribe/purge serialize
//! on a small per-kind write lock and swap in a fresh list. Publication
//! only ever enqueues onto the response queue; delivery to sockets is
//! the writer's problem.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use stash_core::{EventKind, Frame};

use crate::network::connection::{ClientHandle, ClientId};

/// An item on the response queue: the frame and the handle it belongs to.
pub type ResponseQueueItem = (Arc<ClientHandle>, Frame);

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    /// The handle was already on this kind's list; the table is
    /// unchanged.
    AlreadyRegistered,
}

/// One kind's subscriber list: a lock-free snapshot for publishers and a
/// write lock serializing list replacement.
struct KindSubscribers {
    snapshot: ArcSwap<Vec<Arc<ClientHandle>>>,
    write_lock: Mutex<()>,
}

impl KindSubscribers {
    fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }
}

/// Fan-out hub from store mutations to subscribed client handles.
pub struct EventBus {
    subscribers: [KindSubscribers; 4],
    response_tx: mpsc::UnboundedSender<ResponseQueueItem>,
}

impl EventBus {
    #[must_use]
    pub fn new(response_tx: mpsc::UnboundedSender<ResponseQueueItem>) -> Self {
        Self {
            subscribers: std::array::from_fn(|_| KindSubscribers::new()),
            response_tx,
        }
    }

    fn table(&self, kind: EventKind) -> &KindSubscribers {
        &self.subscribers[kind.index()]
    }

    /// Add `handle` to `kind`'s list. Idempotent: an already-subscribed
    /// handle is reported, not duplicated.
    pub fn subscribe(&self, handle: &Arc<ClientHandle>, kind: EventKind) -> SubscribeOutcome {
        let table = self.table(kind);
        let _write = table.write_lock.lock();
        let current = table.snapshot.load();
        if current.iter().any(|h| h.id == handle.id) {
            return SubscribeOutcome::AlreadyRegistered;
        }
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().map(Arc::clone));
        next.push(Arc::clone(handle));
        table.snapshot.store(Arc::new(next));
        SubscribeOutcome::Subscribed
    }

    /// Remove `id` from `kind`'s list. Silent when absent.
    pub fn unsubscribe(&self, id: ClientId, kind: EventKind) {
        let table = self.table(kind);
        let _write = table.write_lock.lock();
        let current = table.snapshot.load();
        if !current.iter().any(|h| h.id == id) {
            return;
        }
        let next: Vec<Arc<ClientHandle>> = current
            .iter()
            .filter(|h| h.id != id)
            .map(Arc::clone)
            .collect();
        table.snapshot.store(Arc::new(next));
    }

    /// Enqueue one event frame per current subscriber of `kind`. Each
    /// frame carries a freshly generated id unrelated to any request.
    pub fn publish(&self, kind: EventKind, message: &str) {
        let snapshot = self.table(kind).snapshot.load();
        if snapshot.is_empty() {
            return;
        }
        for handle in snapshot.iter() {
            let frame = Frame::event(Uuid::new_v4().to_string(), message);
            // The writer owns the receiver for the server's lifetime; a
            // closed queue only happens during shutdown.
            let _ = self.response_tx.send((Arc::clone(handle), frame));
        }
        metrics::counter!("stash_events_published_total", "kind" => kind.as_str())
            .increment(snapshot.len() as u64);
        trace!(kind = kind.as_str(), subscribers = snapshot.len(), "event published");
    }

    /// Drop `id` from every kind's list. Called when the writer observes
    /// a permanent delivery failure or the connection closes.
    pub fn purge(&self, id: ClientId) {
        for kind in EventKind::ALL {
            self.unsubscribe(id, kind);
        }
    }

    /// Current subscriber count for `kind`.
    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.table(kind).snapshot.load().len()
    }
}
