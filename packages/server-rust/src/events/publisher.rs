//! Store observer that renders mutations into subscriber event frames.

use std::sync::Arc;

use stash_core::EventKind;

use crate::storage::{CacheEntry, MutationObserver, RemovalCause};

use super::bus::EventBus;

/// Bridges store mutations onto the [`EventBus`].
///
/// Reads are not a subscribable kind, so they pass through silently.
/// Removals publish the same delete event whatever their cause; a client
/// cannot tell an eviction or a sweep from an explicit delete, which is
/// what keeps the engines on the client-delete code path.
pub struct EventPublisher {
    bus: Arc<EventBus>,
}

impl EventPublisher {
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl MutationObserver for EventPublisher {
    fn on_create(&self, key: &str, entry: &CacheEntry) {
        self.bus.publish(
            EventKind::Create,
            &format!("Created key '{key}' with value '{}'", entry.value),
        );
    }

    fn on_read(&self, _key: &str, _old_count: u64, _new_count: u64) {}

    fn on_update(&self, key: &str, old: &CacheEntry, new: &CacheEntry) {
        self.bus.publish(
            EventKind::Update,
            &format!(
                "Updated key '{key}' from '{}' to '{}'",
                old.value, new.value
            ),
        );
    }

    fn on_remove(&self, key: &str, _entry: &CacheEntry, _cause: RemovalCause) {
        self.bus
            .publish(EventKind::Delete, &format!("Deleted key '{key}'"));
    }

    fn on_flush(&self, removed: usize) {
        self.bus.publish(
            EventKind::Flushall,
            &format!("Flushed all entries ({removed} removed)"),
        );
    }

    fn on_eviction_needed(&self, _bytes_used: u64) {}
}
