//! Mutation observer trait and composite implementation.
//!
//! Defines [`MutationObserver`] for reacting to store mutations, and
//! [`CompositeMutationObserver`] which fans a notification out to every
//! registered observer.
//!
//! Observers are invoked inside the store's exclusive section, after the
//! mutation is applied, so notifications carry mutation order.
//! Implementations MUST therefore be non-blocking: enqueue onto a channel
//! and return. The expiry and eviction engines and the event publisher
//! all follow that shape; their real work happens on their own tasks.

use std::sync::Arc;

use super::entry::CacheEntry;

/// Why an entry left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// A client DELETE.
    Explicit,
    /// A strict-mode sweep, or a lazy-mode read of a marked entry.
    Expired,
    /// An eviction pass under memory pressure.
    Evicted,
}

/// Observer for mutations within the store.
///
/// Used as `Arc<dyn MutationObserver>`.
pub trait MutationObserver: Send + Sync {
    /// Called after a new entry is inserted.
    fn on_create(&self, key: &str, entry: &CacheEntry);

    /// Called after a successful read bumped the entry's usage count.
    fn on_read(&self, key: &str, old_count: u64, new_count: u64);

    /// Called after an entry's value (and possibly deadline) changed.
    fn on_update(&self, key: &str, old: &CacheEntry, new: &CacheEntry);

    /// Called after an entry is removed, for any cause.
    fn on_remove(&self, key: &str, entry: &CacheEntry, cause: RemovalCause);

    /// Called after all entries are removed at once.
    fn on_flush(&self, removed: usize);

    /// Called when a create observed memory pressure. Fire-and-forget:
    /// the create proceeds without waiting for any eviction pass.
    fn on_eviction_needed(&self, bytes_used: u64);
}

/// Composite observer that fans out to multiple observers.
#[derive(Default)]
pub struct CompositeMutationObserver {
    observers: Vec<Arc<dyn MutationObserver>>,
}

impl CompositeMutationObserver {
    /// Creates a composite over the given list of observers.
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn MutationObserver>>) -> Self {
        Self { observers }
    }

    /// Adds an observer after construction.
    pub fn add(&mut self, observer: Arc<dyn MutationObserver>) {
        self.observers.push(observer);
    }
}

impl MutationObserver for CompositeMutationObserver {
    fn on_create(&self, key: &str, entry: &CacheEntry) {
        for observer in &self.observers {
            observer.on_create(key, entry);
        }
    }

    fn on_read(&self, key: &str, old_count: u64, new_count: u64) {
        for observer in &self.observers {
            observer.on_read(key, old_count, new_count);
        }
    }

    fn on_update(&self, key: &str, old: &CacheEntry, new: &CacheEntry) {
        for observer in &self.observers {
            observer.on_update(key, old, new);
        }
    }

    fn on_remove(&self, key: &str, entry: &CacheEntry, cause: RemovalCause) {
        for observer in &self.observers {
            observer.on_remove(key, entry, cause);
        }
    }

    fn on_flush(&self, removed: usize) {
        for observer in &self.observers {
            observer.on_flush(removed);
        }
    }

    fn on_eviction_needed(&self, bytes_used: u64) {
        for observer in &self.observers {
            observer.on_eviction_needed(bytes_used);
        }
    }
}
