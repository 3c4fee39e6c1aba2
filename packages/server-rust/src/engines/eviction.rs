//! LFU eviction engine: frequency-indexed reverse map plus the pressure
//! worker.
//!
//! The store's observer forwards access-count changes over a channel; a
//! single worker applies them under the engine's private lock. A
//! pressure signal triggers an eviction pass, which collects the
//! least-frequent keys under the lock, releases it, and then deletes
//! them through the store's normal removal path so the delete events
//! publish identically to client deletes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::storage::{CacheEntry, MutationObserver, RemovalCause, Store};

/// Bookkeeping messages from the store's mutation observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionMessage {
    Insert { key: String, count: u64 },
    Touch {
        key: String,
        old_count: u64,
        new_count: u64,
    },
    Remove { key: String, count: u64 },
    Flush,
    Pressure { bytes_used: u64 },
}

/// Store observer that forwards usage changes to the eviction worker.
/// Enqueue-only; never blocks the store's critical section.
pub struct EvictionObserver {
    tx: mpsc::UnboundedSender<EvictionMessage>,
}

impl EvictionObserver {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<EvictionMessage>) -> Self {
        Self { tx }
    }

    fn forward(&self, msg: EvictionMessage) {
        let _ = self.tx.send(msg);
    }
}

impl MutationObserver for EvictionObserver {
    fn on_create(&self, key: &str, entry: &CacheEntry) {
        self.forward(EvictionMessage::Insert {
            key: key.to_string(),
            count: entry.usage_count,
        });
    }

    fn on_read(&self, key: &str, old_count: u64, new_count: u64) {
        self.forward(EvictionMessage::Touch {
            key: key.to_string(),
            old_count,
            new_count,
        });
    }

    fn on_update(&self, key: &str, old: &CacheEntry, new: &CacheEntry) {
        self.forward(EvictionMessage::Touch {
            key: key.to_string(),
            old_count: old.usage_count,
            new_count: new.usage_count,
        });
    }

    fn on_remove(&self, key: &str, entry: &CacheEntry, _cause: RemovalCause) {
        self.forward(EvictionMessage::Remove {
            key: key.to_string(),
            count: entry.usage_count,
        });
    }

    fn on_flush(&self, _removed: usize) {
        self.forward(EvictionMessage::Flush);
    }

    fn on_eviction_needed(&self, bytes_used: u64) {
        self.forward(EvictionMessage::Pressure { bytes_used });
    }
}

/// Reverse map `usage_count -> keys with that count`.
///
/// Every tracked key sits in exactly one bucket. `min_frequency` names
/// the lowest non-empty bucket and is advanced only when that bucket
/// empties; that is sufficient because usage bumps only ever move keys
/// to higher buckets. Buckets iterate in key order, so eviction order is
/// stable for a fixed set of counts.
#[derive(Debug, Default)]
struct FrequencyIndex {
    buckets: BTreeMap<u64, BTreeSet<String>>,
    min_frequency: u64,
    total_items: usize,
}

impl FrequencyIndex {
    fn insert(&mut self, key: String, count: u64) {
        if self.total_items == 0 || count < self.min_frequency {
            self.min_frequency = count;
        }
        self.buckets.entry(count).or_default().insert(key);
        self.total_items += 1;
    }

    fn touch(&mut self, key: &str, old_count: u64, new_count: u64) {
        let Some(bucket) = self.buckets.get_mut(&old_count) else {
            debug_assert!(false, "touch for untracked bucket {old_count}");
            return;
        };
        if !bucket.remove(key) {
            debug_assert!(false, "touch for untracked key {key}");
            return;
        }
        if bucket.is_empty() {
            self.buckets.remove(&old_count);
        }
        self.buckets
            .entry(new_count)
            .or_default()
            .insert(key.to_string());
        if old_count == self.min_frequency {
            self.advance_min();
        }
    }

    fn remove(&mut self, key: &str, count: u64) -> bool {
        let Some(bucket) = self.buckets.get_mut(&count) else {
            return false;
        };
        if !bucket.remove(key) {
            return false;
        }
        if bucket.is_empty() {
            self.buckets.remove(&count);
        }
        self.total_items -= 1;
        if count == self.min_frequency {
            self.advance_min();
        }
        true
    }

    fn clear(&mut self) {
        self.buckets.clear();
        self.min_frequency = 0;
        self.total_items = 0;
    }

    /// Lowest non-empty bucket, or 0 when the index is empty.
    fn advance_min(&mut self) {
        self.min_frequency = self
            .buckets
            .first_key_value()
            .map_or(0, |(count, _)| *count);
    }

    /// Keys to purge, ascending from `min_frequency`, up to `target`.
    fn collect_least_frequent(&self, target: usize) -> Vec<String> {
        let mut collected = Vec::with_capacity(target);
        for bucket in self.buckets.range(self.min_frequency..).map(|(_, b)| b) {
            for key in bucket {
                if collected.len() == target {
                    return collected;
                }
                collected.push(key.clone());
            }
        }
        collected
    }
}

/// Frequency index and eviction pass.
pub struct EvictionEngine {
    store: Arc<Store>,
    index: Mutex<FrequencyIndex>,
    eviction_factor: f64,
}

impl EvictionEngine {
    #[must_use]
    pub fn new(store: Arc<Store>, eviction_factor: f64) -> Self {
        Self {
            store,
            index: Mutex::new(FrequencyIndex::default()),
            eviction_factor,
        }
    }

    /// Apply one bookkeeping message under the index lock. Pressure
    /// signals are handled by the worker loop, not here.
    pub fn apply(&self, msg: EvictionMessage) {
        let mut index = self.index.lock();
        match msg {
            EvictionMessage::Insert { key, count } => index.insert(key, count),
            EvictionMessage::Touch {
                key,
                old_count,
                new_count,
            } => index.touch(&key, old_count, new_count),
            EvictionMessage::Remove { key, count } => {
                index.remove(&key, count);
            }
            EvictionMessage::Flush => index.clear(),
            EvictionMessage::Pressure { .. } => {}
        }
    }

    /// One eviction pass: purge `floor(factor x total_items)` keys,
    /// least-frequent first. Returns exactly how many entries left the
    /// store. The index lock is released before any store call; the
    /// resulting Remove bookkeeping arrives back through the channel.
    pub fn evict(&self) -> usize {
        let victims = {
            let index = self.index.lock();
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let target = (self.eviction_factor * index.total_items as f64).floor() as usize;
            index.collect_least_frequent(target)
        };

        let mut removed = 0;
        for key in &victims {
            if self.store.remove(key, RemovalCause::Evicted) {
                removed += 1;
            } else {
                trace!(%key, "eviction victim vanished before removal");
            }
        }
        metrics::counter!("stash_evictions_total").increment(removed as u64);
        removed
    }

    /// React to a pressure signal. Signals queued behind an in-flight
    /// pass coalesce here: once a pass has relieved pressure, the
    /// re-check skips the rest.
    pub fn handle_pressure(&self) -> usize {
        if !self.store.accountant().needs_eviction() {
            return 0;
        }
        self.evict()
    }

    /// Worker loop: applies bookkeeping and runs eviction passes on
    /// pressure signals until shutdown is signalled. Being the only
    /// consumer, it guarantees at most one pass in flight.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<EvictionMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(EvictionMessage::Pressure { bytes_used }) => {
                        let removed = self.handle_pressure();
                        if removed > 0 {
                            debug!(removed, bytes_used, "eviction pass finished");
                        }
                    }
                    Some(msg) => self.apply(msg),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("eviction worker exited");
    }

    #[cfg(test)]
    fn total_items(&self) -> usize {
        self.index.lock().total_items
    }

    #[cfg(test)]
    fn min_frequency(&self) -> u64 {
        self.index.lock().min_frequency
    }
}
