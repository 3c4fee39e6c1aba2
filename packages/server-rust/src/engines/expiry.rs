//! TTL expiry engine: bucketed deadline index plus the periodic sweep.
//!
//! The store's observer forwards mutations over a channel; a single
//! worker task applies the bookkeeping under the engine's private lock
//! and runs the sweep. The sweep drains due buckets while holding the
//! index lock, then releases it before calling back into the store, so
//! the store's own lock and this one are never held together.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::config::ExpiryMode;
use crate::storage::{
    now_epoch_secs, CacheEntry, MutationObserver, RemovalCause, Store, NO_EXPIRY,
};

/// Bookkeeping messages from the store's mutation observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryMessage {
    Created { key: String, deadline: u64 },
    Updated {
        key: String,
        old_deadline: u64,
        new_deadline: u64,
    },
    Removed { key: String, deadline: u64 },
    Flushed,
}

/// Store observer that forwards deadline changes to the expiry worker.
/// Enqueue-only; never blocks the store's critical section.
pub struct ExpiryObserver {
    tx: mpsc::UnboundedSender<ExpiryMessage>,
}

impl ExpiryObserver {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<ExpiryMessage>) -> Self {
        Self { tx }
    }

    fn forward(&self, msg: ExpiryMessage) {
        // The worker owns the receiver for the engine's whole lifetime;
        // a closed channel only happens during shutdown, when dropping
        // bookkeeping is harmless.
        let _ = self.tx.send(msg);
    }
}

impl MutationObserver for ExpiryObserver {
    fn on_create(&self, key: &str, entry: &CacheEntry) {
        self.forward(ExpiryMessage::Created {
            key: key.to_string(),
            deadline: entry.ttl_deadline,
        });
    }

    fn on_read(&self, _key: &str, _old_count: u64, _new_count: u64) {}

    fn on_update(&self, key: &str, old: &CacheEntry, new: &CacheEntry) {
        self.forward(ExpiryMessage::Updated {
            key: key.to_string(),
            old_deadline: old.ttl_deadline,
            new_deadline: new.ttl_deadline,
        });
    }

    fn on_remove(&self, key: &str, entry: &CacheEntry, _cause: RemovalCause) {
        self.forward(ExpiryMessage::Removed {
            key: key.to_string(),
            deadline: entry.ttl_deadline,
        });
    }

    fn on_flush(&self, _removed: usize) {
        self.forward(ExpiryMessage::Flushed);
    }

    fn on_eviction_needed(&self, _bytes_used: u64) {}
}

/// Deadline index and sweep loop.
pub struct ExpiryEngine {
    store: Arc<Store>,
    /// bucket -> keys whose rounded deadline falls in that bucket,
    /// in ascending bucket order. Never-expiring entries are not tracked.
    index: Mutex<BTreeMap<u64, HashSet<String>>>,
    sweep_interval_secs: u64,
    mode: ExpiryMode,
}

impl ExpiryEngine {
    #[must_use]
    pub fn new(store: Arc<Store>, sweep_interval_secs: u64, mode: ExpiryMode) -> Self {
        Self {
            store,
            index: Mutex::new(BTreeMap::new()),
            sweep_interval_secs,
            mode,
        }
    }

    /// The bucket a deadline rounds into:
    /// `floor(deadline / interval) * interval`.
    #[must_use]
    pub fn bucket_of(&self, deadline: u64) -> u64 {
        deadline / self.sweep_interval_secs * self.sweep_interval_secs
    }

    /// Apply one bookkeeping message under the index lock.
    pub fn apply(&self, msg: ExpiryMessage) {
        match msg {
            ExpiryMessage::Created { key, deadline } => self.track(key, deadline),
            ExpiryMessage::Updated {
                key,
                old_deadline,
                new_deadline,
            } => {
                // An update that left the ttl alone must not re-bucket.
                if old_deadline != new_deadline {
                    self.untrack(&key, old_deadline);
                    self.track(key, new_deadline);
                }
            }
            ExpiryMessage::Removed { key, deadline } => self.untrack(&key, deadline),
            ExpiryMessage::Flushed => self.index.lock().clear(),
        }
    }

    fn track(&self, key: String, deadline: u64) {
        if deadline == NO_EXPIRY {
            return;
        }
        let bucket = self.bucket_of(deadline);
        self.index.lock().entry(bucket).or_default().insert(key);
    }

    fn untrack(&self, key: &str, deadline: u64) {
        if deadline == NO_EXPIRY {
            return;
        }
        let bucket = self.bucket_of(deadline);
        let mut index = self.index.lock();
        if let Some(keys) = index.get_mut(&bucket) {
            keys.remove(key);
            if keys.is_empty() {
                index.remove(&bucket);
            }
        }
    }

    /// One sweep: drain every bucket due by `now + interval/2`, release
    /// the index lock, then delete (strict) or mark (lazy) each drained
    /// key through the store. Returns how many keys were processed.
    ///
    /// The half-interval offset catches entries whose deadline falls
    /// between ticks without waiting a full extra interval.
    pub fn expire_once(&self, now: u64) -> usize {
        let cutoff = now + self.sweep_interval_secs / 2;
        let due: Vec<String> = {
            let mut index = self.index.lock();
            let buckets: Vec<u64> = index.range(..=cutoff).map(|(bucket, _)| *bucket).collect();
            buckets
                .into_iter()
                .filter_map(|bucket| index.remove(&bucket))
                .flatten()
                .collect()
        };
        if due.is_empty() {
            return 0;
        }

        let mut processed = 0;
        for key in due {
            let handled = match self.mode {
                ExpiryMode::Strict => self.store.remove(&key, RemovalCause::Expired),
                ExpiryMode::Lazy => self.store.mark_expired(&key),
            };
            if handled {
                processed += 1;
            } else {
                // Raced with a client delete between drain and callback.
                trace!(%key, "expired entry vanished before sweep callback");
            }
        }
        metrics::counter!("stash_expired_total").increment(processed as u64);
        processed
    }

    /// Worker loop: applies bookkeeping messages and runs the sweep on
    /// its interval until shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ExpiryMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = Duration::from_secs(self.sweep_interval_secs);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let processed = self.expire_once(now_epoch_secs());
                    if processed > 0 {
                        debug!(processed, mode = ?self.mode, "expiry sweep finished");
                    }
                }
                msg = rx.recv() => match msg {
                    Some(msg) => self.apply(msg),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("expiry worker exited");
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.index.lock().values().map(HashSet::len).sum()
    }
}
