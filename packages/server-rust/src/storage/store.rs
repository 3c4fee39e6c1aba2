//! The authoritative key -> entry map.
//!
//! One exclusive section serializes every operation: the map mutation,
//! the accountant bookkeeping that must be atomic with it, and the
//! observer notifications that carry the mutation out to the expiry
//! index, the eviction index, and the event bus. Read throughput is not
//! a scaling target; correctness of the shared invariants is.
//!
//! Observer notifications fire inside the exclusive section, after the
//! mutation is applied, so downstream consumers see mutations in the
//! exact order they became visible. Observers only enqueue (see
//! [`MutationObserver`]); nothing blocks under the lock.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::ExpiryMode;

use super::accountant::MemoryAccountant;
use super::entry::{deadline_for, entry_cost, now_epoch_secs, CacheEntry};
use super::observer::{CompositeMutationObserver, MutationObserver, RemovalCause};

/// Contract errors returned to the caller. Internal invariant violations
/// (accountant underflow) are not represented here; those abort.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("key already exists: {0}")]
    DuplicateKey(String),
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("memory limit reached")]
    MemoryLimit,
}

/// In-memory keyed store with memory accounting and mutation fan-out.
pub struct Store {
    entries: Mutex<HashMap<String, CacheEntry, ahash::RandomState>>,
    accountant: MemoryAccountant,
    observers: CompositeMutationObserver,
    mode: ExpiryMode,
}

impl Store {
    /// Creates an empty store.
    #[must_use]
    pub fn new(
        accountant: MemoryAccountant,
        observers: CompositeMutationObserver,
        mode: ExpiryMode,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::default()),
            accountant,
            observers,
            mode,
        }
    }

    /// The accountant backing this store.
    #[must_use]
    pub fn accountant(&self) -> &MemoryAccountant {
        &self.accountant
    }

    /// Insert a new entry. `ttl_secs == 0` means the entry never expires.
    ///
    /// A create that observes memory pressure emits the eviction signal
    /// and proceeds with the state as observed; it does not wait for the
    /// eviction pass.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateKey`] if the key is present,
    /// [`StoreError::MemoryLimit`] if the insert itself would overflow
    /// the ceiling.
    pub fn create(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Err(StoreError::DuplicateKey(key.to_string()));
        }
        if self.accountant.needs_eviction() {
            self.observers
                .on_eviction_needed(self.accountant.current_bytes());
        }
        let cost = entry_cost(key, &value);
        if !self.accountant.can_add(cost) {
            return Err(StoreError::MemoryLimit);
        }
        let entry = CacheEntry::new(value, deadline_for(ttl_secs, now_epoch_secs()));
        self.accountant.add(cost);
        let entry = entries.entry(key.to_string()).or_insert(entry);
        self.observers.on_create(key, entry);
        Ok(())
    }

    /// Fetch the value under `key`, bumping its usage count.
    ///
    /// Under lazy expiry a read of a marked entry removes it in-line,
    /// exactly as if a delete had just occurred, and reports not-found.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the key is absent or lazily expired.
    pub fn read(&self, key: &str) -> Result<String, StoreError> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            metrics::counter!("stash_store_misses").increment(1);
            return Err(StoreError::NotFound(key.to_string()));
        };
        if self.mode == ExpiryMode::Lazy && entry.expired {
            let entry = entries.remove(key).expect("entry was just borrowed");
            self.accountant.remove(entry_cost(key, &entry.value));
            self.observers.on_remove(key, &entry, RemovalCause::Expired);
            metrics::counter!("stash_store_misses").increment(1);
            return Err(StoreError::NotFound(key.to_string()));
        }
        let old_count = entry.usage_count;
        entry.touch();
        let value = entry.value.clone();
        self.observers.on_read(key, old_count, old_count + 1);
        metrics::counter!("stash_store_hits").increment(1);
        Ok(value)
    }

    /// Replace the value (and optionally the deadline) of an existing
    /// entry. `ttl_secs: None` preserves the current deadline;
    /// `Some(0)` clears it.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the key is absent,
    /// [`StoreError::MemoryLimit`] if the replacement would overflow the
    /// ceiling. A failed update leaves the entry untouched.
    pub fn update(
        &self,
        key: &str,
        value: String,
        ttl_secs: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        let old_cost = entry_cost(key, &entry.value);
        let new_cost = entry_cost(key, &value);
        if !self.accountant.can_update(old_cost, new_cost) {
            return Err(StoreError::MemoryLimit);
        }
        let old = entry.clone();
        entry.value = value;
        if let Some(ttl) = ttl_secs {
            entry.ttl_deadline = deadline_for(ttl, now_epoch_secs());
            // A rewritten deadline supersedes any lazy expiry mark.
            entry.expired = false;
        }
        entry.touch();
        self.accountant.update(old_cost, new_cost);
        let new = entry.clone();
        self.observers.on_update(key, &old, &new);
        Ok(())
    }

    /// Remove the entry under `key`. Returns whether an entry existed;
    /// an absent key is a silent no-op with no event.
    ///
    /// Client deletes, strict-mode sweeps, and eviction passes all go
    /// through here so their events publish identically.
    pub fn remove(&self, key: &str, cause: RemovalCause) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.remove(key) else {
            return false;
        };
        self.accountant.remove(entry_cost(key, &entry.value));
        self.observers.on_remove(key, &entry, cause);
        true
    }

    /// Remove every entry, resetting the accountant. Returns how many
    /// entries were removed.
    pub fn flush_all(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        self.accountant.reset();
        self.observers.on_flush(removed);
        removed
    }

    /// Mark an entry as lazily expired without emitting an event. The
    /// wire-visible removal happens on the next read, through
    /// [`Store::read`]'s shared removal path.
    pub fn mark_expired(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expired = true;
                true
            }
            None => false,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Usage in fractional megabytes, as `MEM` reports it.
    #[must_use]
    pub fn memory_mb(&self) -> f64 {
        self.accountant.current_mb()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::storage::entry::NO_EXPIRY;

    /// Records a flat log of every notification for order assertions.
    #[derive(Default)]
    struct RecordingObserver {
        log: PlMutex<Vec<String>>,
    }

    impl RecordingObserver {
        fn entries(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl MutationObserver for RecordingObserver {
        fn on_create(&self, key: &str, entry: &CacheEntry) {
            self.log.lock().push(format!("create {key}={}", entry.value));
        }
        fn on_read(&self, key: &str, old: u64, new: u64) {
            self.log.lock().push(format!("read {key} {old}->{new}"));
        }
        fn on_update(&self, key: &str, old: &CacheEntry, new: &CacheEntry) {
            self.log
                .lock()
                .push(format!("update {key} {}->{}", old.value, new.value));
        }
        fn on_remove(&self, key: &str, _: &CacheEntry, cause: RemovalCause) {
            self.log.lock().push(format!("remove {key} {cause:?}"));
        }
        fn on_flush(&self, removed: usize) {
            self.log.lock().push(format!("flush {removed}"));
        }
        fn on_eviction_needed(&self, bytes: u64) {
            self.log.lock().push(format!("pressure {bytes}"));
        }
    }

    fn store_with(
        ceiling: u64,
        threshold: f64,
        mode: ExpiryMode,
    ) -> (Store, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let composite = CompositeMutationObserver::new(vec![
            Arc::clone(&observer) as Arc<dyn MutationObserver>
        ]);
        let store = Store::new(MemoryAccountant::new(ceiling, threshold), composite, mode);
        (store, observer)
    }

    #[test]
    fn create_read_delete_round_trip() {
        let (store, _) = store_with(1024, 0.9, ExpiryMode::Lazy);

        store.create("k1", "hello".to_string(), 0).unwrap();
        assert_eq!(store.read("k1").unwrap(), "hello");
        assert!(store.remove("k1", RemovalCause::Explicit));
        assert_eq!(
            store.read("k1").unwrap_err(),
            StoreError::NotFound("k1".to_string())
        );
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let (store, _) = store_with(1024, 0.9, ExpiryMode::Lazy);
        store.create("k", "v".to_string(), 0).unwrap();
        assert_eq!(
            store.create("k", "w".to_string(), 0).unwrap_err(),
            StoreError::DuplicateKey("k".to_string())
        );
        // The original value survives.
        assert_eq!(store.read("k").unwrap(), "v");
    }

    #[test]
    fn accountant_tracks_live_entry_cost() {
        let (store, _) = store_with(1024, 0.9, ExpiryMode::Lazy);
        store.create("a", "aaaaaaaaaaaaaaa".to_string(), 0).unwrap();
        assert_eq!(store.accountant().current_bytes(), 32);

        store.create("k1", "hello".to_string(), 0).unwrap();
        assert_eq!(store.accountant().current_bytes(), 32 + 14);

        store.remove("a", RemovalCause::Explicit);
        assert_eq!(store.accountant().current_bytes(), 14);
    }

    #[test]
    fn rejected_create_leaves_state_unchanged() {
        // Ceiling 64: "a" + 15 chars costs 32, the second entry 44.
        let (store, observer) = store_with(64, 1.0, ExpiryMode::Lazy);
        store.create("a", "aaaaaaaaaaaaaaa".to_string(), 0).unwrap();
        assert_eq!(store.accountant().current_bytes(), 32);

        let err = store
            .create("b", "bbbbbbbbbbbbbbbbbbbbbb".to_string(), 0)
            .unwrap_err();
        assert_eq!(err, StoreError::MemoryLimit);
        assert_eq!(store.accountant().current_bytes(), 32);
        assert_eq!(store.len(), 1);
        assert_eq!(observer.entries(), vec!["create a=aaaaaaaaaaaaaaa"]);
    }

    #[test]
    fn insert_at_exactly_the_ceiling_succeeds() {
        let (store, _) = store_with(14, 0.99, ExpiryMode::Lazy);
        // cost of ("k1", "hello") is exactly 14
        store.create("k1", "hello".to_string(), 0).unwrap();
        assert_eq!(store.accountant().current_bytes(), 14);

        let (store, _) = store_with(13, 0.99, ExpiryMode::Lazy);
        assert_eq!(
            store.create("k1", "hello".to_string(), 0).unwrap_err(),
            StoreError::MemoryLimit
        );
    }

    #[test]
    fn shrinking_update_succeeds_at_the_ceiling() {
        let (store, _) = store_with(20, 1.0, ExpiryMode::Lazy);
        store.create("k", "12345678".to_string(), 0).unwrap(); // cost 18
        assert!(!store.accountant().can_add(4));

        store.update("k", "x".to_string(), None).unwrap(); // cost 4
        assert_eq!(store.accountant().current_bytes(), 4);
        assert_eq!(store.read("k").unwrap(), "x");
    }

    #[test]
    fn update_of_missing_key_is_not_found() {
        let (store, _) = store_with(1024, 0.9, ExpiryMode::Lazy);
        assert_eq!(
            store.update("nope", "v".to_string(), None).unwrap_err(),
            StoreError::NotFound("nope".to_string())
        );
    }

    #[test]
    fn oversized_update_leaves_entry_untouched() {
        let (store, _) = store_with(32, 1.0, ExpiryMode::Lazy);
        store.create("k", "small".to_string(), 0).unwrap();
        let err = store
            .update("k", "x".repeat(64), None)
            .unwrap_err();
        assert_eq!(err, StoreError::MemoryLimit);
        assert_eq!(store.read("k").unwrap(), "small");
    }

    #[test]
    fn update_without_ttl_preserves_deadline() {
        let (store, _) = store_with(1024, 0.9, ExpiryMode::Lazy);
        store.create("k", "v".to_string(), 1_000).unwrap();
        let before = {
            let entries = store.entries.lock();
            entries.get("k").unwrap().ttl_deadline
        };
        assert_ne!(before, NO_EXPIRY);

        store.update("k", "v2".to_string(), None).unwrap();
        let after = {
            let entries = store.entries.lock();
            entries.get("k").unwrap().ttl_deadline
        };
        assert_eq!(before, after);
    }

    #[test]
    fn update_with_zero_ttl_clears_deadline() {
        let (store, _) = store_with(1024, 0.9, ExpiryMode::Lazy);
        store.create("k", "v".to_string(), 1_000).unwrap();
        store.update("k", "v2".to_string(), Some(0)).unwrap();
        let deadline = {
            let entries = store.entries.lock();
            entries.get("k").unwrap().ttl_deadline
        };
        assert_eq!(deadline, NO_EXPIRY);
    }

    #[test]
    fn usage_count_rises_on_create_read_update() {
        let (store, observer) = store_with(1024, 0.9, ExpiryMode::Lazy);
        store.create("k", "v".to_string(), 0).unwrap();
        store.read("k").unwrap();
        store.read("k").unwrap();
        store.update("k", "v2".to_string(), None).unwrap();

        let count = {
            let entries = store.entries.lock();
            entries.get("k").unwrap().usage_count
        };
        assert_eq!(count, 4);
        assert_eq!(
            observer.entries(),
            vec![
                "create k=v",
                "read k 1->2",
                "read k 2->3",
                "update k v->v2",
            ]
        );
    }

    #[test]
    fn remove_of_absent_key_is_silent() {
        let (store, observer) = store_with(1024, 0.9, ExpiryMode::Lazy);
        assert!(!store.remove("ghost", RemovalCause::Explicit));
        assert!(observer.entries().is_empty());
    }

    #[test]
    fn flush_all_resets_everything() {
        let (store, observer) = store_with(1024, 0.9, ExpiryMode::Lazy);
        store.create("a", "1".to_string(), 0).unwrap();
        store.create("b", "2".to_string(), 0).unwrap();

        assert_eq!(store.flush_all(), 2);
        assert!(store.is_empty());
        assert_eq!(store.accountant().current_bytes(), 0);
        assert_eq!(store.memory_mb(), 0.0);
        assert_eq!(
            observer.entries(),
            vec!["create a=1", "create b=2", "flush 2"]
        );
    }

    #[test]
    fn lazy_read_of_marked_entry_removes_it() {
        let (store, observer) = store_with(1024, 0.9, ExpiryMode::Lazy);
        store.create("k", "v".to_string(), 1).unwrap();
        assert!(store.mark_expired("k"));

        assert_eq!(
            store.read("k").unwrap_err(),
            StoreError::NotFound("k".to_string())
        );
        // State is equivalent to a delete having just occurred.
        assert!(store.is_empty());
        assert_eq!(store.accountant().current_bytes(), 0);
        assert_eq!(observer.entries(), vec!["create k=v", "remove k Expired"]);
    }

    #[test]
    fn strict_mode_ignores_the_expired_flag() {
        let (store, _) = store_with(1024, 0.9, ExpiryMode::Strict);
        store.create("k", "v".to_string(), 1).unwrap();
        store.mark_expired("k");
        // In strict mode the sweep deletes; a read before the sweep
        // still sees the value.
        assert_eq!(store.read("k").unwrap(), "v");
    }

    #[test]
    fn update_with_ttl_clears_lazy_mark() {
        let (store, _) = store_with(1024, 0.9, ExpiryMode::Lazy);
        store.create("k", "v".to_string(), 1).unwrap();
        store.mark_expired("k");
        store.update("k", "v2".to_string(), Some(60)).unwrap();
        assert_eq!(store.read("k").unwrap(), "v2");
    }

    #[test]
    fn pressure_signal_fires_on_create_past_threshold() {
        // Ceiling 100, threshold 0.5: the signal arms at 50 bytes.
        let (store, observer) = store_with(100, 0.5, ExpiryMode::Lazy);
        store.create("aaaa", "aaaaaa".to_string(), 0).unwrap(); // 20
        store.create("bbbb", "bbbbbb".to_string(), 0).unwrap(); // 40
        store.create("cccc", "cccccc".to_string(), 0).unwrap(); // 60
        assert!(!observer.entries().iter().any(|e| e.starts_with("pressure")));

        // 60 >= 50: this create observes pressure and still proceeds.
        store.create("dddd", "dddddd".to_string(), 0).unwrap();
        assert!(observer.entries().contains(&"pressure 60".to_string()));
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn mark_expired_of_absent_key_reports_false() {
        let (store, _) = store_with(1024, 0.9, ExpiryMode::Lazy);
        assert!(!store.mark_expired("ghost"));
    }
}
