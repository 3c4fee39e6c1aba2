//! Memory accounting for the store.
//!
//! A single atomic word tracks the bytes held by live entries, so every
//! operation here is wait-free. The accountant answers *can-fit*
//! questions before a mutation and *evict-now* once the configured
//! high-water fraction of the ceiling is crossed.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::BYTES_PER_MB;

/// Wait-free byte meter with a fixed ceiling and eviction threshold.
///
/// The counter must equal the summed cost of all live entries at every
/// stable point; callers are responsible for pairing every `add` with a
/// matching `remove`. Underflow means that pairing broke, which is an
/// unrecoverable bookkeeping bug -- the accountant panics so the process
/// restarts with a clean state.
#[derive(Debug)]
pub struct MemoryAccountant {
    current_bytes: AtomicU64,
    ceiling_bytes: u64,
    threshold_bytes: u64,
}

impl MemoryAccountant {
    /// Creates an empty accountant.
    ///
    /// `eviction_threshold` is the fraction of `ceiling_bytes` at which
    /// [`needs_eviction`](Self::needs_eviction) starts reporting true.
    #[must_use]
    pub fn new(ceiling_bytes: u64, eviction_threshold: f64) -> Self {
        // The threshold is fixed at construction; precompute the byte
        // mark so the hot path stays integer-only.
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let threshold_bytes = (ceiling_bytes as f64 * eviction_threshold) as u64;
        Self {
            current_bytes: AtomicU64::new(0),
            ceiling_bytes,
            threshold_bytes,
        }
    }

    /// Bytes currently attributed to live entries.
    #[must_use]
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Acquire)
    }

    /// The configured ceiling in bytes.
    #[must_use]
    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes
    }

    /// Whether `n` more bytes would still fit under the ceiling.
    #[must_use]
    pub fn can_add(&self, n: u64) -> bool {
        self.current_bytes() + n <= self.ceiling_bytes
    }

    /// Whether replacing an `old_n`-byte entry with a `new_n`-byte one
    /// stays under the ceiling. A shrinking update can succeed even when
    /// `can_add(new_n)` would not.
    #[must_use]
    pub fn can_update(&self, old_n: u64, new_n: u64) -> bool {
        self.current_bytes() - old_n + new_n <= self.ceiling_bytes
    }

    /// Attribute `n` freshly stored bytes.
    pub fn add(&self, n: u64) {
        self.current_bytes.fetch_add(n, Ordering::AcqRel);
        self.publish_gauge();
    }

    /// Release `n` bytes of a removed entry.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the current count. That can only happen when
    /// add/remove pairing broke, which is fatal by design.
    pub fn remove(&self, n: u64) {
        let prev = self.current_bytes.fetch_sub(n, Ordering::AcqRel);
        assert!(
            prev >= n,
            "memory accountant underflow: removed {n} bytes with only {prev} accounted",
        );
        self.publish_gauge();
    }

    /// Swap an entry's accounted size in one logical step.
    pub fn update(&self, old_n: u64, new_n: u64) {
        if new_n >= old_n {
            self.add(new_n - old_n);
        } else {
            self.remove(old_n - new_n);
        }
    }

    /// Whether usage has crossed the eviction threshold.
    #[must_use]
    pub fn needs_eviction(&self) -> bool {
        self.current_bytes() >= self.threshold_bytes
    }

    /// Zero the counter. Only `Store::flush_all` calls this.
    pub fn reset(&self) {
        self.current_bytes.store(0, Ordering::Release);
        self.publish_gauge();
    }

    /// Usage as fractional megabytes, rounded to six decimals -- the
    /// view the `MEM` command reports.
    #[must_use]
    pub fn current_mb(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let mb = self.current_bytes() as f64 / BYTES_PER_MB as f64;
        (mb * 1_000_000.0).round() / 1_000_000.0
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_gauge(&self) {
        metrics::gauge!("stash_store_bytes").set(self.current_bytes() as f64);
    }
}
