//! The keyed store and its tightly coupled bookkeeping.
//!
//! - [`Store`]: the authoritative key -> entry map, one exclusive section
//! - [`MemoryAccountant`]: wait-free byte accounting with *can-fit* and
//!   *evict-now* answers
//! - [`CacheEntry`]: the entry model
//! - [`MutationObserver`] / [`CompositeMutationObserver`]: post-mutation
//!   fan-out to the expiry index, the eviction index, and the event bus

pub mod accountant;
pub mod entry;
pub mod observer;
pub mod store;

pub use accountant::*;
pub use entry::*;
pub use observer::*;
pub use store::*;
