//! Background engines that keep the store within its configured bounds.
//!
//! Both engines follow the same shape: a store-side observer forwards
//! bookkeeping over a channel, and a single worker task applies it under
//! the engine's private lock. Neither lock is ever held across a call
//! back into the store.

pub mod eviction;
pub mod expiry;

pub use eviction::{EvictionEngine, EvictionMessage, EvictionObserver};
pub use expiry::{ExpiryEngine, ExpiryMessage, ExpiryObserver};
