//! Event fan-out: per-kind subscriber tables and the store-side
//! publisher that feeds them.

pub mod bus;
pub mod publisher;

pub use bus::{EventBus, ResponseQueueItem, SubscribeOutcome};
pub use publisher::EventPublisher;
