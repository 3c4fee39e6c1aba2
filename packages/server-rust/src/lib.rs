//! stash server -- TCP cache service with LFU eviction, TTL expiry, and
//! mutation event fan-out.

pub mod config;
pub mod engines;
pub mod events;
pub mod network;
pub mod pipeline;
pub mod storage;

pub use config::{ExpiryMode, ServerConfig};
pub use events::{EventBus, SubscribeOutcome};
pub use network::{CacheServer, ShutdownController};
pub use pipeline::{Dispatcher, ResponseWriter};
pub use storage::{MemoryAccountant, Store, StoreError};
