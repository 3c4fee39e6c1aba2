//! Network layer: frame codec, connection registry, listener, and
//! graceful shutdown.

pub mod codec;
pub mod connection;
pub mod server;
pub mod shutdown;

pub use codec::{CodecError, FrameCodec, MAX_FRAME_LEN};
pub use connection::{ClientHandle, ClientId, ConnectionRegistry, OutboundFrame, SendError};
pub use server::CacheServer;
pub use shutdown::{LifecycleState, ShutdownController};
