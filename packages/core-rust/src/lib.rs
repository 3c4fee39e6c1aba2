//! stash core -- command grammar, frame schemas, and event kinds.
//!
//! Wire-level types shared by the server and by client-side tests:
//!
//! - **Commands** ([`command`]): the tagged [`Command`] enum, [`Request`]
//!   parsing for both accepted frame encodings, and [`ParseError`]
//! - **Frames** ([`response`]): the outbound [`Frame`] schema with its
//!   [`FrameType`] discriminator and [`code`] constants
//! - **Events** ([`event`]): [`EventKind`] tags for SUB/UNSUB and
//!   mutation fan-out

pub mod command;
pub mod event;
pub mod response;

pub use command::{Command, ParseError, ParseErrorKind, Request};
pub use event::{EventKind, UnknownEventKind};
pub use response::{code, Frame, FrameType};
