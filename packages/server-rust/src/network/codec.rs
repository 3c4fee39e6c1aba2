//! Frame codec: `\r\n`-delimited lines over a byte stream.
//!
//! Decoding splits on `\n` and strips a preceding `\r`, so strictly
//! framed clients and bare-newline clients both work. Encoding always
//! emits the two-byte `\r\n` delimiter. An oversized frame is reported
//! once as an error while the decoder discards bytes through the next
//! delimiter, so one bad frame does not take the connection down.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum accepted inbound frame length, delimiter excluded.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Errors surfaced by the codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLong,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Splits inbound bytes into frames and writes outbound lines.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Set after an oversized frame until its trailing delimiter passes.
    discarding: bool,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, CodecError> {
        loop {
            let Some(newline_at) = src.iter().position(|&b| b == b'\n') else {
                if self.discarding {
                    // Still inside the oversized frame: drop what we have.
                    src.clear();
                    return Ok(None);
                }
                if src.len() > MAX_FRAME_LEN {
                    self.discarding = true;
                    src.clear();
                    return Err(CodecError::FrameTooLong);
                }
                return Ok(None);
            };

            let line = src.split_to(newline_at + 1);
            if self.discarding {
                // The delimiter ends the frame being discarded.
                self.discarding = false;
                continue;
            }

            let mut frame = &line[..newline_at];
            if frame.ends_with(b"\r") {
                frame = &frame[..frame.len() - 1];
            }
            if frame.len() > MAX_FRAME_LEN {
                return Err(CodecError::FrameTooLong);
            }
            // Lossy conversion: bad bytes surface as a grammar-level
            // parse error rather than killing the connection.
            return Ok(Some(String::from_utf8_lossy(frame).into_owned()));
        }
    }
}

impl Encoder<String> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
