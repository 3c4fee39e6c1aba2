//! Outbound frame schema.
//!
//! Every byte the server writes is one [`Frame`] serialized as a JSON
//! object followed by the frame delimiter. The same schema carries
//! request responses, subscription events, and error reports; `type`
//! distinguishes them.

use serde::{Deserialize, Serialize};

/// Response codes carried in the `code` field of a [`Frame`].
pub mod code {
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const NO_CONTENT: u16 = 204;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const INTERNAL: u16 = 500;
}

/// Discriminates the three frame flavors the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// Direct answer to a client request; `requestId` echoes the request.
    Response,
    /// Subscription fan-out; `requestId` is a freshly generated event id.
    Event,
    /// Request- or frame-level failure report.
    Error,
}

/// A single outbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub request_id: String,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
}

impl Frame {
    /// A successful response with no payload beyond the message.
    #[must_use]
    pub fn response(request_id: impl Into<String>, code: u16, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            frame_type: FrameType::Response,
            code,
            message: message.into(),
            value: None,
        }
    }

    /// A successful response carrying a value (READ, MEM).
    #[must_use]
    pub fn response_with_value(
        request_id: impl Into<String>,
        code: u16,
        message: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::response(request_id, code, message)
        }
    }

    /// An error report correlated to `request_id` (or the `"0"` sentinel).
    #[must_use]
    pub fn error(request_id: impl Into<String>, code: u16, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            frame_type: FrameType::Error,
            code,
            message: message.into(),
            value: None,
        }
    }

    /// A subscription event frame. `event_id` is freshly generated by the
    /// publisher and unrelated to any request.
    #[must_use]
    pub fn event(event_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            request_id: event_id.into(),
            frame_type: FrameType::Event,
            code: code::OK,
            message: message.into(),
            value: None,
        }
    }

    /// Serialize to the single-line JSON wire form (without delimiter).
    ///
    /// Frames contain no map-key collisions or non-string keys, so
    /// serialization cannot fail.
    #[must_use]
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).expect("frame serialization is infallible")
    }
}
