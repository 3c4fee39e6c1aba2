//! Command grammar and inbound request parsing.
//!
//! A request frame is accepted in either of two encodings:
//!
//! - *Text form*: `<requestId> <COMMAND> <arg1> [<arg2> [<arg3>]]`,
//!   whitespace-separated, command case-insensitive.
//! - *Structured form*: a JSON object carrying the same fields
//!   (`{"requestId": "r1", "command": "CREATE", "args": ["k", "v"]}`).
//!
//! A frame whose first non-space byte is `{` is parsed as the structured
//! form; everything else goes through the text parser. Both forms funnel
//! into [`Request::from_parts`], so argument validation is identical.

use serde::{Deserialize, Serialize};

use crate::event::{EventKind, UnknownEventKind};

/// A parsed client command, carrying exactly the fields its handler needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Insert a never-expiring entry.
    Create { key: String, value: String },
    /// Insert an entry with a time-to-live in seconds (0 = no expiry).
    Add { key: String, value: String, ttl: u64 },
    /// Fetch the value stored under `key`.
    Read { key: String },
    /// Replace the value (and optionally the ttl) of an existing entry.
    ///
    /// `ttl: None` preserves the entry's current deadline.
    Update {
        key: String,
        value: String,
        ttl: Option<u64>,
    },
    /// Remove the entry stored under `key`.
    Delete { key: String },
    /// Report current memory usage in fractional megabytes.
    Mem,
    /// Remove every entry.
    FlushAll,
    /// Subscribe the connection to a mutation event kind.
    Sub { kind: EventKind },
    /// Unsubscribe the connection from a mutation event kind.
    Unsub { kind: EventKind },
}

impl Command {
    /// The upper-case wire tag of this command.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Create { .. } => "CREATE",
            Self::Add { .. } => "ADD",
            Self::Read { .. } => "READ",
            Self::Update { .. } => "UPDATE",
            Self::Delete { .. } => "DELETE",
            Self::Mem => "MEM",
            Self::FlushAll => "FLUSHALL",
            Self::Sub { .. } => "SUB",
            Self::Unsub { .. } => "UNSUB",
        }
    }
}

/// A fully parsed request: client-chosen id plus the command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Client-chosen correlation token, echoed back in the response frame.
    pub id: String,
    pub command: Command,
}

/// What went wrong while parsing a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("empty frame")]
    EmptyFrame,
    #[error("frame carries a request id but no command")]
    MissingCommand,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{command} expects {expected} argument(s), got {got}")]
    WrongArgCount {
        command: &'static str,
        expected: &'static str,
        got: usize,
    },
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
    #[error(transparent)]
    UnknownEventKind(#[from] UnknownEventKind),
    #[error("malformed structured frame: {0}")]
    Malformed(String),
}

/// Parse failure, keeping the request id when one could be extracted so
/// the error response can still be correlated. Frames whose id could not
/// be recovered are answered with `requestId = "0"`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}")]
pub struct ParseError {
    pub request_id: Option<String>,
    #[source]
    pub kind: ParseErrorKind,
}

impl ParseError {
    fn new(request_id: Option<String>, kind: ParseErrorKind) -> Self {
        Self { request_id, kind }
    }

    /// The id to use on the error response frame: the extracted request
    /// id, or the `"0"` sentinel when none survived parsing.
    #[must_use]
    pub fn response_id(&self) -> String {
        self.request_id.clone().unwrap_or_else(|| "0".to_string())
    }
}

/// Structured (JSON) request encoding.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    request_id: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

impl Request {
    /// Parse one complete frame, accepting either encoding.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] describing the first problem found. The
    /// error retains the request id whenever the frame got far enough to
    /// carry one.
    pub fn parse_frame(frame: &str) -> Result<Self, ParseError> {
        let trimmed = frame.trim();
        if trimmed.is_empty() {
            return Err(ParseError::new(None, ParseErrorKind::EmptyFrame));
        }
        if trimmed.starts_with('{') {
            Self::parse_structured(trimmed)
        } else {
            Self::parse_text(trimmed)
        }
    }

    fn parse_text(frame: &str) -> Result<Self, ParseError> {
        let mut tokens = frame.split_whitespace();
        let id = tokens
            .next()
            .ok_or_else(|| ParseError::new(None, ParseErrorKind::EmptyFrame))?
            .to_string();
        let Some(tag) = tokens.next() else {
            return Err(ParseError::new(Some(id), ParseErrorKind::MissingCommand));
        };
        let args: Vec<String> = tokens.map(str::to_string).collect();
        Self::from_parts(id, tag, args)
    }

    fn parse_structured(frame: &str) -> Result<Self, ParseError> {
        // Recover the request id even from objects that fail full
        // deserialization, so the error frame can be correlated.
        let wire: WireRequest = match serde_json::from_str(frame) {
            Ok(wire) => wire,
            Err(e) => {
                let id = serde_json::from_str::<serde_json::Value>(frame)
                    .ok()
                    .and_then(|v| v.get("requestId").and_then(|id| id.as_str().map(String::from)));
                return Err(ParseError::new(id, ParseErrorKind::Malformed(e.to_string())));
            }
        };
        if wire.request_id.is_empty() || wire.request_id.contains(char::is_whitespace) {
            return Err(ParseError::new(
                None,
                ParseErrorKind::Malformed("requestId must be a non-empty token".to_string()),
            ));
        }
        Self::from_parts(wire.request_id, &wire.command, wire.args)
    }

    /// Assemble a request from its already-split fields.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] if the command tag is unknown or the
    /// argument list does not match the command's arity.
    pub fn from_parts(id: String, tag: &str, args: Vec<String>) -> Result<Self, ParseError> {
        let fail = |kind| Err(ParseError::new(Some(id.clone()), kind));
        let command = match tag.to_ascii_uppercase().as_str() {
            "CREATE" => match into_array::<2>(args) {
                Ok([key, value]) => Command::Create { key, value },
                Err(got) => {
                    return fail(wrong_args("CREATE", "2", got));
                }
            },
            "ADD" => match into_array::<3>(args) {
                Ok([key, value, ttl]) => Command::Add {
                    key,
                    value,
                    ttl: parse_ttl(&ttl).map_err(|kind| ParseError::new(Some(id.clone()), kind))?,
                },
                Err(got) => return fail(wrong_args("ADD", "3", got)),
            },
            "READ" => match into_array::<1>(args) {
                Ok([key]) => Command::Read { key },
                Err(got) => return fail(wrong_args("READ", "1", got)),
            },
            "UPDATE" => match args.len() {
                2 | 3 => {
                    let mut args = args.into_iter();
                    let key = args.next().expect("len checked");
                    let value = args.next().expect("len checked");
                    let ttl = match args.next() {
                        Some(ttl) => Some(
                            parse_ttl(&ttl)
                                .map_err(|kind| ParseError::new(Some(id.clone()), kind))?,
                        ),
                        None => None,
                    };
                    Command::Update { key, value, ttl }
                }
                got => return fail(wrong_args("UPDATE", "2 or 3", got)),
            },
            "DELETE" => match into_array::<1>(args) {
                Ok([key]) => Command::Delete { key },
                Err(got) => return fail(wrong_args("DELETE", "1", got)),
            },
            "MEM" => match into_array::<0>(args) {
                Ok([]) => Command::Mem,
                Err(got) => return fail(wrong_args("MEM", "0", got)),
            },
            "FLUSHALL" => match into_array::<0>(args) {
                Ok([]) => Command::FlushAll,
                Err(got) => return fail(wrong_args("FLUSHALL", "0", got)),
            },
            "SUB" => match into_array::<1>(args) {
                Ok([kind]) => Command::Sub {
                    kind: kind
                        .parse()
                        .map_err(|e: UnknownEventKind| ParseError::new(Some(id.clone()), e.into()))?,
                },
                Err(got) => return fail(wrong_args("SUB", "1", got)),
            },
            "UNSUB" => match into_array::<1>(args) {
                Ok([kind]) => Command::Unsub {
                    kind: kind
                        .parse()
                        .map_err(|e: UnknownEventKind| ParseError::new(Some(id.clone()), e.into()))?,
                },
                Err(got) => return fail(wrong_args("UNSUB", "1", got)),
            },
            other => return fail(ParseErrorKind::UnknownCommand(other.to_string())),
        };
        Ok(Self { id, command })
    }
}

fn wrong_args(command: &'static str, expected: &'static str, got: usize) -> ParseErrorKind {
    ParseErrorKind::WrongArgCount {
        command,
        expected,
        got,
    }
}

fn parse_ttl(raw: &str) -> Result<u64, ParseErrorKind> {
    raw.parse::<u64>()
        .map_err(|_| ParseErrorKind::InvalidTtl(raw.to_string()))
}

/// Convert an argument vector into a fixed-arity array, or report the
/// actual length on mismatch.
fn into_array<const N: usize>(args: Vec<String>) -> Result<[String; N], usize> {
    let len = args.len();
    <[String; N]>::try_from(args).map_err(|_| len)
}
