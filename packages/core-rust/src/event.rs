//! Event kinds for store-mutation subscriptions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Category tag of a store mutation that clients can subscribe to.
///
/// Wire form is the upper-case tag (`CREATE`, `UPDATE`, `DELETE`,
/// `FLUSHALL`); parsing is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Create,
    Update,
    Delete,
    Flushall,
}

impl EventKind {
    /// All kinds, in a fixed order usable for per-kind tables.
    pub const ALL: [Self; 4] = [Self::Create, Self::Update, Self::Delete, Self::Flushall];

    /// The wire tag for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Flushall => "FLUSHALL",
        }
    }

    /// Index into a fixed per-kind table, matching [`EventKind::ALL`].
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Create => 0,
            Self::Update => 1,
            Self::Delete => 2,
            Self::Flushall => 3,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a SUB/UNSUB argument names no known event kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "FLUSHALL" => Ok(Self::Flushall),
            _ => Err(UnknownEventKind(s.to_string())),
        }
    }
}
