use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A group chat the host has been told to serve.
///
/// `folder` is a unique filesystem-safe id: it names the group's working
/// directory and its IPC input directory. `trigger` is a regex source
/// string tested against inbound message text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub name: String,
    pub folder: String,
    pub trigger: String,
    pub added_at: DateTime<Utc>,
}

/// One stored chat message. Append-only; ordering key is `timestamp`
/// (RFC 3339) with insertion order as the tie-break.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub chat_id: String,
    pub sender: String,
    pub text: String,
    /// RFC 3339 UTC timestamp. Stored as text so lexicographic and
    /// chronological order coincide.
    pub timestamp: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::In => write!(f, "in"),
            Self::Out => write!(f, "out"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            _ => Err(anyhow::anyhow!("unknown message direction: {}", s)),
        }
    }
}

/// A chat the transport has seen, for the `groups` listing.
#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    pub chat_id: String,
    pub name: Option<String>,
    pub last_activity: String,
    pub is_registered: bool,
}
