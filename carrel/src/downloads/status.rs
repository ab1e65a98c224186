//! Transfer states for archive downloads.

use serde::{Deserialize, Serialize};

/// Transfer states of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    /// The archive only exists on a remote mirror.
    #[default]
    Remote,
    /// A transfer task has been handed to the transport.
    Queued,
    /// Progress has been observed and flushed at least once.
    InProgress,
    /// The transfer was suspended and left a resume token behind.
    Paused,
    /// The archive file is in the local library.
    Completed,
    /// The transfer ended with an error; see `last_error` on the record.
    Failed,
}

impl TransferStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "REMOTE",
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REMOTE" => Some(Self::Remote),
            "QUEUED" => Some(Self::Queued),
            "IN_PROGRESS" => Some(Self::InProgress),
            "PAUSED" => Some(Self::Paused),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
