//! Archive catalog database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::downloads::TransferStatus;

/// Archive database model.
///
/// One row per content archive the library knows about, whether it still
/// lives on a remote mirror or has been downloaded. Transfer bookkeeping
/// (status, progress, resume token, last error) lives on the same row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ArchiveDbModel {
    pub id: String,
    pub title: String,
    /// Mirror URL the archive can be fetched from (may be a .meta4 link).
    pub source_url: Option<String>,
    /// Transfer status: REMOTE, QUEUED, IN_PROGRESS, PAUSED, COMPLETED, FAILED
    pub status: String,
    pub bytes_written: i64,
    /// Expected size from the catalog; 0 when unknown.
    pub total_bytes: i64,
    /// Opaque transport blob allowing a paused or failed transfer to resume.
    pub resume_token: Option<Vec<u8>>,
    pub last_error: Option<String>,
    /// ISO 8601 timestamp of row creation
    pub created_at: String,
    /// ISO 8601 timestamp of the last write
    pub updated_at: String,
}

impl ArchiveDbModel {
    pub fn new(title: impl Into<String>, source_url: impl Into<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            source_url: Some(source_url.into()),
            status: TransferStatus::Remote.as_str().to_string(),
            bytes_written: 0,
            total_bytes: 0,
            resume_token: None,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn with_total_bytes(mut self, total_bytes: i64) -> Self {
        self.total_bytes = total_bytes;
        self
    }

    /// Parsed transfer status; `None` if the column holds an unknown value.
    pub fn transfer_status(&self) -> Option<TransferStatus> {
        TransferStatus::parse(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_archive_defaults() {
        let archive = ArchiveDbModel::new("Wikipedia (en, nopic)", "https://mirror/wiki.zim");
        assert_eq!(archive.status, "REMOTE");
        assert_eq!(archive.bytes_written, 0);
        assert!(archive.resume_token.is_none());
        assert!(archive.last_error.is_none());
        assert_eq!(archive.transfer_status(), Some(TransferStatus::Remote));
    }

    #[test]
    fn test_with_total_bytes() {
        let archive =
            ArchiveDbModel::new("TED talks", "https://mirror/ted.zim").with_total_bytes(1_500_000);
        assert_eq!(archive.total_bytes, 1_500_000);
    }
}
