//! Final placement of completed downloads into the library.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use crate::Result;

/// Moves a finished staging file into its permanent home.
#[async_trait]
pub trait FilePlacement: Send + Sync {
    /// Returns the destination path of the placed file.
    async fn place(
        &self,
        archive_id: Uuid,
        staging_path: &Path,
        suggested_name: Option<&str>,
    ) -> Result<PathBuf>;
}

/// Placement into a flat library directory.
///
/// An existing file with the same name is replaced; a re-download is the
/// only way a collision occurs and the fresher copy wins.
pub struct LibraryPlacement {
    library_dir: PathBuf,
}

impl LibraryPlacement {
    pub fn new(library_dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: library_dir.into(),
        }
    }
}

/// Destination file name: the final component of the server's suggestion,
/// or `{archive_id}.zim` when no usable suggestion exists.
pub(crate) fn destination_name(archive_id: Uuid, suggested_name: Option<&str>) -> String {
    suggested_name
        .and_then(|name| Path::new(name).file_name())
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{archive_id}.zim"))
}

#[async_trait]
impl FilePlacement for LibraryPlacement {
    async fn place(
        &self,
        archive_id: Uuid,
        staging_path: &Path,
        suggested_name: Option<&str>,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.library_dir).await?;

        let destination = self
            .library_dir
            .join(destination_name(archive_id, suggested_name));

        if tokio::fs::rename(staging_path, &destination).await.is_err() {
            // Staging and library may sit on different filesystems
            tokio::fs::copy(staging_path, &destination).await?;
            if let Err(error) = tokio::fs::remove_file(staging_path).await {
                warn!(
                    staging_path = %staging_path.display(),
                    error = %error,
                    "Could not remove staging file after copy"
                );
            }
        }

        Ok(destination)
    }
}
