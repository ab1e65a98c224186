//! Archive repository.
//!
//! Transfer-state writes are deliberately blind single UPDATEs: the
//! download controller owns status/resume_token/last_error, and the
//! heartbeat owns bytes_written while a transfer is live. The heartbeat's
//! batch flush is guarded so it can never overwrite a state the
//! controller has already finalized.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::ArchiveDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::downloads::TransferStatus;
use crate::{Error, Result};

/// Archive repository trait.
#[async_trait]
pub trait ArchiveRepository: Send + Sync {
    async fn get_archive(&self, id: &str) -> Result<ArchiveDbModel>;
    async fn list_archives(&self) -> Result<Vec<ArchiveDbModel>>;
    async fn list_archives_by_status(&self, status: TransferStatus) -> Result<Vec<ArchiveDbModel>>;
    async fn create_archive(&self, archive: &ArchiveDbModel) -> Result<()>;
    async fn delete_archive(&self, id: &str) -> Result<()>;

    /// Fresh start: QUEUED with progress, token and error cleared.
    async fn mark_queued(&self, id: &str) -> Result<u64>;

    /// Resume: QUEUED with token and error cleared, progress kept.
    async fn mark_requeued(&self, id: &str) -> Result<u64>;

    /// Pause settled: PAUSED with the transport's resume token.
    async fn mark_paused(&self, id: &str, resume_token: &[u8], bytes_written: i64) -> Result<u64>;

    /// Cancel: back to REMOTE with progress and token cleared.
    async fn mark_remote(&self, id: &str) -> Result<u64>;

    /// Success: COMPLETED with the final file size.
    async fn mark_completed(&self, id: &str, bytes_written: i64) -> Result<u64>;

    /// Failure: FAILED with a message; a resume token is kept when the
    /// transport salvaged one.
    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        resume_token: Option<&[u8]>,
        bytes_written: i64,
    ) -> Result<u64>;

    /// Heartbeat flush: one transaction, one guarded UPDATE per row.
    /// Rows whose archive is no longer QUEUED or IN_PROGRESS are skipped.
    async fn flush_progress(&self, rows: &[(String, i64)]) -> Result<u64>;

    /// Flip still-active archives to FAILED; used at startup for records
    /// whose transport task did not survive the previous process.
    async fn mark_interrupted(&self, ids: &[String], error: &str) -> Result<u64>;
}

/// SQLx implementation of ArchiveRepository.
pub struct SqlxArchiveRepository {
    pool: SqlitePool,
    write_pool: SqlitePool,
}

impl SqlxArchiveRepository {
    pub fn new(pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl ArchiveRepository for SqlxArchiveRepository {
    async fn get_archive(&self, id: &str) -> Result<ArchiveDbModel> {
        sqlx::query_as::<_, ArchiveDbModel>("SELECT * FROM archives WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Archive", id))
    }

    async fn list_archives(&self) -> Result<Vec<ArchiveDbModel>> {
        let archives =
            sqlx::query_as::<_, ArchiveDbModel>("SELECT * FROM archives ORDER BY title")
                .fetch_all(&self.pool)
                .await?;
        Ok(archives)
    }

    async fn list_archives_by_status(&self, status: TransferStatus) -> Result<Vec<ArchiveDbModel>> {
        let archives = sqlx::query_as::<_, ArchiveDbModel>(
            "SELECT * FROM archives WHERE status = ? ORDER BY title",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(archives)
    }

    async fn create_archive(&self, archive: &ArchiveDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO archives (
                id, title, source_url, status, bytes_written, total_bytes,
                resume_token, last_error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&archive.id)
        .bind(&archive.title)
        .bind(&archive.source_url)
        .bind(&archive.status)
        .bind(archive.bytes_written)
        .bind(archive.total_bytes)
        .bind(&archive.resume_token)
        .bind(&archive.last_error)
        .bind(&archive.created_at)
        .bind(&archive.updated_at)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    async fn delete_archive(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM archives WHERE id = ?")
            .bind(id)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    async fn mark_queued(&self, id: &str) -> Result<u64> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE archives
            SET status = ?, bytes_written = 0, resume_token = NULL,
                last_error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(TransferStatus::Queued.as_str())
        .bind(&now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_requeued(&self, id: &str) -> Result<u64> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE archives
            SET status = ?, resume_token = NULL, last_error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(TransferStatus::Queued.as_str())
        .bind(&now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_paused(&self, id: &str, resume_token: &[u8], bytes_written: i64) -> Result<u64> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE archives
            SET status = ?, resume_token = ?, bytes_written = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(TransferStatus::Paused.as_str())
        .bind(resume_token)
        .bind(bytes_written)
        .bind(&now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_remote(&self, id: &str) -> Result<u64> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE archives
            SET status = ?, resume_token = NULL, bytes_written = 0, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(TransferStatus::Remote.as_str())
        .bind(&now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_completed(&self, id: &str, bytes_written: i64) -> Result<u64> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE archives
            SET status = ?, resume_token = NULL, last_error = NULL,
                bytes_written = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(TransferStatus::Completed.as_str())
        .bind(bytes_written)
        .bind(&now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        resume_token: Option<&[u8]>,
        bytes_written: i64,
    ) -> Result<u64> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE archives
            SET status = ?, last_error = ?, resume_token = ?, bytes_written = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(TransferStatus::Failed.as_str())
        .bind(error)
        .bind(resume_token)
        .bind(bytes_written)
        .bind(&now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn flush_progress(&self, rows: &[(String, i64)]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        retry_on_sqlite_busy("flush_progress", || async {
            let now = chrono::Utc::now().to_rfc3339();
            let mut tx = crate::database::begin_immediate(&self.write_pool).await?;
            let mut affected = 0u64;

            for (id, bytes_written) in rows {
                let result = sqlx::query(
                    r#"
                    UPDATE archives
                    SET status = ?, bytes_written = ?, updated_at = ?
                    WHERE id = ? AND status IN ('QUEUED', 'IN_PROGRESS')
                    "#,
                )
                .bind(TransferStatus::InProgress.as_str())
                .bind(bytes_written)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                affected += result.rows_affected();
            }

            tx.commit().await?;
            Ok(affected)
        })
        .await
    }

    async fn mark_interrupted(&self, ids: &[String], error: &str) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        retry_on_sqlite_busy("mark_interrupted", || async {
            let now = chrono::Utc::now().to_rfc3339();
            let mut tx = crate::database::begin_immediate(&self.write_pool).await?;
            let mut affected = 0u64;

            for id in ids {
                let result = sqlx::query(
                    r#"
                    UPDATE archives
                    SET status = ?, last_error = ?, updated_at = ?
                    WHERE id = ? AND status IN ('QUEUED', 'IN_PROGRESS')
                    "#,
                )
                .bind(TransferStatus::Failed.as_str())
                .bind(error)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                affected += result.rows_affected();
            }

            tx.commit().await?;
            Ok(affected)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_repo() -> SqlxArchiveRepository {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::database::run_migrations(&pool).await.unwrap();
        SqlxArchiveRepository::new(pool.clone(), pool)
    }

    async fn seeded(repo: &SqlxArchiveRepository) -> ArchiveDbModel {
        let archive = ArchiveDbModel::new("Test archive", "https://mirror/test.zim");
        repo.create_archive(&archive).await.unwrap();
        archive
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let repo = setup_repo().await;
        let archive = seeded(&repo).await;

        let loaded = repo.get_archive(&archive.id).await.unwrap();
        assert_eq!(loaded.title, "Test archive");
        assert_eq!(loaded.status, "REMOTE");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let repo = setup_repo().await;
        let result = repo.get_archive("no-such-id").await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_mark_queued_resets_transfer_fields() {
        let repo = setup_repo().await;
        let archive = seeded(&repo).await;

        repo.mark_failed(&archive.id, "boom", Some(b"token"), 42)
            .await
            .unwrap();
        let affected = repo.mark_queued(&archive.id).await.unwrap();
        assert_eq!(affected, 1);

        let loaded = repo.get_archive(&archive.id).await.unwrap();
        assert_eq!(loaded.status, "QUEUED");
        assert_eq!(loaded.bytes_written, 0);
        assert!(loaded.resume_token.is_none());
        assert!(loaded.last_error.is_none());
    }

    #[tokio::test]
    async fn test_mark_requeued_keeps_progress() {
        let repo = setup_repo().await;
        let archive = seeded(&repo).await;

        repo.mark_paused(&archive.id, b"token", 400).await.unwrap();
        repo.mark_requeued(&archive.id).await.unwrap();

        let loaded = repo.get_archive(&archive.id).await.unwrap();
        assert_eq!(loaded.status, "QUEUED");
        assert_eq!(loaded.bytes_written, 400);
        assert!(loaded.resume_token.is_none());
    }

    #[tokio::test]
    async fn test_mark_remote_keeps_last_error() {
        let repo = setup_repo().await;
        let archive = seeded(&repo).await;

        repo.mark_failed(&archive.id, "boom", None, 0).await.unwrap();
        repo.mark_remote(&archive.id).await.unwrap();

        let loaded = repo.get_archive(&archive.id).await.unwrap();
        assert_eq!(loaded.status, "REMOTE");
        assert_eq!(loaded.bytes_written, 0);
        // Cancelling does not clear the error trail
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_mark_failed_without_token_zeroes_progress() {
        let repo = setup_repo().await;
        let archive = seeded(&repo).await;

        repo.mark_failed(&archive.id, "connection reset", None, 0)
            .await
            .unwrap();

        let loaded = repo.get_archive(&archive.id).await.unwrap();
        assert_eq!(loaded.status, "FAILED");
        assert!(loaded.resume_token.is_none());
        assert_eq!(loaded.last_error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_flush_progress_updates_active_rows_only() {
        let repo = setup_repo().await;
        let active = seeded(&repo).await;
        let paused = seeded(&repo).await;

        repo.mark_queued(&active.id).await.unwrap();
        repo.mark_paused(&paused.id, b"token", 100).await.unwrap();

        let affected = repo
            .flush_progress(&[
                (active.id.clone(), 512),
                (paused.id.clone(), 999),
                ("no-such-id".to_string(), 7),
            ])
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let loaded = repo.get_archive(&active.id).await.unwrap();
        assert_eq!(loaded.status, "IN_PROGRESS");
        assert_eq!(loaded.bytes_written, 512);

        // The paused row is untouched by a stale flush
        let loaded = repo.get_archive(&paused.id).await.unwrap();
        assert_eq!(loaded.status, "PAUSED");
        assert_eq!(loaded.bytes_written, 100);
    }

    #[tokio::test]
    async fn test_mark_interrupted_skips_settled_rows() {
        let repo = setup_repo().await;
        let orphaned = seeded(&repo).await;
        let completed = seeded(&repo).await;

        repo.mark_queued(&orphaned.id).await.unwrap();
        repo.mark_completed(&completed.id, 1000).await.unwrap();

        let affected = repo
            .mark_interrupted(
                &[orphaned.id.clone(), completed.id.clone()],
                "transfer interrupted before completion",
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let loaded = repo.get_archive(&orphaned.id).await.unwrap();
        assert_eq!(loaded.status, "FAILED");
        let loaded = repo.get_archive(&completed.id).await.unwrap();
        assert_eq!(loaded.status, "COMPLETED");
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let repo = setup_repo().await;
        let a = seeded(&repo).await;
        let _b = seeded(&repo).await;

        repo.mark_queued(&a.id).await.unwrap();

        let queued = repo
            .list_archives_by_status(TransferStatus::Queued)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a.id);

        let all = repo.list_archives().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
