//! Reading tab session repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::TabSessionDbModel;

/// Tab session repository trait.
///
/// Snapshots are written when the in-memory session cache evicts a tab
/// and read back when that tab is opened again.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn upsert_session(&self, session: &TabSessionDbModel) -> Result<()>;
    async fn get_session(&self, tab_id: &str) -> Result<Option<TabSessionDbModel>>;
    async fn delete_session(&self, tab_id: &str) -> Result<()>;
    async fn list_sessions(&self) -> Result<Vec<TabSessionDbModel>>;
}

/// SQLx implementation of SessionRepository.
pub struct SqlxSessionRepository {
    pool: SqlitePool,
    write_pool: SqlitePool,
}

impl SqlxSessionRepository {
    pub fn new(pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl SessionRepository for SqlxSessionRepository {
    async fn upsert_session(&self, session: &TabSessionDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tab_sessions (tab_id, state, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(tab_id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.tab_id)
        .bind(&session.state)
        .bind(&session.updated_at)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, tab_id: &str) -> Result<Option<TabSessionDbModel>> {
        let session =
            sqlx::query_as::<_, TabSessionDbModel>("SELECT * FROM tab_sessions WHERE tab_id = ?")
                .bind(tab_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(session)
    }

    async fn delete_session(&self, tab_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM tab_sessions WHERE tab_id = ?")
            .bind(tab_id)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<TabSessionDbModel>> {
        let sessions = sqlx::query_as::<_, TabSessionDbModel>(
            "SELECT * FROM tab_sessions ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }
}
