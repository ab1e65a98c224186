//! Busy-retry wrapper for SQLite write operations.

use rand::random;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const MAX_RETRIES: usize = 12;
const BASE_DELAY_MS: u64 = 10;
const MAX_DELAY_MS: u64 = 2000;

fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    match sqlx_err {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if matches!(db_err.code().as_deref(), Some("5") | Some("6")) {
                return true;
            }
            let msg = db_err.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        other => {
            let msg = other.to_string().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

/// Runs `op`, retrying with capped exponential backoff and jitter while
/// SQLite reports the database busy or locked. Every other error returns
/// immediately.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_busy(&err) || attempt >= MAX_RETRIES {
                    return Err(err);
                }

                let backoff_ms = BASE_DELAY_MS
                    .saturating_mul(1u64 << attempt)
                    .min(MAX_DELAY_MS);
                let jitter_ms = random::<u64>() % (backoff_ms / 4 + 1);
                let delay = Duration::from_millis((backoff_ms + jitter_ms).min(MAX_DELAY_MS));

                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    MAX_RETRIES
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
