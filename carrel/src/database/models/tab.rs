//! Reading tab session database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Persisted form of a reading tab evicted from the in-memory session cache.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TabSessionDbModel {
    pub tab_id: String,
    /// JSON-encoded session snapshot
    pub state: String,
    /// ISO 8601 timestamp of the last snapshot write
    pub updated_at: String,
}

impl TabSessionDbModel {
    pub fn new(tab_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            tab_id: tab_id.into(),
            state: state.into(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
