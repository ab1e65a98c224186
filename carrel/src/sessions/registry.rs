//! Bounded registry of live reading sessions.
//!
//! Each open tab owns an expensive in-memory session (rendered view state,
//! navigation history). The registry keeps a bounded most-recently-used set
//! of them; sessions displaced by eviction are persisted to the store so a
//! later checkout restores where the reader left off.

use bounded_cache::{BoundedCache, CachePolicy};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::Result;
use crate::database::models::TabSessionDbModel;
use crate::database::repositories::SessionRepository;

/// Live reading state for one tab. Serialized as JSON into the store when
/// the session leaves memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabSession {
    pub current_url: Option<String>,
    pub scroll_position: f64,
    pub history: Vec<String>,
}

pub struct SessionRegistry {
    cache: Mutex<BoundedCache<Uuid, TabSession>>,
    /// Sessions displaced by the eviction hook, waiting to be persisted.
    pending: Arc<Mutex<Vec<(Uuid, TabSession)>>>,
    sessions: Arc<dyn SessionRepository>,
}

impl SessionRegistry {
    pub fn new(sessions: Arc<dyn SessionRepository>, policy: CachePolicy) -> Self {
        let pending: Arc<Mutex<Vec<(Uuid, TabSession)>>> = Arc::default();
        let hook_buffer = Arc::clone(&pending);
        let cache = BoundedCache::new(policy).with_eviction_hook(
            move |tab_id: &Uuid, session: &mut TabSession| {
                hook_buffer.lock().push((*tab_id, std::mem::take(session)));
            },
        );

        Self {
            cache: Mutex::new(cache),
            pending,
            sessions,
        }
    }

    /// Run `f` against the live session for `tab_id`, promoting it to
    /// most-recently-used. A miss loads the persisted state, or starts a
    /// fresh session for a tab never seen before. Sessions evicted to make
    /// room are persisted before this returns.
    ///
    /// The persisted snapshot is loaded outside the cache lock, so the
    /// session can be evicted by a concurrent caller between the two lock
    /// acquisitions. The second critical section therefore re-checks the
    /// cache, then reclaims from the pending eviction buffer, and only
    /// falls back to the loaded seed when the session was never cached;
    /// a session that was cached but has already been evicted and
    /// persisted is re-loaded instead of being reset to a default.
    pub async fn with_session<T>(
        &self,
        tab_id: Uuid,
        f: impl FnOnce(&mut TabSession) -> T,
    ) -> Result<T> {
        let mut f = Some(f);
        loop {
            let was_cached = self.cache.lock().contains(&tab_id);
            let seed = if was_cached {
                None
            } else {
                self.load_persisted(tab_id).await?
            };

            let result = {
                let mut cache = self.cache.lock();
                if let Some(session) = cache.get_mut(&tab_id) {
                    f.take().map(|f| f(session))
                } else if let Some(reclaimed) = self.take_pending(&tab_id) {
                    let session = cache.get_or_create(tab_id, || reclaimed);
                    f.take().map(|f| f(session))
                } else if seed.is_some() || !was_cached {
                    let session = cache.get_or_create(tab_id, || seed.unwrap_or_default());
                    f.take().map(|f| f(session))
                } else {
                    // Was cached at the first check, but a concurrent burst
                    // evicted and persisted it in between; reload.
                    None
                }
            };

            self.persist_evicted().await;
            if let Some(result) = result {
                return Ok(result);
            }
        }
    }

    /// Pull a not-yet-persisted evicted session back out of the pending
    /// buffer.
    fn take_pending(&self, tab_id: &Uuid) -> Option<TabSession> {
        let mut pending = self.pending.lock();
        let index = pending.iter().position(|(id, _)| id == tab_id)?;
        Some(pending.remove(index).1)
    }

    /// Persist one tab's session and drop it from memory. Used when a tab
    /// is closed but may be reopened later.
    pub async fn close(&self, tab_id: Uuid) {
        let removed = self.cache.lock().remove(&tab_id);
        if let Some(session) = removed {
            self.persist(tab_id, &session).await;
        }
    }

    /// Drop a tab's session entirely, including the persisted row.
    pub async fn discard(&self, tab_id: Uuid) -> Result<()> {
        self.cache.lock().remove(&tab_id);
        self.sessions.delete_session(&tab_id.to_string()).await
    }

    /// Persist and drop every live session. Called at shutdown and on
    /// low-memory pressure.
    pub async fn flush_all(&self) {
        self.cache.lock().evict_all();
        self.persist_evicted().await;
    }

    pub fn live_count(&self) -> usize {
        self.cache.lock().len()
    }

    async fn load_persisted(&self, tab_id: Uuid) -> Result<Option<TabSession>> {
        let Some(row) = self.sessions.get_session(&tab_id.to_string()).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&row.state) {
            Ok(session) => Ok(Some(session)),
            Err(error) => {
                // Corrupt state row; start the tab over rather than fail it
                warn!(%tab_id, error = %error, "Could not parse persisted tab session");
                Ok(None)
            }
        }
    }

    async fn persist_evicted(&self) {
        let evicted: Vec<(Uuid, TabSession)> = std::mem::take(&mut *self.pending.lock());
        for (tab_id, session) in evicted {
            self.persist(tab_id, &session).await;
        }
    }

    async fn persist(&self, tab_id: Uuid, session: &TabSession) {
        let state = match serde_json::to_string(session) {
            Ok(state) => state,
            Err(error) => {
                warn!(%tab_id, error = %error, "Could not serialize tab session");
                return;
            }
        };
        let row = TabSessionDbModel::new(tab_id.to_string(), state);
        if let Err(error) = self.sessions.upsert_session(&row).await {
            warn!(%tab_id, error = %error, "Could not persist tab session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxSessionRepository;
    use crate::database::{init_pool, run_migrations};

    async fn setup_registry(policy: CachePolicy) -> (SessionRegistry, Arc<SqlxSessionRepository>) {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = Arc::new(SqlxSessionRepository::new(pool.clone(), pool));
        (SessionRegistry::new(repo.clone(), policy), repo)
    }

    #[tokio::test]
    async fn test_with_session_creates_and_caches() {
        let (registry, _) = setup_registry(CachePolicy::default()).await;
        let tab = Uuid::new_v4();

        registry
            .with_session(tab, |session| {
                session.current_url = Some("library://wiki/A/Home".to_string());
            })
            .await
            .unwrap();

        let url = registry
            .with_session(tab, |session| session.current_url.clone())
            .await
            .unwrap();
        assert_eq!(url.as_deref(), Some("library://wiki/A/Home"));
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn test_eviction_persists_displaced_sessions() {
        let (registry, repo) = setup_registry(CachePolicy::new(2, 1)).await;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        for (tab, url) in [(first, "a"), (second, "b"), (third, "c")] {
            registry
                .with_session(tab, |session| {
                    session.current_url = Some(url.to_string());
                })
                .await
                .unwrap();
        }

        // Inserting the third session trims down to the low-water mark
        assert_eq!(registry.live_count(), 1);
        let row = repo.get_session(&first.to_string()).await.unwrap().unwrap();
        let persisted: TabSession = serde_json::from_str(&row.state).unwrap();
        assert_eq!(persisted.current_url.as_deref(), Some("a"));
        assert!(
            repo.get_session(&second.to_string())
                .await
                .unwrap()
                .is_some()
        );
        assert!(repo.get_session(&third.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkout_restores_persisted_state() {
        let (registry, repo) = setup_registry(CachePolicy::default()).await;
        let tab = Uuid::new_v4();

        registry
            .with_session(tab, |session| {
                session.current_url = Some("library://wiki/A/Home".to_string());
                session.scroll_position = 0.4;
                session.history.push("library://wiki/A/Start".to_string());
            })
            .await
            .unwrap();
        registry.flush_all().await;
        assert_eq!(registry.live_count(), 0);

        // A fresh registry over the same store picks the session back up
        let reopened = SessionRegistry::new(repo, CachePolicy::default());
        let session = reopened
            .with_session(tab, |session| session.clone())
            .await
            .unwrap();
        assert_eq!(session.current_url.as_deref(), Some("library://wiki/A/Home"));
        assert_eq!(session.history.len(), 1);
    }

    #[tokio::test]
    async fn test_close_persists_and_drops() {
        let (registry, repo) = setup_registry(CachePolicy::default()).await;
        let tab = Uuid::new_v4();

        registry
            .with_session(tab, |session| {
                session.current_url = Some("library://wiki/A/Home".to_string());
            })
            .await
            .unwrap();
        registry.close(tab).await;

        assert_eq!(registry.live_count(), 0);
        assert!(repo.get_session(&tab.to_string()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_discard_removes_persisted_row() {
        let (registry, repo) = setup_registry(CachePolicy::default()).await;
        let tab = Uuid::new_v4();

        registry
            .with_session(tab, |session| {
                session.current_url = Some("library://wiki/A/Home".to_string());
            })
            .await
            .unwrap();
        registry.flush_all().await;
        registry.discard(tab).await.unwrap();

        assert!(repo.get_session(&tab.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_parked_for_eviction_is_reclaimed_not_reset() {
        let (registry, repo) = setup_registry(CachePolicy::default()).await;
        let tab = Uuid::new_v4();

        // A session displaced by a concurrent eviction sits in the pending
        // buffer until persisted; an access in that window must get the
        // parked state back, not a fresh default.
        registry.pending.lock().push((
            tab,
            TabSession {
                current_url: Some("library://wiki/A/Deep".to_string()),
                scroll_position: 0.7,
                history: vec!["library://wiki/A/Home".to_string()],
            },
        ));

        let session = registry
            .with_session(tab, |session| session.clone())
            .await
            .unwrap();
        assert_eq!(session.current_url.as_deref(), Some("library://wiki/A/Deep"));
        assert_eq!(session.history.len(), 1);
        assert_eq!(registry.live_count(), 1);
        // Reclaimed into the cache, so nothing was flushed to the store
        assert!(repo.get_session(&tab.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parked_state_wins_over_stale_snapshot() {
        let (registry, repo) = setup_registry(CachePolicy::default()).await;
        let tab = Uuid::new_v4();

        let stale = TabSession {
            current_url: Some("library://wiki/A/Old".to_string()),
            ..TabSession::default()
        };
        let row = TabSessionDbModel::new(tab.to_string(), serde_json::to_string(&stale).unwrap());
        repo.upsert_session(&row).await.unwrap();

        registry.pending.lock().push((
            tab,
            TabSession {
                current_url: Some("library://wiki/A/New".to_string()),
                ..TabSession::default()
            },
        ));

        let url = registry
            .with_session(tab, |session| session.current_url.clone())
            .await
            .unwrap();
        assert_eq!(url.as_deref(), Some("library://wiki/A/New"));
    }

    #[tokio::test]
    async fn test_corrupt_state_row_starts_fresh() {
        let (registry, repo) = setup_registry(CachePolicy::default()).await;
        let tab = Uuid::new_v4();

        let row = TabSessionDbModel::new(tab.to_string(), "not json".to_string());
        repo.upsert_session(&row).await.unwrap();

        let session = registry
            .with_session(tab, |session| session.clone())
            .await
            .unwrap();
        assert_eq!(session, TabSession::default());
    }
}
