//! Service container for dependency injection.
//!
//! The ServiceContainer owns the database pools and wires the archive
//! store, HTTP transport, download service, and session registry together
//! with one lifecycle.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::Result;
use crate::config::AppSettings;
use crate::database::repositories::{
    ArchiveRepository, SessionRepository, SqlxArchiveRepository, SqlxSessionRepository,
};
use crate::database::{self, DbPool, WritePool};
use crate::downloads::{DownloadService, HttpTransport, HttpTransportConfig, LibraryPlacement};
use crate::sessions::SessionRegistry;

/// Capacity of the transport event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Read pool.
    pub pool: DbPool,
    /// Serialized write pool.
    pub write_pool: WritePool,
    /// Archive record store.
    pub archives: Arc<dyn ArchiveRepository>,
    /// Download service.
    pub downloads: Arc<DownloadService>,
    /// Reading session registry.
    pub sessions: Arc<SessionRegistry>,
    event_loop: JoinHandle<()>,
}

impl ServiceContainer {
    /// Create the container: open pools, run migrations, and wire services.
    pub async fn new(settings: &AppSettings) -> Result<Self> {
        settings.validate()?;
        info!("Initializing service container");

        let pool = database::init_pool(&settings.database_url).await?;
        let write_pool = database::init_write_pool(&settings.database_url).await?;
        database::run_migrations(&pool).await?;

        let archives: Arc<dyn ArchiveRepository> = Arc::new(SqlxArchiveRepository::new(
            pool.clone(),
            write_pool.clone(),
        ));
        let session_repo: Arc<dyn SessionRepository> = Arc::new(SqlxSessionRepository::new(
            pool.clone(),
            write_pool.clone(),
        ));

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(HttpTransport::new(
            HttpTransportConfig::new(&settings.staging_dir),
            event_tx,
        )?);
        let placement = Arc::new(LibraryPlacement::new(&settings.library_dir));

        let downloads = Arc::new(DownloadService::new(
            archives.clone(),
            transport,
            placement,
            settings.heartbeat_period,
            settings.allow_metered,
        ));
        let event_loop = downloads.spawn_event_loop(event_rx);

        let sessions = Arc::new(SessionRegistry::new(
            session_repo,
            settings.session_policy(),
        ));

        info!("Service container initialized");

        Ok(Self {
            pool,
            write_pool,
            archives,
            downloads,
            sessions,
            event_loop,
        })
    }

    /// Reconcile persisted transfer state with the transport. Call once
    /// after construction, before serving requests.
    pub async fn initialize(&self) -> Result<()> {
        self.downloads.restore_previous_state().await;
        Ok(())
    }

    /// Shut down services: persist live sessions, stop the event loop,
    /// and close the database pools.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down services");

        self.sessions.flush_all().await;
        self.event_loop.abort();

        self.pool.close().await;
        self.write_pool.close().await;

        info!("Services shut down");
        Ok(())
    }
}
