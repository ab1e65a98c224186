//! Transfer controller: the lifecycle authority for archive downloads.
//!
//! All terminal status decisions flow through a single event loop consuming
//! the transport channel, so a pause that races a completed body, or a
//! cancel that races a heartbeat flush, always resolves in one place.
//! Store writes are best effort: a failed write is logged and the transfer
//! carries on, because the logical state of a transfer does not depend on
//! whether it could be recorded.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::heartbeat::Heartbeat;
use super::placement::FilePlacement;
use super::progress::ProgressTable;
use super::status::TransferStatus;
use super::transport::{CancelMode, TaskOutcome, TaskSpec, Transport, TransportEvent};
use crate::Error;
use crate::database::repositories::ArchiveRepository;

/// Interval between progress flushes while any transfer is live.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

const BROADCAST_CAPACITY: usize = 256;

const INTERRUPTED_MESSAGE: &str = "transfer interrupted before completion";

/// Status change notifications for observers (UI, CLI).
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Queued {
        id: Uuid,
    },
    Progress {
        id: Uuid,
        bytes_written: u64,
        total_bytes: Option<u64>,
    },
    Paused {
        id: Uuid,
    },
    Cancelled {
        id: Uuid,
    },
    Completed {
        id: Uuid,
        path: PathBuf,
    },
    Failed {
        id: Uuid,
        error: String,
    },
}

pub struct DownloadService {
    archives: Arc<dyn ArchiveRepository>,
    transport: Arc<dyn Transport>,
    placement: Arc<dyn FilePlacement>,
    progress: Arc<ProgressTable>,
    heartbeat: Heartbeat,
    default_allow_metered: bool,
    events: broadcast::Sender<TransferEvent>,
}

impl DownloadService {
    pub fn new(
        archives: Arc<dyn ArchiveRepository>,
        transport: Arc<dyn Transport>,
        placement: Arc<dyn FilePlacement>,
        heartbeat_period: Duration,
        default_allow_metered: bool,
    ) -> Self {
        let progress = Arc::new(ProgressTable::new());
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);

        let flush = {
            let archives = archives.clone();
            let progress = progress.clone();
            let events = events.clone();
            move || {
                let archives = archives.clone();
                let progress = progress.clone();
                let events = events.clone();
                async move { flush_dirty_progress(&*archives, &progress, &events).await }.boxed()
            }
        };

        Self {
            archives,
            transport,
            placement,
            progress,
            heartbeat: Heartbeat::new(heartbeat_period, flush),
            default_allow_metered,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Queue a transfer for `id`, replacing any prior state. Works from any
    /// status, including a retry after a failure or a re-download of a
    /// completed archive. Returns whether a transfer task was issued; an
    /// unknown id or a record without a source URL is a no-op.
    pub async fn start(&self, id: Uuid, allow_metered: bool) -> bool {
        let Some(record) = self.load_record(id).await else {
            return false;
        };
        let Some(source_url) = record.source_url.as_deref() else {
            warn!(%id, "Archive has no source URL, cannot start transfer");
            return false;
        };
        let url = strip_meta4_suffix(source_url);

        // Restarting from scratch orphans any token left by an earlier
        // pause or failure; let the transport drop the partial state it
        // references.
        if let Some(token) = &record.resume_token {
            self.transport.discard_resume_data(token);
        }

        if let Err(error) = self.archives.mark_queued(&record.id).await {
            warn!(%id, error = %error, "Could not record queued status");
        }
        self.progress.mark_active(id);
        self.transport
            .spawn(TaskSpec::new(id, url).with_allow_metered(allow_metered));
        self.heartbeat.ensure_running();
        self.broadcast(TransferEvent::Queued { id });
        info!(%id, "Transfer queued");
        true
    }

    /// Ask the live task to stop while producing a resume token. No store
    /// write happens here; the completion event records the paused status
    /// once the transport confirms. Without a live task this is a no-op.
    pub fn pause(&self, id: Uuid) {
        if self.transport.cancel(id, CancelMode::KeepResumeData) {
            info!(%id, "Transfer pause requested");
        } else {
            debug!(%id, "No live task to pause");
        }
    }

    /// Abandon a transfer. The record is reset immediately, without waiting
    /// for the transport, so the caller observes the cancelled state even
    /// if no live task exists.
    pub async fn cancel(&self, id: Uuid) {
        let had_task = self.transport.cancel(id, CancelMode::Discard);
        self.progress.remove(&id);
        if self.progress.is_empty() {
            self.heartbeat.stop();
        }
        // A paused or failed record may hold a token; abandoning the
        // transfer abandons the partial state behind it too.
        if let Some(record) = self.load_record(id).await
            && let Some(token) = &record.resume_token
        {
            self.transport.discard_resume_data(token);
        }
        if let Err(error) = self.archives.mark_remote(&id.to_string()).await {
            warn!(%id, error = %error, "Could not record cancelled status");
        }
        self.broadcast(TransferEvent::Cancelled { id });
        info!(%id, had_task, "Transfer cancelled");
    }

    /// Continue a paused transfer from its resume token. A record without a
    /// token is left untouched. Returns whether a transfer task was issued.
    pub async fn resume(&self, id: Uuid) -> bool {
        let Some(record) = self.load_record(id).await else {
            return false;
        };
        let Some(token) = record.resume_token else {
            debug!(%id, "No resume token, ignoring resume");
            return false;
        };
        let Some(source_url) = record.source_url.as_deref() else {
            warn!(%id, "Archive has no source URL, cannot resume transfer");
            return false;
        };
        let url = strip_meta4_suffix(source_url);

        if let Err(error) = self.archives.mark_requeued(&record.id).await {
            warn!(%id, error = %error, "Could not record requeued status");
        }
        self.progress.mark_active(id);
        self.transport.spawn(
            TaskSpec::new(id, url)
                .with_allow_metered(self.default_allow_metered)
                .with_resume_from(token),
        );
        self.heartbeat.ensure_running();
        self.broadcast(TransferEvent::Queued { id });
        info!(%id, bytes_written = record.bytes_written, "Transfer resuming");
        true
    }

    /// Reconcile store state with the transport after a process restart.
    ///
    /// Live transport tasks are re-registered with the progress table and
    /// the heartbeat restarts if any exist. Records still marked active in
    /// the store without a matching live task were interrupted by the
    /// previous shutdown and are moved to the failed state.
    pub async fn restore_previous_state(&self) {
        let live = self.transport.live_tasks();
        for task in &live {
            self.progress.mark_active(task.tag);
        }
        if !live.is_empty() {
            self.heartbeat.ensure_running();
            info!(live = live.len(), "Re-attached to live transfer tasks");
        }

        let live_ids: HashSet<String> = live.iter().map(|task| task.tag.to_string()).collect();
        let mut active = Vec::new();
        for status in [TransferStatus::Queued, TransferStatus::InProgress] {
            match self.archives.list_archives_by_status(status).await {
                Ok(mut rows) => active.append(&mut rows),
                Err(error) => {
                    warn!(error = %error, "Could not list active archives for reconciliation");
                    return;
                }
            }
        }

        let orphaned: Vec<String> = active
            .into_iter()
            .filter(|record| !live_ids.contains(&record.id))
            .map(|record| record.id)
            .collect();
        if orphaned.is_empty() {
            return;
        }
        match self
            .archives
            .mark_interrupted(&orphaned, INTERRUPTED_MESSAGE)
            .await
        {
            Ok(affected) => info!(affected, "Marked interrupted transfers as failed"),
            Err(error) => warn!(error = %error, "Could not mark interrupted transfers"),
        }
    }

    /// Consume transport events until the channel closes. The event loop is
    /// the single owner of all terminal status decisions.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                service.handle_transport_event(event).await;
            }
            debug!("Transport event channel closed");
        })
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Progress {
                tag,
                bytes_written,
                total_bytes,
            } => {
                self.progress.record(tag, bytes_written, total_bytes);
            }
            TransportEvent::Completed { tag, outcome } => {
                self.progress.remove(&tag);
                if self.progress.is_empty() {
                    self.heartbeat.stop();
                }
                self.handle_outcome(tag, outcome).await;
            }
        }
    }

    async fn handle_outcome(&self, id: Uuid, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Finished {
                staging_path,
                suggested_name,
                bytes_written,
            } => {
                match self
                    .placement
                    .place(id, &staging_path, suggested_name.as_deref())
                    .await
                {
                    Ok(path) => {
                        if let Err(error) = self
                            .archives
                            .mark_completed(&id.to_string(), bytes_written as i64)
                            .await
                        {
                            warn!(%id, error = %error, "Could not record completed status");
                        }
                        info!(%id, path = %path.display(), bytes_written, "Transfer completed");
                        self.broadcast(TransferEvent::Completed { id, path });
                    }
                    Err(error) => {
                        let message = format!("could not place completed file: {error}");
                        warn!(%id, error = %error, "Placement failed");
                        if let Err(error) = self
                            .archives
                            .mark_failed(&id.to_string(), &message, None, 0)
                            .await
                        {
                            warn!(%id, error = %error, "Could not record failed status");
                        }
                        self.broadcast(TransferEvent::Failed { id, error: message });
                    }
                }
            }
            TaskOutcome::CancelledWithToken {
                resume_token,
                bytes_written,
            } => {
                if let Err(error) = self
                    .archives
                    .mark_paused(&id.to_string(), &resume_token, bytes_written as i64)
                    .await
                {
                    warn!(%id, error = %error, "Could not record paused status");
                }
                info!(%id, bytes_written, "Transfer paused");
                self.broadcast(TransferEvent::Paused { id });
            }
            TaskOutcome::Cancelled => {
                if let Err(error) = self.archives.mark_remote(&id.to_string()).await {
                    warn!(%id, error = %error, "Could not record cancelled status");
                }
                debug!(%id, "Transfer cancelled by transport");
                self.broadcast(TransferEvent::Cancelled { id });
            }
            TaskOutcome::Failed {
                error,
                resume_token,
                bytes_written,
            } => {
                if let Err(store_error) = self
                    .archives
                    .mark_failed(
                        &id.to_string(),
                        &error,
                        resume_token.as_deref(),
                        bytes_written as i64,
                    )
                    .await
                {
                    warn!(%id, error = %store_error, "Could not record failed status");
                }
                warn!(%id, error = %error, "Transfer failed");
                self.broadcast(TransferEvent::Failed { id, error });
            }
        }
    }

    async fn load_record(&self, id: Uuid) -> Option<crate::database::models::ArchiveDbModel> {
        match self.archives.get_archive(&id.to_string()).await {
            Ok(record) => Some(record),
            Err(Error::NotFound { .. }) => {
                debug!(%id, "Ignoring operation on unknown archive");
                None
            }
            Err(error) => {
                warn!(%id, error = %error, "Could not load archive record");
                None
            }
        }
    }

    fn broadcast(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

async fn flush_dirty_progress(
    archives: &dyn ArchiveRepository,
    progress: &ProgressTable,
    events: &broadcast::Sender<TransferEvent>,
) {
    let snapshot = progress.drain_dirty();
    if snapshot.is_empty() {
        return;
    }

    let rows: Vec<(String, i64)> = snapshot
        .iter()
        .map(|(tag, progress)| (tag.to_string(), progress.bytes_written as i64))
        .collect();
    match archives.flush_progress(&rows).await {
        Ok(affected) => debug!(drained = rows.len(), affected, "Flushed transfer progress"),
        Err(error) => warn!(error = %error, "Could not flush transfer progress"),
    }

    for (id, snapshot) in snapshot {
        let _ = events.send(TransferEvent::Progress {
            id,
            bytes_written: snapshot.bytes_written,
            total_bytes: snapshot.total_bytes,
        });
    }
}

/// Catalog links may point at a `.meta4` metalink wrapper; the transfer
/// fetches the file itself.
fn strip_meta4_suffix(raw_url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(raw_url)
        && let Some(stripped) = parsed.path().strip_suffix(".meta4").map(str::to_string)
    {
        parsed.set_path(&stripped);
        return parsed.into();
    }
    raw_url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_meta4_suffix() {
        assert_eq!(
            strip_meta4_suffix("https://mirror.example/zims/wiki_en.zim.meta4"),
            "https://mirror.example/zims/wiki_en.zim"
        );
        assert_eq!(
            strip_meta4_suffix("https://mirror.example/zims/wiki_en.zim.meta4?mirror=3"),
            "https://mirror.example/zims/wiki_en.zim?mirror=3"
        );
    }

    #[test]
    fn test_strip_meta4_suffix_leaves_other_urls_alone() {
        assert_eq!(
            strip_meta4_suffix("https://mirror.example/zims/wiki_en.zim"),
            "https://mirror.example/zims/wiki_en.zim"
        );
        assert_eq!(strip_meta4_suffix("not a url"), "not a url");
    }
}
