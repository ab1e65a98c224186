//! HTTP transport: streaming downloads with range-based resumption.
//!
//! Each spawned task streams the response body into an instance-unique
//! staging file and reports cumulative progress per chunk. Pausing
//! serializes a [`ResumeState`] as the opaque resume token; resuming
//! validates the staging file against it and continues with a `Range`
//! request. A server that ignores the range simply restarts the body.

use dashmap::DashMap;
use futures::StreamExt;
use reqwest::{StatusCode, header};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::transport::{CancelMode, LiveTask, TaskOutcome, TaskSpec, Transport, TransportEvent};
use crate::Result;

const DEFAULT_USER_AGENT: &str = concat!("carrel/", env!("CARGO_PKG_VERSION"));
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Directory for in-flight `.part` files.
    pub staging_dir: PathBuf,
    pub user_agent: String,
    pub connect_timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Opaque resume token payload.
///
/// Consumers treat the token as a byte blob; only this transport reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResumeState {
    url: String,
    staging_path: PathBuf,
    bytes_written: u64,
    etag: Option<String>,
    total_bytes: Option<u64>,
}

struct TaskEntry {
    /// Distinguishes this task from a superseded one with the same tag.
    instance: u64,
    token: CancellationToken,
    wants_resume_data: Arc<AtomicBool>,
    allow_metered: bool,
}

/// Reqwest-backed [`Transport`] implementation.
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
    event_tx: mpsc::Sender<TransportEvent>,
    tasks: Arc<DashMap<Uuid, TaskEntry>>,
    next_instance: AtomicU64,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig, event_tx: mpsc::Sender<TransportEvent>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            config,
            event_tx,
            tasks: Arc::new(DashMap::new()),
            next_instance: AtomicU64::new(0),
        })
    }
}

impl Transport for HttpTransport {
    fn spawn(&self, spec: TaskSpec) {
        let tag = spec.tag;

        // A replacement for a still-live tag silences the old task: it is
        // cancelled, discards its own staging file, and emits no terminal
        // event because its map entry is already gone.
        if let Some((_, old)) = self.tasks.remove(&tag) {
            debug!(%tag, "Superseding live transfer task");
            old.wants_resume_data.store(false, Ordering::SeqCst);
            old.token.cancel();
        }

        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let wants_resume_data = Arc::new(AtomicBool::new(false));
        self.tasks.insert(
            tag,
            TaskEntry {
                instance,
                token: token.clone(),
                wants_resume_data: wants_resume_data.clone(),
                allow_metered: spec.allow_metered,
            },
        );

        debug!(%tag, url = %spec.url, allow_metered = spec.allow_metered, "Spawning transfer task");

        let client = self.client.clone();
        let staging_dir = self.config.staging_dir.clone();
        let event_tx = self.event_tx.clone();
        let tasks = Arc::clone(&self.tasks);
        tokio::spawn(async move {
            let outcome = run_task(
                client,
                staging_dir,
                instance,
                spec,
                token,
                wants_resume_data,
                event_tx.clone(),
            )
            .await;

            let still_owned = tasks
                .remove_if(&tag, |_, entry| entry.instance == instance)
                .is_some();
            if still_owned
                && event_tx
                    .send(TransportEvent::Completed { tag, outcome })
                    .await
                    .is_err()
            {
                debug!(%tag, "Event channel closed before completion could be reported");
            }
        });
    }

    fn cancel(&self, tag: Uuid, mode: CancelMode) -> bool {
        match self.tasks.get(&tag) {
            Some(entry) => {
                entry
                    .wants_resume_data
                    .store(mode == CancelMode::KeepResumeData, Ordering::SeqCst);
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    fn live_tasks(&self) -> Vec<LiveTask> {
        self.tasks
            .iter()
            .map(|entry| LiveTask {
                tag: *entry.key(),
                allow_metered: entry.allow_metered,
            })
            .collect()
    }

    fn discard_resume_data(&self, token: &[u8]) {
        let Ok(state) = serde_json::from_slice::<ResumeState>(token) else {
            debug!("Ignoring unparseable resume token during discard");
            return;
        };
        if let Err(error) = std::fs::remove_file(&state.staging_path)
            && error.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                staging_path = %state.staging_path.display(),
                error = %error,
                "Could not remove staging file for discarded resume token"
            );
        }
    }
}

struct TransferContext {
    url: String,
    staging_path: PathBuf,
    bytes_written: u64,
    etag: Option<String>,
    total_bytes: Option<u64>,
}

impl TransferContext {
    /// Serialized resume token for the current partial state, or `None`
    /// when nothing worth resuming exists.
    fn salvage_token(&self) -> Option<Vec<u8>> {
        if self.bytes_written == 0 {
            return None;
        }
        let state = ResumeState {
            url: self.url.clone(),
            staging_path: self.staging_path.clone(),
            bytes_written: self.bytes_written,
            etag: self.etag.clone(),
            total_bytes: self.total_bytes,
        };
        match serde_json::to_vec(&state) {
            Ok(token) => Some(token),
            Err(error) => {
                warn!(error = %error, "Could not serialize resume state");
                None
            }
        }
    }
}

enum StreamEnd {
    Completed { suggested_name: Option<String> },
    Cancelled,
}

async fn run_task(
    client: reqwest::Client,
    staging_dir: PathBuf,
    instance: u64,
    spec: TaskSpec,
    token: CancellationToken,
    wants_resume_data: Arc<AtomicBool>,
    event_tx: mpsc::Sender<TransportEvent>,
) -> TaskOutcome {
    let tag = spec.tag;

    let resume_state = match spec.resume_from.as_deref() {
        Some(raw) => match serde_json::from_slice::<ResumeState>(raw) {
            Ok(state) => Some(state),
            Err(error) => {
                return TaskOutcome::Failed {
                    error: format!("invalid resume token: {error}"),
                    resume_token: None,
                    bytes_written: 0,
                };
            }
        },
        None => None,
    };

    let (staging_path, offset) =
        resolve_staging(&staging_dir, tag, instance, resume_state.as_ref()).await;
    let etag = if offset > 0 {
        resume_state.as_ref().and_then(|state| state.etag.clone())
    } else {
        None
    };

    let mut ctx = TransferContext {
        url: spec.url.clone(),
        staging_path,
        bytes_written: offset,
        etag,
        total_bytes: resume_state.as_ref().and_then(|state| state.total_bytes),
    };

    match stream_body(&client, &mut ctx, tag, &token, &event_tx).await {
        Ok(StreamEnd::Completed { suggested_name }) => TaskOutcome::Finished {
            staging_path: ctx.staging_path,
            suggested_name,
            bytes_written: ctx.bytes_written,
        },
        Ok(StreamEnd::Cancelled) => {
            if wants_resume_data.load(Ordering::SeqCst)
                && let Some(resume_token) = ctx.salvage_token()
            {
                return TaskOutcome::CancelledWithToken {
                    resume_token,
                    bytes_written: ctx.bytes_written,
                };
            }
            discard_staging(&ctx.staging_path).await;
            TaskOutcome::Cancelled
        }
        Err(error) => {
            let resume_token = ctx.salvage_token();
            let bytes_written = if resume_token.is_some() {
                ctx.bytes_written
            } else {
                discard_staging(&ctx.staging_path).await;
                0
            };
            TaskOutcome::Failed {
                error: error.to_string(),
                resume_token,
                bytes_written,
            }
        }
    }
}

/// Pick the staging file and starting offset. A resume whose staging file
/// is gone or no longer matches the recorded length restarts from zero.
async fn resolve_staging(
    staging_dir: &Path,
    tag: Uuid,
    instance: u64,
    resume: Option<&ResumeState>,
) -> (PathBuf, u64) {
    match resume {
        Some(state) => match tokio::fs::metadata(&state.staging_path).await {
            Ok(meta) if meta.len() == state.bytes_written => {
                (state.staging_path.clone(), state.bytes_written)
            }
            _ => {
                warn!(
                    %tag,
                    staging_path = %state.staging_path.display(),
                    "Staging file does not match resume token, restarting from byte 0"
                );
                (state.staging_path.clone(), 0)
            }
        },
        None => (staging_dir.join(format!("{tag}.{instance}.part")), 0),
    }
}

async fn stream_body(
    client: &reqwest::Client,
    ctx: &mut TransferContext,
    tag: Uuid,
    token: &CancellationToken,
    event_tx: &mpsc::Sender<TransportEvent>,
) -> Result<StreamEnd> {
    let resuming = ctx.bytes_written > 0;
    let mut file = if resuming {
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&ctx.staging_path)
            .await?
    } else {
        if let Some(parent) = ctx.staging_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(&ctx.staging_path).await?
    };

    let mut request = client.get(&ctx.url);
    if resuming {
        request = request.header(header::RANGE, format!("bytes={}-", ctx.bytes_written));
        if let Some(etag) = &ctx.etag {
            request = request.header(header::IF_RANGE, etag.clone());
        }
    }

    let response = request.send().await?.error_for_status()?;

    if resuming && response.status() != StatusCode::PARTIAL_CONTENT {
        debug!(%tag, "Server did not honor the range request, restarting from byte 0");
        file.set_len(0).await?;
        ctx.bytes_written = 0;
    }

    if let Some(etag) = response
        .headers()
        .get(header::ETAG)
        .and_then(|value| value.to_str().ok())
    {
        ctx.etag = Some(etag.to_string());
    }

    ctx.total_bytes = match response.status() {
        StatusCode::PARTIAL_CONTENT => response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total),
        _ => response.content_length(),
    };

    let suggested_name = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_disposition_filename)
        .or_else(|| url_file_name(&ctx.url));

    let mut stream = response.bytes_stream();
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                file.flush().await?;
                return Ok(StreamEnd::Cancelled);
            }
            chunk = stream.next() => match chunk {
                Some(chunk) => {
                    let chunk = chunk?;
                    file.write_all(&chunk).await?;
                    ctx.bytes_written += chunk.len() as u64;

                    let progress = TransportEvent::Progress {
                        tag,
                        bytes_written: ctx.bytes_written,
                        total_bytes: ctx.total_bytes,
                    };
                    if event_tx.send(progress).await.is_err() {
                        // Consumer is gone; tear the task down
                        file.flush().await?;
                        return Ok(StreamEnd::Cancelled);
                    }
                }
                None => {
                    file.flush().await?;
                    return Ok(StreamEnd::Completed { suggested_name });
                }
            }
        }
    }
}

async fn discard_staging(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %error, "Could not remove staging file");
    }
}

/// Total size from a `Content-Range` header, e.g. `bytes 100-999/5000`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Filename from a `Content-Disposition` header, plain `filename=` form.
fn parse_disposition_filename(value: &str) -> Option<String> {
    value.split(';').find_map(|part| {
        let (key, raw) = part.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let name = raw.trim().trim_matches('"').trim();
        (!name.is_empty()).then(|| name.to_string())
    })
}

/// Final path segment of a URL, used as a filename hint.
fn url_file_name(raw_url: &str) -> Option<String> {
    let parsed = url::Url::parse(raw_url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    (!segment.is_empty()).then(|| segment.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_state_round_trip() {
        let ctx = TransferContext {
            url: "https://mirror/wiki.zim".to_string(),
            staging_path: PathBuf::from("/staging/x.part"),
            bytes_written: 1234,
            etag: Some("\"abc\"".to_string()),
            total_bytes: Some(9999),
        };

        let token = ctx.salvage_token().unwrap();
        let state: ResumeState = serde_json::from_slice(&token).unwrap();
        assert_eq!(state.url, "https://mirror/wiki.zim");
        assert_eq!(state.bytes_written, 1234);
        assert_eq!(state.etag.as_deref(), Some("\"abc\""));
        assert_eq!(state.total_bytes, Some(9999));
    }

    #[test]
    fn test_salvage_token_requires_progress() {
        let ctx = TransferContext {
            url: "https://mirror/wiki.zim".to_string(),
            staging_path: PathBuf::from("/staging/x.part"),
            bytes_written: 0,
            etag: None,
            total_bytes: None,
        };
        assert!(ctx.salvage_token().is_none());
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 100-999/5000"), Some(5000));
        assert_eq!(parse_content_range_total("bytes */5000"), Some(5000));
        assert_eq!(parse_content_range_total("bytes 100-999/*"), None);
        assert_eq!(parse_content_range_total("items 1-2/3"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_parse_disposition_filename() {
        assert_eq!(
            parse_disposition_filename(r#"attachment; filename="wiki_en.zim""#),
            Some("wiki_en.zim".to_string())
        );
        assert_eq!(
            parse_disposition_filename("attachment; filename=plain.zim"),
            Some("plain.zim".to_string())
        );
        assert_eq!(parse_disposition_filename("inline"), None);
        assert_eq!(parse_disposition_filename(r#"attachment; filename="""#), None);
    }

    #[test]
    fn test_url_file_name() {
        assert_eq!(
            url_file_name("https://mirror.example/zims/wiki_en.zim?mirror=3"),
            Some("wiki_en.zim".to_string())
        );
        assert_eq!(url_file_name("https://mirror.example/zims/"), None);
        assert_eq!(url_file_name("not a url"), None);
    }

    #[tokio::test]
    async fn test_discard_resume_data_removes_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("partial.part");
        tokio::fs::write(&staging, vec![0u8; 300]).await.unwrap();

        let ctx = TransferContext {
            url: "https://mirror/wiki.zim".to_string(),
            staging_path: staging.clone(),
            bytes_written: 300,
            etag: None,
            total_bytes: None,
        };
        let token = ctx.salvage_token().unwrap();

        let (event_tx, _event_rx) = mpsc::channel(4);
        let transport =
            HttpTransport::new(HttpTransportConfig::new(dir.path()), event_tx).unwrap();
        transport.discard_resume_data(&token);

        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_discard_resume_data_tolerates_bad_or_stale_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let (event_tx, _event_rx) = mpsc::channel(4);
        let transport =
            HttpTransport::new(HttpTransportConfig::new(dir.path()), event_tx).unwrap();

        transport.discard_resume_data(b"not a token");

        // Token pointing at a file that is already gone
        let ctx = TransferContext {
            url: "https://mirror/wiki.zim".to_string(),
            staging_path: dir.path().join("gone.part"),
            bytes_written: 100,
            etag: None,
            total_bytes: None,
        };
        transport.discard_resume_data(&ctx.salvage_token().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_staging_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let tag = Uuid::new_v4();

        let (path, offset) = resolve_staging(dir.path(), tag, 3, None).await;
        assert_eq!(path, dir.path().join(format!("{tag}.3.part")));
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn test_resolve_staging_with_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("partial.part");
        tokio::fs::write(&staging, vec![0u8; 500]).await.unwrap();

        let state = ResumeState {
            url: "https://mirror/wiki.zim".to_string(),
            staging_path: staging.clone(),
            bytes_written: 500,
            etag: None,
            total_bytes: None,
        };

        let (path, offset) =
            resolve_staging(dir.path(), Uuid::new_v4(), 0, Some(&state)).await;
        assert_eq!(path, staging);
        assert_eq!(offset, 500);
    }

    #[tokio::test]
    async fn test_resolve_staging_with_mismatched_file_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("partial.part");
        tokio::fs::write(&staging, vec![0u8; 100]).await.unwrap();

        let state = ResumeState {
            url: "https://mirror/wiki.zim".to_string(),
            staging_path: staging.clone(),
            bytes_written: 500,
            etag: None,
            total_bytes: None,
        };

        let (_, offset) = resolve_staging(dir.path(), Uuid::new_v4(), 0, Some(&state)).await;
        assert_eq!(offset, 0);
    }
}
