//! Transfer transport trait and related types.

use std::path::PathBuf;
use uuid::Uuid;

/// Everything the transport needs to run one transfer task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Archive id the task is tagged with; every event carries it back.
    pub tag: Uuid,
    /// Fully resolved download URL (any `.meta4` indirection already stripped).
    pub url: String,
    /// Whether the task may run on a metered connection.
    pub allow_metered: bool,
    /// Opaque token from an earlier pause or failure; `None` starts from scratch.
    pub resume_from: Option<Vec<u8>>,
}

impl TaskSpec {
    /// Create a new task spec with required fields.
    pub fn new(tag: Uuid, url: impl Into<String>) -> Self {
        Self {
            tag,
            url: url.into(),
            allow_metered: false,
            resume_from: None,
        }
    }

    /// Allow the task to run on a metered connection.
    pub fn with_allow_metered(mut self, allow: bool) -> Self {
        self.allow_metered = allow;
        self
    }

    /// Resume from an opaque transport token.
    pub fn with_resume_from(mut self, token: Vec<u8>) -> Self {
        self.resume_from = Some(token);
        self
    }
}

/// How a live task should be torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// Stop the task but keep partial state so a resume token is produced.
    KeepResumeData,
    /// Stop the task and discard partial state.
    Discard,
}

/// A task the transport currently considers live.
#[derive(Debug, Clone)]
pub struct LiveTask {
    pub tag: Uuid,
    pub allow_metered: bool,
}

/// Terminal result of a transfer task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The body was fully received into a staging file.
    Finished {
        staging_path: PathBuf,
        /// Filename hint from the server, when one was offered.
        suggested_name: Option<String>,
        bytes_written: u64,
    },
    /// The task was torn down with partial state preserved.
    CancelledWithToken {
        resume_token: Vec<u8>,
        bytes_written: u64,
    },
    /// The task was torn down and partial state discarded.
    Cancelled,
    /// The task ended with an error. A resume token is attached when
    /// partial state could be salvaged.
    Failed {
        error: String,
        resume_token: Option<Vec<u8>>,
        bytes_written: u64,
    },
}

/// Events emitted by transports.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Cumulative progress for a task. High frequency; consumers must not
    /// do per-event persistence.
    Progress {
        tag: Uuid,
        bytes_written: u64,
        total_bytes: Option<u64>,
    },
    /// Terminal event; arrives exactly once per spawned task.
    Completed { tag: Uuid, outcome: TaskOutcome },
}

/// Trait for transfer transports.
///
/// Implementations report progress and completion on the single event
/// channel handed to them at construction, in per-task order: every
/// `Progress` for a task precedes its `Completed`. All three methods are
/// non-blocking; `spawn` never fails synchronously, it reports problems
/// through a `Completed` event carrying [`TaskOutcome::Failed`].
pub trait Transport: Send + Sync {
    /// Start a transfer task. The task is live until its terminal event.
    fn spawn(&self, spec: TaskSpec);

    /// Request teardown of a live task. Returns `false` when no task with
    /// this tag is live (no terminal event will follow in that case).
    fn cancel(&self, tag: Uuid, mode: CancelMode) -> bool;

    /// Tasks currently live, e.g. for reconciliation after a restart.
    fn live_tasks(&self) -> Vec<LiveTask>;

    /// Dispose of partial transfer state referenced by a resume token that
    /// will never be resumed from, e.g. its staging file. Unparseable or
    /// stale tokens are ignored.
    fn discard_resume_data(&self, token: &[u8]);
}
