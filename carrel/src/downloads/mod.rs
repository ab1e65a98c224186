//! Download manager for archive transfers.
//!
//! This module is responsible for:
//! - Driving resumable HTTP transfers of large archive files
//! - Persisting transfer state and batched progress through the archive store
//! - Running the heartbeat that flushes progress while transfers are live
//! - Reconciling store state with live transport tasks after a restart
//! - Moving completed files into the library directory

mod heartbeat;
mod http;
mod placement;
mod progress;
mod service;
mod status;
mod transport;

pub use http::{HttpTransport, HttpTransportConfig};
pub use placement::{FilePlacement, LibraryPlacement};
pub use progress::{ProgressSnapshot, ProgressTable};
pub use service::{DEFAULT_HEARTBEAT_PERIOD, DownloadService, TransferEvent};
pub use status::TransferStatus;
pub use transport::{CancelMode, LiveTask, TaskOutcome, TaskSpec, Transport, TransportEvent};
