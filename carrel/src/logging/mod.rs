//! Logging setup with console and optional file output.
//!
//! File logs rotate daily via `tracing_appender`; timestamps use the
//! local timezone so log lines correlate with what the user sees.

use chrono::Local;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "carrel=info,sqlx=warn";

const LOG_FILE_PREFIX: &str = "carrel.log";

/// Timer that formats timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Initialize the global subscriber. With a log directory, a daily-rotated
/// file layer is added; the returned guard must stay alive for the process
/// lifetime or buffered file output is lost.
pub fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_timer(LocalTimer),
                )
                .try_init()
                .map_err(|e| Error::Other(format!("Could not set global subscriber: {e}")))?;
            Ok(Some(guard))
        }
        None => {
            registry
                .try_init()
                .map_err(|e| Error::Other(format!("Could not set global subscriber: {e}")))?;
            Ok(None)
        }
    }
}
