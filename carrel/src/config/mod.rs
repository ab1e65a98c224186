//! Application settings.
//!
//! Settings are assembled by the CLI layer from flags and environment
//! variables; this module owns the defaults and validation.

use std::path::PathBuf;
use std::time::Duration;

use bounded_cache::CachePolicy;

use crate::downloads::DEFAULT_HEARTBEAT_PERIOD;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:carrel.db?mode=rwc";
pub const DEFAULT_LIBRARY_DIR: &str = "library";
pub const DEFAULT_STAGING_DIR: &str = "library/.partial";

const DEFAULT_SESSION_HIGH_WATER: usize = 10;
const DEFAULT_SESSION_LOW_WATER: usize = 5;

/// Runtime settings for the application.
#[derive(Debug, Clone)]
pub struct AppSettings {
    pub database_url: String,
    /// Destination directory for completed archives.
    pub library_dir: PathBuf,
    /// Directory for in-flight partial files.
    pub staging_dir: PathBuf,
    /// Log file directory; console-only logging when unset.
    pub log_dir: Option<PathBuf>,
    pub heartbeat_period: Duration,
    /// Allow transfers over metered connections.
    pub allow_metered: bool,
    pub session_high_water: usize,
    pub session_low_water: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            library_dir: PathBuf::from(DEFAULT_LIBRARY_DIR),
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            log_dir: None,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            allow_metered: false,
            session_high_water: DEFAULT_SESSION_HIGH_WATER,
            session_low_water: DEFAULT_SESSION_LOW_WATER,
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database URL must not be empty"));
        }
        if self.heartbeat_period.is_zero() {
            return Err(Error::config("heartbeat period must be greater than zero"));
        }
        if self.session_high_water == 0 {
            return Err(Error::config(
                "session high-water mark must be greater than zero",
            ));
        }
        if self.session_low_water > self.session_high_water {
            return Err(Error::config(
                "session low-water mark exceeds the high-water mark",
            ));
        }
        Ok(())
    }

    pub fn session_policy(&self) -> CachePolicy {
        CachePolicy::new(self.session_high_water, self.session_low_water)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(AppSettings::default().validate().is_ok());
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let settings = AppSettings {
            heartbeat_period: Duration::ZERO,
            ..AppSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_inverted_watermarks_rejected() {
        let settings = AppSettings {
            session_high_water: 3,
            session_low_water: 8,
            ..AppSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
