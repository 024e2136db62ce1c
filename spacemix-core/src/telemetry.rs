//! Logging setup and PII handling.
//!
//! Whether field values and natural-language query text may appear in logs is
//! an explicit [`PiiPolicy`] carried by the engine, built from configuration.

use std::fmt;

use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

use crate::config::SpacemixConfig;
use crate::error::{Result, SpacemixError};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `[general] log_level`.
///
/// # Errors
///
/// Returns `SpacemixError::Config` if the level is unparseable or a global
/// subscriber is already installed.
pub fn init(config: &SpacemixConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.general.log_level)
            .map_err(|e| SpacemixError::Config(format!("general.log_level: {e}")))?,
    };

    let builder = subscriber_fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = if config.telemetry.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| SpacemixError::Config(format!("logging already initialised: {e}")))
}

/// Whether personally identifiable values may be logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PiiPolicy {
    /// Log values verbatim.
    pub expose: bool,
}

impl PiiPolicy {
    /// Policy from `[telemetry] expose_pii`.
    #[must_use]
    pub fn from_config(config: &SpacemixConfig) -> Self {
        Self {
            expose: config.telemetry.expose_pii,
        }
    }

    /// Wrap a value for logging.
    pub fn show<'a, T: fmt::Display + ?Sized>(&self, value: &'a T) -> Redacted<'a, T> {
        Redacted {
            value,
            expose: self.expose,
        }
    }
}

/// Display adapter returned by [`PiiPolicy::show`].
pub struct Redacted<'a, T: ?Sized> {
    value: &'a T,
    expose: bool,
}

impl<T: fmt::Display + ?Sized> fmt::Display for Redacted<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.expose {
            self.value.fmt(f)
        } else {
            f.write_str("<redacted>")
        }
    }
}
