//! Logging setup and the log sink used by components that report through
//! a narrow logger interface.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Output format for [`init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable output for local development.
    Pretty,
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `level` when set. An unparsable `level` falls back to
/// `info` with a warning. Call this once, from the program's entry point.
pub fn init(level: &str, format: LogFormat) -> Result<(), TelemetryError> {
    let (filter, rejected) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, None),
        Err(_) => match EnvFilter::try_new(level) {
            Ok(filter) => (filter, None),
            Err(_) => (EnvFilter::new("info"), Some(level.to_string())),
        },
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.map_err(|e| TelemetryError::Install(e.to_string()))?;

    if let Some(level) = rejected {
        tracing::warn!(
            configured_level = %level,
            default_level = "info",
            "invalid log level configured, using default level"
        );
    }
    Ok(())
}

/// Two-severity logger handed to components such as the schema migrator.
///
/// `fatal` reports an unrecoverable condition to the log. It never exits the
/// process; the caller still gets an error back and the entry point decides.
pub trait LogSink: Send + Sync {
    fn info(&self, message: &str);
    fn fatal(&self, message: &str);
}

/// [`LogSink`] that forwards to `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct TracingSink {
    component: &'static str,
}

impl TracingSink {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }
}

impl LogSink for TracingSink {
    fn info(&self, message: &str) {
        tracing::info!(component = self.component, "{message}");
    }

    fn fatal(&self, message: &str) {
        tracing::error!(component = self.component, fatal = true, "{message}");
    }
}
