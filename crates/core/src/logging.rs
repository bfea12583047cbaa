//! Tracing setup and routing of application log/trace records

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Target for records emitted through the embedded `log` call
pub const APP_LOG_TARGET: &str = "pyflow::app::log";
/// Target for records emitted through the embedded `trace` call
pub const APP_TRACE_TARGET: &str = "pyflow::app::trace";

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Calling this more than once is
/// harmless; only the first subscriber is installed.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Severity of an application record, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Severity {
    /// Map a Python `logging` level (`ERROR` = 40, `DEBUG` = 10, ...)
    pub fn from_python_level(level: i64) -> Self {
        match level {
            l if l >= 40 => Severity::Error,
            l if l >= 30 => Severity::Warn,
            l if l >= 20 => Severity::Info,
            l if l >= 10 => Severity::Debug,
            _ => Severity::Trace,
        }
    }

    /// Whether a record at this severity passes `threshold`
    pub fn passes(self, threshold: Severity) -> bool {
        self <= threshold
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warn => "warn",
            Severity::Info => "info",
            Severity::Debug => "debug",
            Severity::Trace => "trace",
        })
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" | "critical" | "fatal" => Ok(Severity::Error),
            "warn" | "warning" => Ok(Severity::Warn),
            "info" => Ok(Severity::Info),
            "debug" => Ok(Severity::Debug),
            "trace" => Ok(Severity::Trace),
            other => Err(Error::ConfigError(format!("unknown severity '{}'", other))),
        }
    }
}

/// Which application channel a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppChannel {
    Log,
    Trace,
}

/// Forward an application record to `tracing`
pub fn emit_app_record(channel: AppChannel, severity: Severity, stage: &str, aspects: &str, message: &str) {
    macro_rules! emit {
        ($target:expr) => {
            match severity {
                Severity::Error => tracing::error!(target: $target, stage, aspects, "{}", message),
                Severity::Warn => tracing::warn!(target: $target, stage, aspects, "{}", message),
                Severity::Info => tracing::info!(target: $target, stage, aspects, "{}", message),
                Severity::Debug => tracing::debug!(target: $target, stage, aspects, "{}", message),
                Severity::Trace => tracing::trace!(target: $target, stage, aspects, "{}", message),
            }
        };
    }
    match channel {
        AppChannel::Log => emit!(APP_LOG_TARGET),
        AppChannel::Trace => emit!(APP_TRACE_TARGET),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold() {
        assert!(Severity::Error.passes(Severity::Warn));
        assert!(Severity::Warn.passes(Severity::Warn));
        assert!(!Severity::Debug.passes(Severity::Info));
    }

    #[test]
    fn test_python_levels() {
        assert_eq!(Severity::from_python_level(50), Severity::Error);
        assert_eq!(Severity::from_python_level(30), Severity::Warn);
        assert_eq!(Severity::from_python_level(10), Severity::Debug);
        assert_eq!(Severity::from_python_level(5), Severity::Trace);
        assert_eq!("WARNING".parse::<Severity>().unwrap(), Severity::Warn);
    }
}
