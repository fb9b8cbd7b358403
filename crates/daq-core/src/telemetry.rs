//! Log output for decode sessions.
//!
//! Library code only emits `tracing` events with structured fields
//! (`packet_id`, `key`, `stream_id`, `decoder`). A binary or test that wants
//! them printed calls [`init`] once.

use std::str::FromStr;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log level '{0}', must be one of: trace, debug, info, warn, error")]
    InvalidLevel(String),

    /// A global subscriber was installed before.
    #[error("failed to initialize tracing: {0}")]
    AlreadyInitialized(String),
}

/// Parse a level name such as `"debug"`, ignoring case.
pub fn parse_log_level(level: &str) -> Result<Level, TelemetryError> {
    Level::from_str(&level.to_ascii_lowercase()).map_err(|_| TelemetryError::InvalidLevel(level.to_string()))
}

/// Install a single-line subscriber at `level`.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str) -> Result<(), TelemetryError> {
    let level = parse_log_level(level)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string().to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_second_init_fails() {
        let first = init("warn");
        let second = init("info");
        assert!(first.is_ok() || second.is_err());
        assert!(matches!(second, Err(TelemetryError::AlreadyInitialized(_))));
    }
}
