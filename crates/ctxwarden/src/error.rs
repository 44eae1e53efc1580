//! Error types.
//!
//! Two families live here. [`WardenError`] covers configuration and
//! initialization problems, the only failures allowed to terminate a
//! caller's operation. [`CompressionError`] covers a strategy that raised
//! or made no progress; those never reach callers as `Err` and are instead
//! handed to the [`FallbackSystem`](crate::fallback::FallbackSystem), which
//! classifies them by the keywords in their display strings.

use thiserror::Error;

/// Hard failures: bad configuration, unreadable files, or an internal
/// pipeline fault that the auto-compression manager recovers from.
#[derive(Debug, Error)]
pub enum WardenError {
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A configuration document failed JSON-Schema validation.
    #[error("configuration does not match schema:\n{0}")]
    Schema(String),
    /// Failed to read or write a file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse or produce JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The compression pipeline itself broke (task panic, accounting drift).
    #[error("compression pipeline failed: {0}")]
    Pipeline(String),
    /// No window manager is registered under the given id.
    #[error("unknown window manager '{0}'")]
    UnknownManager(String),
}

/// Result alias for fallible configuration and setup calls.
pub type Result<T> = std::result::Result<T, WardenError>;

/// A compression strategy failed or under-performed.
///
/// The display strings are part of the contract: fallback classification
/// matches on words like "timeout", "memory" or "parse".
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompressionError {
    #[error("compression timeout after {0} ms")]
    Timeout(u64),
    #[error("out of memory while compressing: {0}")]
    MemoryExhausted(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown content type: {0}")]
    UnsupportedContent(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
    #[error("insufficient compression: achieved ratio {achieved:.2}, target {target:.2}")]
    InsufficientCompression { achieved: f64, target: f64 },
    #[error("algorithm failure: {0}")]
    Algorithm(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = WardenError::Config("ratios sum to 1.4".into());
        assert_eq!(err.to_string(), "invalid configuration: ratios sum to 1.4");
    }

    #[test]
    fn io_error_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: WardenError = io_err.into();
        assert!(matches!(err, WardenError::Io(_)));
    }

    #[test]
    fn compression_error_messages_carry_keywords() {
        assert!(CompressionError::Timeout(500).to_string().contains("timeout"));
        assert!(
            CompressionError::MemoryExhausted("heap".into())
                .to_string()
                .contains("memory")
        );
        assert!(CompressionError::Parse("bad json".into()).to_string().contains("parse"));
        let insufficient = CompressionError::InsufficientCompression {
            achieved: 0.9,
            target: 0.5,
        };
        assert!(insufficient.to_string().contains("0.90"));
    }
}
