//! Error types for the Compliance Assistant.
//!
//! Library crates use [`ComplianceError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Compliance Assistant operations.
#[derive(Debug, thiserror::Error)]
pub enum ComplianceError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Malformed submission fields. The item fails immediately, no retry.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Network failure, timeout, or 5xx/429 from a collaborator.
    #[error("transient dependency error: {0}")]
    Transient(String),

    /// Non-retryable collaborator failure (4xx, unusable response).
    #[error("dependency error: {0}")]
    Dependency(String),

    /// Malformed or empty language model output.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Knowledge store or master record store write/read failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Notification delivery rejected by the transport.
    #[error("notification error: {0}")]
    Notification(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input parsing error (submission files, HTML, JSON payloads).
    #[error("parse error: {message}")]
    Parse { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ComplianceError>;

impl ComplianceError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the retry utility may attempt the call again.
    ///
    /// Extraction errors are retryable too: a second model call can produce
    /// well-formed output where the first did not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Extraction(_))
    }

    /// Short taxonomy label used in batch reports and failure reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Validation { .. } => "validation",
            Self::Transient(_) => "transient_dependency",
            Self::Dependency(_) => "dependency",
            Self::Extraction(_) => "extraction",
            Self::Persistence(_) => "persistence",
            Self::Notification(_) => "notification",
            Self::Io { .. } => "io",
            Self::Parse { .. } => "parse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ComplianceError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = ComplianceError::validation("due date '31/31/2025' is not a date");
        assert!(err.to_string().contains("31/31/2025"));
    }

    #[test]
    fn retryable_classification() {
        assert!(ComplianceError::Transient("timeout".into()).is_retryable());
        assert!(ComplianceError::Extraction("empty output".into()).is_retryable());
        assert!(!ComplianceError::validation("bad").is_retryable());
        assert!(!ComplianceError::Persistence("disk full".into()).is_retryable());
        assert!(!ComplianceError::Dependency("HTTP 403".into()).is_retryable());
    }

    #[test]
    fn kind_labels() {
        assert_eq!(ComplianceError::Persistence("x".into()).kind(), "persistence");
        assert_eq!(ComplianceError::Transient("x".into()).kind(), "transient_dependency");
    }
}
