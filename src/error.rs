//! Crate-wide error types.
//!
//! `EngineError` is the typed boundary error returned to CLI/GUI
//! collaborators. `ErrorClass` is the closed taxonomy the retry engine
//! (C5) classifies every provider failure into.

use thiserror::Error;

/// Errors that cross the core boundary, per the error-handling design.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("translation failed for cue {cue_index} ({class:?}): {detail}")]
    TranslationFailed {
        cue_index: usize,
        class: ErrorClass,
        detail: String,
    },

    #[error("file operation failed for {path}: {detail}")]
    FileFailed { path: String, detail: String },
}

/// Closed taxonomy of provider failure classes. Unknown failures map
/// to `Unknown` rather than growing the enum; keep the classifier
/// table declarative so new patterns are additions, not branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    RateLimit,
    Timeout,
    Connection,
    Server,
    Authentication,
    ContentFilter,
    Unknown,
}

impl ErrorClass {
    /// Classify a raw HTTP status code and message into one of the
    /// seven closed classes. Status codes are checked first (most
    /// reliable signal); message text is only consulted as a
    /// fallback, e.g. for transport-level failures that never reached
    /// an HTTP response.
    pub fn classify(status: Option<u16>, message: &str) -> Self {
        if let Some(status) = status {
            match status {
                429 => return ErrorClass::RateLimit,
                401 | 403 => return ErrorClass::Authentication,
                500..=599 => return ErrorClass::Server,
                _ => {}
            }
        }

        let lower = message.to_lowercase();
        const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "too many requests", "429"];
        const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout"];
        const CONNECTION_PATTERNS: &[&str] = &[
            "dns",
            "connection refused",
            "connection reset",
            "tls",
            "could not connect",
        ];
        const AUTH_PATTERNS: &[&str] = &["invalid api key", "unauthorized", "401"];
        const CONTENT_FILTER_PATTERNS: &[&str] = &["content filter", "content_filter", "moderation", "refused to"];

        if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
            ErrorClass::RateLimit
        } else if TIMEOUT_PATTERNS.iter().any(|p| lower.contains(p)) {
            ErrorClass::Timeout
        } else if CONNECTION_PATTERNS.iter().any(|p| lower.contains(p)) {
            ErrorClass::Connection
        } else if AUTH_PATTERNS.iter().any(|p| lower.contains(p)) {
            ErrorClass::Authentication
        } else if CONTENT_FILTER_PATTERNS.iter().any(|p| lower.contains(p)) {
            ErrorClass::ContentFilter
        } else {
            ErrorClass::Unknown
        }
    }
}
