//! Core error taxonomy.
//!
//! Every fallible operation in this crate returns [`CoreResult<T>`] rather than
//! `anyhow::Result`, so that callers (the CLI, a future server boundary, tests)
//! can branch on `code` and `retryable` without string-matching a message.
//!
//! `anyhow` is still used at the thin CLI binary boundary, where a chain of
//! `.context(...)` calls renders to a terminal and nothing downstream inspects
//! the error programmatically.

use std::fmt;

/// Stable error classification, independent of the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MigrationFailed,
    StoreError,
    TooLarge,
    ConverterFailed,
    ModelNotFound,
    ModelNotCached,
    ModelDownloadFailed,
    ModelLoadFailed,
    ModelCorrupted,
    InferenceFailed,
    Timeout,
    OutOfMemory,
    InvalidUri,
    AutoDownloadDisabled,
    LockFailed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MigrationFailed => "MIGRATION_FAILED",
            ErrorCode::StoreError => "STORE_ERROR",
            ErrorCode::TooLarge => "TOO_LARGE",
            ErrorCode::ConverterFailed => "CONVERTER_FAILED",
            ErrorCode::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorCode::ModelNotCached => "MODEL_NOT_CACHED",
            ErrorCode::ModelDownloadFailed => "MODEL_DOWNLOAD_FAILED",
            ErrorCode::ModelLoadFailed => "MODEL_LOAD_FAILED",
            ErrorCode::ModelCorrupted => "MODEL_CORRUPTED",
            ErrorCode::InferenceFailed => "INFERENCE_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::OutOfMemory => "OUT_OF_MEMORY",
            ErrorCode::InvalidUri => "INVALID_URI",
            ErrorCode::AutoDownloadDisabled => "AUTO_DOWNLOAD_DISABLED",
            ErrorCode::LockFailed => "LOCK_FAILED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Whether an operation that failed with this code is worth retrying as-is.
    fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ModelDownloadFailed | ErrorCode::Timeout | ErrorCode::InferenceFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured, user-presentable error.
///
/// Mirrors the `{code, message, retryable, suggestion?, cause?}` shape every
/// port in this crate is documented to return.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub suggestion: Option<String>,
    pub cause: Option<String>,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.default_retryable();
        Self {
            code,
            message: message.into(),
            retryable,
            suggestion: None,
            cause: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(truncate_cause(&cause.to_string()));
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StoreError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

/// Causes are normalized to a bounded length; unserializable causes (we only
/// ever construct these from `Display` output, so this branch is defensive)
/// fall back to a fixed placeholder.
fn truncate_cause(s: &str) -> String {
    if s.is_empty() {
        return "[unserializable cause]".to_string();
    }
    if s.chars().count() <= 1000 {
        s.to_string()
    } else {
        s.chars().take(1000).collect()
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::store(e.to_string()).with_cause(e)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::internal(e.to_string()).with_cause(e)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_defaults_match_taxonomy() {
        assert!(CoreError::new(ErrorCode::Timeout, "x").retryable);
        assert!(CoreError::new(ErrorCode::ModelDownloadFailed, "x").retryable);
        assert!(!CoreError::new(ErrorCode::InvalidUri, "x").retryable);
    }

    #[test]
    fn cause_truncates_long_strings() {
        let long = "a".repeat(5000);
        let err = CoreError::internal("x").with_cause(long);
        assert_eq!(err.cause.unwrap().chars().count(), 1000);
    }
}
