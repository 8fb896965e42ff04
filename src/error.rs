//! Error taxonomy for the order pipeline.
//!
//! Domain errors are typed enums so callers can branch on kind; general
//! propagation inside services stays on `anyhow::Result` with context.

use thiserror::Error;

/// Failures from an LLM provider call.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM call timed out after {0} seconds")]
    Timeout(u64),
    #[error("LLM provider rate limited the call")]
    RateLimit { retry_after_secs: Option<u64> },
    #[error("LLM provider rejected credentials")]
    AuthFailed,
    #[error("LLM provider unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("LLM returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Recoverable errors are retried by the worker; the rest fail fast.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_) | LlmError::RateLimit { .. } | LlmError::ServiceUnavailable(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            LlmError::Timeout(_) => "LLM_TIMEOUT",
            LlmError::RateLimit { .. } => "LLM_RATE_LIMIT",
            LlmError::AuthFailed => "LLM_AUTH_FAILED",
            LlmError::ServiceUnavailable(_) => "LLM_SERVICE_UNAVAILABLE",
            LlmError::InvalidResponse(_) => "LLM_INVALID_RESPONSE",
        }
    }
}

/// Failures from an embedding provider call.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding call timed out after {0} seconds")]
    Timeout(u64),
    #[error("embedding provider rate limited the call")]
    RateLimit { retry_after_secs: Option<u64> },
    #[error("embedding provider rejected credentials")]
    AuthFailed,
    #[error("embedding provider unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("embedding input invalid: {0}")]
    InvalidInput(String),
}

impl EmbeddingError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Timeout(_)
                | EmbeddingError::RateLimit { .. }
                | EmbeddingError::ServiceUnavailable(_)
        )
    }
}

/// Object store failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// State-machine and concurrency failures surfaced to callers.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("illegal state transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
    #[error("version conflict: expected {expected}, stored {stored}")]
    VersionConflict { expected: i64, stored: i64 },
    #[error("not found")]
    NotFound,
    #[error("customer detection is ambiguous: {0}")]
    AmbiguousCustomer(String),
    #[error("draft is not ready for approval: {0:?}")]
    NotReady(Vec<String>),
}

/// Caller-supplied input that is rejected before entering the pipeline.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("invalid file: {0}")]
    InvalidFile(String),
    #[error("unsupported MIME type: {0}")]
    UnsupportedMimeType(String),
    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },
    #[error("file is empty")]
    EmptyFile,
    #[error("invalid filename: {0}")]
    FilenameInvalid(String),
}

/// The tenant's daily LLM budget would be exceeded by this call.
#[derive(Debug, Error)]
#[error("daily LLM budget exceeded: used {used_micros} of {budget_micros} micros")]
pub struct BudgetExceeded {
    pub used_micros: i64,
    pub budget_micros: i64,
}

/// Export-side failures.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("dropzone write failed: {0}")]
    DropzoneWriteFailed(String),
    #[error("no active connection of type {0}")]
    NoActiveConnection(String),
    #[error("export already exists for idempotency key {0}")]
    DuplicateExport(String),
}

/// Worker task outcome classification: recoverable failures retry with
/// backoff, terminal ones poison the record immediately.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("recoverable: {0}")]
    Recoverable(#[source] anyhow::Error),
    #[error("terminal: {0}")]
    Terminal(#[source] anyhow::Error),
}

impl TaskError {
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Recoverable(err.into())
    }

    pub fn terminal(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Terminal(err.into())
    }

    pub fn from_llm(err: LlmError) -> Self {
        if err.is_retryable() {
            TaskError::Recoverable(err.into())
        } else {
            TaskError::Terminal(err.into())
        }
    }

    pub fn from_embedding(err: EmbeddingError) -> Self {
        if err.is_retryable() {
            TaskError::Recoverable(err.into())
        } else {
            TaskError::Terminal(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LlmError::Timeout(30).is_retryable());
        assert!(LlmError::RateLimit { retry_after_secs: None }.is_retryable());
        assert!(!LlmError::AuthFailed.is_retryable());
        assert!(!LlmError::InvalidResponse("nope".into()).is_retryable());
    }

    #[test]
    fn llm_errors_carry_stable_codes() {
        assert_eq!(LlmError::AuthFailed.code(), "LLM_AUTH_FAILED");
        assert_eq!(LlmError::Timeout(40).code(), "LLM_TIMEOUT");
    }
}
