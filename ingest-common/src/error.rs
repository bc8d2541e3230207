//! # Error
//!
//! The failure taxonomy shared by every component of the ingest pipeline.
//!
//! A failure is classified exactly once, at the point closest to where it happened, as either
//! `Retryable` (a transient external-resource condition, the message should be redelivered) or
//! `Fatal` (the message can never succeed and must be dead-lettered). Everything above that point
//! trusts the class already attached.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of characters of a payload we are willing to copy into an error context.
pub const MAX_SNIPPET_CHARS: usize = 200;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Key-value diagnostics attached to a `ClassifiedError`, e.g. `{"message_id": "ingest:0:42"}`.
pub type ErrorContext = BTreeMap<String, String>;

/// Enumeration of error codes used to catalogue failures for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InternalError,
    ValidationError,
    SerializationError,
    ConnectivityError,
    ResourceNotFound,
    AccessDenied,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::ConnectivityError => "CONNECTIVITY_ERROR",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
        }
    }

    /// Stable catalogue identifier, used as a metric label and stored with dead letters.
    pub fn catalogue_id(&self) -> &'static str {
        match self {
            ErrorCode::InternalError => "INGEST-000",
            ErrorCode::ValidationError => "INGEST-001",
            ErrorCode::SerializationError => "INGEST-002",
            ErrorCode::ConnectivityError => "INGEST-003",
            ErrorCode::ResourceNotFound => "INGEST-004",
            ErrorCode::AccessDenied => "INGEST-005",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::InternalError => "Unexpected internal system error",
            ErrorCode::ValidationError => "Input data failed validation",
            ErrorCode::SerializationError => "Failed to serialize/deserialize data",
            ErrorCode::ConnectivityError => "External service or database is unreachable",
            ErrorCode::ResourceNotFound => "Requested resource was not found",
            ErrorCode::AccessDenied => "Operation not permitted",
        }
    }

    /// Whether failures with this code are worth redelivering when nothing more specific is known.
    pub fn is_retryable_by_default(&self) -> bool {
        matches!(self, ErrorCode::ConnectivityError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failure that has been classified as retryable or fatal.
#[derive(Error, Debug)]
pub enum ClassifiedError {
    /// A transient failure (network blip, database lock, rate limit).
    /// The delivery layer should redeliver the message with backoff.
    #[error("[{code}] {message}")]
    Retryable {
        code: ErrorCode,
        message: String,
        context: ErrorContext,
        #[source]
        cause: Option<BoxError>,
    },
    /// A permanent failure (invalid payload, business rule violation, defect).
    /// The message must not be redelivered and goes to the dead-letter sink instead.
    #[error("[{code}] {message}")]
    Fatal {
        code: ErrorCode,
        message: String,
        context: ErrorContext,
        #[source]
        cause: Option<BoxError>,
    },
}

impl ClassifiedError {
    pub fn retryable(code: ErrorCode, message: impl Into<String>) -> Self {
        ClassifiedError::Retryable {
            code,
            message: message.into(),
            context: ErrorContext::new(),
            cause: None,
        }
    }

    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        ClassifiedError::Fatal {
            code,
            message: message.into(),
            context: ErrorContext::new(),
            cause: None,
        }
    }

    /// Classify using the default class of `code`.
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        if code.is_retryable_by_default() {
            Self::retryable(code, message)
        } else {
            Self::fatal(code, message)
        }
    }

    /// Wrap a failure nobody recognized. Unknown failures are assumed to be defects, so they are
    /// fatal: repeating them would only repeat the defect.
    pub fn internal(cause: impl Into<BoxError>) -> Self {
        let cause = cause.into();
        Self::fatal(ErrorCode::InternalError, cause.to_string()).with_cause(cause)
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_mut().insert(key.into(), value.into());
        self
    }

    /// Attach a truncated copy of the offending payload.
    pub fn with_payload_snippet(self, payload: &[u8]) -> Self {
        self.with_context("payload_snippet", snippet(payload))
    }

    pub fn with_cause(mut self, error: impl Into<BoxError>) -> Self {
        match &mut self {
            ClassifiedError::Retryable { cause, .. } | ClassifiedError::Fatal { cause, .. } => {
                *cause = Some(error.into());
            }
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ClassifiedError::Retryable { code, .. } | ClassifiedError::Fatal { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ClassifiedError::Retryable { message, .. }
            | ClassifiedError::Fatal { message, .. } => message,
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            ClassifiedError::Retryable { context, .. }
            | ClassifiedError::Fatal { context, .. } => context,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ClassifiedError::Retryable { .. })
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            ClassifiedError::Retryable { context, .. }
            | ClassifiedError::Fatal { context, .. } => context,
        }
    }
}

/// Lossy, truncated rendering of a payload that is safe to log.
pub fn snippet(payload: &[u8]) -> String {
    // A UTF-8 character is at most 4 bytes, so this prefix always holds enough characters.
    let prefix = &payload[..payload.len().min(MAX_SNIPPET_CHARS * 4)];

    String::from_utf8_lossy(prefix)
        .chars()
        .take(MAX_SNIPPET_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_is_retryable_by_default() {
        let codes = [
            ErrorCode::InternalError,
            ErrorCode::ValidationError,
            ErrorCode::SerializationError,
            ErrorCode::ConnectivityError,
            ErrorCode::ResourceNotFound,
            ErrorCode::AccessDenied,
        ];

        let retryable: Vec<_> = codes
            .iter()
            .filter(|code| ClassifiedError::from_code(**code, "boom").is_retryable())
            .collect();

        assert_eq!(retryable, vec![&ErrorCode::ConnectivityError]);
    }

    #[test]
    fn test_display_includes_code_and_message() {
        let error = ClassifiedError::fatal(ErrorCode::SerializationError, "bad json");

        assert_eq!(error.to_string(), "[SERIALIZATION_ERROR] bad json");
        assert_eq!(error.code().catalogue_id(), "INGEST-002");
    }

    #[test]
    fn test_internal_wraps_cause_as_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let error = ClassifiedError::internal(io);

        assert!(!error.is_retryable());
        assert_eq!(error.code(), ErrorCode::InternalError);
        assert_eq!(error.message(), "disk on fire");
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_context_accumulates() {
        let error = ClassifiedError::retryable(ErrorCode::ConnectivityError, "pool timed out")
            .with_context("table", "profiles")
            .with_context("operation", "SELECT");

        assert!(error.is_retryable());
        assert_eq!(error.context().get("table").map(String::as_str), Some("profiles"));
        assert_eq!(error.context().len(), 2);
    }

    #[test]
    fn test_payload_snippet_is_truncated() {
        let payload = "x".repeat(MAX_SNIPPET_CHARS * 3);
        let error = ClassifiedError::fatal(ErrorCode::SerializationError, "too long")
            .with_payload_snippet(payload.as_bytes());

        let stored = &error.context()["payload_snippet"];
        assert_eq!(stored.chars().count(), MAX_SNIPPET_CHARS);
    }

    #[test]
    fn test_snippet_keeps_multibyte_characters_intact() {
        let payload = "\u{444}".repeat(MAX_SNIPPET_CHARS + 10);

        let rendered = snippet(payload.as_bytes());

        assert_eq!(rendered.chars().count(), MAX_SNIPPET_CHARS);
        assert!(rendered.chars().all(|c| c == '\u{444}'));
    }

    #[test]
    fn test_snippet_of_short_and_invalid_payloads() {
        assert_eq!(snippet(b"{}"), "{}");
        assert_eq!(snippet(b"ok\xffok"), "ok\u{FFFD}ok");
        assert_eq!(snippet(&[0xff; MAX_SNIPPET_CHARS * 10]).chars().count(), MAX_SNIPPET_CHARS);
    }

    #[test]
    fn test_error_code_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::ResourceNotFound).unwrap();
        assert_eq!(json, "\"RESOURCE_NOT_FOUND\"");
    }
}
