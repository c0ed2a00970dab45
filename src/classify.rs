//! Error classification for provider responses.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failed provider call is treated by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Quota exceeded. Expected under load, always retry-eligible.
    Throttled,
    /// Network or service hiccup. Retry-eligible with a shorter budget.
    Transient,
    /// Malformed input, unsupported document and the like. Never retried.
    Permanent,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Throttled => "throttled",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified error returned by the extraction service.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{class} error {code}: {message}")]
pub struct ServiceError {
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
}

impl ServiceError {
    /// Build an error from a provider error code, classifying it.
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            class: classify_error_code(&code),
            code,
            message: message.into(),
        }
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::from_code("ThrottlingException", message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            code: "Transient".to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Map a provider error code to its retry class.
///
/// Unknown codes are permanent: only errors known to clear on their own are
/// worth spending quota on again.
pub fn classify_error_code(code: &str) -> ErrorClass {
    match code {
        "ThrottlingException"
        | "ProvisionedThroughputExceededException"
        | "LimitExceededException"
        | "TooManyRequestsException"
        | "RequestLimitExceeded"
        | "SlowDown" => ErrorClass::Throttled,

        "InternalServerError"
        | "InternalFailure"
        | "ServiceUnavailable"
        | "ServiceUnavailableException"
        | "RequestTimeout"
        | "RequestTimeoutException"
        | "ConnectionReset"
        | "ConnectionTimeout"
        | "Transient" => ErrorClass::Transient,

        _ => ErrorClass::Permanent,
    }
}
