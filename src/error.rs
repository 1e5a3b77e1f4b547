//! Error types for detonator

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the detonator Error
pub type Result<T> = std::result::Result<T, Error>;

/// Stable failure identifiers carried on VM results and API error bodies.
///
/// These are part of the external contract: clients match on them, so the
/// serialized names never change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Submission rejected: the work queue is at capacity.
    QueueFull,
    /// Upload failed validation (size, type).
    InvalidSample,
    /// A requested VM is not configured.
    VMUnknown,
    /// Snapshot restore, VM start, or guest readiness failed.
    EnvironmentFailed,
    /// Upload into the guest failed.
    TransferFailed,
    /// Guest credentials were rejected.
    AuthFailed,
    /// Sample execution could not be initiated (and the agent did not consume it).
    DetonationFailed,
    /// The collector could not produce a structured result.
    CollectionFailed,
    /// The collector reached its target but the target is not responding.
    AgentUnavailable,
    /// The VM could not be returned to the off state; it is marked needs-attention.
    CleanupFailed,
    /// Task cancelled by API or deadline.
    Cancelled,
    /// Invariant violation; programming error.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::QueueFull => "QueueFull",
            ErrorKind::InvalidSample => "InvalidSample",
            ErrorKind::VMUnknown => "VMUnknown",
            ErrorKind::EnvironmentFailed => "EnvironmentFailed",
            ErrorKind::TransferFailed => "TransferFailed",
            ErrorKind::AuthFailed => "AuthFailed",
            ErrorKind::DetonationFailed => "DetonationFailed",
            ErrorKind::CollectionFailed => "CollectionFailed",
            ErrorKind::AgentUnavailable => "AgentUnavailable",
            ErrorKind::CleanupFailed => "CleanupFailed",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured API error response: `{"errorKind":"QueueFull","message":"..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "errorKind")]
    pub error_kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind,
            message: message.into(),
        }
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueFull, message)
    }

    pub fn invalid_sample(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidSample, message)
    }

    pub fn vm_unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::VMUnknown, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"errorKind":"Internal","message":"serialization failed"}"#.to_string()
        })
    }
}

/// Errors that can occur in detonator operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Virtualization CLI invocation or parse errors
    #[error("Controller error: {0}")]
    Controller(String),

    /// Guest credentials rejected by the virtualization CLI
    #[error("Guest authentication failed: {0}")]
    Auth(String),

    /// File transfer into the guest failed
    #[error("Guest transfer failed: {0}")]
    Transfer(String),

    /// The VM could not be returned to the off state
    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    /// Guest command construction or interpretation errors
    #[error("Guest error: {0}")]
    Guest(String),

    /// VM pool lease errors
    #[error("Pool error: {0}")]
    Pool(String),

    /// Collector errors
    #[error("Collector error: {0}")]
    Collector(String),

    /// The in-guest agent tooling cannot be reached
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    /// Result store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Submission rejected: the bounded work queue is full
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// A requested VM is not configured
    #[error("Unknown VM: {0}")]
    UnknownVm(String),

    /// HTTP surface errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Timeout waiting for an operation
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invariant violation; programming error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The stable taxonomy identifier for this error, used when an error
    /// must surface on a VM result or an API body.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Internal,
            Error::Controller(_) => ErrorKind::EnvironmentFailed,
            Error::Auth(_) => ErrorKind::AuthFailed,
            Error::Transfer(_) => ErrorKind::TransferFailed,
            Error::Cleanup(_) => ErrorKind::CleanupFailed,
            Error::Guest(_) => ErrorKind::DetonationFailed,
            Error::Pool(_) => ErrorKind::Internal,
            Error::Collector(_) => ErrorKind::CollectionFailed,
            Error::AgentUnavailable(_) => ErrorKind::AgentUnavailable,
            Error::Store(_) => ErrorKind::Internal,
            Error::QueueFull(_) => ErrorKind::QueueFull,
            Error::UnknownVm(_) => ErrorKind::VMUnknown,
            Error::Server(_) => ErrorKind::Internal,
            Error::Io(_) => ErrorKind::Internal,
            Error::Serde(_) => ErrorKind::Internal,
            Error::Timeout(_) => ErrorKind::EnvironmentFailed,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}
