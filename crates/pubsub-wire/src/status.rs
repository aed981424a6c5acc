// RPC status codes and the structured error details attached to ack failures.
use std::collections::HashMap;
use std::fmt;

/// Canonical RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error detail. For acknowledgement failures the service keys
/// `metadata` by ack id, with values such as `TRANSIENT_FAILURE_UNORDERED_ACK_ID`
/// or `PERMANENT_FAILURE_INVALID_ACK_ID`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    pub reason: String,
    pub domain: String,
    pub metadata: HashMap<String, String>,
}

/// Failed RPC outcome.
///
/// ```
/// use pubsub_wire::{Code, Status};
///
/// let status = Status::new(Code::Unavailable, "try again");
/// assert!(status.is_retryable());
/// assert_eq!(status.to_string(), "UNAVAILABLE: try again");
/// ```
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
    pub details: Option<ErrorInfo>,
}

const SHUTDOWN_NOW_MESSAGE: &str = "Server shutdownNow invoked";

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.details = Some(info);
        self
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn error_info(&self) -> Option<&ErrorInfo> {
        self.details.as_ref()
    }

    /// Whether a stream or unary call failing with this status may be retried.
    ///
    /// An `UNAVAILABLE` produced by a server that is being torn down is final.
    pub fn is_retryable(&self) -> bool {
        match self.code {
            Code::DeadlineExceeded
            | Code::Internal
            | Code::Cancelled
            | Code::ResourceExhausted
            | Code::Aborted
            | Code::Unknown => true,
            Code::Unavailable => !self.message.contains(SHUTDOWN_NOW_MESSAGE),
            _ => false,
        }
    }
}
