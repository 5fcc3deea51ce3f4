use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor engine.
///
/// The first six variants form the orchestration failure taxonomy; the rest
/// wrap ambient failures (configuration, serialization, I/O).
#[derive(Error, Debug)]
pub enum ConductorError {
    /// An endpoint or process could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// No reply or completion arrived within the allotted time.
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// No eligible process exists and the pool is at its maximum size.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// The request was malformed (unknown type, cyclic dependency, ...).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The task's own work failed.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A named quality gate rejected the command's output.
    #[error("Quality gate '{gate}' failed: {reason}")]
    QualityGate {
        /// Name of the failing gate.
        gate: String,
        /// Why the gate failed.
        reason: String,
    },

    /// A lookup referenced something that does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Structured kind of a [`ConductorError`], used for retry decisions,
/// reporting categories, and HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`ConductorError::Connection`].
    Connection,
    /// See [`ConductorError::Timeout`].
    Timeout,
    /// See [`ConductorError::Capacity`].
    Capacity,
    /// See [`ConductorError::Validation`].
    Validation,
    /// See [`ConductorError::Execution`].
    Execution,
    /// See [`ConductorError::QualityGate`].
    QualityGate,
    /// See [`ConductorError::NotFound`].
    NotFound,
    /// Configuration, serialization, and I/O failures.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Validation => "validation",
            ErrorKind::Execution => "execution",
            ErrorKind::QualityGate => "quality_gate",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl ConductorError {
    /// The structured kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConductorError::Connection(_) => ErrorKind::Connection,
            ConductorError::Timeout(_) => ErrorKind::Timeout,
            ConductorError::Capacity(_) => ErrorKind::Capacity,
            ConductorError::Validation(_) => ErrorKind::Validation,
            ConductorError::Execution(_) => ErrorKind::Execution,
            ConductorError::QualityGate { .. } => ErrorKind::QualityGate,
            ConductorError::NotFound(_) => ErrorKind::NotFound,
            ConductorError::Config(_) | ConductorError::Json(_) | ConductorError::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether a dispatched task that failed with this error may be requeued.
    ///
    /// Only transport-level failures qualify; validation and the task's own
    /// execution failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Timeout)
    }

    /// Convert into a serializable [`Failure`].
    pub fn to_failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// A terminal failure: structured kind plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Structured failure kind.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl Failure {
    /// Create a failure of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The failure recorded for cooperatively cancelled work.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Execution, "cancelled")
    }

    /// Whether this failure was produced by a cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.message == "cancelled"
    }

    /// Whether the failed work may be requeued (see [`ConductorError::is_retryable`]).
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Connection | ErrorKind::Timeout)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl From<Failure> for ConductorError {
    fn from(failure: Failure) -> Self {
        let message = failure.message;
        match failure.kind {
            ErrorKind::Connection => ConductorError::Connection(message),
            ErrorKind::Timeout => ConductorError::Timeout(message),
            ErrorKind::Capacity => ConductorError::Capacity(message),
            ErrorKind::Validation => ConductorError::Validation(message),
            ErrorKind::Execution => ConductorError::Execution(message),
            ErrorKind::QualityGate => ConductorError::QualityGate {
                gate: "unknown".to_string(),
                reason: message,
            },
            ErrorKind::NotFound => ConductorError::NotFound(message),
            ErrorKind::Internal => ConductorError::Config(message),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConductorError::Timeout("no reply from agent-1".into());
        assert_eq!(err.to_string(), "Timeout error: no reply from agent-1");

        let gate = ConductorError::QualityGate {
            gate: "coverage".into(),
            reason: "62% < 80%".into(),
        };
        assert_eq!(gate.to_string(), "Quality gate 'coverage' failed: 62% < 80%");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ConductorError::Connection("x".into()).is_retryable());
        assert!(ConductorError::Timeout("x".into()).is_retryable());
        assert!(!ConductorError::Execution("x".into()).is_retryable());
        assert!(!ConductorError::Validation("x".into()).is_retryable());
        assert!(!ConductorError::Capacity("x".into()).is_retryable());
    }

    #[test]
    fn test_failure_carries_kind_and_message() {
        let failure = ConductorError::Validation("unknown command type 'FOO'".into()).to_failure();
        assert_eq!(failure.kind, ErrorKind::Validation);
        assert!(failure.message.contains("FOO"));

        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("\"validation\""));
    }

    #[test]
    fn test_cancelled_failure() {
        let failure = Failure::cancelled();
        assert!(failure.is_cancellation());
        assert!(!failure.is_retryable());
    }

    #[test]
    fn test_io_error_is_internal() {
        let err: ConductorError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
