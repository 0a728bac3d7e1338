//! Error taxonomy for ETL orchestration
//!
//! Each failure class has its own type so callers can match on it; `EtlError`
//! wraps them all for code that only propagates.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for ETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Main error type for ETL orchestration
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Packaging error: {0}")]
    Packaging(#[from] PackagingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Timed out after {0:?} waiting for the pod")]
    Timeout(Duration),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("ETL '{0}' already exists with a different spec")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EtlError {
    /// Whether this error should count against the pod's liveness budget.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EtlError::Timeout(_))
    }

    /// Whether the pod behind the channel can no longer serve transfers.
    pub fn is_fatal_transport(&self) -> bool {
        matches!(self, EtlError::Transport(e) if e.is_fatal())
    }
}

/// Rejections raised while validating a raw ETL spec.
///
/// Never retried automatically; no pod is created for an invalid spec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("ETL name '{name}' {reason}")]
    InvalidName { name: String, reason: String },

    #[error("communication type '{given}' should be one of: {supported}")]
    UnknownCommMode { given: String, supported: String },

    #[error("runtime '{given}' is not supported (supported versions: {})", .supported.join(", "))]
    UnsupportedRuntime {
        given: String,
        supported: Vec<String>,
    },

    #[error("invalid {field} '{value}': {reason}")]
    InvalidTimeout {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("argument type '{given}' should be one of: \"\", url")]
    InvalidArgType { given: String },

    #[error("{0}")]
    Incompatible(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),
}

/// Structural problems with user code handed to the packager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackagingError {
    #[error("transform payload is not valid base64: {0}")]
    UndecodablePayload(String),

    #[error("transform payload is empty")]
    EmptyPayload,

    #[error("'{0}' is not a valid module name")]
    InvalidModuleName(String),

    #[error("runtime '{given}' is not supported (supported versions: {})", .supported.join(", "))]
    UnsupportedRuntime {
        given: String,
        supported: Vec<String>,
    },
}

/// Connection or process failures during data exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection to pod lost: {0}")]
    ConnectionLost(String),

    #[error("pod process exited: {0}")]
    ProcessExited(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("channel is closed")]
    Closed,

    #[error("pod rejected transfer with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("no transfer in flight for handle {0}")]
    UnknownHandle(u64),
}

impl TransportError {
    /// Errors after which the pod cannot serve further transfers.
    ///
    /// A rejected transfer or an unknown handle only affects one call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost(_)
                | TransportError::ProcessExited(_)
                | TransportError::MalformedFrame(_)
        )
    }
}

/// Invalid lifecycle requests. A no-op or rejection, never a crash.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("cannot move pod from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("ETL '{0}' is not running")]
    NotRunning(String),

    #[error("ETL '{0}' still has active pods")]
    StillActive(String),

    #[error("transfer {0} belongs to a pod that is no longer running")]
    LateCallback(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_runtime_lists_versions() {
        let err = ValidationError::UnsupportedRuntime {
            given: "3.8".into(),
            supported: vec!["3.9".into(), "3.13".into()],
        };
        assert_eq!(
            err.to_string(),
            "runtime '3.8' is not supported (supported versions: 3.9, 3.13)"
        );
    }

    #[test]
    fn test_error_conversion_keeps_class() {
        let err: EtlError = TransportError::Closed.into();
        assert!(matches!(err, EtlError::Transport(TransportError::Closed)));
        assert!(!err.is_fatal_transport());

        let err: EtlError = TransportError::ProcessExited("exit status: 1".into()).into();
        assert!(err.is_fatal_transport());
        assert!(EtlError::Timeout(Duration::from_secs(1)).is_timeout());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: EtlError = io_err.into();
        assert!(matches!(err, EtlError::Io(_)));
    }
}
