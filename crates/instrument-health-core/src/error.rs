//! Error types for instrument health tracking.

use std::fmt;

use thiserror::Error;

use crate::identity::SessionIdentity;
use crate::status::SessionStatus;

/// Main error type for registry, configuration and façade operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No record for the identity
    #[error("Session not found: {0}")]
    SessionNotFound(SessionIdentity),

    /// Identity text or parts are malformed
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Unknown status category name
    #[error("Invalid status category: {0}")]
    InvalidCategory(String),

    /// Alert policy edits only target sessions still present and active
    #[error("Alert policy edit rejected for {identity}: session is {status}")]
    PolicyEditRejected {
        /// Target identity
        identity: SessionIdentity,
        /// Its current status
        status: SessionStatus,
    },

    /// Operation name collides with a façade entry point
    #[error("Operation name is reserved: {0}")]
    ReservedOperationName(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input or parameters (generic)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic error with custom message
    #[error("{0}")]
    Other(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Whether retrying can fix a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Expected to clear with retry, reset or reconnect
    Recoverable,
    /// Retrying cannot help
    Fatal,
}

/// Classification supplied with an operation's error type.
pub trait ClassifyFailure {
    /// Classify this failure.
    fn failure_class(&self) -> FailureClass;
}

/// Failures reported by instrument sessions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentError {
    /// Device did not answer in time
    #[error("Device timed out: {0}")]
    Timeout(String),

    /// Bus or device busy
    #[error("Device busy: {0}")]
    Busy(String),

    /// Transient transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection could not be established or was lost
    #[error("Device connection failed: {0}")]
    ConnectionFailed(String),

    /// Command failed on the device
    #[error("Device operation failed: {0}")]
    Operation(String),

    /// Device reported state that contradicts the command
    #[error("Device state inconsistent: {0}")]
    Inconsistent(String),

    /// Caller passed an invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not supported by this session
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl ClassifyFailure for InstrumentError {
    fn failure_class(&self) -> FailureClass {
        match self {
            InstrumentError::Timeout(_)
            | InstrumentError::Busy(_)
            | InstrumentError::Transport(_)
            | InstrumentError::ConnectionFailed(_)
            | InstrumentError::Operation(_) => FailureClass::Recoverable,
            InstrumentError::Inconsistent(_)
            | InstrumentError::InvalidArgument(_)
            | InstrumentError::Unsupported(_) => FailureClass::Fatal,
        }
    }
}

impl ClassifyFailure for std::io::Error {
    fn failure_class(&self) -> FailureClass {
        use std::io::ErrorKind;

        match self.kind() {
            ErrorKind::InvalidInput
            | ErrorKind::InvalidData
            | ErrorKind::NotFound
            | ErrorKind::PermissionDenied
            | ErrorKind::Unsupported => FailureClass::Fatal,
            _ => FailureClass::Recoverable,
        }
    }
}

impl From<std::io::Error> for InstrumentError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => InstrumentError::Timeout(err.to_string()),
            ErrorKind::InvalidInput => InstrumentError::InvalidArgument(err.to_string()),
            ErrorKind::Unsupported => InstrumentError::Unsupported(err.to_string()),
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
                InstrumentError::ConnectionFailed(err.to_string())
            }
            _ => InstrumentError::Transport(err.to_string()),
        }
    }
}

/// Error returned by a recovery-managed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError<E> {
    /// Every allowed attempt failed with a recoverable error
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        last: E,
    },
    /// A fatal error stopped the call without retrying
    Fatal(E),
    /// The session was closed while the call was retrying
    Cancelled,
    /// The session was already closed
    Closed,
}

impl<E> RecoveryError<E> {
    /// The underlying operation error, if the call reached the device.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            RecoveryError::Exhausted { last, .. } => Some(last),
            RecoveryError::Fatal(err) => Some(err),
            RecoveryError::Cancelled | RecoveryError::Closed => None,
        }
    }

    /// Consume and return the underlying operation error.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            RecoveryError::Exhausted { last, .. } => Some(last),
            RecoveryError::Fatal(err) => Some(err),
            RecoveryError::Cancelled | RecoveryError::Closed => None,
        }
    }

    /// Whether retries were exhausted.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RecoveryError::Exhausted { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RecoveryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryError::Exhausted { attempts, last } => {
                write!(f, "Operation failed after {attempts} attempt(s): {last}")
            }
            RecoveryError::Fatal(err) => write!(f, "Fatal operation failure: {err}"),
            RecoveryError::Cancelled => write!(f, "Recovery cancelled: session closed"),
            RecoveryError::Closed => write!(f, "Session already closed"),
        }
    }
}

impl<E> std::error::Error for RecoveryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.operation_error()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_not_found_error() {
        let identity = SessionIdentity::resolved("PM100D", "P1").unwrap();
        let err = Error::SessionNotFound(identity);
        assert_eq!(err.to_string(), "Session not found: PM100D:P1");
    }

    #[test]
    fn test_policy_edit_rejected_error() {
        let err = Error::PolicyEditRejected {
            identity: SessionIdentity::resolved("PM100D", "P1").unwrap(),
            status: SessionStatus::Disconnected,
        };
        assert_eq!(
            err.to_string(),
            "Alert policy edit rejected for PM100D:P1: session is DISCONNECTED"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_err = serde_json::from_str::<i32>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_instrument_error_classification() {
        assert_eq!(
            InstrumentError::Timeout("read".into()).failure_class(),
            FailureClass::Recoverable
        );
        assert_eq!(
            InstrumentError::Busy("bus".into()).failure_class(),
            FailureClass::Recoverable
        );
        assert_eq!(
            InstrumentError::InvalidArgument("wavelength".into()).failure_class(),
            FailureClass::Fatal
        );
        assert_eq!(
            InstrumentError::Unsupported("home".into()).failure_class(),
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_io_error_into_instrument_error() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        assert!(matches!(InstrumentError::from(timeout), InstrumentError::Timeout(_)));
        let invalid = std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad");
        let err = InstrumentError::from(invalid);
        assert_eq!(err.failure_class(), FailureClass::Fatal);
    }

    #[test]
    fn test_recovery_error_display_and_source() {
        let err = RecoveryError::Exhausted {
            attempts: 3,
            last: InstrumentError::Timeout("read".into()),
        };
        assert_eq!(
            err.to_string(),
            "Operation failed after 3 attempt(s): Device timed out: read"
        );
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.is_exhausted());

        let cancelled: RecoveryError<InstrumentError> = RecoveryError::Cancelled;
        assert!(std::error::Error::source(&cancelled).is_none());
        assert_eq!(cancelled.into_operation_error(), None);
    }
}
