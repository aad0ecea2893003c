//! Status events fed into the transition table.

use crate::identity::SessionDescriptor;

/// Something that happened to a session.
///
/// Events come from three places: the session façade (construction,
/// handshake, close, release), the recovery manager (operation outcomes), and
/// reconciliation (reachability, dead owners).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// A session object is being constructed for the identity
    ConstructionStarted {
        /// Model and device type of the new session
        descriptor: SessionDescriptor,
        /// Optional progress note shown while connecting
        note: Option<String>,
    },
    /// Handshake completed
    HandshakeSucceeded,
    /// Handshake failed and cannot be retried further
    HandshakeFailed {
        /// Error text
        error: String,
    },
    /// An operation failed and will be retried
    RecoverableFailure {
        /// Error text
        error: String,
    },
    /// An operation failed on its final attempt
    RetriesExhausted {
        /// Error text
        error: String,
    },
    /// An operation failed with a non-retryable error
    FatalFailure {
        /// Error text
        error: String,
    },
    /// An operation succeeded after at least one retry
    RecoverySucceeded,
    /// The session was closed explicitly
    Closed {
        /// Error raised by the session's own close, if any
        error: Option<String>,
    },
    /// Reconciliation found the backend unreachable
    BackendUnreachable {
        /// Probe detail
        reason: String,
    },
    /// Reconciliation found the backend reachable again
    BackendReachable,
    /// The owning process of a persisted record is gone
    OwnerDead {
        /// Detail stored as last error when none is set
        reason: String,
    },
    /// The session was dropped without an explicit close
    Released,
}

impl StatusEvent {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::ConstructionStarted { .. } => "construction_started",
            StatusEvent::HandshakeSucceeded => "handshake_succeeded",
            StatusEvent::HandshakeFailed { .. } => "handshake_failed",
            StatusEvent::RecoverableFailure { .. } => "recoverable_failure",
            StatusEvent::RetriesExhausted { .. } => "retries_exhausted",
            StatusEvent::FatalFailure { .. } => "fatal_failure",
            StatusEvent::RecoverySucceeded => "recovery_succeeded",
            StatusEvent::Closed { .. } => "closed",
            StatusEvent::BackendUnreachable { .. } => "backend_unreachable",
            StatusEvent::BackendReachable => "backend_reachable",
            StatusEvent::OwnerDead { .. } => "owner_dead",
            StatusEvent::Released => "released",
        }
    }

    /// Shorthand for a construction event with a default descriptor.
    pub fn construction() -> Self {
        StatusEvent::ConstructionStarted {
            descriptor: SessionDescriptor::default(),
            note: None,
        }
    }
}
