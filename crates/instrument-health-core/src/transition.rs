//! The session status state machine.
//!
//! | Event | From | To |
//! |---|---|---|
//! | construction started | none or any (supersedes) | CONNECTING |
//! | handshake succeeded | CONNECTING | CONNECTED |
//! | handshake failed | CONNECTING | UNRECOVERABLE_FAILURE |
//! | recoverable failure | CONNECTING, CONNECTED, WARNING | WARNING |
//! | retries exhausted / fatal failure | CONNECTING, CONNECTED, WARNING | UNRECOVERABLE_FAILURE |
//! | recovery succeeded | CONNECTING, WARNING | CONNECTED |
//! | closed / released / backend unreachable | any non-terminal | DISCONNECTED |
//! | backend reachable | DISCONNECTED by unreachable, same owner | CONNECTING |
//! | owner dead | any but STALE_SESSION | STALE_SESSION |
//!
//! Every other pair is a no-op.
//!
//! Operation outcomes only reach a CONNECTING record once reconciliation has
//! revived it; the construction handshake reports through the handshake
//! events. The first outcome after revival settles the record.

use chrono::{DateTime, Utc};

use crate::event::StatusEvent;
use crate::identity::{InstanceId, OwnerMarker, SessionIdentity};
use crate::status::{DisconnectCause, SessionStatus, StatusRecord};

/// Facts about the current record, besides its status, that the table reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionGuard {
    /// The record is owned by the registry applying the event
    pub owned_by_current: bool,
    /// Disconnect cause of the current record
    pub disconnect_cause: Option<DisconnectCause>,
}

impl TransitionGuard {
    /// Guard for a record owned by the applying registry.
    pub fn owned(disconnect_cause: Option<DisconnectCause>) -> Self {
        Self {
            owned_by_current: true,
            disconnect_cause,
        }
    }
}

/// Compute the status `event` leads to from `from`, or `None` for a no-op.
pub fn next_status(
    from: Option<SessionStatus>,
    event: &StatusEvent,
    guard: TransitionGuard,
) -> Option<SessionStatus> {
    use SessionStatus::*;

    match (from, event) {
        (_, StatusEvent::ConstructionStarted { .. }) => Some(Connecting),
        (None, _) => None,
        (Some(Connecting), StatusEvent::HandshakeSucceeded) => Some(Connected),
        (Some(Connecting), StatusEvent::HandshakeFailed { .. }) => Some(UnrecoverableFailure),
        (Some(Connecting | Connected | Warning), StatusEvent::RecoverableFailure { .. }) => {
            Some(Warning)
        }
        (
            Some(Connecting | Connected | Warning),
            StatusEvent::RetriesExhausted { .. } | StatusEvent::FatalFailure { .. },
        ) => Some(UnrecoverableFailure),
        (Some(Connecting | Warning), StatusEvent::RecoverySucceeded) => Some(Connected),
        (
            Some(status),
            StatusEvent::Closed { .. }
            | StatusEvent::BackendUnreachable { .. }
            | StatusEvent::Released,
        ) if !status.is_terminal() => Some(Disconnected),
        (Some(Disconnected), StatusEvent::BackendReachable)
            if guard.owned_by_current
                && guard.disconnect_cause == Some(DisconnectCause::Unreachable) =>
        {
            Some(Connecting)
        }
        (Some(status), StatusEvent::OwnerDead { .. }) if status != StaleSession => {
            Some(StaleSession)
        }
        _ => None,
    }
}

/// Apply `event` to `current`, producing the next record.
///
/// Returns `None` when the event is not valid for the current status; the
/// caller must then leave the stored record untouched. `owner` is the marker
/// of the registry applying the event.
pub fn apply(
    current: Option<&StatusRecord>,
    identity: &SessionIdentity,
    event: StatusEvent,
    owner: &OwnerMarker,
    now: DateTime<Utc>,
) -> Option<StatusRecord> {
    let guard = current
        .map(|record| TransitionGuard {
            owned_by_current: record.owner == *owner,
            disconnect_cause: record.disconnect_cause,
        })
        .unwrap_or_default();
    let next = next_status(current.map(|record| record.status), &event, guard)?;

    if let StatusEvent::ConstructionStarted { descriptor, note } = event {
        return Some(StatusRecord {
            identity: identity.clone(),
            status: next,
            last_transition_time: now,
            last_error: note.filter(|n| !n.trim().is_empty()),
            owner: *owner,
            instance: InstanceId::new(),
            disconnect_cause: None,
            descriptor,
        });
    }

    let mut record = current?.clone();
    record.status = next;
    record.last_transition_time = now;
    record.disconnect_cause = None;

    match event {
        StatusEvent::HandshakeSucceeded
        | StatusEvent::RecoverySucceeded
        | StatusEvent::BackendReachable => record.last_error = None,
        StatusEvent::HandshakeFailed { error }
        | StatusEvent::RecoverableFailure { error }
        | StatusEvent::RetriesExhausted { error }
        | StatusEvent::FatalFailure { error } => record.last_error = Some(error),
        StatusEvent::Closed { error } => {
            record.last_error = error;
            record.disconnect_cause = Some(DisconnectCause::Closed);
        }
        StatusEvent::Released => record.disconnect_cause = Some(DisconnectCause::Released),
        StatusEvent::BackendUnreachable { reason } => {
            record.last_error = Some(reason);
            record.disconnect_cause = Some(DisconnectCause::Unreachable);
        }
        StatusEvent::OwnerDead { reason } => {
            if record.last_error.is_none() {
                record.last_error = Some(reason);
            }
        }
        StatusEvent::ConstructionStarted { .. } => {}
    }

    Some(record)
}
