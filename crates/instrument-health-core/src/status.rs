//! Status types for instrument sessions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::identity::{InstanceId, OwnerMarker, SessionDescriptor, SessionIdentity};
use crate::Error;

/// Connection status of an instrument session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Session constructed, handshake not finished
    Connecting,
    /// Handshake finished, operations succeeding
    Connected,
    /// Recoverable failures observed, recovery in progress
    Warning,
    /// Retries exhausted or fatal failure
    UnrecoverableFailure,
    /// Closed, released, or backend unreachable
    Disconnected,
    /// Owning process is gone
    StaleSession,
}

impl SessionStatus {
    /// Every status, in display order.
    pub const ALL: [SessionStatus; 6] = [
        SessionStatus::Connecting,
        SessionStatus::Connected,
        SessionStatus::Warning,
        SessionStatus::UnrecoverableFailure,
        SessionStatus::Disconnected,
        SessionStatus::StaleSession,
    ];

    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "CONNECTING",
            SessionStatus::Connected => "CONNECTED",
            SessionStatus::Warning => "WARNING",
            SessionStatus::UnrecoverableFailure => "UNRECOVERABLE_FAILURE",
            SessionStatus::Disconnected => "DISCONNECTED",
            SessionStatus::StaleSession => "STALE_SESSION",
        }
    }

    /// `DISCONNECTED` and `STALE_SESSION` end an instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Disconnected | SessionStatus::StaleSession
        )
    }

    /// Statuses that claim an owning process is still driving the session.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionStatus::Connecting | SessionStatus::Connected | SessionStatus::Warning
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_uppercase().replace('-', "_");
        SessionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == token)
            .ok_or_else(|| Error::InvalidCategory(s.to_string()))
    }
}

/// Why a session entered `DISCONNECTED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    /// Explicit `close()`
    Closed,
    /// Dropped without `close()`
    Released,
    /// Reconciliation found the backend unreachable
    Unreachable,
}

/// Current status of one session identity.
///
/// Records are produced only by [`crate::transition::apply`]; nothing edits
/// one in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub(crate) identity: SessionIdentity,
    pub(crate) status: SessionStatus,
    pub(crate) last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) last_error: Option<String>,
    pub(crate) owner: OwnerMarker,
    pub(crate) instance: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) disconnect_cause: Option<DisconnectCause>,
    #[serde(default)]
    pub(crate) descriptor: SessionDescriptor,
}

impl StatusRecord {
    /// Session identity.
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Time of the last accepted transition.
    pub fn last_transition_time(&self) -> DateTime<Utc> {
        self.last_transition_time
    }

    /// Last error text, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Registry instance that owns the record.
    pub fn owner(&self) -> &OwnerMarker {
        &self.owner
    }

    /// Construction instance the record belongs to.
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Why the session disconnected, while `DISCONNECTED`.
    pub fn disconnect_cause(&self) -> Option<DisconnectCause> {
        self.disconnect_cause
    }

    /// Model and device type.
    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(SessionStatus::UnrecoverableFailure.to_string(), "UNRECOVERABLE_FAILURE");
        assert_eq!(SessionStatus::StaleSession.as_str(), "STALE_SESSION");
    }

    #[test]
    fn test_status_parse_is_lenient() {
        assert_eq!(
            " unrecoverable-failure ".parse::<SessionStatus>().unwrap(),
            SessionStatus::UnrecoverableFailure
        );
        assert_eq!("Connected".parse::<SessionStatus>().unwrap(), SessionStatus::Connected);
        assert!(matches!(
            "broken".parse::<SessionStatus>(),
            Err(Error::InvalidCategory(_))
        ));
    }

    #[test]
    fn test_status_serde_matches_display() {
        for status in SessionStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn test_terminal_and_live_sets() {
        let terminal: Vec<_> = SessionStatus::ALL
            .into_iter()
            .filter(SessionStatus::is_terminal)
            .collect();
        assert_eq!(
            terminal,
            vec![SessionStatus::Disconnected, SessionStatus::StaleSession]
        );
        assert!(SessionStatus::Warning.is_live());
        assert!(!SessionStatus::UnrecoverableFailure.is_live());
    }
}
