//! Property-based tests for the status transition table.

use chrono::Utc;
use proptest::prelude::*;
use uuid::Uuid;

use instrument_health_core::{
    apply, next_status, OwnerMarker, SessionDescriptor, SessionIdentity, SessionStatus,
    StatusEvent, StatusRecord, TransitionGuard,
};

/// Generate any status event.
fn any_event() -> impl Strategy<Value = StatusEvent> {
    let text = "[a-z ]{0,12}";
    prop_oneof![
        Just(StatusEvent::construction()),
        Just(StatusEvent::HandshakeSucceeded),
        text.prop_map(|error| StatusEvent::HandshakeFailed { error }),
        text.prop_map(|error| StatusEvent::RecoverableFailure { error }),
        text.prop_map(|error| StatusEvent::RetriesExhausted { error }),
        text.prop_map(|error| StatusEvent::FatalFailure { error }),
        Just(StatusEvent::RecoverySucceeded),
        proptest::option::of(text).prop_map(|error| StatusEvent::Closed { error }),
        text.prop_map(|reason| StatusEvent::BackendUnreachable { reason }),
        Just(StatusEvent::BackendReachable),
        text.prop_map(|reason| StatusEvent::OwnerDead { reason }),
        Just(StatusEvent::Released),
    ]
}

fn owner() -> OwnerMarker {
    OwnerMarker::new(7, Uuid::from_u128(7))
}

fn identity() -> SessionIdentity {
    SessionIdentity::resolved("SP_2150", "ASRL3::INSTR").unwrap()
}

fn start() -> StatusRecord {
    apply(
        None,
        &identity(),
        StatusEvent::ConstructionStarted {
            descriptor: SessionDescriptor::new("SP-2150", "Monochromator"),
            note: None,
        },
        &owner(),
        Utc::now(),
    )
    .unwrap()
}

proptest! {
    /// Applying a sequence agrees with folding `next_status` over it.
    #[test]
    fn apply_agrees_with_next_status(events in prop::collection::vec(any_event(), 0..40)) {
        let mut record = start();
        let mut expected = SessionStatus::Connecting;

        for event in events {
            let guard = TransitionGuard::owned(record.disconnect_cause());
            let next = next_status(Some(expected), &event, guard);
            match apply(Some(&record), &identity(), event, &owner(), Utc::now()) {
                Some(updated) => {
                    prop_assert_eq!(Some(updated.status()), next);
                    expected = updated.status();
                    record = updated;
                }
                None => prop_assert_eq!(next, None),
            }
            prop_assert_eq!(record.status(), expected);
        }
    }

    /// Only construction creates a record from nothing.
    #[test]
    fn only_construction_creates(event in any_event()) {
        let created = apply(None, &identity(), event.clone(), &owner(), Utc::now());
        let is_construction = matches!(event, StatusEvent::ConstructionStarted { .. });
        prop_assert_eq!(created.is_some(), is_construction);
    }

    /// Terminal statuses are left only by construction or, from
    /// DISCONNECTED, by a reachable probe or a dead owner.
    #[test]
    fn terminal_statuses_hold(events in prop::collection::vec(any_event(), 0..40)) {
        let mut record = start();
        for event in events {
            let before = record.status();
            let name = event.name();
            if let Some(updated) = apply(Some(&record), &identity(), event, &owner(), Utc::now()) {
                if before.is_terminal() {
                    prop_assert!(matches!(
                        name,
                        "construction_started" | "backend_reachable" | "owner_dead"
                    ));
                }
                record = updated;
            }
        }
    }

    /// The instance only changes on construction.
    #[test]
    fn instance_changes_only_on_construction(events in prop::collection::vec(any_event(), 0..40)) {
        let mut record = start();
        for event in events {
            let is_construction = matches!(event, StatusEvent::ConstructionStarted { .. });
            if let Some(updated) = apply(Some(&record), &identity(), event, &owner(), Utc::now()) {
                prop_assert_eq!(updated.instance() != record.instance(), is_construction);
                record = updated;
            }
        }
    }
}
