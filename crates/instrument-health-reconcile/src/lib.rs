//! # instrument-health-reconcile
//!
//! Liveness reconciliation for instrument sessions.
//!
//! This crate provides:
//! - The reconciliation loop, which turns probe results into status events
//! - The startup stale pass over records persisted by other processes
//! - Liveness and activity capabilities plus built-in TCP-port and process
//!   probes
//!
//! ## Architecture
//!
//! This is Layer 2 in the architecture - it depends on instrument-health-core
//! and instrument-health-registry and runs beside the recovery crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod probe;
pub mod reconciler;

// Re-export commonly used types
pub use probe::{
    ActivitySignal, ActivitySource, LivenessProbe, OwnerLiveness, ProcessLiveness, TcpPortProbe,
};
pub use reconciler::{BackendRule, ReconcileReport, Reconciler, Watch};
