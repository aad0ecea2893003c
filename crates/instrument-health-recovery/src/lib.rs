//! # instrument-health-recovery
//!
//! Retry and recovery for instrument sessions.
//!
//! This crate provides:
//! - The [`Instrument`] driver seam and named operation tables
//! - The recovery manager: bounded retries with reset/reconnect between them
//! - [`ManagedSession`], which wraps a driver and reports its lifecycle to
//!   the status registry
//!
//! ## Architecture
//!
//! This is Layer 2 in the architecture - it depends on instrument-health-core
//! and instrument-health-registry.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod instrument;
pub mod managed;
pub mod manager;

// Re-export commonly used types
pub use cancel::Cancellation;
pub use instrument::{
    Instrument, Operation, OperationFn, OperationTable, RESERVED_OPERATION_NAMES,
};
pub use managed::{ManagedSession, SafeCalls, SessionOptions, SessionSpec};
pub use manager::{Outcome, RecoveryManager, ReportTarget};
