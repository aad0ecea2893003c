//! # instrument-health-core
//!
//! Core types for instrument health tracking.
//!
//! This crate contains all fundamental types with **no internal dependencies**
//! on other instrument-health crates. It provides:
//!
//! - Identity types (SessionIdentity, InstanceId, OwnerMarker)
//! - Status types (SessionStatus, StatusRecord)
//! - Status events and the pure transition table
//! - Recovery and alert policies
//! - Error types and failure classification
//! - YAML configuration
//!
//! ## Architecture
//!
//! This is Layer 0 in the architecture - all other crates depend on this one,
//! but this crate has no dependencies on other instrument-health crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod policy;
pub mod status;
pub mod transition;

// Re-export commonly used types
pub use config::{
    AlertSettings, BackoffKind, HealthConfig, MonitorSettings, ReconcileSettings,
    RecoverySettings,
};
pub use error::{
    ClassifyFailure, Error, FailureClass, InstrumentError, RecoveryError, Result,
};
pub use event::StatusEvent;
pub use identity::{DeviceAddress, InstanceId, OwnerMarker, SessionDescriptor, SessionIdentity};
pub use policy::{parse_categories, AlertPolicy, PreRetryAction, RecoveryPolicy, RetryDelay};
pub use status::{DisconnectCause, SessionStatus, StatusRecord};
pub use transition::{apply, next_status, TransitionGuard};
