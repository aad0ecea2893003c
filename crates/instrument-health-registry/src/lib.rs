//! # instrument-health-registry
//!
//! Status registry for instrument sessions.
//!
//! This crate provides:
//! - The status registry, the single owner of status records
//! - Snapshot persistence (JSON file, in-memory)
//! - Display publishers
//! - The alert policy gate and alert dispatchers
//!
//! ## Architecture
//!
//! This is Layer 1 in the architecture - it depends on instrument-health-core
//! and is shared by the recovery, reconciliation and monitor crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alert;
pub mod publisher;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use alert::{should_alert, AlertDispatcher, AlertGate, AlertRequest, LogDispatcher};
pub use publisher::{BroadcastPublisher, StatusPublisher, StatusUpdate};
pub use registry::{RegistryConfig, StatusRegistry};
pub use store::{JsonFileStore, MemoryStore, PersistedSnapshot, SnapshotStore, SNAPSHOT_VERSION};
