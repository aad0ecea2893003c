//! Instrument Health Monitor Library
//!
//! This library contains the monitor service and the MCP protocol layer
//! types and handlers. The actual server binary is in main.rs.

pub mod monitor;
pub mod protocol;
pub mod tools;

// Re-export commonly used types
pub use monitor::{HealthMonitor, DEFAULT_CLEAR};
pub use protocol::HealthMcpServer;
pub use tools::*;
