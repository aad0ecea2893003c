//! Instrument Health MCP Server Implementation
//!
//! This module implements the MCP server using rmcp 0.9's #[tool_router] pattern.
//! It routes MCP tool calls to the health monitor.

use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router, ErrorData as McpError,
};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use instrument_health_core::Error;

use crate::monitor::HealthMonitor;
use crate::tools::*;

/// Map a monitor error onto an MCP error.
fn to_mcp_error(e: Error) -> McpError {
    match e {
        Error::SessionNotFound(_)
        | Error::InvalidIdentity(_)
        | Error::InvalidCategory(_)
        | Error::PolicyEditRejected { .. }
        | Error::InvalidInput(_) => {
            warn!("Rejected request: {}", e);
            McpError::new(ErrorCode(-32602), e.to_string(), None) // Invalid params
        }
        other => {
            error!("Request failed: {}", other);
            McpError::new(ErrorCode(-32603), other.to_string(), None) // Internal error
        }
    }
}

fn json_result<T: Serialize>(response: &T, fallback: impl FnOnce() -> String) -> CallToolResult {
    CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(response).unwrap_or_else(|_| fallback()),
    )])
}

/// Instrument Health MCP Server
///
/// Exposes the status registry to a display over MCP tools.
#[derive(Clone)]
pub struct HealthMcpServer {
    /// Monitor shared with the reconciliation loop
    monitor: Arc<HealthMonitor>,
    /// Tool router for handling MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl HealthMcpServer {
    /// Create a server over `monitor`
    pub fn new(monitor: Arc<HealthMonitor>) -> Self {
        Self {
            monitor,
            tool_router: Self::tool_router(),
        }
    }

    /// Monitor behind the server
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// List status entries
    #[tool(description = "List instrument status entries, optionally filtered by status")]
    #[instrument(skip_all)]
    async fn health_status_list(
        &self,
        Parameters(params): Parameters<StatusListParams>,
    ) -> Result<CallToolResult, McpError> {
        debug!("Listing status entries: filter={:?}", params.statuses);

        let response = self.monitor.list(&params).map_err(to_mcp_error)?;
        let count = response.count;
        info!("Found {} status entr(ies)", count);

        Ok(json_result(&response, || format!("{count} entries")))
    }

    /// Get one status entry
    #[tool(description = "Get the status entry of one instrument by identity (instrument:address)")]
    #[instrument(skip_all)]
    async fn health_status_get(
        &self,
        Parameters(params): Parameters<StatusGetParams>,
    ) -> Result<CallToolResult, McpError> {
        debug!("Getting status entry: identity={}", params.identity);

        let entry = self.monitor.get(&params.identity).map_err(to_mcp_error)?;
        Ok(json_result(&entry, || format!("{} is {}", entry.identity, entry.status)))
    }

    /// Remove one status entry
    #[tool(description = "Remove one instrument status entry")]
    #[instrument(skip_all)]
    async fn health_entry_remove(
        &self,
        Parameters(params): Parameters<EntryRemoveParams>,
    ) -> Result<CallToolResult, McpError> {
        info!("Removing status entry: identity={}", params.identity);

        let response = self.monitor.remove(&params.identity).map_err(to_mcp_error)?;
        Ok(json_result(&response, || response.message.clone()))
    }

    /// Clear status entries
    #[tool(
        description = "Remove status entries in the given statuses (default DISCONNECTED and STALE_SESSION; an empty list removes all)"
    )]
    #[instrument(skip_all)]
    async fn health_entries_clear(
        &self,
        Parameters(params): Parameters<EntriesClearParams>,
    ) -> Result<CallToolResult, McpError> {
        info!("Clearing status entries: statuses={:?}", params.statuses);

        let response = self.monitor.clear(&params).map_err(to_mcp_error)?;
        let removed = response.removed;
        Ok(json_result(&response, || format!("{removed} entries removed")))
    }

    /// Show the alert policy
    #[tool(description = "Show the alert policy: enabled flag, default categories and per-identity overrides")]
    #[instrument(skip_all)]
    async fn health_alert_policy_get(
        &self,
        Parameters(_params): Parameters<AlertPolicyGetParams>,
    ) -> Result<CallToolResult, McpError> {
        let response = self.monitor.alert_policy();
        Ok(json_result(&response, || {
            format!("alerts enabled: {}", response.enabled)
        }))
    }

    /// Edit the alert policy
    #[tool(
        description = "Edit the alert policy. Set enabled, default_categories, or categories for one identity; omit categories with an identity to drop its override"
    )]
    #[instrument(skip_all)]
    async fn health_alert_policy_set(
        &self,
        Parameters(params): Parameters<AlertPolicySetParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(
            "Editing alert policy: enabled={:?}, identity={:?}",
            params.enabled, params.identity
        );

        let response = self.monitor.set_alert_policy(&params).map_err(to_mcp_error)?;
        Ok(json_result(&response, || {
            format!("alerts enabled: {}", response.enabled)
        }))
    }

    /// Reconcile now
    #[tool(description = "Run the stale-owner check and one liveness reconciliation pass now")]
    #[instrument(skip_all)]
    async fn health_reconcile(
        &self,
        Parameters(_params): Parameters<ReconcileParams>,
    ) -> Result<CallToolResult, McpError> {
        let response = self.monitor.reconcile().await;
        info!(
            "Reconciled: stale={}, transitions={}",
            response.stale, response.transitions
        );
        Ok(json_result(&response, || {
            format!("{} stale, {} transitions", response.stale, response.transitions)
        }))
    }
}

// Implement the ServerHandler trait to define server capabilities
#[tool_handler]
impl rmcp::ServerHandler for HealthMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Instrument Health Monitor - Inspect and manage the health status of \
                 laboratory instrument sessions. Use health_status_list to see every \
                 session, health_entries_clear to drop stale or disconnected entries, \
                 and health_alert_policy_set to choose which statuses send alerts."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
