//! MCP tool parameter and response types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use instrument_health_core::{AlertPolicy, DisconnectCause, SessionStatus, StatusRecord};

// =============================================================================
// Status Tools
// =============================================================================

/// One registry entry as shown to the display.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StatusEntry {
    /// Identity, `instrument:address`
    pub identity: String,

    /// Instrument type
    pub instrument: String,

    /// Serial number or transport address
    pub address: String,

    /// Current status
    pub status: SessionStatus,

    /// Last transition, RFC 3339 UTC
    pub updated: String,

    /// Most recent error or progress note
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Device model
    pub model: String,

    /// Device family
    pub device_type: String,

    /// Process id of the writer, 0 when unknown
    pub owner_process_id: u32,

    /// Writer marker
    pub owner: String,

    /// Construction instance
    pub instance: String,

    /// Why the session is disconnected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect_cause: Option<DisconnectCause>,
}

impl From<&StatusRecord> for StatusEntry {
    fn from(record: &StatusRecord) -> Self {
        let descriptor = record.descriptor();
        Self {
            identity: record.identity().to_string(),
            instrument: record.identity().instrument().to_string(),
            address: record.identity().address().to_string(),
            status: record.status(),
            updated: record
                .last_transition_time()
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            last_error: record.last_error().map(str::to_string),
            model: descriptor.model.clone(),
            device_type: descriptor.device_type.clone(),
            owner_process_id: record.owner().process_id,
            owner: record.owner().to_string(),
            instance: record.instance().to_string(),
            disconnect_cause: record.disconnect_cause(),
        }
    }
}

/// Parameters for health_status_list
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StatusListParams {
    /// Only entries in these statuses (e.g. "WARNING"); all when omitted
    #[serde(default)]
    pub statuses: Option<Vec<String>>,
}

/// Response for health_status_list
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StatusListResponse {
    /// Entries sorted by identity
    pub entries: Vec<StatusEntry>,

    /// Number of entries
    pub count: usize,

    /// Entries per status
    pub summary: Vec<StatusCount>,
}

/// Number of entries in one status.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StatusCount {
    /// Status
    pub status: SessionStatus,

    /// Entries in it
    pub count: usize,
}

/// Parameters for health_status_get
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StatusGetParams {
    /// Identity, `instrument:address`
    pub identity: String,
}

// =============================================================================
// Cleanup Tools
// =============================================================================

/// Parameters for health_entry_remove
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EntryRemoveParams {
    /// Identity, `instrument:address`
    pub identity: String,
}

/// Response for health_entry_remove
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EntryRemoveResponse {
    /// Removed entry
    pub removed: StatusEntry,

    /// Confirmation message
    pub message: String,
}

/// Parameters for health_entries_clear
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EntriesClearParams {
    /// Statuses to clear. Defaults to DISCONNECTED and STALE_SESSION;
    /// an empty list clears every entry
    #[serde(default)]
    pub statuses: Option<Vec<String>>,
}

/// Response for health_entries_clear
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EntriesClearResponse {
    /// Number of entries removed
    pub removed: usize,

    /// Statuses that were cleared; empty means all
    pub statuses: Vec<SessionStatus>,
}

// =============================================================================
// Alert Policy Tools
// =============================================================================

/// Parameters for health_alert_policy_get
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AlertPolicyGetParams {}

/// Categories for one identity.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AlertOverride {
    /// Identity, `instrument:address`
    pub identity: String,

    /// Statuses that alert for this identity
    pub categories: Vec<SessionStatus>,
}

/// Response for the alert policy tools
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AlertPolicyResponse {
    /// Whether alerts are sent at all
    pub enabled: bool,

    /// Statuses that alert when no override exists
    pub default_categories: Vec<SessionStatus>,

    /// Per-identity overrides
    pub overrides: Vec<AlertOverride>,
}

impl From<&AlertPolicy> for AlertPolicyResponse {
    fn from(policy: &AlertPolicy) -> Self {
        Self {
            enabled: policy.enabled,
            default_categories: policy.default_categories().iter().copied().collect(),
            overrides: policy
                .overrides()
                .iter()
                .map(|(identity, categories)| AlertOverride {
                    identity: identity.to_string(),
                    categories: categories.iter().copied().collect(),
                })
                .collect(),
        }
    }
}

/// Parameters for health_alert_policy_set
///
/// Omitted fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AlertPolicySetParams {
    /// Turn alerting on or off
    #[serde(default)]
    pub enabled: Option<bool>,

    /// New default categories
    #[serde(default)]
    pub default_categories: Option<Vec<String>>,

    /// Identity whose override to edit
    #[serde(default)]
    pub identity: Option<String>,

    /// Override categories for `identity`; omit to remove the override
    #[serde(default)]
    pub categories: Option<Vec<String>>,
}

// =============================================================================
// Reconciliation Tools
// =============================================================================

/// Parameters for health_reconcile
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReconcileParams {}

/// Response for health_reconcile
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReconcileResponse {
    /// Persisted entries marked stale or unreachable
    pub stale: usize,

    /// Watches probed
    pub probed: usize,

    /// Watched entries whose status changed
    pub transitions: usize,

    /// Watches dropped for superseded instances
    pub pruned: usize,
}
