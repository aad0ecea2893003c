//! The monitor service behind the MCP tools.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use instrument_health_core::{
    parse_categories, Error, HealthConfig, Result, SessionIdentity, SessionStatus,
};
use instrument_health_reconcile::{BackendRule, Reconciler};
use instrument_health_registry::{JsonFileStore, LogDispatcher, RegistryConfig, StatusRegistry};

use crate::tools::*;

/// Statuses `health_entries_clear` removes by default.
pub const DEFAULT_CLEAR: [SessionStatus; 2] =
    [SessionStatus::Disconnected, SessionStatus::StaleSession];

/// Registry view and commands for an out-of-process display.
pub struct HealthMonitor {
    registry: Arc<StatusRegistry>,
    reconciler: Reconciler,
}

impl HealthMonitor {
    /// Monitor over `registry`, reconciled by `reconciler`.
    pub fn new(registry: Arc<StatusRegistry>, reconciler: Reconciler) -> Self {
        Self {
            registry,
            reconciler,
        }
    }

    /// Open the state file named by `config`, seed from it and build the
    /// reconciler.
    pub fn from_config(config: &HealthConfig) -> Result<Self> {
        let path = config.state_path();
        info!(path = %path.display(), "Opening status state file");

        let registry = Arc::new(StatusRegistry::with_config(
            RegistryConfig {
                alert_policy: config.alert_policy()?,
                ..RegistryConfig::default()
            },
            Arc::new(JsonFileStore::new(path)),
            Arc::new(LogDispatcher),
        )?);
        match registry.seed_from_store() {
            Ok(Some(snapshot)) => info!(entries = snapshot.records.len(), "Seeded from state file"),
            Ok(None) => debug!("No state file yet"),
            Err(e) => warn!("Ignoring unreadable state file: {}", e),
        }

        let reconciler = Reconciler::new(Arc::clone(&registry), &config.reconcile)
            .with_backend_rule(BackendRule::mantiscam());
        Ok(Self::new(registry, reconciler))
    }

    /// Registry behind the monitor.
    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    /// Reconciler behind the monitor.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    fn refresh(&self) {
        if let Err(e) = self.registry.refresh_from_store() {
            warn!("Could not refresh from state file: {}", e);
        }
    }

    /// Entries, optionally filtered by status.
    pub fn list(&self, params: &StatusListParams) -> Result<StatusListResponse> {
        self.refresh();
        let filter = match &params.statuses {
            Some(names) => parse_categories(names)?,
            None => BTreeSet::new(),
        };

        let records = self.registry.list();
        let summary = SessionStatus::ALL
            .iter()
            .map(|&status| StatusCount {
                status,
                count: records.iter().filter(|r| r.status() == status).count(),
            })
            .collect();
        let entries: Vec<StatusEntry> = records
            .iter()
            .filter(|r| filter.is_empty() || filter.contains(&r.status()))
            .map(StatusEntry::from)
            .collect();

        Ok(StatusListResponse {
            count: entries.len(),
            entries,
            summary,
        })
    }

    /// One entry.
    pub fn get(&self, identity: &str) -> Result<StatusEntry> {
        self.refresh();
        let identity: SessionIdentity = identity.parse()?;
        self.registry
            .get(&identity)
            .map(|record| StatusEntry::from(&record))
            .ok_or(Error::SessionNotFound(identity))
    }

    /// Remove one entry.
    pub fn remove(&self, identity: &str) -> Result<EntryRemoveResponse> {
        self.refresh();
        let identity: SessionIdentity = identity.parse()?;
        let removed = self
            .registry
            .remove(&identity)
            .ok_or_else(|| Error::SessionNotFound(identity.clone()))?;
        Ok(EntryRemoveResponse {
            removed: StatusEntry::from(&removed),
            message: format!("Entry '{identity}' removed"),
        })
    }

    /// Remove entries in the given statuses.
    pub fn clear(&self, params: &EntriesClearParams) -> Result<EntriesClearResponse> {
        self.refresh();
        let statuses = match &params.statuses {
            Some(names) => parse_categories(names)?,
            None => DEFAULT_CLEAR.into_iter().collect(),
        };
        let removed = self.registry.clear(&statuses);
        info!(removed, "Cleared status entries");
        Ok(EntriesClearResponse {
            removed,
            statuses: statuses.into_iter().collect(),
        })
    }

    /// Current alert policy.
    pub fn alert_policy(&self) -> AlertPolicyResponse {
        self.refresh();
        AlertPolicyResponse::from(&self.registry.alert_policy())
    }

    /// Edit the alert policy.
    ///
    /// Inputs are validated before anything changes.
    pub fn set_alert_policy(&self, params: &AlertPolicySetParams) -> Result<AlertPolicyResponse> {
        self.refresh();
        let defaults = params
            .default_categories
            .as_ref()
            .map(parse_categories)
            .transpose()?;
        let identity = params
            .identity
            .as_deref()
            .map(str::parse::<SessionIdentity>)
            .transpose()?;
        let categories = params
            .categories
            .as_ref()
            .map(parse_categories)
            .transpose()?;
        if identity.is_none() && categories.is_some() {
            return Err(Error::InvalidInput(
                "categories need an identity".to_string(),
            ));
        }

        if let Some(identity) = &identity {
            match categories {
                Some(categories) => self.registry.set_alert_categories(identity, categories)?,
                None => {
                    self.registry.clear_alert_categories(identity);
                }
            }
        }
        if let Some(defaults) = defaults {
            self.registry.set_default_categories(defaults);
        }
        if let Some(enabled) = params.enabled {
            self.registry.set_alerts_enabled(enabled);
        }
        Ok(AlertPolicyResponse::from(&self.registry.alert_policy()))
    }

    /// Run the stale pass and one reconciliation pass now.
    pub async fn reconcile(&self) -> ReconcileResponse {
        self.refresh();
        let stale = self.reconciler.stale_pass().await;
        let report = self.reconciler.reconcile_once().await;
        ReconcileResponse {
            stale,
            probed: report.probed,
            transitions: report.transitions,
            pruned: report.pruned,
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("registry", &self.registry)
            .field("reconciler", &self.reconciler)
            .finish()
    }
}
