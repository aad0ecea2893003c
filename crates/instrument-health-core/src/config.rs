//! Configuration types for the instrument health monitor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::SessionIdentity;
use crate::policy::{parse_categories, AlertPolicy, PreRetryAction, RecoveryPolicy, RetryDelay};

/// Health configuration loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HealthConfig {
    /// State file and logging settings
    pub monitor: MonitorSettings,
    /// Retry settings
    pub recovery: RecoverySettings,
    /// Reconciliation loop settings
    pub reconcile: ReconcileSettings,
    /// Alert settings
    pub alerts: AlertSettings,
}

impl HealthConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        let config: HealthConfig = serde_yaml::from_str(yaml)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> crate::Result<()> {
        if self.monitor.state_file.trim().is_empty() {
            return Err(invalid("monitor.state_file cannot be empty"));
        }

        if self.recovery.max_delay_ms == 0 {
            return Err(invalid("recovery.max_delay_ms must be > 0"));
        }
        if self.recovery.delay_ms > self.recovery.max_delay_ms {
            return Err(invalid("recovery.delay_ms must be <= recovery.max_delay_ms"));
        }
        if self.recovery.pre_retry_timeout_ms == 0 {
            return Err(invalid("recovery.pre_retry_timeout_ms must be > 0"));
        }

        if self.reconcile.interval_ms == 0 || self.reconcile.probe_timeout_ms == 0 {
            return Err(invalid("reconcile intervals must be > 0"));
        }
        if self.reconcile.stale_unknown_owner_secs == 0 {
            return Err(invalid("reconcile.stale_unknown_owner_secs must be > 0"));
        }

        // Category names and override identities
        self.alert_policy()?;

        Ok(())
    }

    /// Full path of the persisted snapshot.
    pub fn state_path(&self) -> PathBuf {
        self.monitor.state_dir().join(&self.monitor.state_file)
    }

    /// Policy applied to named operations.
    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            max_retries: self.recovery.operation_retries,
            pre_retry_action: self.recovery.pre_retry_action,
            delay: self.recovery.retry_delay(),
            pre_retry_timeout: Duration::from_millis(self.recovery.pre_retry_timeout_ms),
        }
    }

    /// Policy applied when opening a session.
    pub fn construction_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy::new(self.recovery.construction_retries)
            .with_pre_retry(PreRetryAction::None)
            .with_delay(RetryDelay::Fixed(Duration::from_millis(
                self.recovery.construction_delay_ms,
            )))
    }

    /// Alert policy described by the `alerts` section.
    pub fn alert_policy(&self) -> crate::Result<AlertPolicy> {
        let mut policy = AlertPolicy::new(
            self.alerts.enabled,
            parse_categories(&self.alerts.default_categories)?,
        );
        for (identity, categories) in &self.alerts.overrides {
            let identity: SessionIdentity = identity.parse()?;
            policy.set_override(identity, parse_categories(categories)?);
        }
        Ok(policy)
    }
}

fn invalid(message: &str) -> crate::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, message.to_string()).into()
}

/// State file and logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Directory holding the state file (default `~/.instrument_health`)
    pub state_dir: Option<PathBuf>,
    /// State file name
    pub state_file: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl MonitorSettings {
    /// Resolved state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".instrument_health")
        })
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            state_dir: None,
            state_file: "device_monitor_state.json".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// How the retry delay grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Constant delay
    #[default]
    Fixed,
    /// Doubling delay capped at `max_delay_ms`
    Exponential,
}

/// Retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Retries after a failed operation
    pub operation_retries: u32,
    /// Action before each retry
    pub pre_retry_action: PreRetryAction,
    /// Base retry delay in milliseconds
    pub delay_ms: u64,
    /// Delay growth
    pub backoff: BackoffKind,
    /// Delay cap in milliseconds
    pub max_delay_ms: u64,
    /// Bound on a single reset or reconnect in milliseconds
    pub pre_retry_timeout_ms: u64,
    /// Retries when opening a session
    pub construction_retries: u32,
    /// Delay between open attempts in milliseconds
    pub construction_delay_ms: u64,
}

impl RecoverySettings {
    /// Delay schedule for operation retries.
    pub fn retry_delay(&self) -> RetryDelay {
        let base = Duration::from_millis(self.delay_ms);
        match self.backoff {
            BackoffKind::Fixed => RetryDelay::Fixed(base),
            BackoffKind::Exponential => RetryDelay::Exponential {
                base,
                max: Duration::from_millis(self.max_delay_ms),
            },
        }
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            operation_retries: 2,
            pre_retry_action: PreRetryAction::ResetThenReconnect,
            delay_ms: 200,
            backoff: BackoffKind::Fixed,
            max_delay_ms: 5000,
            pre_retry_timeout_ms: 5000,
            construction_retries: 2,
            construction_delay_ms: 500,
        }
    }
}

/// Reconciliation loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Tick interval in milliseconds
    pub interval_ms: u64,
    /// Per-probe timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// Age after which records without a process id are stale, in seconds
    pub stale_unknown_owner_secs: u64,
}

impl ReconcileSettings {
    /// Tick interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Per-probe timeout.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Unknown-owner staleness window.
    pub fn stale_unknown_owner(&self) -> Duration {
        Duration::from_secs(self.stale_unknown_owner_secs)
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            probe_timeout_ms: 200,
            stale_unknown_owner_secs: 12 * 60 * 60,
        }
    }
}

/// Alert settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    /// Master switch
    pub enabled: bool,
    /// Categories alerted for every identity
    pub default_categories: Vec<String>,
    /// Per-identity categories, keyed by `<instrument>:<address>`
    pub overrides: BTreeMap<String, Vec<String>>,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            default_categories: vec!["UNRECOVERABLE_FAILURE".to_string()],
            overrides: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionStatus;

    #[test]
    fn test_default_config() {
        let config = HealthConfig::default();
        assert_eq!(config.monitor.state_file, "device_monitor_state.json");
        assert_eq!(config.recovery.operation_retries, 2);
        assert_eq!(config.reconcile.interval_ms, 2000);
        assert!(!config.alerts.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_policies_match_policy_defaults() {
        let config = HealthConfig::default();
        assert_eq!(config.recovery_policy(), RecoveryPolicy::default());

        let construction = config.construction_policy();
        assert_eq!(construction.max_retries, 2);
        assert_eq!(construction.pre_retry_action, PreRetryAction::None);
        assert_eq!(
            construction.delay,
            RetryDelay::Fixed(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_state_path_uses_state_dir() {
        let mut config = HealthConfig::default();
        config.monitor.state_dir = Some(PathBuf::from("/var/lib/health"));
        assert_eq!(
            config.state_path(),
            PathBuf::from("/var/lib/health/device_monitor_state.json")
        );
    }

    #[test]
    fn test_default_state_dir_is_hidden_directory() {
        let config = HealthConfig::default();
        assert!(config.monitor.state_dir().ends_with(".instrument_health"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.monitor.state_dir(), home.join(".instrument_health"));
        }
    }

    #[test]
    fn test_invalid_delay_exceeds_max() {
        let mut config = HealthConfig::default();
        config.recovery.delay_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_zero_interval() {
        let mut config = HealthConfig::default();
        config.reconcile.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_category_name() {
        let mut config = HealthConfig::default();
        config.alerts.default_categories = vec!["EXPLODED".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
monitor:
  state_dir: /tmp/health
  log_level: debug
recovery:
  operation_retries: 4
  pre_retry_action: reconnect
  delay_ms: 100
  backoff: exponential
  max_delay_ms: 800
reconcile:
  interval_ms: 500
alerts:
  enabled: true
  default_categories: [warning, unrecoverable_failure]
  overrides:
    "PM100D:P0001": [DISCONNECTED]
"#;

        let config = HealthConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.monitor.log_level, "debug");
        assert_eq!(config.monitor.state_file, "device_monitor_state.json");

        let policy = config.recovery_policy();
        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.pre_retry_action, PreRetryAction::Reconnect);
        assert_eq!(policy.delay.for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay.for_retry(5), Duration::from_millis(800));

        let alerts = config.alert_policy().unwrap();
        assert!(alerts.enabled);
        let pm = SessionIdentity::resolved("PM100D", "P0001").unwrap();
        assert!(alerts.should_alert(&pm, SessionStatus::Disconnected));
        assert!(!alerts.should_alert(&pm, SessionStatus::Warning));
        let other = SessionIdentity::resolved("BSC203", "S1").unwrap();
        assert!(alerts.should_alert(&other, SessionStatus::Warning));
    }

    #[test]
    fn test_invalid_yaml_is_rejected() {
        assert!(HealthConfig::from_yaml("recovery: [not, a, map]").is_err());
    }
}
