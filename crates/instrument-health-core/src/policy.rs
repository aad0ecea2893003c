//! Recovery and alert policies.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::SessionIdentity;
use crate::status::SessionStatus;
use crate::Result;

/// Action taken before retrying a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreRetryAction {
    /// Retry without touching the device
    None,
    /// Reset the device
    Reset,
    /// Reconnect the transport
    Reconnect,
    /// Reset, and reconnect if the reset did not succeed
    #[default]
    ResetThenReconnect,
}

/// Wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    /// Same delay before every retry
    Fixed(Duration),
    /// Delay doubles from `base` before each retry, capped at `max`
    Exponential {
        /// Delay before the first retry
        base: Duration,
        /// Upper bound
        max: Duration,
    },
}

impl RetryDelay {
    /// Delay before retry number `retry` (1-based).
    pub fn for_retry(&self, retry: u32) -> Duration {
        match *self {
            RetryDelay::Fixed(delay) => delay,
            RetryDelay::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Fixed(Duration::from_millis(200))
    }
}

/// Retry policy attached to one invocation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Action run before each retry
    pub pre_retry_action: PreRetryAction,
    /// Wait before each retry
    pub delay: RetryDelay,
    /// Bound on a single pre-retry action
    pub pre_retry_timeout: Duration,
}

impl RecoveryPolicy {
    /// Policy with `max_retries` and default action, delay and timeout.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Single attempt, no recovery.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            pre_retry_action: PreRetryAction::None,
            ..Self::default()
        }
    }

    /// Set the pre-retry action.
    pub fn with_pre_retry(mut self, action: PreRetryAction) -> Self {
        self.pre_retry_action = action;
        self
    }

    /// Set the retry delay.
    pub fn with_delay(mut self, delay: RetryDelay) -> Self {
        self.delay = delay;
        self
    }

    /// Set the pre-retry action timeout.
    pub fn with_pre_retry_timeout(mut self, timeout: Duration) -> Self {
        self.pre_retry_timeout = timeout;
        self
    }

    /// Total attempts the policy allows.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            pre_retry_action: PreRetryAction::default(),
            delay: RetryDelay::default(),
            pre_retry_timeout: Duration::from_secs(5),
        }
    }
}

/// Parse status category names, dropping duplicates.
pub fn parse_categories<I, S>(names: I) -> Result<BTreeSet<SessionStatus>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names.into_iter().map(|name| name.as_ref().parse()).collect()
}

/// Which status changes produce alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertPolicy {
    /// Master switch
    pub enabled: bool,
    default_categories: BTreeSet<SessionStatus>,
    overrides: BTreeMap<SessionIdentity, BTreeSet<SessionStatus>>,
}

impl AlertPolicy {
    /// Policy alerting on `default_categories` for every identity.
    pub fn new(enabled: bool, default_categories: BTreeSet<SessionStatus>) -> Self {
        Self {
            enabled,
            default_categories,
            overrides: BTreeMap::new(),
        }
    }

    /// Categories used for identities without an override.
    pub fn default_categories(&self) -> &BTreeSet<SessionStatus> {
        &self.default_categories
    }

    /// Per-identity overrides.
    pub fn overrides(&self) -> &BTreeMap<SessionIdentity, BTreeSet<SessionStatus>> {
        &self.overrides
    }

    /// Categories in effect for `identity`.
    pub fn resolve(&self, identity: &SessionIdentity) -> &BTreeSet<SessionStatus> {
        self.overrides
            .get(identity)
            .unwrap_or(&self.default_categories)
    }

    /// Whether entering `status` should alert for `identity`.
    pub fn should_alert(&self, identity: &SessionIdentity, status: SessionStatus) -> bool {
        self.enabled && self.resolve(identity).contains(&status)
    }

    /// Replace the default categories.
    pub fn set_default_categories(&mut self, categories: BTreeSet<SessionStatus>) {
        self.default_categories = categories;
    }

    /// Set an override for one identity. An empty set silences the identity.
    pub fn set_override(&mut self, identity: SessionIdentity, categories: BTreeSet<SessionStatus>) {
        self.overrides.insert(identity, categories);
    }

    /// Drop the override for one identity; returns whether one existed.
    pub fn clear_override(&mut self, identity: &SessionIdentity) -> bool {
        self.overrides.remove(identity).is_some()
    }
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self::new(
            false,
            BTreeSet::from([SessionStatus::UnrecoverableFailure]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_policy_defaults() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.pre_retry_action, PreRetryAction::ResetThenReconnect);
        assert_eq!(policy.delay, RetryDelay::Fixed(Duration::from_millis(200)));
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RecoveryPolicy::no_retry();
        assert_eq!(policy.attempts(), 1);
        assert_eq!(policy.pre_retry_action, PreRetryAction::None);
    }

    #[test]
    fn test_attempts_saturate() {
        assert_eq!(RecoveryPolicy::new(u32::MAX).attempts(), u32::MAX);
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let delay = RetryDelay::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(delay.for_retry(1), Duration::from_millis(100));
        assert_eq!(delay.for_retry(2), Duration::from_millis(200));
        assert_eq!(delay.for_retry(3), Duration::from_millis(400));
        assert_eq!(delay.for_retry(4), Duration::from_millis(500));
        assert_eq!(delay.for_retry(60), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_categories() {
        let set = parse_categories(["warning", "WARNING", "stale_session"]).unwrap();
        assert_eq!(
            set,
            BTreeSet::from([SessionStatus::Warning, SessionStatus::StaleSession])
        );
        assert!(parse_categories(["nope"]).is_err());
    }

    #[test]
    fn test_alert_policy_resolution() {
        let mut policy = AlertPolicy::default();
        policy.enabled = true;
        let pm = SessionIdentity::resolved("PM100D", "P1").unwrap();
        let stage = SessionIdentity::resolved("BSC203", "S1").unwrap();

        assert!(policy.should_alert(&pm, SessionStatus::UnrecoverableFailure));
        assert!(!policy.should_alert(&pm, SessionStatus::Disconnected));

        policy.set_override(pm.clone(), BTreeSet::from([SessionStatus::Disconnected]));
        assert!(policy.should_alert(&pm, SessionStatus::Disconnected));
        assert!(!policy.should_alert(&pm, SessionStatus::UnrecoverableFailure));
        assert!(policy.should_alert(&stage, SessionStatus::UnrecoverableFailure));

        assert!(policy.clear_override(&pm));
        assert!(policy.should_alert(&pm, SessionStatus::UnrecoverableFailure));
    }

    #[test]
    fn test_empty_override_silences_identity() {
        let mut policy = AlertPolicy::default();
        policy.enabled = true;
        let pm = SessionIdentity::resolved("PM100D", "P1").unwrap();
        policy.set_override(pm.clone(), BTreeSet::new());
        assert!(!policy.should_alert(&pm, SessionStatus::UnrecoverableFailure));
    }

    #[test]
    fn test_disabled_policy_never_alerts() {
        let policy = AlertPolicy::default();
        let pm = SessionIdentity::resolved("PM100D", "P1").unwrap();
        assert!(!policy.should_alert(&pm, SessionStatus::UnrecoverableFailure));
    }

    #[test]
    fn test_alert_policy_serialization() {
        let mut policy = AlertPolicy::default();
        policy.set_override(
            SessionIdentity::resolved("PM100D", "P1").unwrap(),
            BTreeSet::from([SessionStatus::Warning]),
        );
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains(r#""PM100D:P1":["WARNING"]"#));
        let back: AlertPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
