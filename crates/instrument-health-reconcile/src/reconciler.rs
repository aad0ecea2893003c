//! Background reconciliation of registry records against liveness probes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use instrument_health_core::{
    DisconnectCause, InstanceId, ReconcileSettings, SessionIdentity, SessionStatus, StatusEvent,
    StatusRecord,
};
use instrument_health_registry::StatusRegistry;

use crate::probe::{
    ActivitySignal, ActivitySource, LivenessProbe, OwnerLiveness, ProcessLiveness, TcpPortProbe,
};

const OWNER_DEAD: &str = "Owning process is no longer running.";
const LEGACY_STALE: &str = "Legacy status entry exceeded stale timeout.";

/// One session instance under reconciliation.
#[derive(Clone)]
pub struct Watch {
    /// Session identity
    pub identity: SessionIdentity,
    /// Instance the watch was registered for
    pub instance: InstanceId,
    /// Backend reachability
    pub probe: Arc<dyn LivenessProbe>,
    /// Transport activity, if the session reports any
    pub activity: Option<Arc<dyn ActivitySource>>,
}

impl Watch {
    /// Watch `instance` of `identity` with `probe`.
    pub fn new(identity: SessionIdentity, instance: InstanceId, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            identity,
            instance,
            probe,
            activity: None,
        }
    }

    /// Also consult `activity`.
    pub fn with_activity(mut self, activity: Arc<dyn ActivitySource>) -> Self {
        self.activity = Some(activity);
        self
    }
}

/// Startup check for records of a backend family, matched by name prefix.
#[derive(Clone)]
pub struct BackendRule {
    prefix: String,
    probe: Arc<dyn LivenessProbe>,
    reason: String,
}

impl BackendRule {
    /// Rule for records whose instrument, model or device type starts with
    /// `prefix` (case-insensitive).
    pub fn new(prefix: &str, probe: Arc<dyn LivenessProbe>, reason: impl Into<String>) -> Self {
        Self {
            prefix: prefix.trim().to_lowercase(),
            probe,
            reason: reason.into(),
        }
    }

    /// MantisCam records need the local command ports.
    pub fn mantiscam() -> Self {
        let probe = TcpPortProbe::mantiscam();
        let reason = format!(
            "MantisCamUnified is not reachable on local command ports {:?}.",
            probe.ports()
        );
        Self::new("mantiscam", Arc::new(probe), reason)
    }

    fn matches(&self, record: &StatusRecord) -> bool {
        let descriptor = record.descriptor();
        [
            record.identity().instrument(),
            descriptor.model.as_str(),
            descriptor.device_type.as_str(),
        ]
        .iter()
        .any(|field| field.trim().to_lowercase().starts_with(&self.prefix))
    }
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Watches probed
    pub probed: usize,
    /// Records whose status changed
    pub transitions: usize,
    /// Watches dropped because their instance is gone
    pub pruned: usize,
}

struct LoopHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

struct Inner {
    registry: Arc<StatusRegistry>,
    watches: Mutex<HashMap<SessionIdentity, Watch>>,
    owner_liveness: Arc<dyn OwnerLiveness>,
    backend_rules: Vec<BackendRule>,
    settings: ReconcileSettings,
    interval: Duration,
    probe_timeout: Duration,
    stale_unknown_owner: Duration,
    trigger: Notify,
}

/// Periodic and on-demand liveness reconciliation.
///
/// Every event goes through `upsert_instance`, so a probe result for a
/// superseded instance never lands on the newer record.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
    task: Arc<Mutex<Option<LoopHandle>>>,
}

impl Reconciler {
    /// Reconciler for `registry` using `settings`.
    pub fn new(registry: Arc<StatusRegistry>, settings: &ReconcileSettings) -> Self {
        Self::build(registry, settings, Arc::new(ProcessLiveness), Vec::new())
    }

    /// Replace the process check used by the stale pass.
    pub fn with_owner_liveness(self, owner_liveness: Arc<dyn OwnerLiveness>) -> Self {
        let rules = self.inner.backend_rules.clone();
        self.rebuild(owner_liveness, rules)
    }

    /// Add a backend rule to the stale pass.
    pub fn with_backend_rule(self, rule: BackendRule) -> Self {
        let mut rules = self.inner.backend_rules.clone();
        rules.push(rule);
        let owner_liveness = Arc::clone(&self.inner.owner_liveness);
        self.rebuild(owner_liveness, rules)
    }

    fn build(
        registry: Arc<StatusRegistry>,
        settings: &ReconcileSettings,
        owner_liveness: Arc<dyn OwnerLiveness>,
        backend_rules: Vec<BackendRule>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                watches: Mutex::new(HashMap::new()),
                owner_liveness,
                backend_rules,
                settings: settings.clone(),
                interval: settings.interval(),
                probe_timeout: settings.probe_timeout(),
                stale_unknown_owner: settings.stale_unknown_owner(),
                trigger: Notify::new(),
            }),
            task: Arc::new(Mutex::new(None)),
        }
    }

    // Builders run before `start`; watches carry over.
    fn rebuild(self, owner_liveness: Arc<dyn OwnerLiveness>, rules: Vec<BackendRule>) -> Self {
        let inner = &self.inner;
        let rebuilt = Self::build(
            Arc::clone(&inner.registry),
            &inner.settings,
            owner_liveness,
            rules,
        );
        let watches = inner
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        *rebuilt
            .inner
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = watches;
        rebuilt
    }

    /// Registry being reconciled.
    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.inner.registry
    }

    /// Add or replace the watch for `watch.identity`.
    pub fn watch(&self, watch: Watch) {
        debug!(identity = %watch.identity, "Watching session");
        self.inner
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(watch.identity.clone(), watch);
    }

    /// Stop watching `identity`.
    pub fn unwatch(&self, identity: &SessionIdentity) -> bool {
        self.inner
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity)
            .is_some()
    }

    /// Identities currently watched, sorted.
    pub fn watched(&self) -> Vec<SessionIdentity> {
        let mut identities: Vec<SessionIdentity> = self
            .inner
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        identities.sort();
        identities
    }

    /// Spawn the background loop. No-op if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            run_loop(inner, shutdown_rx).await;
        });
        *task = Some(LoopHandle {
            handle,
            shutdown_tx,
        });
        info!(interval_ms = self.inner.settings.interval_ms, "Reconciliation loop started");
    }

    /// Stop the background loop and wait for it to finish.
    pub async fn stop(&self) {
        let slot = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            if let Err(e) = slot.handle.await {
                warn!("Reconciliation loop ended abnormally: {}", e);
            }
            info!("Reconciliation loop stopped");
        }
    }

    /// Whether the background loop is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Ask the running loop for an immediate pass.
    pub fn trigger(&self) {
        self.inner.trigger.notify_one();
    }

    /// Run one pass over every watch.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        reconcile_once(&self.inner).await
    }

    /// Mark persisted live records of other owners as stale when their
    /// process is gone, or, lacking a process id, when they are too old.
    ///
    /// Returns the number of records changed.
    pub async fn stale_pass(&self) -> usize {
        stale_pass(&self.inner).await
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("watched", &self.watched())
            .field("interval", &self.inner.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    debug!("Reconciliation loop starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(inner.interval) => {}
            _ = inner.trigger.notified() => {
                debug!("Reconciliation triggered");
            }
            _ = shutdown.changed() => {
                debug!("Reconciliation loop shutting down");
                break;
            }
        }
        let report = reconcile_once(&inner).await;
        if report.transitions > 0 || report.pruned > 0 {
            info!(
                probed = report.probed,
                transitions = report.transitions,
                pruned = report.pruned,
                "Reconciliation pass"
            );
        }
    }
}

// Closed, released and stale records are never revived by a probe.
fn is_finished(record: &StatusRecord) -> bool {
    record.status().is_terminal()
        && record.disconnect_cause() != Some(DisconnectCause::Unreachable)
}

async fn reconcile_once(inner: &Inner) -> ReconcileReport {
    let watches: Vec<Watch> = inner
        .watches
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect();

    let mut report = ReconcileReport::default();
    let mut gone = Vec::new();

    for watch in watches {
        let current = match inner.registry.get(&watch.identity) {
            Some(record) if record.instance() == watch.instance && !is_finished(&record) => {
                record
            }
            _ => {
                gone.push(watch);
                continue;
            }
        };
        report.probed += 1;

        let before = current.status();
        let after = reconcile_watch(inner, &watch, &current).await;
        match after {
            Some(record) if record.instance() != watch.instance => gone.push(watch),
            Some(record) if record.status() != before => report.transitions += 1,
            Some(_) => {}
            None => gone.push(watch),
        }
    }

    if !gone.is_empty() {
        let mut watches = inner.watches.lock().unwrap_or_else(PoisonError::into_inner);
        for watch in gone {
            // Only prune the watch we looked at; a newer one may have replaced it.
            if watches
                .get(&watch.identity)
                .is_some_and(|w| w.instance == watch.instance)
            {
                debug!(identity = %watch.identity, "Pruning watch");
                watches.remove(&watch.identity);
                report.pruned += 1;
            }
        }
    }
    report
}

async fn reconcile_watch(
    inner: &Inner,
    watch: &Watch,
    current: &StatusRecord,
) -> Option<StatusRecord> {
    let probe = Arc::clone(&watch.probe);
    let identity = watch.identity.clone();
    let reachable = run_bounded(inner.probe_timeout, move || probe.probe(&identity))
        .await
        .unwrap_or(false);

    if !reachable {
        return apply(
            inner,
            watch,
            StatusEvent::BackendUnreachable {
                reason: format!("Liveness probe failed: {}", watch.probe.describe()),
            },
        );
    }

    let mut latest = Some(current.clone());
    if current.status() == SessionStatus::Disconnected
        && current.disconnect_cause() == Some(DisconnectCause::Unreachable)
    {
        latest = apply(inner, watch, StatusEvent::BackendReachable);
    }

    let Some(activity) = watch.activity.as_ref().map(Arc::clone) else {
        return latest;
    };
    let identity = watch.identity.clone();
    let signal = run_bounded(inner.probe_timeout, move || activity.activity_signal(&identity))
        .await
        .unwrap_or(ActivitySignal::Unreachable);

    match signal {
        ActivitySignal::Ok => latest,
        ActivitySignal::Degraded => apply(
            inner,
            watch,
            StatusEvent::RecoverableFailure {
                error: "Transport activity degraded".to_string(),
            },
        ),
        ActivitySignal::Unreachable => apply(
            inner,
            watch,
            StatusEvent::BackendUnreachable {
                reason: "Transport activity reports the backend unreachable".to_string(),
            },
        ),
    }
}

fn apply(inner: &Inner, watch: &Watch, event: StatusEvent) -> Option<StatusRecord> {
    inner
        .registry
        .upsert_instance(&watch.identity, watch.instance, event)
}

// Run a blocking check on the blocking pool, giving up after `timeout`.
async fn run_bounded<T, F>(timeout: Duration, check: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(check)).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("Probe panicked: {}", e);
            None
        }
        Err(_) => {
            debug!(?timeout, "Probe timed out");
            None
        }
    }
}

async fn stale_pass(inner: &Inner) -> usize {
    let registry = &inner.registry;
    let now = Utc::now();
    let mut changed = 0;
    let mut backend_alive: HashMap<usize, bool> = HashMap::new();

    'records: for record in registry.list() {
        if !record.status().is_live() || record.owner() == registry.owner() {
            continue;
        }
        let identity = record.identity();
        let owner = *record.owner();

        // Same process id, different runtime: written by an earlier run of a
        // process whose id was reused.
        let earlier_run = owner.has_process()
            && owner.process_id == registry.owner().process_id
            && owner.runtime_id != registry.owner().runtime_id;
        if earlier_run
            || (owner.has_process() && !inner.owner_liveness.is_alive(owner.process_id))
        {
            info!(%identity, process_id = owner.process_id, "Owner of status entry is gone");
            if mark(registry, &record, StatusEvent::OwnerDead { reason: OWNER_DEAD.to_string() }) {
                changed += 1;
            }
            continue;
        }

        for (index, rule) in inner.backend_rules.iter().enumerate() {
            if !rule.matches(&record) {
                continue;
            }
            let alive = match backend_alive.get(&index) {
                Some(&alive) => alive,
                None => {
                    let probe = Arc::clone(&rule.probe);
                    let probed = identity.clone();
                    let alive = run_bounded(inner.probe_timeout, move || probe.probe(&probed))
                        .await
                        .unwrap_or(false);
                    backend_alive.insert(index, alive);
                    alive
                }
            };
            if !alive {
                let event = StatusEvent::BackendUnreachable {
                    reason: rule.reason.clone(),
                };
                if mark(registry, &record, event) {
                    changed += 1;
                }
                continue 'records;
            }
        }

        if !owner.has_process() {
            let age = now
                .signed_duration_since(record.last_transition_time())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age >= inner.stale_unknown_owner {
                info!(%identity, "Status entry without owner process is stale");
                let event = StatusEvent::OwnerDead {
                    reason: LEGACY_STALE.to_string(),
                };
                if mark(registry, &record, event) {
                    changed += 1;
                }
            }
        }
    }

    if changed > 0 {
        info!(changed, "Stale pass updated status entries");
    }
    changed
}

fn mark(registry: &StatusRegistry, record: &StatusRecord, event: StatusEvent) -> bool {
    registry
        .upsert_instance(record.identity(), record.instance(), event)
        .is_some_and(|updated| updated.status() != record.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Switch(AtomicBool);

    impl LivenessProbe for Switch {
        fn probe(&self, _identity: &SessionIdentity) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Fixed(ActivitySignal);

    impl ActivitySource for Fixed {
        fn activity_signal(&self, _identity: &SessionIdentity) -> ActivitySignal {
            self.0
        }
    }

    struct Hangs;

    impl LivenessProbe for Hangs {
        fn probe(&self, _identity: &SessionIdentity) -> bool {
            std::thread::sleep(Duration::from_millis(500));
            true
        }
    }

    fn connected(registry: &StatusRegistry, name: &str) -> (SessionIdentity, InstanceId) {
        let identity = SessionIdentity::resolved(name, "SN1").unwrap();
        let record = registry
            .upsert(&identity, StatusEvent::construction())
            .unwrap();
        registry.upsert_instance(&identity, record.instance(), StatusEvent::HandshakeSucceeded);
        (identity, record.instance())
    }

    fn settings() -> ReconcileSettings {
        ReconcileSettings {
            interval_ms: 20,
            probe_timeout_ms: 100,
            stale_unknown_owner_secs: 3600,
        }
    }

    #[tokio::test]
    async fn test_degraded_activity_warns() {
        let registry = Arc::new(StatusRegistry::in_memory().unwrap());
        let (identity, instance) = connected(&registry, "KDC101");
        let reconciler = Reconciler::new(Arc::clone(&registry), &settings());
        reconciler.watch(
            Watch::new(identity.clone(), instance, Arc::new(Switch(AtomicBool::new(true))))
                .with_activity(Arc::new(Fixed(ActivitySignal::Degraded))),
        );

        let report = reconciler.reconcile_once().await;
        assert_eq!(report.transitions, 1);
        assert_eq!(registry.get(&identity).unwrap().status(), SessionStatus::Warning);
    }

    #[tokio::test]
    async fn test_unreachable_activity_disconnects() {
        let registry = Arc::new(StatusRegistry::in_memory().unwrap());
        let (identity, instance) = connected(&registry, "KDC101");
        let reconciler = Reconciler::new(Arc::clone(&registry), &settings());
        reconciler.watch(
            Watch::new(identity.clone(), instance, Arc::new(Switch(AtomicBool::new(true))))
                .with_activity(Arc::new(Fixed(ActivitySignal::Unreachable))),
        );

        reconciler.reconcile_once().await;
        let record = registry.get(&identity).unwrap();
        assert_eq!(record.status(), SessionStatus::Disconnected);
        assert_eq!(record.disconnect_cause(), Some(DisconnectCause::Unreachable));
    }

    #[tokio::test]
    async fn test_timed_out_probe_counts_as_unreachable() {
        let registry = Arc::new(StatusRegistry::in_memory().unwrap());
        let (identity, instance) = connected(&registry, "KDC101");
        let reconciler = Reconciler::new(Arc::clone(&registry), &settings());
        reconciler.watch(Watch::new(identity.clone(), instance, Arc::new(Hangs)));

        reconciler.reconcile_once().await;
        assert_eq!(
            registry.get(&identity).unwrap().status(),
            SessionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_closed_session_is_not_revived() {
        let registry = Arc::new(StatusRegistry::in_memory().unwrap());
        let (identity, instance) = connected(&registry, "KDC101");
        registry.upsert_instance(&identity, instance, StatusEvent::Closed { error: None });
        let reconciler = Reconciler::new(Arc::clone(&registry), &settings());
        reconciler.watch(Watch::new(
            identity.clone(),
            instance,
            Arc::new(Switch(AtomicBool::new(true))),
        ));

        let report = reconciler.reconcile_once().await;
        assert_eq!(report.transitions, 0);
        assert_eq!(report.probed, 0);
        assert_eq!(report.pruned, 1);
        assert!(reconciler.watched().is_empty());
        let record = registry.get(&identity).unwrap();
        assert_eq!(record.status(), SessionStatus::Disconnected);
        assert_eq!(record.disconnect_cause(), Some(DisconnectCause::Closed));
    }

    #[tokio::test]
    async fn test_released_session_watch_is_pruned() {
        let registry = Arc::new(StatusRegistry::in_memory().unwrap());
        let (identity, instance) = connected(&registry, "KDC101");
        let reconciler = Reconciler::new(Arc::clone(&registry), &settings());
        reconciler.watch(Watch::new(
            identity.clone(),
            instance,
            Arc::new(Switch(AtomicBool::new(false))),
        ));
        registry.upsert_instance(&identity, instance, StatusEvent::Released);

        assert_eq!(reconciler.reconcile_once().await.pruned, 1);
        assert!(reconciler.watched().is_empty());
        assert_eq!(reconciler.reconcile_once().await.probed, 0);
    }

    #[tokio::test]
    async fn test_unreachable_watch_is_kept_for_revival() {
        let registry = Arc::new(StatusRegistry::in_memory().unwrap());
        let (identity, instance) = connected(&registry, "KDC101");
        let reconciler = Reconciler::new(Arc::clone(&registry), &settings());
        reconciler.watch(Watch::new(
            identity.clone(),
            instance,
            Arc::new(Switch(AtomicBool::new(false))),
        ));

        reconciler.reconcile_once().await;
        let report = reconciler.reconcile_once().await;
        assert_eq!(report.pruned, 0);
        assert_eq!(report.probed, 1);
        assert_eq!(reconciler.watched().len(), 1);
    }

    #[test]
    fn test_builders_keep_settings() {
        let registry = Arc::new(StatusRegistry::in_memory().unwrap());
        let custom = ReconcileSettings {
            interval_ms: u64::MAX,
            probe_timeout_ms: 750,
            stale_unknown_owner_secs: 90,
        };
        let reconciler = Reconciler::new(registry, &custom)
            .with_backend_rule(BackendRule::mantiscam())
            .with_owner_liveness(Arc::new(ProcessLiveness));

        let settings = &reconciler.inner.settings;
        assert_eq!(settings.interval_ms, u64::MAX);
        assert_eq!(settings.probe_timeout_ms, 750);
        assert_eq!(settings.stale_unknown_owner_secs, 90);
        assert_eq!(reconciler.inner.probe_timeout, Duration::from_millis(750));
    }

    #[tokio::test]
    async fn test_removed_identity_prunes_watch() {
        let registry = Arc::new(StatusRegistry::in_memory().unwrap());
        let (identity, instance) = connected(&registry, "KDC101");
        let reconciler = Reconciler::new(Arc::clone(&registry), &settings());
        reconciler.watch(Watch::new(
            identity.clone(),
            instance,
            Arc::new(Switch(AtomicBool::new(false))),
        ));
        registry.remove(&identity);

        let report = reconciler.reconcile_once().await;
        assert_eq!(report.pruned, 1);
        assert!(reconciler.watched().is_empty());
        assert!(registry.get(&identity).is_none());
    }

    #[tokio::test]
    async fn test_loop_start_trigger_stop() {
        let registry = Arc::new(StatusRegistry::in_memory().unwrap());
        let (identity, instance) = connected(&registry, "KDC101");
        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            &ReconcileSettings {
                interval_ms: 60_000,
                ..settings()
            },
        );
        reconciler.watch(Watch::new(
            identity.clone(),
            instance,
            Arc::new(Switch(AtomicBool::new(false))),
        ));

        reconciler.start();
        assert!(reconciler.is_running());
        reconciler.trigger();

        let mut status = SessionStatus::Connected;
        for _ in 0..100 {
            status = registry.get(&identity).unwrap().status();
            if status == SessionStatus::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, SessionStatus::Disconnected);

        reconciler.stop().await;
        assert!(!reconciler.is_running());
    }
}
