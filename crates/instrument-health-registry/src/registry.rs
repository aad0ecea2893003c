//! The status registry.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use instrument_health_core::{
    apply, AlertPolicy, Error, InstanceId, OwnerMarker, Result, SessionIdentity, SessionStatus,
    StatusEvent, StatusRecord,
};

use crate::alert::{AlertDispatcher, AlertGate, LogDispatcher};
use crate::publisher::StatusPublisher;
use crate::store::{MemoryStore, PersistedSnapshot, SnapshotStore};

/// Configuration for a status registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Marker stamped on records this registry creates
    pub owner: OwnerMarker,
    /// Alert policy used until a persisted one is seeded
    pub alert_policy: AlertPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            owner: OwnerMarker::for_current_process(),
            alert_policy: AlertPolicy::default(),
        }
    }
}

/// Thread-safe map of identity to current status.
///
/// `upsert` is the single mutation path for records: the transition table is
/// evaluated under the write lock, and the follow-up work (publish, persist,
/// alert) runs after the lock is released. Follow-up failures are logged and
/// never reach the caller.
pub struct StatusRegistry {
    records: RwLock<HashMap<SessionIdentity, StatusRecord>>,
    alert_policy: RwLock<AlertPolicy>,
    policy_dirty: AtomicBool,
    owner: OwnerMarker,
    store: Arc<dyn SnapshotStore>,
    persist_lock: Mutex<()>,
    publishers: RwLock<Vec<Arc<dyn StatusPublisher>>>,
    alerts: AlertGate,
}

impl StatusRegistry {
    /// Registry persisting to `store`, alerting through the log.
    pub fn new(store: Arc<dyn SnapshotStore>) -> Result<Self> {
        Self::with_config(RegistryConfig::default(), store, Arc::new(LogDispatcher))
    }

    /// Registry that persists nowhere but memory.
    pub fn in_memory() -> Result<Self> {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Registry with explicit configuration and collaborators.
    pub fn with_config(
        config: RegistryConfig,
        store: Arc<dyn SnapshotStore>,
        dispatcher: Arc<dyn AlertDispatcher>,
    ) -> Result<Self> {
        Ok(Self {
            records: RwLock::new(HashMap::new()),
            alert_policy: RwLock::new(config.alert_policy),
            policy_dirty: AtomicBool::new(false),
            owner: config.owner,
            store,
            persist_lock: Mutex::new(()),
            publishers: RwLock::new(Vec::new()),
            alerts: AlertGate::new(dispatcher)?,
        })
    }

    /// Marker of this registry instance.
    pub fn owner(&self) -> &OwnerMarker {
        &self.owner
    }

    /// Register a display publisher.
    pub fn subscribe(&self, publisher: Arc<dyn StatusPublisher>) {
        self.publishers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(publisher);
    }

    /// Apply `event` to the record for `identity`.
    ///
    /// Returns the record after the call: the updated one when the transition
    /// was accepted, the unchanged one when it was a no-op, and `None` when no
    /// record exists and the event cannot create one.
    pub fn upsert(&self, identity: &SessionIdentity, event: StatusEvent) -> Option<StatusRecord> {
        self.apply_event(identity, None, event)
    }

    /// Apply `event` only if the current record belongs to `instance`.
    ///
    /// Reports for a superseded or removed instance are discarded.
    pub fn upsert_instance(
        &self,
        identity: &SessionIdentity,
        instance: InstanceId,
        event: StatusEvent,
    ) -> Option<StatusRecord> {
        self.apply_event(identity, Some(instance), event)
    }

    fn apply_event(
        &self,
        identity: &SessionIdentity,
        instance: Option<InstanceId>,
        event: StatusEvent,
    ) -> Option<StatusRecord> {
        let name = event.name();
        let is_construction = matches!(event, StatusEvent::ConstructionStarted { .. });

        let (before, after, superseded) = {
            let mut records = self.write_records();
            let current = records.get(identity).cloned();

            if let Some(instance) = instance {
                if current.as_ref().map(StatusRecord::instance) != Some(instance) {
                    debug!(%identity, %instance, event = name, "Discarding event for stale instance");
                    return current;
                }
            }

            let Some(next) = apply(current.as_ref(), identity, event, &self.owner, Utc::now())
            else {
                debug!(
                    %identity,
                    status = ?current.as_ref().map(StatusRecord::status),
                    event = name,
                    "Event ignored in current state"
                );
                return current;
            };

            let superseded = if is_construction {
                self.remove_provisional(&mut records, identity)
            } else {
                Vec::new()
            };
            records.insert(identity.clone(), next.clone());
            (current, next, superseded)
        };

        match before.as_ref().map(StatusRecord::status) {
            Some(from) if from != after.status() => {
                info!(%identity, %from, to = %after.status(), event = name, "Status transition")
            }
            Some(_) => debug!(%identity, status = %after.status(), event = name, "Status refreshed"),
            None => info!(%identity, to = %after.status(), event = name, "Session registered"),
        }

        for removed in &superseded {
            debug!(identity = %removed, "Removed provisional entry");
            self.publish(removed, None);
        }
        self.publish(identity, Some(&after));
        self.persist(&[]);
        let policy = self.alert_policy();
        self.alerts.maybe_alert(before.as_ref(), &after, &policy);

        Some(after)
    }

    // Entries this registry created for the same instrument before the
    // device reported its address.
    fn remove_provisional(
        &self,
        records: &mut HashMap<SessionIdentity, StatusRecord>,
        identity: &SessionIdentity,
    ) -> Vec<SessionIdentity> {
        let stale: Vec<SessionIdentity> = records
            .values()
            .filter(|record| {
                let candidate = record.identity();
                candidate != identity
                    && candidate.same_instrument(identity)
                    && !candidate.address().is_resolved()
                    && record.owner() == &self.owner
                    && record.status() == SessionStatus::Connecting
            })
            .map(|record| record.identity().clone())
            .collect();
        for key in &stale {
            records.remove(key);
        }
        stale
    }

    /// Current record for `identity`.
    pub fn get(&self, identity: &SessionIdentity) -> Option<StatusRecord> {
        self.read_records().get(identity).cloned()
    }

    /// All records, sorted by identity.
    pub fn list(&self) -> Vec<StatusRecord> {
        let mut records: Vec<StatusRecord> = self.read_records().values().cloned().collect();
        records.sort_by(|a, b| a.identity().cmp(b.identity()));
        records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    /// Whether the registry holds no records.
    pub fn is_empty(&self) -> bool {
        self.read_records().is_empty()
    }

    /// Remove one record.
    pub fn remove(&self, identity: &SessionIdentity) -> Option<StatusRecord> {
        let removed = self.write_records().remove(identity);
        if removed.is_some() {
            info!(%identity, "Removed status entry");
            self.publish(identity, None);
            self.persist(std::slice::from_ref(identity));
        }
        removed
    }

    /// Remove every record whose status is in `statuses`; an empty set
    /// removes all. Returns the number removed.
    pub fn clear(&self, statuses: &BTreeSet<SessionStatus>) -> usize {
        let removed: Vec<SessionIdentity> = {
            let mut records = self.write_records();
            let keys: Vec<SessionIdentity> = records
                .values()
                .filter(|record| statuses.is_empty() || statuses.contains(&record.status()))
                .map(|record| record.identity().clone())
                .collect();
            for key in &keys {
                records.remove(key);
            }
            keys
        };

        if !removed.is_empty() {
            info!(count = removed.len(), "Cleared status entries");
            for identity in &removed {
                self.publish(identity, None);
            }
            self.persist(&removed);
        }
        removed.len()
    }

    /// Load the persisted snapshot into memory.
    ///
    /// Records already held in memory are kept; the persisted alert policy
    /// replaces the configured one. Returns the loaded snapshot.
    pub fn seed_from_store(&self) -> Result<Option<PersistedSnapshot>> {
        let Some(snapshot) = self.store.load()? else {
            debug!("No persisted snapshot to seed from");
            return Ok(None);
        };

        let mut seeded = Vec::new();
        {
            let mut records = self.write_records();
            for (identity, record) in &snapshot.records {
                if !records.contains_key(identity) {
                    records.insert(identity.clone(), record.clone());
                    seeded.push(record.clone());
                }
            }
        }
        {
            let _guard = self.lock_persist();
            *self.write_policy() = snapshot.alert_policy.clone();
            self.policy_dirty.store(false, Ordering::Release);
        }

        info!(
            count = seeded.len(),
            writer = %snapshot.writer,
            "Seeded registry from snapshot"
        );
        for record in &seeded {
            self.publish(record.identity(), Some(record));
        }
        Ok(Some(snapshot))
    }

    /// Merge records owned by other registries from the store.
    ///
    /// Foreign records take the stored version when it is at least as new;
    /// foreign records missing from the store are dropped. Records owned by
    /// this registry are left alone. Returns the number of changed entries.
    pub fn refresh_from_store(&self) -> Result<usize> {
        let Some(snapshot) = self.store.load()? else {
            return Ok(0);
        };

        let mut changed: Vec<(SessionIdentity, Option<StatusRecord>)> = Vec::new();
        {
            let mut records = self.write_records();

            let gone: Vec<SessionIdentity> = records
                .values()
                .filter(|record| {
                    record.owner() != &self.owner
                        && !snapshot.records.contains_key(record.identity())
                })
                .map(|record| record.identity().clone())
                .collect();
            for identity in gone {
                records.remove(&identity);
                changed.push((identity, None));
            }

            for (identity, stored) in &snapshot.records {
                if stored.owner() == &self.owner {
                    continue;
                }
                let replace = match records.get(identity) {
                    None => true,
                    Some(current) if current.owner() == &self.owner => false,
                    Some(current) => {
                        current != stored
                            && stored.last_transition_time() >= current.last_transition_time()
                    }
                };
                if replace {
                    records.insert(identity.clone(), stored.clone());
                    changed.push((identity.clone(), Some(stored.clone())));
                }
            }
        }

        {
            let _guard = self.lock_persist();
            if !self.policy_dirty.load(Ordering::Acquire) {
                *self.write_policy() = snapshot.alert_policy;
            }
        }

        for (identity, record) in &changed {
            self.publish(identity, record.as_ref());
        }
        if !changed.is_empty() {
            debug!(count = changed.len(), "Refreshed foreign records from store");
        }
        Ok(changed.len())
    }

    /// Alert policy in effect.
    pub fn alert_policy(&self) -> AlertPolicy {
        self.alert_policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Turn alert dispatch on or off.
    pub fn set_alerts_enabled(&self, enabled: bool) {
        self.edit_policy(|policy| policy.enabled = enabled);
    }

    /// Replace the default alert categories.
    pub fn set_default_categories(&self, categories: BTreeSet<SessionStatus>) {
        self.edit_policy(|policy| policy.set_default_categories(categories));
    }

    /// Set the alert categories for one identity.
    ///
    /// The identity must be present and neither `DISCONNECTED` nor
    /// `STALE_SESSION`.
    pub fn set_alert_categories(
        &self,
        identity: &SessionIdentity,
        categories: BTreeSet<SessionStatus>,
    ) -> Result<()> {
        let record = self
            .get(identity)
            .ok_or_else(|| Error::SessionNotFound(identity.clone()))?;
        if record.status().is_terminal() {
            return Err(Error::PolicyEditRejected {
                identity: identity.clone(),
                status: record.status(),
            });
        }
        let identity = identity.clone();
        self.edit_policy(|policy| policy.set_override(identity, categories));
        Ok(())
    }

    /// Drop the per-identity override. Returns whether one existed.
    pub fn clear_alert_categories(&self, identity: &SessionIdentity) -> bool {
        let mut existed = false;
        self.edit_policy(|policy| existed = policy.clear_override(identity));
        existed
    }

    // Under the persist lock, so a concurrent write-through cannot replace
    // the edit with the stored policy before it is saved.
    fn edit_policy(&self, edit: impl FnOnce(&mut AlertPolicy)) {
        let _guard = self.lock_persist();
        edit(&mut self.write_policy());
        self.policy_dirty.store(true, Ordering::Release);
        self.write_through(&[]);
    }

    /// In-memory state as a snapshot.
    pub fn snapshot(&self) -> PersistedSnapshot {
        PersistedSnapshot::new(self.owner, self.list(), self.alert_policy())
    }

    fn publish(&self, identity: &SessionIdentity, record: Option<&StatusRecord>) {
        let publishers = self
            .publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for publisher in publishers {
            if let Err(e) = publisher.publish(identity, record) {
                warn!(%identity, "Status publish failed: {}", e);
            }
        }
    }

    // Read-merge-write so records written by other registries sharing the
    // store survive. `removed` lists identities this call deleted.
    fn persist(&self, removed: &[SessionIdentity]) {
        let _guard = self.lock_persist();
        self.write_through(removed);
    }

    // Caller holds the persist lock. Unless a local edit is pending, the
    // stored alert policy also becomes the one in memory, so edits made by
    // other processes reach this registry's alert gate.
    fn write_through(&self, removed: &[SessionIdentity]) {
        let dirty = self.policy_dirty.load(Ordering::Acquire);
        let mut stored_policy = None;
        let result = self.store.update(&mut |stored| {
            if !dirty {
                stored_policy = stored.as_ref().map(|s| s.alert_policy.clone());
            }
            let mut snapshot = self.merge_with_stored(stored);
            for identity in removed {
                snapshot.records.remove(identity);
            }
            snapshot
        });

        if let Some(policy) = stored_policy {
            *self.write_policy() = policy;
        }
        match result {
            Ok(()) => self.policy_dirty.store(false, Ordering::Release),
            Err(e) => error!("Failed to persist status snapshot: {}", e),
        }
    }

    // Own records come from memory. For foreign records the store decides
    // membership and the newer copy wins.
    fn merge_with_stored(&self, stored: Option<PersistedSnapshot>) -> PersistedSnapshot {
        let mut snapshot = self.snapshot();
        let Some(stored) = stored else {
            return snapshot;
        };

        if !self.policy_dirty.load(Ordering::Acquire) {
            snapshot.alert_policy = stored.alert_policy;
        }
        snapshot.records.retain(|identity, record| {
            record.owner() == &self.owner || stored.records.contains_key(identity)
        });
        for (identity, theirs) in stored.records {
            if theirs.owner() == &self.owner {
                continue;
            }
            match snapshot.records.get(&identity) {
                Some(ours) if ours.owner() == &self.owner => {}
                Some(ours) if ours.last_transition_time() >= theirs.last_transition_time() => {}
                _ => {
                    snapshot.records.insert(identity, theirs);
                }
            }
        }
        snapshot
    }

    fn lock_persist(&self) -> MutexGuard<'_, ()> {
        self.persist_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_records(&self) -> RwLockReadGuard<'_, HashMap<SessionIdentity, StatusRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_records(&self) -> RwLockWriteGuard<'_, HashMap<SessionIdentity, StatusRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_policy(&self) -> RwLockWriteGuard<'_, AlertPolicy> {
        self.alert_policy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for StatusRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusRegistry")
            .field("owner", &self.owner)
            .field("records", &self.len())
            .finish_non_exhaustive()
    }
}
