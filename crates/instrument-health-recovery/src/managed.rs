//! Recovery-managed session wrapper.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use instrument_health_core::{
    HealthConfig, InstrumentError, PreRetryAction, RecoveryError, RecoveryPolicy, RetryDelay,
    SessionDescriptor, SessionIdentity, SessionStatus, StatusEvent,
};
use instrument_health_registry::StatusRegistry;

use crate::cancel::Cancellation;
use crate::instrument::{Instrument, OperationTable};
use crate::manager::{RecoveryManager, ReportTarget};

/// What is being opened.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Instrument type, e.g. `PM100D`
    pub instrument: String,
    /// Serial number or transport address, if known before opening
    pub address: Option<String>,
    /// Model and device type shown next to the status
    pub descriptor: SessionDescriptor,
    /// Progress note shown while connecting
    pub note: Option<String>,
}

impl SessionSpec {
    /// Session of `instrument` with an unknown address.
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            address: None,
            descriptor: SessionDescriptor::default(),
            note: None,
        }
    }

    /// Set the address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the descriptor.
    pub fn with_descriptor(mut self, descriptor: SessionDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// Set the connecting note.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Policies used by a managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Policy for the typed safe façade, `reset_safe` and `reconnect_safe`
    pub policy: RecoveryPolicy,
    /// Policy for opening the session
    pub construction: RecoveryPolicy,
}

impl SessionOptions {
    /// Options taken from the `recovery` configuration section.
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            policy: config.recovery_policy(),
            construction: config.construction_policy(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            policy: RecoveryPolicy::default(),
            construction: RecoveryPolicy::new(2)
                .with_pre_retry(PreRetryAction::None)
                .with_delay(RetryDelay::Fixed(Duration::from_millis(500))),
        }
    }
}

/// An instrument session whose status is tracked in a [`StatusRegistry`].
///
/// The wrapper never derefs to the session: the raw driver is reached through
/// [`raw`](Self::raw), recovery-managed calls through [`safe`](Self::safe)
/// and the named `invoke*` entry points.
pub struct ManagedSession<S: Instrument> {
    session: Arc<S>,
    operations: OperationTable<S>,
    manager: RecoveryManager,
    target: RwLock<ReportTarget>,
    options: SessionOptions,
    closed: AtomicBool,
}

impl<S: Instrument> ManagedSession<S> {
    /// Register the identity at `CONNECTING`, then open the session with
    /// `open`, retrying per `options.construction`.
    ///
    /// A successful open reports `CONNECTED`; a failed one reports
    /// `UNRECOVERABLE_FAILURE` and returns the open error.
    pub fn connect<F>(
        registry: Arc<StatusRegistry>,
        spec: SessionSpec,
        options: SessionOptions,
        open: F,
    ) -> Result<Self, RecoveryError<InstrumentError>>
    where
        F: FnMut() -> Result<S, InstrumentError>,
    {
        let operations = S::operations()
            .map_err(|e| RecoveryError::Fatal(InstrumentError::InvalidArgument(e.to_string())))?;
        let identity = SessionIdentity::new(spec.instrument.as_str(), spec.address.as_deref())
            .map_err(|e| RecoveryError::Fatal(InstrumentError::InvalidArgument(e.to_string())))?;

        let mut target = register(&registry, identity, &spec)?;
        let manager = RecoveryManager::new(Arc::clone(&registry), Arc::new(Cancellation::new()));

        let session = match manager.execute(None, &options.construction, None, open) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                let error = e
                    .operation_error()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| e.to_string());
                warn!(identity = %target.identity, "Failed to open session: {}", error);
                registry.upsert_instance(
                    &target.identity,
                    target.instance,
                    StatusEvent::HandshakeFailed { error },
                );
                return Err(e);
            }
        };

        if let Some(resolved) = resolve_address(&target.identity, session.as_ref()) {
            target = register(&registry, resolved, &spec)?;
        }
        registry.upsert_instance(&target.identity, target.instance, StatusEvent::HandshakeSucceeded);
        info!(
            identity = %target.identity,
            safe_slot = operations.safe_slot_name(),
            "Session connected"
        );

        Ok(Self {
            session,
            operations,
            manager,
            target: RwLock::new(target),
            options,
            closed: AtomicBool::new(false),
        })
    }

    /// The wrapped driver.
    pub fn raw(&self) -> &S {
        &self.session
    }

    /// Recovery-managed façade using the session's default policy.
    pub fn safe(&self) -> SafeCalls<'_, S> {
        SafeCalls { owner: self }
    }

    /// Name the safe façade is reported under in logs. The accessor is
    /// always [`safe`](Self::safe).
    pub fn safe_slot_name(&self) -> &'static str {
        self.operations.safe_slot_name()
    }

    /// Named operations of this session.
    pub fn operations(&self) -> &OperationTable<S> {
        &self.operations
    }

    /// Current identity.
    pub fn identity(&self) -> SessionIdentity {
        self.target().identity
    }

    /// Current registry record's status.
    pub fn status(&self) -> Option<SessionStatus> {
        self.manager
            .registry()
            .get(&self.identity())
            .map(|record| record.status())
    }

    /// Whether `close` has run or the session was released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Call a named operation once, without recovery.
    pub fn invoke(&self, name: &str, args: &Value) -> Result<Value, InstrumentError> {
        if self.is_closed() {
            return Err(InstrumentError::ConnectionFailed(
                "session is closed".to_string(),
            ));
        }
        let operation = self
            .operations
            .get(name)
            .ok_or_else(|| InstrumentError::Unsupported(format!("unknown operation '{name}'")))?;
        operation.call(&self.session, args)
    }

    /// Call a named operation under its declared policy.
    pub fn invoke_safe(
        &self,
        name: &str,
        args: &Value,
    ) -> Result<Value, RecoveryError<InstrumentError>> {
        let operation = self.operations.get(name).ok_or_else(|| {
            RecoveryError::Fatal(InstrumentError::Unsupported(format!(
                "unknown operation '{name}'"
            )))
        })?;
        debug!(operation = name, "Invoking with recovery");
        self.run(operation.policy(), || operation.call(&self.session, args))
    }

    /// Reset the device under the session policy.
    pub fn reset_safe(&self) -> Result<(), RecoveryError<InstrumentError>> {
        let policy = self.options.policy.with_pre_retry(PreRetryAction::None);
        self.run(&policy, || self.session.reset())
    }

    /// Reconnect under the session policy.
    ///
    /// A successful reconnect of a session that is not `CONNECTED` registers
    /// a fresh instance for it, as if it had been constructed again.
    pub fn reconnect_safe(&self) -> Result<(), RecoveryError<InstrumentError>> {
        let policy = self.options.policy.with_pre_retry(PreRetryAction::None);
        self.run(&policy, || self.session.reconnect())?;

        if self.status() != Some(SessionStatus::Connected) && !self.is_closed() {
            self.reregister()?;
        }
        Ok(())
    }

    fn reregister(&self) -> Result<(), RecoveryError<InstrumentError>> {
        let registry = self.manager.registry();
        let current = self.target();
        let descriptor = registry
            .get(&current.identity)
            .map(|record| record.descriptor().clone())
            .unwrap_or_default();
        let identity = resolve_address(&current.identity, self.session.as_ref())
            .unwrap_or(current.identity);
        let spec = SessionSpec::new(identity.instrument()).with_descriptor(descriptor);

        let target = register(registry, identity, &spec)?;
        registry.upsert_instance(&target.identity, target.instance, StatusEvent::HandshakeSucceeded);
        info!(identity = %target.identity, "Session re-registered after reconnect");
        *self.target.write().unwrap_or_else(PoisonError::into_inner) = target;
        Ok(())
    }

    /// Close the session and report `DISCONNECTED`.
    ///
    /// Idempotent. Interrupts any retry loop waiting on its delay. The
    /// driver's close error, if any, is recorded and returned.
    pub fn close(&self) -> Result<(), InstrumentError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.manager.cancellation().cancel();

        let result = self.session.close();
        let target = self.target();
        self.manager.registry().upsert_instance(
            &target.identity,
            target.instance,
            StatusEvent::Closed {
                error: result.as_ref().err().map(ToString::to_string),
            },
        );
        info!(identity = %target.identity, "Session closed");
        result
    }

    fn run<T, F>(&self, policy: &RecoveryPolicy, operation: F) -> Result<T, RecoveryError<InstrumentError>>
    where
        F: FnMut() -> Result<T, InstrumentError>,
    {
        let target = self.target();
        let actions: Arc<dyn Instrument> = self.session.clone();
        self.manager
            .execute(Some(&target), policy, Some(&actions), operation)
    }

    fn target(&self) -> ReportTarget {
        self.target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<S: Instrument> Drop for ManagedSession<S> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.manager.cancellation().cancel();
        let target = self.target();
        debug!(identity = %target.identity, "Session released without close");
        self.manager
            .registry()
            .upsert_instance(&target.identity, target.instance, StatusEvent::Released);
    }
}

impl<S: Instrument> fmt::Debug for ManagedSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedSession")
            .field("target", &self.target())
            .field("operations", &self.operations)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Typed calls routed through the recovery manager.
pub struct SafeCalls<'a, S: Instrument> {
    owner: &'a ManagedSession<S>,
}

impl<'a, S: Instrument> SafeCalls<'a, S> {
    /// Run `call` under the session's default policy.
    pub fn call<T, F>(&self, call: F) -> Result<T, RecoveryError<InstrumentError>>
    where
        F: FnMut(&S) -> Result<T, InstrumentError>,
    {
        self.call_with(&self.owner.options.policy, call)
    }

    /// Run `call` under `policy`.
    pub fn call_with<T, F>(
        &self,
        policy: &RecoveryPolicy,
        mut call: F,
    ) -> Result<T, RecoveryError<InstrumentError>>
    where
        F: FnMut(&S) -> Result<T, InstrumentError>,
    {
        let session: &S = &self.owner.session;
        self.owner.run(policy, || call(session))
    }
}

fn register(
    registry: &StatusRegistry,
    identity: SessionIdentity,
    spec: &SessionSpec,
) -> Result<ReportTarget, RecoveryError<InstrumentError>> {
    let record = registry
        .upsert(
            &identity,
            StatusEvent::ConstructionStarted {
                descriptor: spec.descriptor.clone(),
                note: spec.note.clone(),
            },
        )
        .ok_or_else(|| {
            RecoveryError::Fatal(InstrumentError::Inconsistent(format!(
                "registry refused construction of {identity}"
            )))
        })?;
    Ok(ReportTarget {
        instance: record.instance(),
        identity,
    })
}

// Identity with the device-reported address when the current one is
// still unresolved.
fn resolve_address<S: Instrument>(
    identity: &SessionIdentity,
    session: &S,
) -> Option<SessionIdentity> {
    if identity.address().is_resolved() {
        return None;
    }
    let address = session.address()?;
    match SessionIdentity::resolved(identity.instrument(), address) {
        Ok(resolved) => Some(resolved),
        Err(e) => {
            warn!(%identity, "Ignoring device-reported address: {}", e);
            None
        }
    }
}
