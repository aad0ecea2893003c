//! The instrument driver seam and named operation tables.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use instrument_health_core::{Error, InstrumentError, RecoveryPolicy, Result};

/// Names a session operation may not use; they are entry points of
/// [`crate::ManagedSession`].
pub const RESERVED_OPERATION_NAMES: [&str; 5] = [
    "invoke",
    "invoke_safe",
    "reconnect_safe",
    "reset_safe",
    "safe_proxy",
];

/// A driver for one hardware session.
///
/// Implementations use interior mutability for transport state; every call
/// may come from a different thread, and `reset`/`reconnect` may run on a
/// helper thread while the caller waits with a timeout.
pub trait Instrument: Send + Sync + 'static {
    /// Reset the device. Unsupported unless overridden.
    fn reset(&self) -> std::result::Result<(), InstrumentError> {
        Err(InstrumentError::Unsupported("reset".to_string()))
    }

    /// Re-establish the transport. Unsupported unless overridden.
    fn reconnect(&self) -> std::result::Result<(), InstrumentError> {
        Err(InstrumentError::Unsupported("reconnect".to_string()))
    }

    /// Release the transport.
    fn close(&self) -> std::result::Result<(), InstrumentError> {
        Ok(())
    }

    /// Serial number or transport address, once known.
    fn address(&self) -> Option<String> {
        None
    }

    /// Named operations exposed through `invoke` and `invoke_safe`.
    fn operations() -> Result<OperationTable<Self>>
    where
        Self: Sized,
    {
        Ok(OperationTable::new())
    }
}

/// Callable behind a named operation.
pub type OperationFn<S> =
    Arc<dyn Fn(&S, &Value) -> std::result::Result<Value, InstrumentError> + Send + Sync>;

/// One named operation and the policy its safe invocation uses.
pub struct Operation<S> {
    name: String,
    policy: RecoveryPolicy,
    call: OperationFn<S>,
}

impl<S> Operation<S> {
    /// Operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Policy for `invoke_safe`.
    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Run once against `session`.
    pub fn call(&self, session: &S, args: &Value) -> std::result::Result<Value, InstrumentError> {
        (self.call)(session, args)
    }
}

impl<S> Clone for Operation<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            policy: self.policy,
            call: Arc::clone(&self.call),
        }
    }
}

impl<S> fmt::Debug for Operation<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Named operations of one instrument type.
pub struct OperationTable<S> {
    operations: BTreeMap<String, Operation<S>>,
}

impl<S> OperationTable<S> {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            operations: BTreeMap::new(),
        }
    }

    /// Declare an operation.
    ///
    /// Fails for reserved or duplicate names.
    pub fn register<F>(&mut self, name: &str, policy: RecoveryPolicy, call: F) -> Result<()>
    where
        F: Fn(&S, &Value) -> std::result::Result<Value, InstrumentError> + Send + Sync + 'static,
    {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput(
                "operation name cannot be empty".to_string(),
            ));
        }
        if RESERVED_OPERATION_NAMES.contains(&name) {
            return Err(Error::ReservedOperationName(name.to_string()));
        }
        if self.operations.contains_key(name) {
            return Err(Error::InvalidInput(format!(
                "operation '{name}' declared twice"
            )));
        }
        self.operations.insert(
            name.to_string(),
            Operation {
                name: name.to_string(),
                policy,
                call: Arc::new(call),
            },
        );
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, name: &str, policy: RecoveryPolicy, call: F) -> Result<Self>
    where
        F: Fn(&S, &Value) -> std::result::Result<Value, InstrumentError> + Send + Sync + 'static,
    {
        self.register(name, policy, call)?;
        Ok(self)
    }

    /// Look up an operation.
    pub fn get(&self, name: &str) -> Option<&Operation<S>> {
        self.operations.get(name)
    }

    /// Whether `name` is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Declared names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether no operations are declared.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Slot name of the safe façade: `safe`, or `safe_proxy` when the
    /// session declares its own `safe` operation.
    ///
    /// Informational only. The façade is always reached through
    /// `ManagedSession::safe`, which never shadows a named operation; the
    /// name is what logs and displays call it.
    pub fn safe_slot_name(&self) -> &'static str {
        if self.contains("safe") {
            "safe_proxy"
        } else {
            "safe"
        }
    }
}

impl<S> Default for OperationTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for OperationTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.operations.keys()).finish()
    }
}
