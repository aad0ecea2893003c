//! Alert policy gate and dispatchers.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, error, info, warn};

use instrument_health_core::{
    AlertPolicy, Error, Result, SessionIdentity, SessionStatus, StatusRecord,
};

/// Alert handed to the alert collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRequest {
    /// Identity that changed status
    pub identity: SessionIdentity,
    /// Status that matched the policy
    pub category: SessionStatus,
    /// Human-readable body
    pub message: String,
    /// Transition time
    pub timestamp: DateTime<Utc>,
}

impl AlertRequest {
    /// Build the request for `record`.
    pub fn for_record(record: &StatusRecord) -> Self {
        let descriptor = record.descriptor();
        let timestamp = record.last_transition_time();
        let message = format!(
            "An instrument status event matched the alert policy.\n\n\
             Category: {category}\n\
             Instrument: {instrument}\n\
             Model: {model}\n\
             Type: {device_type}\n\
             Address: {address}\n\
             Status: {category}\n\
             Updated (UTC): {updated}\n\
             Error: {error}\n",
            category = record.status(),
            instrument = record.identity().instrument(),
            model = descriptor.model,
            device_type = descriptor.device_type,
            address = record.identity().address(),
            updated = timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            error = record.last_error().unwrap_or(""),
        );
        Self {
            identity: record.identity().clone(),
            category: record.status(),
            message,
            timestamp,
        }
    }

    /// One-line subject.
    pub fn subject(&self) -> String {
        format!("[Instrument Alert:{}] {}", self.category, self.identity)
    }
}

/// Delivers alerts (mail, chat, pager).
pub trait AlertDispatcher: Send + Sync {
    /// Deliver one alert.
    fn dispatch(&self, request: &AlertRequest) -> Result<()>;
}

/// Writes alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

impl AlertDispatcher for LogDispatcher {
    fn dispatch(&self, request: &AlertRequest) -> Result<()> {
        warn!(
            identity = %request.identity,
            category = %request.category,
            "{}\n{}",
            request.subject(),
            request.message
        );
        Ok(())
    }
}

/// Whether a change from `before` to `after` matches `policy`.
///
/// Fires only on an actual status change into a category resolved for the
/// identity.
pub fn should_alert(
    before: Option<&StatusRecord>,
    after: &StatusRecord,
    policy: &AlertPolicy,
) -> bool {
    if before.map(StatusRecord::status) == Some(after.status()) {
        return false;
    }
    policy.should_alert(after.identity(), after.status())
}

enum AlertCommand {
    Dispatch(Box<AlertRequest>),
    Shutdown,
}

/// Filters transitions through the alert policy and dispatches matches on a
/// dedicated worker thread.
pub struct AlertGate {
    tx: Sender<AlertCommand>,
    handle: Option<JoinHandle<()>>,
}

impl AlertGate {
    /// Start the worker thread for `dispatcher`.
    pub fn new(dispatcher: Arc<dyn AlertDispatcher>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<AlertCommand>();

        let handle = thread::Builder::new()
            .name("alert-dispatch".into())
            .spawn(move || {
                for command in rx {
                    match command {
                        AlertCommand::Dispatch(request) => {
                            if let Err(e) = dispatcher.dispatch(&request) {
                                error!(identity = %request.identity, "Alert dispatch failed: {}", e);
                            }
                        }
                        AlertCommand::Shutdown => {
                            debug!("Alert worker received shutdown signal");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| Error::Other(format!("Failed to spawn alert worker: {e}")))?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Gate one transition. Returns whether an alert was queued.
    pub fn maybe_alert(
        &self,
        before: Option<&StatusRecord>,
        after: &StatusRecord,
        policy: &AlertPolicy,
    ) -> bool {
        if !should_alert(before, after, policy) {
            return false;
        }

        let request = AlertRequest::for_record(after);
        info!(identity = %request.identity, category = %request.category, "Queueing alert");
        if self
            .tx
            .send(AlertCommand::Dispatch(Box::new(request)))
            .is_err()
        {
            warn!("Alert worker is gone; alert dropped");
            return false;
        }
        true
    }
}

impl Drop for AlertGate {
    fn drop(&mut self) {
        let _ = self.tx.send(AlertCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                warn!("Alert worker panicked: {:?}", e);
            }
        }
    }
}
