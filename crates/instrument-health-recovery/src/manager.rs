//! Bounded retry with pre-retry recovery actions.

use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use instrument_health_core::{
    ClassifyFailure, FailureClass, InstanceId, InstrumentError, PreRetryAction, RecoveryError,
    RecoveryPolicy, SessionIdentity, SessionStatus, StatusEvent,
};
use instrument_health_registry::StatusRegistry;

use crate::cancel::Cancellation;
use crate::instrument::Instrument;

/// Registry entry a retry loop reports to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTarget {
    /// Session identity
    pub identity: SessionIdentity,
    /// Construction instance the reports belong to
    pub instance: InstanceId,
}

/// Result of one managed call plus the attempts it took.
#[derive(Debug)]
pub struct Outcome<T, E> {
    /// Call result
    pub result: Result<T, RecoveryError<E>>,
    /// Attempts made, 0 when the call never ran
    pub attempts: u32,
}

/// Runs operations under a [`RecoveryPolicy`], reporting outcomes to the
/// registry.
///
/// Reports go through `upsert_instance`, so a loop that outlives its session
/// instance cannot touch the newer record.
#[derive(Clone)]
pub struct RecoveryManager {
    registry: Arc<StatusRegistry>,
    cancellation: Arc<Cancellation>,
}

impl RecoveryManager {
    /// Manager reporting to `registry`, stopped by `cancellation`.
    pub fn new(registry: Arc<StatusRegistry>, cancellation: Arc<Cancellation>) -> Self {
        Self {
            registry,
            cancellation,
        }
    }

    /// Registry the manager reports to.
    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    /// Cancellation shared with the owning session.
    pub fn cancellation(&self) -> &Arc<Cancellation> {
        &self.cancellation
    }

    /// Run `operation` under `policy`.
    ///
    /// `actions` supplies reset/reconnect for the pre-retry action; `target`
    /// is the registry entry to report to, `None` to run silently.
    pub fn execute<T, E, F>(
        &self,
        target: Option<&ReportTarget>,
        policy: &RecoveryPolicy,
        actions: Option<&Arc<dyn Instrument>>,
        operation: F,
    ) -> Result<T, RecoveryError<E>>
    where
        E: ClassifyFailure + fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        self.execute_with_outcome(target, policy, actions, operation)
            .result
    }

    /// Like [`execute`](Self::execute), also returning the attempt count.
    pub fn execute_with_outcome<T, E, F>(
        &self,
        target: Option<&ReportTarget>,
        policy: &RecoveryPolicy,
        actions: Option<&Arc<dyn Instrument>>,
        mut operation: F,
    ) -> Outcome<T, E>
    where
        E: ClassifyFailure + fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        if self.cancellation.is_cancelled() {
            return Outcome {
                result: Err(RecoveryError::Closed),
                attempts: 0,
            };
        }

        let attempts = policy.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match operation() {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempts = attempt, "Operation recovered");
                        self.report(target, StatusEvent::RecoverySucceeded);
                    } else if self.is_revived(target) {
                        debug!("First operation after revival succeeded");
                        self.report(target, StatusEvent::RecoverySucceeded);
                    }
                    return Outcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            if error.failure_class() == FailureClass::Fatal {
                warn!(attempt, "Operation failed with fatal error: {}", error);
                self.report(
                    target,
                    StatusEvent::FatalFailure {
                        error: error.to_string(),
                    },
                );
                return Outcome {
                    result: Err(RecoveryError::Fatal(error)),
                    attempts: attempt,
                };
            }

            warn!("Operation failed (attempt {}/{}): {}", attempt, attempts, error);
            if attempt >= attempts {
                self.report(
                    target,
                    StatusEvent::RetriesExhausted {
                        error: error.to_string(),
                    },
                );
                return Outcome {
                    result: Err(RecoveryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    }),
                    attempts: attempt,
                };
            }

            self.report(
                target,
                StatusEvent::RecoverableFailure {
                    error: error.to_string(),
                },
            );

            if self.cancellation.is_cancelled() {
                return self.cancelled(attempt);
            }
            if let Some(actions) = actions {
                run_pre_retry(actions, policy.pre_retry_action, policy.pre_retry_timeout);
            }
            if !self.cancellation.sleep(policy.delay.for_retry(attempt)) {
                return self.cancelled(attempt);
            }
        }
    }

    fn cancelled<T, E>(&self, attempts: u32) -> Outcome<T, E> {
        debug!(attempts, "Retry loop cancelled");
        Outcome {
            result: Err(RecoveryError::Cancelled),
            attempts,
        }
    }

    // The target record was put back to CONNECTING after its backend came back and
    // waits for an operation outcome.
    fn is_revived(&self, target: Option<&ReportTarget>) -> bool {
        target.is_some_and(|target| {
            self.registry.get(&target.identity).is_some_and(|record| {
                record.instance() == target.instance
                    && record.status() == SessionStatus::Connecting
            })
        })
    }

    fn report(&self, target: Option<&ReportTarget>, event: StatusEvent) {
        if let Some(target) = target {
            self.registry
                .upsert_instance(&target.identity, target.instance, event);
        }
    }
}

impl fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Reset,
    Reconnect,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Reset => f.write_str("reset"),
            Step::Reconnect => f.write_str("reconnect"),
        }
    }
}

/// Run the pre-retry action. Failures are logged; the retry goes ahead.
fn run_pre_retry(actions: &Arc<dyn Instrument>, action: PreRetryAction, timeout: Duration) {
    let steps: &[Step] = match action {
        PreRetryAction::None => &[],
        PreRetryAction::Reset => &[Step::Reset],
        PreRetryAction::Reconnect => &[Step::Reconnect],
        PreRetryAction::ResetThenReconnect => &[Step::Reset, Step::Reconnect],
    };

    for step in steps {
        match run_bounded(actions, *step, timeout) {
            Ok(()) => {
                debug!(%step, "Pre-retry action succeeded");
                return;
            }
            Err(e) => warn!(%step, "Pre-retry action failed: {}", e),
        }
    }
    if !steps.is_empty() {
        warn!("No recovery path succeeded before retry");
    }
}

// The helper thread is detached on timeout; a hung driver call cannot block
// the retry loop.
fn run_bounded(
    actions: &Arc<dyn Instrument>,
    step: Step,
    timeout: Duration,
) -> Result<(), InstrumentError> {
    let (tx, rx) = mpsc::channel();
    let instrument = Arc::clone(actions);

    thread::Builder::new()
        .name(format!("pre-retry-{step}"))
        .spawn(move || {
            let result = match step {
                Step::Reset => instrument.reset(),
                Step::Reconnect => instrument.reconnect(),
            };
            let _ = tx.send(result);
        })
        .map_err(|e| InstrumentError::Transport(format!("failed to spawn {step} thread: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(InstrumentError::Timeout(format!(
            "{step} did not finish within {timeout:?}"
        ))),
        Err(RecvTimeoutError::Disconnected) => Err(InstrumentError::Transport(format!(
            "{step} thread ended without a result"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instrument_health_core::{RetryDelay, SessionStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counting {
        resets: AtomicU32,
        reconnects: AtomicU32,
        reset_fails: bool,
        reset_hangs: bool,
    }

    impl Instrument for Counting {
        fn reset(&self) -> Result<(), InstrumentError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if self.reset_hangs {
                thread::sleep(Duration::from_millis(500));
            }
            if self.reset_fails {
                return Err(InstrumentError::Busy("controller busy".into()));
            }
            Ok(())
        }

        fn reconnect(&self) -> Result<(), InstrumentError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast(retries: u32) -> RecoveryPolicy {
        RecoveryPolicy::new(retries).with_delay(RetryDelay::Fixed(Duration::from_millis(1)))
    }

    fn setup() -> (RecoveryManager, ReportTarget) {
        let registry = Arc::new(StatusRegistry::in_memory().unwrap());
        let identity = SessionIdentity::resolved("BSC203", "40000001").unwrap();
        let record = registry
            .upsert(&identity, StatusEvent::construction())
            .unwrap();
        registry.upsert(&identity, StatusEvent::HandshakeSucceeded);
        let target = ReportTarget {
            identity,
            instance: record.instance(),
        };
        (
            RecoveryManager::new(registry, Arc::new(Cancellation::new())),
            target,
        )
    }

    fn status(manager: &RecoveryManager, target: &ReportTarget) -> SessionStatus {
        manager.registry().get(&target.identity).unwrap().status()
    }

    #[test]
    fn test_success_first_try_reports_nothing() {
        let (manager, target) = setup();
        let outcome = manager.execute_with_outcome(Some(&target), &fast(2), None, || {
            Ok::<_, InstrumentError>(42)
        });
        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(status(&manager, &target), SessionStatus::Connected);
    }

    #[test]
    fn test_recovers_after_retry() {
        let (manager, target) = setup();
        let calls = AtomicU32::new(0);
        let result = manager.execute(Some(&target), &fast(2), None, || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(InstrumentError::Timeout("read".into()))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let record = manager.registry().get(&target.identity).unwrap();
        assert_eq!(record.status(), SessionStatus::Connected);
        assert_eq!(record.last_error(), None);
    }

    #[test]
    fn test_exhausted_after_n_plus_one_attempts() {
        let (manager, target) = setup();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = manager.execute(Some(&target), &fast(3), None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(InstrumentError::Busy("bus".into()))
        });
        assert!(matches!(result, Err(RecoveryError::Exhausted { attempts: 4, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(status(&manager, &target), SessionStatus::UnrecoverableFailure);
    }

    #[test]
    fn test_fatal_is_not_retried() {
        let (manager, target) = setup();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = manager.execute(Some(&target), &fast(5), None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(InstrumentError::InvalidArgument("wavelength 9000 nm".into()))
        });
        assert!(matches!(result, Err(RecoveryError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let record = manager.registry().get(&target.identity).unwrap();
        assert_eq!(record.status(), SessionStatus::UnrecoverableFailure);
        assert!(record.last_error().unwrap().contains("wavelength 9000 nm"));
    }

    #[test]
    fn test_reset_then_reconnect_falls_back() {
        let (manager, target) = setup();
        let counting = Arc::new(Counting {
            reset_fails: true,
            ..Counting::default()
        });
        let actions: Arc<dyn Instrument> = counting.clone();
        let _ = manager.execute(Some(&target), &fast(2), Some(&actions), || {
            Err::<(), _>(InstrumentError::Timeout("read".into()))
        });
        assert_eq!(counting.resets.load(Ordering::SeqCst), 2);
        assert_eq!(counting.reconnects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_successful_reset_skips_reconnect() {
        let (manager, target) = setup();
        let counting = Arc::new(Counting::default());
        let actions: Arc<dyn Instrument> = counting.clone();
        let _ = manager.execute(Some(&target), &fast(1), Some(&actions), || {
            Err::<(), _>(InstrumentError::Timeout("read".into()))
        });
        assert_eq!(counting.resets.load(Ordering::SeqCst), 1);
        assert_eq!(counting.reconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_hung_pre_retry_action_is_bounded() {
        let (manager, target) = setup();
        let counting = Arc::new(Counting {
            reset_hangs: true,
            ..Counting::default()
        });
        let actions: Arc<dyn Instrument> = counting.clone();
        let policy = fast(1)
            .with_pre_retry(PreRetryAction::Reset)
            .with_pre_retry_timeout(Duration::from_millis(20));
        let start = std::time::Instant::now();
        let calls = AtomicU32::new(0);
        let result = manager.execute(Some(&target), &policy, Some(&actions), || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(InstrumentError::Timeout("read".into()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_cancelled_manager_refuses_to_run() {
        let (manager, target) = setup();
        manager.cancellation().cancel();
        let outcome = manager.execute_with_outcome(Some(&target), &fast(2), None, || {
            Ok::<_, InstrumentError>(())
        });
        assert!(matches!(outcome.result, Err(RecoveryError::Closed)));
        assert_eq!(outcome.attempts, 0);
    }

    #[test]
    fn test_cancel_during_delay() {
        let (manager, target) = setup();
        let policy = RecoveryPolicy::new(3)
            .with_pre_retry(PreRetryAction::None)
            .with_delay(RetryDelay::Fixed(Duration::from_secs(30)));
        let cancel = Arc::clone(manager.cancellation());
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        });
        let outcome = manager.execute_with_outcome(Some(&target), &policy, None, || {
            Err::<(), _>(InstrumentError::Timeout("read".into()))
        });
        canceller.join().unwrap();
        assert!(matches!(outcome.result, Err(RecoveryError::Cancelled)));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(status(&manager, &target), SessionStatus::Warning);
    }

    #[test]
    fn test_silent_run_leaves_registry_alone() {
        let (manager, target) = setup();
        let _: Result<(), _> = manager.execute(None, &fast(1), None, || {
            Err(InstrumentError::Timeout("read".into()))
        });
        assert_eq!(status(&manager, &target), SessionStatus::Connected);
    }
}
