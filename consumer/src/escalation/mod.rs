//! Severity escalation.
//!
//! A caught [`Failure`] is routed by its [`ErrorLevel`]: warnings are
//! absorbed, errors stop the consumer loop, critical failures close the
//! consumer and are parked in the [`DeferredCritical`] mailbox so the next
//! producer call replays them.
//!
//! [`handle`] applies the same level dispatch outside a consumer.

use std::collections::VecDeque;

use tracing::{error, warn};

use crate::errors::{ConsumerError, ErrorLevel, Failure};

/// What escalation hooks may do to the consumer that raised the failure.
///
/// `stop` and `close` are safe to call from any thread, the worker thread
/// included, and are no-ops when the consumer is already stopped.
pub trait Control {
    fn name(&self) -> &str;

    fn stop(&self) -> Result<(), ConsumerError>;

    fn close(&self) -> Result<(), ConsumerError>;

    fn defer_critical(&self, failure: Failure);

    fn enter_error_handling(&self);

    fn leave_error_handling(&self);

    fn is_handling_error(&self) -> bool;

    fn is_running(&self) -> bool;

    fn is_initialized(&self) -> bool;
}

/// Hooks run for each severity. The defaults implement the standard policy;
/// override a hook to change what a level does to the consumer.
pub trait Escalation: Send + Sync + 'static {
    fn on_warning(&self, _failure: &Failure, _control: &dyn Control) {}

    fn on_error(&self, _failure: &Failure, control: &dyn Control) {
        stop_for_error(control);
    }

    fn on_critical(&self, failure: &Failure, control: &dyn Control) {
        close_for_critical(failure, control);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEscalation;

impl Escalation for DefaultEscalation {}

/// Default error action: stop the loop while flagged as handling an error.
pub fn stop_for_error(control: &dyn Control) {
    control.enter_error_handling();
    if let Err(err) = control.stop() {
        error!(consumer = control.name(), %err, "failed to stop consumer while handling an error");
    }
    control.leave_error_handling();
}

/// Default critical action: park the failure for replay and close the consumer.
pub fn close_for_critical(failure: &Failure, control: &dyn Control) {
    control.enter_error_handling();
    control.defer_critical(failure.clone());
    if let Err(err) = control.close() {
        error!(consumer = control.name(), %err, "failed to close consumer after a critical failure");
    }
    control.leave_error_handling();
}

/// What a caller outside a consumer should do after [`handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    /// Warning: carry on.
    Continue,
    /// Error or untagged failure: stop the current operation.
    Stop,
    /// Critical: pass the failure on to the caller.
    Rethrow,
}

impl HandleStatus {
    pub fn for_level(level: ErrorLevel) -> HandleStatus {
        match level {
            ErrorLevel::Warning => HandleStatus::Continue,
            ErrorLevel::Error | ErrorLevel::Unknown => HandleStatus::Stop,
            ErrorLevel::Critical => HandleStatus::Rethrow,
        }
    }
}

/// Optional per-level callbacks for [`handle`]. Untagged failures go to `on_error`.
#[derive(Default, Clone, Copy)]
pub struct Handlers<'a> {
    pub on_warning: Option<&'a dyn Fn(&Failure)>,
    pub on_error: Option<&'a dyn Fn(&Failure)>,
    pub on_critical: Option<&'a dyn Fn(&Failure)>,
}

// Logs `failure` at its level and runs the matching action.
fn dispatch<W, E, C>(failure: &Failure, consumer: Option<&str>, on_warning: W, on_error: E, on_critical: C)
where
    W: FnOnce(),
    E: FnOnce(),
    C: FnOnce(),
{
    let consumer = consumer.unwrap_or("-");
    match failure.level() {
        ErrorLevel::Warning => {
            warn!(consumer, %failure, "absorbed warning");
            on_warning();
        }
        ErrorLevel::Error => {
            error!(consumer, %failure, "error, stopping");
            on_error();
        }
        ErrorLevel::Critical => {
            error!(consumer, severity = "critical", %failure, "critical failure");
            on_critical();
        }
        ErrorLevel::Unknown => {
            error!(consumer, %failure, "untagged failure, handling it as an error");
            on_error();
        }
    }
}

fn call(callback: Option<&dyn Fn(&Failure)>, failure: &Failure) {
    if let Some(callback) = callback {
        callback(failure);
    }
}

/// Level-driven handling for code that does not run inside a consumer.
///
/// ```
/// use consumer::escalation::{handle, HandleStatus, Handlers};
/// use consumer::{ErrorLevel, Failure};
///
/// let failure = Failure::msg(ErrorLevel::Warning, "gain clipped");
/// assert_eq!(handle(&failure, &Handlers::default()), HandleStatus::Continue);
/// ```
pub fn handle(failure: &Failure, handlers: &Handlers<'_>) -> HandleStatus {
    dispatch(
        failure,
        None,
        || call(handlers.on_warning, failure),
        || call(handlers.on_error, failure),
        || call(handlers.on_critical, failure),
    );
    HandleStatus::for_level(failure.level())
}

/// Logs `failure`, runs the matching hook and returns the level it was handled at.
///
/// Must not be called while the consumer's slot lock is held: hooks may stop
/// the consumer, which locks the slot to wake the worker.
pub fn escalate(failure: &Failure, hooks: &dyn Escalation, control: &dyn Control) -> ErrorLevel {
    dispatch(
        failure,
        Some(control.name()),
        || hooks.on_warning(failure, control),
        || hooks.on_error(failure, control),
        || hooks.on_critical(failure, control),
    );
    failure.level()
}

/// Bounded mailbox of critical failures waiting to be replayed to producers.
///
/// The mailbox is armed while it holds anything. Replay pops the head while
/// more than one failure is pending; the last one stays armed and is replayed
/// on every call until [`clear`](DeferredCritical::clear).
#[derive(Debug)]
pub struct DeferredCritical {
    pending: VecDeque<Failure>,
    capacity: usize,
}

impl DeferredCritical {
    pub fn new(capacity: usize) -> DeferredCritical {
        DeferredCritical {
            pending: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Parks `failure`. When full, the earliest failures are kept and
    /// `failure` is dropped.
    pub fn push(&mut self, failure: Failure) {
        if self.pending.len() >= self.capacity {
            warn!(%failure, capacity = self.capacity, "deferred critical mailbox full, dropping failure");
            return;
        }
        self.pending.push_back(failure);
    }

    pub fn replay(&mut self) -> Option<Failure> {
        if self.pending.len() > 1 {
            self.pending.pop_front()
        } else {
            self.pending.front().cloned()
        }
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        !self.pending.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
