//! The consumer: one worker thread draining a producer-fed buffer.
//!
//! Producers call [`Consumer::feed`], which pushes into the buffer under the
//! designated slot's lock and signals the slot. The worker waits on that slot,
//! moves one unit out of the buffer while holding the lock and processes it
//! after releasing it. Failures on either side go through [`escalate`].
//!
//! States: uninitialized, idle (after `init` or `stop`), running (after
//! `start`, or lazily on the first `feed`), draining (the worker thread after
//! its loop exits) and closed (after `close` or a critical failure).

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::core::{Buffer, ConsumerConfig, Processor};
use crate::errors::{ConsumerError, ErrorLevel, Failure};
use crate::escalation::{escalate, Control, DefaultEscalation, DeferredCritical, Escalation};
use crate::locks::{LockSet, RendezvousGuard};

thread_local! {
    // Address of the `Shared` whose worker runs on this thread, 0 elsewhere.
    static WORKER_OF: Cell<usize> = Cell::new(0);
}

/// Outcome of a [`Consumer::feed`] call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fed {
    /// The item is in the buffer.
    Queued,
    /// The buffer refused the item with a non-critical failure.
    Rejected,
    /// The consumer was handling an error; the item was not enqueued.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerState {
    pub initialized: bool,
    pub running: bool,
    pub handling_error: bool,
}

#[derive(Debug, Error)]
#[error("processor panicked: {0}")]
struct Panicked(String);

#[derive(Debug, Error)]
#[error("designated slot {0} holds no buffer")]
struct MissingBuffer(usize);

struct Worker<P> {
    handle: Option<JoinHandle<P>>,
    processor: Option<P>,
}

struct Shared<B, P>
where
    B: Buffer,
    P: Processor<B::Unit>,
{
    config: ConsumerConfig,
    // The designated slot's payload is the buffer; every other slot holds `None`.
    locks: LockSet<Option<B>>,
    initialized: AtomicBool,
    running: AtomicBool,
    handling_error: AtomicUsize,
    deferred: Mutex<DeferredCritical>,
    escalation: Box<dyn Escalation>,
    // Only locked by non-worker threads, which may hold it across a join.
    worker: Mutex<Worker<P>>,
}

fn buffer_mut<'g, B>(guard: &'g mut RendezvousGuard<'_, Option<B>>) -> Result<&'g mut B, Failure> {
    let index = guard.index();
    guard
        .payload_mut()?
        .as_mut()
        .ok_or_else(|| Failure::critical(MissingBuffer(index)))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// Processing is user code; a panic there is routed like an untagged failure
// instead of taking the worker thread (and the processor) down.
fn shielded<F>(f: F) -> Result<(), Failure>
where
    F: FnOnce() -> Result<(), Failure>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(Failure::untagged(Panicked(panic_message(payload)))),
    }
}

impl<B, P> Shared<B, P>
where
    B: Buffer,
    P: Processor<B::Unit>,
{
    #[inline]
    fn id(&self) -> usize {
        self as *const Self as usize
    }

    fn on_worker_thread(&self) -> bool {
        let id = self.id();
        WORKER_OF.with(|worker| worker.get() == id)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Worker<P>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mailbox(&self) -> MutexGuard<'_, DeferredCritical> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn escalate(&self, failure: &Failure) -> ErrorLevel {
        escalate(failure, self.escalation.as_ref(), self)
    }

    fn state(&self) -> ConsumerState {
        ConsumerState {
            initialized: self.is_initialized(),
            running: self.is_running(),
            handling_error: self.is_handling_error(),
        }
    }

    fn start(self: &Arc<Self>) -> Result<(), ConsumerError> {
        let worker = self.lifecycle();
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.launch(worker)
    }

    // Restart on the feed path. A consumer closed by another producer, or one
    // with a critical failure still armed, stays down until init + start.
    fn resume(self: &Arc<Self>) -> Result<(), ConsumerError> {
        let worker = self.lifecycle();
        if self.running.load(Ordering::SeqCst) || !self.is_initialized() {
            return Ok(());
        }
        if self.mailbox().is_armed() {
            trace!(consumer = %self.config.name, "critical failure pending, not restarting");
            return Ok(());
        }
        self.launch(worker)
    }

    fn launch(self: &Arc<Self>, mut worker: MutexGuard<'_, Worker<P>>) -> Result<(), ConsumerError> {
        // reclaim the processor from a worker that stopped on its own
        self.join(&mut worker)?;
        self.locks.reset(self.config.slot)?;
        let processor = worker.processor.take().ok_or(ConsumerError::ProcessorLost)?;
        self.mailbox().clear();

        self.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || shared.run(processor));
        match spawned {
            Ok(handle) => {
                worker.handle = Some(handle);
                info!(consumer = %self.config.name, "consumer loop started");
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(ConsumerError::Spawn(err))
            }
        }
    }

    fn join(&self, worker: &mut Worker<P>) -> Result<(), ConsumerError> {
        let handle = match worker.handle.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        match handle.join() {
            Ok(processor) => {
                worker.processor = Some(processor);
                debug!(consumer = %self.config.name, "worker thread joined");
                Ok(())
            }
            Err(payload) => {
                error!(
                    consumer = %self.config.name,
                    panic = %panic_message(payload),
                    "worker thread panicked, processor lost"
                );
                Err(ConsumerError::ProcessorLost)
            }
        }
    }

    fn run(self: Arc<Self>, mut processor: P) -> P {
        let id = self.id();
        WORKER_OF.with(|worker| worker.set(id));
        debug!(consumer = %self.config.name, "worker loop entered");

        let mut carry = None;
        while self.running.load(Ordering::SeqCst) {
            if let Err(failure) = self.iterate(&mut processor, &mut carry) {
                self.escalate(&failure);
            }
        }
        self.drain(&mut processor, carry);

        debug!(consumer = %self.config.name, "worker loop exited");
        WORKER_OF.with(|worker| worker.set(0));
        processor
    }

    fn iterate(&self, processor: &mut P, carry: &mut Option<B::Unit>) -> Result<(), Failure> {
        let staged = {
            let mut guard = self.locks.lock(self.config.slot)?;
            if buffer_mut(&mut guard)?.needs_wait() {
                guard.wait()?;
            } else {
                guard.signal_off()?;
            }
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            let buffer = buffer_mut(&mut guard)?;
            let staged = if buffer.is_empty() {
                None
            } else {
                Some(buffer.load()?)
            };
            guard.unlock();
            staged
        };

        if !self.running.load(Ordering::SeqCst) {
            // the drain step picks it up
            if staged.is_some() {
                *carry = staged;
            }
            return Ok(());
        }
        match staged {
            Some(unit) => shielded(|| processor.process(unit)),
            None => shielded(|| processor.idle()),
        }
    }

    fn load_for_drain(&self) -> Result<Option<B::Unit>, Failure> {
        let mut guard = self.locks.lock(self.config.slot)?;
        guard.signal_off()?;
        let buffer = buffer_mut(&mut guard)?;
        if buffer.is_empty() {
            return Ok(None);
        }
        Ok(Some(buffer.load()?))
    }

    fn drain(&self, processor: &mut P, carry: Option<B::Unit>) {
        let mut next = carry;
        let mut drained = 0usize;
        loop {
            let unit = match next.take() {
                Some(unit) => unit,
                None => match self.load_for_drain() {
                    Ok(Some(unit)) => unit,
                    Ok(None) => break,
                    Err(failure) => {
                        self.escalate(&failure);
                        self.clear_buffer();
                        break;
                    }
                },
            };
            drained += 1;
            if let Err(failure) = shielded(|| processor.process(unit)) {
                if self.escalate(&failure).is_above_warning() {
                    self.clear_buffer();
                }
            }
        }
        if drained > 0 {
            debug!(consumer = %self.config.name, drained, "buffer drained");
        }
    }

    fn with_buffer<R, F>(&self, f: F) -> Result<R, Failure>
    where
        F: FnOnce(&mut B) -> R,
    {
        let slot = self.config.slot;
        self.locks
            .with_payload(slot, |payload| payload.as_mut().map(f))?
            .ok_or_else(|| Failure::critical(MissingBuffer(slot)))
    }

    fn clear_buffer(&self) {
        let cleared = self.with_buffer(|buffer| {
            let cleared = buffer.len();
            buffer.clear();
            cleared
        });
        match cleared {
            Ok(0) => {}
            Ok(cleared) => warn!(consumer = %self.config.name, cleared, "discarded buffered units"),
            Err(failure) => error!(consumer = %self.config.name, %failure, "failed to clear buffer"),
        }
    }

    fn enqueue(&self, item: B::Item) -> Result<(), Failure> {
        let mut guard = self.locks.lock(self.config.slot)?;
        buffer_mut(&mut guard)?.push(item)?;
        guard.notify_and_unlock()?;
        Ok(())
    }

    fn buffered(&self) -> Result<usize, ConsumerError> {
        self.with_buffer(|buffer| buffer.len())
            .map_err(ConsumerError::Critical)
    }
}

impl<B, P> Control for Shared<B, P>
where
    B: Buffer,
    P: Processor<B::Unit>,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    fn stop(&self) -> Result<(), ConsumerError> {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!(consumer = %self.config.name, "stopping consumer loop");
            self.locks.notify(self.config.slot)?;
        }
        if self.on_worker_thread() {
            // joined later by whoever starts, stops or drops the consumer
            return Ok(());
        }
        let mut worker = self.lifecycle();
        if self.running.load(Ordering::SeqCst) {
            // restarted by a producer before we got here; that worker stays
            return Ok(());
        }
        self.join(&mut worker)
    }

    fn close(&self) -> Result<(), ConsumerError> {
        let stopped = self.stop();
        if self.initialized.swap(false, Ordering::SeqCst) {
            info!(consumer = %self.config.name, "consumer closed");
        }
        stopped
    }

    fn defer_critical(&self, failure: Failure) {
        self.mailbox().push(failure);
    }

    fn enter_error_handling(&self) {
        self.handling_error.fetch_add(1, Ordering::SeqCst);
    }

    fn leave_error_handling(&self) {
        let left = self
            .handling_error
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| depth.checked_sub(1));
        if left.is_err() {
            debug!(consumer = %self.config.name, "left error handling without entering it");
        }
    }

    fn is_handling_error(&self) -> bool {
        self.handling_error.load(Ordering::SeqCst) > 0
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

/// An asynchronous consumer with a dedicated worker thread.
///
/// All methods take `&self`; wrap the consumer in an `Arc` to feed it from
/// several producer threads. Dropping it closes it and joins the worker.
///
/// ```
/// use consumer::{Consumer, ConsumerConfig, FifoBuffer, Failure};
///
/// let consumer = Consumer::new(
///     ConsumerConfig::default(),
///     FifoBuffer::<Vec<u8>>::new(),
///     |frame: Vec<u8>| -> Result<(), Failure> {
///         assert!(!frame.is_empty());
///         Ok(())
///     },
/// )?;
/// consumer.init();
/// consumer.feed(vec![1, 2, 3])?;
/// consumer.close()?;
/// # Ok::<(), consumer::ConsumerError>(())
/// ```
pub struct Consumer<B, P>
where
    B: Buffer,
    P: Processor<B::Unit>,
{
    shared: Arc<Shared<B, P>>,
}

impl<B, P> Consumer<B, P>
where
    B: Buffer,
    P: Processor<B::Unit>,
{
    pub fn new(config: ConsumerConfig, buffer: B, processor: P) -> Result<Consumer<B, P>, ConsumerError> {
        Consumer::with_escalation(config, buffer, processor, DefaultEscalation)
    }

    pub fn with_escalation<E>(
        config: ConsumerConfig,
        buffer: B,
        processor: P,
        escalation: E,
    ) -> Result<Consumer<B, P>, ConsumerError>
    where
        E: Escalation,
    {
        config.validate()?;
        let designated = config.slot;
        let mut buffer = Some(buffer);
        let locks = LockSet::from_fn(config.slots, |index| {
            if index == designated {
                buffer.take()
            } else {
                None
            }
        });
        let deferred = DeferredCritical::new(config.deferred_capacity);
        Ok(Consumer {
            shared: Arc::new(Shared {
                config,
                locks,
                initialized: AtomicBool::new(false),
                running: AtomicBool::new(false),
                handling_error: AtomicUsize::new(0),
                deferred: Mutex::new(deferred),
                escalation: Box::new(escalation),
                worker: Mutex::new(Worker {
                    handle: None,
                    processor: Some(processor),
                }),
            }),
        })
    }

    pub fn init(&self) {
        if !self.shared.initialized.swap(true, Ordering::SeqCst) {
            debug!(consumer = %self.shared.config.name, "consumer initialized");
        }
    }

    /// Spawns the worker thread unless it is already running. Clears the
    /// deferred critical mailbox.
    pub fn start(&self) -> Result<(), ConsumerError> {
        self.shared.start()
    }

    /// Stops the loop and joins the worker once it has drained the buffer.
    pub fn stop(&self) -> Result<(), ConsumerError> {
        self.shared.stop()
    }

    pub fn close(&self) -> Result<(), ConsumerError> {
        self.shared.close()
    }

    /// Hands `item` to the consumer.
    ///
    /// Fails synchronously only on use before [`init`](Consumer::init) and on
    /// critical failures, including a critical failure the worker raised
    /// earlier and that has not been cleared by [`start`](Consumer::start).
    /// Other failures are escalated and absorbed. A stopped consumer is
    /// restarted on the way out, unless it was closed in the meantime or a
    /// critical failure is pending.
    pub fn feed(&self, item: B::Item) -> Result<Fed, ConsumerError> {
        let shared = &self.shared;
        if let Some(failure) = shared.mailbox().replay() {
            return Err(ConsumerError::Critical(failure));
        }
        if !shared.is_initialized() {
            return Err(ConsumerError::NotInitialized);
        }

        let fed = if shared.is_handling_error() {
            trace!(consumer = %shared.config.name, "feed skipped while handling an error");
            Fed::Skipped
        } else {
            match shared.enqueue(item) {
                Ok(()) => Fed::Queued,
                Err(failure) => {
                    if shared.escalate(&failure) == ErrorLevel::Critical {
                        return Err(ConsumerError::Critical(failure));
                    }
                    Fed::Rejected
                }
            }
        };

        if !shared.is_running() && !shared.is_handling_error() {
            if let Err(err) = shared.resume() {
                let failure = Failure::from(err);
                if shared.escalate(&failure) == ErrorLevel::Critical {
                    return Err(ConsumerError::Critical(failure));
                }
            }
        }
        Ok(fed)
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConsumerState {
        self.shared.state()
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.shared.is_initialized()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    #[inline]
    pub fn is_handling_error(&self) -> bool {
        self.shared.is_handling_error()
    }

    /// Units currently waiting in the buffer.
    pub fn buffered(&self) -> Result<usize, ConsumerError> {
        self.shared.buffered()
    }

    /// Critical failures waiting to be replayed to producers.
    pub fn pending_critical(&self) -> usize {
        self.shared.mailbox().len()
    }
}

impl<B, P> Drop for Consumer<B, P>
where
    B: Buffer,
    P: Processor<B::Unit>,
{
    fn drop(&mut self) {
        if let Err(err) = self.shared.close() {
            warn!(consumer = %self.shared.config.name, %err, "error while closing consumer on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FifoBuffer;

    #[test]
    fn unbalanced_leave_keeps_depth_at_zero() -> Result<(), ConsumerError> {
        let consumer = Consumer::new(
            ConsumerConfig::default(),
            FifoBuffer::<u8>::new(),
            |_: u8| -> Result<(), Failure> { Ok(()) },
        )?;
        let shared = &consumer.shared;
        shared.leave_error_handling();
        assert!(!shared.is_handling_error());

        shared.enter_error_handling();
        assert!(shared.is_handling_error());
        shared.leave_error_handling();
        assert!(!shared.is_handling_error());
        Ok(())
    }

    #[test]
    fn resume_leaves_a_closed_consumer_down() -> Result<(), ConsumerError> {
        let consumer = Consumer::new(
            ConsumerConfig::default(),
            FifoBuffer::<u8>::new(),
            |_: u8| -> Result<(), Failure> { Ok(()) },
        )?;
        consumer.shared.resume()?;
        assert!(!consumer.is_running());

        consumer.init();
        consumer
            .shared
            .defer_critical(Failure::msg(ErrorLevel::Critical, "armed"));
        consumer.shared.resume()?;
        assert!(!consumer.is_running());
        assert_eq!(consumer.pending_critical(), 1);

        // an explicit start still disarms and runs
        consumer.start()?;
        assert!(consumer.is_running());
        assert_eq!(consumer.pending_critical(), 0);
        consumer.close()
    }
}
