//! Slot-array lock set and the rendezvous guard built on top of it.
//!
//! A [`LockSet`] owns a fixed number of slots. Every slot is a mutex, a
//! condition variable and a `signaled` flag, plus a payload value that can only
//! be reached while the slot's mutex is held. A [`RendezvousGuard`] locks one
//! slot for its lifetime and pairs producer-side notifies with consumer-side
//! waits on it.
//!
//! The `signaled` flag is what makes a notify sent before the matching wait
//! not get lost: it is set by notify and only cleared by a successful wait,
//! by `signal_off` or by a reset.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::errors::LockError;

struct SlotState<T> {
    signaled: bool,
    payload: T,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    cond: Condvar,
}

pub struct LockSet<T = ()> {
    slots: Box<[Slot<T>]>,
}

impl<T: Default> LockSet<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> LockSet<T> {
        LockSet::from_fn(capacity, |_| T::default())
    }
}

impl<T> LockSet<T> {
    /// Builds a lock set whose slot `i` starts with payload `f(i)`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0. `ConsumerConfig::validate` rejects such a
    /// config before a consumer builds its lock set.
    pub fn from_fn<F>(capacity: usize, mut f: F) -> LockSet<T>
    where
        F: FnMut(usize) -> T,
    {
        assert!(capacity > 0, "a lock set needs at least one slot");
        let slots = (0..capacity)
            .map(|index| Slot {
                state: Mutex::new(SlotState {
                    signaled: false,
                    payload: f(index),
                }),
                cond: Condvar::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        LockSet { slots }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, index: usize) -> Result<&Slot<T>, LockError> {
        self.slots.get(index).ok_or(LockError::OutOfRange {
            index,
            capacity: self.slots.len(),
        })
    }

    fn state(&self, index: usize) -> Result<MutexGuard<'_, SlotState<T>>, LockError> {
        self.slot(index)?
            .state
            .lock()
            .map_err(|_| LockError::Poisoned { index })
    }

    /// Blocks until slot `index` is locked.
    pub fn lock(&self, index: usize) -> Result<RendezvousGuard<'_, T>, LockError> {
        RendezvousGuard::new(self, index)
    }

    pub fn notify(&self, index: usize) -> Result<(), LockError> {
        let slot = self.slot(index)?;
        let mut state = self.state(index)?;
        state.signaled = true;
        slot.cond.notify_one();
        Ok(())
    }

    pub fn notify_all(&self) -> Result<(), LockError> {
        for index in 0..self.capacity() {
            self.notify(index)?;
        }
        Ok(())
    }

    /// Drops a pending signal on slot `index`.
    pub fn reset(&self, index: usize) -> Result<(), LockError> {
        self.state(index)?.signaled = false;
        Ok(())
    }

    pub fn reset_all(&self) -> Result<(), LockError> {
        for index in 0..self.capacity() {
            self.reset(index)?;
        }
        Ok(())
    }

    pub fn is_signaled(&self, index: usize) -> Result<bool, LockError> {
        Ok(self.state(index)?.signaled)
    }

    /// Runs `f` on the payload of slot `index` under its mutex, without
    /// touching the slot's signal.
    pub fn with_payload<R, F>(&self, index: usize, f: F) -> Result<R, LockError>
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut state = self.state(index)?;
        Ok(f(&mut state.payload))
    }

    // Caller must already hold slot `index`; `state` is handed back re-locked.
    fn wait_on<'a>(
        &'a self,
        index: usize,
        state: MutexGuard<'a, SlotState<T>>,
    ) -> Result<MutexGuard<'a, SlotState<T>>, LockError> {
        let slot = self.slot(index)?;
        let mut state = slot
            .cond
            .wait_while(state, |state| !state.signaled)
            .map_err(|_| LockError::Poisoned { index })?;
        state.signaled = false;
        Ok(state)
    }
}

/// Scoped ownership of one slot's mutex.
///
/// Dropping a guard that never waited, never notified and never called
/// [`signal_off`](RendezvousGuard::signal_off) issues exactly one notify on
/// its slot, so an early return or a `?` between lock and notify can not lose
/// the rendezvous.
pub struct RendezvousGuard<'a, T = ()> {
    locks: &'a LockSet<T>,
    index: usize,
    state: Option<MutexGuard<'a, SlotState<T>>>,
    notified: bool,
    waited: bool,
}

impl<'a, T> RendezvousGuard<'a, T> {
    pub fn new(locks: &'a LockSet<T>, index: usize) -> Result<RendezvousGuard<'a, T>, LockError> {
        let state = locks.state(index)?;
        Ok(RendezvousGuard {
            locks,
            index,
            state: Some(state),
            notified: false,
            waited: false,
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn holds_lock(&self) -> bool {
        self.state.is_some()
    }

    #[inline]
    fn cond(&self) -> &'a Condvar {
        // index was validated when the guard was created
        &self.locks.slots[self.index].cond
    }

    /// Blocks until the slot is signaled and consumes the signal.
    pub fn wait(&mut self) -> Result<(), LockError> {
        let state = self
            .state
            .take()
            .ok_or(LockError::NotHeld { index: self.index })?;
        self.state = Some(self.locks.wait_on(self.index, state)?);
        self.waited = true;
        Ok(())
    }

    /// Releases the mutex before the guard goes out of scope.
    pub fn unlock(&mut self) {
        self.state = None;
    }

    pub fn notify(&mut self) -> Result<(), LockError> {
        match self.state.as_mut() {
            Some(state) => {
                state.signaled = true;
                self.cond().notify_one();
            }
            None => self.locks.notify(self.index)?,
        }
        self.notified = true;
        Ok(())
    }

    /// Signals the slot and releases the mutex. The flag is set and the
    /// condvar signaled while the mutex is still held.
    pub fn notify_and_unlock(&mut self) -> Result<(), LockError> {
        match self.state.take() {
            Some(mut state) => {
                state.signaled = true;
                self.cond().notify_one();
                drop(state);
            }
            None => self.locks.notify(self.index)?,
        }
        self.notified = true;
        Ok(())
    }

    /// Acknowledges the slot without waiting: clears a pending signal and
    /// suppresses the fail-safe notify.
    pub fn signal_off(&mut self) -> Result<(), LockError> {
        let state = self
            .state
            .as_mut()
            .ok_or(LockError::NotHeld { index: self.index })?;
        state.signaled = false;
        self.waited = true;
        Ok(())
    }

    pub fn payload(&self) -> Result<&T, LockError> {
        self.state
            .as_ref()
            .map(|state| &state.payload)
            .ok_or(LockError::NotHeld { index: self.index })
    }

    pub fn payload_mut(&mut self) -> Result<&mut T, LockError> {
        let index = self.index;
        self.state
            .as_mut()
            .map(|state| &mut state.payload)
            .ok_or(LockError::NotHeld { index })
    }
}

impl<'a, T> Drop for RendezvousGuard<'a, T> {
    fn drop(&mut self) {
        self.state = None;
        if !self.waited && !self.notified {
            let slot = &self.locks.slots[self.index];
            let mut state = slot.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.signaled = true;
            slot.cond.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn dropped_guard_notifies_once() -> Result<(), LockError> {
        let locks: LockSet = LockSet::new(2);
        {
            let _guard = locks.lock(1)?;
        }
        assert!(locks.is_signaled(1)?);
        assert!(!locks.is_signaled(0)?);

        // the single pending signal is consumed by one wait
        let mut guard = locks.lock(1)?;
        guard.wait()?;
        drop(guard);
        assert!(!locks.is_signaled(1)?);
        Ok(())
    }

    #[test]
    fn guard_that_waited_does_not_notify() -> Result<(), LockError> {
        let locks: LockSet = LockSet::new(1);
        locks.notify(0)?;
        {
            let mut guard = locks.lock(0)?;
            guard.wait()?;
        }
        assert!(!locks.is_signaled(0)?);
        Ok(())
    }

    #[test]
    fn signal_off_acknowledges_without_notify() -> Result<(), LockError> {
        let locks: LockSet = LockSet::new(1);
        locks.notify(0)?;
        {
            let mut guard = locks.lock(0)?;
            guard.signal_off()?;
        }
        assert!(!locks.is_signaled(0)?);
        Ok(())
    }

    #[test]
    fn notify_before_wait_is_kept() -> Result<(), LockError> {
        let locks: LockSet = LockSet::new(1);
        {
            let mut guard = locks.lock(0)?;
            guard.notify()?;
        }
        let mut guard = locks.lock(0)?;
        // returns immediately because the signal is still pending
        guard.wait()?;
        Ok(())
    }

    #[test]
    fn notify_and_unlock_wakes_waiter() -> Result<(), LockError> {
        let locks: Arc<LockSet<Vec<u32>>> = Arc::new(LockSet::new(1));
        let (tx, rx) = mpsc::channel();

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || -> Result<Vec<u32>, LockError> {
                let mut guard = locks.lock(0)?;
                tx.send(()).ok();
                guard.wait()?;
                let received = guard.payload_mut()?.drain(..).collect();
                Ok(received)
            })
        };

        rx.recv().ok();
        {
            let mut guard = locks.lock(0)?;
            guard.payload_mut()?.push(7);
            guard.notify_and_unlock()?;
            assert!(!guard.holds_lock());
        }
        let received = waiter.join().expect("waiter panicked")?;
        assert_eq!(received, vec![7]);
        Ok(())
    }

    #[test]
    fn wait_blocks_until_notified() -> Result<(), LockError> {
        let locks: Arc<LockSet> = Arc::new(LockSet::new(1));
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || -> Result<(), LockError> {
                let mut guard = locks.lock(0)?;
                guard.wait()?;
                tx.send(()).ok();
                Ok(())
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        locks.notify(0)?;
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        waiter.join().expect("waiter panicked")
    }

    #[test]
    fn payload_requires_the_lock() -> Result<(), LockError> {
        let locks: LockSet<u8> = LockSet::from_fn(3, |index| index as u8 * 10);
        let mut guard = locks.lock(2)?;
        assert_eq!(*guard.payload()?, 20);
        guard.unlock();
        assert_eq!(guard.payload(), Err(LockError::NotHeld { index: 2 }));
        assert_eq!(guard.signal_off(), Err(LockError::NotHeld { index: 2 }));
        Ok(())
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let locks: LockSet = LockSet::new(2);
        assert!(matches!(
            locks.lock(2),
            Err(LockError::OutOfRange {
                index: 2,
                capacity: 2
            })
        ));
        assert_eq!(
            locks.notify(5),
            Err(LockError::OutOfRange {
                index: 5,
                capacity: 2
            })
        );
    }

    #[test]
    fn reset_discards_stale_signals() -> Result<(), LockError> {
        let locks: LockSet = LockSet::new(3);
        locks.notify_all()?;
        assert!(locks.is_signaled(2)?);
        locks.reset(0)?;
        assert!(!locks.is_signaled(0)?);
        assert!(locks.is_signaled(1)?);
        locks.reset_all()?;
        for index in 0..locks.capacity() {
            assert!(!locks.is_signaled(index)?);
        }
        Ok(())
    }

    #[test]
    fn with_payload_leaves_signal_alone() -> Result<(), LockError> {
        let locks: LockSet<Vec<u8>> = LockSet::new(1);
        locks.notify(0)?;
        let len = locks.with_payload(0, |payload| {
            payload.push(1);
            payload.len()
        })?;
        assert_eq!(len, 1);
        assert!(locks.is_signaled(0)?);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "at least one slot")]
    fn empty_lock_set_panics() {
        let _locks: LockSet = LockSet::new(0);
    }
}
