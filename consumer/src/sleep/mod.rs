//! Interruptible sleep.
//!
//! Every call to one of the `sleep*` functions registers a fresh key and
//! waits on a shared condvar until that key is marked woken or the timeout
//! elapses. [`Sleeper::wake_up`] marks every registered key, so it only ever
//! affects sleepers that are already in flight.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Woken,
    TimedOut,
}

#[derive(Default)]
struct Keys {
    next_key: u64,
    woken: HashMap<u64, bool>,
}

impl Keys {
    fn register(&mut self) -> u64 {
        let mut key = self.next_key;
        while self.woken.contains_key(&key) {
            key = key.wrapping_add(1);
        }
        self.next_key = key.wrapping_add(1);
        self.woken.insert(key, false);
        key
    }

    #[inline]
    fn is_woken(&self, key: u64) -> bool {
        self.woken.get(&key).copied().unwrap_or(true)
    }
}

#[derive(Default)]
pub struct Sleeper {
    keys: Mutex<Keys>,
    cond: Condvar,
}

impl Sleeper {
    pub fn new() -> Sleeper {
        Sleeper::default()
    }

    // Nothing panics while `keys` is held, so a poisoned lock still holds
    // consistent state.
    fn keys(&self) -> MutexGuard<'_, Keys> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps until [`wake_up`](Sleeper::wake_up) is called.
    pub fn sleep(&self) {
        let mut keys = self.keys();
        let key = keys.register();
        let mut keys = self
            .cond
            .wait_while(keys, |keys| !keys.is_woken(key))
            .unwrap_or_else(PoisonError::into_inner);
        keys.woken.remove(&key);
    }

    pub fn sleep_for(&self, timeout: Duration) -> Wake {
        let mut keys = self.keys();
        let key = keys.register();
        let (mut keys, _) = self
            .cond
            .wait_timeout_while(keys, timeout, |keys| !keys.is_woken(key))
            .unwrap_or_else(PoisonError::into_inner);
        let woken = keys.is_woken(key);
        keys.woken.remove(&key);
        if woken {
            Wake::Woken
        } else {
            Wake::TimedOut
        }
    }

    pub fn sleep_until(&self, deadline: Instant) -> Wake {
        self.sleep_for(deadline.saturating_duration_since(Instant::now()))
    }

    /// Wakes every in-flight sleeper and returns how many were woken.
    pub fn wake_up(&self) -> usize {
        let mut keys = self.keys();
        let mut count = 0;
        for woken in keys.woken.values_mut().filter(|woken| !**woken) {
            *woken = true;
            count += 1;
        }
        self.cond.notify_all();
        count
    }

    /// Number of sleepers that have not been woken yet.
    pub fn sleepers(&self) -> usize {
        self.keys().woken.values().filter(|woken| !**woken).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn wait_for_sleepers(sleeper: &Sleeper, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sleeper.sleepers() < count {
            assert!(Instant::now() < deadline, "sleepers never registered");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn wake_up_without_sleepers_is_a_no_op() {
        let sleeper = Sleeper::new();
        assert_eq!(sleeper.wake_up(), 0);
        assert_eq!(sleeper.sleep_for(Duration::from_millis(20)), Wake::TimedOut);
        assert_eq!(sleeper.sleepers(), 0);
    }

    #[test]
    fn wake_up_reaches_every_wait_variant() {
        let sleeper = Arc::new(Sleeper::new());
        let indefinite = {
            let sleeper = Arc::clone(&sleeper);
            thread::spawn(move || {
                sleeper.sleep();
                Wake::Woken
            })
        };
        let timed = {
            let sleeper = Arc::clone(&sleeper);
            thread::spawn(move || sleeper.sleep_for(Duration::from_secs(30)))
        };
        let deadline = {
            let sleeper = Arc::clone(&sleeper);
            thread::spawn(move || sleeper.sleep_until(Instant::now() + Duration::from_secs(30)))
        };

        wait_for_sleepers(&sleeper, 3);
        assert_eq!(sleeper.wake_up(), 3);

        for handle in vec![indefinite, timed, deadline] {
            assert_eq!(handle.join().expect("sleeper panicked"), Wake::Woken);
        }
        assert_eq!(sleeper.sleepers(), 0);
    }

    #[test]
    fn past_deadline_returns_immediately() {
        let sleeper = Sleeper::new();
        let started = Instant::now();
        assert_eq!(sleeper.sleep_until(started), Wake::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
