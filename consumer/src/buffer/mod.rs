use std::collections::VecDeque;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Buffer;
use crate::errors::Failure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Block the worker while the buffer is empty.
    OnEmpty,
    /// Never block; the processor idles between polls.
    Never,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy::OnEmpty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer is full ({capacity} units)")]
    Full { capacity: usize },
    #[error("buffer is empty")]
    Empty,
}

/// First-in first-out buffer, optionally bounded.
///
/// Pushing into a full buffer fails with a warning, so the item is rejected
/// while the consumer keeps running.
#[derive(Debug)]
pub struct FifoBuffer<T> {
    queue: VecDeque<T>,
    capacity: Option<usize>,
    policy: WaitPolicy,
}

impl<T> Default for FifoBuffer<T> {
    fn default() -> Self {
        FifoBuffer::new()
    }
}

impl<T> FifoBuffer<T> {
    pub fn new() -> FifoBuffer<T> {
        FifoBuffer {
            queue: VecDeque::new(),
            capacity: None,
            policy: WaitPolicy::OnEmpty,
        }
    }

    pub fn bounded(capacity: usize) -> FifoBuffer<T> {
        FifoBuffer {
            queue: VecDeque::with_capacity(capacity),
            capacity: Some(capacity),
            policy: WaitPolicy::OnEmpty,
        }
    }

    pub fn with_policy(mut self, policy: WaitPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[inline]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    #[inline]
    pub fn policy(&self) -> WaitPolicy {
        self.policy
    }
}

impl<T: Send + 'static> Buffer for FifoBuffer<T> {
    type Item = T;
    type Unit = T;

    #[inline]
    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    fn len(&self) -> usize {
        self.queue.len()
    }

    fn needs_wait(&self) -> bool {
        match self.policy {
            WaitPolicy::OnEmpty => self.queue.is_empty(),
            WaitPolicy::Never => false,
        }
    }

    fn push(&mut self, item: T) -> Result<(), Failure> {
        if let Some(capacity) = self.capacity {
            if self.queue.len() >= capacity {
                return Err(Failure::warning(BufferError::Full { capacity }));
            }
        }
        self.queue.push_back(item);
        Ok(())
    }

    fn load(&mut self) -> Result<T, Failure> {
        self.queue
            .pop_front()
            .ok_or_else(|| Failure::error(BufferError::Empty))
    }

    fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorLevel;

    #[test]
    fn bounded_push_rejects_with_warning() {
        let mut buffer = FifoBuffer::bounded(2);
        assert!(buffer.push(1).is_ok());
        assert!(buffer.push(2).is_ok());
        let failure = buffer.push(3).expect_err("buffer should be full");
        assert_eq!(failure.level(), ErrorLevel::Warning);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.load().ok(), Some(1));
    }

    #[test]
    fn load_from_empty_is_an_error() {
        let mut buffer: FifoBuffer<u8> = FifoBuffer::new();
        let failure = buffer.load().expect_err("nothing to load");
        assert_eq!(failure.level(), ErrorLevel::Error);
    }

    #[test]
    fn wait_policy_drives_needs_wait() {
        let mut buffer = FifoBuffer::new();
        assert!(buffer.needs_wait());
        buffer.push("frame").ok();
        assert!(!buffer.needs_wait());
        buffer.clear();
        assert!(buffer.is_empty());

        let polling: FifoBuffer<&str> = FifoBuffer::new().with_policy(WaitPolicy::Never);
        assert!(polling.is_empty());
        assert!(!polling.needs_wait());
    }
}
