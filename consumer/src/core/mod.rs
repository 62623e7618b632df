use serde_derive::{Deserialize, Serialize};

use crate::errors::{ConsumerError, Failure};

pub const DEFAULT_CONSUMER_NAME: &str = "async-consumer";
pub const DEFAULT_SLOTS: usize = 1;
pub const DEFAULT_DEFERRED_CAPACITY: usize = 16;

/// Storage a consumer drains. Every method is called with the designated
/// slot's mutex held.
pub trait Buffer: Send + 'static {
    /// What producers feed.
    type Item: Send;
    /// What the worker moves out of the buffer and processes.
    type Unit: Send + 'static;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;

    /// Whether the worker should block until the next feed. Defaults to
    /// [`is_empty`](Buffer::is_empty); returning `false` on an empty buffer
    /// gives a poll-style consumer whose processor is asked to
    /// [`idle`](Processor::idle) instead.
    fn needs_wait(&self) -> bool {
        self.is_empty()
    }

    fn push(&mut self, item: Self::Item) -> Result<(), Failure>;

    /// Moves one unit out of a non-empty buffer.
    fn load(&mut self) -> Result<Self::Unit, Failure>;

    fn clear(&mut self);
}

/// Worker-side half of a consumer. Runs outside the lock, on the worker thread only.
pub trait Processor<U>: Send + 'static {
    fn process(&mut self, unit: U) -> Result<(), Failure>;

    /// Called by a poll-style consumer when an iteration staged nothing.
    fn idle(&mut self) -> Result<(), Failure> {
        Ok(())
    }
}

impl<U, F> Processor<U> for F
where
    F: FnMut(U) -> Result<(), Failure> + Send + 'static,
{
    fn process(&mut self, unit: U) -> Result<(), Failure> {
        self(unit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Worker thread name, also attached to every log line of the consumer.
    pub name: String,
    /// Number of slots in the consumer's lock set.
    pub slots: usize,
    /// Index of the slot guarding the buffer.
    pub slot: usize,
    /// How many critical failures the deferred mailbox keeps.
    pub deferred_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            name: DEFAULT_CONSUMER_NAME.to_string(),
            slots: DEFAULT_SLOTS,
            slot: 0,
            deferred_capacity: DEFAULT_DEFERRED_CAPACITY,
        }
    }
}

impl ConsumerConfig {
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.name.is_empty() {
            return Err(ConsumerError::InvalidConfig("name must not be empty".to_string()));
        }
        if self.slots == 0 {
            return Err(ConsumerError::InvalidConfig("slots must be at least 1".to_string()));
        }
        if self.slot >= self.slots {
            return Err(ConsumerError::InvalidConfig(format!(
                "slot {} is out of range for {} slots",
                self.slot, self.slots
            )));
        }
        if self.deferred_capacity == 0 {
            return Err(ConsumerError::InvalidConfig(
                "deferred_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn slots(mut self, slots: usize) -> Self {
        self.config.slots = slots;
        self
    }

    pub fn slot(mut self, slot: usize) -> Self {
        self.config.slot = slot;
        self
    }

    pub fn deferred_capacity(mut self, capacity: usize) -> Self {
        self.config.deferred_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ConsumerConfig, ConsumerError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
