use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Severity attached to a [`Failure`]. Escalation picks the recovery action from it.
///
/// `Warning < Error < Critical`; `Unknown` marks a failure that carried no tag
/// and is handled like `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorLevel {
    Warning,
    Error,
    Critical,
    Unknown,
}

impl ErrorLevel {
    /// `true` for every level that stops or closes the consumer.
    #[inline]
    pub fn is_above_warning(self) -> bool {
        self != ErrorLevel::Warning
    }

    pub fn as_label(self) -> &'static str {
        match self {
            ErrorLevel::Warning => "warning",
            ErrorLevel::Error => "error",
            ErrorLevel::Critical => "critical",
            ErrorLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

/// A severity-tagged failure raised by a buffer, a processor or the consumer itself.
///
/// Cloning is cheap and keeps the identity of the underlying error, so a
/// failure replayed from the deferred critical mailbox is the same failure
/// that was escalated (see [`Failure::same_as`]).
#[derive(Debug, Clone, Error)]
#[error("[{level}] {source}")]
pub struct Failure {
    level: ErrorLevel,
    source: Arc<dyn StdError + Send + Sync + 'static>,
}

impl Failure {
    pub fn new<E>(level: ErrorLevel, error: E) -> Failure
    where
        E: StdError + Send + Sync + 'static,
    {
        Failure {
            level,
            source: Arc::new(error),
        }
    }

    pub fn msg<S: Into<String>>(level: ErrorLevel, message: S) -> Failure {
        Failure::new(level, Message(message.into()))
    }

    pub fn warning<E: StdError + Send + Sync + 'static>(error: E) -> Failure {
        Failure::new(ErrorLevel::Warning, error)
    }

    pub fn error<E: StdError + Send + Sync + 'static>(error: E) -> Failure {
        Failure::new(ErrorLevel::Error, error)
    }

    pub fn critical<E: StdError + Send + Sync + 'static>(error: E) -> Failure {
        Failure::new(ErrorLevel::Critical, error)
    }

    /// A failure without a severity tag. Escalation treats it as an error.
    pub fn untagged<E: StdError + Send + Sync + 'static>(error: E) -> Failure {
        Failure::new(ErrorLevel::Unknown, error)
    }

    #[inline]
    pub fn level(&self) -> ErrorLevel {
        self.level
    }

    pub fn with_level(mut self, level: ErrorLevel) -> Failure {
        self.level = level;
        self
    }

    /// Whether both failures wrap the very same error instance.
    pub fn same_as(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("slot index {index} is out of range for a lock set of {capacity} slots")]
    OutOfRange { index: usize, capacity: usize },
    #[error("slot {index} mutex was poisoned")]
    Poisoned { index: usize },
    #[error("slot {index} is not locked by this guard")]
    NotHeld { index: usize },
}

impl LockError {
    pub fn level(&self) -> ErrorLevel {
        match self {
            LockError::OutOfRange { .. } | LockError::Poisoned { .. } => ErrorLevel::Critical,
            LockError::NotHeld { .. } => ErrorLevel::Error,
        }
    }
}

impl From<LockError> for Failure {
    fn from(err: LockError) -> Self {
        Failure::new(err.level(), err)
    }
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer used before init")]
    NotInitialized,
    #[error(transparent)]
    Critical(Failure),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("failed to spawn the worker thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("processor lost: the previous worker thread panicked")]
    ProcessorLost,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ConsumerError {
    pub fn level(&self) -> ErrorLevel {
        match self {
            ConsumerError::Critical(failure) => failure.level(),
            ConsumerError::Lock(err) => err.level(),
            ConsumerError::Io(_) => ErrorLevel::Error,
            ConsumerError::NotInitialized
            | ConsumerError::Spawn(_)
            | ConsumerError::ProcessorLost
            | ConsumerError::InvalidConfig(_) => ErrorLevel::Critical,
        }
    }

    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConsumerError::NotInitialized => "not_initialized",
            ConsumerError::Critical(_) => "critical",
            ConsumerError::Lock(_) => "lock",
            ConsumerError::Spawn(_) => "spawn",
            ConsumerError::ProcessorLost => "processor_lost",
            ConsumerError::InvalidConfig(_) => "invalid_config",
            ConsumerError::Io(_) => "io",
        }
    }

    /// The failure carried by a replayed or propagated critical error.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ConsumerError::Critical(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<ConsumerError> for Failure {
    fn from(err: ConsumerError) -> Self {
        match err {
            ConsumerError::Critical(failure) => failure,
            other => Failure::new(other.level(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_keep_identity() {
        let failure = Failure::msg(ErrorLevel::Critical, "sensor offline");
        let replay = failure.clone();
        assert!(replay.same_as(&failure));
        assert!(!Failure::msg(ErrorLevel::Critical, "sensor offline").same_as(&failure));
        assert_eq!(failure.to_string(), "[critical] sensor offline");
    }

    #[test]
    fn consumer_errors_map_to_levels() {
        assert_eq!(ConsumerError::NotInitialized.level(), ErrorLevel::Critical);
        assert_eq!(
            ConsumerError::from(LockError::NotHeld { index: 0 }).level(),
            ErrorLevel::Error
        );

        let failure = Failure::msg(ErrorLevel::Warning, "late frame");
        let converted = Failure::from(ConsumerError::Critical(failure.clone()));
        assert!(converted.same_as(&failure));

        let converted = Failure::from(ConsumerError::ProcessorLost);
        assert_eq!(converted.level(), ErrorLevel::Critical);
    }

    #[test]
    fn only_warning_is_absorbed() {
        assert!(!ErrorLevel::Warning.is_above_warning());
        assert!(ErrorLevel::Error.is_above_warning());
        assert!(ErrorLevel::Critical.is_above_warning());
        assert!(ErrorLevel::Unknown.is_above_warning());
    }
}
