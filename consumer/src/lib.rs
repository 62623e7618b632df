pub mod buffer;
pub mod core;
pub mod errors;
pub mod escalation;
pub mod locks;
pub mod logging;
pub mod sleep;
pub mod worker;


pub use crate::buffer::{BufferError, FifoBuffer, WaitPolicy};
pub use crate::core::{Buffer, ConsumerConfig, ConsumerConfigBuilder, Processor};
pub use crate::errors::{ConsumerError, ErrorLevel, Failure, LockError};
pub use crate::escalation::{
    Control, DefaultEscalation, DeferredCritical, Escalation, HandleStatus, Handlers,
};
pub use crate::locks::{LockSet, RendezvousGuard};
pub use crate::logging::{init_logging, LogConfig};
pub use crate::sleep::{Sleeper, Wake};
pub use crate::worker::{Consumer, ConsumerState, Fed};
