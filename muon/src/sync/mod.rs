//! Synchronization primitives.

pub mod condvar;
pub mod event_flags;
pub mod mempool;
pub mod mqueue;
pub mod mutex;
pub mod semaphore;

pub use condvar::{Condvar, WaitTimeoutResult};
pub use event_flags::{EventFlags, FlagsMode};
pub use mempool::MemoryPool;
pub use mqueue::MessageQueue;
pub use mutex::{
    Mutex, MutexAttributes, MutexGuard, MutexKind, MutexProtocol, MutexRobustness, RawMutex,
};
pub use semaphore::Semaphore;
