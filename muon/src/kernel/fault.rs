//! Fatal kernel faults.
//!
//! Recoverable failures are returned as [`crate::Error`] values; the
//! conditions below mean a kernel invariant no longer holds, so they are
//! reported once and the system is taken down through the port.

use crate::kernel::hal;
use crate::printkln;

#[derive(Debug)]
pub enum KernelFault {
    /// A stack canary was overwritten.
    StackOverflow { thread: &'static str },
    /// The idle thread attempted a blocking operation.
    IdleThreadBlocked,
    /// A blocking operation was started while the scheduler was locked.
    BlockedWhileSchedulerLocked,
    /// A blocking operation was started in handler mode.
    BlockedInHandler,
    /// A thread-context operation ran before the kernel was started.
    NotStarted,
    /// A build-time sizing rule was violated at object construction.
    ConfigError(&'static str),
}

impl KernelFault {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelFault::StackOverflow { .. } => "stack overflow",
            KernelFault::IdleThreadBlocked => "idle thread blocked",
            KernelFault::BlockedWhileSchedulerLocked => "blocked while scheduler locked",
            KernelFault::BlockedInHandler => "blocked in handler mode",
            KernelFault::NotStarted => "kernel not started",
            KernelFault::ConfigError(_) => "configuration error",
        }
    }
}

pub fn kernel_fault(fault: KernelFault) -> ! {
    match &fault {
        KernelFault::StackOverflow { thread } => {
            printkln!("kernel fault: stack overflow in thread '{}'", thread);
        }
        KernelFault::ConfigError(detail) => {
            printkln!("kernel fault: configuration error: {}", detail);
        }
        other => {
            printkln!("kernel fault: {}", other.as_str());
        }
    }
    hal::abort()
}
