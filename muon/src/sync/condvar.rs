//! Condition variables.
//!
//! `wait` releases the associated mutex and enqueues the caller in one
//! critical section, so a signal between "unlock" and "sleep" cannot be
//! lost. Woken threads always re-acquire the mutex before returning,
//! also after a timeout. Waiting is a thread-context operation; doing it
//! from a handler is a kernel fault.

use crate::kernel::fault::{kernel_fault, KernelFault};
use crate::kernel::hal;
use crate::kernel::klock::KernelLock;
use crate::kernel::scheduler;
use crate::kernel::waiter::{WaitList, WakeReason};
use crate::sync::mutex::{self, MutexGuard};
use crate::thread::ThreadState;
use crate::time::{Duration, Instant};

pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    pub fn timed_out(&self) -> bool {
        self.0
    }
}

pub struct Condvar {
    waiters: WaitList,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            waiters: WaitList::new(),
        }
    }

    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.wait_deadline(guard, None).0
    }

    pub fn wait_until<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        self.wait_deadline(guard, Some(deadline))
    }

    pub fn wait_for<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        let deadline = crate::kernel::clock::sysclock().now() + timeout;
        self.wait_deadline(guard, Some(deadline))
    }

    /// Wait while `condition` holds. Tolerant of spurious wake-ups by
    /// construction.
    pub fn wait_while<'a, T, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    fn wait_deadline<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        if hal::in_handler_mode() {
            kernel_fault(KernelFault::BlockedInHandler);
        }

        let raw = mutex::guard_raw(&guard);
        let reason = KernelLock::with(|kkey| {
            let current = scheduler::current_thread(kkey);
            // Hand the mutex over and start waiting in one critical
            // section; a wake-up between the two cannot slip through.
            raw.release(kkey, current)
                .expect("condvar wait without owning the mutex");
            scheduler::block_current(kkey, Some(&self.waiters), deadline, ThreadState::Blocked)
        });

        // Unconditional re-acquire, whatever ended the wait.
        loop {
            match raw.lock() {
                Ok(()) | Err(crate::Error::OwnerDead) => break,
                Err(crate::Error::Interrupted) => continue,
                Err(_) => break,
            }
        }

        (guard, WaitTimeoutResult(reason == WakeReason::Timeout))
    }

    /// Wake the best waiter. It re-acquires the mutex before its wait
    /// returns. Handler-safe.
    pub fn notify_one(&self) {
        KernelLock::with(|kkey| {
            self.waiters.wake_one(kkey, WakeReason::Notify);
            scheduler::reschedule(kkey);
        })
    }

    /// Wake every waiter in head order.
    pub fn notify_all(&self) {
        KernelLock::with(|kkey| {
            self.waiters.wake_all(kkey, WakeReason::Notify);
            scheduler::reschedule(kkey);
        })
    }
}

impl Default for Condvar {
    fn default() -> Condvar {
        Condvar::new()
    }
}
