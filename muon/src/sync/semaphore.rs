//! Counting semaphores.
//!
//! `post` with waiters present hands the token straight to the head
//! waiter instead of bumping the counter, so the count is never
//! observably raised and re-lowered around a wake-up. `post` is
//! handler-safe; the wait family is thread-context only.

use crate::cell::LockedCell;
use crate::error::{Error, Result};
use crate::kernel::hal;
use crate::kernel::klock::KernelLock;
use crate::kernel::scheduler;
use crate::kernel::waiter::{WaitList, WakeReason};
use crate::thread::ThreadState;
use crate::time::{Duration, Instant};

pub struct Semaphore {
    count: LockedCell<usize, KernelLock>,
    max_count: usize,
    initial_count: usize,
    waiters: WaitList,
}

impl Semaphore {
    /// Counting semaphore with `initial <= max` tokens available.
    pub const fn counting(max_count: usize, initial_count: usize) -> Semaphore {
        Semaphore {
            count: LockedCell::new(initial_count),
            max_count,
            initial_count,
            waiters: WaitList::new(),
        }
    }

    /// One-token semaphore.
    pub const fn binary(taken: bool) -> Semaphore {
        Semaphore::counting(1, if taken { 0 } else { 1 })
    }

    pub fn value(&self) -> usize {
        KernelLock::with(|kkey| self.count.get(kkey))
    }

    pub const fn max_value(&self) -> usize {
        self.max_count
    }

    /// Release one token. Wakes the best waiter, or returns `Again` when
    /// the counter is already at its maximum.
    pub fn post(&self) -> Result<()> {
        KernelLock::with(|kkey| {
            if self.waiters.wake_one(kkey, WakeReason::Transfer).is_some() {
                scheduler::reschedule(kkey);
                return Ok(());
            }
            let count = self.count.get(kkey);
            if count >= self.max_count {
                return Err(Error::Again);
            }
            self.count.set(kkey, count + 1);
            Ok(())
        })
    }

    pub fn wait(&self) -> Result<()> {
        self.wait_inner(None, false)
    }

    pub fn try_wait(&self) -> Result<()> {
        self.wait_inner(None, true)
    }

    pub fn wait_until(&self, deadline: Instant) -> Result<()> {
        self.wait_inner(Some(deadline), false)
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<()> {
        self.wait_until(crate::kernel::clock::sysclock().now() + timeout)
    }

    fn wait_inner(&self, deadline: Option<Instant>, try_only: bool) -> Result<()> {
        if !try_only && hal::in_handler_mode() {
            return Err(Error::Perm);
        }
        KernelLock::with(|kkey| loop {
            let count = self.count.get(kkey);
            if count > 0 {
                self.count.set(kkey, count - 1);
                return Ok(());
            }
            if try_only {
                return Err(Error::WouldBlock);
            }

            let reason =
                scheduler::block_current(kkey, Some(&self.waiters), deadline, ThreadState::Blocked);
            match reason {
                // The poster handed us its token; the count was never
                // touched.
                WakeReason::Transfer => return Ok(()),
                WakeReason::Timeout => return Err(Error::TimedOut),
                WakeReason::Interrupted => return Err(Error::Interrupted),
                WakeReason::Notify | WakeReason::Pending => continue,
            }
        })
    }

    /// Abort all waits with `Interrupted` and restore the initial count.
    pub fn reset(&self) -> Result<()> {
        KernelLock::with(|kkey| {
            self.count.set(kkey, self.initial_count);
            self.waiters.wake_all(kkey, WakeReason::Interrupted);
            scheduler::reschedule(kkey);
            Ok(())
        })
    }

}
