//! Kernel clocks and the timeout queue.
//!
//! [`sysclock`] counts monotonic ticks from the port timer and owns the
//! global timeout queue; every bounded wait in the kernel parks one clock
//! node here. [`rtclock`] is the same counter shifted by a signed,
//! adjustable epoch offset.
//!
//! The port alarm is kept programmed to the earliest pending deadline.
//! When it fires, the handler below pops every expired node, wakes its
//! thread with a timeout, and preempts if one of them now outranks the
//! running thread.

use crate::cell::{LockedCell, LockedRefCell};
use crate::error::{Error, Result};
use crate::kernel::hal;
use crate::kernel::klock::{KernelLock, KernelLockKey};
use crate::kernel::list::List;
use crate::kernel::scheduler;
use crate::kernel::waiter::{ClockTag, Waiter, WakeReason};
use crate::thread::ThreadState;
use crate::time::{Duration, Instant};

struct ClockQueue {
    list: LockedRefCell<List<Waiter, ClockTag>, KernelLock>,
}

static TIMEOUTS: ClockQueue = ClockQueue {
    list: LockedRefCell::new(List::new()),
};

/// Link a waiter with a set deadline into the timeout queue and keep the
/// alarm aimed at the earliest deadline.
pub(crate) fn enqueue_timeout(kkey: KernelLockKey<'_>, waiter: &Waiter) {
    let deadline = match waiter.deadline() {
        Some(deadline) => deadline,
        None => return,
    };
    let mut list = TIMEOUTS.list.borrow_mut(kkey);
    list.insert_when(waiter, |queued| match queued.deadline() {
        Some(queued_deadline) => queued_deadline <= deadline,
        None => false,
    });
    if let Some(head) = list.head() {
        hal::set_alarm(head.deadline().map(|d| d.as_ticks()));
    }
}

/// Pop and wake every waiter whose deadline has passed, then re-aim the
/// alarm. Runs from the alarm handler and is harmless when nothing is
/// due (a cancelled head deadline may leave the alarm firing early).
fn expire_due(kkey: KernelLockKey<'_>) {
    let now = Instant::from_ticks(hal::clock_ticks());

    loop {
        let expired = {
            let mut list = TIMEOUTS.list.borrow_mut(kkey);
            match list.head() {
                Some(head) if head.deadline().is_some_and(|d| d <= now) => list.pop_front(),
                _ => None,
            }
        };
        match expired {
            Some(waiter) => {
                waiter.unlink_all(kkey);
                waiter.set_reason(WakeReason::Timeout);
                scheduler::ready_thread(kkey, waiter.thread());
            }
            None => break,
        }
    }

    let list = TIMEOUTS.list.borrow(kkey);
    hal::set_alarm(list.head().and_then(|head| head.deadline()).map(|d| d.as_ticks()));
}

/// Port alarm callback: expire due timeouts and preempt when one of the
/// woken threads outranks the interrupted one.
pub(crate) fn alarm_handler() {
    KernelLock::with(|kkey| {
        expire_due(kkey);
        scheduler::reschedule(kkey);
    });
}

fn blocking_allowed() -> Result<()> {
    if hal::in_handler_mode() {
        return Err(Error::Perm);
    }
    Ok(())
}

/// The monotonic system clock.
pub struct Sysclock {
    _private: (),
}

static SYSCLOCK: Sysclock = Sysclock { _private: () };

pub fn sysclock() -> &'static Sysclock {
    &SYSCLOCK
}

impl Sysclock {
    pub fn now(&self) -> Instant {
        Instant::from_ticks(hal::clock_ticks())
    }

    /// Sleep until `deadline`. `Ok` on normal expiry, `Interrupted` when
    /// another thread resumed or interrupted the sleeper early.
    pub fn sleep_until(&self, deadline: Instant) -> Result<()> {
        blocking_allowed()?;
        KernelLock::with(|kkey| {
            if deadline <= self.now() {
                return Ok(());
            }
            let reason =
                scheduler::block_current(kkey, None, Some(deadline), ThreadState::Blocked);
            match reason {
                WakeReason::Timeout => Ok(()),
                _ => Err(Error::Interrupted),
            }
        })
    }

    pub fn sleep_for(&self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Ok(());
        }
        self.sleep_until(self.now() + duration)
    }

    /// Park until resumed or until `deadline`. `Ok` when an event ended
    /// the wait, `TimedOut` on expiry.
    pub fn wait_until(&self, deadline: Instant) -> Result<()> {
        blocking_allowed()?;
        KernelLock::with(|kkey| {
            if deadline <= self.now() {
                return Err(Error::TimedOut);
            }
            let reason =
                scheduler::block_current(kkey, None, Some(deadline), ThreadState::Blocked);
            match reason {
                WakeReason::Timeout => Err(Error::TimedOut),
                _ => Ok(()),
            }
        })
    }

    pub fn wait_for(&self, duration: Duration) -> Result<()> {
        self.wait_until(self.now() + duration)
    }
}

/// The adjustable real-time clock: the system clock plus a signed epoch
/// offset.
pub struct Rtclock {
    offset_ticks: LockedCell<i64, KernelLock>,
}

static RTCLOCK: Rtclock = Rtclock {
    offset_ticks: LockedCell::new(0),
};

pub fn rtclock() -> &'static Rtclock {
    &RTCLOCK
}

impl Rtclock {
    pub fn now(&self) -> Instant {
        KernelLock::with(|kkey| {
            let steady = hal::clock_ticks() as i128;
            let shifted = steady + self.offset_ticks.get(kkey) as i128;
            Instant::from_ticks(shifted.max(0) as u64)
        })
    }

    /// Set the clock to `now`. Pending sleeps keep their original target
    /// on the monotonic timeline.
    pub fn set(&self, now: Instant) {
        KernelLock::with(|kkey| {
            let steady = hal::clock_ticks() as i128;
            let offset = now.as_ticks() as i128 - steady;
            self.offset_ticks
                .set(kkey, offset.clamp(i64::MIN as i128, i64::MAX as i128) as i64);
        })
    }

    /// Shift the clock by `delta` ticks.
    pub fn adjust(&self, delta: i64) {
        KernelLock::with(|kkey| {
            self.offset_ticks.update(kkey, |offset| offset.saturating_add(delta));
        })
    }

    pub fn offset(&self) -> i64 {
        KernelLock::with(|kkey| self.offset_ticks.get(kkey))
    }

    pub fn sleep_until(&self, deadline: Instant) -> Result<()> {
        let steady_deadline = KernelLock::with(|kkey| {
            let shifted = deadline.as_ticks() as i128 - self.offset_ticks.get(kkey) as i128;
            Instant::from_ticks(shifted.max(0) as u64)
        });
        sysclock().sleep_until(steady_deadline)
    }

    pub fn sleep_for(&self, duration: Duration) -> Result<()> {
        sysclock().sleep_for(duration)
    }
}
