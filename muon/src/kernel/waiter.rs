//! The waiter node and the two ordered lists built on it.
//!
//! Every thread embeds one [`Waiter`]. Blocking links it into at most one
//! primitive's [`WaitList`] (ordered by descending dynamic priority, FIFO
//! among equals) and, for bounded waits, into the clock queue (ordered by
//! ascending deadline). Whoever ends the wait stamps a [`WakeReason`]
//! into the node before making the thread ready; the blocked thread reads
//! it back after the switch.

use crate::cell::LockedRefCell;
use crate::kernel::klock::{KernelLock, KernelLockKey};
use crate::kernel::list::{impl_linked, Link, List, ListTag};
use crate::kernel::priority::Priority;
use crate::kernel::scheduler;
use crate::thread::RawThread;
use crate::time::Instant;
use core::cell::Cell;
use core::ptr::NonNull;

pub(crate) struct WaitTag {}
impl ListTag for WaitTag {}

pub(crate) struct ClockTag {}
impl ListTag for ClockTag {}

/// Why a blocked thread was made ready again.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum WakeReason {
    /// Not woken yet.
    Pending,
    /// Generic wake; the woken thread re-evaluates its condition.
    Notify,
    /// The contested resource was handed over; no re-check needed.
    Transfer,
    /// The bounded wait expired.
    Timeout,
    /// The wait was cancelled by a reset or by interrupting the thread.
    Interrupted,
}

/// Event-flag wait parameters, parked on the waiter while blocked.
#[derive(Copy, Clone)]
pub(crate) struct FlagsSpec {
    pub expected: u32,
    pub match_all: bool,
    pub clear: bool,
}

impl FlagsSpec {
    pub fn mode(&self) -> crate::sync::event_flags::FlagsMode {
        if self.match_all {
            crate::sync::event_flags::FlagsMode::All
        } else {
            crate::sync::event_flags::FlagsMode::Any
        }
    }
}

pub(crate) struct Waiter {
    thread: Cell<*const RawThread>,
    deadline: Cell<Option<Instant>>,
    reason: Cell<WakeReason>,
    flags_spec: Cell<Option<FlagsSpec>>,
    flags_result: Cell<u32>,
    handoff: Cell<*mut u8>,
    wait_link: Link<Waiter, WaitTag>,
    clock_link: Link<Waiter, ClockTag>,
}

// All fields are only touched under the kernel lock.
unsafe impl Sync for Waiter {}
unsafe impl Send for Waiter {}

impl_linked!(wait_link, Waiter, WaitTag);
impl_linked!(clock_link, Waiter, ClockTag);

impl Waiter {
    pub const fn new() -> Waiter {
        Waiter {
            thread: Cell::new(core::ptr::null()),
            deadline: Cell::new(None),
            reason: Cell::new(WakeReason::Pending),
            flags_spec: Cell::new(None),
            flags_result: Cell::new(0),
            handoff: Cell::new(core::ptr::null_mut()),
            wait_link: Link::new(),
            clock_link: Link::new(),
        }
    }

    /// Attach the waiter to its owning thread. Called once, before the
    /// thread can block.
    pub fn bind(&self, thread: *const RawThread) {
        self.thread.set(thread);
    }

    pub fn thread(&self) -> &RawThread {
        unsafe { &*self.thread.get() }
    }

    pub fn thread_ptr(&self) -> NonNull<RawThread> {
        NonNull::new(self.thread.get() as *mut RawThread).unwrap()
    }

    pub fn priority(&self, kkey: KernelLockKey<'_>) -> Priority {
        self.thread().dyn_priority(kkey)
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.deadline.set(deadline);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.get()
    }

    pub fn set_reason(&self, reason: WakeReason) {
        self.reason.set(reason);
    }

    pub fn reason(&self) -> WakeReason {
        self.reason.get()
    }

    pub fn set_flags_spec(&self, spec: Option<FlagsSpec>) {
        self.flags_spec.set(spec);
    }

    pub fn flags_spec(&self) -> Option<FlagsSpec> {
        self.flags_spec.get()
    }

    pub fn set_flags_result(&self, flags: u32) {
        self.flags_result.set(flags);
    }

    pub fn flags_result(&self) -> u32 {
        self.flags_result.get()
    }

    pub fn set_handoff(&self, block: *mut u8) {
        self.handoff.set(block);
    }

    pub fn take_handoff(&self) -> *mut u8 {
        self.handoff.replace(core::ptr::null_mut())
    }

    /// Detach from the wait list and the clock queue, wherever linked.
    /// Every wake path and the post-switch cleanup call this, which is
    /// what guarantees a timeout node never outlives its wait.
    pub fn unlink_all(&self, _kkey: KernelLockKey<'_>) {
        self.wait_link.unlink();
        self.clock_link.unlink();
    }

    /// Re-sort within the containing wait list after the thread's
    /// dynamic priority changed. No-op when not queued.
    pub fn reposition(&self, kkey: KernelLockKey<'_>) {
        if let Some(mut list) = self.wait_link.containing_list() {
            let list = unsafe { list.as_mut() };
            list.remove(self);
            let priority = self.priority(kkey);
            list.insert_when(self, |queued| queued.priority(kkey) >= priority);
        }
    }
}

/// A priority-ordered list of waiters, one per blocking primitive.
pub(crate) struct WaitList {
    list: LockedRefCell<List<Waiter, WaitTag>, KernelLock>,
}

impl WaitList {
    pub const fn new() -> WaitList {
        WaitList {
            list: LockedRefCell::new(List::new()),
        }
    }

    /// Ordered insert: descending priority, FIFO among equals.
    pub fn add(&self, kkey: KernelLockKey<'_>, waiter: &Waiter) {
        let priority = waiter.priority(kkey);
        self.list
            .borrow_mut(kkey)
            .insert_when(waiter, |queued| queued.priority(kkey) >= priority);
    }

    pub fn is_empty(&self, kkey: KernelLockKey<'_>) -> bool {
        self.list.borrow(kkey).is_empty()
    }

    /// Highest waiter priority, if any waiter is queued.
    pub fn head_priority(&self, kkey: KernelLockKey<'_>) -> Option<Priority> {
        self.list.borrow(kkey).head().map(|w| w.priority(kkey))
    }

    /// Detach the head waiter without waking it.
    pub fn take_one<'a>(&self, kkey: KernelLockKey<'_>) -> Option<&'a Waiter> {
        self.list.borrow_mut(kkey).pop_front()
    }

    /// First waiter satisfying `pred`, detached from the list.
    pub fn take_first_matching<'a>(
        &self,
        kkey: KernelLockKey<'_>,
        pred: impl Fn(&Waiter) -> bool,
    ) -> Option<&'a Waiter> {
        let mut list = self.list.borrow_mut(kkey);
        let found: Option<NonNull<Waiter>> =
            list.iter().find(|w| pred(w)).map(|w| NonNull::from(w));
        let found = found?;
        let waiter = unsafe { &*found.as_ptr() };
        list.remove(waiter);
        Some(waiter)
    }

    /// Wake the head waiter (the oldest among those with the highest
    /// priority). Returns its thread when one was woken. The caller is
    /// responsible for a reschedule once its own bookkeeping is done.
    pub fn wake_one(
        &self,
        kkey: KernelLockKey<'_>,
        reason: WakeReason,
    ) -> Option<NonNull<RawThread>> {
        let waiter = self.take_one(kkey)?;
        Some(wake_detached(kkey, waiter, reason))
    }

    /// Drain the list in head order. Returns whether anything was woken.
    pub fn wake_all(&self, kkey: KernelLockKey<'_>, reason: WakeReason) -> bool {
        let mut woken = false;
        while self.wake_one(kkey, reason).is_some() {
            woken = true;
        }
        woken
    }
}

/// Finish waking a waiter that is already detached from its wait list.
pub(crate) fn wake_detached(
    kkey: KernelLockKey<'_>,
    waiter: &Waiter,
    reason: WakeReason,
) -> NonNull<RawThread> {
    waiter.clock_link.unlink();
    waiter.set_reason(reason);
    let thread = waiter.thread_ptr();
    scheduler::ready_thread(kkey, unsafe { thread.as_ref() });
    thread
}
