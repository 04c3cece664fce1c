//! The scheduler: ready list, current thread, scheduler lock.
//!
//! Invariants: exactly one thread is `Running`; the running thread has
//! the highest dynamic priority among the ready set unless the scheduler
//! is locked, in which case preemption is deferred to the outermost
//! unlock. The ready list is ordered by descending dynamic priority with
//! FIFO among equals; a preempted thread re-enters at the front of its
//! priority class, a woken or yielding thread at the back, so the
//! round-robin rotates only on explicit yields.
//!
//! All state lives behind the kernel lock. Mutation helpers run inside a
//! `LockedRefCell` borrow and *return* the context pair to switch; the
//! borrow is dropped before `hal::switch_context` is invoked, so the
//! thread that is switched in never finds the scheduler borrowed.

use crate::cell::LockedRefCell;
use crate::kernel::fault::{kernel_fault, KernelFault};
use crate::kernel::hal;
use crate::kernel::klock::{KernelLock, KernelLockKey};
use crate::kernel::list::{List, ListTag};
use crate::kernel::waiter::{WaitList, WakeReason};
use crate::thread::{RawThread, ThreadState};
use crate::time::Instant;
use core::ptr::NonNull;

pub(crate) struct RunTag {}
impl ListTag for RunTag {}

type SwitchFrames = (*mut hal::Context, *mut hal::Context);

pub(crate) struct RawScheduler {
    ready: List<RawThread, RunTag>,
    current: Option<NonNull<RawThread>>,
    idle: Option<NonNull<RawThread>>,
    started: bool,
    lock_nesting: usize,
    preempt_pending: bool,
}

static SCHEDULER: LockedRefCell<RawScheduler, KernelLock> =
    LockedRefCell::new(RawScheduler::new());

impl RawScheduler {
    const fn new() -> RawScheduler {
        RawScheduler {
            ready: List::new(),
            current: None,
            idle: None,
            started: false,
            lock_nesting: 0,
            preempt_pending: false,
        }
    }

    fn current_ref(&self) -> Option<&'static RawThread> {
        self.current.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    fn is_idle(&self, thread: &RawThread) -> bool {
        match self.idle {
            Some(idle) => core::ptr::eq(idle.as_ptr(), thread),
            None => false,
        }
    }

    fn insert_ready(&mut self, kkey: KernelLockKey<'_>, thread: &RawThread, front_of_equals: bool) {
        thread.state.set(kkey, ThreadState::Ready);
        if self.is_idle(thread) {
            // The idle thread is always runnable and never queued.
            return;
        }
        let priority = thread.dyn_priority(kkey);
        if front_of_equals {
            self.ready
                .insert_when(thread, |queued| queued.dyn_priority(kkey) > priority);
        } else {
            self.ready
                .insert_when(thread, |queued| queued.dyn_priority(kkey) >= priority);
        }
    }

    fn ready_thread(&mut self, kkey: KernelLockKey<'_>, thread: &RawThread) {
        match thread.state.get(kkey) {
            ThreadState::Created | ThreadState::Blocked | ThreadState::Suspended => {
                self.insert_ready(kkey, thread, false);
                self.update_preempt_flag(kkey);
            }
            ThreadState::Ready | ThreadState::Running | ThreadState::Terminated => (),
        }
    }

    fn pick_next(&mut self, _kkey: KernelLockKey<'_>) -> NonNull<RawThread> {
        match self.ready.pop_front() {
            Some(thread) => NonNull::from(thread),
            None => self.idle.expect("scheduler started without an idle thread"),
        }
    }

    fn update_preempt_flag(&mut self, kkey: KernelLockKey<'_>) {
        if !self.started {
            return;
        }
        let current = match self.current_ref() {
            Some(current) => current,
            None => return,
        };
        if let Some(head) = self.ready.head() {
            if head.dyn_priority(kkey) > current.dyn_priority(kkey) {
                self.preempt_pending = true;
            }
        }
    }

    /// Make `next` the running thread. The caller has already put the
    /// outgoing thread where it belongs (ready list, wait list, or
    /// nowhere for a terminated thread).
    fn switch_to(
        &mut self,
        kkey: KernelLockKey<'_>,
        next: NonNull<RawThread>,
    ) -> Option<SwitchFrames> {
        let current = self.current.expect("switch without a current thread");
        if current == next {
            return None;
        }

        let outgoing = unsafe { &*current.as_ptr() };
        let incoming = unsafe { &*next.as_ptr() };

        // A canary failure is detected when the offender is switched out,
        // while its context is still intact enough to report.
        if !outgoing.stack_intact(kkey) {
            kernel_fault(KernelFault::StackOverflow {
                thread: outgoing.name,
            });
        }

        outgoing.note_switched_out(kkey);
        incoming.state.set(kkey, ThreadState::Running);
        incoming.note_switched_in(kkey);
        self.current = Some(next);

        Some((outgoing.context_ptr(), incoming.context_ptr()))
    }

    fn take_pending_switch(&mut self, kkey: KernelLockKey<'_>) -> Option<SwitchFrames> {
        if !self.started || self.lock_nesting > 0 || !self.preempt_pending {
            return None;
        }
        self.preempt_pending = false;

        let current = self.current_ref()?;
        let current_priority = current.dyn_priority(kkey);
        match self.ready.head() {
            Some(head) if head.dyn_priority(kkey) > current_priority => (),
            _ => return None,
        }

        let next = self.pick_next(kkey);
        // The preempted thread has not used up its turn; it stays ahead
        // of its equals.
        self.insert_ready(kkey, current, true);
        self.switch_to(kkey, next)
    }
}

/// Transition a thread out of a blocked/suspended state into the ready
/// list. No-op for threads that are already runnable or terminated.
pub(crate) fn ready_thread(kkey: KernelLockKey<'_>, thread: &RawThread) {
    SCHEDULER.borrow_mut(kkey).ready_thread(kkey, thread);
}

/// Perform a pending preemption, if one is due and permitted.
pub(crate) fn reschedule(kkey: KernelLockKey<'_>) {
    let frames = SCHEDULER.borrow_mut(kkey).take_pending_switch(kkey);
    if let Some((from, to)) = frames {
        unsafe { hal::switch_context(from, to) };
    }
}

/// Block the current thread: link its waiter into `queue` (when given)
/// and into the clock queue (when a deadline is given), switch to the
/// next runnable thread, and return the wake reason once resumed.
///
/// Must be called with the scheduler unlocked, from thread context.
pub(crate) fn block_current(
    kkey: KernelLockKey<'_>,
    queue: Option<&WaitList>,
    deadline: Option<Instant>,
    new_state: ThreadState,
) -> WakeReason {
    let (thread, frames) = {
        let mut sched = SCHEDULER.borrow_mut(kkey);
        if !sched.started {
            kernel_fault(KernelFault::NotStarted);
        }
        if sched.lock_nesting > 0 {
            kernel_fault(KernelFault::BlockedWhileSchedulerLocked);
        }
        let current = sched.current.expect("blocking with no current thread");
        if sched.is_idle(unsafe { current.as_ref() }) {
            kernel_fault(KernelFault::IdleThreadBlocked);
        }

        let thread = unsafe { &*current.as_ptr() };
        thread.waiter.set_reason(WakeReason::Pending);
        thread.waiter.set_deadline(deadline);
        thread.state.set(kkey, new_state);

        let next = sched.pick_next(kkey);
        let frames = sched
            .switch_to(kkey, next)
            .expect("blocking thread rescheduled itself");
        (thread, frames)
    };

    if let Some(queue) = queue {
        queue.add(kkey, &thread.waiter);
    }
    if deadline.is_some() {
        crate::kernel::clock::enqueue_timeout(kkey, &thread.waiter);
    }

    let (from, to) = frames;
    unsafe { hal::switch_context(from, to) };

    // Resumed. The wake path has already detached the waiter, but an
    // interrupted wake may leave one of the two nodes linked; drop both
    // unconditionally so no node outlives the wait.
    thread.waiter.unlink_all(kkey);
    thread.waiter.reason()
}

/// Switch away from a terminated thread. Its context is never resumed.
pub(crate) fn switch_away_forever(kkey: KernelLockKey<'_>) -> ! {
    let frames = {
        let mut sched = SCHEDULER.borrow_mut(kkey);
        let next = sched.pick_next(kkey);
        sched.switch_to(kkey, next)
    };
    if let Some((from, to)) = frames {
        unsafe { hal::switch_context(from, to) };
    }
    // Unreachable: a terminated context was scheduled again.
    hal::abort()
}

pub(crate) fn current_thread(kkey: KernelLockKey<'_>) -> &'static RawThread {
    match SCHEDULER.borrow(kkey).current_ref() {
        Some(thread) => thread,
        None => kernel_fault(KernelFault::NotStarted),
    }
}

pub(crate) fn try_current(kkey: KernelLockKey<'_>) -> Option<&'static RawThread> {
    SCHEDULER.borrow(kkey).current_ref()
}

/// Re-sort a ready thread after its dynamic priority changed, and note a
/// preemption if the running thread no longer ranks highest.
pub(crate) fn requeue_after_priority_change(kkey: KernelLockKey<'_>, thread: &RawThread) {
    let mut sched = SCHEDULER.borrow_mut(kkey);
    if thread.state.get(kkey) == ThreadState::Ready && !sched.is_idle(thread) {
        sched.ready.remove(thread);
        sched.insert_ready(kkey, thread, false);
    }
    sched.update_preempt_flag(kkey);
}

/// Remove a thread from the ready list (kill path).
pub(crate) fn remove_from_ready(kkey: KernelLockKey<'_>, thread: &RawThread) {
    SCHEDULER.borrow_mut(kkey).ready.remove(thread);
}

/// Voluntarily give way to any ready thread of equal or higher priority.
pub fn yield_now() {
    KernelLock::with(|kkey| {
        let frames = {
            let mut sched = SCHEDULER.borrow_mut(kkey);
            if !sched.started || sched.lock_nesting > 0 {
                None
            } else {
                let current = sched.current.expect("yield with no current thread");
                let current_ref = unsafe { &*current.as_ptr() };
                let current_priority = current_ref.dyn_priority(kkey);
                let runnable = match sched.ready.head() {
                    Some(head) => {
                        sched.is_idle(current_ref)
                            || head.dyn_priority(kkey) >= current_priority
                    }
                    None => false,
                };
                if runnable {
                    let next = sched.pick_next(kkey);
                    // A yielding thread goes behind its equals.
                    sched.insert_ready(kkey, current_ref, false);
                    sched.switch_to(kkey, next)
                } else {
                    None
                }
            }
        };
        if let Some((from, to)) = frames {
            unsafe { hal::switch_context(from, to) };
        }
    })
}

/// Lock the scheduler, deferring preemption. Returns the previous
/// nesting depth, to be handed back to [`unlock`].
pub fn lock() -> usize {
    KernelLock::with(|kkey| {
        let mut sched = SCHEDULER.borrow_mut(kkey);
        let previous = sched.lock_nesting;
        sched.lock_nesting += 1;
        previous
    })
}

/// Restore the scheduler lock to `previous`. Unlocking to zero performs
/// any reschedule deferred while locked.
pub fn unlock(previous: usize) {
    KernelLock::with(|kkey| {
        SCHEDULER.borrow_mut(kkey).lock_nesting = previous;
        if previous == 0 {
            reschedule(kkey);
        }
    })
}

/// Run `f` with the scheduler locked.
pub fn locked<R>(f: impl FnOnce() -> R) -> R {
    let previous = lock();
    let result = f();
    unlock(previous);
    result
}

pub fn is_locked() -> bool {
    KernelLock::with(|kkey| SCHEDULER.borrow(kkey).lock_nesting > 0)
}

/// Install the idle thread, promote the highest-priority ready thread to
/// running, and hand control to the port. Never returns.
pub(crate) fn start_with_idle(idle: &'static RawThread) -> ! {
    let first_context = KernelLock::with(|kkey| {
        let mut sched = SCHEDULER.borrow_mut(kkey);
        sched.idle = Some(NonNull::from(idle));
        let first = match sched.ready.pop_front() {
            Some(thread) => NonNull::from(thread),
            None => NonNull::from(idle),
        };
        let first_ref = unsafe { &*first.as_ptr() };
        first_ref.state.set(kkey, ThreadState::Running);
        first_ref.note_switched_in(kkey);
        sched.current = Some(first);
        sched.started = true;
        first_ref.context_ptr()
    });

    hal::start_clock();
    hal::start_first_thread(first_context)
}
