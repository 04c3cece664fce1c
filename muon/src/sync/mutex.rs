//! Mutexes.
//!
//! [`RawMutex`] implements the full ownership protocol: normal,
//! error-checking and recursive kinds; priority inheritance or a fixed
//! priority ceiling; and the robustness protocol that reports a holder's
//! death to the next acquirer. [`Mutex`] wraps it around a value with an
//! RAII guard.
//!
//! Ownership transfers directly to the highest-priority waiter on
//! unlock, so the mutex is never observably free while someone waits.

use crate::cell::LockedCell;
use crate::config;
use crate::error::{Error, Result};
use crate::kernel::fault::{kernel_fault, KernelFault};
use crate::kernel::hal;
use crate::kernel::klock::{KernelLock, KernelLockKey};
use crate::kernel::list::{impl_linked, Link, ListTag};
use crate::kernel::priority::Priority;
use crate::kernel::scheduler;
use crate::kernel::waiter::{wake_detached, WaitList, WakeReason};
use crate::thread::{RawThread, ThreadState};
use crate::time::{Duration, Instant};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

/// Tag for the per-thread list of owned mutexes.
pub(crate) struct OwnedTag {}
impl ListTag for OwnedTag {}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MutexKind {
    /// Relocking by the owner is reported as a deadlock rather than a
    /// guarantee; see the error-checking kind for the checked variant.
    Normal,
    /// Self-lock and non-owner unlock are detected and reported.
    Errorcheck,
    /// The owner may relock up to `max_recursion` times.
    Recursive,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MutexProtocol {
    /// No priority adjustment.
    None,
    /// The holder inherits the highest waiter priority.
    Inherit,
    /// The holder runs at the mutex ceiling while holding it.
    Protect,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MutexRobustness {
    /// A dead holder leaves the mutex locked forever.
    Stalled,
    /// A dead holder is reported to the next acquirer.
    Robust,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum MutexConsistency {
    Consistent,
    Inconsistent,
    NotRecoverable,
}

pub const DEFAULT_MAX_RECURSION: usize = 255;

#[derive(Copy, Clone)]
pub struct MutexAttributes {
    pub kind: MutexKind,
    pub protocol: MutexProtocol,
    pub robustness: MutexRobustness,
    pub ceiling: Priority,
    pub max_recursion: usize,
}

impl MutexAttributes {
    pub const fn new() -> MutexAttributes {
        MutexAttributes {
            kind: MutexKind::Normal,
            protocol: MutexProtocol::None,
            robustness: MutexRobustness::Stalled,
            ceiling: Priority::MAX,
            max_recursion: DEFAULT_MAX_RECURSION,
        }
    }

    pub const fn recursive() -> MutexAttributes {
        MutexAttributes::new().with_kind(MutexKind::Recursive)
    }

    pub const fn errorcheck() -> MutexAttributes {
        MutexAttributes::new().with_kind(MutexKind::Errorcheck)
    }

    pub const fn with_kind(mut self, kind: MutexKind) -> MutexAttributes {
        self.kind = kind;
        self
    }

    pub const fn with_protocol(mut self, protocol: MutexProtocol) -> MutexAttributes {
        self.protocol = protocol;
        self
    }

    /// Priority ceiling, meaningful under [`MutexProtocol::Protect`].
    pub const fn with_ceiling(mut self, ceiling: Priority) -> MutexAttributes {
        self.ceiling = ceiling;
        self
    }

    pub const fn robust(mut self) -> MutexAttributes {
        self.robustness = MutexRobustness::Robust;
        self
    }

    pub const fn with_max_recursion(mut self, max_recursion: usize) -> MutexAttributes {
        self.max_recursion = max_recursion;
        self
    }
}

impl Default for MutexAttributes {
    fn default() -> MutexAttributes {
        MutexAttributes::new()
    }
}

pub struct RawMutex {
    kind: MutexKind,
    protocol: MutexProtocol,
    robustness: MutexRobustness,
    ceiling: Priority,
    max_recursion: usize,

    owner: LockedCell<Option<NonNull<RawThread>>, KernelLock>,
    recursion: LockedCell<usize, KernelLock>,
    /// This mutex's contribution to its owner's dynamic priority:
    /// the ceiling under `Protect`, the highest waiter priority under
    /// `Inherit`, idle (no contribution) otherwise.
    boost: LockedCell<Priority, KernelLock>,
    consistency: LockedCell<MutexConsistency, KernelLock>,
    waiters: WaitList,
    owned_link: Link<RawMutex, OwnedTag>,
}

unsafe impl Sync for RawMutex {}
unsafe impl Send for RawMutex {}

impl_linked!(owned_link, RawMutex, OwnedTag);

impl RawMutex {
    pub const fn new(attributes: MutexAttributes) -> RawMutex {
        RawMutex {
            kind: attributes.kind,
            protocol: attributes.protocol,
            robustness: attributes.robustness,
            ceiling: attributes.ceiling,
            max_recursion: attributes.max_recursion,
            owner: LockedCell::new(None),
            recursion: LockedCell::new(0),
            boost: LockedCell::new(Priority::IDLE),
            consistency: LockedCell::new(MutexConsistency::Consistent),
            waiters: WaitList::new(),
            owned_link: Link::new(),
        }
    }

    pub(crate) fn boost(&self, kkey: KernelLockKey<'_>) -> Priority {
        self.boost.get(kkey)
    }

    pub fn is_locked(&self) -> bool {
        KernelLock::with(|kkey| self.owner.get(kkey).is_some())
    }

    pub fn lock(&self) -> Result<()> {
        self.lock_inner(None, false)
    }

    pub fn try_lock(&self) -> Result<()> {
        self.lock_inner(None, true)
    }

    pub fn lock_until(&self, deadline: Instant) -> Result<()> {
        self.lock_inner(Some(deadline), false)
    }

    pub fn lock_for(&self, timeout: Duration) -> Result<()> {
        self.lock_until(crate::kernel::clock::sysclock().now() + timeout)
    }

    fn lock_inner(&self, deadline: Option<Instant>, try_only: bool) -> Result<()> {
        if hal::in_handler_mode() {
            return Err(Error::Perm);
        }
        KernelLock::with(|kkey| loop {
            let current = scheduler::current_thread(kkey);
            match self.owner.get(kkey) {
                None => return self.acquire(kkey, current),
                Some(owner) if core::ptr::eq(owner.as_ptr(), current) => {
                    return match self.kind {
                        MutexKind::Recursive => {
                            let recursion = self.recursion.get(kkey);
                            if recursion >= self.max_recursion {
                                Err(Error::Again)
                            } else {
                                self.recursion.set(kkey, recursion + 1);
                                Ok(())
                            }
                        }
                        // Self-lock on a normal mutex is not a promise;
                        // it is reported like the error-checking kind
                        // instead of wedging the thread.
                        MutexKind::Normal | MutexKind::Errorcheck => Err(Error::Deadlock),
                    };
                }
                Some(owner) => {
                    if self.consistency.get(kkey) == MutexConsistency::NotRecoverable {
                        return Err(Error::NotRecoverable);
                    }
                    if self.protocol == MutexProtocol::Protect
                        && current.dyn_priority(kkey) > self.ceiling
                    {
                        return Err(Error::Inval);
                    }
                    if try_only {
                        return Err(Error::WouldBlock);
                    }

                    if self.protocol == MutexProtocol::Inherit {
                        let boosted = self.boost.get(kkey).max(current.dyn_priority(kkey));
                        self.boost.set(kkey, boosted);
                        let owner = unsafe { &*owner.as_ptr() };
                        owner.recompute_priority(kkey);
                        owner.propagate_blocked_priority(kkey);
                    }

                    current.blocked_on.set(kkey, Some(NonNull::from(self)));
                    let reason = scheduler::block_current(
                        kkey,
                        Some(&self.waiters),
                        deadline,
                        ThreadState::Blocked,
                    );
                    current.blocked_on.set(kkey, None);

                    match reason {
                        WakeReason::Transfer => {
                            return match self.consistency.get(kkey) {
                                MutexConsistency::Inconsistent => Err(Error::OwnerDead),
                                _ => Ok(()),
                            };
                        }
                        WakeReason::Timeout | WakeReason::Interrupted => {
                            // Our departure may lower the inherited
                            // priority of the holder.
                            self.refresh_inherit_boost(kkey, 0);
                            return Err(match reason {
                                WakeReason::Timeout => Error::TimedOut,
                                _ => Error::Interrupted,
                            });
                        }
                        WakeReason::Notify | WakeReason::Pending => continue,
                    }
                }
            }
        })
    }

    fn acquire(&self, kkey: KernelLockKey<'_>, current: &'static RawThread) -> Result<()> {
        if self.consistency.get(kkey) == MutexConsistency::NotRecoverable {
            return Err(Error::NotRecoverable);
        }
        if self.protocol == MutexProtocol::Protect && current.dyn_priority(kkey) > self.ceiling {
            return Err(Error::Inval);
        }

        self.owner.set(kkey, Some(NonNull::from(current)));
        self.recursion.set(kkey, 1);
        if self.protocol == MutexProtocol::Protect {
            self.boost.set(kkey, self.ceiling);
        }
        current.owned_mutexes.borrow_mut(kkey).push_front(self);
        current.recompute_priority(kkey);

        if self.consistency.get(kkey) == MutexConsistency::Inconsistent {
            Err(Error::OwnerDead)
        } else {
            Ok(())
        }
    }

    pub fn unlock(&self) -> Result<()> {
        if hal::in_handler_mode() {
            return Err(Error::Perm);
        }
        KernelLock::with(|kkey| {
            let current = scheduler::current_thread(kkey);
            self.release(kkey, current)?;
            scheduler::reschedule(kkey);
            Ok(())
        })
    }

    /// Release one level of ownership held by `current`. On the final
    /// release the mutex is handed to the best waiter or freed.
    pub(crate) fn release(&self, kkey: KernelLockKey<'_>, current: &RawThread) -> Result<()> {
        match self.owner.get(kkey) {
            Some(owner) if core::ptr::eq(owner.as_ptr(), current) => (),
            _ => return Err(Error::Perm),
        }

        let recursion = self.recursion.get(kkey);
        if recursion > 1 {
            self.recursion.set(kkey, recursion - 1);
            return Ok(());
        }

        if self.consistency.get(kkey) == MutexConsistency::Inconsistent {
            // Released without restoring consistency: the protected
            // state is lost for good and every waiter learns it.
            self.consistency.set(kkey, MutexConsistency::NotRecoverable);
            self.detach_from_owner(kkey, current);
            self.owner.set(kkey, None);
            self.recursion.set(kkey, 0);
            self.waiters.wake_all(kkey, WakeReason::Notify);
            return Ok(());
        }

        self.detach_from_owner(kkey, current);
        self.pass_or_free(kkey);
        Ok(())
    }

    fn detach_from_owner(&self, kkey: KernelLockKey<'_>, owner: &RawThread) {
        self.owned_link.unlink();
        self.boost.set(kkey, Priority::IDLE);
        owner.recompute_priority(kkey);
    }

    /// Hand the mutex to the head waiter, or leave it free.
    fn pass_or_free(&self, kkey: KernelLockKey<'_>) {
        if self.consistency.get(kkey) == MutexConsistency::NotRecoverable {
            self.owner.set(kkey, None);
            self.recursion.set(kkey, 0);
            self.waiters.wake_all(kkey, WakeReason::Notify);
            return;
        }

        match self.waiters.take_one(kkey) {
            Some(waiter) => {
                let thread_ptr = waiter.thread_ptr();
                let thread = unsafe { &*thread_ptr.as_ptr() };
                self.owner.set(kkey, Some(thread_ptr));
                self.recursion.set(kkey, 1);
                self.boost.set(
                    kkey,
                    match self.protocol {
                        MutexProtocol::Protect => self.ceiling,
                        MutexProtocol::Inherit => self.waiters_max_priority(kkey),
                        MutexProtocol::None => Priority::IDLE,
                    },
                );
                thread.owned_mutexes.borrow_mut(kkey).push_front(self);
                thread.recompute_priority(kkey);
                wake_detached(kkey, waiter, WakeReason::Transfer);
            }
            None => {
                self.owner.set(kkey, None);
                self.recursion.set(kkey, 0);
            }
        }
    }

    fn waiters_max_priority(&self, kkey: KernelLockKey<'_>) -> Priority {
        self.waiters.head_priority(kkey).unwrap_or(Priority::IDLE)
    }

    /// Recompute the inherited boost from the current waiter set and
    /// push the result up a blocked-owner chain, bounded by the
    /// configured depth cap.
    pub(crate) fn refresh_inherit_boost(&self, kkey: KernelLockKey<'_>, depth: usize) {
        if self.protocol != MutexProtocol::Inherit {
            return;
        }
        self.boost.set(kkey, self.waiters_max_priority(kkey));
        if let Some(owner) = self.owner.get(kkey) {
            let owner = unsafe { &*owner.as_ptr() };
            owner.recompute_priority(kkey);
            if depth + 1 < config::MUTEX_INHERIT_DEPTH_MAX {
                if let Some(next) = owner.blocked_on.get(kkey) {
                    unsafe { next.as_ref() }.refresh_inherit_boost(kkey, depth + 1);
                }
            }
        }
    }

    /// Owner death cleanup; the dead thread's owned list has already
    /// dropped this mutex.
    pub(crate) fn on_owner_death(&self, kkey: KernelLockKey<'_>, _dead: &RawThread) {
        self.recursion.set(kkey, 0);
        match self.robustness {
            MutexRobustness::Robust => {
                if self.consistency.get(kkey) == MutexConsistency::Consistent {
                    self.consistency.set(kkey, MutexConsistency::Inconsistent);
                }
                self.boost.set(kkey, Priority::IDLE);
                self.pass_or_free(kkey);
            }
            MutexRobustness::Stalled => {
                // Stays held by the dead thread; waiters stay put.
            }
        }
    }

    /// Declare the state protected by an owner-dead mutex repaired.
    /// Only the thread that acquired it with `OwnerDead` may call this.
    pub fn mark_consistent(&self) -> Result<()> {
        KernelLock::with(|kkey| match self.consistency.get(kkey) {
            MutexConsistency::Inconsistent => {
                let current = scheduler::current_thread(kkey);
                match self.owner.get(kkey) {
                    Some(owner) if core::ptr::eq(owner.as_ptr(), current) => {
                        self.consistency.set(kkey, MutexConsistency::Consistent);
                        Ok(())
                    }
                    _ => Err(Error::Perm),
                }
            }
            _ => Err(Error::Inval),
        })
    }

    pub(crate) fn is_inconsistent(&self) -> bool {
        KernelLock::with(|kkey| self.consistency.get(kkey) == MutexConsistency::Inconsistent)
    }
}

impl Drop for RawMutex {
    fn drop(&mut self) {
        let in_use =
            KernelLock::with(|kkey| self.owner.get(kkey).is_some() || !self.waiters.is_empty(kkey));
        if in_use {
            kernel_fault(KernelFault::ConfigError("mutex dropped while in use"));
        }
    }
}

/// A value protected by a [`RawMutex`].
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Mutex<T> {
        Mutex::with_attributes(MutexAttributes::new(), data)
    }

    pub const fn with_attributes(attributes: MutexAttributes, data: T) -> Mutex<T> {
        Mutex {
            raw: RawMutex::new(attributes),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Lock, blocking as needed. An `OwnerDead` acquisition still
    /// returns the guard; query it with [`MutexGuard::is_inconsistent`].
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        self.guard_from(self.raw.lock())
    }

    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>> {
        self.guard_from(self.raw.try_lock())
    }

    pub fn lock_until(&self, deadline: Instant) -> Result<MutexGuard<'_, T>> {
        self.guard_from(self.raw.lock_until(deadline))
    }

    fn guard_from(&self, outcome: Result<()>) -> Result<MutexGuard<'_, T>> {
        match outcome {
            Ok(()) | Err(Error::OwnerDead) => Ok(MutexGuard { mutex: self }),
            Err(error) => Err(error),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// True when the previous owner died holding the mutex and the state
    /// has not been marked consistent yet.
    pub fn is_inconsistent(&self) -> bool {
        self.mutex.raw.is_inconsistent()
    }

    pub fn mark_consistent(&self) -> Result<()> {
        self.mutex.raw.mark_consistent()
    }
}

pub(crate) fn guard_raw<'a, T: ?Sized>(guard: &MutexGuard<'a, T>) -> &'a RawMutex {
    &guard.mutex.raw
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.mutex.raw.unlock();
    }
}
