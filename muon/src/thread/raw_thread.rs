use super::{ChildTag, RegistryTag, ThreadState};
use crate::cell::{LockedCell, LockedRefCell, RacyCell};
use crate::error::{Error, Result};
use crate::kernel::klock::{KernelLock, KernelLockKey};
use crate::kernel::list::{impl_linked, Link, List};
use crate::kernel::priority::Priority;
use crate::kernel::scheduler::{self, RunTag};
use crate::kernel::stack::StackRef;
use crate::kernel::waiter::{FlagsSpec, WaitList, Waiter, WakeReason};
use crate::kernel::hal;
use crate::sync::event_flags::{flags_match, FlagsMode, RESERVED_FLAGS};
use crate::sync::mutex::{OwnedTag, RawMutex};
use crate::time::Instant;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

/// The thread control block.
///
/// One per thread, statically allocated through `make_thread!`. Mutable
/// state is only touched under the kernel lock; the list links follow the
/// same rule.
pub(crate) struct RawThread {
    pub(crate) id: LockedCell<u32, KernelLock>,
    pub(crate) name: &'static str,

    pub(crate) base_priority: LockedCell<Priority, KernelLock>,
    dyn_priority: LockedCell<Priority, KernelLock>,
    pub(crate) state: LockedCell<ThreadState, KernelLock>,

    pub(crate) stack: LockedRefCell<Option<StackRef>, KernelLock>,
    pub(crate) exit_value: LockedCell<*mut (), KernelLock>,
    pub(crate) detached: LockedCell<bool, KernelLock>,

    /// Per-thread event flags; bit 0 is reserved for the kernel.
    pub(crate) flags: LockedCell<u32, KernelLock>,
    flag_wait: LockedCell<Option<FlagsSpec>, KernelLock>,

    pub(crate) waiter: Waiter,
    pub(crate) run_link: Link<RawThread, RunTag>,
    registry_link: Link<RawThread, RegistryTag>,
    child_link: Link<RawThread, ChildTag>,

    pub(crate) parent: LockedCell<Option<NonNull<RawThread>>, KernelLock>,
    pub(crate) children: LockedRefCell<List<RawThread, ChildTag>, KernelLock>,
    pub(crate) joiners: WaitList,

    /// Mutexes currently owned; drives the dynamic priority and the
    /// cleanup when the owner dies.
    pub(crate) owned_mutexes: LockedRefCell<List<RawMutex, OwnedTag>, KernelLock>,
    /// The mutex this thread is blocked on, for inheritance chains.
    pub(crate) blocked_on: LockedCell<Option<NonNull<RawMutex>>, KernelLock>,

    #[cfg(feature = "statistics-context-switches")]
    context_switches: LockedCell<u32, KernelLock>,
    #[cfg(feature = "statistics-cpu-cycles")]
    cpu_cycles: LockedCell<u64, KernelLock>,
    #[cfg(feature = "statistics-cpu-cycles")]
    switched_in_at: LockedCell<u64, KernelLock>,

    pub(crate) context: RacyCell<MaybeUninit<hal::Context>>,
}

// The raw pointers and links are only touched under the kernel lock.
unsafe impl Sync for RawThread {}
unsafe impl Send for RawThread {}

impl_linked!(run_link, RawThread, RunTag);
impl_linked!(registry_link, RawThread, RegistryTag);
impl_linked!(child_link, RawThread, ChildTag);

impl RawThread {
    pub(crate) const fn new(name: &'static str, priority: Priority) -> RawThread {
        RawThread {
            id: LockedCell::new(0),
            name,
            base_priority: LockedCell::new(priority),
            dyn_priority: LockedCell::new(priority),
            state: LockedCell::new(ThreadState::Created),
            stack: LockedRefCell::new(None),
            exit_value: LockedCell::new(core::ptr::null_mut()),
            detached: LockedCell::new(false),
            flags: LockedCell::new(0),
            flag_wait: LockedCell::new(None),
            waiter: Waiter::new(),
            run_link: Link::new(),
            registry_link: Link::new(),
            child_link: Link::new(),
            parent: LockedCell::new(None),
            children: LockedRefCell::new(List::new()),
            joiners: WaitList::new(),
            owned_mutexes: LockedRefCell::new(List::new()),
            blocked_on: LockedCell::new(None),
            #[cfg(feature = "statistics-context-switches")]
            context_switches: LockedCell::new(0),
            #[cfg(feature = "statistics-cpu-cycles")]
            cpu_cycles: LockedCell::new(0),
            #[cfg(feature = "statistics-cpu-cycles")]
            switched_in_at: LockedCell::new(0),
            context: RacyCell::new(MaybeUninit::uninit()),
        }
    }

    pub(crate) fn dyn_priority(&self, kkey: KernelLockKey<'_>) -> Priority {
        self.dyn_priority.get(kkey)
    }

    pub(crate) fn context_ptr(&self) -> *mut hal::Context {
        unsafe { (*self.context.get()).as_mut_ptr() }
    }

    pub(crate) fn init_context(&self, kkey: KernelLockKey<'_>, entry: fn(*mut ()), arg: *mut ()) {
        use muon_khal::ContextInfo;
        let stack = self.stack.borrow(kkey);
        let stack = stack.as_ref().expect("thread started without a stack");
        unsafe {
            hal::Context::init(
                self.name,
                entry as *const (),
                arg,
                stack.base_ptr(),
                stack.size(),
                self.context_ptr(),
            );
        }
    }

    pub(crate) fn stack_intact(&self, kkey: KernelLockKey<'_>) -> bool {
        match self.stack.borrow(kkey).as_ref() {
            Some(stack) => stack.is_intact(),
            None => true,
        }
    }

    pub(crate) fn note_switched_in(&self, _kkey: KernelLockKey<'_>) {
        #[cfg(feature = "statistics-context-switches")]
        self.context_switches.update(_kkey, |count| count.wrapping_add(1));
        #[cfg(feature = "statistics-cpu-cycles")]
        self.switched_in_at.set(_kkey, hal::clock_ticks());
    }

    pub(crate) fn note_switched_out(&self, _kkey: KernelLockKey<'_>) {
        #[cfg(feature = "statistics-cpu-cycles")]
        {
            let elapsed = hal::clock_ticks().saturating_sub(self.switched_in_at.get(_kkey));
            self.cpu_cycles.update(_kkey, |cycles| cycles.wrapping_add(elapsed));
        }
    }

    #[cfg(feature = "statistics-context-switches")]
    pub(crate) fn context_switch_count(&self, kkey: KernelLockKey<'_>) -> u32 {
        self.context_switches.get(kkey)
    }

    /// Recompute the dynamic priority from the base priority and the
    /// owned mutexes, and move the thread within whatever queue it sits
    /// in when the value changed.
    pub(crate) fn recompute_priority(&self, kkey: KernelLockKey<'_>) {
        let mut priority = self.base_priority.get(kkey);
        for mutex in self.owned_mutexes.borrow(kkey).iter() {
            priority = priority.max(mutex.boost(kkey));
        }

        if priority == self.dyn_priority.get(kkey) {
            return;
        }
        self.dyn_priority.set(kkey, priority);

        match self.state.get(kkey) {
            ThreadState::Ready | ThreadState::Running => {
                scheduler::requeue_after_priority_change(kkey, self);
            }
            ThreadState::Blocked => {
                self.waiter.reposition(kkey);
            }
            _ => (),
        }
    }

    pub(crate) fn register(&'static self, kkey: KernelLockKey<'_>) {
        super::registry(kkey).push_back(self);
    }

    pub(crate) fn unlink_from_parent(&self, _kkey: KernelLockKey<'_>) {
        self.child_link.unlink();
    }

    // Per-thread event flags. Only the owning thread waits on them;
    // anyone, including the alarm path, may raise.

    pub(crate) fn wait_flags_inner(
        &'static self,
        expected: u32,
        mode: FlagsMode,
        clear: bool,
        deadline: Option<Instant>,
        try_only: bool,
    ) -> Result<u32> {
        if expected == 0 || expected & RESERVED_FLAGS != 0 {
            return Err(Error::Inval);
        }
        KernelLock::with(|kkey| loop {
            let mask = self.flags.get(kkey);
            if let Some(matched) = flags_match(mask, expected, mode) {
                if clear {
                    self.flags.set(kkey, mask & !matched);
                }
                return Ok(matched);
            }
            if try_only {
                return Err(Error::WouldBlock);
            }

            self.flag_wait.set(
                kkey,
                Some(FlagsSpec {
                    expected,
                    match_all: mode == FlagsMode::All,
                    clear,
                }),
            );
            let reason = scheduler::block_current(kkey, None, deadline, ThreadState::Blocked);
            self.flag_wait.set(kkey, None);

            match reason {
                WakeReason::Transfer => return Ok(self.waiter.flags_result()),
                WakeReason::Timeout => return Err(Error::TimedOut),
                WakeReason::Interrupted => return Err(Error::Interrupted),
                WakeReason::Notify | WakeReason::Pending => continue,
            }
        })
    }

    pub(crate) fn raise_flags_inner(&self, bits: u32) -> Result<u32> {
        if bits == 0 || bits & RESERVED_FLAGS != 0 {
            return Err(Error::Inval);
        }
        KernelLock::with(|kkey| {
            let mut mask = self.flags.update(kkey, |mask| mask | bits);

            if self.state.get(kkey) == ThreadState::Blocked {
                if let Some(spec) = self.flag_wait.get(kkey) {
                    let mode = if spec.match_all {
                        FlagsMode::All
                    } else {
                        FlagsMode::Any
                    };
                    if let Some(matched) = flags_match(mask, spec.expected, mode) {
                        if spec.clear {
                            mask &= !matched;
                            self.flags.set(kkey, mask);
                        }
                        self.waiter.set_flags_result(matched);
                        self.waiter.unlink_all(kkey);
                        self.waiter.set_reason(WakeReason::Transfer);
                        scheduler::ready_thread(kkey, self);
                    }
                }
            }

            scheduler::reschedule(kkey);
            Ok(mask)
        })
    }

    /// Propagate a priority change into the mutex this thread is blocked
    /// on, bounded by the inheritance depth cap.
    pub(crate) fn propagate_blocked_priority(&self, kkey: KernelLockKey<'_>) {
        if let Some(mutex) = self.blocked_on.get(kkey) {
            unsafe { mutex.as_ref() }.refresh_inherit_boost(kkey, 0);
        }
    }

    pub(crate) fn cleanup_after_death(&'static self, kkey: KernelLockKey<'_>, value: *mut ()) {
        self.exit_value.set(kkey, value);

        // Hand every owned mutex its owner's obituary. The pop empties
        // the owned list as we go.
        loop {
            let mutex = self.owned_mutexes.borrow_mut(kkey).pop_front();
            match mutex {
                Some(mutex) => mutex.on_owner_death(kkey, self),
                None => break,
            }
        }

        self.unlink_from_parent(kkey);
        self.recompute_priority(kkey);
        self.state.set(kkey, ThreadState::Terminated);
        self.joiners.wake_all(kkey, WakeReason::Notify);
    }
}
