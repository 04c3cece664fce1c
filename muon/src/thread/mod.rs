//! Threads.
//!
//! A thread is created with [`make_thread!`], which allocates the control
//! block and a canary-stamped stack in statics, and started with
//! [`Thread::start`]. Entry functions have the shape `fn(*mut ())`;
//! a thread terminates by returning from its entry function or by
//! calling [`exit`].
//!
//! ```ignore
//! fn worker_entry(_: *mut ()) {
//!     // ...
//! }
//!
//! let worker = muon::make_thread!("worker", 5, 4096);
//! worker.start(worker_entry, core::ptr::null_mut())?;
//! let value = worker.join()?;
//! ```

mod raw_thread;

pub(crate) use raw_thread::RawThread;

use crate::cell::LockedRefCell;
use crate::error::{Error, Result};
use crate::kernel::hal;
use crate::kernel::klock::{KernelLock, KernelLockKey};
use crate::kernel::list::{List, ListTag};
use crate::kernel::priority::Priority;
use crate::kernel::scheduler;
use crate::kernel::stack::StackRef;
use crate::kernel::waiter::WakeReason;
use crate::printkln;
use crate::sync::event_flags::FlagsMode;
use crate::time::Instant;
use core::cell::RefMut;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use static_cell::ConstStaticCell;

pub(crate) struct RegistryTag {}
impl ListTag for RegistryTag {}

pub(crate) struct ChildTag {}
impl ListTag for ChildTag {}

/// Thread lifecycle states.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ThreadState {
    /// Control block exists, thread has not been started.
    Created,
    /// Runnable, queued behind higher or equal priorities.
    Ready,
    /// Currently executing. Exactly one thread at a time.
    Running,
    /// Waiting on a primitive or on the clock.
    Blocked,
    /// Parked until explicitly resumed.
    Suspended,
    /// Finished; join reads the exit value.
    Terminated,
}

static REGISTRY: LockedRefCell<List<RawThread, RegistryTag>, KernelLock> =
    LockedRefCell::new(List::new());

pub(crate) fn registry(kkey: KernelLockKey<'_>) -> RefMut<'_, List<RawThread, RegistryTag>> {
    REGISTRY.borrow_mut(kkey)
}

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

/// Create a thread with a static control block and stack.
///
/// `make_thread!(name, priority, stack_size)`; the stack size defaults to
/// the build-time `MUON_STACK_DEFAULT_SIZE` when omitted. Each expansion
/// may run only once.
#[macro_export]
macro_rules! make_thread {
    ($name:expr, $prio:expr) => {
        $crate::make_thread!($name, $prio, { $crate::config::STACK_DEFAULT_SIZE })
    };
    ($name:expr, $prio:expr, $stack_size:expr) => {{
        static STACK: $crate::Stack<{ $stack_size }> = $crate::Stack::new();
        static THREAD: $crate::thread::ThreadCell = $crate::thread::ThreadCell::new($name, $prio);
        THREAD.init(STACK.init())
    }};
}

/// Statically allocated, take-once thread control block.
pub struct ThreadCell {
    cell: ConstStaticCell<RawThread>,
}

impl ThreadCell {
    pub const fn new(name: &'static str, priority: u8) -> ThreadCell {
        ThreadCell {
            cell: ConstStaticCell::new(RawThread::new(name, Priority::new(priority))),
        }
    }

    /// Bind the stack and hand out the thread handle. Panics when taken
    /// twice.
    pub fn init(&'static self, stack: StackRef) -> Thread {
        let raw: &'static mut RawThread = self.cell.take();
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        raw.waiter.bind(&*raw as *const RawThread);
        *raw.id.get_mut() = id;
        *raw.stack.get_mut() = Some(stack);
        Thread { raw: &*raw }
    }
}

/// A handle to a thread. Cheap to copy; the control block is static.
#[derive(Copy, Clone)]
pub struct Thread {
    raw: &'static RawThread,
}

impl Thread {
    pub fn name(&self) -> &'static str {
        self.raw.name
    }

    pub fn id(&self) -> u32 {
        KernelLock::with(|kkey| self.raw.id.get(kkey))
    }

    pub fn state(&self) -> ThreadState {
        KernelLock::with(|kkey| self.raw.state.get(kkey))
    }

    pub fn priority(&self) -> Priority {
        KernelLock::with(|kkey| self.raw.dyn_priority(kkey))
    }

    pub fn base_priority(&self) -> Priority {
        KernelLock::with(|kkey| self.raw.base_priority.get(kkey))
    }

    pub(crate) fn raw(&self) -> &'static RawThread {
        self.raw
    }

    /// Start the thread: initialize its context and enter it into the
    /// ready set, preempting the caller if it outranks it.
    pub fn start(&self, entry: fn(*mut ()), arg: *mut ()) -> Result<()> {
        KernelLock::with(|kkey| {
            if self.raw.state.get(kkey) != ThreadState::Created {
                return Err(Error::Inval);
            }
            if !self.raw.base_priority.get(kkey).is_valid_thread_priority() {
                return Err(Error::Inval);
            }

            self.raw.init_context(kkey, entry, arg);
            self.raw.register(kkey);

            if let Some(parent) = scheduler::try_current(kkey) {
                self.raw.parent.set(kkey, Some(NonNull::from(parent)));
                parent.children.borrow_mut(kkey).push_back(self.raw);
            }

            scheduler::ready_thread(kkey, self.raw);
            scheduler::reschedule(kkey);
            Ok(())
        })
    }

    /// Block until the thread terminates and return its exit value.
    pub fn join(&self) -> Result<*mut ()> {
        if hal::in_handler_mode() {
            return Err(Error::Perm);
        }
        KernelLock::with(|kkey| {
            if core::ptr::eq(scheduler::current_thread(kkey), self.raw) {
                return Err(Error::Deadlock);
            }
            match self.raw.state.get(kkey) {
                ThreadState::Created => return Err(Error::Inval),
                _ => (),
            }
            if self.raw.detached.get(kkey) {
                return Err(Error::Inval);
            }

            loop {
                if self.raw.state.get(kkey) == ThreadState::Terminated {
                    return Ok(self.raw.exit_value.get(kkey));
                }
                let reason = scheduler::block_current(
                    kkey,
                    Some(&self.raw.joiners),
                    None,
                    ThreadState::Blocked,
                );
                match reason {
                    WakeReason::Interrupted => return Err(Error::Interrupted),
                    _ => continue,
                }
            }
        })
    }

    /// Give up the right to join; the thread cleans itself up on exit.
    pub fn detach(&self) -> Result<()> {
        KernelLock::with(|kkey| {
            self.raw.detached.set(kkey, true);
            Ok(())
        })
    }

    /// Make a suspended thread ready again; a thread blocked in a wait
    /// has the wait cancelled and sees it end with `Interrupted`.
    pub fn resume(&self) -> Result<()> {
        KernelLock::with(|kkey| {
            match self.raw.state.get(kkey) {
                ThreadState::Suspended => {
                    self.raw.waiter.set_reason(WakeReason::Notify);
                    scheduler::ready_thread(kkey, self.raw);
                }
                ThreadState::Blocked => {
                    self.raw.waiter.unlink_all(kkey);
                    self.raw.propagate_blocked_priority(kkey);
                    self.raw.waiter.set_reason(WakeReason::Interrupted);
                    scheduler::ready_thread(kkey, self.raw);
                }
                _ => (),
            }
            scheduler::reschedule(kkey);
            Ok(())
        })
    }

    /// Cancel whatever wait the thread is in; the wait returns
    /// `Interrupted`.
    pub fn interrupt(&self) -> Result<()> {
        KernelLock::with(|kkey| {
            match self.raw.state.get(kkey) {
                ThreadState::Blocked | ThreadState::Suspended => {
                    self.raw.waiter.unlink_all(kkey);
                    self.raw.propagate_blocked_priority(kkey);
                    self.raw.waiter.set_reason(WakeReason::Interrupted);
                    scheduler::ready_thread(kkey, self.raw);
                }
                _ => (),
            }
            scheduler::reschedule(kkey);
            Ok(())
        })
    }

    /// Forcibly terminate the thread. Owned robust mutexes are released
    /// as inconsistent; joiners are woken.
    pub fn kill(&self) -> Result<()> {
        if hal::in_handler_mode() {
            return Err(Error::Perm);
        }

        let is_self = KernelLock::with(|kkey| {
            scheduler::try_current(kkey)
                .map(|current| core::ptr::eq(current, self.raw))
                .unwrap_or(false)
        });
        if is_self {
            exit(core::ptr::null_mut());
        }

        KernelLock::with(|kkey| {
            match self.raw.state.get(kkey) {
                ThreadState::Terminated => return Ok(()),
                ThreadState::Created => return Err(Error::Inval),
                ThreadState::Ready => {
                    scheduler::remove_from_ready(kkey, self.raw);
                }
                ThreadState::Blocked | ThreadState::Suspended => {
                    self.raw.waiter.unlink_all(kkey);
                    self.raw.propagate_blocked_priority(kkey);
                }
                ThreadState::Running => {
                    // Only the current thread is running, handled above.
                    return Err(Error::Inval);
                }
            }
            self.raw.cleanup_after_death(kkey, core::ptr::null_mut());
            scheduler::reschedule(kkey);
            Ok(())
        })
    }

    /// Change the base priority; the dynamic priority follows unless a
    /// held mutex keeps it boosted, and inheritance chains are updated.
    pub fn set_priority(&self, priority: Priority) -> Result<()> {
        if !priority.is_valid_thread_priority() {
            return Err(Error::Inval);
        }
        KernelLock::with(|kkey| {
            self.raw.base_priority.set(kkey, priority);
            self.raw.recompute_priority(kkey);
            self.raw.propagate_blocked_priority(kkey);
            scheduler::reschedule(kkey);
            Ok(())
        })
    }

    /// OR bits into the thread's private event flags; wakes the thread
    /// when it is blocked on a now-satisfied flag wait. Handler-safe.
    pub fn raise_flags(&self, bits: u32) -> Result<u32> {
        self.raw.raise_flags_inner(bits)
    }

    pub fn flags(&self) -> u32 {
        KernelLock::with(|kkey| self.raw.flags.get(kkey))
    }
}

/// The calling thread's handle.
pub fn current() -> Thread {
    KernelLock::with(|kkey| Thread {
        raw: scheduler::current_thread(kkey),
    })
}

/// Let equal-priority threads run; see the scheduler's tie-break rules.
pub fn yield_now() {
    scheduler::yield_now()
}

/// Park the calling thread until another thread resumes it.
pub fn suspend() -> Result<()> {
    if hal::in_handler_mode() {
        return Err(Error::Perm);
    }
    KernelLock::with(|kkey| {
        let reason = scheduler::block_current(kkey, None, None, ThreadState::Suspended);
        match reason {
            WakeReason::Interrupted => Err(Error::Interrupted),
            _ => Ok(()),
        }
    })
}

/// Terminate the calling thread, publishing `value` to joiners.
pub fn exit(value: *mut ()) -> ! {
    KernelLock::with(|kkey| {
        let current = scheduler::current_thread(kkey);
        current.cleanup_after_death(kkey, value);
        scheduler::switch_away_forever(kkey)
    })
}

/// Wait on the calling thread's private event flags.
pub fn wait_flags(expected: u32, mode: FlagsMode, clear: bool) -> Result<u32> {
    wait_flags_inner(expected, mode, clear, None, false)
}

pub fn wait_flags_until(
    expected: u32,
    mode: FlagsMode,
    clear: bool,
    deadline: Instant,
) -> Result<u32> {
    wait_flags_inner(expected, mode, clear, Some(deadline), false)
}

pub fn try_wait_flags(expected: u32, mode: FlagsMode, clear: bool) -> Result<u32> {
    wait_flags_inner(expected, mode, clear, None, true)
}

fn wait_flags_inner(
    expected: u32,
    mode: FlagsMode,
    clear: bool,
    deadline: Option<Instant>,
    try_only: bool,
) -> Result<u32> {
    if !try_only && hal::in_handler_mode() {
        return Err(Error::Perm);
    }
    let raw = KernelLock::with(|kkey| scheduler::current_thread(kkey));
    raw.wait_flags_inner(expected, mode, clear, deadline, try_only)
}

/// Port trampoline callback: a thread entry function returned.
pub(crate) fn thread_return() -> ! {
    exit(core::ptr::null_mut())
}

/// A diagnostic snapshot of one thread.
pub struct ThreadInfo {
    pub name: &'static str,
    pub id: u32,
    pub state: ThreadState,
    pub base_priority: Priority,
    pub dyn_priority: Priority,
    #[cfg(feature = "statistics-context-switches")]
    pub context_switches: u32,
}

/// Visit a snapshot of every registered thread.
pub fn for_each_thread(mut f: impl FnMut(&ThreadInfo)) {
    KernelLock::with(|kkey| {
        for thread in REGISTRY.borrow(kkey).iter() {
            let info = ThreadInfo {
                name: thread.name,
                id: thread.id.get(kkey),
                state: thread.state.get(kkey),
                base_priority: thread.base_priority.get(kkey),
                dyn_priority: thread.dyn_priority(kkey),
                #[cfg(feature = "statistics-context-switches")]
                context_switches: thread.context_switch_count(kkey),
            };
            f(&info);
        }
    })
}

pub fn print_threads() {
    printkln!("NAME             ID  PRI  STATE");
    for_each_thread(|info| {
        printkln!(
            "{:<16} {:<3} {:<4} {:?}",
            info.name,
            info.id,
            info.dyn_priority,
            info.state,
        );
    });
}
