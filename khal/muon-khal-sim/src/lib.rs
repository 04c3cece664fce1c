//! Hosted simulator port for the muon kernel.
//!
//! Kernel threads are POSIX threads that are parked on a private
//! condition variable whenever their context is switched out; at most one
//! of them executes at a time, which preserves the kernel's single-CPU
//! model. The alarm device is a helper thread that delivers `SIGALRM` to
//! the pthread backing the *current* kernel thread; the signal handler
//! then runs the kernel alarm callback on that thread's stack, exactly
//! like a timer interrupt preempting the running thread. Masking
//! interrupts maps to blocking `SIGALRM` on the calling pthread plus a
//! process-wide enable flag.
//!
//! Thread stacks are provided by pthreads; the kernel-supplied stack area
//! is recorded but not installed, so stack canaries stay intact on the
//! host. This keeps the port independent of page-alignment rules for
//! `pthread_attr_setstack`.

extern crate std;

use core::cell::{Cell, UnsafeCell};
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use muon_khal::*;

/// Delivered to the current kernel thread when the alarm expires.
const ALARM_SIGNAL: libc::c_int = libc::SIGALRM;

/// Clock backing both `clock_ticks` and the alarm timeouts.
const SIMULATOR_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

/// One tick per microsecond.
pub const TICK_FREQ_HZ: Ticks = 1_000_000;

/// Minimum pthread stack actually requested, regardless of the kernel
/// stack size. Host threads need far more room than MCU threads.
const HOST_STACK_MIN: usize = 128 * 1024;

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(false);
static IN_HANDLER: AtomicBool = AtomicBool::new(false);

static CURRENT_CONTEXT: AtomicPtr<VirtualContext> = AtomicPtr::new(core::ptr::null_mut());

/// A kernel thread context: a parked pthread.
///
/// `resumed` together with `suspension`/`suspension_lock` forms a binary
/// handoff semaphore: `resume` may run before the target has parked.
pub struct VirtualContext {
    resumed: UnsafeCell<bool>,
    suspension: UnsafeCell<libc::pthread_cond_t>,
    suspension_lock: UnsafeCell<libc::pthread_mutex_t>,

    pub name: &'static str,
    pub thread_id: libc::pthread_t,
    entry: *const (),
    argument: *mut (),

    stack_base: Cell<*const u8>,
    stack_size: Cell<usize>,
}

unsafe impl Sync for VirtualContext {}
unsafe impl Send for VirtualContext {}

impl VirtualContext {
    /// The kernel-assigned stack area. Unused for execution on the host
    /// (pthreads bring their own stacks) but kept for diagnostics.
    pub fn stack_area(&self) -> (*const u8, usize) {
        (self.stack_base.get(), self.stack_size.get())
    }

    unsafe fn is_resumed(&self) -> bool {
        unsafe { *self.resumed.get() }
    }

    unsafe fn set_resumed(&self, state: bool) {
        unsafe {
            *self.resumed.get() = state;
        }
    }

    fn suspend(&self) {
        unsafe {
            if libc::pthread_mutex_lock(self.suspension_lock.get()) != 0 {
                libc::abort();
            }

            while !self.is_resumed() {
                if libc::pthread_cond_wait(self.suspension.get(), self.suspension_lock.get()) != 0 {
                    libc::abort();
                }
            }
            self.set_resumed(false);

            if libc::pthread_mutex_unlock(self.suspension_lock.get()) != 0 {
                libc::abort();
            }
        }
    }

    fn resume(&self) {
        unsafe {
            libc::pthread_mutex_lock(self.suspension_lock.get());
            if libc::pthread_self() != self.thread_id {
                self.set_resumed(true);
                libc::pthread_cond_signal(self.suspension.get());
            }
            libc::pthread_mutex_unlock(self.suspension_lock.get());
        }
    }
}

impl ContextInfo for VirtualContext {
    unsafe fn init(
        name: &'static str,
        entry: *const (),
        argument: *mut (),
        stack_base: *const u8,
        stack_size: usize,
        context: *mut Self,
    ) {
        let mut attr = MaybeUninit::uninit();

        unsafe {
            if libc::pthread_attr_init(attr.as_mut_ptr()) != 0
                || libc::pthread_attr_setstacksize(
                    attr.as_mut_ptr(),
                    stack_size.max(HOST_STACK_MIN),
                ) != 0
            {
                libc::abort();
            }

            // Fill the context with `thread_id` last; the new pthread
            // parks in the trampoline until its first resume, so the
            // other fields are published before it can look at them.
            (*context).name = name;
            (*context).resumed = UnsafeCell::new(false);
            (*context).suspension = UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER);
            (*context).suspension_lock = UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER);
            (*context).entry = entry;
            (*context).argument = argument;
            (*context).stack_base.set(stack_base);
            (*context).stack_size.set(stack_size);

            libc::pthread_create(
                core::ptr::addr_of_mut!((*context).thread_id),
                attr.as_ptr(),
                thread_trampoline,
                context as *mut _,
            );

            libc::pthread_attr_destroy(attr.as_mut_ptr());
        }
    }
}

/// Every kernel thread starts here. The pthread parks until the kernel
/// first switches to this context, then unmasks interrupts and runs the
/// entry function.
extern "C" fn thread_trampoline(arg: *mut libc::c_void) -> *mut libc::c_void {
    let context = unsafe { &*(arg as *const VirtualContext) };

    context.suspend();

    INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
    unsafe {
        let mut set = MaybeUninit::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), ALARM_SIGNAL);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, set.as_mut_ptr(), core::ptr::null_mut());
    }

    let entry: fn(*mut ()) = unsafe { core::mem::transmute(context.entry) };
    entry(context.argument);

    muon_khal::callbacks::thread_return()
}

extern "C" fn alarm_signal_handler(_sig: libc::c_int) {
    // The handler only runs while interrupts are logically enabled; save
    // and clear the flag like a CPU entering an exception would.
    let saved = INTERRUPTS_ENABLED.swap(false, Ordering::SeqCst);
    IN_HANDLER.store(true, Ordering::SeqCst);

    muon_khal::callbacks::alarm_handler();

    // If the kernel preempted, we only get here once this pthread is
    // scheduled again; the handler-mode flag was already cleared at the
    // switch.
    IN_HANDLER.store(false, Ordering::SeqCst);
    INTERRUPTS_ENABLED.store(saved, Ordering::SeqCst);
}

/// The alarm device: waits for the programmed deadline and then delivers
/// the alarm signal to the current kernel thread.
///
/// The deadline is not cleared when it fires; the kernel alarm handler
/// reprograms or disables the alarm, and until it does the device
/// re-delivers on a short grace period. This makes a signal that lands on
/// a thread parked with interrupts masked harmless: the deadline is
/// served on the next delivery.
struct VirtualAlarm {
    wait: UnsafeCell<libc::pthread_cond_t>,
    wait_lock: UnsafeCell<libc::pthread_mutex_t>,
    wait_until: UnsafeCell<Option<Ticks>>,
    thread_id: UnsafeCell<libc::pthread_t>,
}

unsafe impl Sync for VirtualAlarm {}

const REDELIVER_GRACE_TICKS: Ticks = TICK_FREQ_HZ / 1_000; // 1 ms

impl VirtualAlarm {
    unsafe fn init(alarm: *mut Self) {
        unsafe {
            let sigaction = libc::sigaction {
                sa_sigaction: alarm_signal_handler as libc::sighandler_t,
                sa_mask: empty_sigset(),
                sa_flags: 0,
                sa_restorer: None,
            };
            if libc::sigaction(ALARM_SIGNAL, &sigaction, core::ptr::null_mut()) != 0 {
                libc::abort();
            }

            let mut cond_attr = MaybeUninit::uninit();
            libc::pthread_condattr_init(cond_attr.as_mut_ptr());
            libc::pthread_condattr_setclock(cond_attr.as_mut_ptr(), SIMULATOR_CLOCK);
            libc::pthread_cond_init((*alarm).wait.get(), cond_attr.as_ptr());
            libc::pthread_condattr_destroy(cond_attr.as_mut_ptr());
            (*alarm).wait_lock = UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER);
            (*alarm).wait_until = UnsafeCell::new(None);

            let mut attr = MaybeUninit::uninit();
            libc::pthread_attr_init(attr.as_mut_ptr());
            libc::pthread_create(
                (*alarm).thread_id.get(),
                attr.as_ptr(),
                alarm_thread,
                alarm as *mut libc::c_void,
            );
            libc::pthread_attr_destroy(attr.as_mut_ptr());
        }
    }

    fn set(&self, at: Option<Ticks>) {
        unsafe {
            libc::pthread_mutex_lock(self.wait_lock.get());
            *self.wait_until.get() = at;
            libc::pthread_cond_signal(self.wait.get());
            libc::pthread_mutex_unlock(self.wait_lock.get());
        }
    }
}

fn empty_sigset() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

fn now_ticks() -> Ticks {
    let mut time = MaybeUninit::uninit();
    if unsafe { libc::clock_gettime(SIMULATOR_CLOCK, time.as_mut_ptr()) } != 0 {
        unsafe { libc::abort() };
    }
    let time = unsafe { time.assume_init() };
    timespec_to_ticks(time)
}

fn timespec_to_ticks(time: libc::timespec) -> Ticks {
    (time.tv_sec as Ticks) * TICK_FREQ_HZ
        + (time.tv_nsec as Ticks) * TICK_FREQ_HZ / 1_000_000_000
}

fn ticks_to_timespec(ticks: Ticks) -> libc::timespec {
    libc::timespec {
        tv_sec: (ticks / TICK_FREQ_HZ) as i64,
        tv_nsec: ((ticks % TICK_FREQ_HZ) * (1_000_000_000 / TICK_FREQ_HZ)) as i64,
    }
}

extern "C" fn alarm_thread(arg: *mut libc::c_void) -> *mut libc::c_void {
    let alarm = unsafe { &*(arg as *const VirtualAlarm) };

    // The device thread itself never takes the alarm signal.
    unsafe {
        let mut set = MaybeUninit::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), ALARM_SIGNAL);
        libc::pthread_sigmask(libc::SIG_BLOCK, set.as_mut_ptr(), core::ptr::null_mut());
    }

    unsafe {
        libc::pthread_mutex_lock(alarm.wait_lock.get());

        loop {
            match *alarm.wait_until.get() {
                Some(at) if now_ticks() >= at => {
                    let context = CURRENT_CONTEXT.load(Ordering::SeqCst);
                    if !context.is_null() {
                        libc::pthread_sigqueue((*context).thread_id, ALARM_SIGNAL, libc::sigval {
                            sival_ptr: core::ptr::null_mut(),
                        });
                    }
                    // Re-deliver until the kernel reprograms the alarm.
                    let recheck = ticks_to_timespec(now_ticks() + REDELIVER_GRACE_TICKS);
                    libc::pthread_cond_timedwait(alarm.wait.get(), alarm.wait_lock.get(), &recheck);
                }
                Some(at) => {
                    let deadline = ticks_to_timespec(at);
                    libc::pthread_cond_timedwait(
                        alarm.wait.get(),
                        alarm.wait_lock.get(),
                        &deadline,
                    );
                }
                None => {
                    libc::pthread_cond_wait(alarm.wait.get(), alarm.wait_lock.get());
                }
            }
        }
    }
}

pub type Hal = Simulator;

pub struct Simulator {
    alarm: VirtualAlarm,
}

unsafe impl Sync for Simulator {}

impl AlarmClockController for Simulator {
    const TICK_FREQ_HZ: Ticks = TICK_FREQ_HZ;

    fn clock_ticks(&self) -> Ticks {
        now_ticks()
    }

    fn set_alarm(&self, at: Option<Ticks>) {
        self.alarm.set(at);
    }

    fn start_clock(&self) {
        // The alarm device thread is started in `init`; nothing to do.
    }
}

impl FlowController for Simulator {
    type StackAlignment = A16;
    type Context = VirtualContext;

    fn start_first_thread(first: *mut Self::Context) -> ! {
        // Keep the alarm signal away from the primordial thread; only the
        // current kernel thread should ever handle it.
        unsafe {
            let mut set = MaybeUninit::uninit();
            libc::sigemptyset(set.as_mut_ptr());
            libc::sigaddset(set.as_mut_ptr(), ALARM_SIGNAL);
            libc::pthread_sigmask(libc::SIG_BLOCK, set.as_mut_ptr(), core::ptr::null_mut());
        }

        CURRENT_CONTEXT.store(first, Ordering::SeqCst);
        unsafe { &*first }.resume();

        loop {
            unsafe {
                libc::pause();
            }
        }
    }

    unsafe fn switch_context(from: *mut Self::Context, to: *mut Self::Context) {
        if from == to {
            return;
        }

        CURRENT_CONTEXT.store(to, Ordering::SeqCst);

        // A switch out of the alarm handler resumes a thread that was not
        // interrupted; it must not observe handler mode.
        IN_HANDLER.store(false, Ordering::SeqCst);

        let to = unsafe { &*to };
        let from = unsafe { &*from };
        to.resume();
        from.suspend();
    }

    fn irq_mask() -> bool {
        let was_enabled = INTERRUPTS_ENABLED.swap(false, Ordering::SeqCst);
        if was_enabled {
            unsafe {
                let mut set = MaybeUninit::uninit();
                libc::sigemptyset(set.as_mut_ptr());
                libc::sigaddset(set.as_mut_ptr(), ALARM_SIGNAL);
                libc::pthread_sigmask(libc::SIG_BLOCK, set.as_mut_ptr(), core::ptr::null_mut());
            }
        }
        was_enabled
    }

    fn irq_restore(cookie: bool) {
        if cookie {
            INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
            unsafe {
                let mut set = MaybeUninit::uninit();
                libc::sigemptyset(set.as_mut_ptr());
                libc::sigaddset(set.as_mut_ptr(), ALARM_SIGNAL);
                libc::pthread_sigmask(
                    libc::SIG_UNBLOCK,
                    set.as_mut_ptr(),
                    core::ptr::null_mut(),
                );
            }
        }
    }

    fn in_handler_mode() -> bool {
        IN_HANDLER.load(Ordering::SeqCst)
    }

    fn on_idle() {
        unsafe {
            libc::sched_yield();
        }
    }

    fn on_abort() -> ! {
        unsafe {
            libc::abort();
        }
    }

    fn on_exit(code: i32) -> ! {
        unsafe {
            libc::exit(code);
        }
    }

    fn console_write(bytes: &[u8]) {
        let mut written = 0;
        while written < bytes.len() {
            let n = unsafe {
                libc::write(
                    libc::STDOUT_FILENO,
                    bytes[written..].as_ptr() as *const libc::c_void,
                    bytes.len() - written,
                )
            };
            if n <= 0 {
                break;
            }
            written += n as usize;
        }
    }
}

impl KernelHal for Simulator {
    const NAME: &'static str = "simulator";

    unsafe fn init(hal: *mut Self) {
        unsafe {
            VirtualAlarm::init(core::ptr::addr_of_mut!((*hal).alarm));
        }
    }
}
