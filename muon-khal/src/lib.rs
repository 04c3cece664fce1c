//! Kernel Hardware Abstraction Layer (KHAL) for the muon kernel.
//!
//! The kernel is portable over a small set of hooks that a port crate
//! implements for its platform:
//!
//! - [`AlarmClockController`]: a monotonic tick counter and a one-shot
//!   alarm that calls back into the kernel when it fires.
//! - [`FlowController`]: thread context creation and switching, interrupt
//!   masking, handler-mode detection, idle/abort/exit, and the console sink.
//! - [`ContextInfo`]: the port-defined per-thread context record.
//! - [`KernelHal`]: the umbrella trait a port implements on its HAL type.
//!
//! The port calls back into the kernel through [`callbacks`]: the kernel
//! registers its alarm handler (run when the alarm fires, in handler
//! mode) and its thread-return handler (run when a thread entry function
//! returns) before port initialization; ports invoke them through the
//! accessors in that module.
//!
//! # Interrupt masking contract
//!
//! `irq_mask` returns a cookie describing the previous mask state and
//! leaves interrupts masked; `irq_restore` takes that cookie back. Nesting
//! is therefore free: inner sections restore to "still masked". The alarm
//! callback always runs with interrupts masked, and the port must not
//! deliver it while a mask is held; delivery is deferred to the matching
//! `irq_restore`.
//!
//! # Context switching contract
//!
//! `switch_context(from, to)` is called with interrupts masked, with
//! `from` being the context of the caller. It returns when `from` is next
//! scheduled. The kernel has finished all of its bookkeeping before the
//! call, so a port may perform the physical switch immediately (the
//! simulator does) or pend it to an exception return (a Cortex-M port
//! would); either way, no kernel state may be touched in between.

#![no_std]

pub use aligned::{Aligned, Alignment, A16, A4, A8};

/// Native clock ticks. The tick length is `1 / TICK_FREQ_HZ` seconds.
pub type Ticks = u64;

/// Per-thread context record defined by the port.
///
/// On embedded targets this is the saved register frame; on the simulator
/// it is a parked OS thread.
pub trait ContextInfo {
    /// Initialize the context for a thread that has never run.
    ///
    /// `entry` is the thread entry function (`fn(*mut ())` behind a thin
    /// pointer), `argument` its argument. `stack_base` is the lowest
    /// address of the usable stack area and `stack_size` its length in
    /// bytes. The port arranges for `entry(argument)` to run when the
    /// context is first switched to, and for
    /// [`KernelCallbacks::kernel_thread_return`] to run if it returns.
    unsafe fn init(
        name: &'static str,
        entry: *const (),
        argument: *mut (),
        stack_base: *const u8,
        stack_size: usize,
        context: *mut Self,
    );
}

/// The alarm clock device: a monotonic counter plus a one-shot wakeup.
pub trait AlarmClockController: Sync {
    /// Tick frequency in ticks per second.
    const TICK_FREQ_HZ: Ticks;

    /// Monotonic tick count since an arbitrary epoch. Never decreases.
    fn clock_ticks(&self) -> Ticks;

    /// Program the alarm to fire at the given absolute tick, or disable
    /// it with `None`. A new call replaces any previous programming.
    /// When the alarm fires the port invokes
    /// [`KernelCallbacks::kernel_alarm_handler`] in handler mode with
    /// interrupts masked.
    fn set_alarm(&self, at: Option<Ticks>);

    /// Start the clock and alarm machinery. Called once during kernel
    /// startup, before the first thread runs.
    fn start_clock(&self);
}

/// Execution flow control: switching, masking, and process-level exits.
pub trait FlowController: Sync {
    /// Alignment required for thread stacks.
    type StackAlignment: Alignment;
    type Context: ContextInfo;

    /// Begin multithreaded execution by switching into `first`.
    /// Never returns; the caller's context is abandoned.
    fn start_first_thread(first: *mut Self::Context) -> !;

    /// Switch execution from `from` (the caller) to `to`. Returns when
    /// `from` is scheduled again. Must be called with interrupts masked.
    unsafe fn switch_context(from: *mut Self::Context, to: *mut Self::Context);

    /// Mask interrupts, returning the previous state as a cookie.
    fn irq_mask() -> bool;

    /// Restore the interrupt mask state captured by [`Self::irq_mask`].
    fn irq_restore(cookie: bool);

    /// True while executing in an exception/interrupt handler rather than
    /// a thread.
    fn in_handler_mode() -> bool;

    /// Called by the idle thread on every loop iteration.
    fn on_idle();

    /// Unrecoverable kernel fault. Does not return.
    fn on_abort() -> !;

    /// Terminate the whole system with an exit code (simulator and test
    /// environments; embedded ports typically spin or reset).
    fn on_exit(code: i32) -> !;

    /// Byte sink for kernel console output.
    fn console_write(bytes: &[u8]);
}

/// The umbrella trait a port implements on its HAL type.
pub trait KernelHal: AlarmClockController + FlowController + Sync {
    const NAME: &'static str;

    /// One-time hardware setup, called before any other hook.
    unsafe fn init(hal: *mut Self)
    where
        Self: Sized;
}

/// Entry points into the kernel.
///
/// The kernel registers these once during startup, before the port is
/// initialized; ports deliver events through the accessors.
pub mod callbacks {
    use core::cell::UnsafeCell;

    #[derive(Copy, Clone)]
    pub struct KernelCallbacks {
        /// The alarm fired. Invoked in handler mode with interrupts
        /// masked; the kernel may switch contexts before this returns.
        pub alarm_handler: fn(),
        /// A thread entry function returned. Invoked in that thread's
        /// context; never returns.
        pub thread_return: fn() -> !,
    }

    struct Registry(UnsafeCell<Option<KernelCallbacks>>);

    // Written once before the first thread or interrupt can run.
    unsafe impl Sync for Registry {}

    static REGISTRY: Registry = Registry(UnsafeCell::new(None));

    /// Install the kernel entry points. Startup-time only.
    pub fn register(callbacks: KernelCallbacks) {
        unsafe {
            *REGISTRY.0.get() = Some(callbacks);
        }
    }

    fn installed() -> KernelCallbacks {
        unsafe { *REGISTRY.0.get() }.expect("kernel callbacks not registered")
    }

    /// Deliver an alarm expiry to the kernel.
    pub fn alarm_handler() {
        (installed().alarm_handler)()
    }

    /// Deliver a thread-entry return to the kernel.
    pub fn thread_return() -> ! {
        (installed().thread_return)()
    }
}
