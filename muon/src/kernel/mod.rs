//! Kernel internals: scheduler, clocks, waiter infrastructure, and the
//! port access layer.

pub mod clock;
pub mod fault;
pub(crate) mod hal;
pub(crate) mod idle;
pub mod klock;
pub(crate) mod list;
pub mod priority;
pub mod printk;
pub mod scheduler;
pub mod stack;
pub(crate) mod waiter;

pub use klock::{KernelLock, KernelLockKey};
pub use priority::Priority;

/// True while the CPU is executing an exception/interrupt handler.
pub use hal::in_handler_mode;

/// Initialize the port, install the idle thread, and switch into the
/// highest-priority thread made ready before this call. Never returns.
pub fn start() -> ! {
    muon_khal::callbacks::register(muon_khal::callbacks::KernelCallbacks {
        alarm_handler: clock::alarm_handler,
        thread_return: crate::thread::thread_return,
    });
    unsafe {
        hal::init_hal();
    }
    let idle = idle::init_idle_thread();
    scheduler::start_with_idle(idle)
}
