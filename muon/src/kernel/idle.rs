use crate::kernel::klock::KernelLock;
use crate::thread::{RawThread, ThreadState};

const IDLE_THREAD_NAME: &str = "[idle]";

#[cfg(feature = "khal-sim")]
const IDLE_STACK_SIZE: usize = 16 * 1024;
#[cfg(not(feature = "khal-sim"))]
const IDLE_STACK_SIZE: usize = 1024;

fn idle_entry(_arg: *mut ()) {
    loop {
        crate::kernel::hal::on_idle();
    }
}

/// Build the idle thread. It runs at level 0, is always runnable, and is
/// never queued in the ready list.
pub(crate) fn init_idle_thread() -> &'static RawThread {
    let thread = crate::make_thread!(IDLE_THREAD_NAME, 0, IDLE_STACK_SIZE);
    let raw = thread.raw();
    KernelLock::with(|kkey| {
        raw.init_context(kkey, idle_entry, core::ptr::null_mut());
        raw.register(kkey);
        raw.state.set(kkey, ThreadState::Ready);
    });
    raw
}
