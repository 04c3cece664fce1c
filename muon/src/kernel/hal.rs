//! Thin access layer over the selected port.
//!
//! Exactly one port crate is linked in; its HAL type is aliased here and
//! every hardware touch point in the kernel goes through these functions.

use crate::cell::RacyCell;
use core::mem::MaybeUninit;
use muon_khal::{AlarmClockController, FlowController, KernelHal, Ticks};

#[cfg(feature = "khal-sim")]
pub(crate) use muon_khal_sim as port;

#[cfg(not(feature = "khal-sim"))]
compile_error!("no port selected: enable the `khal-sim` feature or link a port crate");

pub type Context = <port::Hal as FlowController>::Context;
pub type StackAlignment = <port::Hal as FlowController>::StackAlignment;

pub const TICK_FREQ_HZ: Ticks = <port::Hal as AlarmClockController>::TICK_FREQ_HZ;

static HAL: RacyCell<MaybeUninit<port::Hal>> = RacyCell::new(MaybeUninit::uninit());

/// One-time port initialization, called from `kernel::start` before the
/// first thread runs.
pub(crate) unsafe fn init_hal() {
    unsafe {
        <port::Hal as KernelHal>::init((*HAL.get()).as_mut_ptr());
    }
}

fn instance() -> &'static port::Hal {
    // Initialized in `kernel::start`; the timer and alarm accessors are
    // not meaningful before that.
    unsafe { (*HAL.get()).assume_init_ref() }
}

#[inline(always)]
pub fn clock_ticks() -> Ticks {
    instance().clock_ticks()
}

#[inline(always)]
pub(crate) fn set_alarm(at: Option<Ticks>) {
    instance().set_alarm(at)
}

#[inline(always)]
pub(crate) fn start_clock() {
    instance().start_clock()
}

#[inline(always)]
pub(crate) fn irq_mask() -> bool {
    <port::Hal as FlowController>::irq_mask()
}

#[inline(always)]
pub(crate) fn irq_restore(cookie: bool) {
    <port::Hal as FlowController>::irq_restore(cookie)
}

/// True while the CPU is executing an exception/interrupt handler.
#[inline(always)]
pub fn in_handler_mode() -> bool {
    <port::Hal as FlowController>::in_handler_mode()
}

#[inline(always)]
pub(crate) unsafe fn switch_context(from: *mut Context, to: *mut Context) {
    unsafe { <port::Hal as FlowController>::switch_context(from, to) }
}

#[inline(always)]
pub(crate) fn start_first_thread(first: *mut Context) -> ! {
    <port::Hal as FlowController>::start_first_thread(first)
}

#[inline(always)]
pub(crate) fn on_idle() {
    <port::Hal as FlowController>::on_idle()
}

#[inline(always)]
pub fn abort() -> ! {
    <port::Hal as FlowController>::on_abort()
}

#[inline(always)]
pub(crate) fn console_write(bytes: &[u8]) {
    <port::Hal as FlowController>::console_write(bytes)
}
