//! Event flags: a 32-bit mask threads can wait on.
//!
//! A waiter asks for a set of expected bits and a match mode; raising
//! bits scans the wait list from the head (highest priority first, FIFO
//! among equals) and satisfies every waiter whose condition now holds.
//! Earlier waiters consume before later ones, which matters when a
//! waiter asked for its bits to be cleared on wake-up.
//!
//! Threads additionally carry a private flag mask with the same
//! semantics; see [`crate::thread::wait_flags`].

use crate::cell::LockedCell;
use crate::error::{Error, Result};
use crate::kernel::hal;
use crate::kernel::klock::KernelLock;
use crate::kernel::scheduler;
use crate::kernel::waiter::{wake_detached, FlagsSpec, WaitList, WakeReason};
use crate::thread::ThreadState;
use crate::time::Instant;

/// Bits the kernel keeps for itself; bit 0 signals cancellation.
pub const RESERVED_FLAGS: u32 = 1;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FlagsMode {
    /// Wake when any expected bit is set.
    Any,
    /// Wake when all expected bits are set.
    All,
}

/// The satisfied subset for a wait, or `None` while unsatisfied.
pub(crate) fn flags_match(mask: u32, expected: u32, mode: FlagsMode) -> Option<u32> {
    match mode {
        FlagsMode::Any => {
            let matched = mask & expected;
            (matched != 0).then_some(matched)
        }
        FlagsMode::All => (mask & expected == expected).then_some(expected),
    }
}

pub struct EventFlags {
    mask: LockedCell<u32, KernelLock>,
    waiters: WaitList,
}

impl EventFlags {
    pub const fn new() -> EventFlags {
        EventFlags {
            mask: LockedCell::new(0),
            waiters: WaitList::new(),
        }
    }

    pub fn get(&self) -> u32 {
        KernelLock::with(|kkey| self.mask.get(kkey))
    }

    /// OR `bits` into the mask and wake every waiter the new value
    /// satisfies, head first. Handler-safe. Returns the mask after the
    /// woken waiters consumed their bits.
    pub fn raise(&self, bits: u32) -> Result<u32> {
        if bits == 0 || bits & RESERVED_FLAGS != 0 {
            return Err(Error::Inval);
        }
        KernelLock::with(|kkey| {
            let mut mask = self.mask.update(kkey, |mask| mask | bits);

            // Earlier waiters consume first: restart from the head after
            // every successful match, since a cleared bit can unsatisfy
            // the waiters behind it.
            loop {
                let satisfied = self.waiters.take_first_matching(kkey, |waiter| {
                    waiter
                        .flags_spec()
                        .and_then(|spec| flags_match(mask, spec.expected, spec.mode()))
                        .is_some()
                });
                let waiter = match satisfied {
                    Some(waiter) => waiter,
                    None => break,
                };
                let spec = waiter.flags_spec().unwrap();
                let matched = flags_match(mask, spec.expected, spec.mode()).unwrap();
                if spec.clear {
                    mask &= !matched;
                    self.mask.set(kkey, mask);
                }
                waiter.set_flags_result(matched);
                wake_detached(kkey, waiter, WakeReason::Transfer);
            }

            scheduler::reschedule(kkey);
            Ok(mask)
        })
    }

    /// Clear bits; returns the previous mask.
    pub fn clear(&self, bits: u32) -> Result<u32> {
        if bits & RESERVED_FLAGS != 0 {
            return Err(Error::Inval);
        }
        KernelLock::with(|kkey| {
            let previous = self.mask.get(kkey);
            self.mask.set(kkey, previous & !bits);
            Ok(previous)
        })
    }

    pub fn wait(&self, expected: u32, mode: FlagsMode, clear: bool) -> Result<u32> {
        self.wait_inner(expected, mode, clear, None, false)
    }

    pub fn wait_until(
        &self,
        expected: u32,
        mode: FlagsMode,
        clear: bool,
        deadline: Instant,
    ) -> Result<u32> {
        self.wait_inner(expected, mode, clear, Some(deadline), false)
    }

    pub fn try_wait(&self, expected: u32, mode: FlagsMode, clear: bool) -> Result<u32> {
        self.wait_inner(expected, mode, clear, None, true)
    }

    fn wait_inner(
        &self,
        expected: u32,
        mode: FlagsMode,
        clear: bool,
        deadline: Option<Instant>,
        try_only: bool,
    ) -> Result<u32> {
        if expected == 0 || expected & RESERVED_FLAGS != 0 {
            return Err(Error::Inval);
        }
        if !try_only && hal::in_handler_mode() {
            return Err(Error::Perm);
        }

        KernelLock::with(|kkey| loop {
            let mask = self.mask.get(kkey);
            if let Some(matched) = flags_match(mask, expected, mode) {
                if clear {
                    self.mask.set(kkey, mask & !matched);
                }
                return Ok(matched);
            }
            if try_only {
                return Err(Error::WouldBlock);
            }

            let current = scheduler::current_thread(kkey);
            current.waiter.set_flags_spec(Some(FlagsSpec {
                expected,
                match_all: mode == FlagsMode::All,
                clear,
            }));
            let reason =
                scheduler::block_current(kkey, Some(&self.waiters), deadline, ThreadState::Blocked);
            current.waiter.set_flags_spec(None);

            match reason {
                WakeReason::Transfer => return Ok(current.waiter.flags_result()),
                WakeReason::Timeout => return Err(Error::TimedOut),
                WakeReason::Interrupted => return Err(Error::Interrupted),
                WakeReason::Notify | WakeReason::Pending => continue,
            }
        })
    }
}

impl Default for EventFlags {
    fn default() -> EventFlags {
        EventFlags::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{flags_match, FlagsMode};

    #[test]
    fn any_matches_intersection() {
        assert_eq!(flags_match(0b1010, 0b0110, FlagsMode::Any), Some(0b0010));
        assert_eq!(flags_match(0b1000, 0b0110, FlagsMode::Any), None);
    }

    #[test]
    fn all_requires_superset() {
        assert_eq!(flags_match(0b1110, 0b0110, FlagsMode::All), Some(0b0110));
        assert_eq!(flags_match(0b0100, 0b0110, FlagsMode::All), None);
        // A partial overlap is not enough.
        assert_eq!(flags_match(0b0010, 0b0110, FlagsMode::All), None);
    }
}
