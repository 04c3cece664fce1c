//! Event flags: all/any matching, clear-on-wake across separate raises,
//! the reserved bit, and the per-thread flag variant.

use muon::prelude::*;
use muon_test::{test_assert, test_assert_eq};
use std::sync::atomic::{AtomicU32, Ordering};

const STACK_SIZE: usize = 64 * 1024;

static EVENTS: EventFlags = EventFlags::new();
static MATCHED: AtomicU32 = AtomicU32::new(0);
static LOCAL_MATCHED: AtomicU32 = AtomicU32::new(0);

fn all_waiter_entry(_: *mut ()) {
    let matched = EVENTS.wait(0b1010, FlagsMode::All, true).unwrap();
    MATCHED.store(matched, Ordering::SeqCst);
}

fn local_waiter_entry(_: *mut ()) {
    let matched = thread::wait_flags(0b100, FlagsMode::Any, true).unwrap();
    LOCAL_MATCHED.store(matched, Ordering::SeqCst);
}

fn main_entry(_: *mut ()) {
    // Reserved bit is off limits.
    test_assert_eq!(EVENTS.raise(1), Err(Error::Inval));
    test_assert_eq!(EVENTS.wait(0, FlagsMode::Any, false), Err(Error::Inval));

    // All-mode wait across two partial raises, clearing on wake-up.
    let waiter = muon::make_thread!("all-waiter", 7, STACK_SIZE);
    waiter.start(all_waiter_entry, core::ptr::null_mut()).unwrap();

    EVENTS.raise(0b1000).unwrap();
    // Half the condition is not enough.
    test_assert_eq!(waiter.state(), muon::ThreadState::Blocked);
    test_assert_eq!(EVENTS.get(), 0b1000);

    EVENTS.raise(0b0010).unwrap();
    waiter.join().unwrap();
    test_assert_eq!(MATCHED.load(Ordering::SeqCst), 0b1010);
    // The matched bits were consumed.
    test_assert_eq!(EVENTS.get(), 0);

    // Any-mode matches the intersection and leaves bits unless asked.
    EVENTS.raise(0b100).unwrap();
    test_assert_eq!(EVENTS.try_wait(0b110, FlagsMode::Any, false), Ok(0b100));
    test_assert_eq!(EVENTS.get(), 0b100);
    test_assert_eq!(EVENTS.try_wait(0b110, FlagsMode::Any, true), Ok(0b100));
    test_assert_eq!(EVENTS.get(), 0);
    test_assert_eq!(
        EVENTS.try_wait(0b110, FlagsMode::Any, false),
        Err(Error::WouldBlock)
    );

    // A bounded wait expires when nothing is raised.
    let deadline = sysclock().now() + Duration::from_millis(30);
    test_assert_eq!(
        EVENTS.wait_until(0b1, FlagsMode::Any, false, deadline),
        Err(Error::Inval)
    );
    let deadline = sysclock().now() + Duration::from_millis(30);
    test_assert_eq!(
        EVENTS.wait_until(0b10, FlagsMode::Any, false, deadline),
        Err(Error::TimedOut)
    );

    // Per-thread flags follow the same rules, raised through the
    // owner's handle.
    let local = muon::make_thread!("local-waiter", 7, STACK_SIZE);
    local.start(local_waiter_entry, core::ptr::null_mut()).unwrap();
    test_assert_eq!(local.state(), muon::ThreadState::Blocked);
    local.raise_flags(0b100).unwrap();
    local.join().unwrap();
    test_assert_eq!(LOCAL_MATCHED.load(Ordering::SeqCst), 0b100);
    test_assert_eq!(local.flags(), 0);

    test_assert!(EVENTS.get() == 0);
    muon_test::test_succeed();
}

fn main() {
    let main = muon::make_thread!("main", 5, STACK_SIZE);
    main.start(main_entry, core::ptr::null_mut()).unwrap();
    muon::kernel::start();
}
