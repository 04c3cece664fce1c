//! Clock behavior: sleep duration lower bound, early wake by resume,
//! timed park, and the adjustable real-time clock.

use muon::prelude::*;
use muon_test::{test_assert, test_assert_eq};
use std::sync::atomic::{AtomicBool, Ordering};

const STACK_SIZE: usize = 64 * 1024;

static SLEEPER_INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn sleeper_entry(_: *mut ()) {
    // Far longer than the test runs; only an interrupt ends it.
    let outcome = sysclock().sleep_for(Duration::from_secs(600));
    test_assert_eq!(outcome, Err(Error::Interrupted));
    SLEEPER_INTERRUPTED.store(true, Ordering::SeqCst);
}

fn main_entry(_: *mut ()) {
    // A finished sleep never returns early.
    let before = sysclock().now();
    sysclock().sleep_for(Duration::from_millis(50)).unwrap();
    let slept = sysclock().now().saturating_duration_since(before);
    test_assert!(slept >= Duration::from_millis(50));
    test_assert!(slept < Duration::from_millis(500));

    // A zero sleep is a no-op.
    sysclock().sleep_for(Duration::ZERO).unwrap();

    // Resuming a sleeping thread ends the sleep with `Interrupted`,
    // not with a timeout.
    let sleeper = muon::make_thread!("sleeper", 7, STACK_SIZE);
    sleeper.start(sleeper_entry, core::ptr::null_mut()).unwrap();
    sysclock().sleep_for(Duration::from_millis(20)).unwrap();
    sleeper.resume().unwrap();
    sleeper.join().unwrap();
    test_assert!(SLEEPER_INTERRUPTED.load(Ordering::SeqCst));

    // A timed park with no event times out.
    let before = sysclock().now();
    test_assert_eq!(
        sysclock().wait_for(Duration::from_millis(30)),
        Err(Error::TimedOut)
    );
    let waited = sysclock().now().saturating_duration_since(before);
    test_assert!(waited >= Duration::from_millis(30));

    // The real-time clock follows its offset.
    rtclock().set(Instant::from_ticks(1_000_000_000));
    let rt = rtclock().now();
    test_assert!(rt >= Instant::from_ticks(1_000_000_000));
    rtclock().adjust(500);
    let shifted = rtclock().now();
    test_assert!(shifted >= rt);

    muon_test::test_succeed();
}

fn main() {
    let main = muon::make_thread!("main", 5, STACK_SIZE);
    main.start(main_entry, core::ptr::null_mut()).unwrap();
    muon::kernel::start();
}
