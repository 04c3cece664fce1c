//! Semaphores: counting bounds, direct handoff to a waiter, timed wait,
//! and reset draining waiters.

use muon::prelude::*;
use muon_test::{test_assert, test_assert_eq};
use std::sync::atomic::{AtomicU64, Ordering};

const STACK_SIZE: usize = 64 * 1024;

static COUNTER: Semaphore = Semaphore::counting(2, 0);
static GATE: Semaphore = Semaphore::binary(true);
static DRAIN: Semaphore = Semaphore::counting(1, 0);

static WOKEN_AT: AtomicU64 = AtomicU64::new(0);

fn gate_waiter_entry(_: *mut ()) {
    GATE.wait().unwrap();
    WOKEN_AT.store(sysclock().now().as_ticks(), Ordering::SeqCst);
}

fn drain_waiter_entry(_: *mut ()) {
    test_assert_eq!(DRAIN.wait(), Err(Error::Interrupted));
}

fn main_entry(_: *mut ()) {
    // Counting bounds.
    test_assert_eq!(COUNTER.value(), 0);
    test_assert_eq!(COUNTER.try_wait(), Err(Error::WouldBlock));
    COUNTER.post().unwrap();
    COUNTER.post().unwrap();
    test_assert_eq!(COUNTER.post(), Err(Error::Again));
    test_assert_eq!(COUNTER.value(), 2);
    COUNTER.wait().unwrap();
    COUNTER.try_wait().unwrap();
    test_assert_eq!(COUNTER.value(), 0);

    // A post with a waiter present hands the token over; the counter
    // never moves.
    let waiter = muon::make_thread!("waiter", 7, STACK_SIZE);
    waiter.start(gate_waiter_entry, core::ptr::null_mut()).unwrap();
    // The waiter is blocked; it outranks us, so it resumes during post.
    let posted_at = sysclock().now();
    sysclock().sleep_for(Duration::from_millis(100)).unwrap();
    GATE.post().unwrap();
    waiter.join().unwrap();
    let woken_at = Instant::from_ticks(WOKEN_AT.load(Ordering::SeqCst));
    test_assert!(woken_at >= posted_at + Duration::from_millis(100));
    test_assert_eq!(GATE.value(), 0);

    // Timed wait expires on its own.
    let before = sysclock().now();
    test_assert_eq!(
        DRAIN.wait_for(Duration::from_millis(30)),
        Err(Error::TimedOut)
    );
    test_assert!(sysclock().now().saturating_duration_since(before) >= Duration::from_millis(30));

    // Reset interrupts pending waits and restores the initial count.
    let drained = muon::make_thread!("drained", 7, STACK_SIZE);
    drained
        .start(drain_waiter_entry, core::ptr::null_mut())
        .unwrap();
    DRAIN.reset().unwrap();
    drained.join().unwrap();
    test_assert_eq!(DRAIN.value(), 0);

    muon_test::test_succeed();
}

fn main() {
    let main = muon::make_thread!("main", 5, STACK_SIZE);
    main.start(main_entry, core::ptr::null_mut()).unwrap();
    muon::kernel::start();
}
