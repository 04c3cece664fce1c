//! Condition variables: predicate waits, one-of-many signalling, and
//! the timed variant reporting its verdict after re-acquiring the lock.

use muon::prelude::*;
use muon_test::{test_assert, test_assert_eq};
use std::sync::atomic::{AtomicUsize, Ordering};

const STACK_SIZE: usize = 64 * 1024;

static SLOTS: Mutex<u32> = Mutex::new(0);
static SLOTS_READY: Condvar = Condvar::new();
static CONSUMED: AtomicUsize = AtomicUsize::new(0);

fn consumer_entry(_: *mut ()) {
    let mut guard = SLOTS.lock().unwrap();
    guard = SLOTS_READY.wait_while(guard, |slots| *slots == 0);
    *guard -= 1;
    drop(guard);
    CONSUMED.fetch_add(1, Ordering::SeqCst);
}

fn main_entry(_: *mut ()) {
    // Two consumers park on the same condition.
    let first = muon::make_thread!("consumer1", 7, STACK_SIZE);
    let second = muon::make_thread!("consumer2", 7, STACK_SIZE);
    first.start(consumer_entry, core::ptr::null_mut()).unwrap();
    second.start(consumer_entry, core::ptr::null_mut()).unwrap();
    test_assert_eq!(CONSUMED.load(Ordering::SeqCst), 0);

    // One slot, one signal: exactly one consumer proceeds.
    {
        let mut guard = SLOTS.lock().unwrap();
        *guard = 1;
    }
    SLOTS_READY.notify_one();
    first.join().unwrap();
    test_assert_eq!(CONSUMED.load(Ordering::SeqCst), 1);

    // Broadcast releases the rest.
    {
        let mut guard = SLOTS.lock().unwrap();
        *guard = 1;
    }
    SLOTS_READY.notify_all();
    second.join().unwrap();
    test_assert_eq!(CONSUMED.load(Ordering::SeqCst), 2);

    // Timed wait: the lock is held again when the timeout is reported.
    let guard = SLOTS.lock().unwrap();
    let before = sysclock().now();
    let (guard, outcome) = SLOTS_READY.wait_for(guard, Duration::from_millis(30));
    test_assert!(outcome.timed_out());
    test_assert!(sysclock().now().saturating_duration_since(before) >= Duration::from_millis(30));
    test_assert_eq!(*guard, 0);
    drop(guard);

    muon_test::test_succeed();
}

fn main() {
    let main = muon::make_thread!("main", 5, STACK_SIZE);
    main.start(main_entry, core::ptr::null_mut()).unwrap();
    muon::kernel::start();
}
