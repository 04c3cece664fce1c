//! A higher-priority thread preempts at start; a lower one runs only
//! once the starter blocks.

use muon::prelude::*;
use muon_test::{test_assert, test_assert_eq};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const STACK_SIZE: usize = 64 * 1024;

static LOG: [AtomicU8; 16] = [const { AtomicU8::new(0) }; 16];
static LOG_LEN: AtomicUsize = AtomicUsize::new(0);

fn log(tag: u8) {
    let index = LOG_LEN.fetch_add(1, Ordering::SeqCst);
    LOG[index].store(tag, Ordering::SeqCst);
}

fn log_bytes() -> Vec<u8> {
    (0..LOG_LEN.load(Ordering::SeqCst))
        .map(|i| LOG[i].load(Ordering::SeqCst))
        .collect()
}

fn high_entry(_: *mut ()) {
    log(b'h');
}

fn low_entry(_: *mut ()) {
    log(b'l');
}

fn main_entry(_: *mut ()) {
    log(b'a');

    let high = muon::make_thread!("high", 7, STACK_SIZE);
    high.start(high_entry, core::ptr::null_mut()).unwrap();
    // "high" outranks us, so it has already run to completion.
    log(b'b');
    test_assert_eq!(high.state(), muon::ThreadState::Terminated);

    let low = muon::make_thread!("low", 3, STACK_SIZE);
    low.start(low_entry, core::ptr::null_mut()).unwrap();
    // "low" must not have run yet.
    log(b'c');

    // Joining blocks us, which is when "low" gets the CPU.
    low.join().unwrap();
    test_assert_eq!(log_bytes(), b"ahbcl".to_vec());

    test_assert!(thread::current().priority() == Priority::new(5));
    muon_test::test_succeed();
}

fn main() {
    let main = muon::make_thread!("main", 5, STACK_SIZE);
    main.start(main_entry, core::ptr::null_mut()).unwrap();
    muon::kernel::start();
}
