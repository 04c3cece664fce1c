//! Explicit yields round-robin among equal-priority threads.

use muon::prelude::*;
use muon_test::test_assert_eq;
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

fn spinner(tag: *mut ()) {
    let tag = tag as usize as u8;
    for _ in 0..3 {
        log(tag);
        thread::yield_now();
    }
}

fn main_entry(_: *mut ()) {
    let first = muon::make_thread!("first", 5, STACK_SIZE);
    let second = muon::make_thread!("second", 5, STACK_SIZE);
    first.start(spinner, b'1' as usize as *mut ()).unwrap();
    second.start(spinner, b'2' as usize as *mut ()).unwrap();

    first.join().unwrap();
    second.join().unwrap();

    test_assert_eq!(log_bytes(), b"121212".to_vec());
    muon_test::test_succeed();
}

fn main() {
    let main = muon::make_thread!("main", 6, STACK_SIZE);
    main.start(main_entry, core::ptr::null_mut()).unwrap();
    muon::kernel::start();
}
