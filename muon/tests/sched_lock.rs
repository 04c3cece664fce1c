//! The scheduler lock defers preemption until the outermost unlock.

use muon::prelude::*;
use muon::scheduler;
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

fn high_entry(tag: *mut ()) {
    log(tag as usize as u8);
}

fn main_entry(_: *mut ()) {
    // Starting a higher-priority thread while locked does not preempt.
    scheduler::locked(|| {
        let high = muon::make_thread!("high", 7, STACK_SIZE);
        high.start(high_entry, b'h' as usize as *mut ()).unwrap();
        log(b'a');
    });
    // The deferred preemption fires at unlock, before we run again.
    log(b'b');
    test_assert_eq!(log_bytes(), b"ahb".to_vec());

    // Nested locks only release at the outermost unlock.
    let outer = scheduler::lock();
    let inner = scheduler::lock();
    let high2 = muon::make_thread!("high2", 7, STACK_SIZE);
    high2.start(high_entry, b'H' as usize as *mut ()).unwrap();
    log(b'c');
    scheduler::unlock(inner);
    // Still locked once.
    log(b'd');
    scheduler::unlock(outer);
    log(b'e');
    test_assert_eq!(log_bytes(), b"ahbcdHe".to_vec());

    muon_test::test_succeed();
}

fn main() {
    let main = muon::make_thread!("main", 5, STACK_SIZE);
    main.start(main_entry, core::ptr::null_mut()).unwrap();
    muon::kernel::start();
}
