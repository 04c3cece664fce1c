//! Priority inheritance: a low-priority holder inherits its best
//! waiter's priority, drops back on release, and the boost propagates
//! along a chain of blocked holders.

use muon::prelude::*;
use muon::sync::mutex::RawMutex;
use muon_test::test_assert_eq;

const STACK_SIZE: usize = 64 * 1024;

static M: RawMutex = RawMutex::new(MutexAttributes::new().with_protocol(MutexProtocol::Inherit));
static M1: RawMutex = RawMutex::new(MutexAttributes::new().with_protocol(MutexProtocol::Inherit));
static M2: RawMutex = RawMutex::new(MutexAttributes::new().with_protocol(MutexProtocol::Inherit));

fn holder_entry(_: *mut ()) {
    M.lock().unwrap();
    // Keep holding while the high-priority contender queues up.
    sysclock().sleep_for(Duration::from_millis(100)).unwrap();
    M.unlock().unwrap();
}

fn contender_entry(_: *mut ()) {
    M.lock().unwrap();
    M.unlock().unwrap();
}

fn chain_bottom_entry(_: *mut ()) {
    M2.lock().unwrap();
    sysclock().sleep_for(Duration::from_millis(100)).unwrap();
    M2.unlock().unwrap();
}

fn chain_middle_entry(_: *mut ()) {
    M1.lock().unwrap();
    // Blocks on M2, held by the bottom thread.
    M2.lock().unwrap();
    M2.unlock().unwrap();
    M1.unlock().unwrap();
}

fn chain_top_entry(_: *mut ()) {
    M1.lock().unwrap();
    M1.unlock().unwrap();
}

fn main_entry(_: *mut ()) {
    // Single-level inheritance.
    let holder = muon::make_thread!("holder", 3, STACK_SIZE);
    holder.start(holder_entry, core::ptr::null_mut()).unwrap();
    // Let the priority-3 holder run and take the mutex.
    sysclock().sleep_for(Duration::from_millis(20)).unwrap();
    test_assert_eq!(holder.priority(), Priority::new(3));

    let contender = muon::make_thread!("contender", 7, STACK_SIZE);
    contender.start(contender_entry, core::ptr::null_mut()).unwrap();
    // The contender is blocked on M; its priority carried over.
    test_assert_eq!(holder.priority(), Priority::new(7));
    test_assert_eq!(holder.base_priority(), Priority::new(3));

    contender.join().unwrap();
    holder.join().unwrap();
    // The boost ended with the release.
    test_assert_eq!(holder.priority(), Priority::new(3));

    // Two-level chain: top waits on middle, middle waits on bottom.
    let bottom = muon::make_thread!("bottom", 2, STACK_SIZE);
    bottom.start(chain_bottom_entry, core::ptr::null_mut()).unwrap();
    sysclock().sleep_for(Duration::from_millis(20)).unwrap();

    let middle = muon::make_thread!("middle", 3, STACK_SIZE);
    middle.start(chain_middle_entry, core::ptr::null_mut()).unwrap();
    sysclock().sleep_for(Duration::from_millis(20)).unwrap();

    let top = muon::make_thread!("top", 7, STACK_SIZE);
    top.start(chain_top_entry, core::ptr::null_mut()).unwrap();

    // The walk raised both holders below the top waiter.
    test_assert_eq!(middle.priority(), Priority::new(7));
    test_assert_eq!(bottom.priority(), Priority::new(7));

    top.join().unwrap();
    middle.join().unwrap();
    bottom.join().unwrap();
    test_assert_eq!(bottom.priority(), Priority::new(2));
    test_assert_eq!(middle.priority(), Priority::new(3));

    muon_test::test_succeed();
}

fn main() {
    let main = muon::make_thread!("main", 5, STACK_SIZE);
    main.start(main_entry, core::ptr::null_mut()).unwrap();
    muon::kernel::start();
}
