//! Robust mutexes: a holder's death is reported to the next acquirer,
//! who must restore consistency before unlocking or lose the mutex for
//! good.

use muon::prelude::*;
use muon::sync::mutex::RawMutex;
use muon_test::test_assert_eq;

const STACK_SIZE: usize = 64 * 1024;

static RECOVERED: RawMutex = RawMutex::new(MutexAttributes::new().robust());
static POISONED: RawMutex = RawMutex::new(MutexAttributes::new().robust());

fn dies_holding_recovered(_: *mut ()) {
    RECOVERED.lock().unwrap();
    thread::exit(core::ptr::null_mut());
}

fn dies_holding_poisoned(_: *mut ()) {
    POISONED.lock().unwrap();
    thread::exit(core::ptr::null_mut());
}

fn main_entry(_: *mut ()) {
    // Recovery path: acquire after the owner died, repair, release.
    let victim = muon::make_thread!("victim", 7, STACK_SIZE);
    victim
        .start(dies_holding_recovered, core::ptr::null_mut())
        .unwrap();
    victim.join().unwrap();

    test_assert_eq!(RECOVERED.lock(), Err(Error::OwnerDead));
    // We own it regardless and may repair the state.
    RECOVERED.mark_consistent().unwrap();
    RECOVERED.unlock().unwrap();

    // Once repaired, the mutex behaves normally again.
    RECOVERED.lock().unwrap();
    RECOVERED.unlock().unwrap();

    // Poisoning path: releasing without repairing retires the mutex.
    let victim2 = muon::make_thread!("victim2", 7, STACK_SIZE);
    victim2
        .start(dies_holding_poisoned, core::ptr::null_mut())
        .unwrap();
    victim2.join().unwrap();

    test_assert_eq!(POISONED.lock(), Err(Error::OwnerDead));
    POISONED.unlock().unwrap();
    test_assert_eq!(POISONED.lock(), Err(Error::NotRecoverable));
    // Repairing a retired mutex is no longer possible.
    test_assert_eq!(POISONED.mark_consistent(), Err(Error::Inval));

    muon_test::test_succeed();
}

fn main() {
    let main = muon::make_thread!("main", 5, STACK_SIZE);
    main.start(main_entry, core::ptr::null_mut()).unwrap();
    muon::kernel::start();
}
