//! Thread lifecycle: exit values through join, self-join detection,
//! kill, detach, and the registry walker.

use muon::prelude::*;
use muon_test::{test_assert, test_assert_eq};
use std::sync::atomic::{AtomicBool, Ordering};

const STACK_SIZE: usize = 64 * 1024;

static LOOPER_STARTED: AtomicBool = AtomicBool::new(false);

fn answer_entry(_: *mut ()) {
    thread::exit(42 as *mut ());
}

fn looper_entry(_: *mut ()) {
    LOOPER_STARTED.store(true, Ordering::SeqCst);
    loop {
        sysclock().sleep_for(Duration::from_millis(10)).unwrap();
    }
}

fn detached_entry(_: *mut ()) {}

fn main_entry(_: *mut ()) {
    // Exit value arrives at the joiner.
    let answer = muon::make_thread!("answer", 7, STACK_SIZE);
    answer.start(answer_entry, core::ptr::null_mut()).unwrap();
    test_assert_eq!(answer.join().unwrap(), 42 as *mut ());
    test_assert_eq!(answer.state(), muon::ThreadState::Terminated);
    // Joining an already-terminated thread returns immediately.
    test_assert_eq!(answer.join().unwrap(), 42 as *mut ());

    // Self-join cannot succeed.
    test_assert_eq!(thread::current().join(), Err(Error::Deadlock));

    // Kill pulls a sleeping thread out of its wait for good.
    let looper = muon::make_thread!("looper", 3, STACK_SIZE);
    looper.start(looper_entry, core::ptr::null_mut()).unwrap();
    sysclock().sleep_for(Duration::from_millis(30)).unwrap();
    test_assert!(LOOPER_STARTED.load(Ordering::SeqCst));
    looper.kill().unwrap();
    test_assert_eq!(looper.state(), muon::ThreadState::Terminated);
    test_assert_eq!(looper.join().unwrap(), core::ptr::null_mut());

    // A detached thread cannot be joined.
    let loner = muon::make_thread!("loner", 7, STACK_SIZE);
    loner.detach().unwrap();
    loner.start(detached_entry, core::ptr::null_mut()).unwrap();
    test_assert_eq!(loner.join(), Err(Error::Inval));

    // An unstarted thread is not joinable either.
    let unstarted = muon::make_thread!("unstarted", 7, STACK_SIZE);
    test_assert_eq!(unstarted.join(), Err(Error::Inval));
    test_assert_eq!(unstarted.state(), muon::ThreadState::Created);

    // The registry sees everything created above, idle included.
    let mut names = Vec::new();
    thread::for_each_thread(|info| names.push(info.name));
    test_assert!(names.contains(&"[idle]"));
    test_assert!(names.contains(&"main"));
    test_assert!(names.contains(&"answer"));
    thread::print_threads();

    muon_test::test_succeed();
}

fn main() {
    let main = muon::make_thread!("main", 5, STACK_SIZE);
    main.start(main_entry, core::ptr::null_mut()).unwrap();
    muon::kernel::start();
}
