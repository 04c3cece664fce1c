//! Support for muon integration tests.
//!
//! Integration tests are `harness = false` binaries: `main` creates the
//! test threads, starts the kernel on the simulator port, and the test
//! body ends the process through [`test_succeed`] / [`test_fail`]. A test
//! that hangs is caught by the harness timeout instead.

use std::process::exit;

pub fn test_succeed() -> ! {
    println!("[ok]");
    exit(0)
}

pub fn test_fail() -> ! {
    println!("[failed]");
    exit(1)
}

/// Asserts that fail the whole test binary with a report instead of a
/// panic unwind; panicking inside a kernel thread would abort the
/// process without a verdict.
#[macro_export]
macro_rules! test_assert {
    ($cond:expr) => {
        if !$cond {
            ::std::println!("assertion failed: {}", stringify!($cond));
            $crate::test_fail();
        }
    };
}

#[macro_export]
macro_rules! test_assert_eq {
    ($left:expr, $right:expr) => {{
        let l = $left;
        let r = $right;
        if l != r {
            ::std::println!(
                "assertion failed: {} == {} ({:?} != {:?})",
                stringify!($left),
                stringify!($right),
                l,
                r
            );
            $crate::test_fail();
        }
    }};
}
