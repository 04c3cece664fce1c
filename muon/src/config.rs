//! Build-time configuration.
//!
//! Numeric knobs are compile-time constants overridable from the build
//! environment, e.g. `MUON_PRIORITY_LEVELS=64 cargo build`. The tick
//! frequency is fixed by the port ([`crate::kernel::hal::TICK_FREQ_HZ`]).

use const_env::from_env;

/// Number of priority levels, including the idle level 0 and the
/// reserved top level.
#[from_env("MUON_PRIORITY_LEVELS")]
pub const PRIORITY_LEVELS: usize = 256;

/// Stack size used by `make_thread!` when none is given.
#[from_env("MUON_STACK_DEFAULT_SIZE")]
pub const STACK_DEFAULT_SIZE: usize = 16 * 1024;

/// Smallest stack accepted for a thread.
#[from_env("MUON_STACK_MIN_SIZE")]
pub const STACK_MIN_SIZE: usize = 256;

/// Bound on the blocked-owner chain walked when priority inheritance
/// propagates, which keeps the walk constant-time.
#[from_env("MUON_MUTEX_INHERIT_DEPTH_MAX")]
pub const MUTEX_INHERIT_DEPTH_MAX: usize = 8;
