//! Tick-based time.
//!
//! All kernel timing is in native clock ticks; the tick length comes from
//! the port. Conversions from wall-clock units round up, so a converted
//! duration never undershoots the requested one.

use crate::kernel::hal::TICK_FREQ_HZ;
use core::ops::{Add, AddAssign, Mul, Sub};

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Debug)]
pub struct Duration {
    ticks: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration { ticks: 0 };
    pub const MAX: Duration = Duration { ticks: u64::MAX };

    pub const fn from_ticks(ticks: u64) -> Duration {
        Duration { ticks }
    }

    pub const fn from_secs(secs: u64) -> Duration {
        Duration {
            ticks: secs * TICK_FREQ_HZ,
        }
    }

    pub const fn from_millis(millis: u64) -> Duration {
        Duration {
            ticks: div_ceil_u128(millis as u128 * TICK_FREQ_HZ as u128, 1_000),
        }
    }

    pub const fn from_micros(micros: u64) -> Duration {
        Duration {
            ticks: div_ceil_u128(micros as u128 * TICK_FREQ_HZ as u128, 1_000_000),
        }
    }

    pub const fn as_ticks(&self) -> u64 {
        self.ticks
    }

    pub const fn as_secs(&self) -> u64 {
        self.ticks / TICK_FREQ_HZ
    }

    pub const fn as_millis(&self) -> u64 {
        (self.ticks as u128 * 1_000 / TICK_FREQ_HZ as u128) as u64
    }

    pub const fn as_micros(&self) -> u64 {
        (self.ticks as u128 * 1_000_000 / TICK_FREQ_HZ as u128) as u64
    }

    pub const fn is_zero(&self) -> bool {
        self.ticks == 0
    }

    pub const fn saturating_add(self, rhs: Duration) -> Duration {
        Duration {
            ticks: self.ticks.saturating_add(rhs.ticks),
        }
    }
}

const fn div_ceil_u128(value: u128, divisor: u128) -> u64 {
    ((value + divisor - 1) / divisor) as u64
}

impl Add<Duration> for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration {
            ticks: self.ticks + rhs.ticks,
        }
    }
}

impl AddAssign<Duration> for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.ticks += rhs.ticks;
    }
}

impl Sub<Duration> for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration {
            ticks: self.ticks - rhs.ticks,
        }
    }
}

impl Mul<u32> for Duration {
    type Output = Duration;
    fn mul(self, rhs: u32) -> Duration {
        Duration {
            ticks: self.ticks * rhs as u64,
        }
    }
}

/// A point on a kernel clock, measured in ticks since the clock's epoch.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Debug)]
pub struct Instant {
    pub(crate) ticks: u64,
}

impl Instant {
    pub const fn from_ticks(ticks: u64) -> Instant {
        Instant { ticks }
    }

    pub const fn as_ticks(&self) -> u64 {
        self.ticks
    }

    /// Ticks from `earlier` to `self`; zero if `earlier` is later.
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration {
            ticks: self.ticks.saturating_sub(earlier.ticks),
        }
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant {
            ticks: self.ticks.saturating_add(rhs.as_ticks()),
        }
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Instant {
        Instant {
            ticks: self.ticks - rhs.as_ticks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Duration, Instant, TICK_FREQ_HZ};

    #[test]
    fn conversions_round_up() {
        // One microsecond never converts to zero ticks, whatever the
        // tick frequency.
        assert!(Duration::from_micros(1).as_ticks() >= 1);
        assert_eq!(Duration::from_secs(1).as_ticks(), TICK_FREQ_HZ);
        assert_eq!(
            Duration::from_millis(1_000).as_ticks(),
            Duration::from_secs(1).as_ticks()
        );
    }

    #[test]
    fn instant_arithmetic() {
        let base = Instant::from_ticks(1_000);
        let later = base + Duration::from_ticks(50);
        assert_eq!(later.as_ticks(), 1_050);
        assert_eq!(
            later.saturating_duration_since(base),
            Duration::from_ticks(50)
        );
        assert_eq!(base.saturating_duration_since(later), Duration::ZERO);
        assert!(later > base);
    }
}
