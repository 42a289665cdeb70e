//! Injected monotonic time.
//!
//! The engine never reads a clock of its own. The caller stamps every [`tick`](crate::MainDevice::tick)
//! and [`receive_frame`](crate::MainDevice::receive_frame) call with an [`Instant`], and all
//! protocol timeouts are measured against those stamps.

use core::ops::{Add, Sub};
use core::time::Duration;

/// A monotonic timestamp in nanoseconds, provided by the caller.
///
/// On hosted targets this is typically derived from `std::time::Instant`; on embedded targets from
/// a hardware counter. The absolute epoch is irrelevant, only differences are used.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Instant(u64);

impl Instant {
    /// The zero timestamp.
    pub const ZERO: Self = Self(0);

    /// Create a timestamp from a nanosecond count.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Create a timestamp from a microsecond count.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros * 1_000)
    }

    /// Create a timestamp from a millisecond count.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Nanoseconds since the caller's epoch.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// The duration elapsed since an earlier timestamp, saturating to zero if `earlier` is in
    /// fact later than `self`.
    pub fn duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_sub(rhs.as_nanos() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_difference() {
        let early = Instant::from_millis(1);
        let late = Instant::from_millis(3);

        assert_eq!(late.duration_since(early), Duration::from_millis(2));
        assert_eq!(early.duration_since(late), Duration::ZERO);
    }

    #[test]
    fn add_duration() {
        let start = Instant::from_micros(500);

        assert_eq!(start + Duration::from_micros(250), Instant::from_micros(750));
    }
}
