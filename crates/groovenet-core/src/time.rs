//! Simulated time
//!
//! All scheduling and packet timestamps use [`SimTime`], an integer
//! microsecond count since the start of the simulation. Integer ticks
//! keep the event queue totally ordered; floating-point seconds are
//! only a presentation format.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

/// A point in simulated time, in microseconds since simulation start.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SimTime(u64);

impl SimTime {
    /// Simulation start
    pub const ZERO: SimTime = SimTime(0);

    /// Create from a microsecond count
    pub fn from_micros(micros: u64) -> Self {
        SimTime(micros)
    }

    /// Create from a millisecond count
    pub fn from_millis(millis: u64) -> Self {
        SimTime(millis * 1_000)
    }

    /// Create from whole seconds
    pub fn from_secs(secs: u64) -> Self {
        SimTime(secs * 1_000_000)
    }

    /// Create from fractional seconds (saturating at zero)
    pub fn from_secs_f64(secs: f64) -> Self {
        SimTime((secs.max(0.0) * 1_000_000.0).round() as u64)
    }

    /// Microseconds since simulation start
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Fractional seconds since simulation start
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Saturating difference between two instants
    pub fn saturating_sub(&self, earlier: SimTime) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    /// The instant `d` before this one, clamped to simulation start
    pub fn saturating_sub_duration(&self, d: Duration) -> SimTime {
        SimTime(self.0.saturating_sub(d.as_micros() as u64))
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> SimTime {
        SimTime(self.0 + rhs.as_micros() as u64)
    }
}

impl AddAssign<Duration> for SimTime {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.as_micros() as u64;
    }
}

impl Sub<SimTime> for SimTime {
    type Output = Duration;

    fn sub(self, rhs: SimTime) -> Duration {
        Duration::from_micros(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simtime_ordering() {
        let a = SimTime::from_secs(3);
        let b = SimTime::from_secs_f64(3.000001);
        assert!(a < b);
        assert_eq!(b - a, Duration::from_micros(1));
    }

    #[test]
    fn test_simtime_add_duration() {
        let t = SimTime::from_millis(10) + Duration::from_millis(5);
        assert_eq!(t.as_micros(), 15_000);
    }
}
