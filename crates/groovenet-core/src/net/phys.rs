//! Physical-layer policy
//!
//! Models the shared medium: a symmetric great-circle range predicate,
//! time-on-air and propagation delay, and channel contention. A
//! collision is recorded when a second packet's reception window begins
//! at a receiver while an earlier window has not yet finished -
//! simultaneous reception, not simultaneous transmission. Accounting is
//! per single default channel.

use crate::config::{ModelParams, ParamSpec, ParamType};
use crate::error::{ConfigError, DropReason};
use crate::net::packet::Position;
use crate::time::SimTime;
use std::time::Duration;

/// Speed of light, m/s
const LIGHT_SPEED_MPS: f64 = 299_792_458.0;

/// Running medium counters, consumed for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysStats {
    /// Reception windows opened at this entity
    pub messages_seen: u64,
    /// Overlapping-window collisions recorded
    pub collisions: u64,
}

/// Closed set of physical-layer policies, selected by type tag at init.
#[derive(Debug)]
pub enum PhysPolicy {
    /// Range gating only; the channel never contends
    Range(RangePhys),
    /// Range gating plus overlapping-window collision accounting
    Collision(CollisionPhys),
}

impl PhysPolicy {
    /// Type tags accepted by [`PhysPolicy::from_tag`]
    pub const TAGS: &'static [&'static str] = &["range", "collision"];

    /// Build a policy from its configuration tag
    pub fn from_tag(tag: &str, params: &ModelParams) -> Result<Self, ConfigError> {
        match tag {
            "range" => Ok(PhysPolicy::Range(RangePhys::from_params(params)?)),
            "collision" => Ok(PhysPolicy::Collision(CollisionPhys::from_params(params)?)),
            other => Err(ConfigError::UnknownPolicy {
                model: params.model.clone(),
                tag: other.to_string(),
            }),
        }
    }

    fn base(&self) -> &RangePhys {
        match self {
            PhysPolicy::Range(p) => p,
            PhysPolicy::Collision(p) => &p.base,
        }
    }

    /// Symmetric range predicate: both parties within the threshold
    pub fn in_range(&self, a: &Position, b: &Position) -> bool {
        a.distance_m(b) <= self.base().range_m
    }

    /// Configured range threshold in meters
    pub fn range_m(&self) -> f64 {
        self.base().range_m
    }

    /// Signal propagation delay over a distance
    pub fn propagation_delay(&self, distance_m: f64) -> Duration {
        Duration::from_secs_f64(distance_m.max(0.0) / LIGHT_SPEED_MPS)
    }

    /// Simulated time-on-air for a wire frame of `bytes` length
    pub fn airtime(&self, bytes: usize) -> Duration {
        Duration::from_secs_f64(bytes as f64 * 8.0 / self.base().bitrate_bps)
    }

    /// Gate delivery by current range and activity of both parties
    pub fn receive_packet(
        &mut self,
        local: &Position,
        transmitter: &Position,
        active: bool,
    ) -> Result<(), DropReason> {
        if !active {
            return Err(DropReason::Inactive);
        }
        if !self.in_range(local, transmitter) {
            return Err(DropReason::OutOfRange);
        }
        Ok(())
    }

    /// Open a reception window `[now, end)`. With the collision policy,
    /// an already-open window makes this packet a collision casualty.
    pub fn begin_process_packet(&mut self, now: SimTime, end: SimTime) -> Result<(), DropReason> {
        match self {
            PhysPolicy::Range(p) => {
                p.stats.messages_seen += 1;
                Ok(())
            }
            PhysPolicy::Collision(p) => p.begin_window(now, end),
        }
    }

    /// Close out reception windows that ended at or before `now`
    pub fn end_process_packet(&mut self, now: SimTime) {
        if let PhysPolicy::Collision(p) = self {
            p.windows.retain(|w| w.end > now);
        }
    }

    /// Telemetry counters
    pub fn stats(&self) -> PhysStats {
        match self {
            PhysPolicy::Range(p) => p.stats,
            PhysPolicy::Collision(p) => p.base.stats,
        }
    }

    /// Reset between trials
    pub fn reset(&mut self) {
        match self {
            PhysPolicy::Range(p) => p.stats = PhysStats::default(),
            PhysPolicy::Collision(p) => {
                p.base.stats = PhysStats::default();
                p.windows.clear();
            }
        }
    }
}

/// Range-only medium model.
#[derive(Debug)]
pub struct RangePhys {
    range_m: f64,
    bitrate_bps: f64,
    stats: PhysStats,
}

impl RangePhys {
    pub fn from_params(params: &ModelParams) -> Result<Self, ConfigError> {
        let mut declared = params.clone();
        declared.declare(
            "phys.range_m",
            ParamSpec::new("200.0", "radio range threshold in meters", ParamType::Float),
        );
        declared.declare(
            "phys.bitrate_bps",
            ParamSpec::new("6000000", "channel bitrate in bits/second", ParamType::Float),
        );
        Ok(Self {
            range_m: declared.get_f64("phys.range_m")?,
            bitrate_bps: declared.get_f64("phys.bitrate_bps")?.max(1.0),
            stats: PhysStats::default(),
        })
    }
}

/// One open reception window at this receiver.
#[derive(Debug, Clone, Copy)]
struct RxWindow {
    end: SimTime,
}

/// Range gating plus collision accounting on a single default channel.
#[derive(Debug)]
pub struct CollisionPhys {
    base: RangePhys,
    windows: Vec<RxWindow>,
}

impl CollisionPhys {
    pub fn from_params(params: &ModelParams) -> Result<Self, ConfigError> {
        Ok(Self {
            base: RangePhys::from_params(params)?,
            windows: Vec::new(),
        })
    }

    fn begin_window(&mut self, now: SimTime, end: SimTime) -> Result<(), DropReason> {
        self.base.stats.messages_seen += 1;

        // Drop windows that finished before this one starts, then check
        // whether any earlier reception is still in the air.
        self.windows.retain(|w| w.end > now);
        let contended = !self.windows.is_empty();

        self.windows.push(RxWindow { end });

        if contended {
            self.base.stats.collisions += 1;
            return Err(DropReason::Collision);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(tag: &str, range_m: f64) -> PhysPolicy {
        let params = ModelParams::new("test").with("phys.range_m", range_m.to_string());
        PhysPolicy::from_tag(tag, &params).unwrap()
    }

    #[test]
    fn test_range_symmetric() {
        let phys = policy("range", 200.0);
        let a = Position::from_degrees(40.0, -80.0);
        let b = a.offset(45.0, 150.0);
        assert_eq!(phys.in_range(&a, &b), phys.in_range(&b, &a));
        assert!(phys.in_range(&a, &b));
    }

    #[test]
    fn test_range_monotonic_in_threshold() {
        let a = Position::from_degrees(40.0, -80.0);
        let b = a.offset(90.0, 180.0);
        let mut last_in_range = false;
        for threshold in [50.0, 100.0, 179.0, 181.0, 500.0, 5_000.0] {
            let in_range = policy("range", threshold).in_range(&a, &b);
            // Increasing the threshold never turns an in-range pair out-of-range
            assert!(in_range || !last_in_range);
            last_in_range = in_range;
        }
        assert!(last_in_range);
    }

    #[test]
    fn test_collision_on_overlapping_windows() {
        let mut phys = policy("collision", 200.0);
        let t = SimTime::from_secs(10);

        assert!(phys
            .begin_process_packet(t, t + Duration::from_millis(2))
            .is_ok());
        // Second window begins while the first is still in the air
        assert_eq!(
            phys.begin_process_packet(
                t + Duration::from_millis(1),
                t + Duration::from_millis(3)
            ),
            Err(DropReason::Collision)
        );
        assert_eq!(phys.stats().collisions, 1);
        assert_eq!(phys.stats().messages_seen, 2);
    }

    #[test]
    fn test_no_collision_on_disjoint_windows() {
        let mut phys = policy("collision", 200.0);
        let t = SimTime::from_secs(10);

        assert!(phys
            .begin_process_packet(t, t + Duration::from_millis(1))
            .is_ok());
        phys.end_process_packet(t + Duration::from_millis(1));
        assert!(phys
            .begin_process_packet(
                t + Duration::from_millis(2),
                t + Duration::from_millis(3)
            )
            .is_ok());
        assert_eq!(phys.stats().collisions, 0);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut phys = policy("range", 100.0);
        let a = Position::from_degrees(40.0, -80.0);
        let far = a.offset(0.0, 500.0);
        assert_eq!(
            phys.receive_packet(&a, &far, true),
            Err(DropReason::OutOfRange)
        );
        assert_eq!(
            phys.receive_packet(&a, &a, false),
            Err(DropReason::Inactive)
        );
    }

    #[test]
    fn test_airtime_and_propagation() {
        let phys = policy("range", 200.0);
        // 750 bytes at 6 Mbps = 1 ms
        assert_eq!(phys.airtime(750), Duration::from_millis(1));
        assert!(phys.propagation_delay(50.0) < Duration::from_micros(1));
    }
}
