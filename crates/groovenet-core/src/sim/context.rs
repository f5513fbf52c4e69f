//! Shared simulation context
//!
//! Everything a model needs from the outside world, threaded through
//! constructors and method arguments instead of globals: the two entity
//! registries, the map collaborator, the optional network transport,
//! and the global in-flight message tracker.

use crate::map::MapService;
use crate::net::node::{RoadsideUnit, Vehicle};
use crate::net::packet::PacketSequence;
use crate::net::registry::Registry;
use crate::net::transport::Transport;
use crate::time::SimTime;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct SimContext {
    /// All vehicles, local and promoted-remote
    pub vehicles: Registry<Vehicle>,
    /// Roadside units and other fixed entities
    pub infrastructure: Registry<RoadsideUnit>,
    /// Road database collaborator
    pub map: Arc<dyn MapService>,
    /// Inter-process transport, absent for pure in-process runs
    pub network: Option<Arc<dyn Transport>>,
    /// Live messages and when tracking of each expires
    tracker: Mutex<HashMap<PacketSequence, SimTime>>,
}

impl SimContext {
    pub fn new(map: Arc<dyn MapService>, network: Option<Arc<dyn Transport>>) -> Self {
        Self {
            vehicles: Registry::new(),
            infrastructure: Registry::new(),
            map,
            network,
            tracker: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a transmitted message until `expiry`
    pub fn track_message(&self, seq: PacketSequence, expiry: SimTime) {
        self.tracker.lock().unwrap().insert(seq, expiry);
    }

    /// Whether a message is still tracked
    pub fn is_tracked(&self, seq: PacketSequence) -> bool {
        self.tracker.lock().unwrap().contains_key(&seq)
    }

    /// Drop tracked messages whose expiry has passed; returns how many
    pub fn expire_tracked(&self, now: SimTime) -> usize {
        let mut tracker = self.tracker.lock().unwrap();
        let before = tracker.len();
        tracker.retain(|_, expiry| *expiry >= now);
        before - tracker.len()
    }

    /// Messages still tracked
    pub fn tracked_len(&self) -> usize {
        self.tracker.lock().unwrap().len()
    }

    /// Clear per-trial state in the tracker
    pub fn reset(&self) {
        self.tracker.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::GridMap;
    use crate::net::packet::Address;

    #[test]
    fn test_tracker_expiry() {
        let ctx = SimContext::new(Arc::new(GridMap::default()), None);
        let seq = PacketSequence::new(Address::from_u32(1), 1);
        ctx.track_message(seq, SimTime::from_secs(15));
        assert!(ctx.is_tracked(seq));

        assert_eq!(ctx.expire_tracked(SimTime::from_secs(10)), 0);
        assert_eq!(ctx.expire_tracked(SimTime::from_secs(16)), 1);
        assert!(!ctx.is_tracked(seq));
    }
}
