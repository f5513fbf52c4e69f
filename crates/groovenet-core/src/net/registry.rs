//! Entity registries
//!
//! Central lookup from entity address to the shared handle for that
//! entity. The registry mutex only guards the map itself; entity state
//! has its own lock, and callers take the two in that order (map, then
//! entity) so the single dispatch thread and the transport threads
//! cannot deadlock. Handles are `Arc`s: removing an entry never
//! invalidates a handle another thread is still using.

use crate::error::ConfigError;
use crate::net::packet::{Address, Position};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Anything the registry can place on the map.
pub trait Locatable {
    /// Current geographic position
    fn position(&self) -> Position;

    /// Whether the entity currently participates in the simulation
    fn is_active(&self) -> bool;
}

/// Address-keyed registry of shared entity handles.
#[derive(Debug, Default)]
pub struct Registry<T> {
    inner: Mutex<HashMap<Address, Arc<Mutex<T>>>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register an entity under its address. Addresses are unique for
    /// the lifetime of the simulation.
    pub fn insert(&self, addr: Address, entity: T) -> Result<Arc<Mutex<T>>, ConfigError> {
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(&addr) {
            return Err(ConfigError::DuplicateAddress(addr));
        }
        let handle = Arc::new(Mutex::new(entity));
        map.insert(addr, Arc::clone(&handle));
        Ok(handle)
    }

    /// Shared handle for an address, if registered
    pub fn get(&self, addr: Address) -> Option<Arc<Mutex<T>>> {
        self.inner.lock().unwrap().get(&addr).cloned()
    }

    /// Remove an entry. Existing handles stay valid.
    pub fn remove(&self, addr: Address) -> Option<Arc<Mutex<T>>> {
        self.inner.lock().unwrap().remove(&addr)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.inner.lock().unwrap().contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// All registered addresses
    pub fn addresses(&self) -> Vec<Address> {
        self.inner.lock().unwrap().keys().copied().collect()
    }

    /// Snapshot of all entries. The map lock is released before the
    /// caller touches any entity.
    pub fn snapshot(&self) -> Vec<(Address, Arc<Mutex<T>>)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(a, h)| (*a, Arc::clone(h)))
            .collect()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

impl<T: Locatable> Registry<T> {
    /// Active entities within `range_m` of `center`, excluding `exclude`.
    /// Entities are locked one at a time, after the map lock is dropped.
    pub fn within_range(
        &self,
        center: Position,
        range_m: f64,
        exclude: Address,
    ) -> Vec<(Address, Arc<Mutex<T>>)> {
        self.snapshot()
            .into_iter()
            .filter(|(addr, handle)| {
                if *addr == exclude {
                    return false;
                }
                let entity = handle.lock().unwrap();
                entity.is_active() && entity.position().distance_m(&center) <= range_m
            })
            .collect()
    }

    /// Closest active entity to `center`, excluding `exclude`
    pub fn nearest(&self, center: Position, exclude: Address) -> Option<(Address, Arc<Mutex<T>>)> {
        let mut best: Option<(f64, Address, Arc<Mutex<T>>)> = None;
        for (addr, handle) in self.snapshot() {
            if addr == exclude {
                continue;
            }
            let dist = {
                let entity = handle.lock().unwrap();
                if !entity.is_active() {
                    continue;
                }
                entity.position().distance_m(&center)
            };
            if best.as_ref().map_or(true, |(d, _, _)| dist < *d) {
                best = Some((dist, addr, handle));
            }
        }
        best.map(|(_, addr, handle)| (addr, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Beacon {
        pos: Position,
        active: bool,
    }

    impl Locatable for Beacon {
        fn position(&self) -> Position {
            self.pos
        }
        fn is_active(&self) -> bool {
            self.active
        }
    }

    fn beacon(bearing: f64, dist: f64, active: bool) -> Beacon {
        Beacon {
            pos: Position::from_degrees(40.0, -80.0).offset(bearing, dist),
            active,
        }
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let reg = Registry::new();
        let addr = Address::from_u32(7);
        reg.insert(addr, beacon(0.0, 0.0, true)).unwrap();
        assert!(matches!(
            reg.insert(addr, beacon(0.0, 0.0, true)),
            Err(ConfigError::DuplicateAddress(a)) if a == addr
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_within_range_filters() {
        let reg = Registry::new();
        let center = Position::from_degrees(40.0, -80.0);
        let near = Address::from_u32(1);
        let far = Address::from_u32(2);
        let inactive = Address::from_u32(3);
        let me = Address::from_u32(4);

        reg.insert(near, beacon(90.0, 100.0, true)).unwrap();
        reg.insert(far, beacon(90.0, 5_000.0, true)).unwrap();
        reg.insert(inactive, beacon(90.0, 100.0, false)).unwrap();
        reg.insert(me, beacon(0.0, 0.0, true)).unwrap();

        let hits = reg.within_range(center, 200.0, me);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, near);
    }

    #[test]
    fn test_nearest_skips_self_and_inactive() {
        let reg = Registry::new();
        let center = Position::from_degrees(40.0, -80.0);
        let me = Address::from_u32(1);
        let close_but_inactive = Address::from_u32(2);
        let closest_active = Address::from_u32(3);
        let farther = Address::from_u32(4);

        reg.insert(me, beacon(0.0, 0.0, true)).unwrap();
        reg.insert(close_but_inactive, beacon(90.0, 10.0, false)).unwrap();
        reg.insert(closest_active, beacon(90.0, 50.0, true)).unwrap();
        reg.insert(farther, beacon(90.0, 300.0, true)).unwrap();

        let (addr, _) = reg.nearest(center, me).unwrap();
        assert_eq!(addr, closest_active);

        let empty: Registry<Beacon> = Registry::new();
        assert!(empty.nearest(center, me).is_none());
    }

    #[test]
    fn test_handle_survives_removal() {
        let reg = Registry::new();
        let addr = Address::from_u32(9);
        let handle = reg.insert(addr, beacon(0.0, 0.0, true)).unwrap();
        reg.remove(addr);
        assert!(!reg.contains(addr));
        assert!(handle.lock().unwrap().is_active());
    }
}
