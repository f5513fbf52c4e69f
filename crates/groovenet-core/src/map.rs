//! Map/routing collaborator
//!
//! The road database is an external collaborator: the core only asks
//! narrow questions (which road is under this position, what does a
//! record cost, what is the record path between two points) and never
//! reimplements routing. [`GridMap`] is a straight-line stand-in used
//! by tests and demo scenarios.

use crate::net::packet::Position;

/// Result of snapping a position onto the road graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoadFix {
    /// Road record id
    pub record_id: u32,
    /// Index of the nearest shape point on the record
    pub shape_point: u32,
    /// Progress along the record, 0.0 - 1.0
    pub progress: f32,
}

/// Black-box interface to the road database.
pub trait MapService: Send + Sync {
    /// Snap a position to the nearest road record, if any
    fn position_to_road(&self, pos: Position) -> Option<RoadFix>;

    /// Traversal cost of a record (seconds)
    fn road_cost(&self, record_id: u32) -> f32;

    /// Record ids along the cheapest path between two positions
    fn shortest_path(&self, from: Position, to: Position) -> Vec<u32>;

    /// Whether a record is one-way
    fn is_one_way(&self, record_id: u32) -> bool;

    /// Whether a record id names a road at all
    fn is_road(&self, record_id: u32) -> bool;
}

/// Trivial map: a square grid of pseudo-records, every position snaps
/// to the cell under it. Good enough for kinematics tests; real road
/// topology lives outside the core.
#[derive(Debug, Clone)]
pub struct GridMap {
    /// Cell size in microdegrees
    cell_udeg: i32,
}

impl GridMap {
    pub fn new(cell_udeg: i32) -> Self {
        Self {
            cell_udeg: cell_udeg.max(1),
        }
    }

    fn cell_of(&self, pos: Position) -> u32 {
        let x = (pos.lon_udeg / self.cell_udeg) & 0xFFFF;
        let y = (pos.lat_udeg / self.cell_udeg) & 0xFFFF;
        ((y as u32) << 16) | (x as u32)
    }
}

impl Default for GridMap {
    fn default() -> Self {
        // Roughly 100 m cells at mid latitudes
        Self::new(1_000)
    }
}

impl MapService for GridMap {
    fn position_to_road(&self, pos: Position) -> Option<RoadFix> {
        Some(RoadFix {
            record_id: self.cell_of(pos),
            shape_point: 0,
            progress: 0.0,
        })
    }

    fn road_cost(&self, _record_id: u32) -> f32 {
        1.0
    }

    fn shortest_path(&self, from: Position, to: Position) -> Vec<u32> {
        let a = self.cell_of(from);
        let b = self.cell_of(to);
        if a == b {
            vec![a]
        } else {
            vec![a, b]
        }
    }

    fn is_one_way(&self, _record_id: u32) -> bool {
        false
    }

    fn is_road(&self, _record_id: u32) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_map_snaps_consistently() {
        let map = GridMap::default();
        let pos = Position::from_degrees(40.4430, -79.9430);
        let a = map.position_to_road(pos).unwrap();
        let b = map.position_to_road(pos).unwrap();
        assert_eq!(a.record_id, b.record_id);
        assert!(map.is_road(a.record_id));
    }

    #[test]
    fn test_grid_map_path_endpoints() {
        let map = GridMap::default();
        let from = Position::from_degrees(40.0, -80.0);
        let to = Position::from_degrees(40.1, -80.0);
        let path = map.shortest_path(from, to);
        assert!(!path.is_empty());
    }
}
