//! The shared map: keyframes, point and line landmarks, covisibility.

#[allow(clippy::module_inception)]
mod map;

pub mod keyframe;
pub mod map_line;
pub mod map_point;
pub mod types;

use std::sync::Arc;

use parking_lot::RwLock;

pub use keyframe::{BowVector, KeyFrame};
pub use map::Map;
pub use map_line::MapLine;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapLineId, MapPointId};

/// The map behind its map-wide lock, shared between the tracking front-end,
/// the local mapper and the loop closer.
pub type SharedMap = Arc<RwLock<Map>>;

/// Convenience constructor for an empty shared map.
pub fn shared_map() -> SharedMap {
    Arc::new(RwLock::new(Map::new()))
}
