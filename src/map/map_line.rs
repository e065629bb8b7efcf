//! MapLine - a 3D line segment landmark observed by keyframes.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::frame::Descriptor;

use super::types::{KeyFrameId, MapLineId};

/// A 3D line segment landmark with the same bookkeeping as a MapPoint.
#[derive(Debug, Clone)]
pub struct MapLine {
    pub id: MapLineId,

    /// Segment start point, world coordinates.
    pub start: Vector3<f64>,

    /// Segment end point, world coordinates.
    pub end: Vector3<f64>,

    pub descriptor: Descriptor,

    /// observations[kf] = i means keyframe kf sees this line at keyline i.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction of the midpoint (unit, world frame).
    pub normal: Vector3<f64>,

    pub visible_count: u32,
    pub found_count: u32,

    pub first_kf_id: KeyFrameId,

    pub is_bad: bool,
}

impl MapLine {
    pub fn new(
        id: MapLineId,
        start: Vector3<f64>,
        end: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            start,
            end,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            visible_count: 1,
            found_count: 1,
            first_kf_id,
            is_bad: false,
        }
    }

    pub fn midpoint(&self) -> Vector3<f64> {
        (self.start + self.end) * 0.5
    }

    pub fn direction(&self) -> Vector3<f64> {
        self.end - self.start
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, line_idx: usize) {
        self.observations.insert(kf_id, line_idx);
    }

    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn observation_index(&self, kf_id: KeyFrameId) -> Option<usize> {
        self.observations.get(&kf_id).copied()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_and_direction() {
        let ml = MapLine::new(
            MapLineId(0),
            Vector3::new(1.0, 0.0, 4.0),
            Vector3::new(3.0, 2.0, 6.0),
            Descriptor::default(),
            KeyFrameId(0),
        );
        assert_eq!(ml.midpoint(), Vector3::new(2.0, 1.0, 5.0));
        assert_eq!(ml.direction(), Vector3::new(2.0, 2.0, 2.0));
    }

    #[test]
    fn observation_bookkeeping() {
        let mut ml = MapLine::new(
            MapLineId(0),
            Vector3::zeros(),
            Vector3::x(),
            Descriptor::default(),
            KeyFrameId(0),
        );
        ml.add_observation(KeyFrameId(3), 7);
        assert_eq!(ml.observation_index(KeyFrameId(3)), Some(7));
        assert!(ml.erase_observation(KeyFrameId(3)));
        assert_eq!(ml.num_observations(), 0);
    }
}
