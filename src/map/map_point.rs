//! MapPoint - a 3D landmark observed by keyframes.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::frame::Descriptor;

use super::types::{KeyFrameId, MapPointId};

/// A 3D point landmark.
///
/// Tracks its observing keyframes (keyframe id → feature index, bijective per
/// keyframe), quality counters used by culling, and viewing-geometry bounds.
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// Position in world coordinates.
    pub position: Vector3<f64>,

    /// Representative descriptor, refreshed from the best observation.
    pub descriptor: Descriptor,

    /// observations[kf] = i means keyframe kf sees this point at feature i.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit, world frame).
    pub normal: Vector3<f64>,

    /// Minimum distance at which the point is reliably observable.
    pub min_distance: f64,

    /// Maximum distance at which the point is reliably observable.
    pub max_distance: f64,

    /// Times the point fell inside a frame frustum.
    pub visible_count: u32,

    /// Times the point was actually matched.
    pub found_count: u32,

    /// KeyFrame that created this point.
    pub first_kf_id: KeyFrameId,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 1,
            found_count: 1,
            first_kf_id,
            is_bad: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Returns true if the observation existed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn observation_index(&self, kf_id: KeyFrameId) -> Option<usize> {
        self.observations.get(&kf_id).copied()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// found / visible, 1.0 for a point that was never tested.
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

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }
}
