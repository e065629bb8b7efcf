//! KeyFrame - a selected frame promoted to a permanent node of the map.
//!
//! The feature data is immutable after construction; the pose, the landmark
//! association arrays and the covisibility adjacency are maintained by the
//! `Map` container.

use std::collections::HashMap;

use nalgebra::{Matrix3, Vector3};

use crate::frame::{CameraIntrinsics, Descriptor, Frame, LineFeature, PointFeature, ScalePyramid};
use crate::geometry::Pose;

use super::types::{KeyFrameId, MapLineId, MapPointId};

/// Sparse bag-of-words histogram (word id → weight).
pub type BowVector = std::collections::BTreeMap<u32, f64>;

/// A keyframe: features, pose and graph relationships.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// World-to-camera transform.
    pub pose: Pose,

    // Immutable sensor data.
    pub keypoints: Vec<PointFeature>,
    pub descriptors: Vec<Descriptor>,
    pub keylines: Vec<LineFeature>,
    pub line_descriptors: Vec<Descriptor>,
    pub intrinsics: CameraIntrinsics,
    pub pyramid: ScalePyramid,
    pub line_pyramid: ScalePyramid,

    /// Feature index → observed MapPoint.
    pub map_point_ids: Vec<Option<MapPointId>>,

    /// Keyline index → observed MapLine.
    pub map_line_ids: Vec<Option<MapLineId>>,

    /// Bag-of-words histogram for the place-recognition collaborator.
    pub bow_vector: Option<BowVector>,

    /// Covisibility adjacency: connected keyframe → shared landmark count.
    covisibility_weights: HashMap<KeyFrameId, usize>,
    /// Cached weight-ordered adjacency, rebuilt lazily.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,
    covisibility_dirty: bool,

    pub is_bad: bool,
}

impl KeyFrame {
    pub fn new(id: KeyFrameId, pose: Pose, frame: Frame) -> Self {
        let n_points = frame.keypoints.len();
        let n_lines = frame.keylines.len();
        Self {
            id,
            pose,
            keypoints: frame.keypoints,
            descriptors: frame.descriptors,
            keylines: frame.keylines,
            line_descriptors: frame.line_descriptors,
            intrinsics: frame.intrinsics,
            pyramid: frame.pyramid,
            line_pyramid: frame.line_pyramid,
            map_point_ids: vec![None; n_points],
            map_line_ids: vec![None; n_lines],
            bow_vector: None,
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            covisibility_dirty: false,
            is_bad: false,
        }
    }

    /// Camera centre in world coordinates.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.camera_center()
    }

    /// World-to-camera rotation.
    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.pose.rotation
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    pub fn num_lines(&self) -> usize {
        self.keylines.len()
    }

    // Map point associations.

    pub fn map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        if feature_idx >= self.map_point_ids.len() {
            return None;
        }
        self.map_point_ids[feature_idx].replace(mp_id)
    }

    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    pub fn map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // Map line associations.

    pub fn map_line(&self, line_idx: usize) -> Option<MapLineId> {
        self.map_line_ids.get(line_idx).copied().flatten()
    }

    pub fn set_map_line(&mut self, line_idx: usize, ml_id: MapLineId) -> Option<MapLineId> {
        if line_idx >= self.map_line_ids.len() {
            return None;
        }
        self.map_line_ids[line_idx].replace(ml_id)
    }

    pub fn erase_map_line(&mut self, line_idx: usize) -> Option<MapLineId> {
        self.map_line_ids.get_mut(line_idx)?.take()
    }

    pub fn map_line_indices(&self) -> impl Iterator<Item = (usize, MapLineId)> + '_ {
        self.map_line_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, ml)| ml.map(|id| (idx, id)))
    }

    pub fn num_map_lines(&self) -> usize {
        self.map_line_ids.iter().filter(|ml| ml.is_some()).count()
    }

    // Covisibility graph.

    pub fn set_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.covisibility_dirty = true;
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.covisibility_dirty = true;
        }
    }

    pub fn covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    pub fn covisibles(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.covisibility_weights.keys()
    }

    /// The n best covisible keyframes, most shared landmarks first.
    pub fn best_covisibles(&mut self, n: usize) -> Vec<KeyFrameId> {
        self.ensure_ordered_covisibles();
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Weight-ordered covisibles without touching the cache.
    pub fn best_covisibles_readonly(&self, n: usize) -> Vec<KeyFrameId> {
        let mut all: Vec<(KeyFrameId, usize)> = self
            .covisibility_weights
            .iter()
            .map(|(&id, &w)| (id, w))
            .collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        all.into_iter().take(n).map(|(id, _)| id).collect()
    }

    fn ensure_ordered_covisibles(&mut self) {
        if !self.covisibility_dirty {
            return;
        }
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(&id, &w)| (id, w))
            .collect();
        // Tie-break on id so the ordering is deterministic.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.covisibility_dirty = false;
    }

    // Spatial queries.

    /// Indices of keypoints within `radius` of (u, v), optionally filtered
    /// by pyramid level.
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;
        self.keypoints
            .iter()
            .enumerate()
            .filter(|(_, kp)| {
                if let Some(min) = min_level {
                    if kp.octave < min {
                        return false;
                    }
                }
                if let Some(max) = max_level {
                    if kp.octave > max {
                        return false;
                    }
                }
                let du = kp.uv.x - u;
                let dv = kp.uv.y - v;
                du * du + dv * dv <= radius_sq
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of keylines whose midpoint lies within `radius` of (u, v) and
    /// whose orientation differs by at most `max_angle_diff` (mod π).
    pub fn lines_in_area(&self, u: f64, v: f64, radius: f64, angle: f64, max_angle_diff: f64) -> Vec<usize> {
        let radius_sq = radius * radius;
        self.keylines
            .iter()
            .enumerate()
            .filter(|(_, kl)| {
                let mid = kl.midpoint();
                let du = mid.x - u;
                let dv = mid.y - v;
                if du * du + dv * dv > radius_sq {
                    return false;
                }
                let diff = (kl.angle - angle).rem_euclid(std::f64::consts::PI);
                diff.min(std::f64::consts::PI - diff) <= max_angle_diff
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ScalePyramid;
    use nalgebra::Vector2;

    fn empty_frame() -> Frame {
        Frame::new(
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0),
            ScalePyramid::default(),
            ScalePyramid::default(),
        )
        .unwrap()
    }

    fn keyframe_with_features(id: u64, n: usize) -> KeyFrame {
        let mut kf = KeyFrame::new(KeyFrameId(id), Pose::identity(), empty_frame());
        kf.map_point_ids = vec![None; n];
        kf.map_line_ids = vec![None; n];
        kf
    }

    #[test]
    fn map_point_association() {
        let mut kf = keyframe_with_features(1, 10);

        kf.set_map_point(3, MapPointId(100));
        assert_eq!(kf.map_point(3), Some(MapPointId(100)));
        assert_eq!(kf.map_point(4), None);
        assert_eq!(kf.num_map_points(), 1);

        let prev = kf.set_map_point(3, MapPointId(200));
        assert_eq!(prev, Some(MapPointId(100)));

        let erased = kf.erase_map_point(3);
        assert_eq!(erased, Some(MapPointId(200)));
        assert_eq!(kf.map_point(3), None);
    }

    #[test]
    fn map_line_association() {
        let mut kf = keyframe_with_features(1, 6);
        kf.set_map_line(2, MapLineId(9));
        assert_eq!(kf.map_line(2), Some(MapLineId(9)));
        assert_eq!(kf.num_map_lines(), 1);
        assert_eq!(kf.erase_map_line(2), Some(MapLineId(9)));
        assert_eq!(kf.num_map_lines(), 0);
    }

    #[test]
    fn covisibility_ordering_and_no_self_edge() {
        let mut kf = keyframe_with_features(1, 0);
        kf.set_covisibility(KeyFrameId(2), 50);
        kf.set_covisibility(KeyFrameId(3), 100);
        kf.set_covisibility(KeyFrameId(4), 25);
        kf.set_covisibility(KeyFrameId(1), 999); // self, ignored

        assert_eq!(kf.covisibility_weight(KeyFrameId(1)), 0);
        assert_eq!(kf.covisibility_weight(KeyFrameId(3)), 100);

        let best = kf.best_covisibles(2);
        assert_eq!(best, vec![KeyFrameId(3), KeyFrameId(2)]);

        kf.erase_covisibility(KeyFrameId(3));
        let best = kf.best_covisibles(10);
        assert_eq!(best, vec![KeyFrameId(2), KeyFrameId(4)]);
    }

    #[test]
    fn features_in_area_respects_radius_and_level() {
        let mut frame = empty_frame();
        frame.keypoints = vec![
            PointFeature {
                uv: Vector2::new(100.0, 100.0),
                octave: 0,
            },
            PointFeature {
                uv: Vector2::new(104.0, 103.0),
                octave: 2,
            },
            PointFeature {
                uv: Vector2::new(200.0, 100.0),
                octave: 0,
            },
        ];
        frame.descriptors = vec![Descriptor::default(); 3];
        let kf = KeyFrame::new(KeyFrameId(0), Pose::identity(), frame);

        let hits = kf.features_in_area(101.0, 101.0, 10.0, None, None);
        assert_eq!(hits, vec![0, 1]);

        let hits = kf.features_in_area(101.0, 101.0, 10.0, None, Some(1));
        assert_eq!(hits, vec![0]);
    }

    #[test]
    fn lines_in_area_filters_by_angle() {
        let mut frame = empty_frame();
        frame.keylines = vec![
            LineFeature::from_endpoints(Vector2::new(90.0, 100.0), Vector2::new(110.0, 100.0), 0),
            LineFeature::from_endpoints(Vector2::new(100.0, 90.0), Vector2::new(100.0, 110.0), 0),
        ];
        frame.line_descriptors = vec![Descriptor::default(); 2];
        let kf = KeyFrame::new(KeyFrameId(0), Pose::identity(), frame);

        // Horizontal query near both midpoints only keeps the horizontal line.
        let hits = kf.lines_in_area(100.0, 100.0, 5.0, 0.0, 0.3);
        assert_eq!(hits, vec![0]);
        // Vertical query keeps the vertical line.
        let hits = kf.lines_in_area(100.0, 100.0, 5.0, std::f64::consts::FRAC_PI_2, 0.3);
        assert_eq!(hits, vec![1]);
    }
}
