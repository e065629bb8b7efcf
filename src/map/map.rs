//! Map - container for keyframes, map points and map lines.
//!
//! The map owns two id-addressed landmark arenas plus the keyframe arena and
//! maintains every cross-reference: bidirectional observation bookkeeping,
//! the covisibility graph, landmark merges and full removals. Structural
//! mutation goes through `&mut Map`, which the embedder serializes behind the
//! map-wide lock (`SharedMap`).

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::frame::{Descriptor, Frame};
use crate::geometry::Pose;

use super::keyframe::KeyFrame;
use super::map_line::MapLine;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapLineId, MapPointId};

/// The SLAM map.
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,
    map_lines: HashMap<MapLineId, MapLine>,

    next_kf_id: u64,
    next_mp_id: u64,
    next_ml_id: u64,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            map_lines: HashMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            next_ml_id: 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // KeyFrames
    // ─────────────────────────────────────────────────────────────────────

    /// Create a keyframe from a frame bundle and insert it.
    pub fn create_keyframe(&mut self, pose: Pose, frame: Frame) -> KeyFrameId {
        let id = KeyFrameId(self.next_kf_id);
        self.next_kf_id += 1;
        self.keyframes.insert(id, KeyFrame::new(id, pose, frame));
        id
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.keyframes.keys()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// Flag a keyframe bad and purge it: observations, covisibility edges
    /// and finally the arena entry.
    pub fn erase_keyframe(&mut self, kf_id: KeyFrameId) {
        let (point_obs, line_obs, covisibles) = match self.keyframes.get_mut(&kf_id) {
            Some(kf) => {
                kf.set_bad();
                (
                    kf.map_point_indices().collect::<Vec<_>>(),
                    kf.map_line_indices().collect::<Vec<_>>(),
                    kf.covisibles().copied().collect::<Vec<_>>(),
                )
            }
            None => return,
        };

        for (_, mp_id) in point_obs {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.erase_observation(kf_id);
            }
        }
        for (_, ml_id) in line_obs {
            if let Some(ml) = self.map_lines.get_mut(&ml_id) {
                ml.erase_observation(kf_id);
            }
        }
        for other in covisibles {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }

        self.keyframes.remove(&kf_id);
    }

    // ─────────────────────────────────────────────────────────────────────
    // MapPoints
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, first_kf_id));
        id
    }

    pub fn map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Flag a map point bad and purge it from every observing keyframe and
    /// the arena.
    pub fn erase_map_point(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                mp.set_bad();
                mp.observations.iter().map(|(&k, &i)| (k, i)).collect()
            }
            None => return,
        };

        for (kf_id, idx) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                // Only clear the slot if it still references this point.
                if kf.map_point(idx) == Some(mp_id) {
                    kf.erase_map_point(idx);
                }
            }
        }

        self.map_points.remove(&mp_id);
    }

    // ─────────────────────────────────────────────────────────────────────
    // MapLines
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_map_line(
        &mut self,
        start: Vector3<f64>,
        end: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> MapLineId {
        let id = MapLineId(self.next_ml_id);
        self.next_ml_id += 1;
        self.map_lines
            .insert(id, MapLine::new(id, start, end, descriptor, first_kf_id));
        id
    }

    pub fn map_line(&self, id: MapLineId) -> Option<&MapLine> {
        self.map_lines.get(&id)
    }

    pub fn map_line_mut(&mut self, id: MapLineId) -> Option<&mut MapLine> {
        self.map_lines.get_mut(&id)
    }

    pub fn map_lines(&self) -> impl Iterator<Item = &MapLine> {
        self.map_lines.values()
    }

    pub fn num_map_lines(&self) -> usize {
        self.map_lines.len()
    }

    pub fn erase_map_line(&mut self, ml_id: MapLineId) {
        let observations: Vec<(KeyFrameId, usize)> = match self.map_lines.get_mut(&ml_id) {
            Some(ml) => {
                ml.set_bad();
                ml.observations.iter().map(|(&k, &i)| (k, i)).collect()
            }
            None => return,
        };

        for (kf_id, idx) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if kf.map_line(idx) == Some(ml_id) {
                    kf.erase_map_line(idx);
                }
            }
        }

        self.map_lines.remove(&ml_id);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Associations
    // ─────────────────────────────────────────────────────────────────────

    /// Bind keyframe feature `feature_idx` to a map point, both directions.
    pub fn associate_point(
        &mut self,
        kf_id: KeyFrameId,
        feature_idx: usize,
        mp_id: MapPointId,
    ) -> bool {
        if !self.keyframes.contains_key(&kf_id) {
            return false;
        }
        match self.map_points.get_mut(&mp_id) {
            Some(mp) if !mp.is_bad => mp.add_observation(kf_id, feature_idx),
            _ => return false,
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }
        true
    }

    pub fn disassociate_point(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get_mut(&kf_id)?.erase_map_point(feature_idx)?;
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id);
        }
        Some(mp_id)
    }

    /// Bind keyframe keyline `line_idx` to a map line, both directions.
    pub fn associate_line(&mut self, kf_id: KeyFrameId, line_idx: usize, ml_id: MapLineId) -> bool {
        if !self.keyframes.contains_key(&kf_id) {
            return false;
        }
        match self.map_lines.get_mut(&ml_id) {
            Some(ml) if !ml.is_bad => ml.add_observation(kf_id, line_idx),
            _ => return false,
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_line(line_idx, ml_id);
        }
        true
    }

    pub fn disassociate_line(&mut self, kf_id: KeyFrameId, line_idx: usize) -> Option<MapLineId> {
        let ml_id = self.keyframes.get_mut(&kf_id)?.erase_map_line(line_idx)?;
        if let Some(ml) = self.map_lines.get_mut(&ml_id) {
            ml.erase_observation(kf_id);
        }
        Some(ml_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Covisibility
    // ─────────────────────────────────────────────────────────────────────

    /// Recompute the covisibility edges of a keyframe from its landmark
    /// observations. Edges are symmetric; the weight is the number of
    /// commonly observed points and lines. Stale edges are dropped on both
    /// sides.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();

        let (point_ids, line_ids, old_edges) = match self.keyframes.get(&kf_id) {
            Some(kf) => (
                kf.map_point_indices().map(|(_, id)| id).collect::<Vec<_>>(),
                kf.map_line_indices().map(|(_, id)| id).collect::<Vec<_>>(),
                kf.covisibles().copied().collect::<Vec<_>>(),
            ),
            None => return,
        };

        for mp_id in point_ids {
            if let Some(mp) = self.map_points.get(&mp_id) {
                if mp.is_bad {
                    continue;
                }
                for &other in mp.observations.keys() {
                    if other != kf_id {
                        *counter.entry(other).or_default() += 1;
                    }
                }
            }
        }
        for ml_id in line_ids {
            if let Some(ml) = self.map_lines.get(&ml_id) {
                if ml.is_bad {
                    continue;
                }
                for &other in ml.observations.keys() {
                    if other != kf_id {
                        *counter.entry(other).or_default() += 1;
                    }
                }
            }
        }

        for other in old_edges {
            if !counter.contains_key(&other) {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_covisibility(other);
                }
                if let Some(other_kf) = self.keyframes.get_mut(&other) {
                    other_kf.erase_covisibility(kf_id);
                }
            }
        }

        for (other, weight) in counter {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.set_covisibility(other, weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.set_covisibility(kf_id, weight);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Merging
    // ─────────────────────────────────────────────────────────────────────

    /// Merge `goner` into `keeper`: transfer observations and counters, then
    /// purge the loser. Observation slots that would collide are cleared.
    pub fn merge_map_points(&mut self, keeper_id: MapPointId, goner_id: MapPointId) -> bool {
        if keeper_id == goner_id {
            return false;
        }
        if !self.map_points.contains_key(&keeper_id) {
            return false;
        }

        let (goner_obs, visible, found) = match self.map_points.get_mut(&goner_id) {
            Some(goner) => {
                goner.set_bad();
                (
                    goner.observations.iter().map(|(&k, &i)| (k, i)).collect::<Vec<_>>(),
                    goner.visible_count,
                    goner.found_count,
                )
            }
            None => return false,
        };

        for (kf_id, idx) in goner_obs {
            let keeper_sees = self
                .map_points
                .get(&keeper_id)
                .map_or(false, |mp| mp.observations.contains_key(&kf_id));

            if keeper_sees {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    if kf.map_point(idx) == Some(goner_id) {
                        kf.erase_map_point(idx);
                    }
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_map_point(idx, keeper_id);
                }
                if let Some(keeper) = self.map_points.get_mut(&keeper_id) {
                    keeper.add_observation(kf_id, idx);
                }
            }
        }

        if let Some(keeper) = self.map_points.get_mut(&keeper_id) {
            keeper.increase_visible(visible);
            keeper.increase_found(found);
        }
        self.map_points.remove(&goner_id);

        self.compute_distinctive_point_descriptor(keeper_id);
        self.update_point_normal_and_depth(keeper_id);
        true
    }

    /// Line mirror of `merge_map_points`.
    pub fn merge_map_lines(&mut self, keeper_id: MapLineId, goner_id: MapLineId) -> bool {
        if keeper_id == goner_id {
            return false;
        }
        if !self.map_lines.contains_key(&keeper_id) {
            return false;
        }

        let (goner_obs, visible, found) = match self.map_lines.get_mut(&goner_id) {
            Some(goner) => {
                goner.set_bad();
                (
                    goner.observations.iter().map(|(&k, &i)| (k, i)).collect::<Vec<_>>(),
                    goner.visible_count,
                    goner.found_count,
                )
            }
            None => return false,
        };

        for (kf_id, idx) in goner_obs {
            let keeper_sees = self
                .map_lines
                .get(&keeper_id)
                .map_or(false, |ml| ml.observations.contains_key(&kf_id));

            if keeper_sees {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    if kf.map_line(idx) == Some(goner_id) {
                        kf.erase_map_line(idx);
                    }
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_map_line(idx, keeper_id);
                }
                if let Some(keeper) = self.map_lines.get_mut(&keeper_id) {
                    keeper.add_observation(kf_id, idx);
                }
            }
        }

        if let Some(keeper) = self.map_lines.get_mut(&keeper_id) {
            keeper.increase_visible(visible);
            keeper.increase_found(found);
        }
        self.map_lines.remove(&goner_id);

        self.compute_distinctive_line_descriptor(keeper_id);
        self.update_line_average_direction(keeper_id);
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Landmark maintenance
    // ─────────────────────────────────────────────────────────────────────

    fn distinctive_descriptor(descriptors: &[Descriptor]) -> Option<Descriptor> {
        if descriptors.is_empty() {
            return None;
        }
        let n = descriptors.len();
        if n == 1 {
            return Some(descriptors[0]);
        }

        // Pick the descriptor minimizing the median distance to the rest.
        let mut best: Option<(u32, Descriptor)> = None;
        for (i, candidate) in descriptors.iter().enumerate() {
            let mut dists: Vec<u32> = descriptors
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, d)| candidate.distance(d))
                .collect();
            dists.sort_unstable();
            let median = dists[(dists.len() - 1) / 2];
            if best.map_or(true, |(m, _)| median < m) {
                best = Some((median, *candidate));
            }
        }
        best.map(|(_, d)| d)
    }

    /// Refresh the representative descriptor of a map point from its
    /// observations. Returns true when the descriptor changed.
    pub fn compute_distinctive_point_descriptor(&mut self, mp_id: MapPointId) -> bool {
        let descriptors: Vec<Descriptor> = match self.map_points.get(&mp_id) {
            Some(mp) => mp
                .observations
                .iter()
                .filter_map(|(&kf_id, &idx)| {
                    self.keyframes
                        .get(&kf_id)
                        .filter(|kf| !kf.is_bad)
                        .and_then(|kf| kf.descriptors.get(idx))
                        .copied()
                })
                .collect(),
            None => return false,
        };

        let Some(best) = Self::distinctive_descriptor(&descriptors) else {
            return false;
        };
        let mp = match self.map_points.get_mut(&mp_id) {
            Some(mp) => mp,
            None => return false,
        };
        let changed = mp.descriptor != best;
        mp.descriptor = best;
        changed
    }

    /// Refresh the representative descriptor of a map line.
    pub fn compute_distinctive_line_descriptor(&mut self, ml_id: MapLineId) -> bool {
        let descriptors: Vec<Descriptor> = match self.map_lines.get(&ml_id) {
            Some(ml) => ml
                .observations
                .iter()
                .filter_map(|(&kf_id, &idx)| {
                    self.keyframes
                        .get(&kf_id)
                        .filter(|kf| !kf.is_bad)
                        .and_then(|kf| kf.line_descriptors.get(idx))
                        .copied()
                })
                .collect(),
            None => return false,
        };

        let Some(best) = Self::distinctive_descriptor(&descriptors) else {
            return false;
        };
        let ml = match self.map_lines.get_mut(&ml_id) {
            Some(ml) => ml,
            None => return false,
        };
        let changed = ml.descriptor != best;
        ml.descriptor = best;
        changed
    }

    /// Recompute a map point's mean viewing direction and its observable
    /// distance bounds from the scale pyramid of its observers.
    pub fn update_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let (position, first_kf, observers) = match self.map_points.get(&mp_id) {
            Some(mp) => (
                mp.position,
                mp.first_kf_id,
                mp.observations
                    .iter()
                    .filter_map(|(&kf_id, &idx)| {
                        self.keyframes.get(&kf_id).map(|kf| {
                            let scale_range = kf
                                .pyramid
                                .scale_factor
                                .powi(kf.pyramid.n_levels() as i32 - 1);
                            let level_scale = kf
                                .keypoints
                                .get(idx)
                                .map(|kp| kf.pyramid.scale(kp.octave))
                                .unwrap_or(1.0);
                            (kf_id, kf.camera_center(), scale_range, level_scale)
                        })
                    })
                    .collect::<Vec<_>>(),
            ),
            None => return,
        };

        if observers.is_empty() {
            return;
        }

        let mut normal_sum = Vector3::zeros();
        let mut n_dirs = 0usize;
        for (_, center, _, _) in &observers {
            let dir = position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n_dirs += 1;
            }
        }

        // Distance bounds anchor on the creating observation when it is
        // still alive, the lowest observer id otherwise.
        let &(_, center, scale_range, level_scale) = observers
            .iter()
            .find(|(id, _, _, _)| *id == first_kf)
            .unwrap_or_else(|| {
                observers
                    .iter()
                    .min_by_key(|(id, _, _, _)| *id)
                    .expect("observers is non-empty")
            });
        let dist = (position - center).norm();
        let max_distance = dist * level_scale;
        let min_distance = max_distance / scale_range;

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            if n_dirs > 0 {
                let norm = normal_sum.norm();
                if norm > 1e-10 {
                    mp.normal = normal_sum / norm;
                }
            }
            mp.min_distance = min_distance;
            mp.max_distance = max_distance;
        }
    }

    /// Recompute a map line's mean viewing direction (of its midpoint).
    pub fn update_line_average_direction(&mut self, ml_id: MapLineId) {
        let (midpoint, centers) = match self.map_lines.get(&ml_id) {
            Some(ml) => (
                ml.midpoint(),
                ml.observations
                    .keys()
                    .filter_map(|kf_id| self.keyframes.get(kf_id).map(|kf| kf.camera_center()))
                    .collect::<Vec<_>>(),
            ),
            None => return,
        };

        let mut normal_sum = Vector3::zeros();
        for center in &centers {
            let dir = midpoint - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
            }
        }

        if let Some(ml) = self.map_lines.get_mut(&ml_id) {
            let norm = normal_sum.norm();
            if norm > 1e-10 {
                ml.normal = normal_sum / norm;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Median depth of the map points observed by a keyframe, in its camera
    /// frame: the element at rank (n-1)/q of the sorted depths.
    pub fn scene_median_depth(&self, kf_id: KeyFrameId, q: usize) -> Option<f64> {
        let kf = self.keyframes.get(&kf_id)?;
        let mut depths: Vec<f64> = kf
            .map_point_indices()
            .filter_map(|(_, mp_id)| self.map_points.get(&mp_id))
            .filter(|mp| !mp.is_bad)
            .map(|mp| kf.pose.transform(&mp.position).z)
            .collect();

        if depths.is_empty() {
            return None;
        }
        depths.sort_by(f64::total_cmp);
        Some(depths[(depths.len() - 1) / q])
    }

}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("num_map_lines", &self.map_lines.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CameraIntrinsics, ScalePyramid};
    use approx::assert_relative_eq;

    fn frame_with(n_points: usize, n_lines: usize) -> Frame {
        use crate::frame::{LineFeature, PointFeature};
        use nalgebra::Vector2;

        let keypoints = (0..n_points)
            .map(|i| PointFeature {
                uv: Vector2::new(10.0 * i as f64, 5.0 * i as f64),
                octave: 0,
            })
            .collect::<Vec<_>>();
        let keylines = (0..n_lines)
            .map(|i| {
                LineFeature::from_endpoints(
                    Vector2::new(10.0 * i as f64, 0.0),
                    Vector2::new(10.0 * i as f64 + 20.0, 30.0),
                    0,
                )
            })
            .collect::<Vec<_>>();
        Frame::new(
            keypoints,
            vec![Descriptor::default(); n_points],
            keylines,
            vec![Descriptor::default(); n_lines],
            CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0),
            ScalePyramid::default(),
            ScalePyramid::default(),
        )
        .unwrap()
    }

    fn two_keyframes(map: &mut Map) -> (KeyFrameId, KeyFrameId) {
        let kf1 = map.create_keyframe(Pose::identity(), frame_with(10, 4));
        let kf2 = map.create_keyframe(
            Pose::new(nalgebra::Matrix3::identity(), Vector3::new(-1.0, 0.0, 0.0)),
            frame_with(10, 4),
        );
        (kf1, kf2)
    }

    #[test]
    fn bidirectional_point_association() {
        let mut map = Map::new();
        let (kf1, kf2) = two_keyframes(&mut map);

        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), Descriptor::default(), kf1);
        assert!(map.associate_point(kf1, 0, mp));
        assert!(map.associate_point(kf2, 3, mp));

        // Both invariant directions hold.
        assert_eq!(map.map_point(mp).unwrap().observation_index(kf1), Some(0));
        assert_eq!(map.map_point(mp).unwrap().observation_index(kf2), Some(3));
        assert_eq!(map.keyframe(kf1).unwrap().map_point(0), Some(mp));
        assert_eq!(map.keyframe(kf2).unwrap().map_point(3), Some(mp));

        let removed = map.disassociate_point(kf1, 0);
        assert_eq!(removed, Some(mp));
        assert_eq!(map.keyframe(kf1).unwrap().map_point(0), None);
        assert_eq!(map.map_point(mp).unwrap().num_observations(), 1);
    }

    #[test]
    fn bidirectional_line_association() {
        let mut map = Map::new();
        let (kf1, kf2) = two_keyframes(&mut map);

        let ml = map.create_map_line(
            Vector3::new(0.0, 0.0, 4.0),
            Vector3::new(0.5, 0.5, 4.5),
            Descriptor::default(),
            kf1,
        );
        assert!(map.associate_line(kf1, 1, ml));
        assert!(map.associate_line(kf2, 2, ml));

        assert_eq!(map.map_line(ml).unwrap().observation_index(kf2), Some(2));
        assert_eq!(map.keyframe(kf2).unwrap().map_line(2), Some(ml));

        map.erase_map_line(ml);
        assert!(map.map_line(ml).is_none());
        assert_eq!(map.keyframe(kf1).unwrap().map_line(1), None);
        assert_eq!(map.keyframe(kf2).unwrap().map_line(2), None);
    }

    #[test]
    fn connections_are_symmetric_and_count_shared_landmarks() {
        let mut map = Map::new();
        let (kf1, kf2) = two_keyframes(&mut map);

        for i in 0..3 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), Descriptor::default(), kf1);
            map.associate_point(kf1, i, mp);
            map.associate_point(kf2, i, mp);
        }
        let ml = map.create_map_line(
            Vector3::zeros(),
            Vector3::new(0.0, 1.0, 4.0),
            Descriptor::default(),
            kf1,
        );
        map.associate_line(kf1, 0, ml);
        map.associate_line(kf2, 0, ml);

        map.update_connections(kf1);
        assert_eq!(map.keyframe(kf1).unwrap().covisibility_weight(kf2), 4);
        assert_eq!(map.keyframe(kf2).unwrap().covisibility_weight(kf1), 4);

        // Removing the shared landmarks drops the edge on both sides.
        let shared: Vec<MapPointId> = map
            .keyframe(kf1)
            .unwrap()
            .map_point_indices()
            .map(|(_, id)| id)
            .collect();
        for mp in shared {
            map.erase_map_point(mp);
        }
        map.erase_map_line(ml);
        map.update_connections(kf1);
        assert_eq!(map.keyframe(kf1).unwrap().covisibility_weight(kf2), 0);
        assert_eq!(map.keyframe(kf2).unwrap().covisibility_weight(kf1), 0);
    }

    #[test]
    fn erase_map_point_cleans_every_keyframe() {
        let mut map = Map::new();
        let (kf1, kf2) = two_keyframes(&mut map);
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 3.0), Descriptor::default(), kf1);
        map.associate_point(kf1, 5, mp);
        map.associate_point(kf2, 7, mp);

        map.erase_map_point(mp);
        assert!(map.map_point(mp).is_none());
        assert_eq!(map.keyframe(kf1).unwrap().map_point(5), None);
        assert_eq!(map.keyframe(kf2).unwrap().map_point(7), None);
    }

    #[test]
    fn erase_keyframe_cleans_observations_and_edges() {
        let mut map = Map::new();
        let (kf1, kf2) = two_keyframes(&mut map);
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 3.0), Descriptor::default(), kf1);
        map.associate_point(kf1, 0, mp);
        map.associate_point(kf2, 0, mp);
        map.update_connections(kf1);

        map.erase_keyframe(kf2);
        assert!(map.keyframe(kf2).is_none());
        assert_eq!(map.map_point(mp).unwrap().num_observations(), 1);
        assert_eq!(map.keyframe(kf1).unwrap().covisibility_weight(kf2), 0);
    }

    #[test]
    fn merge_transfers_observations_and_counters() {
        let mut map = Map::new();
        let (kf1, kf2) = two_keyframes(&mut map);
        let keeper = map.create_map_point(Vector3::new(0.0, 0.0, 4.0), Descriptor::default(), kf1);
        let goner = map.create_map_point(Vector3::new(0.0, 0.1, 4.0), Descriptor::default(), kf1);

        map.associate_point(kf1, 0, keeper);
        map.associate_point(kf1, 1, goner);
        map.associate_point(kf2, 2, goner);

        map.map_point_mut(goner).unwrap().increase_found(5);

        assert!(map.merge_map_points(keeper, goner));
        assert!(map.map_point(goner).is_none());

        let keeper_ref = map.map_point(keeper).unwrap();
        // kf2's observation migrated to the keeper; kf1's colliding slot was
        // cleared instead.
        assert_eq!(keeper_ref.observation_index(kf2), Some(2));
        assert_eq!(keeper_ref.observation_index(kf1), Some(0));
        assert_eq!(map.keyframe(kf2).unwrap().map_point(2), Some(keeper));
        assert_eq!(map.keyframe(kf1).unwrap().map_point(1), None);
        assert!(keeper_ref.found_count >= 6);
    }

    #[test]
    fn distinctive_descriptor_prefers_the_consensus() {
        let mut descs = vec![Descriptor::default(); 3];
        descs[2].0[0] = 0xFF; // the odd one out
        let best = Map::distinctive_descriptor(&descs).unwrap();
        assert_eq!(best, Descriptor::default());
    }

    #[test]
    fn median_scene_depth_rank() {
        let mut map = Map::new();
        let kf = map.create_keyframe(Pose::identity(), frame_with(8, 0));
        for (i, z) in [8.0, 2.0, 6.0, 4.0].iter().enumerate() {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, *z), Descriptor::default(), kf);
            map.associate_point(kf, i, mp);
        }
        // Sorted depths [2, 4, 6, 8]; rank (4-1)/2 = 1 → 4.
        assert_relative_eq!(map.scene_median_depth(kf, 2).unwrap(), 4.0);
        assert!(map.scene_median_depth(KeyFrameId(99), 2).is_none());
    }

    #[test]
    fn normal_and_depth_update() {
        let mut map = Map::new();
        let (kf1, kf2) = two_keyframes(&mut map);
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 4.0), Descriptor::default(), kf1);
        map.associate_point(kf1, 0, mp);
        map.associate_point(kf2, 0, mp);
        map.update_point_normal_and_depth(mp);

        let mp_ref = map.map_point(mp).unwrap();
        assert_relative_eq!(mp_ref.normal.norm(), 1.0, epsilon = 1e-12);
        assert!(mp_ref.normal.z > 0.9);
        assert!(mp_ref.min_distance > 0.0 && mp_ref.min_distance < mp_ref.max_distance);
    }
}
