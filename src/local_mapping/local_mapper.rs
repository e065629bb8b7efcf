//! The local mapping loop.
//!
//! Consumes keyframes from the tracker queue, integrates them into the map,
//! triangulates new point and line landmarks from covisible neighbors, fuses
//! duplicates, runs the local bundle adjustment and culls redundant
//! keyframes. Runs on its own thread; the tracker drives it through the
//! shared [`MapperControl`].

use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use tracing::{debug, info};

use crate::map::{BowVector, KeyFrameId, MapLineId, MapPointId, SharedMap};
use crate::optimizer::{local_bundle_adjustment_with_lines, LocalBaConfig};
use crate::system::NewKeyFrame;

use super::control::{MapperControl, POLL_INTERVAL};
use super::line_triangulation::create_new_map_lines;
use super::search_in_neighbors::search_in_neighbors;
use super::triangulation::{create_new_map_points, TH_LOW};

/// Tunables of the local mapper (monocular defaults).
#[derive(Debug, Clone)]
pub struct LocalMapperConfig {
    /// Covisible neighbors considered for point creation and fusion.
    pub point_neighbors: usize,
    /// Covisible neighbors considered for line creation.
    pub line_neighbors: usize,
    /// Second-degree neighbors collected per first-degree neighbor.
    pub second_degree_neighbors: usize,
    /// Minimum baseline over scene median depth for triangulation.
    pub min_baseline_depth_ratio: f64,
    /// Probation culling: landmarks at least two keyframes old need more
    /// than this many observations to survive.
    pub probation_obs_threshold: usize,
    /// Hamming ceiling for creation and fusion matches.
    pub descriptor_threshold: u32,
    /// Orientation gate for line matching (radians, mod π).
    pub line_angle_threshold: f64,
    /// Local bundle adjustment settings.
    pub ba: LocalBaConfig,
}

impl Default for LocalMapperConfig {
    fn default() -> Self {
        Self {
            point_neighbors: 20,
            line_neighbors: 10,
            second_degree_neighbors: 5,
            min_baseline_depth_ratio: 0.01,
            probation_obs_threshold: 2,
            descriptor_threshold: TH_LOW,
            line_angle_threshold: 0.5,
            ba: LocalBaConfig::default(),
        }
    }
}

/// The local mapping thread state.
pub struct LocalMapper {
    map: SharedMap,
    control: Arc<MapperControl>,
    /// Hand-off of processed keyframes to the loop-closing thread.
    loop_closer: Option<Sender<KeyFrameId>>,
    config: LocalMapperConfig,

    /// Landmarks on probation since their creation.
    recent_points: Vec<MapPointId>,
    recent_lines: Vec<MapLineId>,
}

impl LocalMapper {
    pub fn new(
        map: SharedMap,
        control: Arc<MapperControl>,
        loop_closer: Option<Sender<KeyFrameId>>,
    ) -> Self {
        Self::with_config(map, control, loop_closer, LocalMapperConfig::default())
    }

    pub fn with_config(
        map: SharedMap,
        control: Arc<MapperControl>,
        loop_closer: Option<Sender<KeyFrameId>>,
        config: LocalMapperConfig,
    ) -> Self {
        Self {
            map,
            control,
            loop_closer,
            config,
            recent_points: Vec::new(),
            recent_lines: Vec::new(),
        }
    }

    /// The mapper main loop. Returns when a finish request is honored.
    pub fn run(&mut self) {
        self.control.set_running();

        loop {
            // The tracker sees the mapper as busy while an iteration runs.
            self.control.set_accept_keyframes(false);

            if self.control.has_new_keyframes() {
                self.process_one();
            } else if self.control.stop() {
                // Safe pause point: wait for release or finish.
                while self.control.is_stopped() && !self.control.finish_requested() {
                    thread::sleep(POLL_INTERVAL);
                }
                if self.control.finish_requested() {
                    break;
                }
            }

            self.reset_if_requested();
            self.control.set_accept_keyframes(true);

            if self.control.finish_requested() {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        self.control.set_finished();
        info!("local mapping finished");
    }

    /// One full mapping iteration over the next queued keyframe.
    ///
    /// Public so embedders (and tests) can drive the mapper synchronously.
    pub fn process_one(&mut self) {
        let Some(kf_id) = self.process_new_keyframe() else {
            return;
        };

        // Probation culling for points and lines, as a fork-join pair.
        let points = std::mem::take(&mut self.recent_points);
        let lines = std::mem::take(&mut self.recent_lines);
        let map = &self.map;
        let threshold = self.config.probation_obs_threshold;
        let (points, lines) = thread::scope(|s| {
            let hp = s.spawn(move || cull_recent_points(map, kf_id, points, threshold));
            let hl = s.spawn(move || cull_recent_lines(map, kf_id, lines, threshold));
            (hp.join().unwrap(), hl.join().unwrap())
        });
        self.recent_points = points;
        self.recent_lines = lines;

        // New landmark creation, as a fork-join pair.
        let control = &self.control;
        let config = &self.config;
        let (new_points, new_lines) = thread::scope(|s| {
            let hp = s.spawn(move || create_new_map_points(map, control, kf_id, config));
            let hl = s.spawn(move || create_new_map_lines(map, control, kf_id, config));
            (hp.join().unwrap(), hl.join().unwrap())
        });
        self.recent_points.extend(new_points);
        self.recent_lines.extend(new_lines);

        // Fuse duplicates only when the queue has drained; otherwise catch
        // up with tracking first.
        if !self.control.has_new_keyframes() {
            search_in_neighbors(&self.map, kf_id, &self.config);
        }

        self.control.clear_abort_ba();

        if !self.control.has_new_keyframes() && !self.control.stop_requested() {
            if self.map.read().num_keyframes() > 2 {
                let control = Arc::clone(&self.control);
                let should_abort = move || control.abort_ba();
                local_bundle_adjustment_with_lines(&self.map, kf_id, &should_abort, &self.config.ba);
            }
            self.keyframe_culling(kf_id);
        }

        if let Some(sender) = &self.loop_closer {
            let _ = sender.try_send(kf_id);
        }
    }

    /// Pop the next keyframe, insert it into the map, bind the landmarks the
    /// tracker matched, and refresh the covisibility edges.
    fn process_new_keyframe(&mut self) -> Option<KeyFrameId> {
        let msg = self.control.pop_keyframe()?;
        let NewKeyFrame {
            pose,
            frame,
            tracked_points,
            tracked_lines,
        } = msg;

        let mut map = self.map.write();

        let bow = compute_bow_stub(frame.descriptors.len());
        let kf_id = map.create_keyframe(pose, frame);
        if let Some(kf) = map.keyframe_mut(kf_id) {
            kf.bow_vector = Some(bow);
        }

        for (idx, tracked) in tracked_points.iter().enumerate() {
            let Some(mp_id) = *tracked else { continue };
            let already_observing = match map.map_point(mp_id) {
                Some(mp) if !mp.is_bad => mp.observations.contains_key(&kf_id),
                _ => continue,
            };
            if !already_observing {
                map.associate_point(kf_id, idx, mp_id);
                map.update_point_normal_and_depth(mp_id);
                map.compute_distinctive_point_descriptor(mp_id);
            } else {
                // Landmarks inserted by the tracker itself go on probation.
                self.recent_points.push(mp_id);
            }
        }

        for (idx, tracked) in tracked_lines.iter().enumerate() {
            let Some(ml_id) = *tracked else { continue };
            let already_observing = match map.map_line(ml_id) {
                Some(ml) if !ml.is_bad => ml.observations.contains_key(&kf_id),
                _ => continue,
            };
            if !already_observing {
                map.associate_line(kf_id, idx, ml_id);
                map.update_line_average_direction(ml_id);
                map.compute_distinctive_line_descriptor(ml_id);
            } else {
                self.recent_lines.push(ml_id);
            }
        }

        map.update_connections(kf_id);
        drop(map);

        debug!(keyframe = %kf_id, "keyframe ingested");
        Some(kf_id)
    }

    /// Flag covisible keyframes redundant when at least 90 % of their map
    /// points are seen by three or more other keyframes at the same or a
    /// finer scale. The initial keyframe is never culled.
    fn keyframe_culling(&mut self, current_id: KeyFrameId) {
        const TH_OBS: usize = 3;

        let mut map = self.map.write();
        let covisibles: Vec<KeyFrameId> = match map.keyframe(current_id) {
            Some(kf) => kf.covisibles().copied().collect(),
            None => return,
        };

        let mut n_culled = 0usize;
        for kf_id in covisibles {
            if kf_id == KeyFrameId(0) {
                continue;
            }
            let Some(kf) = map.keyframe(kf_id) else { continue };
            if kf.is_bad {
                continue;
            }

            let mut n_points = 0usize;
            let mut n_redundant = 0usize;

            for (idx, mp_id) in kf.map_point_indices() {
                let Some(mp) = map.map_point(mp_id) else { continue };
                if mp.is_bad {
                    continue;
                }
                n_points += 1;

                if mp.num_observations() > TH_OBS {
                    let scale_level = kf.keypoints[idx].octave;
                    let mut n_obs = 0usize;
                    for (&other_id, &other_idx) in &mp.observations {
                        if other_id == kf_id {
                            continue;
                        }
                        let Some(other) = map.keyframe(other_id) else { continue };
                        let Some(other_kp) = other.keypoints.get(other_idx) else { continue };
                        if other_kp.octave <= scale_level + 1 {
                            n_obs += 1;
                            if n_obs >= TH_OBS {
                                break;
                            }
                        }
                    }
                    if n_obs >= TH_OBS {
                        n_redundant += 1;
                    }
                }
            }

            if n_points > 0 && n_redundant as f64 > 0.9 * n_points as f64 {
                map.erase_keyframe(kf_id);
                n_culled += 1;
            }
        }

        if n_culled > 0 {
            info!(n_culled, "culled redundant keyframes");
        }
    }

    fn reset_if_requested(&mut self) {
        if self.control.reset_requested() {
            self.recent_points.clear();
            self.recent_lines.clear();
            self.control.complete_reset();
            info!("local mapping reset");
        }
    }
}

/// Probation culling of recently created map points.
///
/// Returns the landmarks that stay on probation. Landmarks are dropped from
/// the list when already bad, erased for a poor found ratio or for lacking
/// observations after two keyframes, and graduate after three keyframes.
fn cull_recent_points(
    map: &SharedMap,
    current_kf: KeyFrameId,
    recent: Vec<MapPointId>,
    obs_threshold: usize,
) -> Vec<MapPointId> {
    let mut kept = Vec::with_capacity(recent.len());
    let mut m = map.write();

    for mp_id in recent {
        let Some(mp) = m.map_point(mp_id) else { continue };
        if mp.is_bad {
            continue;
        }
        if mp.found_ratio() < 0.25 {
            m.erase_map_point(mp_id);
            continue;
        }
        let age = current_kf.0.saturating_sub(mp.first_kf_id.0);
        if age >= 2 && mp.num_observations() <= obs_threshold {
            m.erase_map_point(mp_id);
            continue;
        }
        if age >= 3 {
            continue; // graduated
        }
        kept.push(mp_id);
    }

    kept
}

/// Probation culling of recently created map lines, mirroring the points.
fn cull_recent_lines(
    map: &SharedMap,
    current_kf: KeyFrameId,
    recent: Vec<MapLineId>,
    obs_threshold: usize,
) -> Vec<MapLineId> {
    let mut kept = Vec::with_capacity(recent.len());
    let mut m = map.write();

    for ml_id in recent {
        let Some(ml) = m.map_line(ml_id) else { continue };
        if ml.is_bad {
            continue;
        }
        if ml.found_ratio() < 0.25 {
            m.erase_map_line(ml_id);
            continue;
        }
        let age = current_kf.0.saturating_sub(ml.first_kf_id.0);
        if age >= 2 && ml.num_observations() <= obs_threshold {
            m.erase_map_line(ml_id);
            continue;
        }
        if age >= 3 {
            continue;
        }
        kept.push(ml_id);
    }

    kept
}

/// Placeholder bag-of-words histogram: unit weight per descriptor.
///
/// The real vocabulary lives in the place-recognition collaborator; this
/// keeps the keyframes' BoW slot populated without it.
fn compute_bow_stub(n_descriptors: usize) -> BowVector {
    let mut bow = BowVector::new();
    for i in 0..n_descriptors {
        bow.insert(i as u32, 1.0);
    }
    bow
}
