//! Duplicate-landmark fusion across covisible keyframes.
//!
//! After creation settles, the current keyframe's landmarks are projected
//! into its first- and second-degree covisible neighbors and vice versa.
//! A projection that lands on a free feature adds an observation; one that
//! lands on a feature already bound to a different landmark merges the two,
//! keeping the better-observed one.

use std::collections::HashSet;

use tracing::debug;

use crate::map::{KeyFrameId, Map, MapLineId, MapPointId, SharedMap};

use super::LocalMapperConfig;

/// Projection search radius multiplier (pixels at scale one).
const FUSE_RADIUS: f64 = 3.0;
/// Midpoint search radius for line fusion.
const LINE_FUSE_RADIUS: f64 = 10.0;

/// Statistics of one fusion pass.
#[derive(Debug, Default)]
pub struct FusionStats {
    pub points_fused: usize,
    pub point_observations_added: usize,
    pub lines_fused: usize,
    pub line_observations_added: usize,
}

/// Scale level a landmark at `dist` would be detected at.
fn predict_scale_level(scale_factor: f64, n_levels: usize, max_distance: f64, dist: f64) -> usize {
    if dist <= 0.0 || max_distance <= 0.0 {
        return 0;
    }
    let ratio = max_distance / dist;
    if ratio <= 1.0 {
        return 0;
    }
    let level = (ratio.ln() / scale_factor.ln()).ceil() as usize;
    level.min(n_levels - 1)
}

/// Collect the fusion target set: the best covisibles of `current` plus a
/// few covisibles of each, excluding the current keyframe itself.
fn collect_targets(map: &mut Map, current_id: KeyFrameId, config: &LocalMapperConfig) -> Vec<KeyFrameId> {
    let first: Vec<KeyFrameId> = match map.keyframe_mut(current_id) {
        Some(kf) => kf.best_covisibles(config.point_neighbors),
        None => return Vec::new(),
    };

    let mut seen: HashSet<KeyFrameId> = HashSet::new();
    seen.insert(current_id);
    let mut targets = Vec::new();

    for kf_id in first {
        let Some(kf) = map.keyframe(kf_id) else { continue };
        if kf.is_bad || !seen.insert(kf_id) {
            continue;
        }
        targets.push(kf_id);

        let second = kf.best_covisibles_readonly(config.second_degree_neighbors);
        for kf2_id in second {
            let Some(kf2) = map.keyframe(kf2_id) else { continue };
            if kf2.is_bad || !seen.insert(kf2_id) {
                continue;
            }
            targets.push(kf2_id);
        }
    }

    targets
}

/// Fuse the given map points into one target keyframe.
fn fuse_points_into(
    map: &mut Map,
    mp_ids: &[MapPointId],
    target_id: KeyFrameId,
    config: &LocalMapperConfig,
    stats: &mut FusionStats,
) {
    for &mp_id in mp_ids {
        let Some(mp) = map.map_point(mp_id) else { continue };
        if mp.is_bad || mp.observations.contains_key(&target_id) {
            continue;
        }
        let position = mp.position;
        let descriptor = mp.descriptor;
        let max_distance = mp.max_distance;

        let Some(kf) = map.keyframe(target_id) else { continue };
        let p_cam = kf.pose.transform(&position);
        if p_cam.z <= 0.0 {
            continue;
        }

        // Scale-invariance band with the usual fusion margins.
        let dist = (position - kf.camera_center()).norm();
        let Some(mp_check) = map.map_point(mp_id) else { continue };
        if dist < 0.8 * mp_check.min_distance || dist > 1.2 * mp_check.max_distance {
            continue;
        }

        let Some(kf) = map.keyframe(target_id) else { continue };
        let uv = kf.intrinsics.project(&p_cam);
        let level = predict_scale_level(
            kf.pyramid.scale_factor,
            kf.pyramid.n_levels(),
            max_distance,
            dist,
        );
        let radius = FUSE_RADIUS * kf.pyramid.scale(level);

        let candidates = kf.features_in_area(uv.x, uv.y, radius, None, None);
        if candidates.is_empty() {
            continue;
        }

        let mut best_dist = config.descriptor_threshold;
        let mut best_idx: Option<usize> = None;
        for idx in candidates {
            let d = descriptor.distance(&kf.descriptors[idx]);
            if d < best_dist {
                best_dist = d;
                best_idx = Some(idx);
            }
        }
        let Some(feat_idx) = best_idx else { continue };

        match kf.map_point(feat_idx) {
            Some(existing) if existing != mp_id => {
                // Keep the landmark with more observations.
                let mp_obs = map.map_point(mp_id).map_or(0, |p| p.num_observations());
                let ex_obs = map.map_point(existing).map_or(0, |p| p.num_observations());
                let (keeper, goner) = if mp_obs >= ex_obs {
                    (mp_id, existing)
                } else {
                    (existing, mp_id)
                };
                if map.merge_map_points(keeper, goner) {
                    stats.points_fused += 1;
                }
            }
            None => {
                map.associate_point(target_id, feat_idx, mp_id);
                stats.point_observations_added += 1;
            }
            _ => {}
        }
    }
}

/// Fuse the given map lines into one target keyframe.
fn fuse_lines_into(
    map: &mut Map,
    ml_ids: &[MapLineId],
    target_id: KeyFrameId,
    config: &LocalMapperConfig,
    stats: &mut FusionStats,
) {
    for &ml_id in ml_ids {
        let Some(ml) = map.map_line(ml_id) else { continue };
        if ml.is_bad || ml.observations.contains_key(&target_id) {
            continue;
        }
        let start = ml.start;
        let end = ml.end;
        let descriptor = ml.descriptor;

        let Some(kf) = map.keyframe(target_id) else { continue };
        let s_cam = kf.pose.transform(&start);
        let e_cam = kf.pose.transform(&end);
        if s_cam.z <= 0.0 || e_cam.z <= 0.0 {
            continue;
        }

        let s_px = kf.intrinsics.project(&s_cam);
        let e_px = kf.intrinsics.project(&e_cam);
        let mid = (s_px + e_px) * 0.5;
        let angle = (e_px.y - s_px.y).atan2(e_px.x - s_px.x);

        let candidates = kf.lines_in_area(
            mid.x,
            mid.y,
            LINE_FUSE_RADIUS,
            angle,
            config.line_angle_threshold,
        );
        if candidates.is_empty() {
            continue;
        }

        // Candidate must also hold the reprojected endpoints close to its
        // observed line equation.
        let mut best_dist = config.descriptor_threshold;
        let mut best_idx: Option<usize> = None;
        for idx in candidates {
            let kl = &kf.keylines[idx];
            let sigma2 = kf.line_pyramid.sigma2(kl.octave);
            let err_s = kl.line.x * s_px.x + kl.line.y * s_px.y + kl.line.z;
            let err_e = kl.line.x * e_px.x + kl.line.y * e_px.y + kl.line.z;
            if err_s * err_s > 3.84 * sigma2 || err_e * err_e > 3.84 * sigma2 {
                continue;
            }

            let d = descriptor.distance(&kf.line_descriptors[idx]);
            if d < best_dist {
                best_dist = d;
                best_idx = Some(idx);
            }
        }
        let Some(line_idx) = best_idx else { continue };

        match kf.map_line(line_idx) {
            Some(existing) if existing != ml_id => {
                let ml_obs = map.map_line(ml_id).map_or(0, |l| l.num_observations());
                let ex_obs = map.map_line(existing).map_or(0, |l| l.num_observations());
                let (keeper, goner) = if ml_obs >= ex_obs {
                    (ml_id, existing)
                } else {
                    (existing, ml_id)
                };
                if map.merge_map_lines(keeper, goner) {
                    stats.lines_fused += 1;
                }
            }
            None => {
                map.associate_line(target_id, line_idx, ml_id);
                stats.line_observations_added += 1;
            }
            _ => {}
        }
    }
}

/// Fuse duplicate landmarks between the current keyframe and its first- and
/// second-degree covisible neighbors, both directions, then refresh the
/// touched landmarks and the covisibility edges.
pub(crate) fn search_in_neighbors(
    map: &SharedMap,
    current_id: KeyFrameId,
    config: &LocalMapperConfig,
) -> FusionStats {
    let mut stats = FusionStats::default();
    let mut m = map.write();

    let targets = collect_targets(&mut m, current_id, config);
    if targets.is_empty() {
        return stats;
    }

    // Current keyframe's landmarks into the targets.
    let (current_points, current_lines) = match m.keyframe(current_id) {
        Some(kf) => (
            kf.map_point_indices().map(|(_, id)| id).collect::<Vec<_>>(),
            kf.map_line_indices().map(|(_, id)| id).collect::<Vec<_>>(),
        ),
        None => return stats,
    };

    for &target in &targets {
        fuse_points_into(&mut m, &current_points, target, config, &mut stats);
        fuse_lines_into(&mut m, &current_lines, target, config, &mut stats);
    }

    // Target landmarks back into the current keyframe, deduplicated.
    let mut candidate_points: Vec<MapPointId> = Vec::new();
    let mut candidate_lines: Vec<MapLineId> = Vec::new();
    {
        let mut seen_p: HashSet<MapPointId> = HashSet::new();
        let mut seen_l: HashSet<MapLineId> = HashSet::new();
        for &target in &targets {
            let Some(kf) = m.keyframe(target) else { continue };
            for (_, mp_id) in kf.map_point_indices() {
                if seen_p.insert(mp_id) {
                    candidate_points.push(mp_id);
                }
            }
            for (_, ml_id) in kf.map_line_indices() {
                if seen_l.insert(ml_id) {
                    candidate_lines.push(ml_id);
                }
            }
        }
        candidate_points.sort();
        candidate_lines.sort();
    }

    fuse_points_into(&mut m, &candidate_points, current_id, config, &mut stats);
    fuse_lines_into(&mut m, &candidate_lines, current_id, config, &mut stats);

    // Refresh descriptors and viewing geometry of everything the current
    // keyframe now observes.
    let (touched_points, touched_lines) = match m.keyframe(current_id) {
        Some(kf) => (
            kf.map_point_indices().map(|(_, id)| id).collect::<Vec<_>>(),
            kf.map_line_indices().map(|(_, id)| id).collect::<Vec<_>>(),
        ),
        None => return stats,
    };
    for mp_id in touched_points {
        m.compute_distinctive_point_descriptor(mp_id);
        m.update_point_normal_and_depth(mp_id);
    }
    for ml_id in touched_lines {
        m.compute_distinctive_line_descriptor(ml_id);
        m.update_line_average_direction(ml_id);
    }

    m.update_connections(current_id);

    debug!(
        current = %current_id,
        points_fused = stats.points_fused,
        point_obs_added = stats.point_observations_added,
        lines_fused = stats.lines_fused,
        line_obs_added = stats.line_observations_added,
        "neighbor fusion finished"
    );

    stats
}
