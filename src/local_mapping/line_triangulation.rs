//! New map line creation constrained by three keyframes.
//!
//! Line matches against the covisible neighbors are collected first; every
//! neighbor pair then acts as a plane pair for triangulating the current
//! keyframe's segments. A candidate survives only when its back-projected
//! planes are non-degenerate, both endpoints carry parallax, the segment is
//! neither too close nor too long relative to the scene depth, it is in
//! front of all three cameras, and its reprojection overlaps the observed
//! segment in every view.

use nalgebra::{Matrix3, Matrix3x4, Vector2, Vector3};
use tracing::debug;

use crate::frame::LineFeature;
use crate::geometry::kernel::{skew_symmetric, triangulate_line_point};
use crate::map::{KeyFrame, KeyFrameId, Map, MapLineId, SharedMap};

use super::control::MapperControl;
use super::LocalMapperConfig;

/// Direction cosine above which a segment lies on the epipolar plane of a
/// keyframe pair.
const EPIPOLAR_DIRECTION_COS: f64 = 0.996;
/// Cosine between the observing plane normal and the recovered 3D direction
/// above which the plane pair is considered collinear with the segment.
const PLANE_DEGENERACY_COS: f64 = 0.0087;
/// Parallax-free cosine limit for the endpoints.
const COS_PARALLAX_LIMIT: f64 = 0.99998;
/// Minimum endpoint distance as a fraction of the scene median depth.
const MIN_DEPTH_RATIO: f64 = 0.3;
/// Maximum segment length as a fraction of the scene median depth.
const MAX_LENGTH_RATIO: f64 = 1.0;
/// Required mutual overlap between the reprojected and observed segments.
const MIN_OVERLAP: f64 = 0.85;

/// Positional line matches: entry `i` is the index in `kf2` matched to
/// keyline `i` of `kf1`, if any.
fn match_lines_for_triangulation(
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    max_dist: u32,
    max_angle_diff: f64,
) -> Vec<Option<usize>> {
    let mut matches = vec![None; kf1.num_lines()];
    let mut matched2 = vec![false; kf2.num_lines()];

    for (idx1, kl1) in kf1.keylines.iter().enumerate() {
        if kf1.map_line(idx1).is_some() {
            continue;
        }
        let d1 = &kf1.line_descriptors[idx1];

        let mut best_dist = max_dist;
        let mut best_idx2: Option<usize> = None;

        for (idx2, kl2) in kf2.keylines.iter().enumerate() {
            if matched2[idx2] || kf2.map_line(idx2).is_some() {
                continue;
            }

            let diff = (kl1.angle - kl2.angle).rem_euclid(std::f64::consts::PI);
            if diff.min(std::f64::consts::PI - diff) > max_angle_diff {
                continue;
            }

            let dist = d1.distance(&kf2.line_descriptors[idx2]);
            if dist < best_dist {
                best_dist = dist;
                best_idx2 = Some(idx2);
            }
        }

        if let Some(idx2) = best_idx2 {
            matches[idx1] = Some(idx2);
            matched2[idx2] = true;
        }
    }

    matches
}

/// Back-projected plane normal of a segment in its own camera frame.
fn backprojected_plane(kl: &LineFeature, k_inv: &Matrix3<f64>) -> Vector3<f64> {
    let s = k_inv * Vector3::new(kl.start.x, kl.start.y, 1.0);
    let e = k_inv * Vector3::new(kl.end.x, kl.end.y, 1.0);
    s.cross(&e)
}

/// Reprojected-versus-observed segment overlap along the dominant axis.
fn overlap_passes(kl: &LineFeature, proj_s: &Vector2<f64>, proj_e: &Vector2<f64>) -> bool {
    let quarter = std::f64::consts::FRAC_PI_4;
    let y_dominant = kl.angle.abs() < 3.0 * quarter && kl.angle.abs() > quarter;

    let (p_lo, p_hi, o_lo, o_hi) = if y_dominant {
        (
            proj_s.y.min(proj_e.y),
            proj_s.y.max(proj_e.y),
            kl.start.y.min(kl.end.y),
            kl.start.y.max(kl.end.y),
        )
    } else {
        (
            proj_s.x.min(proj_e.x),
            proj_s.x.max(proj_e.x),
            kl.start.x.min(kl.end.x),
            kl.start.x.max(kl.end.x),
        )
    };

    if p_lo > o_hi || o_lo > p_hi {
        return false;
    }

    let span = p_hi.min(o_hi) - p_lo.max(o_lo);
    let ratio_proj = span / (p_hi - p_lo);
    let ratio_obs = span / (o_hi - o_lo);
    ratio_proj >= MIN_OVERLAP && ratio_obs >= MIN_OVERLAP
}

/// Squared endpoint-to-line residual gate in one view.
fn endpoint_residual_passes(
    kf: &KeyFrame,
    kl: &LineFeature,
    p_cam: &Vector3<f64>,
    out_px: &mut Vector2<f64>,
) -> bool {
    let uv = kf.intrinsics.project(p_cam);
    *out_px = uv;
    let err = kl.line.x * uv.x + kl.line.y * uv.y + kl.line.z;
    let sigma2 = kf.line_pyramid.sigma2(kl.octave);
    err * err <= 3.84 * sigma2
}

/// Create new map lines from the current keyframe and pairs of covisible
/// neighbors. Returns the created landmark ids for probation.
pub(crate) fn create_new_map_lines(
    map: &SharedMap,
    control: &MapperControl,
    current_id: KeyFrameId,
    config: &LocalMapperConfig,
) -> Vec<MapLineId> {
    let mut created = Vec::new();

    let neighbors: Vec<KeyFrameId> = {
        let mut m = map.write();
        match m.keyframe_mut(current_id) {
            Some(kf) => kf.best_covisibles(config.line_neighbors),
            None => return created,
        }
    };
    if neighbors.len() < 2 {
        return created;
    }

    // Collect positional match arrays against each usable neighbor.
    let mut collected: Vec<(KeyFrameId, Vec<Option<usize>>)> = Vec::new();
    for (i, &neighbor_id) in neighbors.iter().enumerate() {
        if i > 1 && control.has_new_keyframes() {
            return created;
        }

        let m = map.read();
        let (Some(kf1), Some(kf2)) = (m.keyframe(current_id), m.keyframe(neighbor_id)) else {
            continue;
        };
        if kf2.is_bad {
            continue;
        }

        let baseline = (kf2.camera_center() - kf1.camera_center()).norm();
        let Some(median_depth) = m.scene_median_depth(neighbor_id, 2) else {
            continue;
        };
        if baseline / median_depth < config.min_baseline_depth_ratio {
            continue;
        }

        let matches = match_lines_for_triangulation(
            kf1,
            kf2,
            config.descriptor_threshold,
            config.line_angle_threshold,
        );
        if matches.iter().any(|m| m.is_some()) {
            collected.push((neighbor_id, matches));
        }
    }

    if collected.len() < 2 {
        return created;
    }

    let mut m = map.write();
    for i in 0..collected.len() - 1 {
        let kf2_id = collected[i].0;
        for j in i + 1..collected.len() {
            let kf3_id = collected[j].0;
            let matches2 = &collected[i].1;
            let matches3 = &collected[j].1;
            let n_before = created.len();
            triangulate_line_triple(
                &mut m,
                current_id,
                kf2_id,
                kf3_id,
                matches2,
                matches3,
                &mut created,
            );
            if created.len() > n_before {
                debug!(
                    current = %current_id,
                    kf2 = %kf2_id,
                    kf3 = %kf3_id,
                    n_new = created.len() - n_before,
                    "triangulated new map lines"
                );
            }
        }
    }

    created
}

#[allow(clippy::too_many_arguments)]
fn triangulate_line_triple(
    map: &mut Map,
    kf1_id: KeyFrameId,
    kf2_id: KeyFrameId,
    kf3_id: KeyFrameId,
    matches2: &[Option<usize>],
    matches3: &[Option<usize>],
    created: &mut Vec<MapLineId>,
) {
    struct KfData {
        rotation: Matrix3<f64>,
        center: Vector3<f64>,
        m: Matrix3x4<f64>,
        k_inv: Matrix3<f64>,
    }
    let extract = |kf: &KeyFrame| KfData {
        rotation: kf.pose.rotation,
        center: kf.camera_center(),
        m: kf.pose.projection_matrix(&kf.intrinsics.matrix()),
        k_inv: kf.intrinsics.inverse_matrix(),
    };

    let (d1, d2, d3) = {
        let (Some(kf1), Some(kf2), Some(kf3)) = (
            map.keyframe(kf1_id),
            map.keyframe(kf2_id),
            map.keyframe(kf3_id),
        ) else {
            return;
        };
        (extract(kf1), extract(kf2), extract(kf3))
    };

    let Some(median_depth) = map.scene_median_depth(kf2_id, 2) else {
        return;
    };

    // Relative geometry between the current keyframe and the first neighbor
    // for the epipolar-direction rejection.
    let r21 = d2.rotation * d1.rotation.transpose();
    let t21 = d2.rotation * (d1.center - d2.center);
    let f21 = d2.k_inv.transpose() * skew_symmetric(&t21) * r21 * d1.k_inv;

    let r12 = d1.rotation * d2.rotation.transpose();
    let r13 = d1.rotation * d3.rotation.transpose();

    let n_lines = map.keyframe(kf1_id).map_or(0, |kf| kf.num_lines());

    for ikl in 0..n_lines {
        let (Some(idx2), Some(idx3)) = (
            matches2.get(ikl).copied().flatten(),
            matches3.get(ikl).copied().flatten(),
        ) else {
            continue;
        };

        let (Some(kf1), Some(kf2), Some(kf3)) = (
            map.keyframe(kf1_id),
            map.keyframe(kf2_id),
            map.keyframe(kf3_id),
        ) else {
            return;
        };
        if idx2 >= kf2.num_lines() || idx3 >= kf3.num_lines() {
            continue;
        }
        if kf1.map_line(ikl).is_some()
            || kf2.map_line(idx2).is_some()
            || kf3.map_line(idx3).is_some()
        {
            continue;
        }

        let kl1 = kf1.keylines[ikl];
        let kl2 = kf2.keylines[idx2];
        let kl3 = kf3.keylines[idx3];

        // Segment direction versus the epipolar direction in the first
        // neighbor: parallel means the segment lies on the epipolar plane.
        let line_dir2 = Vector2::new(-kl2.line.y, kl2.line.x);
        let th1 = f21 * Vector3::new(kl1.start.x, kl1.start.y, 1.0);
        let th1_dir = Vector2::new(-th1.y, th1.x);
        let cos1 = th1_dir.dot(&line_dir2) / (th1_dir.norm() * line_dir2.norm());
        let th2 = f21 * Vector3::new(kl1.end.x, kl1.end.y, 1.0);
        let th2_dir = Vector2::new(-th2.y, th2.x);
        let cos2 = th2_dir.dot(&line_dir2) / (th2_dir.norm() * line_dir2.norm());
        if cos1.abs() > EPIPOLAR_DIRECTION_COS || cos2.abs() > EPIPOLAR_DIRECTION_COS {
            continue;
        }

        // The direction recovered from the two neighbor planes must stay
        // perpendicular to the current keyframe's observing plane.
        let l1 = backprojected_plane(&kl1, &d1.k_inv);
        let l2 = backprojected_plane(&kl2, &d2.k_inv);
        let l3 = backprojected_plane(&kl3, &d3.k_inv);

        let mut world_dir = (r12 * l2).cross(&(r13 * l3));
        let norm = world_dir.norm();
        if norm == 0.0 {
            continue;
        }
        world_dir /= norm;
        let l1_norm = l1.norm();
        let l1_unit = l1 / l1_norm;
        if l1_norm == 0.0 {
            continue;
        }
        if l1_unit.dot(&world_dir).abs() > PLANE_DEGENERACY_COS {
            continue;
        }

        // Two plane rows from the neighbors, two pixel rows from the
        // current view.
        let s3d = triangulate_line_point(&kl3.line, &d3.m, &kl2.line, &d2.m, &kl1.start, &d1.m);
        let e3d = triangulate_line_point(&kl3.line, &d3.m, &kl2.line, &d2.m, &kl1.end, &d1.m);
        if !s3d.iter().all(|v| v.is_finite()) || !e3d.iter().all(|v| v.is_finite()) {
            continue;
        }

        // Both endpoints need parallax against both neighbor centres.
        let parallax_ok = |p: &Vector3<f64>| {
            let n1 = p - d1.center;
            let n2 = p - d2.center;
            let n3 = p - d3.center;
            let cos12 = n1.dot(&n2) / (n1.norm() * n2.norm());
            let cos13 = n1.dot(&n3) / (n1.norm() * n3.norm());
            cos12 < COS_PARALLAX_LIMIT && cos13 < COS_PARALLAX_LIMIT
        };
        if !parallax_ok(&s3d) || !parallax_ok(&e3d) {
            continue;
        }

        // Depth floor for the start point and a length ceiling, both
        // relative to the neighbor's scene median depth.
        if (s3d - d1.center).norm() / median_depth < MIN_DEPTH_RATIO {
            continue;
        }
        if (s3d - d2.center).norm() / median_depth < MIN_DEPTH_RATIO {
            continue;
        }
        if (e3d - s3d).norm() / median_depth > MAX_LENGTH_RATIO {
            continue;
        }

        // Cheirality in all three views for both endpoints.
        let s_c1 = kf1.pose.transform(&s3d);
        let e_c1 = kf1.pose.transform(&e3d);
        let s_c2 = kf2.pose.transform(&s3d);
        let e_c2 = kf2.pose.transform(&e3d);
        let s_c3 = kf3.pose.transform(&s3d);
        let e_c3 = kf3.pose.transform(&e3d);
        if s_c1.z <= 0.0
            || e_c1.z <= 0.0
            || s_c2.z <= 0.0
            || e_c2.z <= 0.0
            || s_c3.z <= 0.0
            || e_c3.z <= 0.0
        {
            continue;
        }

        // Per-view endpoint-to-line residual gates, keeping the reprojected
        // pixels for the overlap test.
        let mut px = [Vector2::zeros(); 6];
        if !endpoint_residual_passes(kf1, &kl1, &s_c1, &mut px[0])
            || !endpoint_residual_passes(kf1, &kl1, &e_c1, &mut px[1])
            || !endpoint_residual_passes(kf2, &kl2, &s_c2, &mut px[2])
            || !endpoint_residual_passes(kf2, &kl2, &e_c2, &mut px[3])
            || !endpoint_residual_passes(kf3, &kl3, &s_c3, &mut px[4])
            || !endpoint_residual_passes(kf3, &kl3, &e_c3, &mut px[5])
        {
            continue;
        }

        // The reprojected segment must overlap the observation in all views.
        if !overlap_passes(&kl1, &px[0], &px[1])
            || !overlap_passes(&kl2, &px[2], &px[3])
            || !overlap_passes(&kl3, &px[4], &px[5])
        {
            continue;
        }

        let descriptor = kf1.line_descriptors[ikl];
        let ml_id = map.create_map_line(s3d, e3d, descriptor, kf1_id);
        map.associate_line(kf1_id, ikl, ml_id);
        map.associate_line(kf2_id, idx2, ml_id);
        map.associate_line(kf3_id, idx3, ml_id);
        map.compute_distinctive_line_descriptor(ml_id);
        map.update_line_average_direction(ml_id);

        created.push(ml_id);
    }
}
