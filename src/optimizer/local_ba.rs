//! Local bundle adjustment with point and line terms.
//!
//! Split into three phases to keep the map lock short:
//! 1. **Collect** (read lock): snapshot the local window — the current
//!    keyframe and its covisibles, the landmarks they observe, and the
//!    keyframes that observe those landmarks without being local (held
//!    fixed).
//! 2. **Solve** (no lock): damped Gauss-Newton alternation between landmark
//!    refinement (3x3 systems per point and per line endpoint) and pose
//!    refinement (6x6 per free keyframe), Huber-weighted. The abort flag is
//!    polled at every iteration boundary and a sweep that increases the
//!    error is rolled back.
//! 3. **Apply** (write lock): write back only elements that still exist.
//!
//! Residuals: 2D reprojection error for points, signed endpoint-to-line
//! distance against the observed line equation for line segments.

use std::collections::{HashMap, HashSet};

use nalgebra::{Matrix2x3, Matrix3, Matrix6, Rotation3, Vector2, Vector3, Vector6};
use tracing::debug;

use crate::frame::CameraIntrinsics;
use crate::geometry::kernel::skew_symmetric;
use crate::geometry::Pose;
use crate::map::{KeyFrameId, MapLineId, MapPointId, SharedMap};

/// Configuration of the local bundle adjustment.
#[derive(Debug, Clone)]
pub struct LocalBaConfig {
    /// Maximum alternation sweeps.
    pub max_iterations: usize,
    /// Huber kernel threshold in pixels.
    pub huber_threshold: f64,
    /// Initial Levenberg damping.
    pub damping: f64,
    /// Relative error improvement below which the solve stops.
    pub convergence: f64,
}

impl Default for LocalBaConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            huber_threshold: 2.45,
            damping: 1e-3,
            convergence: 1e-6,
        }
    }
}

/// Outcome of one local BA run.
#[derive(Debug)]
pub struct LocalBaResult {
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
    pub num_keyframes: usize,
    pub num_points: usize,
    pub num_lines: usize,
    pub num_observations: usize,
    pub aborted: bool,
}

struct PointObs {
    kf: usize,
    mp: usize,
    uv: Vector2<f64>,
    inv_sigma2: f64,
}

struct LineObs {
    kf: usize,
    ml: usize,
    /// Observed implicit line equation (a, b, c), a² + b² = 1.
    line: Vector3<f64>,
    inv_sigma2: f64,
}

struct BaProblem {
    kf_ids: Vec<KeyFrameId>,
    poses: Vec<Pose>,
    intrinsics: Vec<CameraIntrinsics>,
    /// Fixed poses: the anchor plus every non-local observer.
    fixed: Vec<bool>,
    mp_ids: Vec<MapPointId>,
    positions: Vec<Vector3<f64>>,
    ml_ids: Vec<MapLineId>,
    endpoints: Vec<(Vector3<f64>, Vector3<f64>)>,
    point_obs: Vec<PointObs>,
    line_obs: Vec<LineObs>,
}

/// Run local BA around `current_id`. Returns `None` when the window is too
/// small to optimize.
pub fn local_bundle_adjustment_with_lines(
    map: &SharedMap,
    current_id: KeyFrameId,
    should_abort: &dyn Fn() -> bool,
    config: &LocalBaConfig,
) -> Option<LocalBaResult> {
    // Phase 1: collect under the read lock.
    let mut problem = {
        let m = map.read();
        collect_problem(&m, current_id)?
    };

    // Phase 2: solve without any lock held.
    let (result, aborted) = solve(&mut problem, config, should_abort);

    // Phase 3: apply under the write lock.
    if result.iterations > 0 && !aborted {
        let mut m = map.write();
        for (i, kf_id) in problem.kf_ids.iter().enumerate() {
            if problem.fixed[i] {
                continue;
            }
            if let Some(kf) = m.keyframe_mut(*kf_id) {
                if !kf.is_bad {
                    kf.pose = problem.poses[i].clone();
                }
            }
        }
        for (i, mp_id) in problem.mp_ids.iter().enumerate() {
            if let Some(mp) = m.map_point_mut(*mp_id) {
                if !mp.is_bad {
                    mp.position = problem.positions[i];
                }
            }
        }
        for (i, ml_id) in problem.ml_ids.iter().enumerate() {
            if let Some(ml) = m.map_line_mut(*ml_id) {
                if !ml.is_bad {
                    ml.start = problem.endpoints[i].0;
                    ml.end = problem.endpoints[i].1;
                }
            }
        }
    }

    debug!(
        iterations = result.iterations,
        initial = result.initial_error,
        final_ = result.final_error,
        aborted = result.aborted,
        "local bundle adjustment"
    );

    Some(result)
}

fn collect_problem(map: &crate::map::Map, current_id: KeyFrameId) -> Option<BaProblem> {
    let current = map.keyframe(current_id)?;

    // Local window: the current keyframe plus every covisible one.
    let mut local: Vec<KeyFrameId> = vec![current_id];
    local.extend(current.covisibles().copied());
    local.retain(|id| map.keyframe(*id).map_or(false, |kf| !kf.is_bad));
    if local.len() < 2 {
        return None;
    }
    local.sort();
    let local_set: HashSet<KeyFrameId> = local.iter().copied().collect();

    // Landmarks observed by the local window.
    let mut mp_ids: Vec<MapPointId> = Vec::new();
    let mut ml_ids: Vec<MapLineId> = Vec::new();
    {
        let mut seen_p = HashSet::new();
        let mut seen_l = HashSet::new();
        for kf_id in &local {
            let kf = map.keyframe(*kf_id)?;
            for (_, mp_id) in kf.map_point_indices() {
                if map.map_point(mp_id).map_or(false, |mp| !mp.is_bad) && seen_p.insert(mp_id) {
                    mp_ids.push(mp_id);
                }
            }
            for (_, ml_id) in kf.map_line_indices() {
                if map.map_line(ml_id).map_or(false, |ml| !ml.is_bad) && seen_l.insert(ml_id) {
                    ml_ids.push(ml_id);
                }
            }
        }
    }
    if mp_ids.is_empty() {
        return None;
    }
    mp_ids.sort();
    ml_ids.sort();

    // Non-local observers are held fixed.
    let mut fixed_ids: Vec<KeyFrameId> = Vec::new();
    {
        let mut seen = local_set.clone();
        for mp_id in &mp_ids {
            for kf_id in map.map_point(*mp_id)?.observations.keys() {
                if seen.insert(*kf_id) && map.keyframe(*kf_id).map_or(false, |kf| !kf.is_bad) {
                    fixed_ids.push(*kf_id);
                }
            }
        }
        for ml_id in &ml_ids {
            for kf_id in map.map_line(*ml_id)?.observations.keys() {
                if seen.insert(*kf_id) && map.keyframe(*kf_id).map_or(false, |kf| !kf.is_bad) {
                    fixed_ids.push(*kf_id);
                }
            }
        }
    }
    fixed_ids.sort();

    // Gauge: the oldest local keyframe stays fixed.
    let anchor = *local.first().expect("local window is non-empty");

    let kf_ids: Vec<KeyFrameId> = local.iter().chain(fixed_ids.iter()).copied().collect();
    let kf_index: HashMap<KeyFrameId, usize> =
        kf_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let n_local = local.len();

    let mut poses = Vec::with_capacity(kf_ids.len());
    let mut intrinsics = Vec::with_capacity(kf_ids.len());
    let mut fixed = Vec::with_capacity(kf_ids.len());
    for (i, kf_id) in kf_ids.iter().enumerate() {
        let kf = map.keyframe(*kf_id)?;
        poses.push(kf.pose.clone());
        intrinsics.push(kf.intrinsics);
        fixed.push(i >= n_local || *kf_id == anchor);
    }

    let mp_index: HashMap<MapPointId, usize> =
        mp_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let ml_index: HashMap<MapLineId, usize> =
        ml_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let positions: Vec<Vector3<f64>> = mp_ids
        .iter()
        .map(|id| map.map_point(*id).map(|mp| mp.position))
        .collect::<Option<_>>()?;
    let endpoints: Vec<(Vector3<f64>, Vector3<f64>)> = ml_ids
        .iter()
        .map(|id| map.map_line(*id).map(|ml| (ml.start, ml.end)))
        .collect::<Option<_>>()?;

    let mut point_obs = Vec::new();
    for (mp_i, mp_id) in mp_ids.iter().enumerate() {
        let mp = map.map_point(*mp_id)?;
        for (kf_id, &feat_idx) in &mp.observations {
            let Some(&kf_i) = kf_index.get(kf_id) else { continue };
            let Some(kf) = map.keyframe(*kf_id) else { continue };
            let Some(kp) = kf.keypoints.get(feat_idx) else { continue };
            point_obs.push(PointObs {
                kf: kf_i,
                mp: mp_i,
                uv: kp.uv,
                inv_sigma2: 1.0 / kf.pyramid.sigma2(kp.octave),
            });
        }
    }

    let mut line_obs = Vec::new();
    for (ml_i, ml_id) in ml_ids.iter().enumerate() {
        let ml = map.map_line(*ml_id)?;
        for (kf_id, &line_idx) in &ml.observations {
            let Some(&kf_i) = kf_index.get(kf_id) else { continue };
            let Some(kf) = map.keyframe(*kf_id) else { continue };
            let Some(kl) = kf.keylines.get(line_idx) else { continue };
            line_obs.push(LineObs {
                kf: kf_i,
                ml: ml_i,
                line: kl.line,
                inv_sigma2: 1.0 / kf.line_pyramid.sigma2(kl.octave),
            });
        }
    }

    if point_obs.is_empty() {
        return None;
    }

    Some(BaProblem {
        kf_ids,
        poses,
        intrinsics,
        fixed,
        mp_ids,
        positions,
        ml_ids,
        endpoints,
        point_obs,
        line_obs,
    })
}

/// Jacobian of the pixel projection with respect to the camera-frame point.
fn projection_jacobian(k: &CameraIntrinsics, p_cam: &Vector3<f64>) -> Matrix2x3<f64> {
    let inv_z = 1.0 / p_cam.z;
    let inv_z2 = inv_z * inv_z;
    Matrix2x3::new(
        k.fx * inv_z,
        0.0,
        -k.fx * p_cam.x * inv_z2,
        0.0,
        k.fy * inv_z,
        -k.fy * p_cam.y * inv_z2,
    )
}

fn huber_weight(residual_norm: f64, threshold: f64) -> f64 {
    if residual_norm <= threshold {
        1.0
    } else {
        threshold / residual_norm
    }
}

fn total_error(problem: &BaProblem, huber: f64) -> f64 {
    let mut error = 0.0;

    for obs in &problem.point_obs {
        let p_cam = problem.poses[obs.kf].transform(&problem.positions[obs.mp]);
        if p_cam.z <= 0.0 {
            continue;
        }
        let r = problem.intrinsics[obs.kf].project(&p_cam) - obs.uv;
        let n = r.norm() * obs.inv_sigma2.sqrt();
        error += huber_weight(n, huber) * n * n;
    }

    for obs in &problem.line_obs {
        for endpoint in [problem.endpoints[obs.ml].0, problem.endpoints[obs.ml].1] {
            let p_cam = problem.poses[obs.kf].transform(&endpoint);
            if p_cam.z <= 0.0 {
                continue;
            }
            let uv = problem.intrinsics[obs.kf].project(&p_cam);
            let r = obs.line.x * uv.x + obs.line.y * uv.y + obs.line.z;
            let n = r.abs() * obs.inv_sigma2.sqrt();
            error += huber_weight(n, huber) * n * n;
        }
    }

    error
}

/// One damped Gauss-Newton sweep over landmarks, then over free poses.
fn sweep(problem: &mut BaProblem, lambda: f64, huber: f64) {
    // Landmark refinement with poses held.
    refine_points(problem, lambda, huber);
    refine_line_endpoints(problem, lambda, huber);
    refine_poses(problem, lambda, huber);
}

fn refine_points(problem: &mut BaProblem, lambda: f64, huber: f64) {
    // Group observations per point.
    let mut per_point: Vec<Vec<usize>> = vec![Vec::new(); problem.positions.len()];
    for (i, obs) in problem.point_obs.iter().enumerate() {
        per_point[obs.mp].push(i);
    }

    for (mp_i, obs_list) in per_point.iter().enumerate() {
        if obs_list.len() < 2 {
            continue;
        }
        let mut h = Matrix3::zeros();
        let mut b = Vector3::zeros();

        for &oi in obs_list {
            let obs = &problem.point_obs[oi];
            let pose = &problem.poses[obs.kf];
            let p_cam = pose.transform(&problem.positions[mp_i]);
            if p_cam.z <= 0.0 {
                continue;
            }
            let k = &problem.intrinsics[obs.kf];
            let r = k.project(&p_cam) - obs.uv;
            let w = obs.inv_sigma2 * huber_weight(r.norm(), huber);
            let j = projection_jacobian(k, &p_cam) * pose.rotation;
            h += w * j.transpose() * j;
            b += w * j.transpose() * r;
        }

        let damped = h + Matrix3::identity() * lambda;
        if let Some(inv) = damped.try_inverse() {
            problem.positions[mp_i] -= inv * b;
        }
    }
}

fn refine_line_endpoints(problem: &mut BaProblem, lambda: f64, huber: f64) {
    let mut per_line: Vec<Vec<usize>> = vec![Vec::new(); problem.endpoints.len()];
    for (i, obs) in problem.line_obs.iter().enumerate() {
        per_line[obs.ml].push(i);
    }

    for (ml_i, obs_list) in per_line.iter().enumerate() {
        if obs_list.len() < 2 {
            continue;
        }

        for endpoint_sel in 0..2 {
            let mut h = Matrix3::zeros();
            let mut b = Vector3::zeros();

            let endpoint = if endpoint_sel == 0 {
                problem.endpoints[ml_i].0
            } else {
                problem.endpoints[ml_i].1
            };

            for &oi in obs_list {
                let obs = &problem.line_obs[oi];
                let pose = &problem.poses[obs.kf];
                let p_cam = pose.transform(&endpoint);
                if p_cam.z <= 0.0 {
                    continue;
                }
                let k = &problem.intrinsics[obs.kf];
                let uv = k.project(&p_cam);
                let r = obs.line.x * uv.x + obs.line.y * uv.y + obs.line.z;
                let w = obs.inv_sigma2 * huber_weight(r.abs(), huber);
                // 1x3 Jacobian of the line distance wrt the 3D endpoint.
                let normal = nalgebra::RowVector2::new(obs.line.x, obs.line.y);
                let j = normal * projection_jacobian(k, &p_cam) * pose.rotation;
                h += w * j.transpose() * j;
                b += w * j.transpose() * r;
            }

            let damped = h + Matrix3::identity() * lambda;
            if let Some(inv) = damped.try_inverse() {
                let delta = inv * b;
                if endpoint_sel == 0 {
                    problem.endpoints[ml_i].0 -= delta;
                } else {
                    problem.endpoints[ml_i].1 -= delta;
                }
            }
        }
    }
}

fn refine_poses(problem: &mut BaProblem, lambda: f64, huber: f64) {
    let mut per_kf_points: Vec<Vec<usize>> = vec![Vec::new(); problem.poses.len()];
    for (i, obs) in problem.point_obs.iter().enumerate() {
        per_kf_points[obs.kf].push(i);
    }
    let mut per_kf_lines: Vec<Vec<usize>> = vec![Vec::new(); problem.poses.len()];
    for (i, obs) in problem.line_obs.iter().enumerate() {
        per_kf_lines[obs.kf].push(i);
    }

    for kf_i in 0..problem.poses.len() {
        if problem.fixed[kf_i] {
            continue;
        }
        if per_kf_points[kf_i].len() + per_kf_lines[kf_i].len() < 6 {
            continue;
        }

        let mut h = Matrix6::<f64>::zeros();
        let mut b = Vector6::<f64>::zeros();
        let pose = problem.poses[kf_i].clone();
        let k = problem.intrinsics[kf_i];

        for &oi in &per_kf_points[kf_i] {
            let obs = &problem.point_obs[oi];
            let p_cam = pose.transform(&problem.positions[obs.mp]);
            if p_cam.z <= 0.0 {
                continue;
            }
            let r = k.project(&p_cam) - obs.uv;
            let w = obs.inv_sigma2 * huber_weight(r.norm(), huber);
            let j_proj = projection_jacobian(&k, &p_cam);

            // Perturbation: p_cam' = exp(δθ) p_cam + δt, state (δθ, δt).
            let mut j = nalgebra::Matrix2x6::<f64>::zeros();
            j.fixed_view_mut::<2, 3>(0, 0)
                .copy_from(&(-j_proj * skew_symmetric(&p_cam)));
            j.fixed_view_mut::<2, 3>(0, 3).copy_from(&j_proj);

            h += w * j.transpose() * j;
            b += w * j.transpose() * r;
        }

        for &oi in &per_kf_lines[kf_i] {
            let obs = &problem.line_obs[oi];
            for endpoint in [problem.endpoints[obs.ml].0, problem.endpoints[obs.ml].1] {
                let p_cam = pose.transform(&endpoint);
                if p_cam.z <= 0.0 {
                    continue;
                }
                let uv = k.project(&p_cam);
                let r = obs.line.x * uv.x + obs.line.y * uv.y + obs.line.z;
                let w = obs.inv_sigma2 * huber_weight(r.abs(), huber);
                let j_proj = projection_jacobian(&k, &p_cam);
                let normal = nalgebra::RowVector2::new(obs.line.x, obs.line.y);
                let j_point = normal * j_proj; // 1x3

                let mut j = nalgebra::RowVector6::<f64>::zeros();
                j.fixed_view_mut::<1, 3>(0, 0)
                    .copy_from(&(-j_point * skew_symmetric(&p_cam)));
                j.fixed_view_mut::<1, 3>(0, 3).copy_from(&j_point);

                h += w * j.transpose() * j;
                b += w * j.transpose() * r;
            }
        }

        let damped = h + Matrix6::identity() * lambda;
        if let Some(inv) = damped.try_inverse() {
            let delta: Vector6<f64> = inv * b;
            let d_theta = Vector3::new(delta[0], delta[1], delta[2]);
            let d_t = Vector3::new(delta[3], delta[4], delta[5]);

            let rot = Rotation3::new(-d_theta);
            let new_rotation = rot.matrix() * pose.rotation;
            let new_translation = rot.matrix() * pose.translation - d_t;
            problem.poses[kf_i] = Pose::new(new_rotation, new_translation);
        }
    }
}

fn solve(
    problem: &mut BaProblem,
    config: &LocalBaConfig,
    should_abort: &dyn Fn() -> bool,
) -> (LocalBaResult, bool) {
    let initial_error = total_error(problem, config.huber_threshold);
    let mut error = initial_error;
    let mut lambda = config.damping;
    let mut iterations = 0usize;
    let mut aborted = false;

    for _ in 0..config.max_iterations {
        if should_abort() {
            aborted = true;
            break;
        }

        // Snapshot for rollback when a sweep diverges.
        let saved_poses = problem.poses.clone();
        let saved_positions = problem.positions.clone();
        let saved_endpoints = problem.endpoints.clone();

        sweep(problem, lambda, config.huber_threshold);
        let new_error = total_error(problem, config.huber_threshold);
        iterations += 1;

        if new_error > error {
            problem.poses = saved_poses;
            problem.positions = saved_positions;
            problem.endpoints = saved_endpoints;
            lambda *= 10.0;
            continue;
        }

        let improvement = (error - new_error) / error.max(1e-18);
        error = new_error;
        lambda = (lambda * 0.5).max(1e-9);

        if improvement < config.convergence {
            break;
        }
    }

    (
        LocalBaResult {
            iterations,
            initial_error,
            final_error: error,
            num_keyframes: problem.kf_ids.len(),
            num_points: problem.mp_ids.len(),
            num_lines: problem.ml_ids.len(),
            num_observations: problem.point_obs.len() + 2 * problem.line_obs.len(),
            aborted,
        },
        aborted,
    )
}
