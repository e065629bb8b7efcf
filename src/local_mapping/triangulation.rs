//! New map point creation from covisible keyframe pairs.
//!
//! For each high-covisibility neighbor of the freshly inserted keyframe the
//! mapper searches epipolar-consistent descriptor matches among features that
//! have no landmark yet, triangulates them and validates depth, reprojection
//! and scale consistency before creating map points.

use nalgebra::{Matrix3, Vector2};
use tracing::debug;

use crate::geometry::kernel::{skew_symmetric, triangulate_point};
use crate::map::{KeyFrame, KeyFrameId, Map, MapPointId, SharedMap};

use super::control::MapperControl;
use super::LocalMapperConfig;

/// Descriptor distance ceiling for triangulation matches.
pub const TH_LOW: u32 = 50;

/// Fundamental matrix between two keyframes: `x1ᵀ F12 x2 = 0`.
pub fn compute_f12(kf1: &KeyFrame, kf2: &KeyFrame) -> Matrix3<f64> {
    let r1w = kf1.pose.rotation;
    let t1w = kf1.pose.translation;
    let r2w = kf2.pose.rotation;
    let t2w = kf2.pose.translation;

    let r12 = r1w * r2w.transpose();
    let t12 = -r12 * t2w + t1w;

    let k1_inv = kf1.intrinsics.inverse_matrix();
    let k2_inv = kf2.intrinsics.inverse_matrix();

    k1_inv.transpose() * skew_symmetric(&t12) * r12 * k2_inv
}

/// Distance of `kp2` to the epipolar line of `kp1`, gated by the chi-square
/// threshold at the candidate's pyramid level.
fn check_dist_epipolar_line(
    kp1: &Vector2<f64>,
    kp2: &Vector2<f64>,
    f12: &Matrix3<f64>,
    sigma2_kp2: f64,
) -> bool {
    // Epipolar line in the second image: l2 = F12ᵀ x1.
    let a = kp1.x * f12[(0, 0)] + kp1.y * f12[(1, 0)] + f12[(2, 0)];
    let b = kp1.x * f12[(0, 1)] + kp1.y * f12[(1, 1)] + f12[(2, 1)];
    let c = kp1.x * f12[(0, 2)] + kp1.y * f12[(1, 2)] + f12[(2, 2)];

    let num = a * kp2.x + b * kp2.y + c;
    let den = a * a + b * b;
    if den == 0.0 {
        return false;
    }

    num * num / den < 3.84 * sigma2_kp2
}

/// Epipolar-constrained descriptor matching between the unmatched features
/// of two keyframes. Returns (idx1, idx2) pairs.
fn search_for_triangulation(
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    f12: &Matrix3<f64>,
    max_dist: u32,
) -> Vec<(usize, usize)> {
    let mut matches = Vec::new();

    // Epipole of camera 1 in image 2: matches near it carry no parallax.
    let c1_in_2 = kf2.pose.transform(&kf1.camera_center());
    let epipole = Vector2::new(
        kf2.intrinsics.fx * c1_in_2.x / c1_in_2.z + kf2.intrinsics.cx,
        kf2.intrinsics.fy * c1_in_2.y / c1_in_2.z + kf2.intrinsics.cy,
    );

    let mut matched2 = vec![false; kf2.num_features()];

    for (idx1, kp1) in kf1.keypoints.iter().enumerate() {
        if kf1.map_point(idx1).is_some() {
            continue;
        }
        let d1 = &kf1.descriptors[idx1];

        let mut best_dist = max_dist;
        let mut best_idx2: Option<usize> = None;

        for (idx2, kp2) in kf2.keypoints.iter().enumerate() {
            if matched2[idx2] || kf2.map_point(idx2).is_some() {
                continue;
            }

            let dx = epipole.x - kp2.uv.x;
            let dy = epipole.y - kp2.uv.y;
            if dx * dx + dy * dy < 100.0 * kf2.pyramid.scale(kp2.octave) {
                continue;
            }

            if !check_dist_epipolar_line(
                &kp1.uv,
                &kp2.uv,
                f12,
                kf2.pyramid.sigma2(kp2.octave),
            ) {
                continue;
            }

            let dist = d1.distance(&kf2.descriptors[idx2]);
            if dist < best_dist {
                best_dist = dist;
                best_idx2 = Some(idx2);
            }
        }

        if let Some(idx2) = best_idx2 {
            matches.push((idx1, idx2));
            matched2[idx2] = true;
        }
    }

    matches
}

/// Triangulate new map points between the current keyframe and its best
/// covisible neighbors. Returns the created landmark ids for probation.
pub(crate) fn create_new_map_points(
    map: &SharedMap,
    control: &MapperControl,
    current_id: KeyFrameId,
    config: &LocalMapperConfig,
) -> Vec<MapPointId> {
    let mut created = Vec::new();

    let neighbors: Vec<KeyFrameId> = {
        let mut m = map.write();
        match m.keyframe_mut(current_id) {
            Some(kf) => kf.best_covisibles(config.point_neighbors),
            None => return created,
        }
    };

    for (i, &neighbor_id) in neighbors.iter().enumerate() {
        // Catch up with the queue instead of exhausting every neighbor.
        if i > 0 && control.has_new_keyframes() {
            return created;
        }

        let mut m = map.write();
        let n_before = created.len();
        triangulate_with_neighbor(&mut m, current_id, neighbor_id, config, &mut created);
        drop(m);

        if created.len() > n_before {
            debug!(
                current = %current_id,
                neighbor = %neighbor_id,
                n_new = created.len() - n_before,
                "triangulated new map points"
            );
        }
    }

    created
}

fn triangulate_with_neighbor(
    map: &mut Map,
    current_id: KeyFrameId,
    neighbor_id: KeyFrameId,
    config: &LocalMapperConfig,
    created: &mut Vec<MapPointId>,
) {
    let (Some(kf1), Some(kf2)) = (map.keyframe(current_id), map.keyframe(neighbor_id)) else {
        return;
    };
    if kf2.is_bad {
        return;
    }

    // The baseline must be long enough relative to the neighbor's scene
    // depth for triangulation to be conditioned.
    let baseline = (kf2.camera_center() - kf1.camera_center()).norm();
    let Some(median_depth) = map.scene_median_depth(neighbor_id, 2) else {
        return;
    };
    if baseline / median_depth < config.min_baseline_depth_ratio {
        return;
    }

    let f12 = compute_f12(kf1, kf2);
    let matches = search_for_triangulation(kf1, kf2, &f12, config.descriptor_threshold);

    let ratio_factor = 1.5 * kf1.pyramid.scale_factor;

    let pose1 = kf1.pose.clone();
    let pose2 = kf2.pose.clone();
    let o1 = kf1.camera_center();
    let o2 = kf2.camera_center();
    let m1 = pose1.matrix3x4();
    let m2 = pose2.matrix3x4();

    for (idx1, idx2) in matches {
        let (kf1, kf2) = match (map.keyframe(current_id), map.keyframe(neighbor_id)) {
            (Some(a), Some(b)) => (a, b),
            _ => return,
        };
        let kp1 = kf1.keypoints[idx1];
        let kp2 = kf2.keypoints[idx2];

        // Parallax between the viewing rays in world coordinates.
        let xn1 = kf1.intrinsics.unproject(&kp1.uv);
        let xn2 = kf2.intrinsics.unproject(&kp2.uv);
        let ray1 = pose1.rotation.transpose() * xn1;
        let ray2 = pose2.rotation.transpose() * xn2;
        let cos_parallax = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());

        if cos_parallax <= 0.0 || cos_parallax >= 0.9998 {
            continue;
        }

        // DLT on the normalized rays against the bare [R|t] projections.
        let x3d = triangulate_point(
            &Vector2::new(xn1.x, xn1.y),
            &Vector2::new(xn2.x, xn2.y),
            &m1,
            &m2,
        );
        if !x3d.iter().all(|v| v.is_finite()) {
            continue;
        }

        let p_c1 = pose1.transform(&x3d);
        if p_c1.z <= 0.0 {
            continue;
        }
        let p_c2 = pose2.transform(&x3d);
        if p_c2.z <= 0.0 {
            continue;
        }

        // Reprojection gates at the observation's pyramid level.
        let sigma2_1 = kf1.pyramid.sigma2(kp1.octave);
        let err1 = kf1.intrinsics.project(&p_c1) - kp1.uv;
        if err1.norm_squared() > 5.991 * sigma2_1 {
            continue;
        }
        let sigma2_2 = kf2.pyramid.sigma2(kp2.octave);
        let err2 = kf2.intrinsics.project(&p_c2) - kp2.uv;
        if err2.norm_squared() > 5.991 * sigma2_2 {
            continue;
        }

        // Scale consistency between the observation octaves.
        let dist1 = (x3d - o1).norm();
        let dist2 = (x3d - o2).norm();
        if dist1 == 0.0 || dist2 == 0.0 {
            continue;
        }
        let ratio_dist = dist2 / dist1;
        let ratio_octave = kf1.pyramid.scale(kp1.octave) / kf2.pyramid.scale(kp2.octave);
        if ratio_dist * ratio_factor < ratio_octave || ratio_dist > ratio_octave * ratio_factor {
            continue;
        }

        let descriptor = kf1.descriptors[idx1];
        let mp_id = map.create_map_point(x3d, descriptor, current_id);
        map.associate_point(current_id, idx1, mp_id);
        map.associate_point(neighbor_id, idx2, mp_id);
        map.compute_distinctive_point_descriptor(mp_id);
        map.update_point_normal_and_depth(mp_id);

        created.push(mp_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CameraIntrinsics, Descriptor, Frame, PointFeature, ScalePyramid};
    use crate::geometry::Pose;
    use crate::map::shared_map;
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, Vector3};

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0)
    }

    fn world_cloud(n: usize) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|i| {
                let fi = i as f64;
                Vector3::new(
                    (1.3 * fi).sin() * 1.2,
                    (0.7 * fi + 0.5).cos() * 0.9,
                    4.0 + 1.5 * (0.9 * fi + 1.0).sin().abs(),
                )
            })
            .collect()
    }

    fn tagged_descriptor(i: usize) -> Descriptor {
        let mut d = Descriptor::default();
        d.0[i % 32] = 0xAA;
        d.0[(i * 7 + 3) % 32] = (i % 251) as u8 | 1;
        d
    }

    fn frame_for(world: &[Vector3<f64>], pose: &Pose) -> Frame {
        let k = intrinsics();
        let keypoints: Vec<PointFeature> = world
            .iter()
            .map(|x| PointFeature {
                uv: k.project(&pose.transform(x)),
                octave: 0,
            })
            .collect();
        let descriptors: Vec<Descriptor> = (0..world.len()).map(tagged_descriptor).collect();
        Frame::new(
            keypoints,
            descriptors,
            Vec::new(),
            Vec::new(),
            k,
            ScalePyramid::default(),
            ScalePyramid::default(),
        )
        .unwrap()
    }

    #[test]
    fn f12_annihilates_corresponding_points() {
        let world = world_cloud(10);
        let pose1 = Pose::identity();
        let pose2 = Pose::new(
            *Rotation3::from_euler_angles(0.0, 0.05, 0.0).matrix(),
            Vector3::new(-0.8, 0.0, 0.0),
        );

        let map = shared_map();
        let mut m = map.write();
        let kf1 = m.create_keyframe(pose1.clone(), frame_for(&world, &pose1));
        let kf2 = m.create_keyframe(pose2.clone(), frame_for(&world, &pose2));

        let f12 = compute_f12(m.keyframe(kf1).unwrap(), m.keyframe(kf2).unwrap());
        for x in &world {
            let u1 = intrinsics().project(&pose1.transform(x));
            let u2 = intrinsics().project(&pose2.transform(x));
            let x1 = nalgebra::Vector3::new(u1.x, u1.y, 1.0);
            let x2 = nalgebra::Vector3::new(u2.x, u2.y, 1.0);
            let residual = (x1.transpose() * f12 * x2)[(0, 0)];
            assert!(residual.abs() < 1e-6, "residual {residual}");
        }
    }

    #[test]
    fn creates_points_for_unmatched_features() {
        let world = world_cloud(24);
        let pose1 = Pose::identity();
        let pose2 = Pose::new(
            *Rotation3::from_euler_angles(0.0, 0.04, 0.0).matrix(),
            Vector3::new(-0.7, 0.0, 0.0),
        );

        let map = shared_map();
        let (kf1, kf2) = {
            let mut m = map.write();
            let kf1 = m.create_keyframe(pose1.clone(), frame_for(&world, &pose1));
            let kf2 = m.create_keyframe(pose2.clone(), frame_for(&world, &pose2));

            // Seed the first 8 tracks so the keyframes are covisible and the
            // neighbor has a scene depth estimate.
            for i in 0..8 {
                let mp = m.create_map_point(world[i], tagged_descriptor(i), kf1);
                m.associate_point(kf1, i, mp);
                m.associate_point(kf2, i, mp);
            }
            m.update_connections(kf1);
            (kf1, kf2)
        };

        let control = MapperControl::new();
        let config = LocalMapperConfig::default();
        let created = create_new_map_points(&map, &control, kf1, &config);

        // The remaining 16 tracks are triangulated at their true positions.
        assert_eq!(created.len(), 16);
        let m = map.read();
        for mp_id in &created {
            let mp = m.map_point(*mp_id).unwrap();
            let original = world
                .iter()
                .map(|w| (w - mp.position).norm())
                .fold(f64::INFINITY, f64::min);
            assert_relative_eq!(original, 0.0, epsilon = 1e-5);
            assert_eq!(mp.num_observations(), 2);
        }
        assert_eq!(m.keyframe(kf2).unwrap().num_map_points(), 24);
    }

    #[test]
    fn short_baseline_creates_nothing() {
        let world = world_cloud(24);
        let pose1 = Pose::identity();
        // A millimetric baseline against a ~4 unit scene depth.
        let pose2 = Pose::new(Matrix3::identity(), Vector3::new(-0.001, 0.0, 0.0));

        let map = shared_map();
        let kf1 = {
            let mut m = map.write();
            let kf1 = m.create_keyframe(pose1.clone(), frame_for(&world, &pose1));
            let kf2 = m.create_keyframe(pose2.clone(), frame_for(&world, &pose2));
            for i in 0..8 {
                let mp = m.create_map_point(world[i], tagged_descriptor(i), kf1);
                m.associate_point(kf1, i, mp);
                m.associate_point(kf2, i, mp);
            }
            m.update_connections(kf1);
            kf1
        };

        let control = MapperControl::new();
        let created = create_new_map_points(&map, &control, kf1, &LocalMapperConfig::default());
        assert!(created.is_empty());
    }
}
