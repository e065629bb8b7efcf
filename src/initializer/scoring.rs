//! Model scoring for the two-view RANSAC.
//!
//! Both scorers return a per-match inlier mask together with a scalar score.
//! A match is an inlier only when it passes in both transfer directions, but
//! each passing direction contributes its margin to the score independently,
//! so a one-directional failure still adds the other direction's margin.

use nalgebra::{Matrix3, Vector2};

use crate::frame::PointFeature;

/// Chi-square 95% threshold, 2 degrees of freedom.
const CHI2_2D: f64 = 5.991;
/// Chi-square 95% threshold, 1 degree of freedom.
const CHI2_1D: f64 = 3.841;

fn transfer(h: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let inv_w = 1.0 / (h[(2, 0)] * p.x + h[(2, 1)] * p.y + h[(2, 2)]);
    Vector2::new(
        (h[(0, 0)] * p.x + h[(0, 1)] * p.y + h[(0, 2)]) * inv_w,
        (h[(1, 0)] * p.x + h[(1, 1)] * p.y + h[(1, 2)]) * inv_w,
    )
}

/// Score a homography by symmetric transfer error.
///
/// `h21` maps frame 1 into frame 2 and `h12` is its inverse.
pub fn check_homography(
    h21: &Matrix3<f64>,
    h12: &Matrix3<f64>,
    matches: &[(usize, usize)],
    keys1: &[PointFeature],
    keys2: &[PointFeature],
    sigma: f64,
) -> (f64, Vec<bool>) {
    let inv_sigma2 = 1.0 / (sigma * sigma);
    let mut inliers = vec![false; matches.len()];
    let mut score = 0.0;

    for (i, &(i1, i2)) in matches.iter().enumerate() {
        let p1 = keys1[i1].uv;
        let p2 = keys2[i2].uv;
        let mut is_inlier = true;

        // Reprojection error in the first image: x2 mapped through H12.
        let p2_in_1 = transfer(h12, &p2);
        let chi2_1 = (p1 - p2_in_1).norm_squared() * inv_sigma2;
        if chi2_1 > CHI2_2D {
            is_inlier = false;
        } else {
            score += CHI2_2D - chi2_1;
        }

        // Reprojection error in the second image: x1 mapped through H21.
        let p1_in_2 = transfer(h21, &p1);
        let chi2_2 = (p2 - p1_in_2).norm_squared() * inv_sigma2;
        if chi2_2 > CHI2_2D {
            is_inlier = false;
        } else {
            score += CHI2_2D - chi2_2;
        }

        inliers[i] = is_inlier;
    }

    (score, inliers)
}

/// Score a fundamental matrix by point-to-epipolar-line distance in both
/// images.
///
/// The inlier gate uses the 1-DOF threshold while the score margin uses the
/// 2-DOF constant, keeping F scores comparable with H scores.
pub fn check_fundamental(
    f21: &Matrix3<f64>,
    matches: &[(usize, usize)],
    keys1: &[PointFeature],
    keys2: &[PointFeature],
    sigma: f64,
) -> (f64, Vec<bool>) {
    let inv_sigma2 = 1.0 / (sigma * sigma);
    let mut inliers = vec![false; matches.len()];
    let mut score = 0.0;

    for (i, &(i1, i2)) in matches.iter().enumerate() {
        let p1 = keys1[i1].uv;
        let p2 = keys2[i2].uv;
        let mut is_inlier = true;

        // Epipolar line of x1 in the second image: l2 = F21 x1.
        let a2 = f21[(0, 0)] * p1.x + f21[(0, 1)] * p1.y + f21[(0, 2)];
        let b2 = f21[(1, 0)] * p1.x + f21[(1, 1)] * p1.y + f21[(1, 2)];
        let c2 = f21[(2, 0)] * p1.x + f21[(2, 1)] * p1.y + f21[(2, 2)];
        let num2 = a2 * p2.x + b2 * p2.y + c2;
        let chi2_1 = num2 * num2 / (a2 * a2 + b2 * b2) * inv_sigma2;
        if chi2_1 > CHI2_1D {
            is_inlier = false;
        } else {
            score += CHI2_2D - chi2_1;
        }

        // Epipolar line of x2 in the first image: l1 = F21ᵀ x2.
        let a1 = f21[(0, 0)] * p2.x + f21[(1, 0)] * p2.y + f21[(2, 0)];
        let b1 = f21[(0, 1)] * p2.x + f21[(1, 1)] * p2.y + f21[(2, 1)];
        let c1 = f21[(0, 2)] * p2.x + f21[(1, 2)] * p2.y + f21[(2, 2)];
        let num1 = a1 * p1.x + b1 * p1.y + c1;
        let chi2_2 = num1 * num1 / (a1 * a1 + b1 * b1) * inv_sigma2;
        if chi2_2 > CHI2_1D {
            is_inlier = false;
        } else {
            score += CHI2_2D - chi2_2;
        }

        inliers[i] = is_inlier;
    }

    (score, inliers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::skew_symmetric;
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, Vector3};

    fn features(points: &[Vector2<f64>]) -> Vec<PointFeature> {
        points
            .iter()
            .map(|&uv| PointFeature { uv, octave: 0 })
            .collect()
    }

    fn k() -> Matrix3<f64> {
        Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn perfect_homography_scores_all_inliers() {
        let h = Matrix3::new(1.01, 0.02, 5.0, -0.015, 0.99, -3.0, 1e-5, -2e-5, 1.0);
        let p1: Vec<Vector2<f64>> = (0..10)
            .map(|i| Vector2::new(100.0 + 30.0 * i as f64, 80.0 + 17.0 * ((i * 5) % 7) as f64))
            .collect();
        let p2: Vec<Vector2<f64>> = p1.iter().map(|p| transfer(&h, p)).collect();
        let matches: Vec<(usize, usize)> = (0..10).map(|i| (i, i)).collect();

        let (score, inliers) = check_homography(
            &h,
            &h.try_inverse().unwrap(),
            &matches,
            &features(&p1),
            &features(&p2),
            1.0,
        );
        assert!(inliers.iter().all(|&b| b));
        assert_relative_eq!(score, 10.0 * 2.0 * CHI2_2D, epsilon = 1e-6);
    }

    #[test]
    fn homography_scoring_symmetric_under_swap() {
        let h = Matrix3::new(0.98, -0.03, 8.0, 0.02, 1.03, -4.0, 2e-5, 1e-5, 1.0);
        let h_inv = h.try_inverse().unwrap();
        let p1: Vec<Vector2<f64>> = (0..12)
            .map(|i| Vector2::new(150.0 + 25.0 * i as f64, 60.0 + 23.0 * ((i * 3) % 5) as f64))
            .collect();
        // Half the matches are perturbed into outliers.
        let p2: Vec<Vector2<f64>> = p1
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mut q = transfer(&h, p);
                if i % 2 == 0 {
                    q.x += 15.0;
                }
                q
            })
            .collect();
        let matches: Vec<(usize, usize)> = (0..12).map(|i| (i, i)).collect();
        let swapped: Vec<(usize, usize)> = matches.iter().map(|&(a, b)| (b, a)).collect();

        let f1 = features(&p1);
        let f2 = features(&p2);
        let (score_fwd, inl_fwd) = check_homography(&h, &h_inv, &matches, &f1, &f2, 1.0);
        let (score_bwd, inl_bwd) = check_homography(&h_inv, &h, &swapped, &f2, &f1, 1.0);

        assert_relative_eq!(score_fwd, score_bwd, epsilon = 1e-9);
        assert_eq!(inl_fwd, inl_bwd);
        assert_eq!(inl_fwd.iter().filter(|&&b| b).count(), 6);
    }

    #[test]
    fn fundamental_flags_epipolar_violations() {
        let r = *Rotation3::from_euler_angles(0.01, -0.04, 0.02).matrix();
        let t = Vector3::new(0.9, 0.1, -0.05);
        let kk = k();
        let k_inv = kk.try_inverse().unwrap();
        let f = k_inv.transpose() * skew_symmetric(&t) * r * k_inv;

        // Generate correspondences from 3D points, then corrupt a few.
        let mut p1 = Vec::new();
        let mut p2 = Vec::new();
        for i in 0..15 {
            let fi = i as f64;
            let x = Vector3::new((1.1 * fi).sin(), (0.6 * fi).cos() * 0.8, 4.0 + (fi * 0.37).sin());
            let c1 = kk * x;
            let c2 = kk * (r * x + t);
            p1.push(Vector2::new(c1.x / c1.z, c1.y / c1.z));
            let mut q = Vector2::new(c2.x / c2.z, c2.y / c2.z);
            if i >= 12 {
                q.y += 20.0;
            }
            p2.push(q);
        }
        let matches: Vec<(usize, usize)> = (0..15).map(|i| (i, i)).collect();

        let (score, inliers) =
            check_fundamental(&f, &matches, &features(&p1), &features(&p2), 1.0);
        assert!(score > 0.0);
        assert_eq!(inliers.iter().filter(|&&b| b).count(), 12);
        assert!(inliers[..12].iter().all(|&b| b));
        assert!(inliers[12..].iter().all(|&b| !b));
    }
}
