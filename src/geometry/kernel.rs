//! Pure two-view geometry kernel.
//!
//! All functions are side-effect free and never panic on degenerate input:
//! model estimation returns `None` when the SVD cannot be formed, and
//! triangulation may return non-finite coordinates that callers are expected
//! to screen with `is_finite`.

use nalgebra::{DMatrix, Matrix3, Matrix3x4, Matrix4, Vector2, Vector3};

/// Skew-symmetric matrix `[v]×` such that `[v]× u = v × u`.
#[inline]
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Hartley normalization: translate the centroid to the origin and scale so
/// the mean absolute deviation along each axis is one.
///
/// Returns the normalized points and the similarity `T` with
/// `p_norm = T * p_homogeneous`.
pub fn normalize_points(points: &[Vector2<f64>]) -> (Vec<Vector2<f64>>, Matrix3<f64>) {
    let n = points.len();
    if n == 0 {
        return (Vec::new(), Matrix3::identity());
    }

    let mut mean = Vector2::zeros();
    for p in points {
        mean += p;
    }
    mean /= n as f64;

    let mut normalized: Vec<Vector2<f64>> = points.iter().map(|p| p - mean).collect();

    let mut mean_dev = Vector2::zeros();
    for p in &normalized {
        mean_dev.x += p.x.abs();
        mean_dev.y += p.y.abs();
    }
    mean_dev /= n as f64;

    let sx = 1.0 / mean_dev.x;
    let sy = 1.0 / mean_dev.y;

    for p in &mut normalized {
        p.x *= sx;
        p.y *= sy;
    }

    let t = Matrix3::new(
        sx, 0.0, -mean.x * sx, //
        0.0, sy, -mean.y * sy, //
        0.0, 0.0, 1.0,
    );

    (normalized, t)
}

/// Homography from point correspondences by DLT (two rows per match).
///
/// `H21` maps frame-1 coordinates onto frame-2 coordinates: `x2 ~ H21 x1`.
pub fn compute_h21(p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = p1.len();
    // At least 9 rows so the thin SVD carries the full 9x9 right factor.
    let mut a = DMatrix::<f64>::zeros((2 * n).max(9), 9);

    for i in 0..n {
        let (u1, v1) = (p1[i].x, p1[i].y);
        let (u2, v2) = (p2[i].x, p2[i].y);

        a[(2 * i, 3)] = -u1;
        a[(2 * i, 4)] = -v1;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = v2 * u1;
        a[(2 * i, 7)] = v2 * v1;
        a[(2 * i, 8)] = v2;

        a[(2 * i + 1, 0)] = u1;
        a[(2 * i + 1, 1)] = v1;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -u2 * u1;
        a[(2 * i + 1, 7)] = -u2 * v1;
        a[(2 * i + 1, 8)] = -u2;
    }

    if !a.iter().all(|v| v.is_finite()) {
        return None;
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t?;
    let h = v_t.row(8);

    Some(Matrix3::new(
        h[0], h[1], h[2], //
        h[3], h[4], h[5], //
        h[6], h[7], h[8],
    ))
}

/// Fundamental matrix by the normalized 8-point algorithm, rank-2 enforced.
///
/// `F21` relates pixels as `x2ᵀ F21 x1 = 0`.
pub fn compute_f21(p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = p1.len();
    // At least 9 rows so the thin SVD carries the full 9x9 right factor.
    let mut a = DMatrix::<f64>::zeros(n.max(9), 9);

    for i in 0..n {
        let (u1, v1) = (p1[i].x, p1[i].y);
        let (u2, v2) = (p2[i].x, p2[i].y);

        a[(i, 0)] = u2 * u1;
        a[(i, 1)] = u2 * v1;
        a[(i, 2)] = u2;
        a[(i, 3)] = v2 * u1;
        a[(i, 4)] = v2 * v1;
        a[(i, 5)] = v2;
        a[(i, 6)] = u1;
        a[(i, 7)] = v1;
        a[(i, 8)] = 1.0;
    }

    if !a.iter().all(|v| v.is_finite()) {
        return None;
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t?;
    let f = v_t.row(8);

    let f_pre = Matrix3::new(
        f[0], f[1], f[2], //
        f[3], f[4], f[5], //
        f[6], f[7], f[8],
    );

    // Enforce rank 2 by zeroing the smallest singular value.
    let svd2 = f_pre.svd(true, true);
    let u = svd2.u?;
    let v_t2 = svd2.v_t?;
    let s = svd2.singular_values;
    let d = Matrix3::from_diagonal(&Vector3::new(s[0], s[1], 0.0));

    Some(u * d * v_t2)
}

/// Decompose an essential matrix into the two candidate rotations and the
/// unit translation: the four motion hypotheses are `(R1, ±t)` and `(R2, ±t)`.
pub fn decompose_essential(e: &Matrix3<f64>) -> Option<(Matrix3<f64>, Matrix3<f64>, Vector3<f64>)> {
    if !e.iter().all(|v| v.is_finite()) {
        return None;
    }
    let svd = e.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut t = u.column(2).into_owned();
    t /= t.norm();

    let w = Matrix3::new(
        0.0, -1.0, 0.0, //
        1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0,
    );

    let mut r1 = u * w * v_t;
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }

    let mut r2 = u * w.transpose() * v_t;
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }

    Some((r1, r2, t))
}

/// One motion hypothesis recovered from a homography.
#[derive(Debug, Clone)]
pub struct HomographyMotion {
    pub rotation: Matrix3<f64>,
    /// Unit-length translation.
    pub translation: Vector3<f64>,
    /// Plane normal with non-negative z.
    pub normal: Vector3<f64>,
}

/// Faugeras decomposition of a homography into 8 motion hypotheses.
///
/// Fails when the singular values of `K⁻¹ H K` are too close to equal
/// (d1/d2 or d2/d3 ≤ 1.00001), which covers pure rotations and other
/// degenerate planes.
pub fn decompose_homography(
    h21: &Matrix3<f64>,
    k: &Matrix3<f64>,
) -> Option<Vec<HomographyMotion>> {
    let inv_k = k.try_inverse()?;
    let a = inv_k * h21 * k;
    if !a.iter().all(|v| v.is_finite()) {
        return None;
    }

    let svd = a.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let v = v_t.transpose();
    let w = svd.singular_values;

    let s = u.determinant() * v_t.determinant();

    let d1 = w[0];
    let d2 = w[1];
    let d3 = w[2];

    if d1 / d2 < 1.00001 || d2 / d3 < 1.00001 {
        return None;
    }

    let mut hypotheses = Vec::with_capacity(8);

    // n' = [x1 0 x3], four sign combinations per case.
    let aux1 = ((d1 * d1 - d2 * d2) / (d1 * d1 - d3 * d3)).sqrt();
    let aux3 = ((d2 * d2 - d3 * d3) / (d1 * d1 - d3 * d3)).sqrt();
    let x1 = [aux1, aux1, -aux1, -aux1];
    let x3 = [aux3, -aux3, aux3, -aux3];

    // Case d' = d2.
    let aux_stheta = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 + d3) * d2);
    let ctheta = (d2 * d2 + d1 * d3) / ((d1 + d3) * d2);
    let stheta = [aux_stheta, -aux_stheta, -aux_stheta, aux_stheta];

    for i in 0..4 {
        let rp = Matrix3::new(
            ctheta, 0.0, -stheta[i], //
            0.0, 1.0, 0.0, //
            stheta[i], 0.0, ctheta,
        );
        let rotation = s * u * rp * v_t;

        let tp = Vector3::new(x1[i], 0.0, -x3[i]) * (d1 - d3);
        let t = u * tp;
        let translation = t / t.norm();

        let np = Vector3::new(x1[i], 0.0, x3[i]);
        let mut normal = v * np;
        if normal.z < 0.0 {
            normal = -normal;
        }

        hypotheses.push(HomographyMotion {
            rotation,
            translation,
            normal,
        });
    }

    // Case d' = -d2.
    let aux_sphi = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 - d3) * d2);
    let cphi = (d1 * d3 - d2 * d2) / ((d1 - d3) * d2);
    let sphi = [aux_sphi, -aux_sphi, -aux_sphi, aux_sphi];

    for i in 0..4 {
        let rp = Matrix3::new(
            cphi, 0.0, sphi[i], //
            0.0, -1.0, 0.0, //
            sphi[i], 0.0, -cphi,
        );
        let rotation = s * u * rp * v_t;

        let tp = Vector3::new(x1[i], 0.0, x3[i]) * (d1 + d3);
        let t = u * tp;
        let translation = t / t.norm();

        let np = Vector3::new(x1[i], 0.0, x3[i]);
        let mut normal = v * np;
        if normal.z < 0.0 {
            normal = -normal;
        }

        hypotheses.push(HomographyMotion {
            rotation,
            translation,
            normal,
        });
    }

    Some(hypotheses)
}

/// DLT triangulation of a point from two projections.
///
/// Returns the homogeneous-normalized 3D point; with a vanishing homogeneous
/// coordinate the result is non-finite, which callers screen out.
pub fn triangulate_point(
    x1: &Vector2<f64>,
    x2: &Vector2<f64>,
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
) -> Vector3<f64> {
    let mut a = Matrix4::<f64>::zeros();

    for j in 0..4 {
        a[(0, j)] = x1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = x1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = x2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = x2.y * p2[(2, j)] - p2[(1, j)];
    }

    let svd = a.svd(true, true);
    let v_t = match svd.v_t {
        Some(v_t) => v_t,
        None => return Vector3::repeat(f64::NAN),
    };
    let x = v_t.row(3);

    Vector3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3])
}

/// Triangulate a line endpoint from two back-projected line planes and the
/// endpoint's own DLT rows.
///
/// The first two rows constrain the point to the planes `ℓaᵀ Ma` and
/// `ℓbᵀ Mb`; the last two pin it onto the viewing ray of `(x, y)` under `Mc`.
pub fn triangulate_line_point(
    l_a: &Vector3<f64>,
    m_a: &Matrix3x4<f64>,
    l_b: &Vector3<f64>,
    m_b: &Matrix3x4<f64>,
    xy: &Vector2<f64>,
    m_c: &Matrix3x4<f64>,
) -> Vector3<f64> {
    let plane_a = l_a.transpose() * m_a;
    let plane_b = l_b.transpose() * m_b;

    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = plane_a[j];
        a[(1, j)] = plane_b[j];
        a[(2, j)] = xy.x * m_c[(2, j)] - m_c[(0, j)];
        a[(3, j)] = xy.y * m_c[(2, j)] - m_c[(1, j)];
    }

    let svd = a.svd(true, true);
    let v_t = match svd.v_t {
        Some(v_t) => v_t,
        None => return Vector3::repeat(f64::NAN),
    };
    let x = v_t.row(3);

    Vector3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3])
}
