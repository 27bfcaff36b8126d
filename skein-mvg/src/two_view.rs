//! Two-view relative geometry for map bootstrapping.
//!
//! The initializer runs two RANSAC model searches over the same
//! correspondence set: a homography (planar / low-parallax scenes) and a
//! fundamental matrix (general scenes). This module provides the per-sample
//! estimators, the symmetric-transfer χ² scoring, and the
//! motion-hypothesis enumeration and voting used once a model wins.

use nalgebra::{DMatrix, Isometry3, Matrix3, Point2, Point3, Vector3};

/// Result of reconstructing relative motion and structure from a model.
///
/// `points[i]` is `Some` exactly when correspondence `i` was triangulated
/// ("good" under the cheirality, reprojection and parallax gates).
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub points: Vec<Option<Point3<f64>>>,
    pub n_good: usize,
    pub parallax_deg: f64,
}

/// Hartley normalization: zero mean, unit mean absolute deviation.
///
/// Returns the normalized points and the 3×3 transform `T` with
/// `x_norm = T·x`.
pub fn normalize_points(pts: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = pts.len() as f64;
    let mean_x = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = pts.iter().map(|p| p.y).sum::<f64>() / n;
    let dev_x = pts.iter().map(|p| (p.x - mean_x).abs()).sum::<f64>() / n;
    let dev_y = pts.iter().map(|p| (p.y - mean_y).abs()).sum::<f64>() / n;
    let sx = if dev_x > 0.0 { 1.0 / dev_x } else { 1.0 };
    let sy = if dev_y > 0.0 { 1.0 / dev_y } else { 1.0 };
    let normalized = pts
        .iter()
        .map(|p| Point2::new((p.x - mean_x) * sx, (p.y - mean_y) * sy))
        .collect();
    let t = Matrix3::new(sx, 0.0, -mean_x * sx, 0.0, sy, -mean_y * sy, 0.0, 0.0, 1.0);
    (normalized, t)
}

/// DLT homography from ≥ 4 normalized correspondences (`x2 ≈ H21·x1`).
pub fn compute_homography(p1: &[Point2<f64>], p2: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = p1.len();
    if n < 4 || p2.len() != n {
        return None;
    }
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let (u1, v1) = (p1[i].x, p1[i].y);
        let (u2, v2) = (p2[i].x, p2[i].y);
        let r = 2 * i;
        a[(r, 3)] = -u1;
        a[(r, 4)] = -v1;
        a[(r, 5)] = -1.0;
        a[(r, 6)] = v2 * u1;
        a[(r, 7)] = v2 * v1;
        a[(r, 8)] = v2;
        a[(r + 1, 0)] = u1;
        a[(r + 1, 1)] = v1;
        a[(r + 1, 2)] = 1.0;
        a[(r + 1, 6)] = -u2 * u1;
        a[(r + 1, 7)] = -u2 * v1;
        a[(r + 1, 8)] = -u2;
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(8);
    Some(Matrix3::new(
        h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8],
    ))
}

/// Normalized 8-point fundamental matrix (`x2ᵀ·F21·x1 = 0`), rank-2
/// enforced.
pub fn compute_fundamental(p1: &[Point2<f64>], p2: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = p1.len();
    if n < 8 || p2.len() != n {
        return None;
    }
    let mut a = DMatrix::<f64>::zeros(n, 9);
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
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let f = v_t.row(8);
    let f_pre = Matrix3::new(f[0], f[1], f[2], f[3], f[4], f[5], f[6], f[7], f[8]);

    // Project to rank 2.
    let mut svd2 = f_pre.svd(true, true);
    svd2.singular_values[2] = 0.0;
    svd2.recompose().ok()
}

/// Symmetric-transfer score of a homography over all correspondences.
///
/// χ² threshold 5.991 per direction; a pair is an inlier when both
/// directions pass, and each passing direction contributes `5.991 − χ²`.
pub fn check_homography(
    h21: &Matrix3<f64>,
    h12: &Matrix3<f64>,
    pairs: &[(Point2<f64>, Point2<f64>)],
    sigma: f64,
) -> (f64, Vec<bool>) {
    const TH: f64 = 5.991;
    let inv_sigma2 = 1.0 / (sigma * sigma);
    let mut score = 0.0;
    let mut inliers = vec![false; pairs.len()];

    for (i, (x1, x2)) in pairs.iter().enumerate() {
        let mut ok = true;

        // Reprojection of x2 into image 1.
        let p = h12 * x2.to_homogeneous();
        if p[2].abs() < 1e-15 {
            continue;
        }
        let chi2_1 = ((x1.x - p[0] / p[2]).powi(2) + (x1.y - p[1] / p[2]).powi(2)) * inv_sigma2;
        if chi2_1 > TH {
            ok = false;
        } else {
            score += TH - chi2_1;
        }

        // Reprojection of x1 into image 2.
        let p = h21 * x1.to_homogeneous();
        if p[2].abs() < 1e-15 {
            continue;
        }
        let chi2_2 = ((x2.x - p[0] / p[2]).powi(2) + (x2.y - p[1] / p[2]).powi(2)) * inv_sigma2;
        if chi2_2 > TH {
            ok = false;
        } else {
            score += TH - chi2_2;
        }

        inliers[i] = ok;
    }
    (score, inliers)
}

/// Squared point-to-epipolar-line distance of `x2` against the line `F21·x1`.
pub fn epipolar_dist_sq(f21: &Matrix3<f64>, x1: &Point2<f64>, x2: &Point2<f64>) -> f64 {
    let l = f21 * x1.to_homogeneous();
    let den = l[0] * l[0] + l[1] * l[1];
    if den <= 0.0 {
        return f64::INFINITY;
    }
    let num = l[0] * x2.x + l[1] * x2.y + l[2];
    num * num / den
}

/// Epipolar score of a fundamental matrix over all correspondences.
///
/// χ² threshold 3.841 per direction, score contribution capped at 5.991 so
/// H and F scores are comparable.
pub fn check_fundamental(
    f21: &Matrix3<f64>,
    pairs: &[(Point2<f64>, Point2<f64>)],
    sigma: f64,
) -> (f64, Vec<bool>) {
    const TH: f64 = 3.841;
    const TH_SCORE: f64 = 5.991;
    let inv_sigma2 = 1.0 / (sigma * sigma);
    let f12 = f21.transpose();
    let mut score = 0.0;
    let mut inliers = vec![false; pairs.len()];

    for (i, (x1, x2)) in pairs.iter().enumerate() {
        let mut ok = true;

        let chi2_1 = epipolar_dist_sq(f21, x1, x2) * inv_sigma2;
        if chi2_1 > TH {
            ok = false;
        } else {
            score += TH_SCORE - chi2_1;
        }

        let chi2_2 = epipolar_dist_sq(&f12, x2, x1) * inv_sigma2;
        if chi2_2 > TH {
            ok = false;
        } else {
            score += TH_SCORE - chi2_2;
        }

        inliers[i] = ok;
    }
    (score, inliers)
}

/// Fundamental matrix between two calibrated views from their poses:
/// `x1ᵀ·F12·x2 = 0`.
pub fn fundamental_between(
    k: &Matrix3<f64>,
    t_1w: &Isometry3<f64>,
    t_2w: &Isometry3<f64>,
) -> Matrix3<f64> {
    let r1 = t_1w.rotation.to_rotation_matrix();
    let r2 = t_2w.rotation.to_rotation_matrix();
    let r12 = r1.matrix() * r2.matrix().transpose();
    let t12 = -r12 * t_2w.translation.vector + t_1w.translation.vector;
    let k_inv = k
        .try_inverse()
        .expect("camera matrix is invertible by construction");
    k_inv.transpose() * crate::skew_symmetric(&t12) * r12 * k_inv
}

fn decompose_essential(e: &Matrix3<f64>) -> Option<(Matrix3<f64>, Matrix3<f64>, Vector3<f64>)> {
    let svd = e.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut t = u.column(2).into_owned();
    let norm = t.norm();
    if norm > 0.0 {
        t /= norm;
    }
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
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

/// Triangulate all inlier correspondences under hypothesis `(R, t)` and
/// count the ones passing cheirality, reprojection (4σ²) and parallax
/// gates.
fn check_rt(
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    pairs: &[(Point2<f64>, Point2<f64>)],
    inliers: &[bool],
    k: &Matrix3<f64>,
    sigma2: f64,
) -> (usize, f64, Vec<Option<Point3<f64>>>) {
    let th2 = 4.0 * sigma2;
    let mut p1 = nalgebra::Matrix3x4::zeros();
    p1.fixed_view_mut::<3, 3>(0, 0).copy_from(k);
    let mut p2 = nalgebra::Matrix3x4::zeros();
    p2.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    p2.fixed_view_mut::<3, 1>(0, 3).copy_from(t);
    let p2 = k * p2;

    let o2 = -r.transpose() * t;

    let mut points = vec![None; pairs.len()];
    let mut cos_parallaxes = Vec::new();
    let mut n_good = 0;

    for (i, (x1, x2)) in pairs.iter().enumerate() {
        if !inliers[i] {
            continue;
        }
        let Some(pw) = crate::triangulate_dlt(x1, &p1, x2, &p2) else {
            continue;
        };

        let n1 = pw.coords;
        let n2 = pw.coords - o2;
        let cos_parallax = n1.dot(&n2) / (n1.norm() * n2.norm());

        // Cheirality in both views; skipped for quasi-infinite points which
        // fail the parallax flag below anyway.
        if pw.z <= 0.0 && cos_parallax < 0.99998 {
            continue;
        }
        let pc2 = r * pw.coords + t;
        if pc2.z <= 0.0 && cos_parallax < 0.99998 {
            continue;
        }

        let e1 = {
            let u = k[(0, 0)] * pw.x / pw.z + k[(0, 2)];
            let v = k[(1, 1)] * pw.y / pw.z + k[(1, 2)];
            (u - x1.x).powi(2) + (v - x1.y).powi(2)
        };
        if e1 > th2 {
            continue;
        }
        let e2 = {
            let u = k[(0, 0)] * pc2.x / pc2.z + k[(0, 2)];
            let v = k[(1, 1)] * pc2.y / pc2.z + k[(1, 2)];
            (u - x2.x).powi(2) + (v - x2.y).powi(2)
        };
        if e2 > th2 {
            continue;
        }

        cos_parallaxes.push(cos_parallax);
        n_good += 1;
        if cos_parallax < 0.99998 {
            points[i] = Some(pw);
        }
    }

    let parallax_deg = if cos_parallaxes.is_empty() {
        0.0
    } else {
        cos_parallaxes.sort_by(|a, b| a.partial_cmp(b).expect("parallax cosines are finite"));
        let idx = (cos_parallaxes.len() - 1).min(50);
        cos_parallaxes[idx].clamp(-1.0, 1.0).acos().to_degrees()
    };
    (n_good, parallax_deg, points)
}

/// Motion and structure from a fundamental matrix.
///
/// Enumerates the four motion hypotheses of the essential decomposition and
/// requires a clear winner: enough good points (≥ `min_triangulated` and
/// ≥ 90% of the inliers), no runner-up above 70% of the best vote, and
/// parallax above `min_parallax_deg`.
pub fn reconstruct_f(
    f21: &Matrix3<f64>,
    pairs: &[(Point2<f64>, Point2<f64>)],
    inliers: &[bool],
    k: &Matrix3<f64>,
    sigma: f64,
    min_parallax_deg: f64,
    min_triangulated: usize,
) -> Option<Reconstruction> {
    let n_inliers = inliers.iter().filter(|b| **b).count();
    let e21 = k.transpose() * f21 * k;
    let (r1, r2, t) = decompose_essential(&e21)?;
    let sigma2 = sigma * sigma;

    let hypotheses = [(r1, t), (r1, -t), (r2, t), (r2, -t)];
    let results: Vec<_> = hypotheses
        .iter()
        .map(|(r, t)| check_rt(r, t, pairs, inliers, k, sigma2))
        .collect();

    let max_good = results.iter().map(|r| r.0).max().unwrap_or(0);
    let min_good = ((0.9 * n_inliers as f64) as usize).max(min_triangulated);
    let n_similar = results.iter().filter(|r| r.0 as f64 > 0.7 * max_good as f64).count();
    if max_good < min_good || n_similar > 1 {
        tracing::debug!(max_good, min_good, n_similar, "no clear motion hypothesis");
        return None;
    }

    let (best_idx, best) = results
        .iter()
        .enumerate()
        .max_by_key(|(_, r)| r.0)
        .expect("four hypotheses were evaluated");
    if best.1 < min_parallax_deg {
        return None;
    }
    let (r, t) = hypotheses[best_idx];
    Some(Reconstruction {
        rotation: r,
        translation: t,
        points: best.2.clone(),
        n_good: best.0,
        parallax_deg: best.1,
    })
}

/// Motion and structure from a homography (Faugeras & Lustman 1988).
///
/// Enumerates the eight decompositions and votes with the same gates as
/// [`reconstruct_f`], requiring the runner-up below 75% of the winner.
pub fn reconstruct_h(
    h21: &Matrix3<f64>,
    pairs: &[(Point2<f64>, Point2<f64>)],
    inliers: &[bool],
    k: &Matrix3<f64>,
    sigma: f64,
    min_parallax_deg: f64,
    min_triangulated: usize,
) -> Option<Reconstruction> {
    let n_inliers = inliers.iter().filter(|b| **b).count();
    let k_inv = k.try_inverse()?;
    let a = k_inv * h21 * k;

    let svd = a.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let s = u.determinant() * v_t.determinant();
    let (d1, d2, d3) = (
        svd.singular_values[0],
        svd.singular_values[1],
        svd.singular_values[2],
    );
    if d1 / d2 < 1.00001 || d2 / d3 < 1.00001 {
        return None;
    }

    let mut hypotheses: Vec<(Matrix3<f64>, Vector3<f64>)> = Vec::with_capacity(8);

    let aux1 = ((d1 * d1 - d2 * d2) / (d1 * d1 - d3 * d3)).sqrt();
    let aux3 = ((d2 * d2 - d3 * d3) / (d1 * d1 - d3 * d3)).sqrt();
    let x1s = [aux1, aux1, -aux1, -aux1];
    let x3s = [aux3, -aux3, aux3, -aux3];

    // Case d' = d2.
    let aux_stheta = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 + d3) * d2);
    let ctheta = (d2 * d2 + d1 * d3) / ((d1 + d3) * d2);
    let sthetas = [aux_stheta, -aux_stheta, -aux_stheta, aux_stheta];
    for i in 0..4 {
        #[rustfmt::skip]
        let rp = Matrix3::new(
            ctheta,     0.0, -sthetas[i],
            0.0,        1.0, 0.0,
            sthetas[i], 0.0, ctheta,
        );
        let r = s * u * rp * v_t;
        let tp = Vector3::new(x1s[i], 0.0, -x3s[i]) * (d1 - d3);
        let mut t = u * tp;
        let norm = t.norm();
        if norm > 0.0 {
            t /= norm;
        }
        hypotheses.push((r, t));
    }

    // Case d' = -d2.
    let aux_sphi = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 - d3) * d2);
    let cphi = (d1 * d3 - d2 * d2) / ((d1 - d3) * d2);
    let sphis = [aux_sphi, -aux_sphi, -aux_sphi, aux_sphi];
    for i in 0..4 {
        #[rustfmt::skip]
        let rp = Matrix3::new(
            cphi,     0.0, sphis[i],
            0.0,     -1.0, 0.0,
            sphis[i], 0.0, -cphi,
        );
        let r = s * u * rp * v_t;
        let tp = Vector3::new(x1s[i], 0.0, x3s[i]) * (d1 + d3);
        let mut t = u * tp;
        let norm = t.norm();
        if norm > 0.0 {
            t /= norm;
        }
        hypotheses.push((r, t));
    }

    let sigma2 = sigma * sigma;
    let mut best: Option<(usize, f64, Vec<Option<Point3<f64>>>, usize)> = None;
    let mut second_best_good = 0usize;
    for (idx, (r, t)) in hypotheses.iter().enumerate() {
        let (n_good, parallax, points) = check_rt(r, t, pairs, inliers, k, sigma2);
        match &best {
            Some((best_good, _, _, _)) if n_good <= *best_good => {
                second_best_good = second_best_good.max(n_good);
            }
            _ => {
                if let Some((prev_good, _, _, _)) = &best {
                    second_best_good = *prev_good;
                }
                best = Some((n_good, parallax, points, idx));
            }
        }
    }

    let (best_good, best_parallax, best_points, best_idx) = best?;
    if (second_best_good as f64) < 0.75 * best_good as f64
        && best_parallax >= min_parallax_deg
        && best_good > min_triangulated
        && (best_good as f64) > 0.9 * n_inliers as f64
    {
        let (r, t) = hypotheses[best_idx];
        Some(Reconstruction {
            rotation: r,
            translation: t,
            points: best_points,
            n_good: best_good,
            parallax_deg: best_parallax,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn k() -> Matrix3<f64> {
        Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0)
    }

    fn project(k: &Matrix3<f64>, r: &Matrix3<f64>, t: &Vector3<f64>, pw: &Point3<f64>) -> Point2<f64> {
        let pc = r * pw.coords + t;
        let h = k * pc;
        Point2::new(h[0] / h[2], h[1] / h[2])
    }

    fn synthetic_pairs(
        r: &Matrix3<f64>,
        t: &Vector3<f64>,
        n: usize,
        seed: u64,
    ) -> (Vec<(Point2<f64>, Point2<f64>)>, Vec<Point3<f64>>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let k = k();
        let ident = Matrix3::identity();
        let zero = Vector3::zeros();
        let mut pairs = Vec::new();
        let mut pts = Vec::new();
        while pairs.len() < n {
            let pw = Point3::new(
                rng.gen::<f64>() * 4.0 - 2.0,
                rng.gen::<f64>() * 4.0 - 2.0,
                rng.gen::<f64>() * 4.0 + 4.0,
            );
            let x1 = project(&k, &ident, &zero, &pw);
            let pc2 = r * pw.coords + t;
            if pc2.z <= 0.1 {
                continue;
            }
            let x2 = project(&k, r, t, &pw);
            pairs.push((x1, x2));
            pts.push(pw);
        }
        (pairs, pts)
    }

    #[test]
    fn normalization_centers_and_scales() {
        let pts = vec![
            Point2::new(10.0, 20.0),
            Point2::new(30.0, 40.0),
            Point2::new(-10.0, 0.0),
            Point2::new(50.0, 60.0),
        ];
        let (norm, t) = normalize_points(&pts);
        let mean_x: f64 = norm.iter().map(|p| p.x).sum::<f64>() / 4.0;
        let dev_x: f64 = norm.iter().map(|p| p.x.abs()).sum::<f64>() / 4.0;
        assert_relative_eq!(mean_x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(dev_x, 1.0, epsilon = 1e-12);
        let p0 = t * pts[0].to_homogeneous();
        assert_relative_eq!(p0[0], norm[0].x, epsilon = 1e-12);
    }

    #[test]
    fn fundamental_satisfies_epipolar_constraint() {
        let r = nalgebra::Rotation3::from_scaled_axis(Vector3::new(0.0, 0.03, 0.01));
        let t = Vector3::new(-0.4, 0.05, 0.02);
        let (pairs, _) = synthetic_pairs(r.matrix(), &t, 30, 1);

        let p1: Vec<_> = pairs.iter().map(|p| p.0).collect();
        let p2: Vec<_> = pairs.iter().map(|p| p.1).collect();
        let (n1, t1) = normalize_points(&p1);
        let (n2, t2) = normalize_points(&p2);
        let fn_ = compute_fundamental(&n1[..8], &n2[..8]).unwrap();
        let f21 = t2.transpose() * fn_ * t1;

        let (score, inliers) = check_fundamental(&f21, &pairs, 1.0);
        assert!(score > 0.0);
        assert!(inliers.iter().all(|b| *b), "all exact pairs must be inliers");
    }

    #[test]
    fn reconstruct_f_recovers_motion() {
        let r = nalgebra::Rotation3::from_scaled_axis(Vector3::new(0.01, 0.04, 0.0));
        let t = Vector3::new(-0.5, 0.0, 0.1);
        let (pairs, _) = synthetic_pairs(r.matrix(), &t, 120, 2);

        let p1: Vec<_> = pairs.iter().map(|p| p.0).collect();
        let p2: Vec<_> = pairs.iter().map(|p| p.1).collect();
        let (n1, t1) = normalize_points(&p1);
        let (n2, t2) = normalize_points(&p2);
        let fn_ = compute_fundamental(&n1[..8], &n2[..8]).unwrap();
        let f21 = t2.transpose() * fn_ * t1;
        let inliers = vec![true; pairs.len()];

        let rec = reconstruct_f(&f21, &pairs, &inliers, &k(), 1.0, 1.0, 50).unwrap();
        // Translation is recovered up to scale.
        let t_dir = t / t.norm();
        assert_relative_eq!(rec.translation, t_dir, epsilon = 1e-4);
        assert_relative_eq!(rec.rotation, *r.matrix(), epsilon = 1e-5);
        assert!(rec.n_good >= 110);
    }

    #[test]
    fn homography_scores_planar_scene_higher_than_fundamental() {
        // All world points on the z = 5 plane, pure rotation + translation.
        let r = nalgebra::Rotation3::from_scaled_axis(Vector3::new(0.0, 0.05, 0.0));
        let t = Vector3::new(-0.3, 0.0, 0.0);
        let k = k();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut pairs = Vec::new();
        for _ in 0..60 {
            let pw = Point3::new(
                rng.gen::<f64>() * 4.0 - 2.0,
                rng.gen::<f64>() * 4.0 - 2.0,
                5.0,
            );
            let x1 = project(&k, &Matrix3::identity(), &Vector3::zeros(), &pw);
            let x2 = project(&k, r.matrix(), &t, &pw);
            pairs.push((x1, x2));
        }
        let p1: Vec<_> = pairs.iter().map(|p| p.0).collect();
        let p2: Vec<_> = pairs.iter().map(|p| p.1).collect();
        let (n1, t1) = normalize_points(&p1);
        let (n2, t2) = normalize_points(&p2);
        let hn = compute_homography(&n1[..8], &n2[..8]).unwrap();
        let h21 = t2.try_inverse().unwrap() * hn * t1;
        let h12 = h21.try_inverse().unwrap();

        let (score_h, h_inliers) = check_homography(&h21, &h12, &pairs, 1.0);
        assert!(h_inliers.iter().all(|b| *b));
        assert!(score_h / (score_h + 1.0) > 0.40);
    }

    #[test]
    fn fundamental_between_matches_direct_estimate() {
        let r = nalgebra::Rotation3::from_scaled_axis(Vector3::new(0.02, -0.03, 0.01));
        let t = Vector3::new(0.3, -0.1, 0.05);
        let t_2w = Isometry3::from_parts(
            nalgebra::Translation3::from(t),
            nalgebra::UnitQuaternion::from_rotation_matrix(&r),
        );
        let (pairs, _) = synthetic_pairs(r.matrix(), &t, 20, 4);

        // fundamental_between computes F12 with x1ᵀ F12 x2 = 0 where view 2
        // is at t_2w and view 1 at identity... here view "1" of the pair is
        // the identity camera, so check x2ᵀ F21 x1 with F21 between (2, 1).
        let f21 = fundamental_between(&k(), &t_2w, &Isometry3::identity());
        for (x1, x2) in &pairs {
            let v = x2.to_homogeneous().transpose() * f21 * x1.to_homogeneous();
            assert_relative_eq!(v[0], 0.0, epsilon = 1e-6);
        }
    }
}
