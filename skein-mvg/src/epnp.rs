//! EPnP: absolute pose from n ≥ 4 world–pixel correspondences
//! (Lepetit, Moreno-Noguer & Fua 2009).
//!
//! The world points are expressed as barycentric combinations of four
//! control points; the camera-frame control points span the nullspace of a
//! 2n×12 linear system. The noise-free nullspace is one-dimensional, so the
//! single-vector case (β·v) with sign/scale fixed by cheirality and
//! inter-control-point distances recovers the exact pose; the surrounding
//! RANSAC discards samples where noise makes this approximation poor.

use nalgebra::{Isometry3, Matrix3, Point2, Point3, Translation3, Vector3};

use crate::horn_sim3;

/// Estimated world→camera pose.
pub fn solve_epnp(
    world: &[Point3<f64>],
    pixels: &[Point2<f64>],
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
) -> Option<Isometry3<f64>> {
    let n = world.len();
    if n < 4 || pixels.len() != n {
        return None;
    }

    // Control points: centroid plus principal axes of the point cloud.
    let centroid = world.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n as f64;
    let mut cov = Matrix3::zeros();
    for p in world {
        let d = p.coords - centroid;
        cov += d * d.transpose();
    }
    cov /= n as f64;
    let eig = nalgebra::SymmetricEigen::new(cov);
    if eig.eigenvalues.iter().all(|e| *e < 1e-12) {
        return None;
    }
    let mut control = [Vector3::zeros(); 4];
    control[0] = centroid;
    for i in 0..3 {
        let scale = eig.eigenvalues[i].max(1e-12).sqrt();
        control[i + 1] = centroid + scale * eig.eigenvectors.column(i).into_owned();
    }

    // Barycentric coordinates of every world point.
    let mut basis = Matrix3::zeros();
    for i in 0..3 {
        basis.set_column(i, &(control[i + 1] - control[0]));
    }
    let basis_inv = basis.try_inverse()?;
    let alphas: Vec<[f64; 4]> = world
        .iter()
        .map(|p| {
            let b = basis_inv * (p.coords - control[0]);
            [1.0 - b.x - b.y - b.z, b.x, b.y, b.z]
        })
        .collect();

    // M·x = 0 where x stacks the four camera-frame control points.
    let mut m = nalgebra::DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (a, px)) in alphas.iter().zip(pixels.iter()).enumerate() {
        for j in 0..4 {
            m[(2 * i, 3 * j)] = a[j] * fx;
            m[(2 * i, 3 * j + 2)] = a[j] * (cx - px.x);
            m[(2 * i + 1, 3 * j + 1)] = a[j] * fy;
            m[(2 * i + 1, 3 * j + 2)] = a[j] * (cy - px.y);
        }
    }
    let mtm = m.transpose() * &m;
    let eig = nalgebra::SymmetricEigen::new(mtm);
    let mut smallest = 0;
    for i in 1..12 {
        if eig.eigenvalues[i] < eig.eigenvalues[smallest] {
            smallest = i;
        }
    }
    let v = eig.eigenvectors.column(smallest).into_owned();
    let mut cam_control: Vec<Vector3<f64>> = (0..4)
        .map(|j| Vector3::new(v[3 * j], v[3 * j + 1], v[3 * j + 2]))
        .collect();

    // Scale β so inter-control-point distances match the world distances.
    let mut nom = 0.0;
    let mut den = 0.0;
    for i in 0..4 {
        for j in (i + 1)..4 {
            let dc = (cam_control[i] - cam_control[j]).norm();
            let dw = (control[i] - control[j]).norm();
            nom += dc * dw;
            den += dc * dc;
        }
    }
    if den < 1e-18 {
        return None;
    }
    let beta = nom / den;
    for c in cam_control.iter_mut() {
        *c *= beta;
    }

    // Fix the sign so the reconstructed points sit in front of the camera.
    let mean_z: f64 = alphas
        .iter()
        .map(|a| (0..4).map(|j| a[j] * cam_control[j].z).sum::<f64>())
        .sum::<f64>()
        / n as f64;
    if mean_z < 0.0 {
        for c in cam_control.iter_mut() {
            *c = -*c;
        }
    }

    // Rigid alignment world → camera over the control points.
    let cam_pts: Vec<Point3<f64>> = cam_control.iter().map(|c| Point3::from(*c)).collect();
    let world_pts: Vec<Point3<f64>> = control.iter().map(|c| Point3::from(*c)).collect();
    let sim = horn_sim3(&cam_pts, &world_pts, true)?;
    let pose = Isometry3::from_parts(Translation3::from(sim.translation), sim.rotation);

    if pose.translation.vector.iter().all(|c| c.is_finite()) {
        Some(pose)
    } else {
        None
    }
}

/// Squared reprojection error of one correspondence under `pose`.
pub fn reprojection_error_sq(
    pose: &Isometry3<f64>,
    pw: &Point3<f64>,
    px: &Point2<f64>,
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
) -> f64 {
    let pc = pose * pw;
    if pc.z <= 0.0 {
        return f64::INFINITY;
    }
    let u = fx * pc.x / pc.z + cx;
    let v = fy * pc.y / pc.z + cy;
    (u - px.x).powi(2) + (v - px.y).powi(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn recovers_exact_pose_from_noise_free_points() {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let truth = Isometry3::from_parts(
            Translation3::new(0.3, -0.2, 0.5),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.1, -0.2, 0.05)),
        );
        let (fx, fy, cx, cy) = (500.0, 500.0, 320.0, 240.0);

        let world: Vec<Point3<f64>> = (0..12)
            .map(|_| {
                Point3::new(
                    rng.gen::<f64>() * 4.0 - 2.0,
                    rng.gen::<f64>() * 4.0 - 2.0,
                    rng.gen::<f64>() * 3.0 + 3.0,
                )
            })
            .collect();
        let pixels: Vec<Point2<f64>> = world
            .iter()
            .map(|pw| {
                let pc = truth * pw;
                Point2::new(fx * pc.x / pc.z + cx, fy * pc.y / pc.z + cy)
            })
            .collect();

        let est = solve_epnp(&world, &pixels, fx, fy, cx, cy).unwrap();
        for (pw, px) in world.iter().zip(pixels.iter()) {
            let err = reprojection_error_sq(&est, pw, px, fx, fy, cx, cy);
            assert!(err < 1e-6, "reprojection error {err}");
        }
        assert_relative_eq!(
            est.translation.vector,
            truth.translation.vector,
            epsilon = 1e-5
        );
    }

    #[test]
    fn minimal_four_point_sample_works() {
        let truth = Isometry3::translation(0.0, 0.0, 1.0);
        let (fx, fy, cx, cy) = (500.0, 500.0, 320.0, 240.0);
        let world = [
            Point3::new(-1.0, -1.0, 4.0),
            Point3::new(1.0, -1.0, 5.0),
            Point3::new(1.0, 1.0, 4.5),
            Point3::new(-1.0, 1.0, 6.0),
        ];
        let pixels: Vec<Point2<f64>> = world
            .iter()
            .map(|pw| {
                let pc = truth * pw;
                Point2::new(fx * pc.x / pc.z + cx, fy * pc.y / pc.z + cy)
            })
            .collect();
        let est = solve_epnp(&world, &pixels, fx, fy, cx, cy).unwrap();
        for (pw, px) in world.iter().zip(pixels.iter()) {
            assert!(reprojection_error_sq(&est, pw, px, fx, fy, cx, cy) < 1e-6);
        }
    }

    #[test]
    fn degenerate_input_is_rejected() {
        let (fx, fy, cx, cy) = (500.0, 500.0, 320.0, 240.0);
        let world = [Point3::new(0.0, 0.0, 1.0); 4];
        let pixels = [Point2::new(320.0, 240.0); 4];
        assert!(solve_epnp(&world, &pixels, fx, fy, cx, cy).is_none());
    }
}
