use nalgebra::{Isometry3, Matrix3, Matrix3x4, Matrix4, Point2, Point3};

/// `K·[R|t]` projection matrix of a camera at world→camera pose `t_cw`.
pub fn projection_matrix(k: &Matrix3<f64>, t_cw: &Isometry3<f64>) -> Matrix3x4<f64> {
    let mut rt = Matrix3x4::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(t_cw.rotation.to_rotation_matrix().matrix());
    rt.fixed_view_mut::<3, 1>(0, 3)
        .copy_from(&t_cw.translation.vector);
    k * rt
}

/// Two-view linear (DLT) triangulation.
///
/// Stacks `u·P.row(2) − P.row(0)` and `v·P.row(2) − P.row(1)` for both
/// views, takes the right singular vector of the smallest singular value and
/// dehomogenizes. Returns `None` for points at infinity (w ≈ 0) or
/// non-finite results; callers apply their own cheirality and reprojection
/// gates.
pub fn triangulate_dlt(
    x1: &Point2<f64>,
    p1: &Matrix3x4<f64>,
    x2: &Point2<f64>,
    p2: &Matrix3x4<f64>,
) -> Option<Point3<f64>> {
    let mut a = Matrix4::zeros();
    a.row_mut(0).copy_from(&(x1.x * p1.row(2) - p1.row(0)));
    a.row_mut(1).copy_from(&(x1.y * p1.row(2) - p1.row(1)));
    a.row_mut(2).copy_from(&(x2.x * p2.row(2) - p2.row(0)));
    a.row_mut(3).copy_from(&(x2.y * p2.row(2) - p2.row(1)));

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(3);
    let w = h[3];
    if w.abs() < 1e-12 {
        return None;
    }
    let pt = Point3::new(h[0] / w, h[1] / w, h[2] / w);
    if pt.coords.iter().all(|c| c.is_finite()) {
        Some(pt)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion, Vector3};

    #[test]
    fn triangulates_exact_point() {
        let k = Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0);
        let t1 = Isometry3::identity();
        let t2 = Isometry3::from_parts(
            Translation3::new(-0.5, 0.0, 0.0),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.02, 0.0)),
        );
        let p1 = projection_matrix(&k, &t1);
        let p2 = projection_matrix(&k, &t2);

        let pw = Point3::new(0.4, -0.3, 3.0);
        let project = |p: &Matrix3x4<f64>| {
            let h = p * pw.to_homogeneous();
            Point2::new(h[0] / h[2], h[1] / h[2])
        };
        let got = triangulate_dlt(&project(&p1), &p1, &project(&p2), &p2).unwrap();
        assert_relative_eq!(got, pw, epsilon = 1e-8);
    }

    #[test]
    fn rejects_point_at_infinity() {
        let k = Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0);
        // Pure translation with identical pixels in both views: the rays are
        // parallel and the exact homogeneous solution has w = 0.
        let p1 = projection_matrix(&k, &Isometry3::identity());
        let p2 = projection_matrix(&k, &Isometry3::translation(-0.5, 0.0, 0.0));
        let x = Point2::new(100.0, 100.0);
        assert!(triangulate_dlt(&x, &p1, &x, &p2).is_none());
    }
}
