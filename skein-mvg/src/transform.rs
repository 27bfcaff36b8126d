use nalgebra::{
    Isometry3, Matrix3, Matrix4, Point3, Quaternion, SVector, Translation3, UnitQuaternion,
    Vector3,
};

/// Skew-symmetric (cross-product) matrix of `v`.
#[rustfmt::skip]
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
         0.0,  -v.z,   v.y,
         v.z,   0.0,  -v.x,
        -v.y,   v.x,   0.0,
    )
}

/// Right Jacobian of the SO(3) exponential at `v` (axis-angle).
///
/// Satisfies `d(Exp(v) p)/dv = -Exp(v) [p]x Jr(v)`, which is how the
/// reprojection problems differentiate through the rotation parameters.
pub fn rotation_right_jacobian(v: &Vector3<f64>) -> Matrix3<f64> {
    let theta2 = v.norm_squared();
    let vx = skew_symmetric(v);
    if theta2 < 1e-16 {
        return Matrix3::identity() - 0.5 * vx + (1.0 / 6.0) * vx * vx;
    }
    let theta = theta2.sqrt();
    Matrix3::identity() - ((1.0 - theta.cos()) / theta2) * vx
        + ((theta - theta.sin()) / (theta2 * theta)) * (vx * vx)
}

/// A 7-DoF similarity transform: `x ↦ s·R·x + t`.
///
/// Monocular SLAM is scale ambiguous, so loop closure estimates and
/// propagates similarities rather than rigid motions.
#[derive(Debug, Clone, Copy)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self {
            rotation,
            translation,
            scale,
        }
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self {
            rotation: iso.rotation,
            translation: iso.translation.vector,
            scale: 1.0,
        }
    }

    /// Collapse to a rigid pose by folding the scale into the translation.
    ///
    /// This is the pose written back to a keyframe after a Sim3 correction:
    /// `[s·R | t] ≡ [R | t/s]` up to global scale.
    pub fn to_isometry_rescaled(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation / self.scale),
            self.rotation,
        )
    }

    #[inline]
    pub fn transform(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.scale * (self.rotation * p.coords) + self.translation)
    }

    pub fn inverse(&self) -> Sim3 {
        let inv_scale = 1.0 / self.scale;
        let inv_rot = self.rotation.inverse();
        Sim3 {
            rotation: inv_rot,
            translation: -inv_scale * (inv_rot * self.translation),
            scale: inv_scale,
        }
    }

    /// Chart of the similarity group used by the pose-graph optimizer:
    /// rotation as scaled axis, translation verbatim, log scale. Smooth,
    /// zero exactly at the identity.
    pub fn log(&self) -> SVector<f64, 7> {
        let w = self.rotation.scaled_axis();
        let mut v = SVector::<f64, 7>::zeros();
        v.fixed_rows_mut::<3>(0).copy_from(&w);
        v.fixed_rows_mut::<3>(3).copy_from(&self.translation);
        v[6] = self.scale.ln();
        v
    }

    pub fn exp(v: &SVector<f64, 7>) -> Sim3 {
        Sim3 {
            rotation: UnitQuaternion::from_scaled_axis(v.fixed_rows::<3>(0).into_owned()),
            translation: v.fixed_rows::<3>(3).into_owned(),
            scale: v[6].exp(),
        }
    }
}

impl std::ops::Mul for Sim3 {
    type Output = Sim3;

    fn mul(self, rhs: Sim3) -> Sim3 {
        Sim3 {
            rotation: self.rotation * rhs.rotation,
            translation: self.scale * (self.rotation * rhs.translation) + self.translation,
            scale: self.scale * rhs.scale,
        }
    }
}

/// Closed-form absolute orientation (Horn 1987, quaternion method).
///
/// Returns the similarity `S` with `p1[i] ≈ S(p2[i])`. With `fix_scale` the
/// scale is pinned to 1 and the result is rigid. Needs ≥ 3 point pairs.
pub fn horn_sim3(p1: &[Point3<f64>], p2: &[Point3<f64>], fix_scale: bool) -> Option<Sim3> {
    if p1.len() < 3 || p1.len() != p2.len() {
        return None;
    }
    let n = p1.len() as f64;
    let o1 = p1.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
    let o2 = p2.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;

    let mut m = Matrix3::zeros();
    for (a, b) in p1.iter().zip(p2.iter()) {
        m += (a.coords - o1) * (b.coords - o2).transpose();
    }

    let (m11, m12, m13) = (m[(0, 0)], m[(0, 1)], m[(0, 2)]);
    let (m21, m22, m23) = (m[(1, 0)], m[(1, 1)], m[(1, 2)]);
    let (m31, m32, m33) = (m[(2, 0)], m[(2, 1)], m[(2, 2)]);

    #[rustfmt::skip]
    let n_mat = Matrix4::new(
        m11 + m22 + m33, m23 - m32,       m31 - m13,       m12 - m21,
        m23 - m32,       m11 - m22 - m33, m12 + m21,       m31 + m13,
        m31 - m13,       m12 + m21,       m22 - m11 - m33, m23 + m32,
        m12 - m21,       m31 + m13,       m23 + m32,       m33 - m11 - m22,
    );

    let eigen = nalgebra::SymmetricEigen::new(n_mat);
    let mut best = 0;
    for i in 1..4 {
        if eigen.eigenvalues[i] > eigen.eigenvalues[best] {
            best = i;
        }
    }
    let q = eigen.eigenvectors.column(best);
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(q[0], q[1], q[2], q[3]));

    let scale = if fix_scale {
        1.0
    } else {
        // Asymmetric scale estimate: s = Σ r1·(R r2) / Σ ‖r2‖².
        let mut nom = 0.0;
        let mut den = 0.0;
        for (a, b) in p1.iter().zip(p2.iter()) {
            let r1 = a.coords - o1;
            let r2 = b.coords - o2;
            nom += r1.dot(&(rotation * r2));
            den += r2.norm_squared();
        }
        if den <= 0.0 || !nom.is_finite() {
            return None;
        }
        nom / den
    };
    if !(scale.is_finite() && scale > 0.0) {
        return None;
    }

    let translation = o1 - scale * (rotation * o2);
    Some(Sim3::new(rotation, translation, scale))
}
