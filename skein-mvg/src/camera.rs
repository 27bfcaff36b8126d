use nalgebra::{Dyn, Isometry3, Matrix3, OMatrix, Point2, Point3, Vector3, Vector5, U2};
use opencv_ros_camera::{Distortion, RosOpenCvIntrinsics};

use crate::{MvgError, Result};

/// Undistorted image bounds. With distortion the valid region is not the
/// pixel rectangle; these are computed by undistorting the image corners.
#[derive(Debug, Clone, Copy)]
pub struct ImageBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl ImageBounds {
    #[inline]
    pub fn contains(&self, pt: &Point2<f64>) -> bool {
        pt.x >= self.min_x && pt.x < self.max_x && pt.y >= self.min_y && pt.y < self.max_y
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    #[inline]
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// The single calibrated camera of a monocular run.
///
/// Keypoints are undistorted once at frame construction; all projection
/// afterwards is plain pinhole on the cached `fx, fy, cx, cy`. The
/// underlying [`RosOpenCvIntrinsics`] carries the Brown-Conrady lens model
/// used for that one undistortion pass.
#[derive(Clone)]
pub struct PinholeCamera {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    inv_fx: f64,
    inv_fy: f64,
    width: u32,
    height: u32,
    intrinsics: RosOpenCvIntrinsics<f64>,
    has_distortion: bool,
    bounds: ImageBounds,
}

impl std::fmt::Debug for PinholeCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinholeCamera")
            .field("fx", &self.fx)
            .field("fy", &self.fy)
            .field("cx", &self.cx)
            .field("cy", &self.cy)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl PinholeCamera {
    pub fn new(
        width: u32,
        height: u32,
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        distortion: [f64; 5],
    ) -> Result<Self> {
        if !(fx > 0.0 && fy > 0.0) || width == 0 || height == 0 {
            return Err(MvgError::InvalidIntrinsics);
        }
        let has_distortion = distortion.iter().any(|d| *d != 0.0);
        let dist = Distortion::from_opencv_vec(Vector5::from_column_slice(&distortion));
        let intrinsics =
            RosOpenCvIntrinsics::from_params_with_distortion(fx, 0.0, fy, cx, cy, dist);
        let mut cam = Self {
            fx,
            fy,
            cx,
            cy,
            inv_fx: 1.0 / fx,
            inv_fy: 1.0 / fy,
            width,
            height,
            intrinsics,
            has_distortion,
            bounds: ImageBounds {
                min_x: 0.0,
                max_x: width as f64,
                min_y: 0.0,
                max_y: height as f64,
            },
        };
        if has_distortion {
            let w = width as f64;
            let h = height as f64;
            let corners = [
                Point2::new(0.0, 0.0),
                Point2::new(w, 0.0),
                Point2::new(0.0, h),
                Point2::new(w, h),
            ];
            let und = cam.undistort_points(&corners);
            cam.bounds = ImageBounds {
                min_x: und.iter().map(|p| p.x).fold(f64::INFINITY, f64::min),
                max_x: und.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max),
                min_y: und.iter().map(|p| p.y).fold(f64::INFINITY, f64::min),
                max_y: und.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max),
            };
        }
        Ok(cam)
    }

    #[inline]
    pub fn fx(&self) -> f64 {
        self.fx
    }

    #[inline]
    pub fn fy(&self) -> f64 {
        self.fy
    }

    #[inline]
    pub fn cx(&self) -> f64 {
        self.cx
    }

    #[inline]
    pub fn cy(&self) -> f64 {
        self.cy
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn bounds(&self) -> &ImageBounds {
        &self.bounds
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Undistort raw pixel positions with the lens model.
    pub fn undistort_points(&self, pts: &[Point2<f64>]) -> Vec<Point2<f64>> {
        if !self.has_distortion {
            return pts.to_vec();
        }
        let data = OMatrix::<f64, Dyn, U2>::from_fn(pts.len(), |r, c| {
            if c == 0 {
                pts[r].x
            } else {
                pts[r].y
            }
        });
        let distorted = cam_geom::Pixels::new(data);
        let undistorted = self.intrinsics.undistort(&distorted);
        (0..pts.len())
            .map(|r| Point2::new(undistorted.data[(r, 0)], undistorted.data[(r, 1)]))
            .collect()
    }

    /// Project a camera-frame point. `None` behind the camera.
    #[inline]
    pub fn project(&self, pc: &Point3<f64>) -> Option<Point2<f64>> {
        if pc.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / pc.z;
        Some(Point2::new(
            self.fx * pc.x * inv_z + self.cx,
            self.fy * pc.y * inv_z + self.cy,
        ))
    }

    /// Project a world point through a world→camera pose.
    #[inline]
    pub fn project_world(&self, t_cw: &Isometry3<f64>, pw: &Point3<f64>) -> Option<Point2<f64>> {
        self.project(&(t_cw * pw))
    }

    /// Back-project an (undistorted) pixel into a camera-frame ray with z=1.
    #[inline]
    pub fn unproject(&self, px: &Point2<f64>) -> Vector3<f64> {
        Vector3::new(
            (px.x - self.cx) * self.inv_fx,
            (px.y - self.cy) * self.inv_fy,
            1.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_camera() -> PinholeCamera {
        PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0, [0.0; 5]).unwrap()
    }

    #[test]
    fn project_unproject_round_trip() {
        let cam = test_camera();
        let pc = Point3::new(0.3, -0.2, 2.0);
        let px = cam.project(&pc).unwrap();
        let ray = cam.unproject(&px);
        assert_relative_eq!(ray * pc.z, pc.coords, epsilon = 1e-12);
    }

    #[test]
    fn points_behind_camera_do_not_project() {
        let cam = test_camera();
        assert!(cam.project(&Point3::new(0.0, 0.0, -1.0)).is_none());
        assert!(cam.project(&Point3::new(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn undistorted_bounds_exceed_image_for_barrel_distortion() {
        let cam = PinholeCamera::new(
            640,
            480,
            458.654,
            457.296,
            367.215,
            248.375,
            [-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05, 0.0],
        )
        .unwrap();
        // Barrel distortion pulls corners inward, so undistorting pushes the
        // bounds outside the pixel rectangle.
        assert!(cam.bounds().min_x < 0.0);
        assert!(cam.bounds().max_x > 640.0);
    }

    #[test]
    fn zero_distortion_keeps_pixel_bounds() {
        let cam = test_camera();
        let b = cam.bounds();
        assert_relative_eq!(b.min_x, 0.0);
        assert_relative_eq!(b.max_x, 640.0);
        assert!(b.contains(&Point2::new(0.0, 0.0)));
        assert!(!b.contains(&Point2::new(640.0, 10.0)));
    }

    #[test]
    fn rejects_bad_intrinsics() {
        assert!(PinholeCamera::new(640, 480, 0.0, 500.0, 320.0, 240.0, [0.0; 5]).is_err());
        assert!(PinholeCamera::new(0, 480, 500.0, 500.0, 320.0, 240.0, [0.0; 5]).is_err());
    }
}
