//! Camera model and multi-view geometry for the
//! [skein](https://crates.io/crates/skein) monocular SLAM engine.
//!
//! This crate holds everything geometric that does not touch the map:
//!
//! - [`PinholeCamera`]: intrinsics, image bounds and keypoint undistortion
//!   (lens model via [`opencv-ros-camera`](https://crates.io/crates/opencv-ros-camera))
//! - [`Sim3`]: 7-DoF similarity transforms for monocular loop closure,
//!   with the Horn 1987 closed-form absolute-orientation solve
//! - [`triangulate_dlt`]: two-view linear triangulation
//! - [`two_view`]: homography/fundamental estimation, model scoring and
//!   motion-hypothesis selection for map bootstrapping
//! - [`epnp`]: the EPnP minimal solver used by relocalization
#![deny(rust_2018_idioms)]

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MvgError {
    #[error("not enough points")]
    NotEnoughPoints,
    #[error("SVD failed")]
    SvdFailed,
    #[error("eigendecomposition failed")]
    EigenFailed,
    #[error("degenerate geometry")]
    DegenerateGeometry,
    #[error("invalid intrinsics")]
    InvalidIntrinsics,
    #[error("opencv_ros_camera::Error: {source}")]
    OpencvRosError {
        #[from]
        source: opencv_ros_camera::Error,
    },
}

pub type Result<M> = std::result::Result<M, MvgError>;

mod camera;
pub use crate::camera::{ImageBounds, PinholeCamera};

mod transform;
pub use crate::transform::{horn_sim3, rotation_right_jacobian, skew_symmetric, Sim3};

mod triangulate;
pub use crate::triangulate::{projection_matrix, triangulate_dlt};

pub mod two_view;

pub mod epnp;
