//! Shared vocabulary of the [skein](https://crates.io/crates/skein) monocular
//! SLAM engine: entity ids, image features, scale pyramid metadata,
//! bag-of-words types, the contracts of the external feature extractor and
//! vocabulary collaborators, and the serde configuration types.
#![deny(rust_2018_idioms)]

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

mod bow;
mod config;

pub use crate::bow::{BowVector, FeatureVector, NodeId, Vocabulary, WordId};
pub use crate::config::{
    load_config, CameraConfig, ConfigError, OrbConfig, SlamConfig, TrackerConfig, ViewerConfig,
};

/// Identifier of a keyframe. Issued monotonically by the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyFrameId(pub u64);

/// Identifier of a map point. Issued monotonically by the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MapPointId(pub u64);

/// Identifier of an input frame (every tick gets one, keyframe or not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u64);

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Number of bits in a feature descriptor.
pub const DESCRIPTOR_BITS: usize = 256;

/// A 256-bit binary feature descriptor.
///
/// Distances are Hamming distances (popcount of the XOR), so two descriptors
/// are at most [`DESCRIPTOR_BITS`] apart.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    /// Hamming distance to `other`.
    #[inline]
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Descriptor({:02x}{:02x}{:02x}{:02x}…)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// An extracted keypoint with undistorted pixel position, pyramid octave and
/// orientation angle in degrees.
#[derive(Debug, Clone, Copy)]
pub struct KeyPoint {
    pub pt: Point2<f64>,
    pub octave: usize,
    /// Orientation in degrees, `[0, 360)`. Negative when the extractor did
    /// not compute orientations.
    pub angle: f64,
}

/// Per-level metadata of the extractor's image pyramid.
///
/// `sigma2[o]` is the keypoint position variance at octave `o`; every χ²
/// reprojection gate in the engine scales by it.
#[derive(Debug, Clone)]
pub struct ScalePyramid {
    pub n_levels: usize,
    pub scale_factor: f64,
    pub log_scale_factor: f64,
    pub scale_factors: Vec<f64>,
    pub sigma2: Vec<f64>,
    pub inv_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(n_levels: usize, scale_factor: f64) -> Self {
        let mut scale_factors = Vec::with_capacity(n_levels);
        let mut sigma2 = Vec::with_capacity(n_levels);
        let mut scale = 1.0;
        for _ in 0..n_levels {
            scale_factors.push(scale);
            sigma2.push(scale * scale);
            scale *= scale_factor;
        }
        let inv_sigma2 = sigma2.iter().map(|s| 1.0 / s).collect();
        Self {
            n_levels,
            scale_factor,
            log_scale_factor: scale_factor.ln(),
            scale_factors,
            sigma2,
            inv_sigma2,
        }
    }

    /// Highest octave whose scale still covers `dist` given the maximum
    /// recognition distance of a landmark.
    pub fn predict_octave(&self, max_distance: f64, dist: f64) -> usize {
        if dist <= 0.0 {
            return 0;
        }
        let octave = (max_distance / dist).ln() / self.log_scale_factor;
        (octave.ceil().max(0.0) as usize).min(self.n_levels - 1)
    }
}

/// Borrowed view of one 8-bit grayscale input image.
#[derive(Debug, Clone, Copy)]
pub struct GrayImage<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

/// Result of running the feature extractor over one image.
///
/// `keypoints[i]` is described by `descriptors[i]`; positions are raw
/// (distorted) pixel coordinates, undistortion happens at frame construction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub pyramid: ScalePyramid,
}

/// Contract of the external ORB feature extractor; this repository contains
/// no image processing.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, image: &GrayImage<'_>) -> Extraction;

    /// Extraction with twice the feature budget, used while the map is not
    /// yet initialized.
    fn extract_doubled(&self, image: &GrayImage<'_>) -> Extraction;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_distance_counts_bits() {
        let a = Descriptor([0u8; 32]);
        let mut b = Descriptor([0u8; 32]);
        assert_eq!(a.distance(&b), 0);
        b.0[0] = 0b1010_1010;
        b.0[31] = 0xff;
        assert_eq!(a.distance(&b), 12);
        assert_eq!(b.distance(&a), 12);
    }

    #[test]
    fn pyramid_scales_are_geometric() {
        let pyr = ScalePyramid::new(8, 1.2);
        assert_eq!(pyr.scale_factors.len(), 8);
        approx::assert_relative_eq!(pyr.scale_factors[0], 1.0);
        approx::assert_relative_eq!(pyr.scale_factors[3], 1.2f64.powi(3), epsilon = 1e-12);
        approx::assert_relative_eq!(pyr.sigma2[2] * pyr.inv_sigma2[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn octave_prediction_clamps_to_pyramid() {
        let pyr = ScalePyramid::new(8, 1.2);
        // At the maximum recognition distance the point looks like octave 0.
        assert_eq!(pyr.predict_octave(10.0, 10.0), 0);
        // Closer in, the point appears at coarser octaves.
        assert!(pyr.predict_octave(10.0, 5.0) > 0);
        assert_eq!(pyr.predict_octave(10.0, 1e-9), 7);
        assert_eq!(pyr.predict_octave(10.0, 0.0), 0);
    }
}
