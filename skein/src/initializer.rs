//! Map bootstrap from the first two usable views.
//!
//! Two RANSAC model searches (homography and fundamental) run over one
//! shared bank of random 8-correspondence samples, so the procedure is
//! deterministic given a seed. The winning model's motion hypotheses are
//! triangulated and voted; success hands rotation, translation and the
//! initial structure back to tracking.

use nalgebra::{Matrix3, Point2, Point3, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use skein_mvg::two_view::{
    check_fundamental, check_homography, compute_fundamental, compute_homography,
    normalize_points, reconstruct_f, reconstruct_h,
};
use tracing::debug;

use crate::frame::Frame;

const MIN_TRIANGULATED: usize = 50;
const MIN_PARALLAX_DEG: f64 = 1.0;

/// Relative motion and structure of the accepted bootstrap.
pub struct InitResult {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// (keypoint in the reference frame, keypoint in the current frame,
    /// triangulated position) per surviving correspondence.
    pub triangulated: Vec<(usize, usize, Point3<f64>)>,
}

pub struct Initializer {
    /// Keypoint measurement noise in pixels.
    sigma: f64,
    max_iterations: usize,
    reference: Frame,
}

impl Initializer {
    pub fn new(reference: Frame) -> Initializer {
        Initializer {
            sigma: 1.0,
            max_iterations: 200,
            reference,
        }
    }

    pub fn reference(&self) -> &Frame {
        &self.reference
    }

    /// Try to bootstrap from the reference frame and `current`.
    /// `matches12[i1]` is the current-frame keypoint matched to reference
    /// keypoint `i1`.
    pub fn initialize(
        &self,
        current: &Frame,
        matches12: &[Option<usize>],
        seed: u64,
    ) -> Option<InitResult> {
        let mut pairs_idx: Vec<(usize, usize)> = Vec::new();
        for (i1, m) in matches12.iter().enumerate() {
            if let Some(i2) = m {
                pairs_idx.push((i1, *i2));
            }
        }
        let n = pairs_idx.len();
        if n < 8 {
            return None;
        }
        let pairs: Vec<(Point2<f64>, Point2<f64>)> = pairs_idx
            .iter()
            .map(|(i1, i2)| (self.reference.keypoints[*i1].pt, current.keypoints[*i2].pt))
            .collect();

        // One sample bank feeds both model searches.
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let samples: Vec<Vec<usize>> = (0..self.max_iterations)
            .map(|_| rand::seq::index::sample(&mut rng, n, 8).into_vec())
            .collect();

        let p1: Vec<Point2<f64>> = pairs.iter().map(|p| p.0).collect();
        let p2: Vec<Point2<f64>> = pairs.iter().map(|p| p.1).collect();
        let (n1, t1) = normalize_points(&p1);
        let (n2, t2) = normalize_points(&p2);
        let t2_inv = t2.try_inverse()?;
        let t2_t = t2.transpose();

        let mut best_h: Option<(f64, Matrix3<f64>, Vec<bool>)> = None;
        let mut best_f: Option<(f64, Matrix3<f64>, Vec<bool>)> = None;
        for sample in &samples {
            let s1: Vec<Point2<f64>> = sample.iter().map(|i| n1[*i]).collect();
            let s2: Vec<Point2<f64>> = sample.iter().map(|i| n2[*i]).collect();

            if let Some(hn) = compute_homography(&s1, &s2) {
                let h21 = t2_inv * hn * t1;
                if let Some(h12) = h21.try_inverse() {
                    let (score, inliers) = check_homography(&h21, &h12, &pairs, self.sigma);
                    if best_h.as_ref().map(|(s, _, _)| score > *s).unwrap_or(true) {
                        best_h = Some((score, h21, inliers));
                    }
                }
            }
            if let Some(fn_) = compute_fundamental(&s1, &s2) {
                let f21 = t2_t * fn_ * t1;
                let (score, inliers) = check_fundamental(&f21, &pairs, self.sigma);
                if best_f.as_ref().map(|(s, _, _)| score > *s).unwrap_or(true) {
                    best_f = Some((score, f21, inliers));
                }
            }
        }

        let (score_h, h21, h_inliers) = best_h?;
        let (score_f, f21, f_inliers) = best_f?;
        let ratio = score_h / (score_h + score_f);
        debug!(score_h, score_f, ratio, "bootstrap model scores");

        let k = self.reference.camera.k_matrix();
        let rec = if ratio > 0.40 {
            reconstruct_h(
                &h21,
                &pairs,
                &h_inliers,
                &k,
                self.sigma,
                MIN_PARALLAX_DEG,
                MIN_TRIANGULATED,
            )
        } else {
            reconstruct_f(
                &f21,
                &pairs,
                &f_inliers,
                &k,
                self.sigma,
                MIN_PARALLAX_DEG,
                MIN_TRIANGULATED,
            )
        }?;

        let triangulated: Vec<(usize, usize, Point3<f64>)> = rec
            .points
            .iter()
            .enumerate()
            .filter_map(|(slot, p)| {
                p.map(|p| (pairs_idx[slot].0, pairs_idx[slot].1, p))
            })
            .collect();
        debug!(
            n_good = rec.n_good,
            parallax = rec.parallax_deg,
            "bootstrap accepted"
        );
        Some(InitResult {
            rotation: rec.rotation,
            translation: rec.translation,
            triangulated,
        })
    }
}
