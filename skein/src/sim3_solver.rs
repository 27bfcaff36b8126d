//! RANSAC estimation of the similarity between a loop candidate pair.
//!
//! Each iteration solves the closed-form absolute orientation (Horn 1987)
//! from three matched landmarks expressed in both camera frames, then votes
//! by symmetric reprojection under per-octave χ² gates.

use std::sync::Arc;

use nalgebra::{Point2, Point3};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use skein_mvg::{horn_sim3, Sim3};

use crate::keyframe::KeyFrame;
use crate::map_point::MapPoint;

/// χ² gate (2 DoF, 99%) scaled by octave σ².
const CHI2_SIM3: f64 = 9.21;

pub struct Sim3Solver {
    // Matched landmarks in each keyframe's camera frame, with their pixel
    // observations and per-point error gates.
    pc1: Vec<Point3<f64>>,
    pc2: Vec<Point3<f64>>,
    px1: Vec<Point2<f64>>,
    px2: Vec<Point2<f64>>,
    max_error1: Vec<f64>,
    max_error2: Vec<f64>,
    /// Original index into the `matches12` vector per correspondence.
    indices: Vec<usize>,
    kf1: Arc<KeyFrame>,
    kf2: Arc<KeyFrame>,
    fix_scale: bool,

    ransac_min_inliers: usize,
    ransac_max_its: usize,
    iterations_done: usize,
    best_inliers: Vec<bool>,
    best_n_inliers: usize,
    best: Option<Sim3>,
}

impl Sim3Solver {
    pub fn new(
        kf1: Arc<KeyFrame>,
        kf2: Arc<KeyFrame>,
        matches12: &[Option<Arc<MapPoint>>],
        fix_scale: bool,
    ) -> Sim3Solver {
        let t_1w = kf1.pose();
        let t_2w = kf2.pose();
        let points1 = kf1.map_points();

        let mut solver = Sim3Solver {
            pc1: Vec::new(),
            pc2: Vec::new(),
            px1: Vec::new(),
            px2: Vec::new(),
            max_error1: Vec::new(),
            max_error2: Vec::new(),
            indices: Vec::new(),
            kf1: kf1.clone(),
            kf2: kf2.clone(),
            fix_scale,
            ransac_min_inliers: 6,
            ransac_max_its: 300,
            iterations_done: 0,
            best_inliers: Vec::new(),
            best_n_inliers: 0,
            best: None,
        };

        for (i1, mp2) in matches12.iter().enumerate() {
            let Some(mp2) = mp2 else { continue };
            let Some(mp1) = &points1[i1] else { continue };
            if mp1.is_bad() || mp2.is_bad() {
                continue;
            }
            let Some(i2) = mp2.index_in(kf2.id) else {
                continue;
            };
            let kp1 = &kf1.features.keypoints[i1];
            let kp2 = &kf2.features.keypoints[i2];
            solver
                .max_error1
                .push(CHI2_SIM3 * kf1.features.pyramid.sigma2[kp1.octave]);
            solver
                .max_error2
                .push(CHI2_SIM3 * kf2.features.pyramid.sigma2[kp2.octave]);
            solver.pc1.push(t_1w * mp1.world_pos());
            solver.pc2.push(t_2w * mp2.world_pos());
            solver.px1.push(kp1.pt);
            solver.px2.push(kp2.pt);
            solver.indices.push(i1);
        }
        solver.best_inliers = vec![false; solver.pc1.len()];
        solver
    }

    pub fn set_ransac_parameters(&mut self, probability: f64, min_inliers: usize, max_its: usize) {
        self.ransac_min_inliers = min_inliers;
        let n = self.pc1.len();
        if n == 0 {
            self.ransac_max_its = 0;
            return;
        }
        // Adaptive iteration bound from the expected inlier ratio.
        let epsilon = min_inliers as f64 / n as f64;
        let its = if epsilon >= 1.0 {
            1.0
        } else {
            ((1.0 - probability).ln() / (1.0 - epsilon.powi(3)).ln()).ceil()
        };
        self.ransac_max_its = (its.max(1.0) as usize).min(max_its);
    }

    pub fn n_candidates(&self) -> usize {
        self.pc1.len()
    }

    /// Run up to `n` further iterations. Returns the found similarity (when
    /// an iteration reached the inlier quorum), whether the iteration budget
    /// is exhausted, and the best inlier bitmap (parallel to `matches12`
    /// through [`Self::match_index`]).
    pub fn iterate(
        &mut self,
        n: usize,
        rng: &mut ChaCha8Rng,
    ) -> (Option<Sim3>, bool, Vec<bool>, usize) {
        let count = self.pc1.len();
        if count < 3 || self.ransac_min_inliers > count {
            return (None, true, self.best_inliers.clone(), self.best_n_inliers);
        }

        let mut iterations = 0;
        while self.iterations_done < self.ransac_max_its && iterations < n {
            self.iterations_done += 1;
            iterations += 1;

            // Three distinct correspondences for the minimal solve.
            let mut sample = [0usize; 3];
            sample[0] = rng.gen_range(0..count);
            loop {
                sample[1] = rng.gen_range(0..count);
                if sample[1] != sample[0] {
                    break;
                }
            }
            loop {
                sample[2] = rng.gen_range(0..count);
                if sample[2] != sample[0] && sample[2] != sample[1] {
                    break;
                }
            }

            let p1: Vec<Point3<f64>> = sample.iter().map(|i| self.pc1[*i]).collect();
            let p2: Vec<Point3<f64>> = sample.iter().map(|i| self.pc2[*i]).collect();
            let Some(s12) = horn_sim3(&p1, &p2, self.fix_scale) else {
                continue;
            };

            let (inliers, n_inliers) = self.check_inliers(&s12);
            if n_inliers > self.best_n_inliers {
                self.best_n_inliers = n_inliers;
                self.best_inliers = inliers;
                self.best = Some(s12);
            }
            if n_inliers >= self.ransac_min_inliers {
                return (
                    self.best,
                    false,
                    self.best_inliers.clone(),
                    self.best_n_inliers,
                );
            }
        }

        let no_more = self.iterations_done >= self.ransac_max_its;
        (None, no_more, self.best_inliers.clone(), self.best_n_inliers)
    }

    /// Map a correspondence slot back to its index in the original
    /// `matches12` vector.
    pub fn match_index(&self, slot: usize) -> usize {
        self.indices[slot]
    }

    fn check_inliers(&self, s12: &Sim3) -> (Vec<bool>, usize) {
        let s21 = s12.inverse();
        let mut inliers = vec![false; self.pc1.len()];
        let mut n = 0;
        for i in 0..self.pc1.len() {
            let q1 = s12.transform(&self.pc2[i]);
            let q2 = s21.transform(&self.pc1[i]);
            let (Some(u1), Some(u2)) = (self.kf1.camera.project(&q1), self.kf2.camera.project(&q2))
            else {
                continue;
            };
            let e1 = (u1 - self.px1[i]).norm_squared();
            let e2 = (u2 - self.px2[i]).norm_squared();
            if e1 < self.max_error1[i] && e2 < self.max_error2[i] {
                inliers[i] = true;
                n += 1;
            }
        }
        (inliers, n)
    }
}
