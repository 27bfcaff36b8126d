//! EPnP-RANSAC absolute pose for relocalization.

use std::sync::Arc;

use nalgebra::{Isometry3, Point2, Point3};
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;
use skein_mvg::epnp::{reprojection_error_sq, solve_epnp};

use crate::frame::Frame;
use crate::map_point::MapPoint;

pub struct PnpSolver {
    world: Vec<Point3<f64>>,
    pixels: Vec<Point2<f64>>,
    max_error: Vec<f64>,
    /// Keypoint index in the query frame per correspondence.
    indices: Vec<usize>,
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,

    min_set: usize,
    ransac_min_inliers: usize,
    ransac_max_its: usize,
    iterations_done: usize,
    best_inliers: Vec<bool>,
    best_n_inliers: usize,
    best: Option<Isometry3<f64>>,
}

impl PnpSolver {
    /// Build from a frame and candidate 2D-3D matches (parallel to the
    /// frame's keypoints).
    pub fn new(frame: &Frame, matches: &[Option<Arc<MapPoint>>]) -> PnpSolver {
        let mut solver = PnpSolver {
            world: Vec::new(),
            pixels: Vec::new(),
            max_error: Vec::new(),
            indices: Vec::new(),
            fx: frame.camera.fx(),
            fy: frame.camera.fy(),
            cx: frame.camera.cx(),
            cy: frame.camera.cy(),
            min_set: 4,
            ransac_min_inliers: 8,
            ransac_max_its: 300,
            iterations_done: 0,
            best_inliers: Vec::new(),
            best_n_inliers: 0,
            best: None,
        };
        for (i, mp) in matches.iter().enumerate() {
            let Some(mp) = mp else { continue };
            if mp.is_bad() {
                continue;
            }
            let kp = &frame.keypoints[i];
            solver.world.push(mp.world_pos());
            solver.pixels.push(kp.pt);
            solver
                .max_error
                .push(5.991 * frame.pyramid.sigma2[kp.octave]);
            solver.indices.push(i);
        }
        solver.best_inliers = vec![false; solver.world.len()];
        solver
    }

    pub fn set_ransac_parameters(
        &mut self,
        probability: f64,
        min_inliers: usize,
        max_its: usize,
        min_set: usize,
    ) {
        self.ransac_min_inliers = min_inliers.max(min_set);
        self.min_set = min_set;
        let n = self.world.len();
        if n == 0 {
            self.ransac_max_its = 0;
            return;
        }
        let epsilon = (self.ransac_min_inliers as f64 / n as f64).min(1.0);
        let its = if epsilon >= 1.0 {
            1.0
        } else {
            ((1.0 - probability).ln() / (1.0 - epsilon.powi(min_set as i32)).ln()).ceil()
        };
        self.ransac_max_its = (its.max(1.0) as usize).min(max_its);
    }

    pub fn n_candidates(&self) -> usize {
        self.world.len()
    }

    pub fn match_index(&self, slot: usize) -> usize {
        self.indices[slot]
    }

    /// Run up to `n` further iterations; on quorum, refine over the inlier
    /// set and return the pose.
    pub fn iterate(
        &mut self,
        n: usize,
        rng: &mut ChaCha8Rng,
    ) -> (Option<Isometry3<f64>>, bool, Vec<bool>, usize) {
        let count = self.world.len();
        if count < self.min_set || self.ransac_min_inliers > count {
            return (None, true, self.best_inliers.clone(), self.best_n_inliers);
        }

        let mut iterations = 0;
        while self.iterations_done < self.ransac_max_its && iterations < n {
            self.iterations_done += 1;
            iterations += 1;

            let picks = sample(rng, count, self.min_set);
            let world: Vec<Point3<f64>> = picks.iter().map(|i| self.world[i]).collect();
            let pixels: Vec<Point2<f64>> = picks.iter().map(|i| self.pixels[i]).collect();
            let Some(pose) = solve_epnp(&world, &pixels, self.fx, self.fy, self.cx, self.cy)
            else {
                continue;
            };

            let (inliers, n_inliers) = self.check_inliers(&pose);
            if n_inliers > self.best_n_inliers {
                self.best_n_inliers = n_inliers;
                self.best_inliers = inliers;
                self.best = Some(pose);
            }
            if n_inliers >= self.ransac_min_inliers {
                if let Some(refined) = self.refine() {
                    return (
                        Some(refined),
                        false,
                        self.best_inliers.clone(),
                        self.best_n_inliers,
                    );
                }
            }
        }

        let no_more = self.iterations_done >= self.ransac_max_its;
        (None, no_more, self.best_inliers.clone(), self.best_n_inliers)
    }

    /// Re-solve over the current inlier set and reclassify.
    fn refine(&mut self) -> Option<Isometry3<f64>> {
        let world: Vec<Point3<f64>> = self
            .best_inliers
            .iter()
            .zip(&self.world)
            .filter_map(|(ok, p)| ok.then_some(*p))
            .collect();
        let pixels: Vec<Point2<f64>> = self
            .best_inliers
            .iter()
            .zip(&self.pixels)
            .filter_map(|(ok, p)| ok.then_some(*p))
            .collect();
        if world.len() < self.min_set {
            return None;
        }
        let pose = solve_epnp(&world, &pixels, self.fx, self.fy, self.cx, self.cy)?;
        let (inliers, n_inliers) = self.check_inliers(&pose);
        if n_inliers >= self.ransac_min_inliers {
            self.best = Some(pose);
            self.best_inliers = inliers;
            self.best_n_inliers = n_inliers;
            Some(pose)
        } else {
            None
        }
    }

    fn check_inliers(&self, pose: &Isometry3<f64>) -> (Vec<bool>, usize) {
        let mut inliers = vec![false; self.world.len()];
        let mut n = 0;
        for i in 0..self.world.len() {
            let err = reprojection_error_sq(
                pose,
                &self.world[i],
                &self.pixels[i],
                self.fx,
                self.fy,
                self.cx,
                self.cy,
            );
            if err < self.max_error[i] {
                inliers[i] = true;
                n += 1;
            }
        }
        (inliers, n)
    }
}
