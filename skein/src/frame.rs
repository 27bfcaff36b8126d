//! The ephemeral per-tick frame.
//!
//! Same feature content as a keyframe but no graph membership, plus the
//! mutable per-keypoint match state the pose optimizer works on. At most
//! three are alive at a time: current, previous, and the initializer's
//! reference.

use std::sync::Arc;

use nalgebra::{Isometry3, Point2, Point3};
use skein_mvg::{ImageBounds, PinholeCamera};
use skein_types::{
    BowVector, Descriptor, Extraction, FeatureVector, FrameId, KeyPoint, ScalePyramid, Vocabulary,
};

use crate::map_point::MapPoint;

const GRID_COLS: usize = 64;
const GRID_ROWS: usize = 48;

/// 2D cell index over the undistorted image bounds for O(1) radius queries.
#[derive(Clone)]
pub struct Grid {
    min_x: f64,
    min_y: f64,
    inv_cell_w: f64,
    inv_cell_h: f64,
    cells: Vec<Vec<u32>>,
}

impl Grid {
    pub fn new(bounds: &ImageBounds, keypoints: &[KeyPoint]) -> Grid {
        let mut grid = Grid {
            min_x: bounds.min_x,
            min_y: bounds.min_y,
            inv_cell_w: GRID_COLS as f64 / bounds.width(),
            inv_cell_h: GRID_ROWS as f64 / bounds.height(),
            cells: vec![Vec::new(); GRID_COLS * GRID_ROWS],
        };
        for (i, kp) in keypoints.iter().enumerate() {
            if let Some(cell) = grid.cell_of(&kp.pt) {
                grid.cells[cell].push(i as u32);
            }
        }
        grid
    }

    fn cell_of(&self, pt: &Point2<f64>) -> Option<usize> {
        let cx = ((pt.x - self.min_x) * self.inv_cell_w).floor();
        let cy = ((pt.y - self.min_y) * self.inv_cell_h).floor();
        if cx < 0.0 || cy < 0.0 || cx >= GRID_COLS as f64 || cy >= GRID_ROWS as f64 {
            return None;
        }
        Some(cy as usize * GRID_COLS + cx as usize)
    }

    /// Indices of keypoints within `r` (Chebyshev) of `(x, y)`, optionally
    /// restricted to an octave range.
    pub fn features_in_area(
        &self,
        keypoints: &[KeyPoint],
        x: f64,
        y: f64,
        r: f64,
        min_octave: Option<usize>,
        max_octave: Option<usize>,
    ) -> Vec<usize> {
        let mut found = Vec::new();
        let min_cx = (((x - r - self.min_x) * self.inv_cell_w).floor().max(0.0)) as usize;
        let max_cx =
            ((((x + r - self.min_x) * self.inv_cell_w).ceil()) as usize).min(GRID_COLS - 1);
        let min_cy = (((y - r - self.min_y) * self.inv_cell_h).floor().max(0.0)) as usize;
        let max_cy =
            ((((y + r - self.min_y) * self.inv_cell_h).ceil()) as usize).min(GRID_ROWS - 1);
        if x + r < self.min_x || y + r < self.min_y {
            return found;
        }
        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                for &idx in &self.cells[cy * GRID_COLS + cx] {
                    let kp = &keypoints[idx as usize];
                    if let Some(min_o) = min_octave {
                        if kp.octave < min_o {
                            continue;
                        }
                    }
                    if let Some(max_o) = max_octave {
                        if kp.octave > max_o {
                            continue;
                        }
                    }
                    if (kp.pt.x - x).abs() <= r && (kp.pt.y - y).abs() <= r {
                        found.push(idx as usize);
                    }
                }
            }
        }
        found
    }
}

/// Projection data of a map point that fell inside the predicted frustum.
#[derive(Debug, Clone, Copy)]
pub struct FrustumHit {
    pub u: f64,
    pub v: f64,
    pub predicted_octave: usize,
    pub view_cos: f64,
}

#[derive(Clone)]
pub struct Frame {
    pub id: FrameId,
    pub timestamp: f64,
    pub camera: Arc<PinholeCamera>,
    /// Undistorted keypoints.
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub pyramid: ScalePyramid,
    pub grid: Grid,
    pub bow: Option<(BowVector, FeatureVector)>,
    /// Per-keypoint landmark association; parallel to `keypoints`.
    pub matches: Vec<Option<Arc<MapPoint>>>,
    /// Set by pose optimization for associations it rejected.
    pub outliers: Vec<bool>,
    pub pose: Option<Isometry3<f64>>,
}

impl Frame {
    pub fn new(
        id: FrameId,
        timestamp: f64,
        extraction: Extraction,
        camera: Arc<PinholeCamera>,
    ) -> Frame {
        let Extraction {
            mut keypoints,
            descriptors,
            pyramid,
        } = extraction;
        let raw: Vec<Point2<f64>> = keypoints.iter().map(|kp| kp.pt).collect();
        for (kp, und) in keypoints.iter_mut().zip(camera.undistort_points(&raw)) {
            kp.pt = und;
        }
        let grid = Grid::new(camera.bounds(), &keypoints);
        let n = keypoints.len();
        Frame {
            id,
            timestamp,
            camera,
            keypoints,
            descriptors,
            pyramid,
            grid,
            bow: None,
            matches: vec![None; n],
            outliers: vec![false; n],
            pose: None,
        }
    }

    pub fn compute_bow(&mut self, vocab: &dyn Vocabulary) {
        if self.bow.is_none() {
            self.bow = Some(vocab.transform(&self.descriptors));
        }
    }

    /// Camera center in world coordinates, when a pose is set.
    pub fn center(&self) -> Option<Point3<f64>> {
        self.pose
            .map(|t_cw| Point3::from(t_cw.inverse().translation.vector))
    }

    pub fn features_in_area(
        &self,
        x: f64,
        y: f64,
        r: f64,
        min_octave: Option<usize>,
        max_octave: Option<usize>,
    ) -> Vec<usize> {
        self.grid
            .features_in_area(&self.keypoints, x, y, r, min_octave, max_octave)
    }

    /// Project a landmark into this frame and apply the view gates: image
    /// bounds, the scale-invariance distance band, and the viewing angle
    /// against the landmark normal.
    pub fn is_in_frustum(&self, mp: &MapPoint, viewing_cos_limit: f64) -> Option<FrustumHit> {
        let t_cw = self.pose?;
        let pw = mp.world_pos();
        let pc = t_cw * pw;
        if pc.z <= 0.0 {
            return None;
        }
        let px = self.camera.project(&pc)?;
        if !self.camera.bounds().contains(&px) {
            return None;
        }

        let po = pw - self.center()?;
        let dist = po.norm();
        if dist < mp.min_distance_invariance() || dist > mp.max_distance_invariance() {
            return None;
        }

        let view_cos = po.dot(&mp.normal()) / dist;
        if view_cos < viewing_cos_limit {
            return None;
        }

        Some(FrustumHit {
            u: px.x,
            v: px.y,
            predicted_octave: mp.predict_octave(dist, &self.pyramid),
            view_cos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypoint(x: f64, y: f64, octave: usize) -> KeyPoint {
        KeyPoint {
            pt: Point2::new(x, y),
            octave,
            angle: 0.0,
        }
    }

    fn bounds() -> ImageBounds {
        ImageBounds {
            min_x: 0.0,
            max_x: 640.0,
            min_y: 0.0,
            max_y: 480.0,
        }
    }

    #[test]
    fn grid_radius_query_finds_neighbors_only() {
        let kps = vec![
            keypoint(100.0, 100.0, 0),
            keypoint(104.0, 98.0, 1),
            keypoint(400.0, 300.0, 0),
        ];
        let grid = Grid::new(&bounds(), &kps);
        let mut hits = grid.features_in_area(&kps, 100.0, 100.0, 10.0, None, None);
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1]);
        assert!(grid
            .features_in_area(&kps, 100.0, 100.0, 1.0, None, None)
            .contains(&0));
    }

    #[test]
    fn grid_octave_filter() {
        let kps = vec![keypoint(100.0, 100.0, 0), keypoint(101.0, 100.0, 3)];
        let grid = Grid::new(&bounds(), &kps);
        let hits = grid.features_in_area(&kps, 100.0, 100.0, 5.0, Some(2), None);
        assert_eq!(hits, vec![1]);
        let hits = grid.features_in_area(&kps, 100.0, 100.0, 5.0, Some(0), Some(0));
        assert_eq!(hits, vec![0]);
    }

    #[test]
    fn query_outside_bounds_is_empty() {
        let kps = vec![keypoint(10.0, 10.0, 0)];
        let grid = Grid::new(&bounds(), &kps);
        assert!(grid
            .features_in_area(&kps, -500.0, -500.0, 5.0, None, None)
            .is_empty());
    }
}
