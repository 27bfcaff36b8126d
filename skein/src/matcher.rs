//! Descriptor matching routines shared by the three pipelines.
//!
//! Every matcher follows the same recipe: restrict candidates (grid radius,
//! shared BoW node, epipolar band, or projected window), gate by Hamming
//! distance and best/second ratio, and optionally enforce consistency of the
//! keypoint orientation differences over a 30-bin histogram.

use std::sync::Arc;

use nalgebra::{Matrix3, Point2};
use skein_mvg::{two_view, Sim3};

use crate::frame::{Frame, FrustumHit};
use crate::keyframe::KeyFrame;
use crate::map::Map;
use crate::map_point::MapPoint;

/// Default gate for accepting a descriptor distance (bits).
pub const TH_LOW: u32 = 50;
/// Relaxed gate used where geometry is already strong (bits).
pub const TH_HIGH: u32 = 100;
const HISTO_LENGTH: usize = 30;

pub struct OrbMatcher {
    nn_ratio: f64,
    check_orientation: bool,
}

struct RotHist {
    bins: Vec<Vec<usize>>,
}

impl RotHist {
    fn new() -> Self {
        Self {
            bins: vec![Vec::new(); HISTO_LENGTH],
        }
    }

    fn push(&mut self, angle1: f64, angle2: f64, payload: usize) {
        let mut rot = angle1 - angle2;
        if rot < 0.0 {
            rot += 360.0;
        }
        let mut bin = (rot * HISTO_LENGTH as f64 / 360.0).round() as usize;
        if bin == HISTO_LENGTH {
            bin = 0;
        }
        self.bins[bin].push(payload);
    }

    /// Indices outside the three tallest bins (second/third only kept when
    /// they hold at least 10% of the tallest).
    fn rejects(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..HISTO_LENGTH).collect();
        order.sort_by_key(|i| std::cmp::Reverse(self.bins[*i].len()));
        let max1 = self.bins[order[0]].len();
        let mut keep = vec![order[0]];
        if self.bins[order[1]].len() as f64 >= 0.1 * max1 as f64 {
            keep.push(order[1]);
        }
        if self.bins[order[2]].len() as f64 >= 0.1 * max1 as f64 {
            keep.push(order[2]);
        }
        let mut rejects = Vec::new();
        for (bin, members) in self.bins.iter().enumerate() {
            if !keep.contains(&bin) {
                rejects.extend_from_slice(members);
            }
        }
        rejects
    }
}

fn radius_by_viewing_cos(view_cos: f64) -> f64 {
    if view_cos > 0.998 {
        2.5
    } else {
        4.0
    }
}

impl OrbMatcher {
    pub fn new(nn_ratio: f64, check_orientation: bool) -> Self {
        Self {
            nn_ratio,
            check_orientation,
        }
    }

    /// Match projected local-map points against the current frame
    /// (track-local-map). `hits` carries the frustum projections; `th`
    /// widens the search window (1 in steady state, larger after
    /// relocalization).
    pub fn search_by_projection_with_hits(
        &self,
        frame: &mut Frame,
        hits: &[(Arc<MapPoint>, FrustumHit)],
        th: f64,
    ) -> usize {
        let mut matched = 0;
        for (mp, hit) in hits {
            if mp.is_bad() {
                continue;
            }
            let octave = hit.predicted_octave;
            let r = radius_by_viewing_cos(hit.view_cos) * th * frame.pyramid.scale_factors[octave];
            let candidates = frame.features_in_area(
                hit.u,
                hit.v,
                r,
                Some(octave.saturating_sub(1)),
                Some(octave + 1),
            );
            if candidates.is_empty() {
                continue;
            }
            let desc = mp.descriptor();

            let mut best = (u32::MAX, usize::MAX, usize::MAX);
            let mut second = (u32::MAX, usize::MAX);
            for idx in candidates {
                if let Some(existing) = &frame.matches[idx] {
                    if existing.n_obs() > 0 {
                        continue;
                    }
                }
                let dist = desc.distance(&frame.descriptors[idx]);
                if dist < best.0 {
                    second = (best.0, best.2);
                    best = (dist, idx, frame.keypoints[idx].octave);
                } else if dist < second.0 {
                    second = (dist, frame.keypoints[idx].octave);
                }
            }

            if best.0 <= TH_HIGH {
                // The ratio gate only applies when both candidates live at
                // the same octave.
                if best.2 == second.1 && best.0 as f64 > self.nn_ratio * second.0 as f64 {
                    continue;
                }
                frame.matches[best.1] = Some(mp.clone());
                matched += 1;
            }
        }
        matched
    }

    /// Motion-model matcher: project the previous frame's landmarks into the
    /// current frame and search a window of `th · scale(octave)` pixels.
    pub fn search_by_projection_last_frame(
        &self,
        current: &mut Frame,
        last: &Frame,
        th: f64,
    ) -> usize {
        let Some(t_cw) = current.pose else {
            return 0;
        };
        let mut matched: usize = 0;
        let mut hist = RotHist::new();

        for (i, mp) in last.matches.iter().enumerate() {
            let Some(mp) = mp else { continue };
            if mp.is_bad() || last.outliers[i] {
                continue;
            }
            let Some(px) = current.camera.project_world(&t_cw, &mp.world_pos()) else {
                continue;
            };
            if !current.camera.bounds().contains(&px) {
                continue;
            }
            let octave = last.keypoints[i].octave;
            let radius = th * current.pyramid.scale_factors[octave];
            let candidates = current.features_in_area(
                px.x,
                px.y,
                radius,
                Some(octave.saturating_sub(1)),
                Some(octave + 1),
            );
            if candidates.is_empty() {
                continue;
            }

            let desc = mp.descriptor();
            let mut best = (u32::MAX, usize::MAX);
            for idx in candidates {
                if let Some(existing) = &current.matches[idx] {
                    if existing.n_obs() > 0 {
                        continue;
                    }
                }
                let dist = desc.distance(&current.descriptors[idx]);
                if dist < best.0 {
                    best = (dist, idx);
                }
            }
            if best.0 <= TH_HIGH {
                current.matches[best.1] = Some(mp.clone());
                matched += 1;
                if self.check_orientation {
                    hist.push(
                        last.keypoints[i].angle,
                        current.keypoints[best.1].angle,
                        best.1,
                    );
                }
            }
        }

        if self.check_orientation {
            for idx in hist.rejects() {
                current.matches[idx] = None;
                matched = matched.saturating_sub(1);
            }
        }
        matched
    }

    /// Relocalization widening pass: project a candidate keyframe's
    /// landmarks into the frame (which already has a tentative pose) and
    /// match within `th · scale(predicted octave)`, skipping landmarks
    /// already found and accepting up to `desc_th` bits.
    pub fn search_by_projection_reloc(
        &self,
        frame: &mut Frame,
        kf: &Arc<KeyFrame>,
        already_found: &std::collections::HashSet<skein_types::MapPointId>,
        th: f64,
        desc_th: u32,
    ) -> usize {
        let Some(t_cw) = frame.pose else {
            return 0;
        };
        let center = nalgebra::Point3::from(t_cw.inverse().translation.vector);
        let mut matched: usize = 0;
        let mut hist = RotHist::new();

        for mp in kf.map_point_set() {
            if mp.is_bad() || already_found.contains(&mp.id) {
                continue;
            }
            let Some(px) = frame.camera.project_world(&t_cw, &mp.world_pos()) else {
                continue;
            };
            if !frame.camera.bounds().contains(&px) {
                continue;
            }
            let dist = (mp.world_pos() - center).norm();
            if dist < mp.min_distance_invariance() || dist > mp.max_distance_invariance() {
                continue;
            }
            let octave = mp.predict_octave(dist, &frame.pyramid);
            let radius = th * frame.pyramid.scale_factors[octave];
            let candidates = frame.features_in_area(
                px.x,
                px.y,
                radius,
                Some(octave.saturating_sub(1)),
                Some(octave + 1),
            );

            let desc = mp.descriptor();
            let mut best = (u32::MAX, usize::MAX);
            for idx in candidates {
                if frame.matches[idx].is_some() {
                    continue;
                }
                let dist = desc.distance(&frame.descriptors[idx]);
                if dist < best.0 {
                    best = (dist, idx);
                }
            }
            if best.0 <= desc_th {
                frame.matches[best.1] = Some(mp.clone());
                matched += 1;
                if self.check_orientation {
                    if let Some(kp_idx) = mp.index_in(kf.id) {
                        hist.push(
                            kf.features.keypoints[kp_idx].angle,
                            frame.keypoints[best.1].angle,
                            best.1,
                        );
                    }
                }
            }
        }

        if self.check_orientation {
            for idx in hist.rejects() {
                frame.matches[idx] = None;
                matched = matched.saturating_sub(1);
            }
        }
        matched
    }

    /// BoW matcher between a keyframe and the current frame: candidate pairs
    /// are restricted to keypoints quantized under the same vocabulary node.
    /// Fills `frame.matches` and returns the match count.
    pub fn search_by_bow_frame(&self, kf: &Arc<KeyFrame>, frame: &mut Frame) -> usize {
        let Some(kf_fv) = kf.feature_vector() else {
            return 0;
        };
        let Some((_, frame_fv)) = frame.bow.clone() else {
            return 0;
        };
        let kf_points = kf.map_points();

        let mut matched: usize = 0;
        let mut hist = RotHist::new();

        for (node, kf_indices) in &kf_fv.0 {
            let Some(frame_indices) = frame_fv.0.get(node) else {
                continue;
            };
            for &idx_kf in kf_indices {
                let idx_kf = idx_kf as usize;
                let Some(mp) = &kf_points[idx_kf] else {
                    continue;
                };
                if mp.is_bad() {
                    continue;
                }
                let desc_kf = &kf.features.descriptors[idx_kf];

                let mut best = (u32::MAX, usize::MAX);
                let mut second = u32::MAX;
                for &idx_f in frame_indices {
                    let idx_f = idx_f as usize;
                    if frame.matches[idx_f].is_some() {
                        continue;
                    }
                    let dist = desc_kf.distance(&frame.descriptors[idx_f]);
                    if dist < best.0 {
                        second = best.0;
                        best = (dist, idx_f);
                    } else if dist < second {
                        second = dist;
                    }
                }

                if best.0 <= TH_LOW && (best.0 as f64) < self.nn_ratio * second as f64 {
                    frame.matches[best.1] = Some(mp.clone());
                    matched += 1;
                    if self.check_orientation {
                        hist.push(
                            kf.features.keypoints[idx_kf].angle,
                            frame.keypoints[best.1].angle,
                            best.1,
                        );
                    }
                }
            }
        }

        if self.check_orientation {
            for idx in hist.rejects() {
                frame.matches[idx] = None;
                matched = matched.saturating_sub(1);
            }
        }
        matched
    }

    /// BoW matcher between two keyframes; returns, per keypoint of `kf1`,
    /// the matched map point of `kf2`.
    pub fn search_by_bow_keyframes(
        &self,
        kf1: &Arc<KeyFrame>,
        kf2: &Arc<KeyFrame>,
    ) -> Vec<Option<Arc<MapPoint>>> {
        let mut matches12: Vec<Option<Arc<MapPoint>>> = vec![None; kf1.features.keypoints.len()];
        let (Some(fv1), Some(fv2)) = (kf1.feature_vector(), kf2.feature_vector()) else {
            return matches12;
        };
        let points1 = kf1.map_points();
        let points2 = kf2.map_points();
        let mut taken2 = vec![false; kf2.features.keypoints.len()];
        let mut hist = RotHist::new();

        for (node, indices1) in &fv1.0 {
            let Some(indices2) = fv2.0.get(node) else {
                continue;
            };
            for &i1 in indices1 {
                let i1 = i1 as usize;
                let Some(mp1) = &points1[i1] else { continue };
                if mp1.is_bad() {
                    continue;
                }
                let d1 = &kf1.features.descriptors[i1];

                let mut best = (u32::MAX, usize::MAX);
                let mut second = u32::MAX;
                for &i2 in indices2 {
                    let i2 = i2 as usize;
                    let Some(mp2) = &points2[i2] else { continue };
                    if taken2[i2] || mp2.is_bad() {
                        continue;
                    }
                    let dist = d1.distance(&kf2.features.descriptors[i2]);
                    if dist < best.0 {
                        second = best.0;
                        best = (dist, i2);
                    } else if dist < second {
                        second = dist;
                    }
                }

                if best.0 <= TH_LOW && (best.0 as f64) < self.nn_ratio * second as f64 {
                    matches12[i1] = points2[best.1].clone();
                    taken2[best.1] = true;
                    if self.check_orientation {
                        hist.push(
                            kf1.features.keypoints[i1].angle,
                            kf2.features.keypoints[best.1].angle,
                            i1,
                        );
                    }
                }
            }
        }

        if self.check_orientation {
            for i1 in hist.rejects() {
                matches12[i1] = None;
            }
        }
        matches12
    }

    /// Windowed search for the two-view initializer: no BoW, no pose, just a
    /// `window`-pixel neighborhood around the previously matched position.
    /// Returns per-keypoint-of-`f1` indices into `f2` and updates
    /// `prev_matched` with the new positions.
    pub fn search_for_initialization(
        &self,
        f1: &Frame,
        f2: &Frame,
        prev_matched: &mut [Point2<f64>],
        window: f64,
    ) -> Vec<Option<usize>> {
        let mut matches12: Vec<Option<usize>> = vec![None; f1.keypoints.len()];
        let mut matched21: Vec<Option<usize>> = vec![None; f2.keypoints.len()];
        let mut dist21: Vec<u32> = vec![u32::MAX; f2.keypoints.len()];
        let mut hist = RotHist::new();

        for (i1, kp1) in f1.keypoints.iter().enumerate() {
            if kp1.octave > 0 {
                continue;
            }
            let candidates =
                f2.features_in_area(prev_matched[i1].x, prev_matched[i1].y, window, Some(0), Some(0));
            if candidates.is_empty() {
                continue;
            }
            let d1 = &f1.descriptors[i1];
            let mut best = (u32::MAX, usize::MAX);
            let mut second = u32::MAX;
            for i2 in candidates {
                let dist = d1.distance(&f2.descriptors[i2]);
                if dist < best.0 {
                    second = best.0;
                    best = (dist, i2);
                } else if dist < second {
                    second = dist;
                }
            }

            if best.0 <= TH_LOW && (best.0 as f64) < self.nn_ratio * second as f64 {
                // A keypoint of f2 may be claimed once; a closer claim evicts
                // the previous one.
                if dist21[best.1] <= best.0 {
                    continue;
                }
                if let Some(prev_i1) = matched21[best.1] {
                    matches12[prev_i1] = None;
                }
                matches12[i1] = Some(best.1);
                matched21[best.1] = Some(i1);
                dist21[best.1] = best.0;
                if self.check_orientation {
                    hist.push(kp1.angle, f2.keypoints[best.1].angle, i1);
                }
            }
        }

        if self.check_orientation {
            for i1 in hist.rejects() {
                matches12[i1] = None;
            }
        }
        for (i1, m) in matches12.iter().enumerate() {
            if let Some(i2) = m {
                prev_matched[i1] = f2.keypoints[*i2].pt;
            }
        }
        matches12
    }

    /// Guided matching for triangulation: BoW-node-restricted pairs of
    /// *unassociated* keypoints, gated by the epipolar distance in pixels
    /// normalized by octave σ². Returns (idx1, idx2) pairs.
    pub fn search_for_triangulation(
        &self,
        kf1: &Arc<KeyFrame>,
        kf2: &Arc<KeyFrame>,
        f12: &Matrix3<f64>,
    ) -> Vec<(usize, usize)> {
        let (Some(fv1), Some(fv2)) = (kf1.feature_vector(), kf2.feature_vector()) else {
            return Vec::new();
        };
        // Epipole of camera 1 in image 2: near it the epipolar gate is
        // meaningless for coarse octaves.
        let epipole = kf2.camera.project_world(&kf2.pose(), &kf1.center());

        let points1 = kf1.map_points();
        let points2 = kf2.map_points();
        let mut taken2 = vec![false; kf2.features.keypoints.len()];
        let mut pairs: Vec<(usize, usize)> = Vec::new();
        let mut hist = RotHist::new();
        let f21 = f12.transpose();

        for (node, indices1) in &fv1.0 {
            let Some(indices2) = fv2.0.get(node) else {
                continue;
            };
            for &i1 in indices1 {
                let i1 = i1 as usize;
                if points1[i1].is_some() {
                    continue;
                }
                let kp1 = &kf1.features.keypoints[i1];
                let d1 = &kf1.features.descriptors[i1];

                let mut best = (u32::MAX, usize::MAX);
                let mut second = u32::MAX;
                for &i2 in indices2 {
                    let i2 = i2 as usize;
                    if taken2[i2] || points2[i2].is_some() {
                        continue;
                    }
                    let dist = d1.distance(&kf2.features.descriptors[i2]);
                    if dist > TH_LOW {
                        continue;
                    }
                    let kp2 = &kf2.features.keypoints[i2];
                    if let Some(e) = &epipole {
                        let dx = kp2.pt.x - e.x;
                        let dy = kp2.pt.y - e.y;
                        if dx * dx + dy * dy < 100.0 * kf2.features.pyramid.scale_factors[kp2.octave]
                        {
                            continue;
                        }
                    }
                    let dist_sq = two_view::epipolar_dist_sq(&f21, &kp1.pt, &kp2.pt);
                    if dist_sq >= 3.84 * kf2.features.pyramid.sigma2[kp2.octave] {
                        continue;
                    }
                    if dist < best.0 {
                        second = best.0;
                        best = (dist, i2);
                    } else if dist < second {
                        second = dist;
                    }
                }

                if best.1 != usize::MAX && (best.0 as f64) < self.nn_ratio * second as f64 {
                    taken2[best.1] = true;
                    if self.check_orientation {
                        hist.push(kp1.angle, kf2.features.keypoints[best.1].angle, pairs.len());
                    }
                    pairs.push((i1, best.1));
                }
            }
        }

        if self.check_orientation {
            let mut rejects = hist.rejects();
            rejects.sort_unstable_by(|a, b| b.cmp(a));
            for idx in rejects {
                pairs.swap_remove(idx);
            }
        }
        pairs
    }

    /// Project `points` into `kf`; close projections with compatible
    /// descriptors either attach to unassociated keypoints or merge with an
    /// existing landmark (the one with more observations survives).
    pub fn fuse(&self, kf: &Arc<KeyFrame>, points: &[Arc<MapPoint>], th: f64, map: &Map) -> usize {
        let t_cw = kf.pose();
        let center = kf.center();
        let pyramid = &kf.features.pyramid;
        let mut fused = 0;

        for mp in points {
            if mp.is_bad() || mp.is_in_keyframe(kf.id) {
                continue;
            }
            let pw = mp.world_pos();
            let Some(px) = kf.camera.project_world(&t_cw, &pw) else {
                continue;
            };
            if !kf.camera.bounds().contains(&px) {
                continue;
            }
            let po = pw - center;
            let dist = po.norm();
            if dist < mp.min_distance_invariance() || dist > mp.max_distance_invariance() {
                continue;
            }
            if po.dot(&mp.normal()) < 0.5 * dist {
                continue;
            }
            let octave = mp.predict_octave(dist, pyramid);
            let radius = th * pyramid.scale_factors[octave];
            let candidates = kf.features_in_area(px.x, px.y, radius);
            if candidates.is_empty() {
                continue;
            }

            let desc = mp.descriptor();
            let mut best = (u32::MAX, usize::MAX);
            for idx in candidates {
                let kp = &kf.features.keypoints[idx];
                if kp.octave + 1 < octave || kp.octave > octave + 1 {
                    continue;
                }
                let du = px.x - kp.pt.x;
                let dv = px.y - kp.pt.y;
                if (du * du + dv * dv) * pyramid.inv_sigma2[kp.octave] > 5.99 {
                    continue;
                }
                let dist = desc.distance(&kf.features.descriptors[idx]);
                if dist < best.0 {
                    best = (dist, idx);
                }
            }

            if best.0 <= TH_LOW {
                match kf.get_map_point(best.1) {
                    Some(existing) if !existing.is_bad() => {
                        if existing.n_obs() > mp.n_obs() {
                            mp.replace(&existing, map);
                        } else {
                            existing.replace(mp, map);
                        }
                    }
                    _ => {
                        mp.add_observation(kf.id, best.1);
                        kf.add_map_point(mp.clone(), best.1);
                    }
                }
                fused += 1;
            }
        }
        fused
    }

    /// Loop-fusion variant of [`Self::fuse`]: projection under a corrected
    /// Sim3 pose. Conflicting landmarks are reported through `replace` so
    /// the caller can merge them under the map-update lock.
    pub fn fuse_with_scw(
        &self,
        kf: &Arc<KeyFrame>,
        scw: &Sim3,
        points: &[Arc<MapPoint>],
        th: f64,
        replace: &mut [Option<Arc<MapPoint>>],
    ) -> usize {
        let t_cw = scw.to_isometry_rescaled();
        let center = nalgebra::Point3::from(t_cw.inverse().translation.vector);
        let pyramid = &kf.features.pyramid;
        let mut fused = 0;

        for (i, mp) in points.iter().enumerate() {
            if mp.is_bad() || mp.is_in_keyframe(kf.id) {
                continue;
            }
            let pw = mp.world_pos();
            let Some(px) = kf.camera.project_world(&t_cw, &pw) else {
                continue;
            };
            if !kf.camera.bounds().contains(&px) {
                continue;
            }
            let po = pw - center;
            let dist = po.norm();
            if dist < mp.min_distance_invariance() || dist > mp.max_distance_invariance() {
                continue;
            }
            if po.dot(&mp.normal()) < 0.5 * dist {
                continue;
            }
            let octave = mp.predict_octave(dist, pyramid);
            let radius = th * pyramid.scale_factors[octave];
            let candidates = kf.features_in_area(px.x, px.y, radius);

            let desc = mp.descriptor();
            let mut best = (u32::MAX, usize::MAX);
            for idx in candidates {
                let kp = &kf.features.keypoints[idx];
                if kp.octave + 1 < octave || kp.octave > octave + 1 {
                    continue;
                }
                let dist = desc.distance(&kf.features.descriptors[idx]);
                if dist < best.0 {
                    best = (dist, idx);
                }
            }

            if best.0 <= TH_LOW {
                match kf.get_map_point(best.1) {
                    Some(existing) if !existing.is_bad() => {
                        replace[i] = Some(existing);
                    }
                    _ => {
                        mp.add_observation(kf.id, best.1);
                        kf.add_map_point(mp.clone(), best.1);
                    }
                }
                fused += 1;
            }
        }
        fused
    }

    /// Guided projection of loop-side landmarks into `kf` under a tentative
    /// corrected pose; extends `matched` (parallel to `kf`'s keypoints).
    pub fn search_by_projection_scw(
        &self,
        kf: &Arc<KeyFrame>,
        scw: &Sim3,
        points: &[Arc<MapPoint>],
        matched: &mut [Option<Arc<MapPoint>>],
        th: f64,
    ) -> usize {
        let t_cw = scw.to_isometry_rescaled();
        let center = nalgebra::Point3::from(t_cw.inverse().translation.vector);
        let pyramid = &kf.features.pyramid;
        let already: std::collections::HashSet<_> = matched
            .iter()
            .flatten()
            .map(|mp| mp.id)
            .collect();
        let mut count = 0;

        for mp in points {
            if mp.is_bad() || already.contains(&mp.id) {
                continue;
            }
            let pw = mp.world_pos();
            let Some(px) = kf.camera.project_world(&t_cw, &pw) else {
                continue;
            };
            if !kf.camera.bounds().contains(&px) {
                continue;
            }
            let po = pw - center;
            let dist = po.norm();
            if dist < mp.min_distance_invariance() || dist > mp.max_distance_invariance() {
                continue;
            }
            if po.dot(&mp.normal()) < 0.5 * dist {
                continue;
            }
            let octave = mp.predict_octave(dist, pyramid);
            let radius = th * pyramid.scale_factors[octave];
            let candidates = kf.features_in_area(px.x, px.y, radius);

            let desc = mp.descriptor();
            let mut best = (u32::MAX, usize::MAX);
            for idx in candidates {
                if matched[idx].is_some() {
                    continue;
                }
                let kp = &kf.features.keypoints[idx];
                if kp.octave + 1 < octave || kp.octave > octave + 1 {
                    continue;
                }
                let dist = desc.distance(&kf.features.descriptors[idx]);
                if dist < best.0 {
                    best = (dist, idx);
                }
            }
            if best.0 <= TH_LOW {
                matched[best.1] = Some(mp.clone());
                count += 1;
            }
        }
        count
    }

    /// Symmetric projection search under a tentative similarity `S12`
    /// between two keyframes; mutual agreements extend `matches12`.
    pub fn search_by_sim3(
        &self,
        kf1: &Arc<KeyFrame>,
        kf2: &Arc<KeyFrame>,
        matches12: &mut [Option<Arc<MapPoint>>],
        s12: &Sim3,
        th: f64,
    ) -> usize {
        let s21 = s12.inverse();
        let points1 = kf1.map_point_set();
        let points2 = kf2.map_point_set();
        let t_1w = kf1.pose();
        let t_2w = kf2.pose();

        let already1: std::collections::HashSet<_> =
            matches12.iter().flatten().map(|mp| mp.id).collect();

        // Candidate match of each kf2 point in kf1's keypoints, and vice
        // versa.
        let find = |kf: &Arc<KeyFrame>,
                    t_cw: &nalgebra::Isometry3<f64>,
                    s: &Sim3,
                    mp: &Arc<MapPoint>|
         -> Option<usize> {
            let pc = s.transform(&(t_cw * mp.world_pos()));
            if pc.z <= 0.0 {
                return None;
            }
            let px = kf.camera.project(&pc)?;
            if !kf.camera.bounds().contains(&px) {
                return None;
            }
            let dist = pc.coords.norm();
            if dist < mp.min_distance_invariance() || dist > mp.max_distance_invariance() {
                return None;
            }
            let pyramid = &kf.features.pyramid;
            let octave = mp.predict_octave(dist, pyramid);
            let radius = th * pyramid.scale_factors[octave];
            let desc = mp.descriptor();
            let mut best = (u32::MAX, usize::MAX);
            for idx in kf.features_in_area(px.x, px.y, radius) {
                let kp = &kf.features.keypoints[idx];
                if kp.octave + 1 < octave || kp.octave > octave + 1 {
                    continue;
                }
                let d = desc.distance(&kf.features.descriptors[idx]);
                if d < best.0 {
                    best = (d, idx);
                }
            }
            (best.0 <= TH_HIGH).then_some(best.1)
        };

        // kf2 landmarks into kf1 (via S12 out of kf2's camera frame).
        let mut match1: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();
        for (i2, mp2) in points2.iter().enumerate() {
            if let Some(i1) = find(kf1, &t_2w, s12, mp2) {
                match1.insert(i1, i2);
            }
        }
        // kf1 landmarks into kf2.
        let mut match2: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();
        for (i1, mp1) in points1.iter().enumerate() {
            if already1.contains(&mp1.id) {
                continue;
            }
            if let Some(i2) = find(kf2, &t_1w, &s21, mp1) {
                match2.insert(i2, i1);
            }
        }

        // Keep mutual agreements only.
        let mut found = 0;
        for (&i1_kp, &i2_set) in &match1 {
            let mp2 = &points2[i2_set];
            let Some(i2_kp) = mp2.index_in(kf2.id) else {
                continue;
            };
            if let Some(&i1_set) = match2.get(&i2_kp) {
                let mp1 = &points1[i1_set];
                if mp1.index_in(kf1.id) == Some(i1_kp) && matches12[i1_kp].is_none() {
                    matches12[i1_kp] = Some(mp2.clone());
                    found += 1;
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rot_hist_keeps_three_maxima() {
        let mut hist = RotHist::new();
        // 6 matches at ~0°, 3 at ~96°, 1 at ~180°.
        for i in 0..6 {
            hist.push(10.0, 10.0, i);
        }
        for i in 6..9 {
            hist.push(100.0, 4.0, i);
        }
        hist.push(200.0, 20.0, 9);
        let rejects = hist.rejects();
        // The lone 180° match is below 10% of nothing: three bins are
        // occupied, all are kept (bin three holds ≥ 10% of six).
        assert!(rejects.is_empty());
    }

    #[test]
    fn rot_hist_rejects_sparse_bins() {
        let mut hist = RotHist::new();
        for i in 0..40 {
            hist.push(10.0, 10.0, i);
        }
        hist.push(100.0, 4.0, 40);
        hist.push(200.0, 20.0, 41);
        let mut rejects = hist.rejects();
        rejects.sort_unstable();
        // 1 < 0.1 * 40, so both stragglers are rejected.
        assert_eq!(rejects, vec![40, 41]);
    }

    #[test]
    fn viewing_cos_radius() {
        assert_eq!(radius_by_viewing_cos(0.999), 2.5);
        assert_eq!(radius_by_viewing_cos(0.9), 4.0);
    }
}
