//! Per-frame tracking: the front-end state machine.
//!
//! Each tick estimates the camera pose of one frame against the map —
//! motion-model prediction first, reference-keyframe matching as fallback,
//! then refinement against the local map — and decides whether the frame is
//! promoted to a keyframe. Failures degrade the state machine (OK → LOST);
//! relocalization climbs back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::{Isometry3, Point2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use skein_mvg::PinholeCamera;
use skein_types::{FeatureExtractor, GrayImage, KeyFrameId, SlamConfig, Vocabulary};
use tracing::{debug, info, warn};

use crate::frame::Frame;
use crate::initializer::Initializer;
use crate::keyframe::KeyFrame;
use crate::keyframe_database::KeyFrameDatabase;
use crate::local_mapping::LocalMapping;
use crate::loop_closing::LoopClosing;
use crate::map::Map;
use crate::map_point::MapPoint;
use crate::matcher::{OrbMatcher, TH_HIGH};
use crate::optimizer;
use crate::pnp_solver::PnpSolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    NoImagesYet,
    NotInitialized,
    Ok,
    Lost,
}

pub struct Tracking {
    state: TrackingState,
    camera: Arc<PinholeCamera>,
    vocab: Arc<dyn Vocabulary>,
    extractor: Arc<dyn FeatureExtractor>,
    map: Arc<Map>,
    db: Arc<KeyFrameDatabase>,
    local_mapper: Arc<LocalMapping>,
    loop_closer: Option<Arc<LoopClosing>>,

    min_frames: u64,
    max_frames: u64,
    only_tracking: bool,
    visual_odometry: bool,

    initializer: Option<Initializer>,
    prev_matched: Vec<Point2<f64>>,

    last_frame: Option<Frame>,
    /// Pose of the last frame relative to its reference keyframe, so the
    /// motion model survives backend pose updates.
    last_relative: Option<(KeyFrameId, Isometry3<f64>)>,
    velocity: Option<Isometry3<f64>>,
    reference_kf: Option<Arc<KeyFrame>>,
    local_keyframes: Vec<Arc<KeyFrame>>,
    local_points: Vec<Arc<MapPoint>>,

    last_kf_frame_id: u64,
    last_reloc_frame_id: u64,
    matches_inliers: usize,
    reset_requested: bool,
    rng: ChaCha8Rng,
}

impl Tracking {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &SlamConfig,
        camera: Arc<PinholeCamera>,
        vocab: Arc<dyn Vocabulary>,
        extractor: Arc<dyn FeatureExtractor>,
        map: Arc<Map>,
        db: Arc<KeyFrameDatabase>,
        local_mapper: Arc<LocalMapping>,
    ) -> Tracking {
        Tracking {
            state: TrackingState::NoImagesYet,
            camera,
            vocab,
            extractor,
            map,
            db,
            local_mapper,
            loop_closer: None,
            min_frames: config.min_frames(),
            max_frames: config.max_frames(),
            only_tracking: false,
            visual_odometry: false,
            initializer: None,
            prev_matched: Vec::new(),
            last_frame: None,
            last_relative: None,
            velocity: None,
            reference_kf: None,
            local_keyframes: Vec::new(),
            local_points: Vec::new(),
            last_kf_frame_id: 0,
            last_reloc_frame_id: 0,
            matches_inliers: 0,
            reset_requested: false,
            rng: ChaCha8Rng::seed_from_u64(0),
        }
    }

    pub fn set_loop_closer(&mut self, loop_closer: Arc<LoopClosing>) {
        self.loop_closer = Some(loop_closer);
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    /// Localization mode: keep estimating poses against the map, never grow
    /// it.
    pub fn set_only_tracking(&mut self, flag: bool) {
        self.only_tracking = flag;
        if !flag {
            self.visual_odometry = false;
        }
    }

    pub fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_requested
    }

    /// Clear map and worker state; next frame starts from scratch. Must run
    /// outside a tracking tick.
    pub fn perform_reset(&mut self) {
        warn!("tracking reset");
        self.local_mapper.request_reset();
        if let Some(loop_closer) = &self.loop_closer {
            loop_closer.request_reset();
        }
        self.db.clear();
        self.map.clear();
        self.initializer = None;
        self.prev_matched.clear();
        self.last_frame = None;
        self.last_relative = None;
        self.velocity = None;
        self.reference_kf = None;
        self.local_keyframes.clear();
        self.local_points.clear();
        self.last_kf_frame_id = 0;
        self.last_reloc_frame_id = 0;
        self.matches_inliers = 0;
        self.reset_requested = false;
        self.state = TrackingState::NoImagesYet;
    }

    /// Entry point per grayscale frame; returns the estimated world→camera
    /// pose, or `None` while not initialized or lost.
    pub fn track_image(&mut self, image: &GrayImage<'_>, timestamp: f64) -> Option<Isometry3<f64>> {
        if self.reset_requested {
            self.perform_reset();
        }
        let extraction = match self.state {
            TrackingState::NoImagesYet | TrackingState::NotInitialized => {
                self.extractor.extract_doubled(image)
            }
            _ => self.extractor.extract(image),
        };
        let frame = Frame::new(self.map.new_frame_id(), timestamp, extraction, self.camera.clone());
        self.track(frame)
    }

    /// Track one already-constructed frame (the image-free entry point).
    pub fn track(&mut self, mut frame: Frame) -> Option<Isometry3<f64>> {
        if self.state == TrackingState::NoImagesYet {
            self.state = TrackingState::NotInitialized;
        }

        let map = self.map.clone();
        let guard = map.lock_update();

        if self.state == TrackingState::NotInitialized {
            self.monocular_initialization(&mut frame);
            let pose = frame.pose;
            self.store_last(frame);
            return pose;
        }

        let mut ok = match self.state {
            TrackingState::Ok => {
                self.check_replaced_in_last_frame();
                self.update_last_frame();
                let motion_usable =
                    self.velocity.is_some() && frame.id.0 >= self.last_reloc_frame_id + 2;
                if motion_usable {
                    self.track_with_motion_model(&mut frame)
                        || self.track_reference_keyframe(&mut frame)
                } else {
                    self.track_reference_keyframe(&mut frame)
                }
            }
            TrackingState::Lost => self.relocalization(&mut frame),
            _ => unreachable!("initialization states handled above"),
        };

        if ok && !(self.only_tracking && self.visual_odometry) {
            ok = self.track_local_map(&mut frame);
        }

        self.state = if ok { TrackingState::Ok } else { TrackingState::Lost };

        if ok {
            // Motion model for the next tick.
            self.velocity = match (&self.last_frame, frame.pose) {
                (Some(last), Some(pose)) => last.pose.map(|last_pose| pose * last_pose.inverse()),
                _ => None,
            };

            // Points seen by this frame only carry no map evidence yet.
            for i in 0..frame.matches.len() {
                if let Some(mp) = &frame.matches[i] {
                    if mp.n_obs() < 1 {
                        frame.outliers[i] = false;
                        frame.matches[i] = None;
                    }
                }
            }

            if !self.only_tracking && self.need_new_keyframe(&frame) {
                self.create_new_keyframe(&frame);
            }

            // Outliers may enter the new keyframe (local BA gets the final
            // say) but never the next frame's motion model.
            for i in 0..frame.matches.len() {
                if frame.outliers[i] {
                    frame.matches[i] = None;
                    frame.outliers[i] = false;
                }
            }
        } else if self.state == TrackingState::Lost {
            self.velocity = None;
            if self.map.keyframes_in_map() <= 5 {
                warn!("tracking lost soon after initialization, requesting reset");
                self.reset_requested = true;
            }
        }

        drop(guard);

        let pose = frame.pose;
        self.store_last(frame);
        pose
    }

    fn store_last(&mut self, frame: Frame) {
        self.last_relative = match (&self.reference_kf, frame.pose) {
            (Some(kf), Some(pose)) => Some((kf.id, pose * kf.pose().inverse())),
            _ => None,
        };
        self.last_frame = Some(frame);
    }

    // ---- initialization ----------------------------------------------------

    fn monocular_initialization(&mut self, frame: &mut Frame) {
        let arm = |frame: &Frame| -> (Option<Initializer>, Vec<Point2<f64>>) {
            let prev: Vec<Point2<f64>> = frame.keypoints.iter().map(|kp| kp.pt).collect();
            (Some(Initializer::new(frame.clone())), prev)
        };

        let Some(initializer) = &self.initializer else {
            if frame.keypoints.len() > 100 {
                let (init, prev) = arm(frame);
                self.initializer = init;
                self.prev_matched = prev;
            }
            return;
        };

        if frame.keypoints.len() <= 100 {
            self.initializer = None;
            return;
        }

        let matcher = OrbMatcher::new(0.9, true);
        let matches = matcher.search_for_initialization(
            initializer.reference(),
            frame,
            &mut self.prev_matched,
            100.0,
        );
        let n_matches = matches.iter().flatten().count();
        if n_matches < 100 {
            // Too little overlap: re-arm with the current frame, leaving the
            // map untouched.
            debug!(n_matches, "bootstrap match count too low, re-arming");
            let (init, prev) = arm(frame);
            self.initializer = init;
            self.prev_matched = prev;
            return;
        }

        if let Some(result) = initializer.initialize(frame, &matches, 0) {
            self.create_initial_map(frame, result);
        }
    }

    fn create_initial_map(&mut self, frame: &mut Frame, result: crate::initializer::InitResult) {
        let initializer = self.initializer.take().expect("initializer produced a result");
        let mut ref_frame = initializer.reference().clone();
        ref_frame.pose = Some(Isometry3::identity());
        frame.pose = Some(Isometry3::from_parts(
            nalgebra::Translation3::from(result.translation),
            nalgebra::UnitQuaternion::from_matrix(&result.rotation),
        ));

        let kf_ini = KeyFrame::from_frame(self.map.new_keyframe_id(), &ref_frame);
        let kf_cur = KeyFrame::from_frame(self.map.new_keyframe_id(), frame);
        kf_ini.compute_bow(self.vocab.as_ref());
        kf_cur.compute_bow(self.vocab.as_ref());
        self.map.add_keyframe(kf_ini.clone());
        self.map.add_keyframe(kf_cur.clone());

        for (i1, i2, pos) in &result.triangulated {
            let mp = Arc::new(MapPoint::new(
                self.map.new_map_point_id(),
                *pos,
                kf_cur.id,
                kf_cur.features.descriptors[*i2],
            ));
            kf_ini.add_map_point(mp.clone(), *i1);
            kf_cur.add_map_point(mp.clone(), *i2);
            mp.add_observation(kf_ini.id, *i1);
            mp.add_observation(kf_cur.id, *i2);
            mp.compute_distinctive_descriptors(&self.map);
            mp.update_normal_and_depth(&self.map);
            self.map.add_map_point(mp.clone());
            frame.matches[*i2] = Some(mp);
        }
        kf_ini.update_connections(&self.map);
        kf_cur.update_connections(&self.map);
        info!(
            points = self.map.points_in_map(),
            "initial map created, running full bundle adjustment"
        );

        if let Some((poses, positions)) =
            optimizer::global_bundle_adjustment(&self.map, 20, Some(kf_ini.id), None)
        {
            for kf in self.map.keyframes() {
                if let Some(pose) = poses.get(&kf.id) {
                    kf.set_pose(*pose);
                }
            }
            for mp in self.map.points() {
                if let Some(pos) = positions.get(&mp.id) {
                    mp.set_world_pos(*pos);
                }
            }
        }

        // Monocular scale is arbitrary; pin the scene median depth to 1.
        let median_depth = kf_ini.compute_scene_median_depth(2).unwrap_or(-1.0);
        if median_depth <= 0.0 || kf_cur.tracked_map_points(1) < 100 {
            warn!(median_depth, "degenerate bootstrap, resetting map");
            self.db.clear();
            self.map.clear();
            self.initializer = None;
            return;
        }
        let inv_median = 1.0 / median_depth;
        let mut pose_cur = kf_cur.pose();
        pose_cur.translation.vector *= inv_median;
        kf_cur.set_pose(pose_cur);
        for mp in self.map.points() {
            let pos = mp.world_pos();
            mp.set_world_pos(nalgebra::Point3::from(pos.coords * inv_median));
            mp.update_normal_and_depth(&self.map);
        }

        self.local_mapper.insert_keyframe(kf_ini.clone());
        self.local_mapper.insert_keyframe(kf_cur.clone());

        frame.pose = Some(kf_cur.pose());
        self.last_kf_frame_id = frame.id.0;
        self.reference_kf = Some(kf_cur.clone());
        self.local_keyframes = vec![kf_cur.clone(), kf_ini];
        self.local_points = self.map.points();
        self.map.set_reference_map_points(self.local_points.clone());
        self.state = TrackingState::Ok;
        info!("map initialized with median depth pinned to 1");
    }

    // ---- per-frame tracking modes -------------------------------------------

    fn check_replaced_in_last_frame(&mut self) {
        let Some(last) = &mut self.last_frame else {
            return;
        };
        for slot in last.matches.iter_mut() {
            if let Some(mp) = slot {
                if let Some(replacement) = mp.replacement() {
                    *slot = Some(replacement);
                }
            }
        }
    }

    /// Re-anchor the last frame's pose on its reference keyframe, which the
    /// backend may have moved since the frame was tracked.
    fn update_last_frame(&mut self) {
        let (Some(last), Some((ref_id, relative))) = (&mut self.last_frame, self.last_relative)
        else {
            return;
        };
        if let Some(kf) = self.map.keyframe(ref_id) {
            last.pose = Some(relative * kf.pose());
        }
    }

    fn track_with_motion_model(&mut self, frame: &mut Frame) -> bool {
        let (Some(velocity), Some(last)) = (self.velocity, self.last_frame.clone()) else {
            return false;
        };
        let Some(last_pose) = last.pose else {
            return false;
        };
        frame.pose = Some(velocity * last_pose);
        frame.matches.iter_mut().for_each(|m| *m = None);

        let matcher = OrbMatcher::new(0.9, true);
        let mut n_matches = matcher.search_by_projection_last_frame(frame, &last, 15.0);
        if n_matches < 20 {
            frame.matches.iter_mut().for_each(|m| *m = None);
            n_matches = matcher.search_by_projection_last_frame(frame, &last, 30.0);
        }
        if n_matches < 20 {
            return false;
        }

        optimizer::pose_optimization(frame);
        let n_map = self.discard_outliers(frame);

        if self.only_tracking {
            self.visual_odometry = n_map < 10;
            return n_matches > 20;
        }
        n_map >= 10
    }

    fn track_reference_keyframe(&mut self, frame: &mut Frame) -> bool {
        let Some(reference) = self.reference_kf.clone() else {
            return false;
        };
        frame.compute_bow(self.vocab.as_ref());

        let matcher = OrbMatcher::new(0.7, true);
        let n_matches = matcher.search_by_bow_frame(&reference, frame);
        if n_matches < 15 {
            return false;
        }
        frame.pose = self.last_frame.as_ref().and_then(|f| f.pose);
        if frame.pose.is_none() {
            return false;
        }

        optimizer::pose_optimization(frame);
        self.discard_outliers(frame) >= 10
    }

    /// Clear rejected associations; count the survivors that carry map
    /// evidence.
    fn discard_outliers(&self, frame: &mut Frame) -> usize {
        let mut n_map = 0;
        for i in 0..frame.matches.len() {
            let Some(mp) = &frame.matches[i] else { continue };
            if frame.outliers[i] {
                frame.matches[i] = None;
                frame.outliers[i] = false;
            } else if mp.n_obs() > 0 {
                n_map += 1;
            }
        }
        n_map
    }

    // ---- local map ----------------------------------------------------------

    fn track_local_map(&mut self, frame: &mut Frame) -> bool {
        self.update_local_keyframes(frame);
        self.update_local_points();
        self.search_local_points(frame);

        optimizer::pose_optimization(frame);

        self.matches_inliers = 0;
        for i in 0..frame.matches.len() {
            let Some(mp) = &frame.matches[i] else { continue };
            if !frame.outliers[i] {
                mp.increase_found(1);
                if self.only_tracking || mp.n_obs() > 0 {
                    self.matches_inliers += 1;
                }
            }
        }
        self.map.set_reference_map_points(self.local_points.clone());

        // Stricter right after relocalization.
        if frame.id.0 < self.last_reloc_frame_id + self.max_frames && self.matches_inliers < 50 {
            return false;
        }
        self.matches_inliers >= 30
    }

    fn update_local_keyframes(&mut self, frame: &Frame) {
        let mut votes: HashMap<KeyFrameId, usize> = HashMap::new();
        for slot in &frame.matches {
            let Some(mp) = slot else { continue };
            if mp.is_bad() {
                continue;
            }
            for kf_id in mp.observations().keys() {
                *votes.entry(*kf_id).or_insert(0) += 1;
            }
        }
        if votes.is_empty() {
            return;
        }

        const BUDGET: usize = 80;
        self.local_keyframes.clear();
        let mut included: HashSet<KeyFrameId> = HashSet::new();
        let (mut best_kf, mut best_votes) = (None, 0usize);
        for (kf_id, n) in &votes {
            let Some(kf) = self.map.keyframe(*kf_id) else {
                continue;
            };
            if kf.is_bad() {
                continue;
            }
            if *n > best_votes {
                best_votes = *n;
                best_kf = Some(kf.clone());
            }
            included.insert(*kf_id);
            self.local_keyframes.push(kf);
        }

        // Neighbors of neighbors, spanning-tree children and parents, up to
        // the budget.
        let direct: Vec<Arc<KeyFrame>> = self.local_keyframes.clone();
        'outer: for kf in direct {
            for neighbor_id in kf
                .best_covisibles(10)
                .into_iter()
                .chain(kf.children())
                .chain(kf.parent())
            {
                if self.local_keyframes.len() > BUDGET {
                    break 'outer;
                }
                if included.contains(&neighbor_id) {
                    continue;
                }
                let Some(neighbor) = self.map.keyframe(neighbor_id) else {
                    continue;
                };
                if neighbor.is_bad() {
                    continue;
                }
                included.insert(neighbor_id);
                self.local_keyframes.push(neighbor);
            }
        }

        if let Some(best) = best_kf {
            self.reference_kf = Some(best);
        }
    }

    fn update_local_points(&mut self) {
        self.local_points.clear();
        let mut seen = HashSet::new();
        for kf in &self.local_keyframes {
            for mp in kf.map_point_set() {
                if seen.insert(mp.id) {
                    self.local_points.push(mp);
                }
            }
        }
    }

    fn search_local_points(&mut self, frame: &mut Frame) {
        let mut already: HashSet<_> = HashSet::new();
        for mp in frame.matches.iter().flatten() {
            mp.increase_visible(1);
            already.insert(mp.id);
        }

        let mut hits = Vec::new();
        for mp in &self.local_points {
            if already.contains(&mp.id) || mp.is_bad() {
                continue;
            }
            if let Some(hit) = frame.is_in_frustum(mp, 0.5) {
                mp.increase_visible(1);
                hits.push((mp.clone(), hit));
            }
        }
        if hits.is_empty() {
            return;
        }
        let th = if frame.id.0 < self.last_reloc_frame_id + 2 {
            5.0
        } else {
            1.0
        };
        let matcher = OrbMatcher::new(0.8, true);
        matcher.search_by_projection_with_hits(frame, &hits, th);
    }

    // ---- keyframe policy ----------------------------------------------------

    fn need_new_keyframe(&self, frame: &Frame) -> bool {
        if self.only_tracking {
            return false;
        }
        if self.local_mapper.is_stopped() || self.local_mapper.stop_requested() {
            return false;
        }
        let n_kfs = self.map.keyframes_in_map() as u64;
        if frame.id.0 < self.last_reloc_frame_id + self.max_frames && n_kfs > self.max_frames {
            return false;
        }

        let min_obs = if n_kfs <= 2 { 2 } else { 3 };
        let ref_matches = self
            .reference_kf
            .as_ref()
            .map(|kf| kf.tracked_map_points(min_obs))
            .unwrap_or(0);
        let idle = self.local_mapper.accept_keyframes();

        let c1a = frame.id.0 >= self.last_kf_frame_id + self.max_frames;
        let c1b = frame.id.0 >= self.last_kf_frame_id + self.min_frames && idle;
        let c2 =
            (self.matches_inliers as f64) < 0.9 * ref_matches as f64 && self.matches_inliers >= 50;

        if (c1a || c1b) && c2 {
            if idle {
                true
            } else {
                self.local_mapper.interrupt_ba();
                false
            }
        } else {
            false
        }
    }

    fn create_new_keyframe(&mut self, frame: &Frame) {
        if !self.local_mapper.set_not_stop(true) {
            return;
        }
        let kf = KeyFrame::from_frame(self.map.new_keyframe_id(), frame);
        kf.compute_bow(self.vocab.as_ref());
        debug!(kf = %kf.id, frame = %frame.id, "new keyframe");
        self.reference_kf = Some(kf.clone());
        self.local_mapper.insert_keyframe(kf);
        self.local_mapper.set_not_stop(false);
        self.last_kf_frame_id = frame.id.0;
    }

    // ---- relocalization ------------------------------------------------------

    fn relocalization(&mut self, frame: &mut Frame) -> bool {
        frame.compute_bow(self.vocab.as_ref());
        let candidates = self.db.detect_relocalization_candidates(frame, &self.map);
        if candidates.is_empty() {
            return false;
        }
        debug!(n = candidates.len(), "relocalization candidates");

        let matcher = OrbMatcher::new(0.75, true);

        struct Candidate {
            kf: Arc<KeyFrame>,
            matches: Vec<Option<Arc<MapPoint>>>,
            solver: PnpSolver,
        }
        let mut alive: Vec<Candidate> = Vec::new();
        for kf in candidates {
            if kf.is_bad() {
                continue;
            }
            frame.matches.iter_mut().for_each(|m| *m = None);
            let n = matcher.search_by_bow_frame(&kf, frame);
            if n < 15 {
                continue;
            }
            let matches = frame.matches.clone();
            let mut solver = PnpSolver::new(frame, &matches);
            solver.set_ransac_parameters(0.99, 8, 300, 4);
            alive.push(Candidate { kf, matches, solver });
        }
        frame.matches.iter_mut().for_each(|m| *m = None);

        let wide_matcher = OrbMatcher::new(0.9, true);
        while !alive.is_empty() {
            let mut i = 0;
            while i < alive.len() {
                let cand = &mut alive[i];
                let (pose, no_more, inliers, _n) = cand.solver.iterate(5, &mut self.rng);

                if let Some(pose) = pose {
                    frame.pose = Some(pose);
                    frame.matches.iter_mut().for_each(|m| *m = None);
                    let mut found: HashSet<_> = HashSet::new();
                    for (slot, ok) in inliers.iter().enumerate() {
                        if *ok {
                            let idx = cand.solver.match_index(slot);
                            frame.matches[idx] = cand.matches[idx].clone();
                            if let Some(mp) = &frame.matches[idx] {
                                found.insert(mp.id);
                            }
                        }
                    }

                    let mut n_good = optimizer::pose_optimization(frame);
                    if n_good < 10 {
                        // A hypothesis that cannot be refined exhausts the
                        // candidate.
                        alive.remove(i);
                        continue;
                    }
                    self.discard_outliers(frame);

                    // Widen twice like the reference pipeline: a coarse pass
                    // with a permissive descriptor gate, then a narrow one.
                    if n_good < 50 {
                        let added = wide_matcher
                            .search_by_projection_reloc(frame, &cand.kf, &found, 10.0, TH_HIGH);
                        if n_good + added >= 50 {
                            n_good = optimizer::pose_optimization(frame);
                            if n_good > 30 && n_good < 50 {
                                found.clear();
                                for mp in frame.matches.iter().flatten() {
                                    found.insert(mp.id);
                                }
                                let added = wide_matcher
                                    .search_by_projection_reloc(frame, &cand.kf, &found, 3.0, 64);
                                if n_good + added >= 50 {
                                    n_good = optimizer::pose_optimization(frame);
                                    self.discard_outliers(frame);
                                }
                            }
                        }
                    }

                    if n_good >= 50 {
                        info!(frame = %frame.id, kf = %cand.kf.id, "relocalized");
                        self.last_reloc_frame_id = frame.id.0;
                        self.velocity = None;
                        return true;
                    }
                }
                if no_more {
                    alive.remove(i);
                } else {
                    i += 1;
                }
            }
        }
        false
    }
}
