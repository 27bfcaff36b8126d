//! The loop-closing worker: BoW-based loop detection with a temporal
//! consistency filter, Sim(3) estimation against the loop partner, map
//! correction over the essential graph, and a detached global bundle
//! adjustment afterwards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nalgebra::Isometry3;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use skein_mvg::Sim3;
use skein_types::{KeyFrameId, Vocabulary};
use tracing::{debug, info};

use crate::keyframe::KeyFrame;
use crate::keyframe_database::KeyFrameDatabase;
use crate::local_mapping::LocalMapping;
use crate::map::Map;
use crate::map_point::MapPoint;
use crate::matcher::OrbMatcher;
use crate::optimizer;
use crate::sim3_solver::Sim3Solver;

const WORKER_SLEEP: Duration = Duration::from_millis(3);

/// A loop candidate group must be re-detected this many consecutive times.
const CONSISTENCY_TH: usize = 3;

struct ConsistentGroup {
    group: HashSet<KeyFrameId>,
    consistency: usize,
}

#[derive(Default)]
struct LcFlags {
    reset_requested: bool,
    finish_requested: bool,
    finished: bool,
}

struct GbaState {
    running: bool,
    thread: Option<JoinHandle<()>>,
}

struct AcceptedLoop {
    matched_kf: Arc<KeyFrame>,
    scw: Sim3,
    loop_points: Vec<Arc<MapPoint>>,
    /// Loop-side landmark per current-keyframe keypoint.
    matched_points: Vec<Option<Arc<MapPoint>>>,
}

pub struct LoopClosing {
    map: Arc<Map>,
    db: Arc<KeyFrameDatabase>,
    vocab: Arc<dyn Vocabulary>,
    local_mapper: Mutex<Option<Arc<LocalMapping>>>,
    queue: Mutex<VecDeque<Arc<KeyFrame>>>,
    flags: Mutex<LcFlags>,
    consistent_groups: Mutex<Vec<ConsistentGroup>>,
    last_loop_kf_id: Mutex<u64>,
    gba: Mutex<GbaState>,
    stop_gba: Arc<AtomicBool>,
    rng: Mutex<ChaCha8Rng>,
}

impl LoopClosing {
    pub fn new(
        map: Arc<Map>,
        db: Arc<KeyFrameDatabase>,
        vocab: Arc<dyn Vocabulary>,
    ) -> Arc<LoopClosing> {
        Arc::new(LoopClosing {
            map,
            db,
            vocab,
            local_mapper: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            flags: Mutex::new(LcFlags {
                finished: true,
                ..LcFlags::default()
            }),
            consistent_groups: Mutex::new(Vec::new()),
            last_loop_kf_id: Mutex::new(0),
            gba: Mutex::new(GbaState {
                running: false,
                thread: None,
            }),
            stop_gba: Arc::new(AtomicBool::new(false)),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(0)),
        })
    }

    pub fn set_local_mapper(&self, local_mapper: Arc<LocalMapping>) {
        *self.local_mapper.lock() = Some(local_mapper);
    }

    pub fn run(self: &Arc<Self>) {
        self.flags.lock().finished = false;
        loop {
            if let Some(kf) = self.pop_keyframe() {
                if let Some(candidates) = self.detect_loop(&kf) {
                    if let Some(accepted) = self.compute_sim3(&kf, candidates) {
                        self.correct_loop(&kf, accepted);
                    }
                }
            }
            self.reset_if_requested();
            if self.check_finish() {
                break;
            }
            std::thread::sleep(WORKER_SLEEP);
        }
        self.wait_global_ba_finished();
        self.set_finish();
    }

    /// Offline driver: run detection and correction for every queued
    /// keyframe on the caller's thread (the global bundle adjustment still
    /// detaches).
    pub fn process_pending(self: &Arc<Self>) {
        while let Some(kf) = self.pop_keyframe() {
            if let Some(candidates) = self.detect_loop(&kf) {
                if let Some(accepted) = self.compute_sim3(&kf, candidates) {
                    self.correct_loop(&kf, accepted);
                }
            }
        }
    }

    // ---- queue -------------------------------------------------------------

    /// Keyframes arrive here only after local mapping finished integrating
    /// them (graph updated, BoW computed).
    pub fn insert_keyframe(&self, kf: Arc<KeyFrame>) {
        if Some(kf.id) != self.map.origin() {
            self.queue.lock().push_back(kf);
        }
    }

    pub fn has_new_keyframes(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    fn pop_keyframe(&self) -> Option<Arc<KeyFrame>> {
        self.queue.lock().pop_front()
    }

    // ---- detection ---------------------------------------------------------

    /// BoW retrieval plus the temporal consistency filter: a candidate group
    /// must stay consistent (share members) with groups seen over
    /// [`CONSISTENCY_TH`] consecutive keyframes.
    pub fn detect_loop(&self, kf: &Arc<KeyFrame>) -> Option<Vec<Arc<KeyFrame>>> {
        kf.set_not_erase();

        if kf.id.0 < *self.last_loop_kf_id.lock() + 10 {
            self.db.add(kf);
            kf.set_erase(&self.map, &self.db);
            return None;
        }

        // The lowest covisible similarity is the reference score: a genuine
        // loop should look at least as similar as the current neighborhood.
        let bow = kf.bow_vector()?;
        let mut min_score = 1.0f64;
        for neighbor_id in kf.covisibles() {
            let Some(neighbor) = self.map.keyframe(neighbor_id) else {
                continue;
            };
            if neighbor.is_bad() {
                continue;
            }
            if let Some(neighbor_bow) = neighbor.bow_vector() {
                min_score = min_score.min(self.vocab.score(&bow, &neighbor_bow));
            }
        }

        let candidates = self.db.detect_loop_candidates(kf, min_score, &self.map);
        if candidates.is_empty() {
            self.db.add(kf);
            self.consistent_groups.lock().clear();
            kf.set_erase(&self.map, &self.db);
            return None;
        }

        let previous = std::mem::take(&mut *self.consistent_groups.lock());
        let mut current: Vec<ConsistentGroup> = Vec::new();
        let mut prev_extended = vec![false; previous.len()];
        let mut enough: Vec<Arc<KeyFrame>> = Vec::new();

        for candidate in &candidates {
            let mut group: HashSet<KeyFrameId> = candidate.covisibles().into_iter().collect();
            group.insert(candidate.id);

            let mut consistent_for_some = false;
            for (i, prev) in previous.iter().enumerate() {
                if group.iter().any(|id| prev.group.contains(id)) {
                    let consistency = prev.consistency + 1;
                    if !prev_extended[i] {
                        current.push(ConsistentGroup {
                            group: group.clone(),
                            consistency,
                        });
                        prev_extended[i] = true;
                    }
                    if consistency >= CONSISTENCY_TH
                        && !enough.iter().any(|kf| kf.id == candidate.id)
                    {
                        enough.push(candidate.clone());
                    }
                    consistent_for_some = true;
                }
            }
            if !consistent_for_some {
                current.push(ConsistentGroup {
                    group,
                    consistency: 0,
                });
            }
        }
        *self.consistent_groups.lock() = current;

        self.db.add(kf);
        if enough.is_empty() {
            kf.set_erase(&self.map, &self.db);
            None
        } else {
            debug!(kf = %kf.id, n = enough.len(), "consistent loop candidates");
            Some(enough)
        }
    }

    // ---- Sim3 --------------------------------------------------------------

    /// Estimate the relative similarity against each accepted candidate and
    /// keep the first that explains enough guided matches.
    fn compute_sim3(
        &self,
        kf: &Arc<KeyFrame>,
        candidates: Vec<Arc<KeyFrame>>,
    ) -> Option<AcceptedLoop> {
        let matcher = OrbMatcher::new(0.75, true);
        let mut rng = self.rng.lock();

        struct Candidate {
            kf: Arc<KeyFrame>,
            solver: Sim3Solver,
            matches: Vec<Option<Arc<MapPoint>>>,
        }

        let mut alive: Vec<Candidate> = Vec::new();
        for candidate in candidates {
            candidate.set_not_erase();
            if candidate.is_bad() {
                candidate.set_erase(&self.map, &self.db);
                continue;
            }
            let matches = matcher.search_by_bow_keyframes(kf, &candidate);
            if matches.iter().flatten().count() < 20 {
                candidate.set_erase(&self.map, &self.db);
                continue;
            }
            let mut solver = Sim3Solver::new(kf.clone(), candidate.clone(), &matches, false);
            solver.set_ransac_parameters(0.99, 20, 300);
            alive.push(Candidate {
                kf: candidate,
                solver,
                matches,
            });
        }

        let mut accepted: Option<(Arc<KeyFrame>, Sim3, Vec<Option<Arc<MapPoint>>>)> = None;
        while accepted.is_none() && !alive.is_empty() {
            let mut i = 0;
            while i < alive.len() {
                let cand = &mut alive[i];
                let (solution, no_more, inliers, _n) = cand.solver.iterate(5, &mut rng);

                if let Some(s12) = solution {
                    let mut matches: Vec<Option<Arc<MapPoint>>> = vec![None; cand.matches.len()];
                    for (slot, ok) in inliers.iter().enumerate() {
                        if *ok {
                            let idx = cand.solver.match_index(slot);
                            matches[idx] = cand.matches[idx].clone();
                        }
                    }
                    matcher.search_by_sim3(kf, &cand.kf, &mut matches, &s12, 7.5);
                    let (n_inliers, optimized) =
                        optimizer::optimize_sim3(kf, &cand.kf, &mut matches, s12, 10.0, false);
                    if let Some(s12) = optimized {
                        if n_inliers >= 20 {
                            let scw = s12 * Sim3::from_isometry(&cand.kf.pose());
                            accepted = Some((cand.kf.clone(), scw, matches));
                            break;
                        }
                    }
                    // A solver solution that fails refinement exhausts the
                    // candidate.
                    let cand = alive.remove(i);
                    cand.kf.set_erase(&self.map, &self.db);
                    continue;
                }
                if no_more {
                    let cand = alive.remove(i);
                    cand.kf.set_erase(&self.map, &self.db);
                    continue;
                }
                i += 1;
            }
        }

        let Some((matched_kf, scw, mut matched_points)) = accepted else {
            for cand in alive {
                cand.kf.set_erase(&self.map, &self.db);
            }
            kf.set_erase(&self.map, &self.db);
            return None;
        };
        for cand in &alive {
            if cand.kf.id != matched_kf.id {
                cand.kf.set_erase(&self.map, &self.db);
            }
        }

        // Collect the loop side's landmark neighborhood and extend the match
        // set by guided projection under the tentative corrected pose.
        let mut loop_points: Vec<Arc<MapPoint>> = Vec::new();
        let mut seen = HashSet::new();
        let mut loop_group = matched_kf.covisibles();
        loop_group.push(matched_kf.id);
        for kf_id in loop_group {
            let Some(group_kf) = self.map.keyframe(kf_id) else {
                continue;
            };
            for mp in group_kf.map_point_set() {
                if seen.insert(mp.id) {
                    loop_points.push(mp);
                }
            }
        }
        matcher.search_by_projection_scw(kf, &scw, &loop_points, &mut matched_points, 10.0);

        let total = matched_points.iter().flatten().count();
        if total >= 40 {
            info!(kf = %kf.id, matched = %matched_kf.id, total, "loop accepted");
            Some(AcceptedLoop {
                matched_kf,
                scw,
                loop_points,
                matched_points,
            })
        } else {
            debug!(kf = %kf.id, total, "loop rejected after projection");
            matched_kf.set_erase(&self.map, &self.db);
            kf.set_erase(&self.map, &self.db);
            None
        }
    }

    // ---- correction --------------------------------------------------------

    fn correct_loop(self: &Arc<Self>, kf: &Arc<KeyFrame>, accepted: AcceptedLoop) {
        info!(kf = %kf.id, partner = %accepted.matched_kf.id, "correcting loop");
        let local_mapper = self
            .local_mapper
            .lock()
            .clone()
            .expect("loop closing runs with a local mapper attached");

        // Quiesce the other writers: local mapping pauses, a running global
        // BA is cancelled and joined.
        local_mapper.request_stop();
        self.stop_gba.store(true, Ordering::SeqCst);
        let gba_thread = self.gba.lock().thread.take();
        if let Some(handle) = gba_thread {
            let _ = handle.join();
        }
        while !local_mapper.is_stopped() && !local_mapper.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }

        kf.update_connections(&self.map);

        let mut current_group = kf.covisibles();
        current_group.push(kf.id);

        let mut corrected: HashMap<KeyFrameId, Sim3> = HashMap::new();
        let mut non_corrected: HashMap<KeyFrameId, Sim3> = HashMap::new();
        let mut point_anchors: HashMap<skein_types::MapPointId, KeyFrameId> = HashMap::new();
        {
            let _guard = self.map.lock_update();
            let t_wc = kf.pose_inverse();

            for kf_id in &current_group {
                let Some(kf_i) = self.map.keyframe(*kf_id) else {
                    continue;
                };
                let t_iw = kf_i.pose();
                non_corrected.insert(*kf_id, Sim3::from_isometry(&t_iw));
                let corrected_siw = if *kf_id == kf.id {
                    accepted.scw
                } else {
                    Sim3::from_isometry(&(t_iw * t_wc)) * accepted.scw
                };
                corrected.insert(*kf_id, corrected_siw);
            }

            // Move the covisible set's landmarks into the corrected frame,
            // then the keyframes themselves.
            for kf_id in &current_group {
                let (Some(kf_i), Some(corrected_siw)) =
                    (self.map.keyframe(*kf_id), corrected.get(kf_id))
                else {
                    continue;
                };
                let non_corrected_siw = non_corrected[kf_id];
                let corrected_swi = corrected_siw.inverse();
                for mp in kf_i.map_point_set() {
                    if point_anchors.contains_key(&mp.id) {
                        continue;
                    }
                    let pos = mp.world_pos();
                    mp.set_world_pos(corrected_swi.transform(&non_corrected_siw.transform(&pos)));
                    point_anchors.insert(mp.id, *kf_id);
                }
                kf_i.set_pose(corrected_siw.to_isometry_rescaled());
                kf_i.update_connections(&self.map);
                for mp in kf_i.map_point_set() {
                    mp.update_normal_and_depth(&self.map);
                }
            }

            // Fuse the directly matched loop landmarks into the current
            // keyframe; the loop-side (older) landmark survives.
            for (i, loop_mp) in accepted.matched_points.iter().enumerate() {
                let Some(loop_mp) = loop_mp else { continue };
                if loop_mp.is_bad() {
                    continue;
                }
                match kf.get_map_point(i) {
                    Some(current_mp) => current_mp.replace(loop_mp, &self.map),
                    None => {
                        kf.add_map_point(loop_mp.clone(), i);
                        loop_mp.add_observation(kf.id, i);
                        loop_mp.compute_distinctive_descriptors(&self.map);
                    }
                }
            }
        }

        // Project the whole loop-side neighborhood into every corrected
        // keyframe and merge duplicates.
        self.search_and_fuse(&corrected, &accepted.loop_points);

        // New covisibility edges created by the fusion are the loop's
        // structural connections.
        let current_set: HashSet<KeyFrameId> = current_group.iter().copied().collect();
        let mut loop_connections: HashMap<KeyFrameId, HashSet<KeyFrameId>> = HashMap::new();
        for kf_id in &current_group {
            let Some(kf_i) = self.map.keyframe(*kf_id) else {
                continue;
            };
            let previous: HashSet<KeyFrameId> = kf_i.covisibles().into_iter().collect();
            kf_i.update_connections(&self.map);
            let mut new_links: HashSet<KeyFrameId> =
                kf_i.covisibles().into_iter().collect();
            for prev in &previous {
                new_links.remove(prev);
            }
            for member in &current_set {
                new_links.remove(member);
            }
            loop_connections.insert(*kf_id, new_links);
        }

        optimizer::optimize_essential_graph(
            &self.map,
            &accepted.matched_kf,
            kf,
            &non_corrected,
            &corrected,
            &loop_connections,
            &point_anchors,
        );

        kf.add_loop_edge(accepted.matched_kf.id);
        accepted.matched_kf.add_loop_edge(kf.id);

        // Refine everything in the background.
        self.stop_gba.store(false, Ordering::SeqCst);
        {
            let mut gba = self.gba.lock();
            gba.running = true;
            let this = Arc::clone(self);
            let loop_kf_id = kf.id;
            gba.thread = Some(std::thread::spawn(move || {
                this.run_global_bundle_adjustment(loop_kf_id);
            }));
        }

        local_mapper.release();
        *self.last_loop_kf_id.lock() = kf.id.0;
    }

    fn search_and_fuse(
        &self,
        corrected: &HashMap<KeyFrameId, Sim3>,
        loop_points: &[Arc<MapPoint>],
    ) {
        let matcher = OrbMatcher::new(0.8, true);
        for (kf_id, scw) in corrected {
            let Some(kf) = self.map.keyframe(*kf_id) else {
                continue;
            };
            let mut replace: Vec<Option<Arc<MapPoint>>> = vec![None; loop_points.len()];
            matcher.fuse_with_scw(&kf, scw, loop_points, 4.0, &mut replace);

            let _guard = self.map.lock_update();
            for (i, old) in replace.into_iter().enumerate() {
                if let Some(old) = old {
                    old.replace(&loop_points[i], &self.map);
                }
            }
        }
    }

    // ---- global bundle adjustment ------------------------------------------

    fn run_global_bundle_adjustment(self: Arc<Self>, loop_kf_id: KeyFrameId) {
        info!("starting global bundle adjustment");
        let result = optimizer::global_bundle_adjustment(
            &self.map,
            10,
            Some(loop_kf_id),
            Some(self.stop_gba.clone()),
        );

        let Some((kf_poses, mp_positions)) = result else {
            debug!("global bundle adjustment aborted, write-back cancelled");
            self.gba.lock().running = false;
            return;
        };

        // The map kept growing during the BA: propagate the correction down
        // the spanning tree to keyframes and points born after the snapshot.
        let local_mapper = self.local_mapper.lock().clone();
        if let Some(local_mapper) = &local_mapper {
            local_mapper.request_stop();
            while !local_mapper.is_stopped() && !local_mapper.is_finished() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        {
            let _guard = self.map.lock_update();

            let pre_poses: HashMap<KeyFrameId, Isometry3<f64>> = self
                .map
                .keyframes()
                .into_iter()
                .map(|kf| (kf.id, kf.pose()))
                .collect();

            let mut corrected = kf_poses;
            let Some(origin_id) = self.map.origin() else {
                self.gba.lock().running = false;
                if let Some(local_mapper) = &local_mapper {
                    local_mapper.release();
                }
                return;
            };
            corrected
                .entry(origin_id)
                .or_insert_with(|| pre_poses[&origin_id]);
            corrected
                .entry(loop_kf_id)
                .or_insert_with(|| pre_poses[&loop_kf_id]);

            let mut stack = vec![origin_id];
            while let Some(kf_id) = stack.pop() {
                let Some(kf) = self.map.keyframe(kf_id) else {
                    continue;
                };
                for child_id in kf.children() {
                    if !corrected.contains_key(&child_id) {
                        if let Some(child) = self.map.keyframe(child_id) {
                            // T_child←parent from before the BA, composed
                            // with the parent's corrected pose.
                            let t_child_parent = child.pose() * pre_poses[&kf_id].inverse();
                            corrected.insert(child_id, t_child_parent * corrected[&kf_id]);
                        }
                    }
                    stack.push(child_id);
                }
            }

            for kf in self.map.keyframes() {
                if let Some(pose) = corrected.get(&kf.id) {
                    kf.set_pose(*pose);
                }
            }
            for mp in self.map.points() {
                if mp.is_bad() {
                    continue;
                }
                if let Some(pos) = mp_positions.get(&mp.id) {
                    mp.set_world_pos(*pos);
                } else {
                    // Born after the snapshot: correct through the reference
                    // keyframe's pre/post transforms.
                    let ref_id = mp.reference_keyframe();
                    let (Some(pre), Some(post)) = (pre_poses.get(&ref_id), corrected.get(&ref_id))
                    else {
                        continue;
                    };
                    let pos_ref = pre * mp.world_pos();
                    mp.set_world_pos(post.inverse() * pos_ref);
                }
                mp.update_normal_and_depth(&self.map);
            }
            info!("map updated by global bundle adjustment");
        }

        if let Some(local_mapper) = &local_mapper {
            local_mapper.release();
        }
        self.gba.lock().running = false;
    }

    pub fn is_running_global_ba(&self) -> bool {
        self.gba.lock().running
    }

    fn wait_global_ba_finished(&self) {
        let handle = self.gba.lock().thread.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    // ---- control -----------------------------------------------------------

    /// Blocks until the worker acknowledged the reset.
    pub fn request_reset(&self) {
        self.flags.lock().reset_requested = true;
        loop {
            if !self.flags.lock().reset_requested {
                break;
            }
            std::thread::sleep(WORKER_SLEEP);
        }
    }

    fn reset_if_requested(&self) {
        let mut flags = self.flags.lock();
        if flags.reset_requested {
            self.queue.lock().clear();
            self.consistent_groups.lock().clear();
            *self.last_loop_kf_id.lock() = 0;
            flags.reset_requested = false;
        }
    }

    pub fn request_finish(&self) {
        self.flags.lock().finish_requested = true;
        self.stop_gba.store(true, Ordering::SeqCst);
    }

    fn check_finish(&self) -> bool {
        self.flags.lock().finish_requested
    }

    fn set_finish(&self) {
        self.flags.lock().finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.flags.lock().finished
    }
}
