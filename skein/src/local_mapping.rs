//! The local-mapping worker: integrates keyframes produced by tracking,
//! triangulates new landmarks against covisible neighbors, refines the local
//! neighborhood by bundle adjustment, and culls redundant points and
//! keyframes. Runs as one loop thread; control flows through a small set of
//! flags with one writer each.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use skein_mvg::two_view::fundamental_between;
use skein_mvg::{projection_matrix, triangulate_dlt};
use skein_types::Vocabulary;
use tracing::{debug, info};

use crate::keyframe::KeyFrame;
use crate::keyframe_database::KeyFrameDatabase;
use crate::loop_closing::LoopClosing;
use crate::map::Map;
use crate::map_point::MapPoint;
use crate::matcher::OrbMatcher;
use crate::optimizer;

const WORKER_SLEEP: Duration = Duration::from_millis(3);

/// Probation: a recent point must reach the culling gates before the 3rd
/// keyframe after its creation; the observation-count cull applies from the
/// 2nd.
const PROBATION_OBS_KFS: u64 = 2;
const PROBATION_END_KFS: u64 = 3;

#[derive(Default)]
struct Flags {
    stop_requested: bool,
    stopped: bool,
    not_stop: bool,
    accept_keyframes: bool,
    reset_requested: bool,
    finish_requested: bool,
    finished: bool,
}

pub struct LocalMapping {
    map: Arc<Map>,
    db: Arc<KeyFrameDatabase>,
    vocab: Arc<dyn Vocabulary>,
    queue: Mutex<VecDeque<Arc<KeyFrame>>>,
    recent_points: Mutex<Vec<Arc<MapPoint>>>,
    abort_ba: Arc<AtomicBool>,
    flags: Mutex<Flags>,
    loop_closer: Mutex<Option<Arc<LoopClosing>>>,
}

impl LocalMapping {
    pub fn new(
        map: Arc<Map>,
        db: Arc<KeyFrameDatabase>,
        vocab: Arc<dyn Vocabulary>,
    ) -> Arc<LocalMapping> {
        Arc::new(LocalMapping {
            map,
            db,
            vocab,
            queue: Mutex::new(VecDeque::new()),
            recent_points: Mutex::new(Vec::new()),
            abort_ba: Arc::new(AtomicBool::new(false)),
            flags: Mutex::new(Flags {
                accept_keyframes: true,
                finished: true,
                ..Flags::default()
            }),
            loop_closer: Mutex::new(None),
        })
    }

    pub fn set_loop_closer(&self, loop_closer: Arc<LoopClosing>) {
        *self.loop_closer.lock() = Some(loop_closer);
    }

    /// The worker loop; the caller provides the thread.
    pub fn run(self: &Arc<Self>) {
        self.flags.lock().finished = false;
        loop {
            // Tracking sees the worker as busy while a keyframe is in flight.
            self.set_accept_keyframes(false);

            if self.has_new_keyframes() {
                if let Some(kf) = self.pop_keyframe() {
                    self.process_new_keyframe(&kf);
                    self.cull_map_points(&kf);
                    self.create_new_map_points(&kf);

                    if !self.has_new_keyframes() {
                        self.search_in_neighbors(&kf);
                    }

                    self.abort_ba.store(false, Ordering::SeqCst);

                    if !self.has_new_keyframes() && !self.stop_requested() {
                        if self.map.keyframes_in_map() > 2 {
                            optimizer::local_bundle_adjustment(&kf, &self.abort_ba, &self.map);
                        }
                        self.cull_keyframes(&kf);
                    }

                    if let Some(loop_closer) = self.loop_closer.lock().clone() {
                        loop_closer.insert_keyframe(kf);
                    }
                }
            } else if self.stop() {
                while self.is_stopped() && !self.check_finish() {
                    std::thread::sleep(WORKER_SLEEP);
                }
                if self.check_finish() {
                    break;
                }
            }

            self.reset_if_requested();
            self.set_accept_keyframes(true);

            if self.check_finish() {
                break;
            }
            std::thread::sleep(WORKER_SLEEP);
        }
        self.set_finish();
    }

    /// Offline driver: integrate every queued keyframe on the caller's
    /// thread. Batch processing uses this instead of [`Self::run`].
    pub fn process_pending(&self) {
        while let Some(kf) = self.pop_keyframe() {
            self.process_new_keyframe(&kf);
            self.cull_map_points(&kf);
            self.create_new_map_points(&kf);
            if !self.has_new_keyframes() {
                self.search_in_neighbors(&kf);
            }
            self.abort_ba.store(false, Ordering::SeqCst);
            if !self.has_new_keyframes() {
                if self.map.keyframes_in_map() > 2 {
                    optimizer::local_bundle_adjustment(&kf, &self.abort_ba, &self.map);
                }
                self.cull_keyframes(&kf);
            }
            if let Some(loop_closer) = self.loop_closer.lock().clone() {
                loop_closer.insert_keyframe(kf);
            }
        }
    }

    // ---- queue -------------------------------------------------------------

    pub fn insert_keyframe(&self, kf: Arc<KeyFrame>) {
        self.queue.lock().push_back(kf);
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn has_new_keyframes(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    fn pop_keyframe(&self) -> Option<Arc<KeyFrame>> {
        self.queue.lock().pop_front()
    }

    // ---- pipeline steps ----------------------------------------------------

    /// Integrate one keyframe: BoW, observation registration, covisibility,
    /// map membership. Running it twice for the same keyframe is a no-op the
    /// second time.
    pub fn process_new_keyframe(&self, kf: &Arc<KeyFrame>) {
        kf.compute_bow(self.vocab.as_ref());

        for (i, mp) in kf.map_points().into_iter().enumerate() {
            let Some(mp) = mp else { continue };
            if mp.is_bad() {
                continue;
            }
            if !mp.is_in_keyframe(kf.id) {
                mp.add_observation(kf.id, i);
                mp.update_normal_and_depth(&self.map);
                mp.compute_distinctive_descriptors(&self.map);
            } else {
                // Carried over from map initialization: watch it like any
                // other newborn point.
                let mut recent = self.recent_points.lock();
                if !recent.iter().any(|p| p.id == mp.id) {
                    recent.push(mp);
                }
            }
        }

        kf.update_connections(&self.map);
        self.map.add_keyframe(kf.clone());
    }

    /// Drop recent landmarks that did not earn their keep: bad, rarely
    /// re-found, or under-observed once their probation ran out.
    pub fn cull_map_points(&self, current: &Arc<KeyFrame>) {
        let current_id = current.id.0;
        let mut recent = self.recent_points.lock();
        let map = &self.map;
        recent.retain(|mp| {
            if mp.is_bad() {
                return false;
            }
            if mp.found_ratio() < 0.25 {
                mp.set_bad(map);
                return false;
            }
            let age = current_id.saturating_sub(mp.first_kf_id.0);
            if age >= PROBATION_OBS_KFS && mp.n_obs() <= 2 {
                mp.set_bad(map);
                return false;
            }
            // Survived probation: off the watchlist.
            age < PROBATION_END_KFS
        });
    }

    /// Triangulate new landmarks between the current keyframe and its best
    /// covisible neighbors.
    pub fn create_new_map_points(&self, kf: &Arc<KeyFrame>) {
        let matcher = OrbMatcher::new(0.6, false);
        let k = kf.camera.k_matrix();
        let ow1 = kf.center();
        let t_1w = kf.pose();
        let p1 = projection_matrix(&k, &t_1w);
        let r_w1 = t_1w.inverse().rotation;
        let pyramid1 = &kf.features.pyramid;
        let ratio_factor = 1.5 * pyramid1.scale_factor;
        let mut created = 0usize;

        for (n, neighbor_id) in kf.best_covisibles(10).into_iter().enumerate() {
            if n > 0 && self.has_new_keyframes() {
                return;
            }
            let Some(kf2) = self.map.keyframe(neighbor_id) else {
                continue;
            };
            if kf2.is_bad() {
                continue;
            }

            // A short baseline relative to the scene depth triangulates
            // poorly; skip the neighbor entirely.
            let baseline = (kf2.center() - ow1).norm();
            let Some(median_depth) = kf2.compute_scene_median_depth(2) else {
                continue;
            };
            if baseline / median_depth < 0.01 {
                continue;
            }

            let t_2w = kf2.pose();
            let f12 = fundamental_between(&k, &t_1w, &t_2w);
            let pairs = matcher.search_for_triangulation(kf, &kf2, &f12);

            let p2 = projection_matrix(&k, &t_2w);
            let r_w2 = t_2w.inverse().rotation;
            let ow2 = kf2.center();
            let pyramid2 = &kf2.features.pyramid;

            for (i1, i2) in pairs {
                let kp1 = &kf.features.keypoints[i1];
                let kp2 = &kf2.features.keypoints[i2];

                let ray1 = r_w1 * kf.camera.unproject(&kp1.pt);
                let ray2 = r_w2 * kf2.camera.unproject(&kp2.pt);
                let cos_parallax = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());
                if !(cos_parallax > 0.0 && cos_parallax < 0.9998) {
                    continue;
                }

                let Some(pw) = triangulate_dlt(&kp1.pt, &p1, &kp2.pt, &p2) else {
                    continue;
                };

                let pc1 = t_1w * pw;
                if pc1.z <= 0.0 {
                    continue;
                }
                let pc2 = t_2w * pw;
                if pc2.z <= 0.0 {
                    continue;
                }

                let Some(u1) = kf.camera.project(&pc1) else {
                    continue;
                };
                if (u1 - kp1.pt).norm_squared() > optimizer::CHI2_MONO * pyramid1.sigma2[kp1.octave]
                {
                    continue;
                }
                let Some(u2) = kf2.camera.project(&pc2) else {
                    continue;
                };
                if (u2 - kp2.pt).norm_squared() > optimizer::CHI2_MONO * pyramid2.sigma2[kp2.octave]
                {
                    continue;
                }

                // Distances from both views must agree with the octave scale
                // ratio of the two keypoints.
                let dist1 = (pw - ow1).norm();
                let dist2 = (pw - ow2).norm();
                if dist1 == 0.0 || dist2 == 0.0 {
                    continue;
                }
                let ratio_dist = dist2 / dist1;
                let ratio_octave =
                    pyramid1.scale_factors[kp1.octave] / pyramid2.scale_factors[kp2.octave];
                if ratio_dist * ratio_factor < ratio_octave || ratio_dist > ratio_octave * ratio_factor
                {
                    continue;
                }

                let mp = Arc::new(MapPoint::new(
                    self.map.new_map_point_id(),
                    pw,
                    kf.id,
                    kf.features.descriptors[i1],
                ));
                mp.add_observation(kf.id, i1);
                mp.add_observation(kf2.id, i2);
                kf.add_map_point(mp.clone(), i1);
                kf2.add_map_point(mp.clone(), i2);
                mp.compute_distinctive_descriptors(&self.map);
                mp.update_normal_and_depth(&self.map);
                self.map.add_map_point(mp.clone());
                self.recent_points.lock().push(mp);
                created += 1;
            }
        }
        if created > 0 {
            debug!(kf = %kf.id, created, "triangulated new map points");
        }
    }

    /// Project landmarks between the current keyframe and its first- and
    /// second-order neighbors, attaching or merging duplicates.
    pub fn search_in_neighbors(&self, kf: &Arc<KeyFrame>) {
        let mut targets = Vec::new();
        let mut seen: HashSet<_> = [kf.id].into();
        for first_id in kf.best_covisibles(20) {
            let Some(first) = self.map.keyframe(first_id) else {
                continue;
            };
            if first.is_bad() || !seen.insert(first_id) {
                continue;
            }
            for second_id in first.best_covisibles(5) {
                let Some(second) = self.map.keyframe(second_id) else {
                    continue;
                };
                if second.is_bad() || !seen.insert(second_id) {
                    continue;
                }
                targets.push(second);
            }
            targets.push(first);
        }

        let matcher = OrbMatcher::new(0.6, false);
        let own_points = kf.map_point_set();
        for target in &targets {
            matcher.fuse(target, &own_points, 3.0, &self.map);
        }

        let mut fuse_candidates = Vec::new();
        let mut candidate_ids = HashSet::new();
        for target in &targets {
            for mp in target.map_point_set() {
                if candidate_ids.insert(mp.id) {
                    fuse_candidates.push(mp);
                }
            }
        }
        matcher.fuse(kf, &fuse_candidates, 3.0, &self.map);

        for mp in kf.map_point_set() {
            mp.compute_distinctive_descriptors(&self.map);
            mp.update_normal_and_depth(&self.map);
        }
        kf.update_connections(&self.map);
    }

    /// Mark covisible keyframes redundant when ≥ 90% of their landmarks are
    /// observed at equal-or-finer scale by at least three other keyframes.
    pub fn cull_keyframes(&self, current: &Arc<KeyFrame>) {
        const TH_OBS: usize = 3;
        for kf_id in current.covisibles() {
            if Some(kf_id) == self.map.origin() {
                continue;
            }
            let Some(kf) = self.map.keyframe(kf_id) else {
                continue;
            };
            if kf.is_bad() {
                continue;
            }

            let points = kf.map_points();
            let mut n_points = 0usize;
            let mut n_redundant = 0usize;
            for (i, mp) in points.iter().enumerate() {
                let Some(mp) = mp else { continue };
                if mp.is_bad() {
                    continue;
                }
                n_points += 1;
                if mp.n_obs() <= TH_OBS {
                    continue;
                }
                let octave = kf.features.keypoints[i].octave;
                let mut n_others = 0;
                for (other_id, other_idx) in mp.observations() {
                    if other_id == kf.id {
                        continue;
                    }
                    let Some(other) = self.map.keyframe(other_id) else {
                        continue;
                    };
                    if other.features.keypoints[other_idx].octave <= octave + 1 {
                        n_others += 1;
                        if n_others >= TH_OBS {
                            break;
                        }
                    }
                }
                if n_others >= TH_OBS {
                    n_redundant += 1;
                }
            }

            if n_redundant as f64 > 0.9 * n_points as f64 {
                info!(kf = %kf.id, "culling redundant keyframe");
                kf.set_bad(&self.map, &self.db);
            }
        }
    }

    // ---- control flags -----------------------------------------------------

    pub fn request_stop(&self) {
        self.flags.lock().stop_requested = true;
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    fn stop(&self) -> bool {
        let mut flags = self.flags.lock();
        if flags.stop_requested && !flags.not_stop {
            flags.stopped = true;
            info!("local mapping stopped");
            return true;
        }
        false
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.lock().stopped
    }

    pub fn stop_requested(&self) -> bool {
        self.flags.lock().stop_requested
    }

    /// Resume after a stop; pending keyframes from before the stop are
    /// dropped.
    pub fn release(&self) {
        let mut flags = self.flags.lock();
        if flags.finished {
            return;
        }
        flags.stopped = false;
        flags.stop_requested = false;
        self.queue.lock().clear();
        info!("local mapping released");
    }

    pub fn accept_keyframes(&self) -> bool {
        self.flags.lock().accept_keyframes
    }

    fn set_accept_keyframes(&self, accept: bool) {
        self.flags.lock().accept_keyframes = accept;
    }

    /// Forbid stopping while a keyframe insertion is in flight. Fails when
    /// the worker is already stopped.
    pub fn set_not_stop(&self, flag: bool) -> bool {
        let mut flags = self.flags.lock();
        if flag && flags.stopped {
            return false;
        }
        flags.not_stop = flag;
        true
    }

    pub fn interrupt_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

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
            self.recent_points.lock().clear();
            flags.reset_requested = false;
        }
    }

    pub fn request_finish(&self) {
        self.flags.lock().finish_requested = true;
    }

    fn check_finish(&self) -> bool {
        self.flags.lock().finish_requested
    }

    fn set_finish(&self) {
        let mut flags = self.flags.lock();
        flags.finished = true;
        flags.stopped = true;
    }

    pub fn is_finished(&self) -> bool {
        self.flags.lock().finished
    }
}
