//! A frame promoted to a permanent node of the map graph.
//!
//! A keyframe freezes its extraction results (keypoints, descriptors, grid)
//! and carries three independently locked concerns: pose, feature
//! associations, and graph connections. Operations acquire exactly what they
//! need; when more than one entity is involved the data is cloned out of one
//! lock before touching the next, so no two entity locks nest.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use nalgebra::{Isometry3, Point3};
use parking_lot::{Mutex, RwLock};
use skein_mvg::PinholeCamera;
use skein_types::{
    BowVector, Descriptor, FeatureVector, FrameId, KeyFrameId, KeyPoint, ScalePyramid, Vocabulary,
};
use tracing::debug;

use crate::frame::{Frame, Grid};
use crate::keyframe_database::KeyFrameDatabase;
use crate::map::Map;
use crate::map_point::MapPoint;

/// Covisibility edges below this weight are not propagated to the neighbor
/// when connections are rebuilt.
const CONNECTION_WEIGHT_TH: usize = 15;

/// The immutable extraction snapshot every later algorithm works on.
pub struct FrozenFeatures {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub pyramid: ScalePyramid,
    pub grid: Grid,
}

pub(crate) struct BowData {
    pub bow: BowVector,
    pub features: FeatureVector,
}

struct PoseCache {
    t_cw: Isometry3<f64>,
    t_wc: Isometry3<f64>,
    center: Point3<f64>,
}

impl PoseCache {
    fn new(t_cw: Isometry3<f64>) -> Self {
        let t_wc = t_cw.inverse();
        Self {
            t_cw,
            t_wc,
            center: Point3::from(t_wc.translation.vector),
        }
    }
}

#[derive(Default)]
struct Connections {
    weights: HashMap<KeyFrameId, usize>,
    /// Neighbors by descending weight; rebuilt on every weight change.
    ordered: Vec<(KeyFrameId, usize)>,
    parent: Option<KeyFrameId>,
    children: HashSet<KeyFrameId>,
    loop_edges: HashSet<KeyFrameId>,
    first_connection: bool,
}

#[derive(Default)]
struct PinState {
    not_erase: bool,
    to_be_erased: bool,
}

pub struct KeyFrame {
    pub id: KeyFrameId,
    pub frame_id: FrameId,
    pub timestamp: f64,
    pub camera: Arc<PinholeCamera>,
    pub features: FrozenFeatures,
    bow: RwLock<Option<Arc<BowData>>>,
    pose: RwLock<PoseCache>,
    matches: Mutex<Vec<Option<Arc<MapPoint>>>>,
    connections: Mutex<Connections>,
    pin: Mutex<PinState>,
    bad: AtomicBool,
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("frame_id", &self.frame_id)
            .field("bad", &self.is_bad())
            .finish_non_exhaustive()
    }
}

impl KeyFrame {
    /// Promote a tracked frame. The frame must carry a pose.
    pub fn from_frame(id: KeyFrameId, frame: &Frame) -> Arc<KeyFrame> {
        let pose = frame
            .pose
            .expect("only frames with an estimated pose are promoted");
        Arc::new(KeyFrame {
            id,
            frame_id: frame.id,
            timestamp: frame.timestamp,
            camera: frame.camera.clone(),
            features: FrozenFeatures {
                keypoints: frame.keypoints.clone(),
                descriptors: frame.descriptors.clone(),
                pyramid: frame.pyramid.clone(),
                grid: frame.grid.clone(),
            },
            bow: RwLock::new(frame.bow.as_ref().map(|(bow, features)| {
                Arc::new(BowData {
                    bow: bow.clone(),
                    features: features.clone(),
                })
            })),
            pose: RwLock::new(PoseCache::new(pose)),
            matches: Mutex::new(frame.matches.clone()),
            connections: Mutex::new(Connections {
                first_connection: true,
                ..Connections::default()
            }),
            pin: Mutex::new(PinState::default()),
            bad: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::SeqCst)
    }

    // ---- BoW --------------------------------------------------------------

    /// Quantize the descriptors once; later calls are no-ops.
    pub fn compute_bow(&self, vocab: &dyn Vocabulary) {
        let mut guard = self.bow.write();
        if guard.is_none() {
            let (bow, features) = vocab.transform(&self.features.descriptors);
            *guard = Some(Arc::new(BowData { bow, features }));
        }
    }

    pub fn bow_vector(&self) -> Option<BowVector> {
        self.bow.read().as_ref().map(|b| b.bow.clone())
    }

    pub fn feature_vector(&self) -> Option<FeatureVector> {
        self.bow.read().as_ref().map(|b| b.features.clone())
    }

    // ---- pose -------------------------------------------------------------

    /// World→camera pose. All derived quantities are cached under the same
    /// lock, so readers never see a half-updated pose.
    pub fn pose(&self) -> Isometry3<f64> {
        self.pose.read().t_cw
    }

    pub fn pose_inverse(&self) -> Isometry3<f64> {
        self.pose.read().t_wc
    }

    pub fn center(&self) -> Point3<f64> {
        self.pose.read().center
    }

    pub fn set_pose(&self, t_cw: Isometry3<f64>) {
        *self.pose.write() = PoseCache::new(t_cw);
    }

    // ---- feature associations --------------------------------------------

    pub fn get_map_point(&self, idx: usize) -> Option<Arc<MapPoint>> {
        self.matches.lock()[idx].clone()
    }

    pub fn map_points(&self) -> Vec<Option<Arc<MapPoint>>> {
        self.matches.lock().clone()
    }

    /// The distinct non-bad points associated with this keyframe.
    pub fn map_point_set(&self) -> Vec<Arc<MapPoint>> {
        let mut seen = HashSet::new();
        self.matches
            .lock()
            .iter()
            .flatten()
            .filter(|mp| !mp.is_bad() && seen.insert(mp.id))
            .cloned()
            .collect()
    }

    pub fn add_map_point(&self, mp: Arc<MapPoint>, idx: usize) {
        self.matches.lock()[idx] = Some(mp);
    }

    pub fn erase_match_at(&self, idx: usize) {
        self.matches.lock()[idx] = None;
    }

    pub fn erase_match_for(&self, mp: &MapPoint) {
        if let Some(idx) = mp.index_in(self.id) {
            self.erase_match_at(idx);
        }
    }

    pub fn replace_match_at(&self, idx: usize, mp: Arc<MapPoint>) {
        self.matches.lock()[idx] = Some(mp);
    }

    /// Number of associated points with at least `min_obs` observations.
    pub fn tracked_map_points(&self, min_obs: usize) -> usize {
        self.matches
            .lock()
            .iter()
            .flatten()
            .filter(|mp| !mp.is_bad() && mp.n_obs() >= min_obs)
            .count()
    }

    /// Median depth (camera-frame z) of the associated points; `q = 2` gives
    /// the median proper.
    pub fn compute_scene_median_depth(&self, q: usize) -> Option<f64> {
        let matches = self.map_points();
        let t_cw = self.pose();
        let mut depths: Vec<f64> = matches
            .iter()
            .flatten()
            .filter(|mp| !mp.is_bad())
            .map(|mp| (t_cw * mp.world_pos()).z)
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.partial_cmp(b).expect("depths are finite"));
        Some(depths[(depths.len() - 1) / q])
    }

    pub fn features_in_area(&self, x: f64, y: f64, r: f64) -> Vec<usize> {
        self.features
            .grid
            .features_in_area(&self.features.keypoints, x, y, r, None, None)
    }

    // ---- covisibility graph ----------------------------------------------

    /// Recount shared observations against every other keyframe and rebuild
    /// the weighted edges. Neighbors at or above the notification threshold
    /// get the reciprocal edge; on first connection the strongest neighbor
    /// becomes the spanning-tree parent.
    pub fn update_connections(self: &Arc<Self>, map: &Map) {
        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for mp in self.map_point_set() {
            for kf_id in mp.observations().keys() {
                if *kf_id != self.id {
                    *counter.entry(*kf_id).or_insert(0) += 1;
                }
            }
        }
        if counter.is_empty() {
            return;
        }

        let (&max_id, &max_w) = counter
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .expect("counter is non-empty");

        let mut notified = false;
        for (&kf_id, &w) in &counter {
            if w >= CONNECTION_WEIGHT_TH {
                if let Some(other) = map.keyframe(kf_id) {
                    other.add_connection(self.id, w);
                    notified = true;
                }
            }
        }
        if !notified {
            if let Some(other) = map.keyframe(max_id) {
                other.add_connection(self.id, max_w);
            }
        }

        let new_parent = {
            let mut conn = self.connections.lock();
            conn.weights = counter;
            conn.ordered = ordered_from_weights(&conn.weights);
            if conn.first_connection && Some(self.id) != map.origin() {
                conn.parent = Some(max_id);
                conn.first_connection = false;
                Some(max_id)
            } else {
                None
            }
        };
        if let Some(parent_id) = new_parent {
            if let Some(parent) = map.keyframe(parent_id) {
                parent.add_child(self.id);
            }
        }
    }

    pub(crate) fn add_connection(&self, kf: KeyFrameId, weight: usize) {
        let mut conn = self.connections.lock();
        if conn.weights.get(&kf) == Some(&weight) {
            return;
        }
        conn.weights.insert(kf, weight);
        conn.ordered = ordered_from_weights(&conn.weights);
    }

    pub fn erase_connection(&self, kf: KeyFrameId) {
        let mut conn = self.connections.lock();
        if conn.weights.remove(&kf).is_some() {
            conn.ordered = ordered_from_weights(&conn.weights);
        }
    }

    /// All covisible keyframes, strongest first.
    pub fn covisibles(&self) -> Vec<KeyFrameId> {
        self.connections
            .lock()
            .ordered
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        let conn = self.connections.lock();
        conn.ordered.iter().take(n).map(|(id, _)| *id).collect()
    }

    pub fn covisibles_by_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        let conn = self.connections.lock();
        conn.ordered
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn weight(&self, kf: KeyFrameId) -> usize {
        self.connections.lock().weights.get(&kf).copied().unwrap_or(0)
    }

    // ---- spanning tree ----------------------------------------------------

    pub fn parent(&self) -> Option<KeyFrameId> {
        self.connections.lock().parent
    }

    pub fn children(&self) -> Vec<KeyFrameId> {
        self.connections.lock().children.iter().copied().collect()
    }

    pub(crate) fn add_child(&self, kf: KeyFrameId) {
        self.connections.lock().children.insert(kf);
    }

    pub(crate) fn erase_child(&self, kf: KeyFrameId) {
        self.connections.lock().children.remove(&kf);
    }

    pub fn change_parent(&self, parent: &Arc<KeyFrame>) {
        self.connections.lock().parent = Some(parent.id);
        parent.add_child(self.id);
    }

    // ---- loop edges & pinning ---------------------------------------------

    /// Loop edges pin both endpoints: a keyframe with loop edges is never
    /// erased, so the essential graph keeps its long-range constraints.
    pub fn add_loop_edge(&self, kf: KeyFrameId) {
        self.pin.lock().not_erase = true;
        self.connections.lock().loop_edges.insert(kf);
    }

    pub fn loop_edges(&self) -> Vec<KeyFrameId> {
        self.connections.lock().loop_edges.iter().copied().collect()
    }

    pub fn set_not_erase(&self) {
        self.pin.lock().not_erase = true;
    }

    /// Un-pin; performs a deletion that was deferred while pinned.
    pub fn set_erase(self: &Arc<Self>, map: &Map, db: &KeyFrameDatabase) {
        let erase_now = {
            let mut pin = self.pin.lock();
            if self.connections.lock().loop_edges.is_empty() {
                pin.not_erase = false;
            }
            pin.to_be_erased
        };
        if erase_now {
            self.set_bad(map, db);
        }
    }

    /// Remove this keyframe from the graph: drop reciprocal covisibility
    /// edges, erase its observations, re-parent its children inside the
    /// union of its parent and covisible set, and record the `bad` flag.
    /// Deferred while pinned; refused for the map origin; idempotent.
    pub fn set_bad(self: &Arc<Self>, map: &Map, db: &KeyFrameDatabase) {
        {
            let mut pin = self.pin.lock();
            if Some(self.id) == map.origin() {
                return;
            }
            if pin.not_erase {
                pin.to_be_erased = true;
                return;
            }
        }
        if self.bad.swap(true, Ordering::SeqCst) {
            return;
        }

        let connected: Vec<KeyFrameId> = self.connections.lock().weights.keys().copied().collect();
        for kf_id in connected {
            if let Some(other) = map.keyframe(kf_id) {
                other.erase_connection(self.id);
            }
        }
        for mp in self.map_points().into_iter().flatten() {
            mp.erase_observation(self.id, map);
        }

        let parent_id = {
            let mut conn = self.connections.lock();
            conn.weights.clear();
            conn.ordered.clear();
            conn.parent
        };

        // Each orphan elects the strongest covisible that already rejoined
        // the tree (starting from this keyframe's parent), so the subtree
        // reattaches without cycles.
        let mut candidates: HashSet<KeyFrameId> = parent_id.into_iter().collect();
        loop {
            let children = self.children();
            if children.is_empty() {
                break;
            }
            let mut best: Option<(usize, KeyFrameId, KeyFrameId)> = None;
            for child_id in &children {
                let Some(child) = map.keyframe(*child_id) else {
                    self.erase_child(*child_id);
                    continue;
                };
                if child.is_bad() {
                    self.erase_child(*child_id);
                    continue;
                }
                for cand_id in child.covisibles() {
                    if candidates.contains(&cand_id) {
                        let w = child.weight(cand_id);
                        if best.map(|(bw, _, _)| w > bw).unwrap_or(true) {
                            best = Some((w, *child_id, cand_id));
                        }
                    }
                }
            }
            match best {
                Some((_, child_id, new_parent_id)) => {
                    if let (Some(child), Some(new_parent)) =
                        (map.keyframe(child_id), map.keyframe(new_parent_id))
                    {
                        child.change_parent(&new_parent);
                        candidates.insert(child_id);
                    }
                    self.erase_child(child_id);
                }
                None => break,
            }
        }
        // Orphans with no covisibility link to the reattached set fall back
        // to the deleted keyframe's own parent.
        if let Some(parent_id) = parent_id {
            if let Some(parent) = map.keyframe(parent_id) {
                for child_id in self.children() {
                    if let Some(child) = map.keyframe(child_id) {
                        child.change_parent(&parent);
                    }
                    self.erase_child(child_id);
                }
                parent.erase_child(self.id);
            }
        }

        debug!(kf = %self.id, "keyframe removed from graph");
        map.erase_keyframe(self.id);
        db.erase(self);
    }
}

fn ordered_from_weights(weights: &HashMap<KeyFrameId, usize>) -> Vec<(KeyFrameId, usize)> {
    weights
        .iter()
        .map(|(k, w)| (*k, *w))
        .sorted_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)))
        .collect()
}
