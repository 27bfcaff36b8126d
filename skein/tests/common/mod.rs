//! Shared scaffolding for the scenario tests: a deterministic mock
//! vocabulary, synthetic landmark worlds rendered into frames, and the map
//! invariant checker.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use nalgebra::{Isometry3, Point2, Point3};
use skein::frame::Frame;
use skein::map::Map;
use skein_mvg::PinholeCamera;
use skein_types::{
    BowVector, Descriptor, Extraction, FeatureVector, FrameId, KeyPoint, NodeId, ScalePyramid,
    Vocabulary, WordId,
};

/// Quantizes a descriptor by its leading bytes: the first two bytes form the
/// word, the first byte alone the direct-index node. Deterministic, and two
/// identical descriptors always share word and node.
pub struct MockVocabulary;

impl Vocabulary for MockVocabulary {
    fn transform(&self, descriptors: &[Descriptor]) -> (BowVector, FeatureVector) {
        let mut bow: BTreeMap<WordId, f64> = BTreeMap::new();
        let mut fv: BTreeMap<NodeId, Vec<u32>> = BTreeMap::new();
        for (i, d) in descriptors.iter().enumerate() {
            let word = WordId(u16::from_le_bytes([d.0[0], d.0[1]]) as u32);
            let node = NodeId(d.0[0] as u32);
            *bow.entry(word).or_insert(0.0) += 1.0;
            fv.entry(node).or_default().push(i as u32);
        }
        let sum: f64 = bow.values().sum();
        if sum > 0.0 {
            for w in bow.values_mut() {
                *w /= sum;
            }
        }
        (BowVector(bow), FeatureVector(fv))
    }

    fn score(&self, a: &BowVector, b: &BowVector) -> f64 {
        // Histogram intersection: 1 for identical L1-normalized vectors.
        let mut score = 0.0;
        for (word, wa) in &a.0 {
            if let Some(wb) = b.0.get(word) {
                score += wa.min(*wb);
            }
        }
        score
    }

    fn size(&self) -> usize {
        1 << 16
    }
}

/// Stable pseudo-random descriptor per landmark (splitmix64 stream).
pub fn landmark_descriptor(id: u64) -> Descriptor {
    let mut state = id.wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(1);
    let mut next = || {
        state = state.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    };
    let mut bytes = [0u8; 32];
    for chunk in bytes.chunks_mut(8) {
        chunk.copy_from_slice(&next().to_le_bytes());
    }
    Descriptor(bytes)
}

pub fn test_camera(fx: f64) -> Arc<PinholeCamera> {
    Arc::new(PinholeCamera::new(640, 480, fx, fx, 320.0, 240.0, [0.0; 5]).unwrap())
}

pub struct SyntheticWorld {
    pub points: Vec<Point3<f64>>,
    pub descriptors: Vec<Descriptor>,
    /// Landmarks farther than this from the camera are not detected.
    pub view_range: f64,
}

impl SyntheticWorld {
    /// Landmarks at explicit positions (corridor walls and the like).
    pub fn from_points(points: Vec<Point3<f64>>) -> SyntheticWorld {
        let descriptors = (0..points.len() as u64).map(landmark_descriptor).collect();
        SyntheticWorld {
            points,
            descriptors,
            view_range: f64::INFINITY,
        }
    }
    /// `n` landmarks uniformly in an axis-aligned box.
    pub fn in_box(n: usize, min: Point3<f64>, max: Point3<f64>, seed: u64) -> SyntheticWorld {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        let points = (0..n)
            .map(|_| {
                Point3::new(
                    min.x + rng.gen::<f64>() * (max.x - min.x),
                    min.y + rng.gen::<f64>() * (max.y - min.y),
                    min.z + rng.gen::<f64>() * (max.z - min.z),
                )
            })
            .collect();
        let descriptors = (0..n as u64).map(landmark_descriptor).collect();
        SyntheticWorld {
            points,
            descriptors,
            view_range: f64::INFINITY,
        }
    }

    /// Render the visible landmarks into a frame at `t_cw`. Optional pixel
    /// noise. Returns the frame and, per keypoint, the landmark index it
    /// images.
    pub fn render(
        &self,
        id: u64,
        t_cw: &Isometry3<f64>,
        camera: &Arc<PinholeCamera>,
        noise_sigma: f64,
        seed: u64,
    ) -> (Frame, Vec<usize>) {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed ^ id);
        let center = Point3::from(t_cw.inverse().translation.vector);
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        let mut landmark_of = Vec::new();
        for (i, pw) in self.points.iter().enumerate() {
            if (pw - center).norm() > self.view_range {
                continue;
            }
            let Some(px) = camera.project_world(t_cw, pw) else {
                continue;
            };
            let px = if noise_sigma > 0.0 {
                // Box-Muller, deterministic per frame and landmark.
                let (u1, u2): (f64, f64) = (rng.gen(), rng.gen());
                let r = noise_sigma * (-2.0 * u1.max(1e-12).ln()).sqrt();
                Point2::new(
                    px.x + r * (2.0 * std::f64::consts::PI * u2).cos(),
                    px.y + r * (2.0 * std::f64::consts::PI * u2).sin(),
                )
            } else {
                px
            };
            if !camera.bounds().contains(&px) {
                continue;
            }
            keypoints.push(KeyPoint {
                pt: px,
                octave: 0,
                angle: 0.0,
            });
            descriptors.push(self.descriptors[i]);
            landmark_of.push(i);
        }
        let extraction = Extraction {
            keypoints,
            descriptors,
            pyramid: ScalePyramid::new(8, 1.2),
        };
        let frame = Frame::new(FrameId(id), id as f64 / 30.0, extraction, camera.clone());
        (frame, landmark_of)
    }
}

/// Assert the structural invariants that must hold at every quiescent point.
pub fn check_map_invariants(map: &Map) {
    let keyframes = map.keyframes();
    let points = map.points();

    // Observation symmetry, both directions.
    for mp in &points {
        assert!(!mp.is_bad(), "map must not contain bad points");
        for (kf_id, idx) in mp.observations() {
            let kf = map
                .keyframe(kf_id)
                .unwrap_or_else(|| panic!("{} observed by missing {kf_id:?}", mp.id));
            assert!(!kf.is_bad(), "{} observed by bad keyframe", mp.id);
            let slot = kf
                .get_map_point(idx)
                .unwrap_or_else(|| panic!("{kf_id:?}[{idx}] empty but {} claims it", mp.id));
            assert_eq!(slot.id, mp.id, "association mismatch at {kf_id:?}[{idx}]");
        }
    }
    for kf in &keyframes {
        for (idx, slot) in kf.map_points().into_iter().enumerate() {
            let Some(mp) = slot else { continue };
            if mp.is_bad() {
                continue;
            }
            assert_eq!(
                mp.index_in(kf.id),
                Some(idx),
                "{} at {}[{idx}] lacks the reverse observation",
                mp.id,
                kf.id,
            );
        }
    }

    // Covisibility weights equal the shared observation counts. The graph
    // is maintained lazily, so recount first (a no-op when already fresh)
    // and then verify every stored edge.
    for kf in &keyframes {
        kf.update_connections(map);
    }
    for kf_a in &keyframes {
        for kf_b in &keyframes {
            if kf_a.id >= kf_b.id {
                continue;
            }
            let shared = kf_a
                .map_point_set()
                .iter()
                .filter(|mp| mp.is_in_keyframe(kf_b.id))
                .count();
            let w = kf_a.weight(kf_b.id);
            if w != 0 {
                assert_eq!(w, shared, "weight {} ↔ {}", kf_a.id, kf_b.id);
            }
        }
    }

    // Spanning tree: acyclic, connected, rooted at the origin.
    if let Some(origin) = map.origin() {
        let mut reached: HashSet<_> = HashSet::new();
        let mut queue = VecDeque::from([origin]);
        while let Some(kf_id) = queue.pop_front() {
            if !reached.insert(kf_id) {
                panic!("spanning tree has a cycle through {kf_id:?}");
            }
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            for child in kf.children() {
                if map.keyframe(child).is_some() {
                    queue.push_back(child);
                }
            }
        }
        for kf in &keyframes {
            assert!(
                reached.contains(&kf.id),
                "{} unreachable from the origin",
                kf.id
            );
            if kf.id != origin {
                assert!(kf.parent().is_some(), "{} has no parent", kf.id);
            }
        }
    }

    // Every observation falls inside the landmark's (widened)
    // scale-invariance distance band.
    for mp in &points {
        let min_dist = mp.min_distance_invariance();
        let max_dist = mp.max_distance_invariance();
        if !(min_dist.is_finite() && max_dist.is_finite()) {
            continue;
        }
        for (kf_id, idx) in mp.observations() {
            let Some(kf) = map.keyframe(kf_id) else { continue };
            let dist = (mp.world_pos() - kf.center()).norm();
            let scaled = dist * kf.features.pyramid.scale_factors[kf.features.keypoints[idx].octave];
            assert!(
                scaled >= min_dist * 0.99 && scaled <= max_dist * 1.01,
                "{} outside distance band at {kf_id:?}: {scaled} ∉ [{min_dist}, {max_dist}]",
                mp.id
            );
        }
    }

    // Canonical descriptors are medoids.
    for mp in &points {
        let mut descriptors = Vec::new();
        for (kf_id, idx) in mp.observations() {
            if let Some(kf) = map.keyframe(kf_id) {
                descriptors.push(kf.features.descriptors[idx]);
            }
        }
        if descriptors.is_empty() {
            continue;
        }
        let sum_of = |d: &Descriptor| -> u32 { descriptors.iter().map(|o| d.distance(o)).sum() };
        let best: u32 = descriptors.iter().map(&sum_of).min().unwrap();
        assert_eq!(
            sum_of(&mp.descriptor()),
            best,
            "{} descriptor is not the medoid",
            mp.id
        );
    }
}

/// Count keyframe insertions per source frame, for throttling assertions.
pub fn keyframe_frame_ids(map: &Map) -> Vec<u64> {
    let mut ids: Vec<u64> = map.keyframes().iter().map(|kf| kf.frame_id.0).collect();
    ids.sort_unstable();
    ids
}

/// Landmark-instance bookkeeping for directly constructed maps. A landmark
/// seen again within `reuse_window` keyframes of its last observation reuses
/// the existing map point; a revisit after longer creates a fresh (possibly
/// drifted) duplicate, the way an uncorrected SLAM run would.
pub struct InstanceTable {
    instances: HashMap<usize, Vec<(Arc<skein::MapPoint>, u64)>>,
    pub reuse_window: u64,
}

impl InstanceTable {
    pub fn new(reuse_window: u64) -> InstanceTable {
        InstanceTable {
            instances: HashMap::new(),
            reuse_window,
        }
    }

    /// The instance of `landmark` as seen by keyframe index `k`, creating
    /// one at `position` if no recent instance exists.
    pub fn instance(
        &mut self,
        map: &Arc<Map>,
        landmark: usize,
        k: u64,
        position: Point3<f64>,
        descriptor: Descriptor,
        creator: skein_types::KeyFrameId,
    ) -> Arc<skein::MapPoint> {
        let slots = self.instances.entry(landmark).or_default();
        if let Some((mp, last_seen)) = slots.last_mut() {
            if k.saturating_sub(*last_seen) <= self.reuse_window && !mp.is_bad() {
                *last_seen = k;
                return mp.clone();
            }
        }
        let mp = Arc::new(skein::MapPoint::new(
            map.new_map_point_id(),
            position,
            creator,
            descriptor,
        ));
        map.add_map_point(mp.clone());
        slots.push((mp.clone(), k));
        mp
    }

    /// Instances created during the first pass over the given keyframe
    /// range (for loop-side landmark queries).
    pub fn first_instances(&self) -> Vec<Arc<skein::MapPoint>> {
        self.instances
            .values()
            .filter_map(|slots| slots.first().map(|(mp, _)| mp.clone()))
            .collect()
    }

    /// Latest live instance of a landmark, if any.
    pub fn latest(&self, landmark: usize) -> Option<Arc<skein::MapPoint>> {
        self.instances
            .get(&landmark)
            .and_then(|slots| slots.last())
            .map(|(mp, _)| mp.clone())
    }
}

/// Promote a rendered frame into the map and associate its keypoints with
/// landmark instances.
pub fn build_keyframe(
    map: &Arc<Map>,
    vocab: &dyn Vocabulary,
    frame: &Frame,
    landmark_of: &[usize],
    world: &SyntheticWorld,
    table: &mut InstanceTable,
    k: u64,
    position_offset: nalgebra::Vector3<f64>,
) -> Arc<skein::KeyFrame> {
    let kf = skein::KeyFrame::from_frame(map.new_keyframe_id(), frame);
    kf.compute_bow(vocab);
    map.add_keyframe(kf.clone());
    for (idx, &lm) in landmark_of.iter().enumerate() {
        let mp = table.instance(
            map,
            lm,
            k,
            world.points[lm] + position_offset,
            world.descriptors[lm],
            kf.id,
        );
        mp.add_observation(kf.id, idx);
        kf.add_map_point(mp, idx);
    }
    for mp in kf.map_point_set() {
        mp.compute_distinctive_descriptors(map);
        mp.update_normal_and_depth(map);
    }
    kf.update_connections(map);
    kf
}

/// Tests drive [`skein::Tracking::track`] with pre-built frames, so the
/// extractor contract is never exercised.
pub struct PanicExtractor;

impl skein_types::FeatureExtractor for PanicExtractor {
    fn extract(&self, _image: &skein_types::GrayImage<'_>) -> Extraction {
        unreachable!("tests construct frames directly")
    }

    fn extract_doubled(&self, _image: &skein_types::GrayImage<'_>) -> Extraction {
        unreachable!("tests construct frames directly")
    }
}

pub fn test_config(fx: f64, min_frames: u64, max_frames: u64) -> skein_types::SlamConfig {
    let yaml = format!(
        "camera:\n  width: 640\n  height: 480\n  fx: {fx}\n  fy: {fx}\n  cx: 320.0\n  cy: 240.0\ntracker:\n  min_frames: {min_frames}\n  max_frames: {max_frames}\n"
    );
    let cfg: skein_types::SlamConfig = serde_yaml::from_str(&yaml).unwrap();
    cfg.validate().unwrap();
    cfg
}

pub struct TestRig {
    pub map: Arc<Map>,
    pub db: Arc<skein::KeyFrameDatabase>,
    pub local_mapper: Arc<skein::LocalMapping>,
    pub loop_closer: Arc<skein::LoopClosing>,
    pub tracking: skein::Tracking,
}

/// The full pipeline wired up without worker threads; tests pump the
/// workers with `process_pending`.
pub fn test_rig(config: &skein_types::SlamConfig, camera: Arc<PinholeCamera>) -> TestRig {
    let vocab: Arc<dyn Vocabulary> = Arc::new(MockVocabulary);
    let map = Map::new();
    let db = skein::KeyFrameDatabase::new(vocab.clone());
    let local_mapper = skein::LocalMapping::new(map.clone(), db.clone(), vocab.clone());
    let loop_closer = skein::LoopClosing::new(map.clone(), db.clone(), vocab.clone());
    local_mapper.set_loop_closer(loop_closer.clone());
    loop_closer.set_local_mapper(local_mapper.clone());
    let mut tracking = skein::Tracking::new(
        config,
        camera,
        vocab,
        Arc::new(PanicExtractor),
        map.clone(),
        db.clone(),
        local_mapper.clone(),
    );
    tracking.set_loop_closer(loop_closer.clone());
    TestRig {
        map,
        db,
        local_mapper,
        loop_closer,
        tracking,
    }
}
