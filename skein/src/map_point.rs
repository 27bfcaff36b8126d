//! A 3D landmark and its bookkeeping.
//!
//! Map points and keyframes form a cyclic observation graph. Ownership stays
//! acyclic: keyframes hold `Arc<MapPoint>` handles, while a map point refers
//! to its observers only by [`KeyFrameId`], resolved through the [`Map`].
//! Any resolution failure or raised `bad` flag means "skip this entity".

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::{Point3, Vector3};
use parking_lot::{Mutex, RwLock};
use skein_types::{Descriptor, KeyFrameId, MapPointId, ScalePyramid};

use crate::map::Map;

struct Geometry {
    position: Point3<f64>,
    /// Mean viewing direction over all observations, unit length.
    normal: Vector3<f64>,
    /// Scale-invariance distance band: the point is recognizable by its
    /// descriptor between these distances from the camera.
    min_distance: f64,
    max_distance: f64,
}

struct Features {
    /// Observing keyframe → index of the observing keypoint there.
    observations: BTreeMap<KeyFrameId, usize>,
    /// Medoid of the observation descriptors (minimum summed Hamming
    /// distance to all others).
    descriptor: Descriptor,
    ref_kf: KeyFrameId,
    visible: u32,
    found: u32,
    replaced: Option<Arc<MapPoint>>,
}

pub struct MapPoint {
    pub id: MapPointId,
    /// Keyframe that created the point; drives the probation-window culling.
    pub first_kf_id: KeyFrameId,
    geometry: RwLock<Geometry>,
    features: Mutex<Features>,
    bad: AtomicBool,
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("bad", &self.is_bad())
            .finish_non_exhaustive()
    }
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Point3<f64>,
        ref_kf: KeyFrameId,
        descriptor: Descriptor,
    ) -> Self {
        Self {
            id,
            first_kf_id: ref_kf,
            geometry: RwLock::new(Geometry {
                position,
                normal: Vector3::z(),
                min_distance: 0.0,
                max_distance: f64::INFINITY,
            }),
            features: Mutex::new(Features {
                observations: BTreeMap::new(),
                descriptor,
                ref_kf,
                visible: 1,
                found: 1,
                replaced: None,
            }),
            bad: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::SeqCst)
    }

    pub fn world_pos(&self) -> Point3<f64> {
        self.geometry.read().position
    }

    pub fn set_world_pos(&self, position: Point3<f64>) {
        self.geometry.write().position = position;
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.geometry.read().normal
    }

    pub fn min_distance_invariance(&self) -> f64 {
        0.8 * self.geometry.read().min_distance
    }

    pub fn max_distance_invariance(&self) -> f64 {
        1.2 * self.geometry.read().max_distance
    }

    pub fn descriptor(&self) -> Descriptor {
        self.features.lock().descriptor
    }

    pub fn reference_keyframe(&self) -> KeyFrameId {
        self.features.lock().ref_kf
    }

    pub fn observations(&self) -> BTreeMap<KeyFrameId, usize> {
        self.features.lock().observations.clone()
    }

    pub fn n_obs(&self) -> usize {
        self.features.lock().observations.len()
    }

    pub fn is_in_keyframe(&self, kf: KeyFrameId) -> bool {
        self.features.lock().observations.contains_key(&kf)
    }

    pub fn index_in(&self, kf: KeyFrameId) -> Option<usize> {
        self.features.lock().observations.get(&kf).copied()
    }

    pub fn add_observation(&self, kf: KeyFrameId, idx: usize) {
        self.features.lock().observations.entry(kf).or_insert(idx);
    }

    /// Remove the observation from `kf`. A no-op when absent. A point left
    /// with fewer than two observers no longer satisfies the map invariant
    /// and is discarded.
    pub fn erase_observation(self: &Arc<Self>, kf: KeyFrameId, map: &Map) {
        let became_bad = {
            let mut feat = self.features.lock();
            if feat.observations.remove(&kf).is_none() {
                return;
            }
            if feat.ref_kf == kf {
                // Lowest-id surviving observer takes over as reference.
                if let Some((&new_ref, _)) = feat.observations.iter().next() {
                    feat.ref_kf = new_ref;
                }
            }
            feat.observations.len() < 2
        };
        if became_bad {
            self.set_bad(map);
        }
    }

    /// Mark the point bad and excise it from the graph. Idempotent. The
    /// entity itself is not freed; stale handles observe the flag.
    pub fn set_bad(self: &Arc<Self>, map: &Map) {
        if self.bad.swap(true, Ordering::SeqCst) {
            return;
        }
        let observations = {
            let mut feat = self.features.lock();
            std::mem::take(&mut feat.observations)
        };
        for (kf_id, idx) in observations {
            if let Some(kf) = map.keyframe(kf_id) {
                kf.erase_match_at(idx);
            }
        }
        map.erase_map_point(self.id);
    }

    /// The point that absorbed this one, when it was fused away.
    pub fn replacement(&self) -> Option<Arc<MapPoint>> {
        self.features.lock().replaced.clone()
    }

    /// Fuse this point into `other`: move every observation over, transfer
    /// the counters, mark this point bad with a forwarding pointer.
    pub fn replace(self: &Arc<Self>, other: &Arc<MapPoint>, map: &Map) {
        if other.id == self.id {
            return;
        }
        if self.bad.swap(true, Ordering::SeqCst) {
            return;
        }
        let (observations, visible, found) = {
            let mut feat = self.features.lock();
            feat.replaced = Some(other.clone());
            (
                std::mem::take(&mut feat.observations),
                feat.visible,
                feat.found,
            )
        };
        for (kf_id, idx) in observations {
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            if other.is_in_keyframe(kf_id) {
                kf.erase_match_at(idx);
            } else {
                kf.replace_match_at(idx, other.clone());
                other.add_observation(kf_id, idx);
            }
        }
        other.increase_visible(visible);
        other.increase_found(found);
        other.compute_distinctive_descriptors(map);
        map.erase_map_point(self.id);
    }

    pub fn increase_visible(&self, n: u32) {
        self.features.lock().visible += n;
    }

    pub fn increase_found(&self, n: u32) {
        self.features.lock().found += n;
    }

    pub fn found_ratio(&self) -> f64 {
        let feat = self.features.lock();
        feat.found as f64 / feat.visible as f64
    }

    /// Re-elect the canonical descriptor: the observation descriptor with
    /// minimum summed Hamming distance to all the others.
    pub fn compute_distinctive_descriptors(&self, map: &Map) {
        let observations = {
            let feat = self.features.lock();
            if self.is_bad() {
                return;
            }
            feat.observations.clone()
        };
        let mut descriptors = Vec::with_capacity(observations.len());
        for (kf_id, idx) in &observations {
            let Some(kf) = map.keyframe(*kf_id) else {
                continue;
            };
            if !kf.is_bad() {
                descriptors.push(kf.features.descriptors[*idx]);
            }
        }
        if descriptors.is_empty() {
            return;
        }
        let mut best = 0;
        let mut best_sum = u32::MAX;
        for (i, d) in descriptors.iter().enumerate() {
            let sum: u32 = descriptors.iter().map(|o| d.distance(o)).sum();
            if sum < best_sum {
                best_sum = sum;
                best = i;
            }
        }
        self.features.lock().descriptor = descriptors[best];
    }

    /// Refresh the mean viewing direction and the scale-invariance distance
    /// band from the current observations and the reference keyframe.
    pub fn update_normal_and_depth(&self, map: &Map) {
        let (observations, ref_kf) = {
            let feat = self.features.lock();
            if self.is_bad() {
                return;
            }
            (feat.observations.clone(), feat.ref_kf)
        };
        let Some(ref_kf) = map.keyframe(ref_kf) else {
            return;
        };
        let position = self.world_pos();

        let mut normal = Vector3::zeros();
        let mut n = 0;
        for kf_id in observations.keys() {
            let Some(kf) = map.keyframe(*kf_id) else {
                continue;
            };
            let dir = position - kf.center();
            let norm = dir.norm();
            if norm > 0.0 {
                normal += dir / norm;
                n += 1;
            }
        }
        if n == 0 {
            return;
        }
        normal /= n as f64;

        let dist = (position - ref_kf.center()).norm();
        let Some(&idx) = observations.get(&ref_kf.id) else {
            return;
        };
        let pyramid = &ref_kf.features.pyramid;
        let octave = ref_kf.features.keypoints[idx].octave;
        let max_distance = dist * pyramid.scale_factors[octave];
        let min_distance = max_distance / pyramid.scale_factors[pyramid.n_levels - 1];

        let mut geo = self.geometry.write();
        let norm = normal.norm();
        if norm > 0.0 {
            geo.normal = normal / norm;
        }
        geo.min_distance = min_distance;
        geo.max_distance = max_distance;
    }

    /// Octave at which the point should appear at distance `dist`.
    pub fn predict_octave(&self, dist: f64, pyramid: &ScalePyramid) -> usize {
        let max_distance = self.geometry.read().max_distance;
        pyramid.predict_octave(max_distance, dist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor_with_bits(n: usize) -> Descriptor {
        let mut d = Descriptor([0u8; 32]);
        for i in 0..n {
            d.0[i / 8] |= 1 << (i % 8);
        }
        d
    }

    #[test]
    fn medoid_minimizes_summed_distance() {
        // Pure descriptor arithmetic, no map needed.
        let candidates = [
            descriptor_with_bits(0),
            descriptor_with_bits(4),
            descriptor_with_bits(8),
        ];
        // The middle descriptor has the least total distance to the others.
        let sums: Vec<u32> = candidates
            .iter()
            .map(|d| candidates.iter().map(|o| d.distance(o)).sum())
            .collect();
        let best = sums
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| **s)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(best, 1);
    }

    #[test]
    fn found_ratio_tracks_counters() {
        let mp = MapPoint::new(
            MapPointId(0),
            Point3::origin(),
            KeyFrameId(0),
            Descriptor([0; 32]),
        );
        assert!((mp.found_ratio() - 1.0).abs() < 1e-12);
        mp.increase_visible(3);
        assert!(mp.found_ratio() < 0.26);
        mp.increase_found(3);
        assert!((mp.found_ratio() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn add_observation_is_idempotent() {
        let mp = MapPoint::new(
            MapPointId(0),
            Point3::origin(),
            KeyFrameId(0),
            Descriptor([0; 32]),
        );
        mp.add_observation(KeyFrameId(1), 5);
        mp.add_observation(KeyFrameId(1), 9);
        assert_eq!(mp.index_in(KeyFrameId(1)), Some(5));
        assert_eq!(mp.n_obs(), 1);
    }
}
