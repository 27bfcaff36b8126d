//! Ownership root of all keyframes and map points.
//!
//! The two slot tables are the authoritative membership sets. Erasing an
//! entity only drops it from its table; the object lives on behind whatever
//! `Arc` handles are still out, flagged `bad`. Id lookups that miss are
//! treated exactly like a raised `bad` flag: skip the entity.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use skein_types::{FrameId, KeyFrameId, MapPointId};

use crate::keyframe::KeyFrame;
use crate::map_point::MapPoint;

#[derive(Default)]
struct MapInner {
    keyframes: BTreeMap<KeyFrameId, Arc<KeyFrame>>,
    points: BTreeMap<MapPointId, Arc<MapPoint>>,
    reference_points: Vec<Arc<MapPoint>>,
    origin: Option<KeyFrameId>,
    max_kf_id: u64,
}

#[derive(Default)]
pub struct Map {
    inner: RwLock<MapInner>,
    /// The map-update mutex: held by every tracking tick, every local bundle
    /// adjustment, the whole loop correction, the global-BA write-back and
    /// `clear`. Serializes all non-local graph mutation.
    update_mutex: Mutex<()>,
    next_kf_id: AtomicU64,
    next_mp_id: AtomicU64,
    next_frame_id: AtomicU64,
}

impl Map {
    pub fn new() -> Arc<Map> {
        Arc::new(Map::default())
    }

    pub fn lock_update(&self) -> MutexGuard<'_, ()> {
        self.update_mutex.lock()
    }

    pub fn new_keyframe_id(&self) -> KeyFrameId {
        KeyFrameId(self.next_kf_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn new_map_point_id(&self) -> MapPointId {
        MapPointId(self.next_mp_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn new_frame_id(&self) -> FrameId {
        FrameId(self.next_frame_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn add_keyframe(&self, kf: Arc<KeyFrame>) {
        let mut inner = self.inner.write();
        if inner.origin.is_none() {
            inner.origin = Some(kf.id);
        }
        inner.max_kf_id = inner.max_kf_id.max(kf.id.0);
        inner.keyframes.insert(kf.id, kf);
    }

    /// Drop from the membership set. The object is not freed.
    pub fn erase_keyframe(&self, id: KeyFrameId) {
        self.inner.write().keyframes.remove(&id);
    }

    pub fn add_map_point(&self, mp: Arc<MapPoint>) {
        self.inner.write().points.insert(mp.id, mp);
    }

    pub fn erase_map_point(&self, id: MapPointId) {
        self.inner.write().points.remove(&id);
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<Arc<KeyFrame>> {
        self.inner.read().keyframes.get(&id).cloned()
    }

    pub fn point(&self, id: MapPointId) -> Option<Arc<MapPoint>> {
        self.inner.read().points.get(&id).cloned()
    }

    pub fn keyframes(&self) -> Vec<Arc<KeyFrame>> {
        self.inner.read().keyframes.values().cloned().collect()
    }

    pub fn points(&self) -> Vec<Arc<MapPoint>> {
        self.inner.read().points.values().cloned().collect()
    }

    pub fn keyframes_in_map(&self) -> usize {
        self.inner.read().keyframes.len()
    }

    pub fn points_in_map(&self) -> usize {
        self.inner.read().points.len()
    }

    /// First keyframe: the root of the spanning tree.
    pub fn origin(&self) -> Option<KeyFrameId> {
        self.inner.read().origin
    }

    pub fn max_keyframe_id(&self) -> u64 {
        self.inner.read().max_kf_id
    }

    /// Record the current local map (visualization only).
    pub fn set_reference_map_points(&self, points: Vec<Arc<MapPoint>>) {
        self.inner.write().reference_points = points;
    }

    pub fn reference_map_points(&self) -> Vec<Arc<MapPoint>> {
        self.inner.read().reference_points.clone()
    }

    /// Reset everything including the id counters. Only valid once all
    /// worker loops are quiesced; the caller is expected to hold (or not
    /// need) the map-update mutex.
    pub fn clear(&self) {
        *self.inner.write() = MapInner::default();
        self.next_kf_id.store(0, Ordering::SeqCst);
        self.next_mp_id.store(0, Ordering::SeqCst);
        self.next_frame_id.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_issuance_is_monotone() {
        let map = Map::new();
        let a = map.new_keyframe_id();
        let b = map.new_keyframe_id();
        assert!(b.0 > a.0);
        let p = map.new_map_point_id();
        let q = map.new_map_point_id();
        assert!(q.0 > p.0);
    }

    #[test]
    fn clear_resets_counters() {
        let map = Map::new();
        map.new_keyframe_id();
        map.new_map_point_id();
        map.clear();
        assert_eq!(map.new_keyframe_id(), KeyFrameId(0));
        assert_eq!(map.new_map_point_id(), MapPointId(0));
        assert_eq!(map.keyframes_in_map(), 0);
    }
}
