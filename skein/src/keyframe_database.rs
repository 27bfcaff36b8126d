//! Inverted index: vocabulary word → keyframes whose BoW vector contains it.
//!
//! Serves loop-candidate and relocalization-candidate retrieval. Mutated on
//! every keyframe add/erase, read by loop detection and relocalization.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use skein_types::{KeyFrameId, Vocabulary, WordId};
use tracing::debug;

use crate::frame::Frame;
use crate::keyframe::KeyFrame;
use crate::map::Map;

pub struct KeyFrameDatabase {
    vocab: Arc<dyn Vocabulary>,
    inverted: RwLock<HashMap<WordId, Vec<KeyFrameId>>>,
}

impl KeyFrameDatabase {
    pub fn new(vocab: Arc<dyn Vocabulary>) -> Arc<KeyFrameDatabase> {
        Arc::new(KeyFrameDatabase {
            vocab,
            inverted: RwLock::new(HashMap::new()),
        })
    }

    /// Index a keyframe under every word of its (already computed) BoW
    /// vector.
    pub fn add(&self, kf: &Arc<KeyFrame>) {
        let Some(bow) = kf.bow_vector() else {
            return;
        };
        let mut inverted = self.inverted.write();
        for word in bow.words() {
            inverted.entry(word).or_default().push(kf.id);
        }
    }

    pub fn erase(&self, kf: &KeyFrame) {
        let Some(bow) = kf.bow_vector() else {
            return;
        };
        let mut inverted = self.inverted.write();
        for word in bow.words() {
            if let Some(list) = inverted.get_mut(&word) {
                list.retain(|id| *id != kf.id);
            }
        }
    }

    pub fn clear(&self) {
        self.inverted.write().clear();
    }

    /// Keyframes sharing at least one word with `kf`, with the shared-word
    /// count, excluding `kf` itself and anything in `exclude`.
    fn sharing_words(
        &self,
        bow: &skein_types::BowVector,
        self_id: Option<KeyFrameId>,
        exclude: &std::collections::HashSet<KeyFrameId>,
    ) -> HashMap<KeyFrameId, usize> {
        let inverted = self.inverted.read();
        let mut counts: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in bow.words() {
            if let Some(list) = inverted.get(&word) {
                for id in list {
                    if Some(*id) == self_id || exclude.contains(id) {
                        continue;
                    }
                    *counts.entry(*id).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Loop-closure candidates for `kf`: share enough words (≥ 80% of the
    /// best sharer), score at least `min_score` against `kf`, and belong to
    /// a covisible group whose accumulated score is within 75% of the best
    /// group. Returns the strongest keyframe of each retained group.
    pub fn detect_loop_candidates(
        &self,
        kf: &Arc<KeyFrame>,
        min_score: f64,
        map: &Map,
    ) -> Vec<Arc<KeyFrame>> {
        let Some(bow) = kf.bow_vector() else {
            return Vec::new();
        };
        let connected: std::collections::HashSet<KeyFrameId> =
            kf.covisibles().into_iter().collect();
        let counts = self.sharing_words(&bow, Some(kf.id), &connected);
        if counts.is_empty() {
            return Vec::new();
        }

        let max_common = *counts.values().max().expect("counts is non-empty");
        let min_common = (0.8 * max_common as f64) as usize;

        // Score the prefiltered candidates against the query.
        let mut scores: HashMap<KeyFrameId, f64> = HashMap::new();
        for (&id, &common) in &counts {
            if common <= min_common {
                continue;
            }
            let Some(cand) = map.keyframe(id) else {
                continue;
            };
            let Some(cand_bow) = cand.bow_vector() else {
                continue;
            };
            let score = self.vocab.score(&bow, &cand_bow);
            if score >= min_score {
                scores.insert(id, score);
            }
        }
        if scores.is_empty() {
            return Vec::new();
        }

        // Accumulate scores over each candidate's covisible group; a strong
        // loop shows up as a consistent neighborhood, not a single frame.
        let mut best_acc = min_score;
        let mut groups: Vec<(f64, KeyFrameId)> = Vec::new();
        for (&id, &score) in &scores {
            let Some(cand) = map.keyframe(id) else {
                continue;
            };
            let mut acc = score;
            let mut best_kf = id;
            let mut best_score = score;
            for neigh_id in cand.best_covisibles(10) {
                if let Some(&neigh_score) = scores.get(&neigh_id) {
                    acc += neigh_score;
                    if neigh_score > best_score {
                        best_score = neigh_score;
                        best_kf = neigh_id;
                    }
                }
            }
            best_acc = best_acc.max(acc);
            groups.push((acc, best_kf));
        }

        let retain = 0.75 * best_acc;
        let mut seen = std::collections::HashSet::new();
        let candidates: Vec<Arc<KeyFrame>> = groups
            .into_iter()
            .filter(|(acc, _)| *acc > retain)
            .filter_map(|(_, id)| {
                if seen.insert(id) {
                    map.keyframe(id).filter(|kf| !kf.is_bad())
                } else {
                    None
                }
            })
            .collect();
        debug!(query = %kf.id, n = candidates.len(), "loop candidates");
        candidates
    }

    /// Relocalization candidates for a lost frame; same retrieval shape as
    /// loop detection but without a minimum-score gate or an exclusion set.
    pub fn detect_relocalization_candidates(&self, frame: &Frame, map: &Map) -> Vec<Arc<KeyFrame>> {
        let Some((bow, _)) = frame.bow.as_ref() else {
            return Vec::new();
        };
        let counts = self.sharing_words(bow, None, &std::collections::HashSet::new());
        if counts.is_empty() {
            return Vec::new();
        }
        let max_common = *counts.values().max().expect("counts is non-empty");
        let min_common = (0.8 * max_common as f64) as usize;

        let mut scores: HashMap<KeyFrameId, f64> = HashMap::new();
        for (&id, &common) in &counts {
            if common <= min_common {
                continue;
            }
            let Some(cand) = map.keyframe(id) else {
                continue;
            };
            let Some(cand_bow) = cand.bow_vector() else {
                continue;
            };
            scores.insert(id, self.vocab.score(bow, &cand_bow));
        }
        if scores.is_empty() {
            return Vec::new();
        }

        let mut best_acc = 0.0f64;
        let mut groups: Vec<(f64, KeyFrameId)> = Vec::new();
        for (&id, &score) in &scores {
            let Some(cand) = map.keyframe(id) else {
                continue;
            };
            let mut acc = score;
            let mut best_kf = id;
            let mut best_score = score;
            for neigh_id in cand.best_covisibles(10) {
                if let Some(&neigh_score) = scores.get(&neigh_id) {
                    acc += neigh_score;
                    if neigh_score > best_score {
                        best_score = neigh_score;
                        best_kf = neigh_id;
                    }
                }
            }
            best_acc = best_acc.max(acc);
            groups.push((acc, best_kf));
        }

        let retain = 0.75 * best_acc;
        let mut seen = std::collections::HashSet::new();
        groups
            .into_iter()
            .filter(|(acc, _)| *acc > retain)
            .filter_map(|(_, id)| {
                if seen.insert(id) {
                    map.keyframe(id).filter(|kf| !kf.is_bad())
                } else {
                    None
                }
            })
            .collect()
    }
}
