//! Bag-of-words types and the vocabulary contract.
//!
//! The vocabulary itself (tree, weights, training) is an external
//! collaborator; the engine only relies on the operations below.

use std::collections::BTreeMap;

use crate::Descriptor;

/// Identifier of a vocabulary word (a leaf of the vocabulary tree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WordId(pub u32);

/// Identifier of a vocabulary node at the configured direct-index level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

/// Sparse word → weight vector of one frame or keyframe.
///
/// Ordered so two vectors can be scored by lock-step iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BowVector(pub BTreeMap<WordId, f64>);

impl BowVector {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn words(&self) -> impl Iterator<Item = WordId> + '_ {
        self.0.keys().copied()
    }
}

/// Direct index: vocabulary node → indices of the keypoints quantized under
/// it. Restricting descriptor comparisons to shared nodes is what makes the
/// BoW matchers sub-quadratic.
#[derive(Debug, Clone, Default)]
pub struct FeatureVector(pub BTreeMap<NodeId, Vec<u32>>);

impl FeatureVector {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Contract of the external bag-of-words vocabulary.
pub trait Vocabulary: Send + Sync {
    /// Quantize a descriptor set into the word-weight vector and the
    /// node-level direct index.
    fn transform(&self, descriptors: &[Descriptor]) -> (BowVector, FeatureVector);

    /// Similarity of two word vectors in `[0, 1]`.
    fn score(&self, a: &BowVector, b: &BowVector) -> f64;

    /// Number of words in the vocabulary.
    fn size(&self) -> usize;
}
