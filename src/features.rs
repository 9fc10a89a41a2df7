//! Fixed-length numeric features for link candidates.
//!
//! Layout (version 1, 18 values):
//!
//! | idx | group | feature |
//! |-----|-------|---------|
//! | 0-4 | core scores | similarity, confidence prior, their squares, similarity - prior |
//! | 5-9 | method | keyword, semantic, causal_chain, multi-path one-hot, multiplier |
//! | 10-13 | link type | the four documented transitions, one-hot |
//! | 14-16 | text length | from words, to words, from/to ratio |
//! | 17 | multiplicity | connection multiplicity |
//!
//! Models are tied to [`FEATURE_VERSION`]; any change to the layout must bump
//! it so stale models are refused.

use serde::{Deserialize, Serialize};

use crate::candidate::{heuristic_confidence, multiplicity_normalized, LinkCandidate};
use crate::semantic::similarity::MAX_METHOD_MULTIPLIER;
use crate::semantic::{word_count, Method, SimilarityError};
use crate::vocabulary::Snapshot;

pub const FEATURE_COUNT: usize = 18;

pub const FEATURE_VERSION: u32 = 1;

/// Human-readable feature labels, index-aligned with the vector.
pub const FEATURE_LABELS: [&str; FEATURE_COUNT] = [
    "similarity",
    "confidence prior",
    "similarity squared",
    "confidence prior squared",
    "similarity gap",
    "method=keyword",
    "method=semantic",
    "method=causal_chain",
    "method=multi-path",
    "method multiplier",
    "link activity->pressure",
    "link pressure->consequence",
    "link activity->control",
    "link consequence->control",
    "source word count",
    "target word count",
    "word count ratio",
    "connection multiplicity",
];

const METHOD_OFFSET: usize = 5;
const LINK_TYPE_OFFSET: usize = 10;

/// Word count at which the text length features saturate in
/// [`FeatureVector::unit_scaled`].
const WORD_COUNT_SATURATION: f32 = 8.0;
const WORD_RATIO_SATURATION: f32 = 4.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub version: u32,
    pub values: [f32; FEATURE_COUNT],
}

impl FeatureVector {
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn is_current(&self) -> bool {
        self.version == FEATURE_VERSION
    }

    /// Magnitudes mapped into [0, 1] per feature group, so features of
    /// different units can be compared.
    pub fn unit_scaled(&self) -> [f32; FEATURE_COUNT] {
        let mut scaled = self.values.map(|v| v.abs().min(1.0));
        scaled[METHOD_OFFSET + 4] = self.values[METHOD_OFFSET + 4].abs() / MAX_METHOD_MULTIPLIER;
        for i in [14, 15] {
            scaled[i] = self.values[i].min(WORD_COUNT_SATURATION) / WORD_COUNT_SATURATION;
        }
        scaled[16] = self.values[16].min(WORD_RATIO_SATURATION) / WORD_RATIO_SATURATION;
        scaled[17] = multiplicity_normalized(self.values[17].max(0.0) as u32);
        scaled.map(|v| v.clamp(0.0, 1.0))
    }
}

/// Build the feature vector for `candidate`; label lengths come from
/// `snapshot`.
pub fn extract(candidate: &LinkCandidate, snapshot: &Snapshot) -> Result<FeatureVector, SimilarityError> {
    let from = snapshot
        .get(&candidate.from_id)
        .ok_or_else(|| SimilarityError::UnknownItem(candidate.from_id.clone()))?;
    let to = snapshot
        .get(&candidate.to_id)
        .ok_or_else(|| SimilarityError::UnknownItem(candidate.to_id.clone()))?;

    Ok(extract_with_lengths(
        candidate,
        word_count(&from.label),
        word_count(&to.label),
    ))
}

/// Feature vector from explicit label word counts.
pub fn extract_with_lengths(candidate: &LinkCandidate, from_words: usize, to_words: usize) -> FeatureVector {
    let mut values = [0.0f32; FEATURE_COUNT];

    let similarity = candidate.similarity_score;
    let prior = heuristic_confidence(
        similarity,
        candidate.method,
        candidate.connection_multiplicity,
    );
    values[0] = similarity;
    values[1] = prior;
    values[2] = similarity * similarity;
    values[3] = prior * prior;
    values[4] = similarity - prior;

    let method_slot = match candidate.method {
        Method::Keyword => 0,
        Method::Semantic => 1,
        Method::CausalChain => 2,
        Method::MultiPath => 3,
    };
    values[METHOD_OFFSET + method_slot] = 1.0;
    values[METHOD_OFFSET + 4] = candidate.method.multiplier();

    if let Some(slot) = candidate.link_type.slot() {
        values[LINK_TYPE_OFFSET + slot] = 1.0;
    }

    values[14] = from_words as f32;
    values[15] = to_words as f32;
    values[16] = from_words as f32 / to_words.max(1) as f32;
    values[17] = candidate.connection_multiplicity as f32;

    FeatureVector {
        version: FEATURE_VERSION,
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Explanation;
    use crate::item_id::ItemId;
    use crate::vocabulary::{Category, LinkType, VocabularyItem};

    fn candidate(method: Method, link_type: LinkType) -> LinkCandidate {
        LinkCandidate {
            from_id: ItemId::from("A1"),
            to_id: ItemId::from("P1"),
            link_type,
            similarity_score: 0.8,
            method,
            connection_multiplicity: 2,
            confidence_score: 0.0,
            explanation: Explanation::default(),
        }
    }

    #[test]
    fn test_layout() {
        let c = candidate(
            Method::CausalChain,
            LinkType::new(Category::Activity, Category::Pressure),
        );
        let f = extract_with_lengths(&c, 2, 4);

        assert_eq!(f.version, FEATURE_VERSION);
        assert!((f.values[0] - 0.8).abs() < 1e-6);
        assert!((f.values[1] - 0.8).abs() < 1e-6);
        assert!((f.values[2] - 0.64).abs() < 1e-6);
        assert!(f.values[4].abs() < 1e-6);
        assert_eq!(&f.values[5..9], &[0.0f32, 0.0, 1.0, 0.0]);
        assert!((f.values[9] - 1.35).abs() < 1e-6);
        assert_eq!(&f.values[10..14], &[1.0f32, 0.0, 0.0, 0.0]);
        assert_eq!(f.values[14], 2.0);
        assert_eq!(f.values[15], 4.0);
        assert_eq!(f.values[16], 0.5);
        assert_eq!(f.values[17], 2.0);
    }

    #[test]
    fn test_unit_scaled_bounds_every_group() {
        let c = candidate(
            Method::CausalChain,
            LinkType::new(Category::Activity, Category::Pressure),
        );
        let scaled = extract_with_lengths(&c, 2, 12).unit_scaled();

        assert!(scaled.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!((scaled[0] - 0.8).abs() < 1e-6);
        assert!((scaled[9] - 1.0).abs() < 1e-6);
        assert!((scaled[14] - 0.25).abs() < 1e-6);
        assert_eq!(scaled[15], 1.0);
        assert_eq!(scaled[17], 0.5);
    }

    #[test]
    fn test_undocumented_link_type_has_no_slot() {
        let c = candidate(
            Method::Keyword,
            LinkType::new(Category::Pressure, Category::Control),
        );
        let f = extract_with_lengths(&c, 1, 0);
        assert_eq!(&f.values[10..14], &[0.0f32; 4]);
        assert_eq!(f.values[16], 1.0);
    }

    #[test]
    fn test_extract_reads_labels_from_snapshot() {
        let snapshot = Snapshot::new(vec![
            VocabularyItem::new("A1", "untreated chemical discharge", Category::Activity, 2),
            VocabularyItem::new("P1", "water pollution", Category::Pressure, 2),
        ])
        .unwrap();
        let c = candidate(
            Method::Semantic,
            LinkType::new(Category::Activity, Category::Pressure),
        );
        let f = extract(&c, &snapshot).unwrap();
        assert_eq!(f.values[14], 3.0);
        assert_eq!(f.values[15], 2.0);
        assert_eq!(f.values[6], 1.0);
    }

    #[test]
    fn test_extract_unknown_item() {
        let snapshot = Snapshot::empty();
        let c = candidate(
            Method::Semantic,
            LinkType::new(Category::Activity, Category::Pressure),
        );
        assert!(matches!(
            extract(&c, &snapshot),
            Err(SimilarityError::UnknownItem(_))
        ));
    }

    #[test]
    fn test_labels_cover_every_feature() {
        assert_eq!(FEATURE_LABELS.len(), FEATURE_COUNT);
        assert_eq!(FEATURE_LABELS[METHOD_OFFSET + 1], "method=semantic");
    }
}
