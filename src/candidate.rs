//! Link candidates and the cold-start confidence heuristic.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::item_id::ItemId;
use crate::semantic::similarity::MAX_METHOD_MULTIPLIER;
use crate::semantic::{Method, PairScore};
use crate::vocabulary::LinkType;

/// Multiplicity at which the heuristic's multiplicity term saturates.
pub const MULTIPLICITY_SATURATION: u32 = 4;

/// A proposed connection between two vocabulary items.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkCandidate {
    pub from_id: ItemId,
    pub to_id: ItemId,
    pub link_type: LinkType,
    pub similarity_score: f32,
    pub method: Method,
    pub connection_multiplicity: u32,
    /// Learned acceptance probability; the heuristic prior until scored.
    pub confidence_score: f32,
    pub explanation: Explanation,
}

impl LinkCandidate {
    /// Build an unscored candidate from a similarity result.
    pub fn from_score(from_id: ItemId, to_id: ItemId, link_type: LinkType, score: &PairScore) -> Self {
        let mut candidate = Self {
            from_id,
            to_id,
            link_type,
            similarity_score: score.score.clamp(0.0, 1.0),
            method: score.method,
            connection_multiplicity: score.multiplicity.max(1),
            confidence_score: 0.0,
            explanation: Explanation::default(),
        };
        candidate.confidence_score = heuristic_confidence(
            candidate.similarity_score,
            candidate.method,
            candidate.connection_multiplicity,
        );
        candidate
    }
}

/// Qualitative confidence band.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBucket {
    #[default]
    Low,
    Medium,
    High,
}

impl ConfidenceBucket {
    /// `low` below 0.4, `high` above 0.7, `medium` in between (inclusive).
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence < 0.4 {
            ConfidenceBucket::Low
        } else if confidence > 0.7 {
            ConfidenceBucket::High
        } else {
            ConfidenceBucket::Medium
        }
    }
}

impl Display for ConfidenceBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfidenceBucket::Low => "low",
            ConfidenceBucket::Medium => "medium",
            ConfidenceBucket::High => "high",
        };
        f.write_str(s)
    }
}

/// One contributing factor and its normalized weight.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub label: String,
    pub weight: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct Explanation {
    /// Ordered by descending weight.
    pub factors: Vec<Factor>,
    pub bucket: ConfidenceBucket,
}

impl Explanation {
    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }
}

/// Method multiplier scaled into [0, 1].
pub fn method_multiplier_normalized(method: Method) -> f32 {
    method.multiplier() / MAX_METHOD_MULTIPLIER
}

/// Multiplicity scaled into [0, 1], saturating at [`MULTIPLICITY_SATURATION`].
pub fn multiplicity_normalized(multiplicity: u32) -> f32 {
    multiplicity.min(MULTIPLICITY_SATURATION) as f32 / MULTIPLICITY_SATURATION as f32
}

/// The three weighted terms of the cold-start formula, in order:
/// similarity, method, multiplicity.
pub fn heuristic_terms(similarity: f32, method: Method, multiplicity: u32) -> [f32; 3] {
    [
        0.5 * similarity,
        0.3 * method_multiplier_normalized(method),
        0.2 * multiplicity_normalized(multiplicity),
    ]
}

/// Confidence used before any feedback exists.
pub fn heuristic_confidence(similarity: f32, method: Method, multiplicity: u32) -> f32 {
    heuristic_terms(similarity, method, multiplicity)
        .iter()
        .sum::<f32>()
        .clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_known_value() {
        // 0.5 * 0.8 + 0.3 * (1.35 / 1.35) + 0.2 * (2 / 4)
        let confidence = heuristic_confidence(0.8, Method::CausalChain, 2);
        assert!((confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_heuristic_keyword_zero_similarity() {
        let confidence = heuristic_confidence(0.0, Method::Keyword, 1);
        let expected = 0.3 * (1.0 / 1.35) + 0.2 * 0.25;
        assert!((confidence - expected).abs() < 1e-6);
    }

    #[test]
    fn test_multiplicity_saturates() {
        assert_eq!(multiplicity_normalized(4), 1.0);
        assert_eq!(multiplicity_normalized(40), 1.0);
        assert_eq!(multiplicity_normalized(0), 0.0);
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(ConfidenceBucket::from_confidence(0.39), ConfidenceBucket::Low);
        assert_eq!(ConfidenceBucket::from_confidence(0.4), ConfidenceBucket::Medium);
        assert_eq!(ConfidenceBucket::from_confidence(0.7), ConfidenceBucket::Medium);
        assert_eq!(ConfidenceBucket::from_confidence(0.71), ConfidenceBucket::High);
    }
}
