//! Per-suggestion explanations: the factors that drove a confidence score.

use crate::candidate::{heuristic_terms, ConfidenceBucket, Explanation, Factor, LinkCandidate};
use crate::features::{FeatureVector, FEATURE_LABELS};

pub const DEFAULT_TOP_N: usize = 4;

/// Explain `candidate`'s confidence.
///
/// With model importances, each feature contributes `importance * value`
/// on the unit-scaled feature values;
/// without them (cold start) the heuristic's own terms are used. The result
/// always holds at least one factor, weights summing to 1 over the full
/// factor set before truncation to `top_n`.
pub fn explain(
    candidate: &LinkCandidate,
    features: &FeatureVector,
    importances: Option<&[f32]>,
    top_n: usize,
) -> Explanation {
    let top_n = top_n.max(1);
    let mut factors = importances
        .map(|weights| model_factors(features, weights))
        .unwrap_or_default();
    if factors.is_empty() {
        factors = heuristic_factors(candidate);
    }
    factors.truncate(top_n);

    Explanation {
        factors,
        bucket: ConfidenceBucket::from_confidence(candidate.confidence_score),
    }
}

fn model_factors(features: &FeatureVector, importances: &[f32]) -> Vec<Factor> {
    let contributions: Vec<(usize, f32)> = features
        .unit_scaled()
        .iter()
        .zip(importances)
        .enumerate()
        .map(|(i, (value, weight))| (i, weight * value))
        .filter(|(_, c)| c.is_finite() && *c > 0.0)
        .collect();

    let labelled = contributions
        .into_iter()
        .map(|(i, c)| (FEATURE_LABELS[i].to_string(), c))
        .collect();
    normalized(labelled)
}

fn heuristic_factors(candidate: &LinkCandidate) -> Vec<Factor> {
    let [similarity, method, multiplicity] = heuristic_terms(
        candidate.similarity_score,
        candidate.method,
        candidate.connection_multiplicity,
    );
    let factors = normalized(vec![
        ("similarity".to_string(), similarity),
        (format!("method={}", candidate.method), method),
        ("connection multiplicity".to_string(), multiplicity),
    ]);
    if factors.is_empty() {
        // every term is zero; still name what the score was built from
        return vec![Factor {
            label: format!("method={}", candidate.method),
            weight: 1.0,
        }];
    }
    factors
}

/// Scale to unit sum and order by descending weight (stable on ties).
fn normalized(raw: Vec<(String, f32)>) -> Vec<Factor> {
    let total: f32 = raw.iter().map(|(_, w)| w.max(0.0)).sum();
    if total <= 0.0 || !total.is_finite() {
        return Vec::new();
    }
    let mut factors: Vec<Factor> = raw
        .into_iter()
        .filter(|(_, w)| *w > 0.0)
        .map(|(label, w)| Factor {
            label,
            weight: w / total,
        })
        .collect();
    factors.sort_by(|a, b| b.weight.total_cmp(&a.weight));
    factors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{extract_with_lengths, FEATURE_COUNT};
    use crate::item_id::ItemId;
    use crate::semantic::{Method, PairScore};
    use crate::vocabulary::{Category, LinkType};

    fn candidate(similarity: f32, method: Method, multiplicity: u32) -> LinkCandidate {
        LinkCandidate::from_score(
            ItemId::from("A1"),
            ItemId::from("P1"),
            LinkType::new(Category::Activity, Category::Pressure),
            &PairScore {
                score: similarity,
                method,
                multiplicity,
                keyword: similarity,
                semantic: None,
            },
        )
    }

    #[test]
    fn test_heuristic_fallback_uses_formula_terms() {
        let c = candidate(0.8, Method::CausalChain, 2);
        let features = extract_with_lengths(&c, 2, 2);
        let explanation = explain(&c, &features, None, DEFAULT_TOP_N);

        let labels: Vec<&str> = explanation.factors.iter().map(|f| f.label.as_str()).collect();
        // 0.4, 0.3, 0.1 before normalization
        assert_eq!(labels, vec!["similarity", "method=causal_chain", "connection multiplicity"]);
        assert!((explanation.factors[0].weight - 0.5).abs() < 1e-6);
        assert_eq!(explanation.bucket, ConfidenceBucket::High);
    }

    #[test]
    fn test_model_factors_are_ranked_and_truncated() {
        let c = candidate(0.3, Method::Semantic, 1);
        let features = extract_with_lengths(&c, 3, 2);
        let mut importances = vec![0.0f32; FEATURE_COUNT];
        importances[0] = 0.2; // similarity
        importances[6] = 0.5; // method=semantic
        importances[14] = 0.3; // source word count
        importances[15] = 0.01; // target word count

        let explanation = explain(&c, &features, Some(&importances), 2);
        assert_eq!(explanation.factors.len(), 2);
        assert_eq!(explanation.factors[0].label, "method=semantic");
        assert_eq!(explanation.factors[1].label, "source word count");
        assert!(explanation.factors[0].weight > explanation.factors[1].weight);
    }

    #[test]
    fn test_long_labels_do_not_outrank_important_features() {
        let c = candidate(0.9, Method::Keyword, 1);
        let features = extract_with_lengths(&c, 40, 40);
        let mut importances = vec![0.0f32; FEATURE_COUNT];
        importances[0] = 0.6; // similarity
        importances[14] = 0.2; // source word count
        importances[15] = 0.2; // target word count

        let explanation = explain(&c, &features, Some(&importances), DEFAULT_TOP_N);
        assert_eq!(explanation.factors[0].label, "similarity");
    }

    #[test]
    fn test_zero_importances_fall_back() {
        let c = candidate(0.0, Method::Keyword, 1);
        let features = extract_with_lengths(&c, 1, 1);
        let importances = vec![0.0f32; FEATURE_COUNT];
        let explanation = explain(&c, &features, Some(&importances), 0);
        assert_eq!(explanation.factors.len(), 1);
        assert_eq!(explanation.factors[0].label, "method=keyword");
        assert_eq!(explanation.bucket, ConfidenceBucket::Low);
    }
}
