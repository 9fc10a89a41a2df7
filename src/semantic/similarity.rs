//! Pairwise similarity between vocabulary items.
//!
//! Every pair gets a keyword score (Jaccard over label terms). When both
//! items have an embedding, the cosine similarity is computed too and the
//! larger of the two is reported; ties go to `semantic`. Scoring a directed
//! candidate additionally looks for causal chains: paths of allowed category
//! transitions from `from` to `to` through at least one intermediate item,
//! where every hop is similar enough to count.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::item_id::ItemId;
use crate::semantic::embeddings::{cosine, Embedder, EmbeddingProvider};
use crate::semantic::lexical::{jaccard, term_set};
use crate::semantic::preprocess::preprocess_label;
use crate::vocabulary::{Category, LinkRules, LinkType, Snapshot};

/// Score added per causal chain found.
pub const CHAIN_BONUS: f32 = 0.1;

/// Chains beyond this count add no further bonus.
pub const MAX_BONUS_CHAINS: usize = 3;

/// Longest chain considered, in hops.
pub const MAX_CHAIN_HOPS: usize = 3;

/// Chain enumeration stops once this many paths have been found.
const MAX_COUNTED_CHAINS: usize = 16;

/// How a similarity score was derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "keyword")]
    Keyword,
    #[serde(rename = "semantic")]
    Semantic,
    #[serde(rename = "causal_chain")]
    CausalChain,
    #[serde(rename = "multi-path")]
    MultiPath,
}

/// Largest value of [`Method::multiplier`].
pub const MAX_METHOD_MULTIPLIER: f32 = 1.35;

impl Method {
    pub const ALL: [Method; 4] = [
        Method::Keyword,
        Method::Semantic,
        Method::CausalChain,
        Method::MultiPath,
    ];

    pub fn multiplier(&self) -> f32 {
        match self {
            Method::Keyword => 1.0,
            Method::Semantic => 1.15,
            Method::CausalChain => 1.35,
            Method::MultiPath => 1.25,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Keyword => "keyword",
            Method::Semantic => "semantic",
            Method::CausalChain => "causal_chain",
            Method::MultiPath => "multi-path",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of scoring one pair.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PairScore {
    /// Reported similarity in [0, 1].
    pub score: f32,
    pub method: Method,
    /// Number of independent derivation paths.
    pub multiplicity: u32,
    /// Jaccard component.
    pub keyword: f32,
    /// Cosine component, when both items have embeddings.
    pub semantic: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimilarityError {
    #[error("unknown item id: {0}")]
    UnknownItem(ItemId),

    #[error("link {from} -> {to} is not allowed ({link_type})")]
    InvalidPair {
        from: ItemId,
        to: ItemId,
        link_type: LinkType,
    },
}

/// Scores one directed pair. The seam the dispatcher fans out over.
pub trait PairScorer: Sync {
    fn score_pair(&self, from: &ItemId, to: &ItemId) -> Result<PairScore, SimilarityError>;
}

/// Precomputed per-item state for one snapshot.
pub struct SimilarityEngine {
    snapshot: Arc<Snapshot>,
    rules: LinkRules,
    chain_threshold: f32,
    terms: HashMap<ItemId, BTreeSet<String>>,
    vectors: HashMap<ItemId, Vec<f32>>,
}

impl SimilarityEngine {
    pub fn new(
        snapshot: Arc<Snapshot>,
        provider: Option<&EmbeddingProvider>,
        rules: LinkRules,
        chain_threshold: f32,
    ) -> Self {
        let mut terms = HashMap::with_capacity(snapshot.len());
        let mut vectors = HashMap::with_capacity(snapshot.len());
        let mut unavailable = 0usize;

        for item in snapshot.items() {
            let label = preprocess_label(&item.label).unwrap_or_default();
            terms.insert(item.id.clone(), term_set(&label));

            if let Some(provider) = provider {
                match provider.embed(&label) {
                    Ok(vector) => {
                        vectors.insert(item.id.clone(), vector);
                    }
                    Err(err) => {
                        unavailable += 1;
                        log::debug!("no embedding for {}: {err}", item.id);
                    }
                }
            }
        }

        if unavailable > 0 {
            log::warn!("{unavailable} items scored keyword-only (embedding unavailable)");
        }

        Self {
            snapshot,
            rules,
            chain_threshold,
            terms,
            vectors,
        }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn rules(&self) -> &LinkRules {
        &self.rules
    }

    pub fn has_embedding(&self, id: &ItemId) -> bool {
        self.vectors.contains_key(id)
    }

    /// Undirected similarity of two items; ignores link rules and chains.
    /// Symmetric in its arguments.
    pub fn similarity(&self, a: &ItemId, b: &ItemId) -> Result<PairScore, SimilarityError> {
        let (keyword, semantic) = self.components(a, b)?;
        Ok(self.direct_score(keyword, semantic))
    }

    /// Directed score of a link candidate, including causal-chain evidence.
    pub fn score(&self, from: &ItemId, to: &ItemId) -> Result<PairScore, SimilarityError> {
        self.link_type(from, to)?;

        let (keyword, semantic) = self.components(from, to)?;
        let direct = self.direct_score(keyword, semantic);

        let chains = self.chain_paths(from, to)?;
        if chains == 0 {
            return Ok(direct);
        }

        let bonus = CHAIN_BONUS * chains.min(MAX_BONUS_CHAINS) as f32;
        Ok(PairScore {
            score: (direct.score + bonus).min(1.0),
            method: Method::CausalChain,
            multiplicity: 1 + chains as u32,
            keyword,
            semantic,
        })
    }

    /// Link type of a directed pair, or `InvalidPair` if the rules forbid it.
    pub fn link_type(&self, from: &ItemId, to: &ItemId) -> Result<LinkType, SimilarityError> {
        let from_item = self.item_category(from)?;
        let to_item = self.item_category(to)?;
        let link_type = LinkType::new(from_item, to_item);
        if from == to || !self.rules.allows(from_item, to_item) {
            return Err(SimilarityError::InvalidPair {
                from: from.clone(),
                to: to.clone(),
                link_type,
            });
        }
        Ok(link_type)
    }

    /// Number of causal chains from `from` to `to`. Direction matters: hops
    /// follow the link rules, so the reverse direction usually has none.
    pub fn chain_paths(&self, from: &ItemId, to: &ItemId) -> Result<usize, SimilarityError> {
        self.item_category(from)?;
        self.item_category(to)?;

        let mut visited = vec![from.clone()];
        let mut found = 0usize;
        self.walk_chains(from, to, &mut visited, &mut found);
        Ok(found)
    }

    fn walk_chains(&self, current: &ItemId, target: &ItemId, path: &mut Vec<ItemId>, found: &mut usize) {
        if *found >= MAX_COUNTED_CHAINS || path.len() > MAX_CHAIN_HOPS {
            return;
        }
        let Some(current_item) = self.snapshot.get(current) else {
            return;
        };

        let targets: Vec<Category> = self.rules.targets(current_item.category).collect();
        for category in targets {
            for next in self.snapshot.linkable(category) {
                if path.contains(&next.id) {
                    continue;
                }
                if !self.hop_passes(current, &next.id) {
                    continue;
                }
                if next.id == *target {
                    // a direct hop is not a chain
                    if path.len() >= 2 {
                        *found += 1;
                    }
                    continue;
                }
                path.push(next.id.clone());
                self.walk_chains(&next.id, target, path, found);
                path.pop();
                if *found >= MAX_COUNTED_CHAINS {
                    return;
                }
            }
        }
    }

    fn hop_passes(&self, a: &ItemId, b: &ItemId) -> bool {
        match self.components(a, b) {
            Ok((keyword, semantic)) => keyword.max(semantic.unwrap_or(0.0)) > self.chain_threshold,
            Err(_) => false,
        }
    }

    fn direct_score(&self, keyword: f32, semantic: Option<f32>) -> PairScore {
        match semantic {
            Some(semantic) if keyword >= self.chain_threshold && semantic >= self.chain_threshold => {
                PairScore {
                    score: keyword.max(semantic),
                    method: Method::MultiPath,
                    multiplicity: 2,
                    keyword,
                    semantic: Some(semantic),
                }
            }
            Some(semantic) if semantic >= keyword => PairScore {
                score: semantic,
                method: Method::Semantic,
                multiplicity: 1,
                keyword,
                semantic: Some(semantic),
            },
            _ => PairScore {
                score: keyword,
                method: Method::Keyword,
                multiplicity: 1,
                keyword,
                semantic,
            },
        }
    }

    fn components(&self, a: &ItemId, b: &ItemId) -> Result<(f32, Option<f32>), SimilarityError> {
        let terms_a = self
            .terms
            .get(a)
            .ok_or_else(|| SimilarityError::UnknownItem(a.clone()))?;
        let terms_b = self
            .terms
            .get(b)
            .ok_or_else(|| SimilarityError::UnknownItem(b.clone()))?;
        let keyword = jaccard(terms_a, terms_b);

        let semantic = match (self.vectors.get(a), self.vectors.get(b)) {
            (Some(va), Some(vb)) => Some(cosine(va, vb).clamp(0.0, 1.0)),
            _ => None,
        };

        Ok((keyword, semantic))
    }

    fn item_category(&self, id: &ItemId) -> Result<Category, SimilarityError> {
        self.snapshot
            .get(id)
            .map(|item| item.category)
            .ok_or_else(|| SimilarityError::UnknownItem(id.clone()))
    }
}

impl PairScorer for SimilarityEngine {
    fn score_pair(&self, from: &ItemId, to: &ItemId) -> Result<PairScore, SimilarityError> {
        self.score(from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::embeddings::EmbeddingOptions;
    use crate::vocabulary::VocabularyItem;

    fn chain_snapshot() -> Arc<Snapshot> {
        Arc::new(
            Snapshot::new(vec![
                VocabularyItem::new("A1", "oil spill discharge", Category::Activity, 2),
                VocabularyItem::new("P1", "oil spill pollution", Category::Pressure, 2),
                VocabularyItem::new("C1", "oil pollution mortality", Category::Consequence, 2),
                VocabularyItem::new("K1", "oil mortality response", Category::Control, 2),
                VocabularyItem::new("X1", "noise", Category::Pressure, 2),
            ])
            .unwrap(),
        )
    }

    fn keyword_engine(snapshot: Arc<Snapshot>) -> SimilarityEngine {
        SimilarityEngine::new(snapshot, None, LinkRules::default(), 0.3)
    }

    #[test]
    fn test_keyword_only_scores() {
        let engine = keyword_engine(chain_snapshot());
        let score = engine.similarity(&"A1".into(), &"P1".into()).unwrap();
        // {oil, spill, discharge} vs {oil, spill, pollution}: 2 / 4
        assert!((score.score - 0.5).abs() < 1e-6);
        assert_eq!(score.method, Method::Keyword);
        assert_eq!(score.semantic, None);
    }

    #[test]
    fn test_similarity_symmetric_and_bounded() {
        let snapshot = chain_snapshot();
        let corpus: Vec<String> = snapshot.items().iter().map(|i| i.label.clone()).collect();
        let provider = EmbeddingProvider::build(&corpus, &EmbeddingOptions::default());
        let engine = SimilarityEngine::new(snapshot.clone(), Some(&provider), LinkRules::default(), 0.5);

        for a in snapshot.items() {
            for b in snapshot.items() {
                let ab = engine.similarity(&a.id, &b.id).unwrap();
                let ba = engine.similarity(&b.id, &a.id).unwrap();
                assert!((0.0..=1.0).contains(&ab.score));
                assert_eq!(ab.keyword, ba.keyword);
                assert_eq!(ab.score, ba.score);
            }
        }
    }

    #[test]
    fn test_ties_prefer_semantic() {
        let snapshot = Arc::new(
            Snapshot::new(vec![
                VocabularyItem::new("A1", "chemical discharge", Category::Activity, 2),
                VocabularyItem::new("P1", "chemical discharge", Category::Pressure, 2),
            ])
            .unwrap(),
        );
        let mut table = HashMap::new();
        table.insert("chemical discharge".to_string(), vec![1.0, 0.0]);
        let provider = EmbeddingProvider::from_table(table, 2).unwrap();
        // threshold above 1 so multi-path never triggers
        let engine = SimilarityEngine::new(snapshot, Some(&provider), LinkRules::default(), 1.1);
        let score = engine.score(&"A1".into(), &"P1".into()).unwrap();
        assert_eq!(score.score, 1.0);
        assert_eq!(score.method, Method::Semantic);
    }

    #[test]
    fn test_multi_path_when_both_methods_agree() {
        let snapshot = Arc::new(
            Snapshot::new(vec![
                VocabularyItem::new("A1", "chemical discharge", Category::Activity, 2),
                VocabularyItem::new("P1", "chemical discharge", Category::Pressure, 2),
            ])
            .unwrap(),
        );
        let mut table = HashMap::new();
        table.insert("chemical discharge".to_string(), vec![1.0, 0.0]);
        let provider = EmbeddingProvider::from_table(table, 2).unwrap();
        let engine = SimilarityEngine::new(snapshot, Some(&provider), LinkRules::default(), 0.5);
        let score = engine.score(&"A1".into(), &"P1".into()).unwrap();
        assert_eq!(score.method, Method::MultiPath);
        assert_eq!(score.multiplicity, 2);
    }

    #[test]
    fn test_missing_table_entry_falls_back_to_keyword() {
        let snapshot = chain_snapshot();
        let provider = EmbeddingProvider::from_table(HashMap::new(), 4).unwrap();
        let engine = SimilarityEngine::new(snapshot, Some(&provider), LinkRules::default(), 0.3);
        assert!(!engine.has_embedding(&"A1".into()));
        let score = engine.score(&"A1".into(), &"P1".into()).unwrap();
        assert_eq!(score.method, Method::Keyword);
    }

    #[test]
    fn test_invalid_pair_rejected() {
        let engine = keyword_engine(chain_snapshot());
        let err = engine.score(&"P1".into(), &"A1".into()).unwrap_err();
        assert!(matches!(err, SimilarityError::InvalidPair { .. }));

        let err = engine.score(&"A1".into(), &"C1".into()).unwrap_err();
        assert!(matches!(err, SimilarityError::InvalidPair { .. }));
    }

    #[test]
    fn test_unknown_item_rejected() {
        let engine = keyword_engine(chain_snapshot());
        let err = engine.score(&"A1".into(), &"nope".into()).unwrap_err();
        assert_eq!(err, SimilarityError::UnknownItem("nope".into()));
    }

    #[test]
    fn test_causal_chain_is_directional() {
        let engine = keyword_engine(chain_snapshot());
        // A1 -> P1 -> C1 -> K1, every hop shares "oil" plus one more term
        let forward = engine.chain_paths(&"A1".into(), &"K1".into()).unwrap();
        let backward = engine.chain_paths(&"K1".into(), &"A1".into()).unwrap();
        assert_eq!(forward, 1);
        assert_eq!(backward, 0);

        let score = engine.score(&"A1".into(), &"K1".into()).unwrap();
        assert_eq!(score.method, Method::CausalChain);
        assert_eq!(score.multiplicity, 2);
        assert!((score.score - (score.keyword + CHAIN_BONUS)).abs() < 1e-6);
    }

    #[test]
    fn test_direct_hop_is_not_a_chain() {
        let engine = keyword_engine(chain_snapshot());
        assert_eq!(engine.chain_paths(&"A1".into(), &"P1".into()).unwrap(), 0);
    }

    #[test]
    fn test_chain_requires_every_hop_above_threshold() {
        let engine = SimilarityEngine::new(chain_snapshot(), None, LinkRules::default(), 0.6);
        assert_eq!(engine.chain_paths(&"A1".into(), &"K1".into()).unwrap(), 0);
    }

    #[test]
    fn test_method_multipliers() {
        assert_eq!(Method::Keyword.multiplier(), 1.0);
        assert_eq!(Method::CausalChain.multiplier(), MAX_METHOD_MULTIPLIER);
        assert_eq!(serde_json::to_string(&Method::MultiPath).unwrap(), "\"multi-path\"");
    }
}
