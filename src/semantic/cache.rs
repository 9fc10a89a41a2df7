//! Memoized pair scores.
//!
//! Entries are keyed by `(from, to, method_version)`. A key, once written,
//! is never overwritten; the only way to drop entries is a full
//! invalidation, which happens when the vocabulary snapshot changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::item_id::ItemId;
use crate::semantic::similarity::PairScore;
use crate::vocabulary::LinkRules;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub from: ItemId,
    pub to: ItemId,
    pub method_version: u64,
}

impl CacheKey {
    pub fn new(from: &ItemId, to: &ItemId, method_version: u64) -> Self {
        Self {
            from: from.clone(),
            to: to.clone(),
            method_version,
        }
    }
}

struct CacheState {
    snapshot: Option<[u8; 32]>,
    entries: HashMap<CacheKey, PairScore>,
}

pub struct SimilarityCache {
    state: RwLock<CacheState>,
    computations: AtomicU64,
}

impl Default for SimilarityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SimilarityCache {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CacheState {
                snapshot: None,
                entries: HashMap::new(),
            }),
            computations: AtomicU64::new(0),
        }
    }

    pub fn get(&self, from: &ItemId, to: &ItemId, method_version: u64) -> Option<PairScore> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .get(&CacheKey::new(from, to, method_version))
            .copied()
    }

    /// Return the cached score, computing and storing it on a miss.
    ///
    /// Errors from `compute` are passed through and nothing is stored.
    pub fn get_or_compute<E, F>(
        &self,
        from: &ItemId,
        to: &ItemId,
        method_version: u64,
        compute: F,
    ) -> Result<PairScore, E>
    where
        F: FnOnce() -> Result<PairScore, E>,
    {
        if let Some(score) = self.get(from, to, method_version) {
            return Ok(score);
        }

        self.computations.fetch_add(1, Ordering::Relaxed);
        let score = compute()?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let stored = *state
            .entries
            .entry(CacheKey::new(from, to, method_version))
            .or_insert(score);
        Ok(stored)
    }

    /// Insert a batch of freshly computed scores. Existing keys are kept.
    pub fn commit(&self, method_version: u64, scores: &[(ItemId, ItemId, PairScore)]) -> usize {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut inserted = 0;
        for (from, to, score) in scores {
            let key = CacheKey::new(from, to, method_version);
            if let std::collections::hash_map::Entry::Vacant(slot) = state.entries.entry(key) {
                slot.insert(*score);
                inserted += 1;
            }
        }
        inserted
    }

    /// Drop everything if `fingerprint` differs from the snapshot the cache
    /// was filled for. Returns whether entries were dropped.
    pub fn ensure_snapshot(&self, fingerprint: &[u8; 32]) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.snapshot.as_ref() == Some(fingerprint) {
            return false;
        }
        let dropped = state.entries.len();
        state.entries.clear();
        state.snapshot = Some(*fingerprint);
        log::debug!("similarity cache invalidated entries={dropped}");
        dropped > 0
    }

    pub fn invalidate(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.entries.clear();
        state.snapshot = None;
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .map(|state| state.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times `get_or_compute` missed and ran its closure.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    /// Record computations performed outside `get_or_compute` (dispatcher batches).
    pub fn count_computations(&self, n: u64) {
        self.computations.fetch_add(n, Ordering::Relaxed);
    }
}

/// Version tag for everything that changes how a pair is scored.
pub fn method_version(
    backend: &str,
    dimensions: usize,
    chain_threshold: f32,
    rules: &LinkRules,
    feature_version: u32,
) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(backend.as_bytes());
    hasher.update(&(dimensions as u64).to_le_bytes());
    hasher.update(&chain_threshold.to_bits().to_le_bytes());
    for transition in rules.transitions() {
        hasher.update(transition.from.as_str().as_bytes());
        hasher.update(b">");
        hasher.update(transition.to.as_str().as_bytes());
        hasher.update(b";");
    }
    hasher.update(&feature_version.to_le_bytes());
    u64::from(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::similarity::Method;
    use crate::vocabulary::{Category, Transition};

    fn score(value: f32) -> PairScore {
        PairScore {
            score: value,
            method: Method::Keyword,
            multiplicity: 1,
            keyword: value,
            semantic: None,
        }
    }

    #[test]
    fn test_get_or_compute_is_idempotent() {
        let cache = SimilarityCache::new();
        let (a, b) = (ItemId::from("A1"), ItemId::from("P1"));

        let first = cache
            .get_or_compute(&a, &b, 1, || Ok::<_, ()>(score(0.123456)))
            .unwrap();
        let second = cache
            .get_or_compute(&a, &b, 1, || Ok::<_, ()>(score(0.9)))
            .unwrap();

        assert_eq!(first.score.to_bits(), second.score.to_bits());
        assert_eq!(cache.computations(), 1);
    }

    #[test]
    fn test_method_version_separates_entries() {
        let cache = SimilarityCache::new();
        let (a, b) = (ItemId::from("A1"), ItemId::from("P1"));
        cache.get_or_compute(&a, &b, 1, || Ok::<_, ()>(score(0.1))).unwrap();
        let other = cache
            .get_or_compute(&a, &b, 2, || Ok::<_, ()>(score(0.2)))
            .unwrap();
        assert_eq!(other.score, 0.2);
        assert_eq!(cache.computations(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache = SimilarityCache::new();
        let (a, b) = (ItemId::from("A1"), ItemId::from("P1"));
        let result = cache.get_or_compute(&a, &b, 1, || Err::<PairScore, _>("boom"));
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_commit_keeps_existing_keys() {
        let cache = SimilarityCache::new();
        let (a, b) = (ItemId::from("A1"), ItemId::from("P1"));
        assert_eq!(cache.commit(7, &[(a.clone(), b.clone(), score(0.3))]), 1);
        assert_eq!(cache.commit(7, &[(a.clone(), b.clone(), score(0.8))]), 0);
        assert_eq!(cache.get(&a, &b, 7).unwrap().score, 0.3);
    }

    #[test]
    fn test_ensure_snapshot_invalidates_on_change() {
        let cache = SimilarityCache::new();
        let (a, b) = (ItemId::from("A1"), ItemId::from("P1"));
        assert!(!cache.ensure_snapshot(&[1; 32]));
        cache.commit(1, &[(a.clone(), b.clone(), score(0.3))]);

        assert!(!cache.ensure_snapshot(&[1; 32]));
        assert_eq!(cache.len(), 1);

        assert!(cache.ensure_snapshot(&[2; 32]));
        assert!(cache.get(&a, &b, 1).is_none());
    }

    #[test]
    fn test_method_version_changes_with_config() {
        let rules = LinkRules::default();
        let base = method_version("skipgram", 100, 0.5, &rules, 1);
        assert_eq!(base, method_version("skipgram", 100, 0.5, &rules, 1));
        assert_ne!(base, method_version("bag-of-words", 100, 0.5, &rules, 1));
        assert_ne!(base, method_version("skipgram", 64, 0.5, &rules, 1));
        assert_ne!(base, method_version("skipgram", 100, 0.6, &rules, 1));

        let extended = LinkRules::new(vec![
            Transition { from: Category::Activity, to: Category::Pressure },
            Transition { from: Category::Pressure, to: Category::Control },
        ]);
        assert_ne!(base, method_version("skipgram", 100, 0.5, &extended, 1));
    }
}
