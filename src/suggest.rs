//! Suggestion service: vocabulary snapshot in, ranked and explained link
//! candidates out, feedback back in.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::candidate::LinkCandidate;
use crate::config::{Config, ConfigError};
use crate::dispatch::{CancellationToken, Dispatcher, PartialResult};
use crate::ensemble::{EnsembleModel, MemberSummary, ModelRegistry, ModelState, Trainer, TrainingError};
use crate::explain::explain;
use crate::features::{self, FeatureVector, FEATURE_VERSION};
use crate::feedback::{FeedbackEvent, FeedbackFilter, FeedbackRecord, FeedbackTracker};
use crate::item_id::ItemId;
use crate::semantic::{
    method_version, preprocess_label, Embedder, EmbeddingError, EmbeddingProvider, PairScore,
    SimilarityCache, SimilarityEngine, SimilarityError,
};
use crate::vocabulary::{Snapshot, VocabularyError, VocabularyItem};

#[derive(Debug, thiserror::Error)]
pub enum SuggestError {
    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),
    #[error(transparent)]
    Similarity(#[from] SimilarityError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Options for one [`SuggestionService::suggest`] call.
#[derive(Clone, Debug, Default)]
pub struct SuggestionRequest {
    /// Only candidates starting at this item.
    pub from: Option<ItemId>,
    pub limit: Option<usize>,
    pub cancel: CancellationToken,
}

#[derive(Clone, Debug, Serialize)]
pub struct SuggestionResponse {
    /// Descending confidence, then ascending `(from_id, to_id)`.
    pub suggestions: Vec<LinkCandidate>,
    /// Pairs whose scoring failed; scored pairs are still returned.
    pub failures: Vec<PartialResult>,
    /// Pairs not scored because the request was cancelled.
    pub pending: usize,
    pub cancelled: bool,
    pub model_state: ModelState,
}

#[derive(Clone, Debug, Serialize)]
pub struct SnapshotInfo {
    pub items: usize,
    pub eligible_pairs: usize,
    pub fingerprint: String,
    pub embedding: &'static str,
    pub method_version: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RetrainReport {
    pub validation_accuracy: f32,
    pub training_records: usize,
    pub members: Vec<MemberSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ModelMetadata {
    pub state: ModelState,
    pub validation_accuracy: Option<f32>,
    pub members: Vec<MemberSummary>,
    pub training_records: usize,
    pub trained_at: Option<DateTime<Utc>>,
    pub feature_version: u32,
    pub feedback_records: usize,
    pub feedback_since_training: usize,
}

/// Everything derived from one vocabulary snapshot.
struct SnapshotState {
    snapshot: Arc<Snapshot>,
    engine: SimilarityEngine,
    embedding: &'static str,
    method_version: u64,
}

pub struct SuggestionService {
    config: Config,
    state: RwLock<Arc<SnapshotState>>,
    cache: SimilarityCache,
    dispatcher: Dispatcher,
    registry: ModelRegistry,
    tracker: FeedbackTracker,
    trainer: Trainer,
}

impl SuggestionService {
    pub fn new(config: Config) -> Result<Self, SuggestError> {
        let dispatcher = Dispatcher::new(config.effective_workers(), config.parallel_threshold);
        Self::with_dispatcher(config, dispatcher)
    }

    pub fn with_dispatcher(config: Config, dispatcher: Dispatcher) -> Result<Self, SuggestError> {
        config.validate()?;
        let snapshot = Arc::new(Snapshot::empty());
        let state = build_state(&config, snapshot, None);

        Ok(Self {
            trainer: Trainer::from_config(&config),
            state: RwLock::new(Arc::new(state)),
            cache: SimilarityCache::new(),
            dispatcher,
            registry: ModelRegistry::new(),
            tracker: FeedbackTracker::new(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the vocabulary. Embeddings are built from the new corpus and
    /// cached scores of the previous snapshot are dropped.
    pub fn load_snapshot(&self, items: Vec<VocabularyItem>) -> Result<SnapshotInfo, SuggestError> {
        let snapshot = Arc::new(Snapshot::new(items)?);
        let provider = EmbeddingProvider::build(&corpus(&snapshot), &self.config.embedding_options());
        Ok(self.install_snapshot(snapshot, provider))
    }

    /// Replace the vocabulary, embedding labels from a precomputed table.
    pub fn load_snapshot_with_table(
        &self,
        items: Vec<VocabularyItem>,
        table: HashMap<String, Vec<f32>>,
        dimensions: usize,
    ) -> Result<SnapshotInfo, SuggestError> {
        let snapshot = Arc::new(Snapshot::new(items)?);
        let provider = EmbeddingProvider::from_table(table, dimensions)?;
        Ok(self.install_snapshot(snapshot, provider))
    }

    fn install_snapshot(&self, snapshot: Arc<Snapshot>, provider: EmbeddingProvider) -> SnapshotInfo {
        let state = build_state(&self.config, snapshot, Some(&provider));
        self.cache.ensure_snapshot(state.snapshot.fingerprint());

        let info = SnapshotInfo {
            items: state.snapshot.len(),
            eligible_pairs: state.snapshot.eligible_pairs(&self.config.link_rules).len(),
            fingerprint: state.snapshot.fingerprint_hex(),
            embedding: state.embedding,
            method_version: state.method_version,
        };
        log::info!(
            "loaded snapshot items={} pairs={} fingerprint={} embedding={}",
            info.items,
            info.eligible_pairs,
            info.fingerprint,
            info.embedding
        );

        *self.state.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(state);
        info
    }

    fn current_state(&self) -> Arc<SnapshotState> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current_state().snapshot.clone()
    }

    pub fn cache(&self) -> &SimilarityCache {
        &self.cache
    }

    /// Rank every eligible pair of the current snapshot.
    ///
    /// Training problems never fail a request: without a usable model the
    /// heuristic confidence is returned.
    pub fn suggest(&self, request: &SuggestionRequest) -> Result<SuggestionResponse, SuggestError> {
        let state = self.current_state();
        let model = self.registry.current();
        let importances = model.as_ref().and_then(|m| m.feature_importances());

        let mut pairs = state.snapshot.eligible_pairs(state.engine.rules());
        if let Some(from) = &request.from {
            if state.snapshot.get(from).is_none() {
                return Err(SimilarityError::UnknownItem(from.clone()).into());
            }
            pairs.retain(|(f, _)| f == from);
        }

        let report = self.dispatcher.run(
            &state.engine,
            &pairs,
            &self.cache,
            state.method_version,
            &request.cancel,
        );

        let mut suggestions = Vec::with_capacity(report.scores.len());
        for scored in &report.scores {
            if scored.score.score < self.config.min_similarity {
                continue;
            }
            suggestions.push(self.build_candidate(
                &state,
                model.as_deref(),
                importances.as_deref(),
                &scored.from,
                &scored.to,
                &scored.score,
            )?);
        }

        suggestions.sort_by(|a, b| {
            b.confidence_score
                .total_cmp(&a.confidence_score)
                .then_with(|| a.from_id.cmp(&b.from_id))
                .then_with(|| a.to_id.cmp(&b.to_id))
        });
        if let Some(limit) = request.limit {
            suggestions.truncate(limit);
        }

        log::debug!(
            "suggest pairs={} suggestions={} failures={} cancelled={}",
            pairs.len(),
            suggestions.len(),
            report.failures.len(),
            report.cancelled
        );

        Ok(SuggestionResponse {
            suggestions,
            failures: report.failures,
            pending: report.pending.len(),
            cancelled: report.cancelled,
            model_state: self.registry.state(),
        })
    }

    /// Score and explain one directed pair.
    pub fn score_pair(&self, from: &ItemId, to: &ItemId) -> Result<LinkCandidate, SuggestError> {
        let state = self.current_state();
        state.engine.link_type(from, to)?;

        let score = self
            .cache
            .get_or_compute(from, to, state.method_version, || state.engine.score(from, to))?;

        let model = self.registry.current();
        let importances = model.as_ref().and_then(|m| m.feature_importances());
        self.build_candidate(
            &state,
            model.as_deref(),
            importances.as_deref(),
            from,
            to,
            &score,
        )
    }

    fn build_candidate(
        &self,
        state: &SnapshotState,
        model: Option<&EnsembleModel>,
        importances: Option<&[f32]>,
        from: &ItemId,
        to: &ItemId,
        score: &PairScore,
    ) -> Result<LinkCandidate, SuggestError> {
        let link_type = state.engine.link_type(from, to)?;
        let mut candidate = LinkCandidate::from_score(from.clone(), to.clone(), link_type, score);
        let features = features::extract(&candidate, &state.snapshot)?;

        if let Some(model) = model {
            match model.predict(&features) {
                Ok(confidence) => candidate.confidence_score = confidence,
                Err(err) => log::warn!("model prediction failed, using heuristic: {err}"),
            }
        }

        candidate.explanation = explain(
            &candidate,
            &features,
            model.and(importances),
            self.config.explanation_top_n,
        );
        Ok(candidate)
    }

    /// Record a decision about a candidate previously returned.
    pub fn record_feedback(
        &self,
        candidate: &LinkCandidate,
        accepted: bool,
    ) -> Result<FeedbackRecord, SuggestError> {
        let state = self.current_state();
        let features = features::extract(candidate, &state.snapshot)?;
        Ok(self.append_feedback(candidate, features, accepted, Utc::now()))
    }

    /// Record a decision reported by id; the candidate is re-derived from
    /// the current snapshot.
    pub fn record_event(&self, event: &FeedbackEvent) -> Result<FeedbackRecord, SuggestError> {
        let candidate = self.score_pair(&event.from_id, &event.to_id)?;
        let state = self.current_state();
        let features = features::extract(&candidate, &state.snapshot)?;
        Ok(self.append_feedback(&candidate, features, event.accepted, event.timestamp))
    }

    fn append_feedback(
        &self,
        candidate: &LinkCandidate,
        features: FeatureVector,
        accepted: bool,
        timestamp: DateTime<Utc>,
    ) -> FeedbackRecord {
        let record = self.tracker.record(candidate, features, accepted, timestamp);
        self.registry.mark_stale();
        record
    }

    pub fn feedback_history(&self, filter: Option<&FeedbackFilter>) -> Vec<FeedbackRecord> {
        self.tracker.history(filter)
    }

    /// Retrain on the full feedback history.
    ///
    /// The previous model keeps serving until the new one is accepted; a
    /// rejected model leaves it in place.
    pub fn retrain(&self) -> Result<RetrainReport, TrainingError> {
        let records = self.tracker.history(None);
        log::info!("retraining on {} feedback records", records.len());

        match self.registry.retrain(|| self.trainer.train(&records)) {
            Ok(model) => {
                self.tracker.mark_trained(records.len());
                Ok(RetrainReport {
                    validation_accuracy: model.validation_accuracy,
                    training_records: records.len(),
                    members: model.summary(),
                })
            }
            Err(err) => {
                if err.is_warning() {
                    log::warn!("retrain rejected: {err}");
                } else {
                    log::error!("retrain failed: {err}");
                }
                Err(err)
            }
        }
    }

    /// Run [`Self::retrain`] on a background thread.
    pub fn retrain_in_background(self: &Arc<Self>) -> JoinHandle<Result<RetrainReport, TrainingError>> {
        let service = Arc::clone(self);
        std::thread::spawn(move || service.retrain())
    }

    /// Swap in a model trained elsewhere (e.g. restored from disk).
    pub fn install_model(&self, model: EnsembleModel) -> Result<(), TrainingError> {
        let model = self.registry.install(model)?;
        self.tracker.mark_trained(self.tracker.len());
        log::info!(
            "installed model members={} accuracy={:.3}",
            model.members().len(),
            model.validation_accuracy
        );
        Ok(())
    }

    pub fn current_model(&self) -> Option<Arc<EnsembleModel>> {
        self.registry.current()
    }

    pub fn model_metadata(&self) -> ModelMetadata {
        let model = self.registry.current();
        ModelMetadata {
            state: self.registry.state(),
            validation_accuracy: model.as_ref().map(|m| m.validation_accuracy),
            members: model.as_ref().map(|m| m.summary()).unwrap_or_default(),
            training_records: model.as_ref().map_or(0, |m| m.training_records),
            trained_at: model.as_ref().map(|m| m.trained_at),
            feature_version: FEATURE_VERSION,
            feedback_records: self.tracker.len(),
            feedback_since_training: self.tracker.since_training(),
        }
    }
}

fn build_state(
    config: &Config,
    snapshot: Arc<Snapshot>,
    provider: Option<&EmbeddingProvider>,
) -> SnapshotState {
    let (embedding, dimensions) = provider.map_or(("none", 0), |p| (p.name(), p.dimensions()));
    let config_version = method_version(
        embedding,
        dimensions,
        config.causal_chain_threshold,
        &config.link_rules,
        FEATURE_VERSION,
    );
    // keep keys of different snapshots apart even if an old request commits late
    let fp = snapshot.fingerprint();
    let snapshot_tag = u64::from(u32::from_le_bytes([fp[0], fp[1], fp[2], fp[3]]));

    let engine = SimilarityEngine::new(
        snapshot.clone(),
        provider,
        config.link_rules.clone(),
        config.causal_chain_threshold,
    );

    SnapshotState {
        snapshot,
        engine,
        embedding,
        method_version: (snapshot_tag << 32) | config_version,
    }
}

/// Embedding corpus: every label, plus parent/child label pairs so related
/// concepts share context.
fn corpus(snapshot: &Snapshot) -> Vec<String> {
    let mut sentences = Vec::with_capacity(snapshot.len() * 2);
    for item in snapshot.items() {
        let Some(label) = preprocess_label(&item.label) else {
            continue;
        };
        if let Some(parent) = item.parent_id.as_ref().and_then(|id| snapshot.get(id)) {
            if let Some(parent_label) = preprocess_label(&parent.label) {
                sentences.push(format!("{parent_label} {label}"));
            }
        }
        sentences.push(label);
    }
    sentences
}
