use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dispatch::DEFAULT_PARALLEL_THRESHOLD;
use crate::ensemble::ModelKind;
use crate::explain::DEFAULT_TOP_N;
use crate::semantic::{EmbeddingBackend, EmbeddingOptions, DEFAULT_CHAIN_THRESHOLD};
use crate::vocabulary::LinkRules;

const MAX_WORKERS: usize = 8;
const EMBEDDING_DIMENSIONS: usize = 100;
const MIN_CORPUS_TOKENS: usize = 50;
const RETRAIN_MIN_ACCURACY: f32 = 0.5;
const MIN_TRAINING_RECORDS: usize = 20;
const SEED: u64 = 42;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("config is malformed: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Skip-gram training knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Context words on each side
    #[serde(default = "default_window")]
    pub window: usize,

    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Negative samples per positive pair
    #[serde(default = "default_negative_samples")]
    pub negative_samples: usize,

    #[serde(default = "default_embedding_learning_rate")]
    pub learning_rate: f32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            epochs: default_epochs(),
            negative_samples: default_negative_samples(),
            learning_rate: default_embedding_learning_rate(),
        }
    }
}

fn default_window() -> usize {
    2
}

fn default_epochs() -> usize {
    25
}

fn default_negative_samples() -> usize {
    3
}

fn default_embedding_learning_rate() -> f32 {
    0.05
}

/// How member models are weighted in the ensemble.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeightingStrategy {
    /// Validation accuracies, normalized to sum to 1
    #[default]
    Accuracy,
    Uniform,
}

/// Classifier ensemble knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Model kinds fitted on every retrain, in this order
    #[serde(default = "default_models")]
    pub models: Vec<ModelKind>,

    /// Share of feedback held out for validation [0.0, 1.0)
    #[serde(default = "default_validation_fraction")]
    pub validation_fraction: f32,

    /// Trees in the random forest
    #[serde(default = "default_trees")]
    pub trees: usize,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Rounds for gradient boosting and AdaBoost
    #[serde(default = "default_boosting_rounds")]
    pub boosting_rounds: usize,

    /// Shrinkage for gradient boosting
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    #[serde(default)]
    pub weighting: WeightingStrategy,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            validation_fraction: default_validation_fraction(),
            trees: default_trees(),
            max_depth: default_max_depth(),
            boosting_rounds: default_boosting_rounds(),
            learning_rate: default_learning_rate(),
            weighting: WeightingStrategy::default(),
        }
    }
}

fn default_models() -> Vec<ModelKind> {
    ModelKind::ALL.to_vec()
}

fn default_validation_fraction() -> f32 {
    0.2
}

fn default_trees() -> usize {
    40
}

fn default_max_depth() -> usize {
    6
}

fn default_boosting_rounds() -> usize {
    40
}

fn default_learning_rate() -> f32 {
    0.1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Upper bound on dispatcher workers; the pool uses min(cores, max_workers)
    #[serde(default = "max_workers")]
    pub max_workers: usize,

    /// Uncached pairs needed before scoring fans out
    #[serde(default = "parallel_threshold")]
    pub parallel_threshold: usize,

    #[serde(default = "embedding_dimensions")]
    pub embedding_dimensions: usize,

    /// Distinct tokens needed to train embeddings instead of the fallback
    #[serde(default = "min_corpus_tokens")]
    pub min_corpus_tokens: usize,

    #[serde(default = "causal_chain_threshold")]
    pub causal_chain_threshold: f32,

    #[serde(default = "explanation_top_n")]
    pub explanation_top_n: usize,

    /// Retrained ensembles below this validation accuracy are rejected
    #[serde(default = "retrain_min_accuracy")]
    pub retrain_min_accuracy: f32,

    #[serde(default = "min_training_records")]
    pub min_training_records: usize,

    /// Candidates with a lower similarity score are not suggested
    #[serde(default)]
    pub min_similarity: f32,

    #[serde(default = "seed")]
    pub seed: u64,

    #[serde(default)]
    pub embedding_backend: EmbeddingBackend,

    /// Allowed category transitions
    #[serde(default)]
    pub link_rules: LinkRules,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub training: TrainingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: max_workers(),
            parallel_threshold: parallel_threshold(),
            embedding_dimensions: embedding_dimensions(),
            min_corpus_tokens: min_corpus_tokens(),
            causal_chain_threshold: causal_chain_threshold(),
            explanation_top_n: explanation_top_n(),
            retrain_min_accuracy: retrain_min_accuracy(),
            min_training_records: min_training_records(),
            min_similarity: 0.0,
            seed: seed(),
            embedding_backend: EmbeddingBackend::default(),
            link_rules: LinkRules::default(),
            embedding: EmbeddingConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

fn max_workers() -> usize {
    MAX_WORKERS
}

fn parallel_threshold() -> usize {
    DEFAULT_PARALLEL_THRESHOLD
}

fn embedding_dimensions() -> usize {
    EMBEDDING_DIMENSIONS
}

fn min_corpus_tokens() -> usize {
    MIN_CORPUS_TOKENS
}

fn causal_chain_threshold() -> f32 {
    DEFAULT_CHAIN_THRESHOLD
}

fn explanation_top_n() -> usize {
    DEFAULT_TOP_N
}

fn retrain_min_accuracy() -> f32 {
    RETRAIN_MIN_ACCURACY
}

fn min_training_records() -> usize {
    MIN_TRAINING_RECORDS
}

fn seed() -> u64 {
    SEED
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.max_workers == 0 {
            return invalid("max_workers must be greater than 0".into());
        }
        if self.embedding_dimensions == 0 {
            return invalid("embedding_dimensions must be greater than 0".into());
        }
        for (name, value) in [
            ("causal_chain_threshold", self.causal_chain_threshold),
            ("retrain_min_accuracy", self.retrain_min_accuracy),
            ("min_similarity", self.min_similarity),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be between 0.0 and 1.0, got {value}"));
            }
        }
        if self.link_rules.is_empty() {
            return invalid("link_rules must allow at least one transition".into());
        }

        let training = &self.training;
        if training.models.is_empty() {
            return invalid("training.models must name at least one model".into());
        }
        if !(0.0..1.0).contains(&training.validation_fraction) || training.validation_fraction == 0.0 {
            return invalid(format!(
                "training.validation_fraction must be in (0.0, 1.0), got {}",
                training.validation_fraction
            ));
        }
        if training.trees == 0 || training.max_depth == 0 {
            return invalid("training.trees and training.max_depth must be greater than 0".into());
        }
        if training.learning_rate <= 0.0 {
            return invalid("training.learning_rate must be positive".into());
        }

        if self.embedding.window == 0 || self.embedding.epochs == 0 {
            return invalid("embedding.window and embedding.epochs must be greater than 0".into());
        }

        Ok(())
    }

    /// Read `path` as YAML. A missing file yields the defaults.
    pub fn load_with(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let config_str = std::fs::read_to_string(path)?;
        let config: Self = serde_yml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let config_str = serde_yml::to_string(self)?;
        std::fs::write(path, config_str)?;
        Ok(())
    }

    /// Dispatcher worker count: available cores, capped at `max_workers`.
    pub fn effective_workers(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores.min(self.max_workers).max(1)
    }

    pub fn embedding_options(&self) -> EmbeddingOptions {
        EmbeddingOptions {
            backend: self.embedding_backend,
            dimensions: self.embedding_dimensions,
            min_corpus_tokens: self.min_corpus_tokens,
            window: self.embedding.window,
            epochs: self.embedding.epochs,
            negative_samples: self.embedding.negative_samples,
            learning_rate: self.embedding.learning_rate,
            seed: self.seed,
        }
    }
}
