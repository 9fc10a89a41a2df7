//! Learned confidence model: a weighted ensemble of tree classifiers trained
//! on accept/reject feedback.

pub mod boosting;
pub mod forest;
pub mod registry;
pub mod trainer;
pub mod tree;

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::features::{FeatureVector, FEATURE_COUNT, FEATURE_VERSION};

pub use boosting::{AdaBoost, GradientBoosting};
pub use forest::RandomForest;
pub use registry::{ModelRegistry, ModelState};
pub use trainer::Trainer;

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("not enough feedback to train: have {have}, need {need}")]
    InsufficientData { have: usize, need: usize },
    #[error("validation accuracy {accuracy:.3} is below the floor {floor:.3}; previous model kept")]
    AccuracyBelowFloor { accuracy: f32, floor: f32 },
    #[error("a retrain is already in progress")]
    AlreadyRetraining,
    #[error("model expects feature version {found}, current is {expected}")]
    FeatureVersionMismatch { found: u32, expected: u32 },
    #[error("no model kinds configured")]
    EmptyEnsemble,
    #[error("parameters describe a {found} model, expected {expected}")]
    KindMismatch { expected: ModelKind, found: ModelKind },
    #[error("invalid model parameters: {0}")]
    Parameters(#[from] serde_json::Error),
    #[error("malformed model: {0}")]
    InvalidModel(String),
    #[error("training failed: {0}")]
    Internal(String),
}

impl TrainingError {
    /// Outcomes that leave the service healthy and only warrant a warning.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            TrainingError::AccuracyBelowFloor { .. } | TrainingError::InsufficientData { .. }
        )
    }
}

/// Labelled training rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dataset {
    pub features: Vec<[f32; FEATURE_COUNT]>,
    /// 1.0 for accepted, 0.0 for rejected.
    pub labels: Vec<f32>,
}

impl Dataset {
    pub fn push(&mut self, features: &FeatureVector, accepted: bool) {
        self.features.push(features.values);
        self.labels.push(if accepted { 1.0 } else { 0.0 });
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            features: indices.iter().map(|&i| self.features[i]).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

/// Common capability of every model kind.
pub trait Classifier: Sized {
    fn fit(data: &Dataset, params: &TrainingConfig, seed: u64) -> Self;

    /// Probability that the candidate is accepted, in [0, 1].
    fn predict_proba(&self, x: &[f32]) -> f32;

    /// Per-feature importance, summing to 1 (all zeros when nothing was
    /// learned).
    fn feature_importances(&self) -> Vec<f32>;
}

/// Fraction of rows whose thresholded prediction matches the label.
pub fn accuracy<C: Classifier>(model: &C, data: &Dataset) -> f32 {
    accuracy_of(|x| model.predict_proba(x), data)
}

pub(crate) fn accuracy_of<F: Fn(&[f32]) -> f32>(predict: F, data: &Dataset) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let hits = data
        .features
        .iter()
        .zip(&data.labels)
        .filter(|(x, y)| (predict(&x[..]) >= 0.5) == (**y >= 0.5))
        .count();
    hits as f32 / data.len() as f32
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub(crate) fn normalize_importances(mut values: Vec<f32>) -> Vec<f32> {
    let sum: f32 = values.iter().sum();
    if sum > 0.0 {
        values.iter_mut().for_each(|v| *v /= sum);
    }
    values
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    RandomForest,
    GradientBoosting,
    AdaBoost,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::RandomForest,
        ModelKind::GradientBoosting,
        ModelKind::AdaBoost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::RandomForest => "random_forest",
            ModelKind::GradientBoosting => "gradient_boosting",
            ModelKind::AdaBoost => "ada_boost",
        }
    }
}

impl Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "model", rename_all = "snake_case")]
pub enum Model {
    RandomForest(RandomForest),
    GradientBoosting(GradientBoosting),
    AdaBoost(AdaBoost),
}

impl Model {
    pub fn fit(kind: ModelKind, data: &Dataset, params: &TrainingConfig, seed: u64) -> Self {
        match kind {
            ModelKind::RandomForest => Model::RandomForest(RandomForest::fit(data, params, seed)),
            ModelKind::GradientBoosting => {
                Model::GradientBoosting(GradientBoosting::fit(data, params, seed))
            }
            ModelKind::AdaBoost => Model::AdaBoost(AdaBoost::fit(data, params, seed)),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Model::RandomForest(_) => ModelKind::RandomForest,
            Model::GradientBoosting(_) => ModelKind::GradientBoosting,
            Model::AdaBoost(_) => ModelKind::AdaBoost,
        }
    }

    pub fn predict_proba(&self, x: &[f32]) -> f32 {
        match self {
            Model::RandomForest(m) => m.predict_proba(x),
            Model::GradientBoosting(m) => m.predict_proba(x),
            Model::AdaBoost(m) => m.predict_proba(x),
        }
    }

    pub fn feature_importances(&self) -> Vec<f32> {
        match self {
            Model::RandomForest(m) => m.feature_importances(),
            Model::GradientBoosting(m) => m.feature_importances(),
            Model::AdaBoost(m) => m.feature_importances(),
        }
    }

    /// Structural check for models deserialized from outside.
    pub fn validate(&self) -> Result<(), TrainingError> {
        match self {
            Model::RandomForest(m) => m.validate(),
            Model::GradientBoosting(m) => m.validate(),
            Model::AdaBoost(m) => m.validate(),
        }
    }
}

/// A fitted model with its hold-out accuracy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub model: Model,
    pub validation_accuracy: f32,
}

impl TrainedModel {
    pub fn kind(&self) -> ModelKind {
        self.model.kind()
    }

    /// Opaque serialized parameters.
    pub fn parameters(&self) -> Result<Vec<u8>, TrainingError> {
        Ok(serde_json::to_vec(&self.model)?)
    }

    pub fn from_parameters(
        kind: ModelKind,
        parameters: &[u8],
        validation_accuracy: f32,
    ) -> Result<Self, TrainingError> {
        let model: Model = serde_json::from_slice(parameters)?;
        if model.kind() != kind {
            return Err(TrainingError::KindMismatch {
                expected: kind,
                found: model.kind(),
            });
        }
        model.validate()?;
        Ok(Self {
            model,
            validation_accuracy,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnsembleMember {
    pub model: TrainedModel,
    /// Normalized; weights of all members sum to 1.
    pub weight: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MemberSummary {
    pub kind: ModelKind,
    pub weight: f32,
    pub validation_accuracy: f32,
}

/// Weighted average of member probabilities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnsembleModel {
    members: Vec<EnsembleMember>,
    pub feature_version: u32,
    pub validation_accuracy: f32,
    pub training_records: usize,
    pub trained_at: DateTime<Utc>,
}

impl EnsembleModel {
    /// Combine `models` with the given raw weights. Weights are normalized;
    /// if they sum to zero every member counts equally.
    pub fn new(
        models: Vec<(TrainedModel, f32)>,
        validation_accuracy: f32,
        training_records: usize,
    ) -> Result<Self, TrainingError> {
        if models.is_empty() {
            return Err(TrainingError::EmptyEnsemble);
        }
        let total: f32 = models.iter().map(|(_, w)| w.max(0.0)).sum();
        let count = models.len() as f32;
        let members = models
            .into_iter()
            .map(|(model, weight)| EnsembleMember {
                model,
                weight: if total > 0.0 {
                    weight.max(0.0) / total
                } else {
                    1.0 / count
                },
            })
            .collect();

        Ok(Self {
            members,
            feature_version: FEATURE_VERSION,
            validation_accuracy,
            training_records,
            trained_at: Utc::now(),
        })
    }

    pub fn members(&self) -> &[EnsembleMember] {
        &self.members
    }

    /// Reject ensembles that could not have come from [`Self::new`], such as
    /// a model file edited by hand.
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.members.is_empty() {
            return Err(TrainingError::EmptyEnsemble);
        }
        for member in &self.members {
            if !member.weight.is_finite() || member.weight < 0.0 {
                return Err(TrainingError::InvalidModel(format!(
                    "{} member has weight {}",
                    member.model.kind(),
                    member.weight
                )));
            }
            member.model.model.validate()?;
        }
        Ok(())
    }

    /// Acceptance probability for a feature vector of the current layout.
    pub fn predict(&self, features: &FeatureVector) -> Result<f32, TrainingError> {
        if features.version != self.feature_version {
            return Err(TrainingError::FeatureVersionMismatch {
                found: self.feature_version,
                expected: features.version,
            });
        }
        Ok(self.predict_values(features.as_slice()))
    }

    pub(crate) fn predict_values(&self, x: &[f32]) -> f32 {
        self.members
            .iter()
            .map(|m| m.weight * m.model.model.predict_proba(x))
            .sum::<f32>()
            .clamp(0.0, 1.0)
    }

    /// Weighted member importances, or `None` when no member learned any
    /// split.
    pub fn feature_importances(&self) -> Option<Vec<f32>> {
        let mut total = vec![0.0f32; FEATURE_COUNT];
        for member in &self.members {
            for (acc, v) in total.iter_mut().zip(member.model.model.feature_importances()) {
                *acc += member.weight * v;
            }
        }
        let sum: f32 = total.iter().sum();
        if sum <= 0.0 || !sum.is_finite() {
            return None;
        }
        Some(normalize_importances(total))
    }

    pub fn summary(&self) -> Vec<MemberSummary> {
        self.members
            .iter()
            .map(|m| MemberSummary {
                kind: m.model.kind(),
                weight: m.weight,
                validation_accuracy: m.model.validation_accuracy,
            })
            .collect()
    }
}
