//! Holds the model used for predictions and guards retraining.
//!
//! Readers clone the current `Arc` and keep using it for a whole request;
//! a successful retrain swaps the reference, a failed one leaves it alone.

use std::fmt::Display;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::ensemble::{EnsembleModel, TrainingError};
use crate::features::FEATURE_VERSION;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    /// No model yet; confidence comes from the heuristic.
    Untrained,
    Trained,
    /// Trained, but feedback arrived since.
    Stale,
    Retraining,
}

impl Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelState::Untrained => "untrained",
            ModelState::Trained => "trained",
            ModelState::Stale => "stale",
            ModelState::Retraining => "retraining",
        };
        f.write_str(s)
    }
}

struct StateCell {
    state: ModelState,
    /// State to fall back to when a retrain fails.
    resume: ModelState,
    /// Feedback arrived while retraining.
    dirty: bool,
}

pub struct ModelRegistry {
    current: RwLock<Option<Arc<EnsembleModel>>>,
    state: Mutex<StateCell>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the pre-retrain state unless the retrain committed.
struct RetrainGuard<'a> {
    registry: &'a ModelRegistry,
    committed: bool,
}

impl Drop for RetrainGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut cell = self.registry.lock_state();
        cell.state = if cell.dirty && cell.resume == ModelState::Trained {
            ModelState::Stale
        } else {
            cell.resume
        };
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            state: Mutex::new(StateCell {
                state: ModelState::Untrained,
                resume: ModelState::Untrained,
                dirty: false,
            }),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StateCell> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The model to use for this request, if any.
    pub fn current(&self) -> Option<Arc<EnsembleModel>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn state(&self) -> ModelState {
        self.lock_state().state
    }

    /// Note that new feedback exists since the model was trained.
    pub fn mark_stale(&self) {
        let mut cell = self.lock_state();
        match cell.state {
            ModelState::Trained => cell.state = ModelState::Stale,
            ModelState::Retraining => cell.dirty = true,
            ModelState::Untrained | ModelState::Stale => {}
        }
    }

    /// Replace the current model unconditionally (loaded from disk or
    /// trained elsewhere).
    pub fn install(&self, model: EnsembleModel) -> Result<Arc<EnsembleModel>, TrainingError> {
        if model.feature_version != FEATURE_VERSION {
            return Err(TrainingError::FeatureVersionMismatch {
                found: model.feature_version,
                expected: FEATURE_VERSION,
            });
        }
        model.validate()?;
        let model = Arc::new(model);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(model.clone());

        let mut cell = self.lock_state();
        if cell.state == ModelState::Retraining {
            cell.resume = ModelState::Trained;
        } else {
            cell.state = ModelState::Trained;
        }
        Ok(model)
    }

    /// Run `train` and swap its result in on success.
    ///
    /// Only one retrain runs at a time; a concurrent call fails with
    /// [`TrainingError::AlreadyRetraining`]. Predictions keep using the
    /// previous model while `train` runs.
    pub fn retrain<F>(&self, train: F) -> Result<Arc<EnsembleModel>, TrainingError>
    where
        F: FnOnce() -> Result<EnsembleModel, TrainingError>,
    {
        {
            let mut cell = self.lock_state();
            if cell.state == ModelState::Retraining {
                return Err(TrainingError::AlreadyRetraining);
            }
            cell.resume = cell.state;
            cell.state = ModelState::Retraining;
            cell.dirty = false;
        }
        let mut guard = RetrainGuard {
            registry: self,
            committed: false,
        };

        let model = Arc::new(train()?);
        if model.feature_version != FEATURE_VERSION {
            return Err(TrainingError::FeatureVersionMismatch {
                found: model.feature_version,
                expected: FEATURE_VERSION,
            });
        }

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(model.clone());
        {
            let mut cell = self.lock_state();
            cell.state = if cell.dirty {
                ModelState::Stale
            } else {
                ModelState::Trained
            };
        }
        guard.committed = true;
        Ok(model)
    }
}
