//! Boosted tree ensembles: gradient boosting on log-loss and discrete
//! AdaBoost (SAMME, two classes).

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::ensemble::tree::{RegressionTree, TreeInput, TreeParams};
use crate::ensemble::{normalize_importances, sigmoid, Classifier, Dataset, TrainingError};
use crate::features::FEATURE_COUNT;

const GRADIENT_TREE_DEPTH: usize = 3;
const ADA_TREE_DEPTH: usize = 2;
const PROBABILITY_EPSILON: f32 = 1e-3;
const MIN_ERROR: f64 = 1e-10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradientBoosting {
    base_score: f32,
    learning_rate: f32,
    trees: Vec<RegressionTree>,
}

impl GradientBoosting {
    pub fn validate(&self) -> Result<(), TrainingError> {
        if !self.base_score.is_finite() || !self.learning_rate.is_finite() {
            return Err(TrainingError::InvalidModel(
                "gradient boosting scores are not finite".into(),
            ));
        }
        self.trees.iter().try_for_each(RegressionTree::validate)
    }
}

impl Classifier for GradientBoosting {
    fn fit(data: &Dataset, params: &TrainingConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = data.len();
        let positive = if n == 0 {
            0.5
        } else {
            data.labels.iter().sum::<f32>() / n as f32
        };
        let positive = positive.clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON);
        let base_score = (positive / (1.0 - positive)).ln();

        let mut model = Self {
            base_score,
            learning_rate: params.learning_rate,
            trees: Vec::with_capacity(params.boosting_rounds),
        };
        if n == 0 {
            return model;
        }

        let tree_params = TreeParams {
            max_depth: params.max_depth.min(GRADIENT_TREE_DEPTH),
            min_samples_leaf: 1,
            max_features: None,
        };
        let weights = vec![1.0f32; n];
        let indices: Vec<usize> = (0..n).collect();
        let mut raw = vec![base_score; n];
        let mut residuals = vec![0.0f32; n];

        for _ in 0..params.boosting_rounds {
            for i in 0..n {
                residuals[i] = data.labels[i] - sigmoid(raw[i]);
            }
            let input = TreeInput {
                features: &data.features,
                targets: &residuals,
                weights: &weights,
            };
            let tree = RegressionTree::fit(&input, &indices, &tree_params, &mut rng);
            for i in 0..n {
                raw[i] += model.learning_rate * tree.predict(&data.features[i]);
            }
            model.trees.push(tree);
        }
        model
    }

    fn predict_proba(&self, x: &[f32]) -> f32 {
        let raw = self.base_score
            + self.learning_rate * self.trees.iter().map(|t| t.predict(x)).sum::<f32>();
        sigmoid(raw)
    }

    fn feature_importances(&self) -> Vec<f32> {
        let mut total = vec![0.0f32; FEATURE_COUNT];
        for tree in &self.trees {
            for (acc, v) in total.iter_mut().zip(tree.importances()) {
                *acc += v;
            }
        }
        normalize_importances(total)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct WeakLearner {
    tree: RegressionTree,
    alpha: f32,
}

impl WeakLearner {
    /// Vote in {-1, +1}.
    fn vote(&self, x: &[f32]) -> f32 {
        if self.tree.predict(x) >= 0.5 {
            1.0
        } else {
            -1.0
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdaBoost {
    learners: Vec<WeakLearner>,
}

impl AdaBoost {
    pub fn rounds(&self) -> usize {
        self.learners.len()
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        for learner in &self.learners {
            if !learner.alpha.is_finite() {
                return Err(TrainingError::InvalidModel("adaboost weight is not finite".into()));
            }
            learner.tree.validate()?;
        }
        Ok(())
    }
}

impl Classifier for AdaBoost {
    fn fit(data: &Dataset, params: &TrainingConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = data.len();
        let mut model = Self {
            learners: Vec::with_capacity(params.boosting_rounds),
        };
        if n == 0 {
            return model;
        }

        let tree_params = TreeParams {
            max_depth: params.max_depth.min(ADA_TREE_DEPTH),
            min_samples_leaf: 1,
            max_features: None,
        };
        let indices: Vec<usize> = (0..n).collect();
        let signs: Vec<f32> = data
            .labels
            .iter()
            .map(|&y| if y >= 0.5 { 1.0 } else { -1.0 })
            .collect();
        let mut weights = vec![1.0f32 / n as f32; n];

        for round in 0..params.boosting_rounds {
            let input = TreeInput {
                features: &data.features,
                targets: &data.labels,
                weights: &weights,
            };
            let tree = RegressionTree::fit(&input, &indices, &tree_params, &mut rng);
            let learner = WeakLearner { tree, alpha: 0.0 };

            let votes: Vec<f32> = data.features.iter().map(|x| learner.vote(x)).collect();
            let total: f64 = weights.iter().map(|&w| w as f64).sum();
            let error: f64 = weights
                .iter()
                .zip(votes.iter().zip(&signs))
                .filter(|(_, (v, s))| v != s)
                .map(|(&w, _)| w as f64)
                .sum::<f64>()
                / total.max(f64::MIN_POSITIVE);

            if error >= 0.5 {
                log::debug!("adaboost stopped at round {round}: weak learner error {error:.3}");
                break;
            }

            let error = error.max(MIN_ERROR);
            let alpha = 0.5 * ((1.0 - error) / error).ln();
            for i in 0..n {
                weights[i] *= (-alpha * (signs[i] * votes[i]) as f64).exp() as f32;
            }
            let sum: f32 = weights.iter().sum();
            if sum > 0.0 {
                weights.iter_mut().for_each(|w| *w /= sum);
            }

            model.learners.push(WeakLearner {
                alpha: alpha as f32,
                ..learner
            });

            if error <= MIN_ERROR {
                break;
            }
        }
        model
    }

    fn predict_proba(&self, x: &[f32]) -> f32 {
        let score: f32 = self.learners.iter().map(|l| l.alpha * l.vote(x)).sum();
        sigmoid(2.0 * score)
    }

    fn feature_importances(&self) -> Vec<f32> {
        let mut total = vec![0.0f32; FEATURE_COUNT];
        for learner in &self.learners {
            let tree_total: f32 = learner.tree.importances().iter().sum();
            if tree_total <= 0.0 {
                continue;
            }
            for (acc, v) in total.iter_mut().zip(learner.tree.importances()) {
                *acc += learner.alpha * v / tree_total;
            }
        }
        normalize_importances(total)
    }
}
