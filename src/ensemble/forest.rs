use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::ensemble::tree::{RegressionTree, TreeInput, TreeParams};
use crate::ensemble::{normalize_importances, Classifier, Dataset, TrainingError};
use crate::features::FEATURE_COUNT;

/// Bagged trees with per-split feature subsampling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<RegressionTree>,
}

impl RandomForest {
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        self.trees.iter().try_for_each(RegressionTree::validate)
    }
}

impl Classifier for RandomForest {
    fn fit(data: &Dataset, params: &TrainingConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = data.len();
        let weights = vec![1.0f32; n];
        let input = TreeInput {
            features: &data.features,
            targets: &data.labels,
            weights: &weights,
        };
        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_leaf: 1,
            max_features: Some((FEATURE_COUNT as f64).sqrt().round() as usize),
        };

        let mut trees = Vec::with_capacity(params.trees);
        if n == 0 {
            return Self { trees };
        }
        for _ in 0..params.trees.max(1) {
            let sample: Vec<usize> = (0..n).map(|_| rng.random_range(0..n)).collect();
            trees.push(RegressionTree::fit(&input, &sample, &tree_params, &mut rng));
        }
        Self { trees }
    }

    fn predict_proba(&self, x: &[f32]) -> f32 {
        if self.trees.is_empty() {
            return 0.5;
        }
        let sum: f32 = self.trees.iter().map(|t| t.predict(x)).sum();
        (sum / self.trees.len() as f32).clamp(0.0, 1.0)
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
