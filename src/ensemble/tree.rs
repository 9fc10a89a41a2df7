//! Weighted regression tree (CART, squared error).
//!
//! For 0/1 targets the weighted squared error is proportional to the Gini
//! impurity, so the same tree serves the forest (class probabilities), the
//! gradient booster (residuals) and AdaBoost (weighted labels).

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::TrainingError;
use crate::features::FEATURE_COUNT;

/// Minimum impurity decrease for a split to be kept.
const MIN_GAIN: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Features sampled per split; `None` considers all of them.
    pub max_features: Option<usize>,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: 6,
            min_samples_leaf: 1,
            max_features: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f32,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
    importances: Vec<f32>,
}

/// Borrowed training inputs for one tree.
pub struct TreeInput<'a> {
    pub features: &'a [[f32; FEATURE_COUNT]],
    pub targets: &'a [f32],
    pub weights: &'a [f32],
}

struct SplitCandidate {
    feature: usize,
    threshold: f32,
    gain: f64,
}

impl RegressionTree {
    /// Fit on the samples listed in `indices` (repeats allowed, used for
    /// bootstrap sampling).
    pub fn fit(input: &TreeInput<'_>, indices: &[usize], params: &TreeParams, rng: &mut StdRng) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            importances: vec![0.0; FEATURE_COUNT],
        };
        let mut indices = indices.to_vec();
        tree.grow(input, &mut indices, 0, params, rng);
        tree
    }

    pub fn predict(&self, x: &[f32]) -> f32 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if x[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    /// Check the structure of a tree that did not come from [`Self::fit`].
    ///
    /// Children are always stored after their parent, so a tree passing
    /// this check has no cycles and every walk ends at a leaf.
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.nodes.is_empty() {
            return Err(TrainingError::InvalidModel("tree has no nodes".into()));
        }
        if self.importances.len() != FEATURE_COUNT {
            return Err(TrainingError::InvalidModel(format!(
                "tree has {} importances, expected {FEATURE_COUNT}",
                self.importances.len()
            )));
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Leaf { value } if !value.is_finite() => {
                    return Err(TrainingError::InvalidModel(format!("leaf {idx} is not finite")));
                }
                Node::Leaf { .. } => {}
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if *feature >= FEATURE_COUNT {
                        return Err(TrainingError::InvalidModel(format!(
                            "node {idx} splits on feature {feature}"
                        )));
                    }
                    if threshold.is_nan() {
                        return Err(TrainingError::InvalidModel(format!(
                            "node {idx} has no threshold"
                        )));
                    }
                    for child in [*left, *right] {
                        if child <= idx || child >= self.nodes.len() {
                            return Err(TrainingError::InvalidModel(format!(
                                "node {idx} points to child {child}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Unnormalized impurity decrease per feature.
    pub fn importances(&self) -> &[f32] {
        &self.importances
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }

    fn grow(
        &mut self,
        input: &TreeInput<'_>,
        indices: &mut [usize],
        depth: usize,
        params: &TreeParams,
        rng: &mut StdRng,
    ) -> usize {
        let node_idx = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: weighted_mean(input, indices),
        });

        if depth >= params.max_depth || indices.len() < 2 * params.min_samples_leaf.max(1) {
            return node_idx;
        }

        let Some(split) = best_split(input, indices, params, rng) else {
            return node_idx;
        };

        indices.sort_by(|&a, &b| {
            let fa = input.features[a][split.feature] <= split.threshold;
            let fb = input.features[b][split.feature] <= split.threshold;
            fb.cmp(&fa)
        });
        let boundary = indices
            .iter()
            .position(|&i| input.features[i][split.feature] > split.threshold)
            .unwrap_or(indices.len());
        if boundary == 0 || boundary == indices.len() {
            return node_idx;
        }

        self.importances[split.feature] += split.gain as f32;

        let (left_indices, right_indices) = indices.split_at_mut(boundary);
        let left = self.grow(input, left_indices, depth + 1, params, rng);
        let right = self.grow(input, right_indices, depth + 1, params, rng);
        self.nodes[node_idx] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        node_idx
    }
}

fn weighted_mean(input: &TreeInput<'_>, indices: &[usize]) -> f32 {
    let (mut sum_w, mut sum_wy) = (0.0f64, 0.0f64);
    for &i in indices {
        let w = input.weights[i] as f64;
        sum_w += w;
        sum_wy += w * input.targets[i] as f64;
    }
    if sum_w <= 0.0 {
        0.0
    } else {
        (sum_wy / sum_w) as f32
    }
}

fn best_split(
    input: &TreeInput<'_>,
    indices: &[usize],
    params: &TreeParams,
    rng: &mut StdRng,
) -> Option<SplitCandidate> {
    let mut features: Vec<usize> = (0..FEATURE_COUNT).collect();
    if let Some(k) = params.max_features {
        features.shuffle(rng);
        features.truncate(k.clamp(1, FEATURE_COUNT));
        features.sort_unstable();
    }

    let (mut total_w, mut total_wy, mut total_wyy) = (0.0f64, 0.0f64, 0.0f64);
    for &i in indices {
        let w = input.weights[i] as f64;
        let y = input.targets[i] as f64;
        total_w += w;
        total_wy += w * y;
        total_wyy += w * y * y;
    }
    if total_w <= 0.0 {
        return None;
    }
    let parent_sse = total_wyy - total_wy * total_wy / total_w;
    let min_leaf = params.min_samples_leaf.max(1);

    let mut best: Option<SplitCandidate> = None;
    let mut sorted = indices.to_vec();

    for feature in features {
        sorted.sort_by(|&a, &b| {
            input.features[a][feature]
                .partial_cmp(&input.features[b][feature])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let (mut left_w, mut left_wy, mut left_wyy) = (0.0f64, 0.0f64, 0.0f64);
        for pos in 0..sorted.len() - 1 {
            let i = sorted[pos];
            let w = input.weights[i] as f64;
            let y = input.targets[i] as f64;
            left_w += w;
            left_wy += w * y;
            left_wyy += w * y * y;

            let here = input.features[i][feature];
            let next = input.features[sorted[pos + 1]][feature];
            if here >= next {
                continue;
            }
            let left_count = pos + 1;
            if left_count < min_leaf || sorted.len() - left_count < min_leaf {
                continue;
            }

            let right_w = total_w - left_w;
            if left_w <= 0.0 || right_w <= 0.0 {
                continue;
            }
            let right_wy = total_wy - left_wy;
            let right_wyy = total_wyy - left_wyy;
            let left_sse = left_wyy - left_wy * left_wy / left_w;
            let right_sse = right_wyy - right_wy * right_wy / right_w;
            let gain = parent_sse - left_sse - right_sse;

            if gain > MIN_GAIN && best.as_ref().map_or(true, |b| gain > b.gain) {
                best = Some(SplitCandidate {
                    feature,
                    threshold: here + (next - here) / 2.0,
                    gain,
                });
            }
        }
    }

    best
}
