use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::{Config, TrainingConfig, WeightingStrategy};
use crate::ensemble::{accuracy_of, Dataset, EnsembleModel, Model, TrainedModel, TrainingError};
use crate::feedback::FeedbackRecord;

/// Fits every configured model kind on feedback and combines them.
#[derive(Clone, Debug)]
pub struct Trainer {
    params: TrainingConfig,
    min_records: usize,
    min_accuracy: f32,
    seed: u64,
}

impl Trainer {
    pub fn new(params: TrainingConfig, min_records: usize, min_accuracy: f32, seed: u64) -> Self {
        Self {
            params,
            min_records,
            min_accuracy,
            seed,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.training.clone(),
            config.min_training_records,
            config.retrain_min_accuracy,
            config.seed,
        )
    }

    /// Train on `records`, holding out a seeded validation split.
    ///
    /// Records of an older feature layout are skipped.
    pub fn train(&self, records: &[FeedbackRecord]) -> Result<EnsembleModel, TrainingError> {
        let mut data = Dataset::default();
        let mut skipped = 0;
        for record in records {
            if record.features.is_current() {
                data.push(&record.features, record.accepted);
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            log::warn!("skipping {skipped} feedback records with an outdated feature layout");
        }

        let need = self.min_records.max(2);
        if data.len() < need {
            return Err(TrainingError::InsufficientData {
                have: data.len(),
                need,
            });
        }

        let mut indices: Vec<usize> = (0..data.len()).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(self.seed));

        let holdout = ((data.len() as f32 * self.params.validation_fraction).round() as usize)
            .clamp(1, data.len() - 1);
        let (validation_idx, train_idx) = indices.split_at(holdout);

        self.train_with_split(&data.select(train_idx), &data.select(validation_idx))
    }

    /// Fit on `train`, score and weight members on `validation`.
    pub fn train_with_split(
        &self,
        train: &Dataset,
        validation: &Dataset,
    ) -> Result<EnsembleModel, TrainingError> {
        if train.is_empty() || validation.is_empty() {
            return Err(TrainingError::InsufficientData {
                have: train.len() + validation.len(),
                need: self.min_records.max(2),
            });
        }
        if self.params.models.is_empty() {
            return Err(TrainingError::EmptyEnsemble);
        }

        let mut members = Vec::with_capacity(self.params.models.len());
        for (i, &kind) in self.params.models.iter().enumerate() {
            let model = Model::fit(kind, train, &self.params, self.seed.wrapping_add(i as u64));
            let validation_accuracy = accuracy_of(|x| model.predict_proba(x), validation);
            log::debug!("trained {kind}: validation accuracy {validation_accuracy:.3}");

            let weight = match self.params.weighting {
                WeightingStrategy::Accuracy => validation_accuracy,
                WeightingStrategy::Uniform => 1.0,
            };
            members.push((
                TrainedModel {
                    model,
                    validation_accuracy,
                },
                weight,
            ));
        }

        let mut ensemble = EnsembleModel::new(members, 0.0, train.len() + validation.len())?;
        let accuracy = accuracy_of(|x| ensemble.predict_values(x), validation);
        ensemble.validation_accuracy = accuracy;

        if accuracy < self.min_accuracy {
            return Err(TrainingError::AccuracyBelowFloor {
                accuracy,
                floor: self.min_accuracy,
            });
        }

        log::info!(
            "trained ensemble of {} models on {} records, validation accuracy {:.3}",
            ensemble.members().len(),
            ensemble.training_records,
            accuracy
        );
        Ok(ensemble)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::tests::separable_dataset;
    use crate::ensemble::ModelKind;
    use crate::features::{FeatureVector, FEATURE_VERSION};
    use crate::item_id::ItemId;
    use crate::vocabulary::{Category, LinkType};

    fn records(data: &Dataset) -> Vec<FeedbackRecord> {
        data.features
            .iter()
            .zip(&data.labels)
            .enumerate()
            .map(|(i, (values, label))| FeedbackRecord {
                from_id: ItemId::from(format!("A{i}")),
                to_id: ItemId::from(format!("P{i}")),
                link_type: LinkType::new(Category::Activity, Category::Pressure),
                features: FeatureVector {
                    version: FEATURE_VERSION,
                    values: *values,
                },
                accepted: *label >= 0.5,
                timestamp: chrono::Utc::now(),
            })
            .collect()
    }

    fn trainer(min_accuracy: f32) -> Trainer {
        Trainer::new(TrainingConfig::default(), 20, min_accuracy, 42)
    }

    #[test]
    fn test_insufficient_data() {
        let data = separable_dataset(19, 1);
        let err = trainer(0.5).train(&records(&data)).unwrap_err();
        assert!(matches!(
            err,
            TrainingError::InsufficientData { have: 19, need: 20 }
        ));
        assert!(err.is_warning());
    }

    #[test]
    fn test_trains_all_kinds_with_normalized_weights() {
        let data = separable_dataset(100, 2);
        let ensemble = trainer(0.5).train(&records(&data)).unwrap();

        let kinds: Vec<ModelKind> = ensemble.members().iter().map(|m| m.model.kind()).collect();
        assert_eq!(kinds, ModelKind::ALL.to_vec());
        let total: f32 = ensemble.members().iter().map(|m| m.weight).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(ensemble.validation_accuracy >= 0.5);
        assert_eq!(ensemble.training_records, 100);
    }

    #[test]
    fn test_training_is_deterministic() {
        let data = separable_dataset(60, 3);
        let a = trainer(0.0).train(&records(&data)).unwrap();
        let b = trainer(0.0).train(&records(&data)).unwrap();
        assert_eq!(a.members(), b.members());
        assert_eq!(a.validation_accuracy, b.validation_accuracy);
    }

    #[test]
    fn test_accuracy_floor_rejects() {
        let train = separable_dataset(60, 4);
        let mut validation = separable_dataset(20, 5);
        validation.labels.iter_mut().for_each(|y| *y = 1.0 - *y);

        let err = trainer(0.5).train_with_split(&train, &validation).unwrap_err();
        match err {
            TrainingError::AccuracyBelowFloor { accuracy, floor } => {
                assert!(accuracy < 0.5);
                assert_eq!(floor, 0.5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_outdated_records_are_skipped() {
        let data = separable_dataset(30, 6);
        let mut recs = records(&data);
        for r in recs.iter_mut().take(15) {
            r.features.version = FEATURE_VERSION + 1;
        }
        assert!(matches!(
            trainer(0.0).train(&recs),
            Err(TrainingError::InsufficientData { have: 15, .. })
        ));
    }

    #[test]
    fn test_uniform_weighting() {
        let data = separable_dataset(50, 7);
        let params = TrainingConfig {
            weighting: WeightingStrategy::Uniform,
            ..TrainingConfig::default()
        };
        let ensemble = Trainer::new(params, 20, 0.0, 1)
            .train(&records(&data))
            .unwrap();
        for member in ensemble.members() {
            assert!((member.weight - 1.0 / 3.0).abs() < 1e-6);
        }
    }
}
