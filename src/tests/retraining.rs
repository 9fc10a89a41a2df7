//! Feedback, retraining and model swapping through the service.

use std::sync::Arc;

use super::{bowtie_items, event, link_type_feedback, test_config};
use crate::config::TrainingConfig;
use crate::ensemble::tests::separable_dataset;
use crate::ensemble::{EnsembleModel, ModelKind, ModelRegistry, ModelState, Trainer, TrainingError};
use crate::feedback::FeedbackFilter;
use crate::suggest::{SuggestionRequest, SuggestionService};
use crate::vocabulary::{Category, LinkType};

fn trained_service() -> SuggestionService {
    let service = SuggestionService::new(test_config()).unwrap();
    service.load_snapshot(bowtie_items()).unwrap();
    for e in link_type_feedback() {
        service.record_event(&e).unwrap();
    }
    service
}

#[test]
fn test_insufficient_feedback_keeps_heuristic() {
    let service = SuggestionService::new(test_config()).unwrap();
    service.load_snapshot(bowtie_items()).unwrap();
    for i in 1..=5 {
        service
            .record_event(&event(&format!("A{i:02}"), "P01", true))
            .unwrap();
    }

    let err = service.retrain().unwrap_err();
    assert!(matches!(err, TrainingError::InsufficientData { have: 5, need: 20 }));
    assert_eq!(service.model_metadata().state, ModelState::Untrained);

    let response = service.suggest(&SuggestionRequest::default()).unwrap();
    assert_eq!(response.suggestions.len(), 256);
    assert_eq!(response.model_state, ModelState::Untrained);
}

#[test]
fn test_retrain_learns_from_feedback() {
    let service = trained_service();
    assert_eq!(service.feedback_history(None).len(), 128);

    let report = service.retrain().unwrap();
    assert_eq!(report.training_records, 128);
    assert_eq!(report.members.len(), 3);
    let total: f32 = report.members.iter().map(|m| m.weight).sum();
    assert!((total - 1.0).abs() < 1e-5);
    assert!(report.validation_accuracy >= 0.5);

    let metadata = service.model_metadata();
    assert_eq!(metadata.state, ModelState::Trained);
    assert_eq!(metadata.feedback_since_training, 0);

    let response = service.suggest(&SuggestionRequest::default()).unwrap();
    let ap = LinkType::new(Category::Activity, Category::Pressure);
    let pc = LinkType::new(Category::Pressure, Category::Consequence);
    let lowest_accepted = response
        .suggestions
        .iter()
        .filter(|c| c.link_type == ap)
        .map(|c| c.confidence_score)
        .fold(f32::INFINITY, f32::min);
    let highest_rejected = response
        .suggestions
        .iter()
        .filter(|c| c.link_type == pc)
        .map(|c| c.confidence_score)
        .fold(f32::NEG_INFINITY, f32::max);
    assert!(lowest_accepted > highest_rejected);
    assert!(response.suggestions.iter().all(|c| !c.explanation.is_empty()));

    // similarity is untouched by the learned confidence
    let a = service
        .score_pair(&"A01".into(), &"P01".into())
        .unwrap();
    let fresh = SuggestionService::new(test_config()).unwrap();
    fresh.load_snapshot(bowtie_items()).unwrap();
    let b = fresh.score_pair(&"A01".into(), &"P01".into()).unwrap();
    assert_eq!(a.similarity_score, b.similarity_score);
}

#[test]
fn test_feedback_marks_model_stale() {
    let service = trained_service();
    service.retrain().unwrap();

    service.record_event(&event("A01", "K01", true)).unwrap();
    let metadata = service.model_metadata();
    assert_eq!(metadata.state, ModelState::Stale);
    assert_eq!(metadata.feedback_since_training, 1);

    let accepted = FeedbackFilter {
        accepted: Some(true),
        ..Default::default()
    };
    assert_eq!(service.feedback_history(Some(&accepted)).len(), 65);
}

#[test]
fn test_rejected_retrain_keeps_model_reference() {
    let trainer = Trainer::new(TrainingConfig::default(), 20, 0.5, 42);
    let registry = ModelRegistry::new();

    let train = separable_dataset(80, 1);
    let validation = separable_dataset(20, 2);
    let first = registry
        .retrain(|| trainer.train_with_split(&train, &validation))
        .unwrap();

    let mut inverted = separable_dataset(20, 3);
    inverted.labels.iter_mut().for_each(|y| *y = 1.0 - *y);
    let err = registry
        .retrain(|| trainer.train_with_split(&train, &inverted))
        .unwrap_err();

    assert!(matches!(err, TrainingError::AccuracyBelowFloor { .. }));
    assert!(err.is_warning());
    assert!(Arc::ptr_eq(&first, &registry.current().unwrap()));
    assert_eq!(registry.state(), ModelState::Trained);
}

#[test]
fn test_adding_models_does_not_hurt_accuracy() {
    let train = separable_dataset(120, 4);
    let validation = separable_dataset(40, 5);

    let single = Trainer::new(
        TrainingConfig {
            models: vec![ModelKind::RandomForest],
            ..TrainingConfig::default()
        },
        20,
        0.0,
        42,
    )
    .train_with_split(&train, &validation)
    .unwrap();

    let full = Trainer::new(TrainingConfig::default(), 20, 0.0, 42)
        .train_with_split(&train, &validation)
        .unwrap();

    let worst_member = full
        .members()
        .iter()
        .map(|m| m.model.validation_accuracy)
        .fold(f32::INFINITY, f32::min);
    assert!(full.validation_accuracy >= worst_member);
    assert!(full.validation_accuracy + 0.05 >= single.validation_accuracy);
}

#[test]
fn test_background_retrain_serves_old_model() {
    let service = Arc::new(trained_service());
    let handle = service.retrain_in_background();

    // predictions keep working while the retrain runs
    let response = service.suggest(&SuggestionRequest::default()).unwrap();
    assert_eq!(response.suggestions.len(), 256);

    let report = handle.join().unwrap().unwrap();
    assert_eq!(report.training_records, 128);
    assert!(service.current_model().is_some());
}

#[test]
fn test_installed_model_predicts_identically() {
    let service = trained_service();
    service.retrain().unwrap();
    let model = service.current_model().unwrap();

    let json = serde_json::to_vec(model.as_ref()).unwrap();
    let restored = serde_json::from_slice(&json).unwrap();

    let other = SuggestionService::new(test_config()).unwrap();
    other.load_snapshot(bowtie_items()).unwrap();
    other.install_model(restored).unwrap();
    assert_eq!(other.model_metadata().state, ModelState::Trained);

    let a = service.score_pair(&"A02".into(), &"P03".into()).unwrap();
    let b = other.score_pair(&"A02".into(), &"P03".into()).unwrap();
    assert!((a.confidence_score - b.confidence_score).abs() < 1e-5);
}

#[test]
fn test_corrupt_model_file_is_refused() {
    let service = trained_service();
    service.retrain().unwrap();
    let model = service.current_model().unwrap();

    let mut value = serde_json::to_value(model.as_ref()).unwrap();
    value["members"][0]["model"]["model"]["model"]["trees"][0]["nodes"][0] =
        serde_json::json!({"Split": {"feature": 40, "threshold": 0.5, "left": 1, "right": 2}});
    let corrupt: EnsembleModel = serde_json::from_value(value).unwrap();

    let other = SuggestionService::new(test_config()).unwrap();
    other.load_snapshot(bowtie_items()).unwrap();
    assert!(matches!(
        other.install_model(corrupt),
        Err(TrainingError::InvalidModel(_))
    ));
    assert!(other.current_model().is_none());
    assert_eq!(other.model_metadata().state, ModelState::Untrained);

    let response = other.suggest(&SuggestionRequest::default()).unwrap();
    assert_eq!(response.suggestions.len(), 256);
}
