//! Decision engine
//!
//! Turns a metrics snapshot into proposed optimization actions. Two tiers
//! run on every call:
//! - a deterministic rule tier keyed on the derived [`Context`]
//! - an optional learned classifier whose predicted class expands into a
//!   fixed action template set
//!
//! Their proposals are merged per (kind, domain). Classifier actions win
//! unless a rule proposes the same key at a lower intensity.
//!
//! Feedback accumulates in a learning state; once enough has arrived the
//! classifier is retrained on reconstructed samples and swapped in
//! atomically. Classifier and retraining failures never affect the rule
//! tier.

mod classifier;
pub mod context;
mod learning;
mod onnx;
mod rules;
mod softmax;

pub use classifier::{
    ActionClassifier, ClassPrediction, FeatureVector, OptimizationClass, TrainingSample,
    NUM_CLASSES, NUM_FEATURES,
};
pub use context::derive_context;
pub use learning::{label_for, Experience, FeedbackRecord, LearningState};
pub use onnx::OnnxClassifier;
pub use rules::RuleEngine;
pub use softmax::{compute_checksum, SoftmaxClassifier};

use crate::config::{LearningConfig, OptimizerConfig};
use crate::error::ModelError;
use crate::models::{MetricsSnapshot, OptimizationAction};
use chrono::Timelike;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of offering feedback to the learning loop
#[derive(Debug, Clone, PartialEq)]
pub enum RetrainStatus {
    /// Thresholds not reached yet
    NotDue,
    Retrained { version: String, samples: usize },
    /// The previous model stays in place
    Failed(String),
}

/// Merge classifier and rule proposals. Classifier order is kept; rule
/// actions for new keys are appended in rule order.
pub fn merge_actions(
    classifier: Vec<OptimizationAction>,
    rules: Vec<OptimizationAction>,
) -> Vec<OptimizationAction> {
    let mut merged = classifier;
    for rule in rules {
        match merged.iter_mut().find(|a| a.merge_key() == rule.merge_key()) {
            Some(existing) => {
                if rule.intensity() < existing.intensity() {
                    *existing = rule;
                }
            }
            None => merged.push(rule),
        }
    }
    merged
}

/// Converts snapshots into proposed actions and learns from feedback
pub struct DecisionEngine {
    rules: RuleEngine,
    classifier: RwLock<Box<dyn ActionClassifier>>,
    learning: Mutex<LearningState>,
    learning_config: LearningConfig,
    learning_rate: f64,
    feedback_window: Duration,
    model_path: PathBuf,
}

impl DecisionEngine {
    /// Create an engine with the persisted model at `config.model_path`,
    /// or an untrained classifier if none can be loaded
    pub fn new(config: &OptimizerConfig) -> Self {
        let path = Path::new(&config.model_path);
        let classifier: Box<dyn ActionClassifier> = if !path.exists() {
            info!(path = %path.display(), "No classifier model found, starting untrained");
            Box::new(SoftmaxClassifier::untrained())
        } else {
            match load_classifier(path) {
                Ok(model) => model,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to load classifier model, starting untrained"
                    );
                    Box::new(SoftmaxClassifier::untrained())
                }
            }
        };
        Self::with_classifier(config, classifier)
    }

    pub fn with_classifier(config: &OptimizerConfig, classifier: Box<dyn ActionClassifier>) -> Self {
        Self {
            rules: RuleEngine::new(),
            classifier: RwLock::new(classifier),
            learning: Mutex::new(LearningState::new(config.learning.clone())),
            learning_config: config.learning.clone(),
            learning_rate: config.learning_rate,
            feedback_window: config.feedback_window(),
            model_path: PathBuf::from(&config.model_path),
        }
    }

    /// Decide using the local wall-clock hour
    pub fn decide(&self, snapshot: &MetricsSnapshot) -> Vec<OptimizationAction> {
        self.decide_at(snapshot, chrono::Local::now().hour())
    }

    /// Decide for an explicit hour of day (0-23)
    pub fn decide_at(&self, snapshot: &MetricsSnapshot, hour: u32) -> Vec<OptimizationAction> {
        let context = derive_context(snapshot, hour);

        let learned = match self.classify(snapshot, hour) {
            Ok(prediction) => prediction
                .class
                .actions(snapshot, &context, prediction.confidence),
            Err(ModelError::NotTrained) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Classifier tier failed, using rules only");
                Vec::new()
            }
        };
        let ruled = self.rules.evaluate(snapshot, &context);
        let actions = merge_actions(learned, ruled);

        debug!(
            battery_tier = %context.battery_tier,
            actions = actions.len(),
            "Decision computed"
        );

        self.lock_learning().record_experience(Experience {
            snapshot: snapshot.clone(),
            context,
            hour,
            actions: actions.clone(),
            timestamp_ms: snapshot.timestamp_ms,
        });

        actions
    }

    fn classify(&self, snapshot: &MetricsSnapshot, hour: u32) -> Result<ClassPrediction, ModelError> {
        let features = FeatureVector::from_snapshot(snapshot, hour);
        self.classifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .predict(&features)
    }

    /// Record an outcome and retrain if the thresholds are met
    pub fn provide_feedback(&self, record: FeedbackRecord) -> RetrainStatus {
        let samples = {
            let mut learning = self.lock_learning();
            learning.record_outcome(record);
            if !learning.retrain_due() {
                return RetrainStatus::NotDue;
            }
            learning.mark_retrained();
            learning.training_samples(self.feedback_window)
        };

        if samples.len() <= self.learning_config.min_training_samples {
            debug!(
                samples = samples.len(),
                required = self.learning_config.min_training_samples,
                "Not enough samples to retrain"
            );
            return RetrainStatus::NotDue;
        }

        self.retrain(&samples)
    }

    fn retrain(&self, samples: &[TrainingSample]) -> RetrainStatus {
        let retrained = self
            .classifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .retrain(samples, self.learning_rate, self.learning_config.training_epochs);

        let model = match retrained {
            Ok(model) => model,
            Err(e) => return RetrainStatus::Failed(e.to_string()),
        };

        if let Err(e) = model.save(&self.model_path) {
            warn!(
                path = %self.model_path.display(),
                error = %e,
                "Failed to persist retrained model"
            );
        }

        let version = model.version();
        *self.classifier.write().unwrap_or_else(PoisonError::into_inner) = model;
        RetrainStatus::Retrained {
            version,
            samples: samples.len(),
        }
    }

    /// Replace the classifier
    pub fn set_classifier(&self, classifier: Box<dyn ActionClassifier>) {
        *self.classifier.write().unwrap_or_else(PoisonError::into_inner) = classifier;
    }

    pub fn classifier_version(&self) -> String {
        self.classifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version()
    }

    pub fn experience_len(&self) -> usize {
        self.lock_learning().experience_len()
    }

    pub fn outcome_count(&self) -> usize {
        self.lock_learning().outcome_count()
    }

    fn lock_learning(&self) -> std::sync::MutexGuard<'_, LearningState> {
        self.learning.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pick the loader by file extension: `.onnx` is inference-only, anything
/// else is a softmax JSON document
pub fn load_classifier(path: &Path) -> Result<Box<dyn ActionClassifier>, ModelError> {
    let is_onnx = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"));
    if is_onnx {
        Ok(Box::new(OnnxClassifier::from_file(path)?))
    } else {
        Ok(Box::new(SoftmaxClassifier::load(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionKind, Domain};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Always predicts the same class
    struct FixedClassifier {
        class: OptimizationClass,
        confidence: f64,
    }

    impl ActionClassifier for FixedClassifier {
        fn predict(&self, _features: &FeatureVector) -> Result<ClassPrediction, ModelError> {
            Ok(ClassPrediction {
                class: self.class,
                confidence: self.confidence,
            })
        }

        fn retrain(
            &self,
            _samples: &[TrainingSample],
            _learning_rate: f64,
            _epochs: usize,
        ) -> Result<Box<dyn ActionClassifier>, ModelError> {
            Err(ModelError::Unsupported("fixed classifier"))
        }

        fn save(&self, _path: &Path) -> Result<(), ModelError> {
            Ok(())
        }

        fn version(&self) -> String {
            "fixed".to_string()
        }
    }

    struct FailingClassifier {
        calls: Arc<AtomicUsize>,
    }

    impl ActionClassifier for FailingClassifier {
        fn predict(&self, _features: &FeatureVector) -> Result<ClassPrediction, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ModelError::Inference("boom".to_string()))
        }

        fn retrain(
            &self,
            _samples: &[TrainingSample],
            _learning_rate: f64,
            _epochs: usize,
        ) -> Result<Box<dyn ActionClassifier>, ModelError> {
            Err(ModelError::Training("boom".to_string()))
        }

        fn save(&self, _path: &Path) -> Result<(), ModelError> {
            Ok(())
        }

        fn version(&self) -> String {
            "failing".to_string()
        }
    }

    fn test_config(dir: &TempDir) -> OptimizerConfig {
        OptimizerConfig {
            model_path: dir.path().join("model.json").display().to_string(),
            ..Default::default()
        }
    }

    fn snapshot(battery: f64, cpu: f64, brightness: u32) -> MetricsSnapshot {
        MetricsSnapshot {
            battery_percent: battery,
            cpu_percent: cpu,
            screen_brightness: brightness,
            target_app_cpu: 10.0,
            ..MetricsSnapshot::degraded(1_000)
        }
    }

    #[test]
    fn test_merge_prefers_lower_intensity_on_conflict() {
        let classifier = vec![OptimizationAction::new(
            ActionKind::BrightnessAdjust,
            0.5,
            8.0,
            0.2,
            0.9,
        )];
        let rules = vec![OptimizationAction::new(
            ActionKind::BrightnessAdjust,
            0.3,
            5.0,
            0.1,
            0.8,
        )];

        let merged = merge_actions(classifier, rules);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].intensity(), 0.3);
        assert_eq!(merged[0].target(), Domain::Display);
    }

    #[test]
    fn test_merge_keeps_classifier_when_rule_is_stronger() {
        let classifier = vec![OptimizationAction::new(ActionKind::CpuThrottle, 0.5, 10.0, 0.3, 0.9)];
        let rules = vec![
            OptimizationAction::new(ActionKind::CpuThrottle, 0.7, 25.0, 0.6, 0.85),
            OptimizationAction::new(ActionKind::BrightnessAdjust, 0.8, 20.0, 0.3, 0.9),
        ];

        let merged = merge_actions(classifier, rules);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].kind(), ActionKind::CpuThrottle);
        assert_eq!(merged[0].intensity(), 0.5);
        assert_eq!(merged[1].kind(), ActionKind::BrightnessAdjust);
    }

    #[test]
    fn test_critical_battery_scenario() {
        let dir = TempDir::new().unwrap();
        let engine = DecisionEngine::new(&test_config(&dir));

        let actions = engine.decide_at(&snapshot(8.0, 80.0, 95), 14);

        assert!(actions.len() >= 2);
        assert!(actions
            .iter()
            .any(|a| a.kind() == ActionKind::BrightnessAdjust && a.intensity() >= 0.7));
        assert!(actions
            .iter()
            .any(|a| a.kind() == ActionKind::CpuThrottle && a.intensity() >= 0.7));
        assert!(actions
            .iter()
            .all(|a| (0.0..=1.0).contains(&a.intensity()) && (0.0..=1.0).contains(&a.confidence())));
    }

    #[test]
    fn test_comfortable_battery_scenario_is_empty() {
        let dir = TempDir::new().unwrap();
        let engine = DecisionEngine::new(&test_config(&dir));

        let actions = engine.decide_at(&snapshot(70.0, 10.0, 60), 14);

        assert!(actions.is_empty());
        assert_eq!(engine.experience_len(), 1);
    }

    #[test]
    fn test_classifier_actions_merge_with_rules() {
        let dir = TempDir::new().unwrap();
        let engine = DecisionEngine::with_classifier(
            &test_config(&dir),
            Box::new(FixedClassifier {
                class: OptimizationClass::Moderate,
                confidence: 0.75,
            }),
        );

        // Critical rules propose brightness 0.8 and cpu 0.7; classifier
        // proposes 0.5 for both, which wins as the gentler intensity
        let actions = engine.decide_at(&snapshot(8.0, 80.0, 95), 14);

        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|a| a.intensity() == 0.5));
        assert!(actions.iter().all(|a| a.confidence() == 0.75));
    }

    #[test]
    fn test_classifier_failure_keeps_rule_tier() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = DecisionEngine::with_classifier(
            &test_config(&dir),
            Box::new(FailingClassifier {
                calls: calls.clone(),
            }),
        );

        let actions = engine.decide_at(&snapshot(8.0, 80.0, 95), 14);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn test_feedback_retrains_and_swaps_model() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.learning = LearningConfig {
            min_feedback_count: 2,
            min_experience: 4,
            min_training_samples: 3,
            experience_capacity: 100,
            training_epochs: 20,
        };
        let engine = DecisionEngine::new(&config);
        assert_eq!(engine.classifier_version(), "untrained");

        // 45 and 80 propose nothing and are left out of training
        for battery in [10.0, 25.0, 45.0, 80.0, 12.0, 20.0] {
            engine.decide_at(&snapshot(battery, 50.0, 70), 14);
        }

        let mut status = RetrainStatus::NotDue;
        for i in 0..3 {
            status = engine.provide_feedback(FeedbackRecord {
                action_id: format!("session_{i}"),
                success: true,
                energy_savings: 10.0,
                performance_impact: 0.1,
                user_satisfaction: 0.9,
                timestamp_ms: 2_000 + i,
            });
        }

        assert_eq!(
            status,
            RetrainStatus::Retrained {
                version: "softmax-g1".to_string(),
                samples: 4
            }
        );
        assert_eq!(engine.classifier_version(), "softmax-g1");
        assert!(Path::new(&config.model_path).exists());

        // The persisted model is picked up by a fresh engine
        let reloaded = DecisionEngine::new(&config);
        assert_eq!(reloaded.classifier_version(), "softmax-g1");
    }

    #[test]
    fn test_retrain_failure_keeps_previous_model() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.learning = LearningConfig {
            min_feedback_count: 0,
            min_experience: 1,
            min_training_samples: 0,
            experience_capacity: 100,
            training_epochs: 5,
        };
        let engine = DecisionEngine::with_classifier(
            &config,
            Box::new(FailingClassifier {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        );
        engine.decide_at(&snapshot(20.0, 50.0, 70), 14);

        let status = engine.provide_feedback(FeedbackRecord {
            action_id: "session_1".to_string(),
            success: false,
            energy_savings: 0.0,
            performance_impact: 0.3,
            user_satisfaction: 0.2,
            timestamp_ms: 1_500,
        });

        assert!(matches!(status, RetrainStatus::Failed(_)));
        assert_eq!(engine.classifier_version(), "failing");
    }

    #[test]
    fn test_corrupt_model_file_starts_untrained() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.model_path, "not a model").unwrap();

        let engine = DecisionEngine::new(&config);

        assert_eq!(engine.classifier_version(), "untrained");
    }
}
