//! Classifier tier
//!
//! A classifier maps a fixed eight-feature vector to one of four
//! optimization classes. Each class expands to a fixed action template
//! set, conditioned on the current snapshot and context.

use crate::error::ModelError;
use crate::models::{ActionKind, AppPriority, Context, MetricsSnapshot, OptimizationAction};
use std::path::Path;

/// Number of input features
pub const NUM_FEATURES: usize = 8;

/// Number of optimization classes (no-op, light, moderate, aggressive)
pub const NUM_CLASSES: usize = 4;

/// Classifier input in fixed order: battery %, cpu %, memory %, gpu %,
/// network MB, brightness, hour, plugged-in estimate (0/1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector(pub [f64; NUM_FEATURES]);

impl FeatureVector {
    pub fn from_snapshot(snapshot: &MetricsSnapshot, hour: u32) -> Self {
        Self([
            snapshot.battery_percent,
            snapshot.cpu_percent,
            snapshot.memory_percent,
            snapshot.gpu_percent,
            snapshot.network_megabytes(),
            f64::from(snapshot.screen_brightness),
            f64::from(hour),
            if snapshot.likely_plugged_in() { 1.0 } else { 0.0 },
        ])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// Optimization class predicted by a classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationClass {
    None,
    Light,
    Moderate,
    Aggressive,
}

impl OptimizationClass {
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::None),
            1 => Some(Self::Light),
            2 => Some(Self::Moderate),
            3 => Some(Self::Aggressive),
            _ => None,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Light => 1,
            Self::Moderate => 2,
            Self::Aggressive => 3,
        }
    }

    /// Expand the class into its action templates. Every action carries the
    /// prediction confidence.
    pub fn actions(
        &self,
        snapshot: &MetricsSnapshot,
        context: &Context,
        confidence: f64,
    ) -> Vec<OptimizationAction> {
        let action = |kind, intensity, savings, impact| {
            OptimizationAction::new(kind, intensity, savings, impact, confidence)
        };

        match self {
            Self::None => Vec::new(),
            Self::Light => {
                if snapshot.screen_brightness > 60 {
                    vec![action(ActionKind::BrightnessAdjust, 0.3, 5.0, 0.1)]
                } else {
                    Vec::new()
                }
            }
            Self::Moderate => {
                let mut actions = Vec::new();
                if snapshot.cpu_percent > 50.0 {
                    actions.push(action(ActionKind::CpuThrottle, 0.5, 10.0, 0.3));
                }
                if snapshot.screen_brightness > 40 {
                    actions.push(action(ActionKind::BrightnessAdjust, 0.5, 8.0, 0.2));
                }
                actions
            }
            Self::Aggressive => {
                let mut actions = vec![
                    action(ActionKind::CpuThrottle, 0.8, 20.0, 0.6),
                    action(ActionKind::BrightnessAdjust, 0.7, 15.0, 0.4),
                ];
                if context.app_priority != AppPriority::Critical {
                    actions.push(action(ActionKind::AppThrottle, 0.6, 12.0, 0.5));
                }
                actions
            }
        }
    }
}

/// Class and confidence (maximum class probability)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassPrediction {
    pub class: OptimizationClass,
    pub confidence: f64,
}

impl ClassPrediction {
    /// Pick the most probable class from a probability vector
    pub fn from_probabilities(probabilities: &[f64]) -> Result<Self, ModelError> {
        let (index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, p)| p.is_finite())
            .fold(None, |best: Option<(usize, f64)>, (i, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((i, p)),
            })
            .ok_or_else(|| ModelError::Inference("no finite class scores".to_string()))?;

        let class = OptimizationClass::from_index(index)
            .ok_or_else(|| ModelError::Inference(format!("class index {index} out of range")))?;
        Ok(Self { class, confidence })
    }
}

/// A labelled training sample
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub features: FeatureVector,
    pub label: OptimizationClass,
}

/// Learned classifier. Implementations are owned by the decision engine
/// and swapped as a whole after a successful retrain.
pub trait ActionClassifier: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Result<ClassPrediction, ModelError>;

    /// Fit a replacement model. `self` is left untouched.
    fn retrain(
        &self,
        samples: &[TrainingSample],
        learning_rate: f64,
        epochs: usize,
    ) -> Result<Box<dyn ActionClassifier>, ModelError>;

    fn save(&self, path: &Path) -> Result<(), ModelError>;

    /// Short identifier for logs and metrics
    fn version(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::context::derive_context;

    #[test]
    fn test_features_in_fixed_order() {
        let snapshot = MetricsSnapshot {
            battery_percent: 40.0,
            cpu_percent: 30.0,
            memory_percent: 20.0,
            gpu_percent: 10.0,
            network_bytes_recv: 2 * 1024 * 1024,
            screen_brightness: 70,
            battery_power_draw: 2.0,
            ..MetricsSnapshot::degraded(0)
        };
        let features = FeatureVector::from_snapshot(&snapshot, 9);
        assert_eq!(features.0, [40.0, 30.0, 20.0, 10.0, 2.0, 70.0, 9.0, 1.0]);
    }

    #[test]
    fn test_prediction_takes_max_probability() {
        let prediction = ClassPrediction::from_probabilities(&[0.1, 0.2, 0.6, 0.1]).unwrap();
        assert_eq!(prediction.class, OptimizationClass::Moderate);
        assert_eq!(prediction.confidence, 0.6);
        assert!(ClassPrediction::from_probabilities(&[]).is_err());
    }

    #[test]
    fn test_aggressive_spares_critical_app() {
        let mut snapshot = MetricsSnapshot::degraded(0);
        snapshot.target_app_cpu = 30.0;
        let context = derive_context(&snapshot, 14);
        let actions = OptimizationClass::Aggressive.actions(&snapshot, &context, 0.9);
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|a| a.kind() != ActionKind::AppThrottle));

        snapshot.target_app_cpu = 1.0;
        let context = derive_context(&snapshot, 14);
        let actions = OptimizationClass::Aggressive.actions(&snapshot, &context, 0.9);
        assert_eq!(actions.len(), 3);
        assert!(actions.iter().all(|a| a.confidence() == 0.9));
    }
}
