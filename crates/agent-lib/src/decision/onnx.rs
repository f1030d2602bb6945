//! ONNX inference using tract
//!
//! Loads an externally trained classifier exported to ONNX. The model
//! takes a `[1, 8]` f32 input and produces four class scores; scores that
//! do not already sum to one are passed through softmax.

use super::classifier::{
    ActionClassifier, ClassPrediction, FeatureVector, TrainingSample, NUM_CLASSES, NUM_FEATURES,
};
use crate::error::ModelError;
use anyhow::Context;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tract_onnx::prelude::*;
use tracing::{debug, warn};

/// Inference latency above which a warning is logged
const MAX_INFERENCE_MS: u128 = 5;

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Inference-only classifier backed by an ONNX graph
pub struct OnnxClassifier {
    model: TractModel,
    version: String,
    inference_count: AtomicU64,
    slow_inference_count: AtomicU64,
}

impl OnnxClassifier {
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let bytes = std::fs::read(path).map_err(|e| {
            ModelError::Persistence(format!("failed to read {}: {e}", path.display()))
        })?;
        let version = path
            .file_stem()
            .map(|s| format!("onnx-{}", s.to_string_lossy()))
            .unwrap_or_else(|| "onnx".to_string());
        Self::from_bytes(&bytes, version)
    }

    pub fn from_bytes(model_bytes: &[u8], version: impl Into<String>) -> Result<Self, ModelError> {
        let model = Self::load_model(model_bytes)
            .map_err(|e| ModelError::Persistence(format!("{e:#}")))?;
        Ok(Self {
            model,
            version: version.into(),
            inference_count: AtomicU64::new(0),
            slow_inference_count: AtomicU64::new(0),
        })
    }

    /// Load and optimize an ONNX model from bytes
    fn load_model(model_bytes: &[u8]) -> anyhow::Result<TractModel> {
        let model = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(model_bytes))
            .context("Failed to parse ONNX model")?
            .with_input_fact(0, f32::fact([1, NUM_FEATURES]).into())
            .context("Failed to set input shape")?
            .into_optimized()
            .context("Failed to optimize model")?
            .into_runnable()
            .context("Failed to create runnable model")?;
        Ok(model)
    }

    fn features_to_tensor(features: &FeatureVector) -> Result<Tensor, ModelError> {
        let data: Vec<f32> = features.as_slice().iter().map(|v| *v as f32).collect();
        tract_ndarray::Array2::from_shape_vec((1, NUM_FEATURES), data)
            .map(Into::into)
            .map_err(|e| ModelError::Inference(e.to_string()))
    }

    /// (total, slow) inference counts
    pub fn stats(&self) -> (u64, u64) {
        (
            self.inference_count.load(Ordering::Relaxed),
            self.slow_inference_count.load(Ordering::Relaxed),
        )
    }
}

impl ActionClassifier for OnnxClassifier {
    fn predict(&self, features: &FeatureVector) -> Result<ClassPrediction, ModelError> {
        let start = Instant::now();
        let input = Self::features_to_tensor(features)?;

        let result = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        let output = result
            .first()
            .ok_or_else(|| ModelError::Inference("no output from model".to_string()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        let scores: Vec<f64> = view.iter().map(|v| f64::from(*v)).collect();
        if scores.len() < NUM_CLASSES {
            return Err(ModelError::Inference(format!(
                "model output has {} values, expected {NUM_CLASSES}",
                scores.len()
            )));
        }

        let elapsed = start.elapsed();
        self.inference_count.fetch_add(1, Ordering::Relaxed);
        if elapsed.as_millis() > MAX_INFERENCE_MS {
            self.slow_inference_count.fetch_add(1, Ordering::Relaxed);
            warn!(elapsed_ms = elapsed.as_millis(), "Inference exceeded {}ms target", MAX_INFERENCE_MS);
        } else {
            debug!(elapsed_us = elapsed.as_micros(), "Inference completed");
        }

        ClassPrediction::from_probabilities(&normalize(&scores[..NUM_CLASSES]))
    }

    fn retrain(
        &self,
        _samples: &[TrainingSample],
        _learning_rate: f64,
        _epochs: usize,
    ) -> Result<Box<dyn ActionClassifier>, ModelError> {
        Err(ModelError::Unsupported("onnx classifier"))
    }

    fn save(&self, _path: &Path) -> Result<(), ModelError> {
        Err(ModelError::Unsupported("onnx classifier"))
    }

    fn version(&self) -> String {
        self.version.clone()
    }
}

/// Pass scores through unchanged if they already form a distribution,
/// otherwise apply softmax
fn normalize(scores: &[f64]) -> Vec<f64> {
    let sum: f64 = scores.iter().sum();
    let is_distribution = scores.iter().all(|s| (0.0..=1.0).contains(s)) && (sum - 1.0).abs() < 1e-3;
    if is_distribution {
        return scores.to_vec();
    }
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_bytes_fail_to_load() {
        let result = OnnxClassifier::from_bytes(b"definitely not onnx", "test");
        assert!(matches!(result, Err(ModelError::Persistence(_))));
    }

    #[test]
    fn test_normalize_keeps_probabilities() {
        assert_eq!(normalize(&[0.1, 0.2, 0.3, 0.4]), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_normalize_applies_softmax_to_logits() {
        let probs = normalize(&[2.0, 0.0, 0.0, 0.0]);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(probs[0] > probs[1]);
        assert_eq!(probs[1], probs[2]);
    }
}
