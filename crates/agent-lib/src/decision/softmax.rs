//! Multinomial logistic regression classifier
//!
//! Features are standardized with the training set's mean and standard
//! deviation, then scored by a linear layer followed by softmax. Training
//! is plain batch gradient descent.
//!
//! Models persist as JSON. A `<model>.sha256` sidecar holding the hex
//! SHA-256 of the JSON bytes is written next to the model and verified on
//! load.

use super::classifier::{
    ActionClassifier, ClassPrediction, FeatureVector, TrainingSample, NUM_CLASSES, NUM_FEATURES,
};
use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SoftmaxParams {
    /// Incremented on every retrain
    generation: u64,
    trained_at: i64,
    sample_count: usize,
    means: Vec<f64>,
    scales: Vec<f64>,
    /// One row of NUM_FEATURES weights per class
    weights: Vec<Vec<f64>>,
    biases: Vec<f64>,
}

impl SoftmaxParams {
    fn check_shape(&self) -> Result<(), ModelError> {
        let rows_ok = self.weights.len() == NUM_CLASSES
            && self.weights.iter().all(|row| row.len() == NUM_FEATURES);
        if !rows_ok
            || self.biases.len() != NUM_CLASSES
            || self.means.len() != NUM_FEATURES
            || self.scales.len() != NUM_FEATURES
        {
            return Err(ModelError::Persistence(format!(
                "model shape does not match {NUM_FEATURES} features x {NUM_CLASSES} classes"
            )));
        }
        Ok(())
    }

    fn standardize(&self, features: &[f64]) -> [f64; NUM_FEATURES] {
        let mut out = [0.0; NUM_FEATURES];
        for (i, value) in features.iter().enumerate().take(NUM_FEATURES) {
            out[i] = (value - self.means[i]) / self.scales[i];
        }
        out
    }

    fn probabilities(&self, x: &[f64; NUM_FEATURES]) -> [f64; NUM_CLASSES] {
        let mut logits = [0.0; NUM_CLASSES];
        for (c, logit) in logits.iter_mut().enumerate() {
            *logit = self.biases[c]
                + self.weights[c]
                    .iter()
                    .zip(x.iter())
                    .map(|(w, v)| w * v)
                    .sum::<f64>();
        }
        softmax(&logits)
    }
}

fn softmax(logits: &[f64; NUM_CLASSES]) -> [f64; NUM_CLASSES] {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut out = [0.0; NUM_CLASSES];
    let mut sum = 0.0;
    for (o, l) in out.iter_mut().zip(logits.iter()) {
        *o = (l - max).exp();
        sum += *o;
    }
    for o in out.iter_mut() {
        *o /= sum;
    }
    out
}

/// Softmax classifier. Starts untrained; an untrained model refuses to
/// predict so the decision engine relies on its rule tier alone.
#[derive(Debug, Clone, Default)]
pub struct SoftmaxClassifier {
    params: Option<SoftmaxParams>,
}

impl SoftmaxClassifier {
    pub fn untrained() -> Self {
        Self { params: None }
    }

    pub fn is_trained(&self) -> bool {
        self.params.is_some()
    }

    /// Load a model written by [`ActionClassifier::save`]
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let bytes = fs::read(path).map_err(|e| {
            ModelError::Persistence(format!("failed to read {}: {e}", path.display()))
        })?;

        let sidecar = checksum_path(path);
        match fs::read_to_string(&sidecar) {
            Ok(expected) => {
                let computed = compute_checksum(&bytes);
                if computed != expected.trim() {
                    return Err(ModelError::Persistence(format!(
                        "checksum mismatch for {}: expected {}, got {}",
                        path.display(),
                        expected.trim(),
                        computed
                    )));
                }
                debug!(checksum = %computed, "Model checksum validated");
            }
            Err(_) => warn!(
                path = %path.display(),
                "Model has no checksum sidecar, loading unverified"
            ),
        }

        let params: SoftmaxParams = serde_json::from_slice(&bytes)
            .map_err(|e| ModelError::Persistence(format!("invalid model document: {e}")))?;
        params.check_shape()?;

        info!(
            path = %path.display(),
            generation = params.generation,
            samples = params.sample_count,
            "Loaded classifier model"
        );
        Ok(Self {
            params: Some(params),
        })
    }

    /// Fit a fresh model on `samples`
    pub fn fit(
        samples: &[TrainingSample],
        learning_rate: f64,
        epochs: usize,
        generation: u64,
    ) -> Result<Self, ModelError> {
        if samples.is_empty() {
            return Err(ModelError::Training("no training samples".to_string()));
        }
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(ModelError::Training(format!(
                "learning rate {learning_rate} must be positive"
            )));
        }
        if samples
            .iter()
            .any(|s| s.features.as_slice().iter().any(|v| !v.is_finite()))
        {
            return Err(ModelError::Training("non-finite feature value".to_string()));
        }

        let n = samples.len() as f64;
        let mut means = vec![0.0; NUM_FEATURES];
        for sample in samples {
            for (m, v) in means.iter_mut().zip(sample.features.as_slice()) {
                *m += v / n;
            }
        }
        let mut scales = vec![0.0; NUM_FEATURES];
        for sample in samples {
            for (i, v) in sample.features.as_slice().iter().enumerate() {
                scales[i] += (v - means[i]).powi(2) / n;
            }
        }
        for s in scales.iter_mut() {
            *s = s.sqrt();
            if *s < 1e-9 {
                *s = 1.0;
            }
        }

        let mut params = SoftmaxParams {
            generation,
            trained_at: chrono::Utc::now().timestamp(),
            sample_count: samples.len(),
            means,
            scales,
            weights: vec![vec![0.0; NUM_FEATURES]; NUM_CLASSES],
            biases: vec![0.0; NUM_CLASSES],
        };

        let inputs: Vec<([f64; NUM_FEATURES], usize)> = samples
            .iter()
            .map(|s| (params.standardize(s.features.as_slice()), s.label.index()))
            .collect();

        for _ in 0..epochs {
            let mut grad_w = vec![vec![0.0; NUM_FEATURES]; NUM_CLASSES];
            let mut grad_b = vec![0.0; NUM_CLASSES];

            for (x, label) in &inputs {
                let probs = params.probabilities(x);
                for c in 0..NUM_CLASSES {
                    let target = if c == *label { 1.0 } else { 0.0 };
                    let err = probs[c] - target;
                    grad_b[c] += err / n;
                    for (g, v) in grad_w[c].iter_mut().zip(x.iter()) {
                        *g += err * v / n;
                    }
                }
            }

            for c in 0..NUM_CLASSES {
                params.biases[c] -= learning_rate * grad_b[c];
                for (w, g) in params.weights[c].iter_mut().zip(&grad_w[c]) {
                    *w -= learning_rate * g;
                }
            }
        }

        if params
            .weights
            .iter()
            .flatten()
            .chain(params.biases.iter())
            .any(|v| !v.is_finite())
        {
            return Err(ModelError::Training("training diverged".to_string()));
        }

        Ok(Self {
            params: Some(params),
        })
    }

    /// Fraction of `samples` whose label matches the prediction
    pub fn accuracy(&self, samples: &[TrainingSample]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let correct = samples
            .iter()
            .filter(|s| {
                self.predict(&s.features)
                    .map(|p| p.class == s.label)
                    .unwrap_or(false)
            })
            .count();
        correct as f64 / samples.len() as f64
    }
}

impl ActionClassifier for SoftmaxClassifier {
    fn predict(&self, features: &FeatureVector) -> Result<ClassPrediction, ModelError> {
        let params = self.params.as_ref().ok_or(ModelError::NotTrained)?;
        if features.as_slice().iter().any(|v| !v.is_finite()) {
            return Err(ModelError::Inference("non-finite feature value".to_string()));
        }
        let x = params.standardize(features.as_slice());
        ClassPrediction::from_probabilities(&params.probabilities(&x))
    }

    fn retrain(
        &self,
        samples: &[TrainingSample],
        learning_rate: f64,
        epochs: usize,
    ) -> Result<Box<dyn ActionClassifier>, ModelError> {
        let generation = self.params.as_ref().map_or(0, |p| p.generation) + 1;
        let model = Self::fit(samples, learning_rate, epochs, generation)?;
        Ok(Box::new(model))
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        let params = self.params.as_ref().ok_or(ModelError::NotTrained)?;
        let bytes = serde_json::to_vec_pretty(params)
            .map_err(|e| ModelError::Persistence(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                ModelError::Persistence(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        write_atomically(path, &bytes)?;
        write_atomically(&checksum_path(path), compute_checksum(&bytes).as_bytes())?;

        debug!(path = %path.display(), generation = params.generation, "Saved classifier model");
        Ok(())
    }

    fn version(&self) -> String {
        match &self.params {
            Some(p) => format!("softmax-g{}", p.generation),
            None => "untrained".to_string(),
        }
    }
}

/// Write to a temp file first, then rename over the destination
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ModelError> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp_path = PathBuf::from(temp);

    let persist = || -> std::io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    };
    persist().map_err(|e| {
        ModelError::Persistence(format!("failed to write {}: {e}", path.display()))
    })
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".sha256");
    PathBuf::from(sidecar)
}

/// Compute SHA256 checksum of data
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
