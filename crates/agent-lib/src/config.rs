//! Optimizer configuration
//!
//! The configuration document is JSON. A missing file is created with the
//! defaults; a malformed file is logged and replaced by the defaults in
//! memory. Environment variables prefixed with `OPTIMIZER_` override file
//! values (nested keys use `__`, e.g. `OPTIMIZER_LEARNING__MIN_EXPERIENCE`).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Mode applied when the configuration does not name one
pub const DEFAULT_MODE: &str = "balanced";

/// Policy bounds for one named optimization mode
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    pub max_intensity: f64,
    pub min_confidence: f64,
}

impl ModeConfig {
    pub fn new(max_intensity: f64, min_confidence: f64) -> Self {
        Self {
            max_intensity,
            min_confidence,
        }
    }

    fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.max_intensity) && (0.0..=1.0).contains(&self.min_confidence)
    }
}

/// Thresholds for the classifier's retraining loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Retraining is considered once more than this many outcomes exist
    pub min_feedback_count: usize,
    /// Minimum buffered decisions before retraining
    pub min_experience: usize,
    /// Minimum labelled samples required to fit a new model
    pub min_training_samples: usize,
    /// Capacity of the decision experience buffer
    pub experience_capacity: usize,
    pub training_epochs: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_feedback_count: 10,
            min_experience: 50,
            min_training_samples: 20,
            experience_capacity: 1000,
            training_epochs: 200,
        }
    }
}

/// Optimizer configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Metrics sampling interval in seconds
    pub monitoring_interval: f64,
    /// Minimum seconds between decision cycles
    pub decision_interval: f64,
    pub model_path: String,
    /// Battery percent at or below which emergency mode engages
    pub emergency_battery_threshold: f64,
    /// Upper bound on an action's performance impact (0-1)
    pub max_performance_impact: f64,
    pub learning_rate: f64,
    /// Seconds after a decision during which feedback is attributed to it
    pub feedback_timeout: f64,
    pub optimization_modes: BTreeMap<String, ModeConfig>,
    /// Mode active at startup
    pub optimization_mode: String,
    /// Process name of the application being optimized for
    pub target_application: Option<String>,
    /// Bound of the decision queue between producer and consumer
    pub queue_capacity: usize,
    /// Seconds `stop()` waits for the decision loop to finish
    pub stop_timeout: f64,
    pub learning: LearningConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: 2.0,
            decision_interval: 10.0,
            model_path: "models/battery_agent.json".to_string(),
            emergency_battery_threshold: 5.0,
            max_performance_impact: 0.7,
            learning_rate: 0.1,
            feedback_timeout: 300.0,
            optimization_modes: default_modes(),
            optimization_mode: DEFAULT_MODE.to_string(),
            target_application: None,
            queue_capacity: 64,
            stop_timeout: 5.0,
            learning: LearningConfig::default(),
        }
    }
}

fn default_modes() -> BTreeMap<String, ModeConfig> {
    BTreeMap::from([
        ("aggressive".to_string(), ModeConfig::new(0.9, 0.6)),
        ("balanced".to_string(), ModeConfig::new(0.6, 0.7)),
        ("conservative".to_string(), ModeConfig::new(0.3, 0.8)),
    ])
}

impl OptimizerConfig {
    /// Load configuration from a JSON file layered under the environment.
    /// Invalid individual values are replaced by their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("OPTIMIZER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        let loaded: OptimizerConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(loaded.sanitized())
    }

    /// Load the configuration, creating the file with defaults when absent.
    /// Never fails: any error is logged and the defaults are used.
    pub fn load_or_create(path: &Path) -> Self {
        if !path.exists() {
            let defaults = Self::default();
            match defaults.write_to(path) {
                Ok(()) => info!(path = %path.display(), "Created default configuration"),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to write default configuration"
                ),
            }
            return defaults;
        }

        match Self::load(path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Error loading configuration, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Serialize this configuration as pretty JSON to `path`
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Check every value, reporting the first invalid one
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("monitoring_interval", self.monitoring_interval)?;
        positive("decision_interval", self.decision_interval)?;
        positive("stop_timeout", self.stop_timeout)?;
        positive("learning_rate", self.learning_rate)?;
        if !(0.0..=1.0).contains(&self.max_performance_impact) {
            return Err(ConfigError::Invalid {
                key: "max_performance_impact",
                reason: format!("{} is outside [0, 1]", self.max_performance_impact),
            });
        }
        if !(0.0..=100.0).contains(&self.emergency_battery_threshold) {
            return Err(ConfigError::Invalid {
                key: "emergency_battery_threshold",
                reason: format!("{} is outside [0, 100]", self.emergency_battery_threshold),
            });
        }
        if let Some((name, _)) = self.optimization_modes.iter().find(|(_, m)| !m.is_valid()) {
            return Err(ConfigError::Invalid {
                key: "optimization_modes",
                reason: format!("mode {name} has bounds outside [0, 1]"),
            });
        }
        if !self.optimization_modes.contains_key(&self.optimization_mode) {
            return Err(ConfigError::UnknownMode(self.optimization_mode.clone()));
        }
        Ok(())
    }

    /// Replace invalid values with their defaults, logging each replacement
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();

        macro_rules! fallback {
            ($field:ident, $ok:expr) => {
                if !$ok {
                    warn!(
                        key = stringify!($field),
                        value = ?self.$field,
                        "Invalid configuration value, using default"
                    );
                    self.$field = defaults.$field.clone();
                }
            };
        }

        fallback!(monitoring_interval, is_positive(self.monitoring_interval));
        fallback!(decision_interval, is_positive(self.decision_interval));
        fallback!(stop_timeout, is_positive(self.stop_timeout));
        fallback!(learning_rate, is_positive(self.learning_rate));
        fallback!(feedback_timeout, self.feedback_timeout >= 0.0);
        fallback!(
            max_performance_impact,
            (0.0..=1.0).contains(&self.max_performance_impact)
        );
        fallback!(
            emergency_battery_threshold,
            (0.0..=100.0).contains(&self.emergency_battery_threshold)
        );
        fallback!(queue_capacity, self.queue_capacity > 0);

        let before = self.optimization_modes.len();
        self.optimization_modes.retain(|_, mode| mode.is_valid());
        if self.optimization_modes.len() != before {
            warn!("Dropped optimization modes with bounds outside [0, 1]");
        }
        if self.optimization_modes.is_empty() {
            self.optimization_modes = default_modes();
        }
        if !self.optimization_modes.contains_key(&self.optimization_mode) {
            let fallback = if self.optimization_modes.contains_key(DEFAULT_MODE) {
                DEFAULT_MODE.to_string()
            } else {
                self.optimization_modes
                    .keys()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_MODE.to_string())
            };
            warn!(
                mode = %self.optimization_mode,
                fallback = %fallback,
                "Configured optimization mode is unknown"
            );
            self.optimization_mode = fallback;
        }

        self
    }

    pub fn mode(&self, name: &str) -> Option<ModeConfig> {
        self.optimization_modes.get(name).copied()
    }

    pub fn monitoring_period(&self) -> Duration {
        Duration::from_secs_f64(self.monitoring_interval)
    }

    pub fn decision_period(&self) -> Duration {
        Duration::from_secs_f64(self.decision_interval)
    }

    pub fn stop_period(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout)
    }

    pub fn feedback_window(&self) -> Duration {
        Duration::from_secs_f64(self.feedback_timeout)
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn positive(key: &'static str, value: f64) -> Result<(), ConfigError> {
    if is_positive(value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key,
            reason: format!("{value} must be a positive number"),
        })
    }
}

/// Runtime preferences a user can push into a running controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub optimization_mode: Option<String>,
    pub emergency_threshold: Option<f64>,
    pub max_performance_impact: Option<f64>,
    pub decision_interval: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = OptimizerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.decision_period(), Duration::from_secs(10));
        assert_eq!(config.mode("balanced"), Some(ModeConfig::new(0.6, 0.7)));
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("default.json");

        let config = OptimizerConfig::load_or_create(&path);

        assert_eq!(config, OptimizerConfig::default());
        assert!(path.exists());
        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["decision_interval"], 10.0);
        assert_eq!(written["optimization_modes"]["conservative"]["max_intensity"], 0.3);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{"decision_interval": 3.5, "max_performance_impact": 0.4}"#).unwrap();

        let config = OptimizerConfig::load(&path).unwrap();

        assert_eq!(config.decision_interval, 3.5);
        assert_eq!(config.max_performance_impact, 0.4);
        assert_eq!(config.monitoring_interval, 2.0);
        assert_eq!(config.optimization_modes.len(), 3);
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ this is not json").unwrap();

        let config = OptimizerConfig::load_or_create(&path);

        assert_eq!(config, OptimizerConfig::default());
    }

    #[test]
    fn test_invalid_values_are_sanitized() {
        let mut config = OptimizerConfig {
            decision_interval: -1.0,
            max_performance_impact: 3.0,
            optimization_mode: "turbo".to_string(),
            ..Default::default()
        };
        config
            .optimization_modes
            .insert("broken".to_string(), ModeConfig::new(1.5, 0.2));

        let config = config.sanitized();

        assert_eq!(config.decision_interval, 10.0);
        assert_eq!(config.max_performance_impact, 0.7);
        assert_eq!(config.optimization_mode, DEFAULT_MODE);
        assert!(!config.optimization_modes.contains_key("broken"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_unknown_mode() {
        let config = OptimizerConfig {
            optimization_mode: "turbo".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::UnknownMode(m)) if m == "turbo"));
    }
}
