//! Processor backend: frequency cap and governor

use super::backend::{ActuatorBackend, BackendState};
use crate::error::ActuationError;
use crate::models::{ActionKind, ActionResult, Domain, ObservedValue, OptimizationAction};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Governor selected while throttled
const THROTTLE_GOVERNOR: &str = "powersave";

/// Frequency cap for an intensity, in percent of the hardware maximum
pub fn max_frequency_percent(intensity: f64) -> f64 {
    100.0 - intensity * 50.0
}

/// Saved per-CPU cpufreq values
#[derive(Debug, Clone)]
struct CpuPolicy {
    dir: PathBuf,
    scaling_max_freq: String,
    governor: Option<String>,
}

#[derive(Debug, Clone)]
struct SavedState {
    percent: f64,
    policies: Vec<CpuPolicy>,
}

struct ProcessorState {
    /// Current cap in percent of maximum
    percent: f64,
    saved: HashMap<String, SavedState>,
}

pub struct ProcessorBackend {
    /// `cpuN/cpufreq` directories; empty runs simulated
    cpufreq_dirs: Vec<PathBuf>,
    state: Mutex<ProcessorState>,
}

impl ProcessorBackend {
    pub fn detect(sys_root: &Path) -> Self {
        let cpu_root = sys_root.join("devices/system/cpu");
        let mut dirs: Vec<PathBuf> = fs::read_dir(&cpu_root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        let name = e.file_name();
                        let name = name.to_string_lossy();
                        name.strip_prefix("cpu")
                            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                    })
                    .map(|e| e.path().join("cpufreq"))
                    .filter(|p| p.join("cpuinfo_max_freq").exists())
                    .collect()
            })
            .unwrap_or_default();
        dirs.sort();
        Self::with_dirs(dirs)
    }

    pub fn simulated() -> Self {
        Self::with_dirs(Vec::new())
    }

    fn with_dirs(cpufreq_dirs: Vec<PathBuf>) -> Self {
        Self {
            cpufreq_dirs,
            state: Mutex::new(ProcessorState {
                percent: 100.0,
                saved: HashMap::new(),
            }),
        }
    }

    pub fn max_frequency(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .percent
    }

    fn snapshot_policies(&self) -> Result<Vec<CpuPolicy>, ActuationError> {
        self.cpufreq_dirs
            .iter()
            .map(|dir| {
                let scaling_max_freq = read_value(&dir.join("scaling_max_freq"))?;
                let governor = read_value(&dir.join("scaling_governor")).ok();
                Ok(CpuPolicy {
                    dir: dir.clone(),
                    scaling_max_freq,
                    governor,
                })
            })
            .collect()
    }

    fn throttle(&self, percent: f64) -> Result<(), ActuationError> {
        for dir in &self.cpufreq_dirs {
            let hw_max: u64 = read_value(&dir.join("cpuinfo_max_freq"))?
                .parse()
                .map_err(|_| ActuationError::backend("malformed cpuinfo_max_freq"))?;
            let cap = (hw_max as f64 * percent / 100.0) as u64;
            if dir.join("scaling_governor").exists() {
                write_value(&dir.join("scaling_governor"), THROTTLE_GOVERNOR)?;
            }
            write_value(&dir.join("scaling_max_freq"), &cap.to_string())?;
        }
        Ok(())
    }

    fn restore(policies: &[CpuPolicy]) -> Result<(), ActuationError> {
        for policy in policies {
            if let Some(governor) = &policy.governor {
                write_value(&policy.dir.join("scaling_governor"), governor)?;
            }
            write_value(&policy.dir.join("scaling_max_freq"), &policy.scaling_max_freq)?;
        }
        Ok(())
    }
}

fn read_value(path: &Path) -> Result<String, ActuationError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| ActuationError::backend(format!("failed to read {}: {e}", path.display())))
}

fn write_value(path: &Path, value: &str) -> Result<(), ActuationError> {
    fs::write(path, value)
        .map_err(|e| ActuationError::backend(format!("failed to write {}: {e}", path.display())))
}

impl ActuatorBackend for ProcessorBackend {
    fn domain(&self) -> Domain {
        Domain::Processor
    }

    fn apply(&self, action_id: &str, action: &OptimizationAction) -> ActionResult {
        if action.kind() != ActionKind::CpuThrottle {
            return ActionResult::failed(
                action_id,
                ActuationError::Unsupported {
                    action: action.kind(),
                    domain: Domain::Processor,
                },
            );
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = state.percent;
        let target = max_frequency_percent(action.intensity());

        let applied = self
            .snapshot_policies()
            .and_then(|policies| self.throttle(target).map(|()| policies));
        match applied {
            Ok(policies) => {
                state.percent = target;
                state.saved.insert(
                    action_id.to_string(),
                    SavedState {
                        percent: previous,
                        policies,
                    },
                );
                ActionResult::succeeded(action_id)
                    .with_values(
                        Some(ObservedValue::FrequencyPercent(previous)),
                        Some(ObservedValue::FrequencyPercent(target)),
                    )
                    .with_savings(action.estimated_savings())
                    .with_impact(action.performance_impact())
            }
            Err(e) => ActionResult::failed(action_id, e),
        }
    }

    fn revert(&self, action_id: &str) -> ActionResult {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(saved) = state.saved.get(action_id).cloned() else {
            return ActionResult::failed(
                action_id,
                ActuationError::NotFound {
                    action_id: action_id.to_string(),
                },
            );
        };

        match Self::restore(&saved.policies) {
            Ok(()) => {
                let before = state.percent;
                state.percent = saved.percent;
                state.saved.remove(action_id);
                ActionResult::succeeded(action_id).with_values(
                    Some(ObservedValue::FrequencyPercent(before)),
                    Some(ObservedValue::FrequencyPercent(saved.percent)),
                )
            }
            Err(e) => ActionResult::failed(action_id, e),
        }
    }

    fn current_state(&self) -> BackendState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let governor = self
            .cpufreq_dirs
            .first()
            .and_then(|d| read_value(&d.join("scaling_governor")).ok());
        BackendState::from([
            ("max_freq_percent".to_string(), json!(state.percent)),
            ("governor".to_string(), json!(governor)),
            ("cpu_count".to_string(), json!(self.cpufreq_dirs.len())),
            ("simulated".to_string(), json!(self.cpufreq_dirs.is_empty())),
        ])
    }
}
