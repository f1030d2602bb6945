//! Display backend: screen brightness

use super::backend::{ActuatorBackend, BackendState};
use crate::error::ActuationError;
use crate::models::{ActionKind, ActionResult, Domain, ObservedValue, OptimizationAction};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Lowest brightness an optimization may set
pub const MIN_BRIGHTNESS: u32 = 10;

/// Brightness assumed when no backlight can be read
pub const DEFAULT_BRIGHTNESS: u32 = 75;

/// Brightness points removed at full intensity
const MAX_REDUCTION: f64 = 50.0;

/// Brightness change for an intensity: `int(intensity * 50)` points off,
/// never below the floor
pub fn reduced_brightness(current: u32, intensity: f64) -> u32 {
    let reduction = (intensity * MAX_REDUCTION) as u32;
    current.saturating_sub(reduction).clamp(MIN_BRIGHTNESS, 100)
}

struct DisplayState {
    /// Last brightness set or observed, in percent
    current: u32,
    saved: HashMap<String, u32>,
}

pub struct DisplayBackend {
    /// Backlight device directory; `None` runs simulated
    device: Option<PathBuf>,
    state: Mutex<DisplayState>,
}

impl DisplayBackend {
    /// Use the first backlight under `<sys_root>/class/backlight`, or run
    /// simulated if there is none
    pub fn detect(sys_root: &Path) -> Self {
        let device = fs::read_dir(sys_root.join("class/backlight"))
            .ok()
            .and_then(|entries| {
                let mut dirs: Vec<PathBuf> = entries
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.join("max_brightness").exists())
                    .collect();
                dirs.sort();
                dirs.into_iter().next()
            });
        match device {
            Some(device) => Self::sysfs(device),
            None => Self::simulated(DEFAULT_BRIGHTNESS),
        }
    }

    pub fn sysfs(device: PathBuf) -> Self {
        let current = read_percent(&device).unwrap_or(DEFAULT_BRIGHTNESS);
        debug!(device = %device.display(), brightness = current, "Using sysfs backlight");
        Self {
            device: Some(device),
            state: Mutex::new(DisplayState {
                current,
                saved: HashMap::new(),
            }),
        }
    }

    pub fn simulated(initial: u32) -> Self {
        Self {
            device: None,
            state: Mutex::new(DisplayState {
                current: initial.min(100),
                saved: HashMap::new(),
            }),
        }
    }

    pub fn brightness(&self) -> u32 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.observed(&state)
    }

    fn observed(&self, state: &DisplayState) -> u32 {
        self.device
            .as_deref()
            .and_then(read_percent)
            .unwrap_or(state.current)
    }

    fn write(&self, state: &mut DisplayState, percent: u32) -> Result<(), ActuationError> {
        let percent = percent.min(100);
        if let Some(device) = &self.device {
            let max: f64 = fs::read_to_string(device.join("max_brightness"))
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| ActuationError::backend("cannot read max_brightness"))?;
            let raw = (f64::from(percent) / 100.0 * max).round() as u64;
            fs::write(device.join("brightness"), raw.to_string()).map_err(|e| {
                ActuationError::backend(format!("failed to set brightness: {e}"))
            })?;
        }
        state.current = percent;
        Ok(())
    }
}

fn read_percent(device: &Path) -> Option<u32> {
    let read = |name: &str| -> Option<f64> {
        fs::read_to_string(device.join(name))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    };
    let current = read("brightness")?;
    let max = read("max_brightness").filter(|m| *m > 0.0)?;
    Some((current / max * 100.0).round().clamp(0.0, 100.0) as u32)
}

impl ActuatorBackend for DisplayBackend {
    fn domain(&self) -> Domain {
        Domain::Display
    }

    fn apply(&self, action_id: &str, action: &OptimizationAction) -> ActionResult {
        if action.kind() != ActionKind::BrightnessAdjust {
            return ActionResult::failed(
                action_id,
                ActuationError::Unsupported {
                    action: action.kind(),
                    domain: Domain::Display,
                },
            );
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.observed(&state);
        let target = reduced_brightness(previous, action.intensity());

        match self.write(&mut state, target) {
            Ok(()) => {
                state.saved.insert(action_id.to_string(), previous);
                ActionResult::succeeded(action_id)
                    .with_values(
                        Some(ObservedValue::Brightness(previous)),
                        Some(ObservedValue::Brightness(target)),
                    )
                    .with_savings(action.estimated_savings())
                    .with_impact(action.performance_impact())
            }
            Err(e) => ActionResult::failed(action_id, e)
                .with_values(Some(ObservedValue::Brightness(previous)), None),
        }
    }

    fn revert(&self, action_id: &str) -> ActionResult {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(&previous) = state.saved.get(action_id) else {
            return ActionResult::failed(
                action_id,
                ActuationError::NotFound {
                    action_id: action_id.to_string(),
                },
            );
        };

        let before = self.observed(&state);
        match self.write(&mut state, previous) {
            Ok(()) => {
                state.saved.remove(action_id);
                ActionResult::succeeded(action_id).with_values(
                    Some(ObservedValue::Brightness(before)),
                    Some(ObservedValue::Brightness(previous)),
                )
            }
            Err(e) => ActionResult::failed(action_id, e),
        }
    }

    fn current_state(&self) -> BackendState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        BackendState::from([
            ("brightness".to_string(), json!(self.observed(&state))),
            ("simulated".to_string(), json!(self.device.is_none())),
            ("saved_states".to_string(), json!(state.saved.len())),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dim(intensity: f64) -> OptimizationAction {
        OptimizationAction::new(ActionKind::BrightnessAdjust, intensity, 10.0, 0.2, 0.9)
    }

    #[test]
    fn test_reduction_and_floor() {
        assert_eq!(reduced_brightness(80, 0.3), 65);
        assert_eq!(reduced_brightness(30, 0.9), 10);
        assert_eq!(reduced_brightness(5, 0.1), 10);
    }

    #[test]
    fn test_apply_then_revert_restores_exact_value() {
        let backend = DisplayBackend::simulated(80);

        let applied = backend.apply("display-1", &dim(0.3));
        assert!(applied.success);
        assert_eq!(applied.previous_value, Some(ObservedValue::Brightness(80)));
        assert_eq!(applied.new_value, Some(ObservedValue::Brightness(65)));
        assert_eq!(backend.brightness(), 65);

        let reverted = backend.revert("display-1");
        assert!(reverted.success);
        assert_eq!(backend.brightness(), 80);

        // Saved state is consumed by the successful revert
        let again = backend.revert("display-1");
        assert!(matches!(again.error, Some(ActuationError::NotFound { .. })));
    }

    #[test]
    fn test_sysfs_backlight_is_written() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("class/backlight/intel_backlight");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("max_brightness"), "400\n").unwrap();
        fs::write(device.join("brightness"), "320\n").unwrap();

        let backend = DisplayBackend::detect(dir.path());
        assert_eq!(backend.brightness(), 80);

        let applied = backend.apply("display-2", &dim(0.5));
        assert!(applied.success);
        assert_eq!(fs::read_to_string(device.join("brightness")).unwrap(), "220");

        assert!(backend.revert("display-2").success);
        assert_eq!(fs::read_to_string(device.join("brightness")).unwrap(), "320");
    }

    #[test]
    fn test_rejects_foreign_action_kinds() {
        let backend = DisplayBackend::simulated(50);
        let action = OptimizationAction::new(ActionKind::CpuThrottle, 0.5, 10.0, 0.3, 0.9);
        let result = backend.apply("display-3", &action);
        assert!(!result.success);
        assert!(matches!(result.error, Some(ActuationError::Unsupported { .. })));
    }

    #[test]
    fn test_missing_backlight_runs_simulated() {
        let dir = TempDir::new().unwrap();
        let backend = DisplayBackend::detect(dir.path());
        assert_eq!(backend.brightness(), DEFAULT_BRIGHTNESS);
        assert_eq!(backend.current_state()["simulated"], json!(true));
    }
}
