//! Application backend
//!
//! `app_throttle` goes to a registered [`BatteryAware`] target when one
//! exists; otherwise the matching processes are reniced. `background_limit`
//! records a cap on background activity.

use super::backend::{ActuatorBackend, BackendState};
use crate::collector::{find_processes, ProcessEntry};
use crate::error::ActuationError;
use crate::models::{ActionKind, ActionResult, Domain, ObservedValue, OptimizationAction};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Highest (least favourable) nice value
const MAX_NICE: i32 = 19;

/// Nice value after throttling at `intensity`
pub fn throttled_nice(current: i32, intensity: f64) -> i32 {
    (current + (intensity * 10.0) as i32).min(MAX_NICE)
}

/// Capability of an application that can adapt itself to battery mode
pub trait BatteryAware: Send + Sync {
    fn optimize_for_battery(&self, action: &OptimizationAction) -> ActionResult;

    /// Leave battery mode
    fn restore(&self) -> Result<(), ActuationError> {
        Ok(())
    }
}

/// Registered target applications, shared between the controller and the
/// application backend
#[derive(Clone, Default)]
pub struct TargetRegistry {
    targets: Arc<RwLock<BTreeMap<String, Arc<dyn BatteryAware>>>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, target: Arc<dyn BatteryAware>) {
        let name = name.into();
        info!(app = %name, "Registered target application");
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, target);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BatteryAware>> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Process priority primitives
pub trait ProcessControl: Send + Sync {
    fn find(&self, name: &str) -> Vec<ProcessEntry>;

    fn set_nice(&self, pid: u32, nice: i32) -> Result<(), ActuationError>;
}

/// Finds processes through /proc and changes priority with `setpriority(2)`
pub struct SystemProcessControl {
    proc_root: PathBuf,
}

impl SystemProcessControl {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl ProcessControl for SystemProcessControl {
    fn find(&self, name: &str) -> Vec<ProcessEntry> {
        find_processes(&self.proc_root, name)
    }

    fn set_nice(&self, pid: u32, nice: i32) -> Result<(), ActuationError> {
        let nice = nice.clamp(-20, MAX_NICE);
        // SAFETY: plain integer arguments, no memory is shared with the call
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
        if rc == 0 {
            Ok(())
        } else {
            Err(ActuationError::backend(format!(
                "setpriority({pid}, {nice}) failed: {}",
                std::io::Error::last_os_error()
            )))
        }
    }
}

#[derive(Debug, Clone)]
enum Saved {
    Target(String),
    Priorities(Vec<(u32, i32)>),
    BackgroundCap(Option<f64>),
}

#[derive(Default)]
struct ApplicationState {
    target: Option<String>,
    background_cap: Option<f64>,
    saved: HashMap<String, Saved>,
}

pub struct ApplicationBackend {
    registry: TargetRegistry,
    processes: Box<dyn ProcessControl>,
    state: Mutex<ApplicationState>,
}

impl ApplicationBackend {
    pub fn new(registry: TargetRegistry, processes: Box<dyn ProcessControl>) -> Self {
        Self {
            registry,
            processes,
            state: Mutex::new(ApplicationState::default()),
        }
    }

    /// Name the application `app_throttle` acts on when no registered
    /// target is chosen explicitly
    pub fn with_target(self, target: Option<String>) -> Self {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .target = target;
        self
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    fn resolve_target(&self, state: &ApplicationState) -> Option<String> {
        state
            .target
            .clone()
            .or_else(|| self.registry.names().into_iter().next())
    }

    fn throttle(&self, action_id: &str, action: &OptimizationAction) -> (ActionResult, Option<Saved>) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(app) = self.resolve_target(&state) else {
            return (
                ActionResult::failed(
                    action_id,
                    ActuationError::backend("no target application configured"),
                ),
                None,
            );
        };
        drop(state);

        if let Some(target) = self.registry.get(&app) {
            let reported = target.optimize_for_battery(action);
            let mut result = ActionResult {
                action_id: action_id.to_string(),
                ..reported
            };
            if result.success {
                result.estimated_savings = action.estimated_savings();
                return (result, Some(Saved::Target(app)));
            }
            return (result, None);
        }

        self.renice(action_id, &app, action)
    }

    fn renice(
        &self,
        action_id: &str,
        app: &str,
        action: &OptimizationAction,
    ) -> (ActionResult, Option<Saved>) {
        let mut adjusted = Vec::new();
        for process in self.processes.find(app) {
            let nice = throttled_nice(process.nice, action.intensity());
            match self.processes.set_nice(process.pid, nice) {
                Ok(()) => adjusted.push((process.pid, process.nice)),
                Err(e) => debug!(pid = process.pid, error = %e, "Skipping process"),
            }
        }

        if adjusted.is_empty() {
            return (
                ActionResult::failed(
                    action_id,
                    ActuationError::backend(format!("no processes found for application: {app}")),
                ),
                None,
            );
        }

        let count = adjusted.len();
        let result = ActionResult::succeeded(action_id)
            .with_values(
                Some(ObservedValue::Processes(count)),
                Some(ObservedValue::Text(format!(
                    "priority reduced for {count} processes"
                ))),
            )
            .with_savings(5.0 * count as f64)
            .with_impact(action.performance_impact());
        (result, Some(Saved::Priorities(adjusted)))
    }

    fn limit_background(
        &self,
        action_id: &str,
        action: &OptimizationAction,
    ) -> (ActionResult, Option<Saved>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = state.background_cap.replace(action.intensity());
        let result = ActionResult::succeeded(action_id)
            .with_values(
                Some(previous.map_or(ObservedValue::Unlimited, ObservedValue::Level)),
                Some(ObservedValue::Level(action.intensity())),
            )
            .with_savings(action.estimated_savings())
            .with_impact(action.performance_impact());
        (result, Some(Saved::BackgroundCap(previous)))
    }
}

impl ActuatorBackend for ApplicationBackend {
    fn domain(&self) -> Domain {
        Domain::Application
    }

    fn apply(&self, action_id: &str, action: &OptimizationAction) -> ActionResult {
        let (result, saved) = match action.kind() {
            ActionKind::AppThrottle => self.throttle(action_id, action),
            ActionKind::BackgroundLimit => self.limit_background(action_id, action),
            other => (
                ActionResult::failed(
                    action_id,
                    ActuationError::Unsupported {
                        action: other,
                        domain: Domain::Application,
                    },
                ),
                None,
            ),
        };

        if let Some(saved) = saved {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .saved
                .insert(action_id.to_string(), saved);
        }
        result
    }

    fn revert(&self, action_id: &str) -> ActionResult {
        let saved = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .saved
            .get(action_id)
            .cloned();
        let Some(saved) = saved else {
            return ActionResult::failed(
                action_id,
                ActuationError::NotFound {
                    action_id: action_id.to_string(),
                },
            );
        };

        let outcome = match &saved {
            Saved::Target(app) => match self.registry.get(app) {
                Some(target) => target.restore(),
                // Unregistered since; nothing left to restore
                None => Ok(()),
            },
            Saved::Priorities(processes) => {
                let mut restored = 0usize;
                for (pid, nice) in processes {
                    match self.processes.set_nice(*pid, *nice) {
                        Ok(()) => restored += 1,
                        Err(e) => warn!(pid, error = %e, "Failed to restore process priority"),
                    }
                }
                debug!(restored, total = processes.len(), "Restored process priorities");
                Ok(())
            }
            Saved::BackgroundCap(previous) => {
                self.state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .background_cap = *previous;
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {
                self.state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .saved
                    .remove(action_id);
                ActionResult::succeeded(action_id)
            }
            Err(e) => ActionResult::failed(action_id, e),
        }
    }

    fn current_state(&self) -> BackendState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        BackendState::from([
            ("registered_apps".to_string(), json!(self.registry.names())),
            ("target".to_string(), json!(state.target)),
            ("background_cap".to_string(), json!(state.background_cap)),
            ("active_optimizations".to_string(), json!(state.saved.len())),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory process table
    #[derive(Default)]
    struct MockProcesses {
        table: Mutex<Vec<ProcessEntry>>,
    }

    impl MockProcesses {
        fn with(entries: &[(u32, &str, i32)]) -> Self {
            Self {
                table: Mutex::new(
                    entries
                        .iter()
                        .map(|(pid, name, nice)| ProcessEntry {
                            pid: *pid,
                            name: name.to_string(),
                            nice: *nice,
                        })
                        .collect(),
                ),
            }
        }
    }

    impl ProcessControl for Arc<MockProcesses> {
        fn find(&self, name: &str) -> Vec<ProcessEntry> {
            let needle = name.to_lowercase();
            self.table
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.name.to_lowercase().contains(&needle))
                .cloned()
                .collect()
        }

        fn set_nice(&self, pid: u32, nice: i32) -> Result<(), ActuationError> {
            let mut table = self.table.lock().unwrap();
            let process = table
                .iter_mut()
                .find(|p| p.pid == pid)
                .ok_or_else(|| ActuationError::backend("no such process"))?;
            process.nice = nice;
            Ok(())
        }
    }

    struct RecordingApp {
        optimized: AtomicUsize,
        restored: AtomicUsize,
    }

    impl BatteryAware for RecordingApp {
        fn optimize_for_battery(&self, action: &OptimizationAction) -> ActionResult {
            self.optimized.fetch_add(1, Ordering::SeqCst);
            ActionResult::succeeded("ignored").with_values(
                Some(ObservedValue::Text("high quality".to_string())),
                Some(ObservedValue::Level(1.0 - action.intensity())),
            )
        }

        fn restore(&self) -> Result<(), ActuationError> {
            self.restored.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn throttle(intensity: f64) -> OptimizationAction {
        OptimizationAction::new(ActionKind::AppThrottle, intensity, 12.0, 0.5, 0.9)
    }

    #[test]
    fn test_throttled_nice_caps_at_19() {
        assert_eq!(throttled_nice(0, 0.6), 6);
        assert_eq!(throttled_nice(15, 0.9), 19);
    }

    #[test]
    fn test_renice_fallback_round_trip() {
        let processes = Arc::new(MockProcesses::with(&[
            (10, "firefox", 0),
            (11, "Firefox-bin", 2),
            (12, "bash", 0),
        ]));
        let backend = ApplicationBackend::new(TargetRegistry::new(), Box::new(processes.clone()))
            .with_target(Some("firefox".to_string()));

        let applied = backend.apply("application-1", &throttle(0.6));
        assert!(applied.success);
        assert_eq!(applied.previous_value, Some(ObservedValue::Processes(2)));
        assert_eq!(applied.estimated_savings, 10.0);
        let nices: Vec<i32> = processes.find("firefox").iter().map(|p| p.nice).collect();
        assert_eq!(nices, vec![6, 8]);
        assert_eq!(processes.find("bash")[0].nice, 0);

        assert!(backend.revert("application-1").success);
        let nices: Vec<i32> = processes.find("firefox").iter().map(|p| p.nice).collect();
        assert_eq!(nices, vec![0, 2]);
    }

    #[test]
    fn test_no_matching_process_fails() {
        let processes = Arc::new(MockProcesses::default());
        let backend = ApplicationBackend::new(TargetRegistry::new(), Box::new(processes))
            .with_target(Some("ghost".to_string()));
        let result = backend.apply("application-2", &throttle(0.5));
        assert!(!result.success);
        assert!(!backend.revert("application-2").success);
    }

    #[test]
    fn test_system_process_control_sets_priority_in_process() {
        let control = SystemProcessControl::new("/proc");
        let pid = std::process::id();
        let own = control
            .find("")
            .into_iter()
            .find(|p| p.pid == pid)
            .expect("test process listed in /proc");

        // Re-applying the current value needs no privilege
        control.set_nice(pid, own.nice).unwrap();

        // Above the kernel's PID_MAX_LIMIT, so never a live process
        let err = control.set_nice(4_194_305, 5).unwrap_err();
        assert!(matches!(
            &err,
            ActuationError::Backend { message } if message.starts_with("setpriority(4194305, 5)")
        ));
    }

    #[test]
    fn test_registered_target_takes_precedence() {
        let registry = TargetRegistry::new();
        let app = Arc::new(RecordingApp {
            optimized: AtomicUsize::new(0),
            restored: AtomicUsize::new(0),
        });
        registry.register("video-player", app.clone());
        let processes = Arc::new(MockProcesses::with(&[(20, "video-player", 0)]));
        let backend = ApplicationBackend::new(registry, Box::new(processes.clone()));

        let applied = backend.apply("application-3", &throttle(0.6));

        assert!(applied.success);
        assert_eq!(applied.action_id, "application-3");
        assert_eq!(applied.estimated_savings, 12.0);
        assert_eq!(app.optimized.load(Ordering::SeqCst), 1);
        assert_eq!(processes.find("video")[0].nice, 0);

        assert!(backend.revert("application-3").success);
        assert_eq!(app.restored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_background_limit_restores_previous_cap() {
        let backend = ApplicationBackend::new(
            TargetRegistry::new(),
            Box::new(Arc::new(MockProcesses::default())),
        );
        let limit = OptimizationAction::new(ActionKind::BackgroundLimit, 0.5, 8.0, 0.1, 0.7);

        let applied = backend.apply("application-4", &limit);
        assert_eq!(applied.previous_value, Some(ObservedValue::Unlimited));
        assert_eq!(backend.current_state()["background_cap"], json!(0.5));

        assert!(backend.revert("application-4").success);
        assert_eq!(backend.current_state()["background_cap"], json!(null));
    }
}
