//! Action executor
//!
//! Owns the lifecycle of applied actions. Each action is routed by kind to
//! its domain's [`ActuatorBackend`]; successes are tracked in the active
//! map until reverted, and every apply result lands in a bounded history.
//!
//! A single mutex guards backends, the active map and the history, so a
//! batch is never observed half-applied.

mod application;
mod backend;
mod display;
mod network;
mod processor;

pub use application::{
    throttled_nice, ApplicationBackend, BatteryAware, ProcessControl, SystemProcessControl,
    TargetRegistry,
};
pub use backend::{ActuatorBackend, BackendState};
pub use display::{reduced_brightness, DisplayBackend, DEFAULT_BRIGHTNESS, MIN_BRIGHTNESS};
pub use network::{bandwidth_limit, default_route_interface, NetworkBackend};
pub use processor::{max_frequency_percent, ProcessorBackend};

use crate::error::ActuationError;
use crate::models::{ActionResult, Domain, OptimizationAction};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// History length that triggers truncation
pub const HISTORY_LIMIT: usize = 1000;

/// Entries kept after truncation
pub const HISTORY_RETAIN: usize = 500;

/// An applied, not yet reverted action
#[derive(Debug, Clone, Serialize)]
pub struct ActiveActionRecord {
    pub action: OptimizationAction,
    pub result: ActionResult,
    pub applied_at: DateTime<Utc>,
    #[serde(skip)]
    sequence: u64,
}

struct BackendSlot {
    backend: Box<dyn ActuatorBackend>,
    enabled: bool,
}

#[derive(Default)]
struct ExecutorInner {
    backends: BTreeMap<Domain, BackendSlot>,
    active: HashMap<String, ActiveActionRecord>,
    history: Vec<ActionResult>,
}

pub struct ActionExecutor {
    inner: Mutex<ExecutorInner>,
    sequence: AtomicU64,
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionExecutor {
    /// Executor with no backends registered
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ExecutorInner::default()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Executor with the platform backends for this host. Display and
    /// processor fall back to simulation when their sysfs files are absent.
    pub fn for_host(
        sys_root: &Path,
        proc_root: &Path,
        registry: TargetRegistry,
        target: Option<String>,
    ) -> Self {
        let executor = Self::new();
        executor.register_backend(Box::new(DisplayBackend::detect(sys_root)));
        executor.register_backend(Box::new(ProcessorBackend::detect(sys_root)));
        executor.register_backend(Box::new(NetworkBackend::new(proc_root)));
        executor.register_backend(Box::new(
            ApplicationBackend::new(registry, Box::new(SystemProcessControl::new(proc_root)))
                .with_target(target),
        ));
        executor
    }

    /// Register (or replace) the backend for its domain. New backends start
    /// enabled.
    pub fn register_backend(&self, backend: Box<dyn ActuatorBackend>) {
        let domain = backend.domain();
        self.lock().backends.insert(
            domain,
            BackendSlot {
                backend,
                enabled: true,
            },
        );
        info!(domain = %domain, "Registered actuator backend");
    }

    pub fn enable_domain(&self, domain: Domain) -> bool {
        self.set_enabled(domain, true)
    }

    pub fn disable_domain(&self, domain: Domain) -> bool {
        self.set_enabled(domain, false)
    }

    fn set_enabled(&self, domain: Domain, enabled: bool) -> bool {
        match self.lock().backends.get_mut(&domain) {
            Some(slot) => {
                slot.enabled = enabled;
                info!(domain = %domain, enabled, "Actuator backend toggled");
                true
            }
            None => false,
        }
    }

    fn next_id(&self, action: &OptimizationAction) -> (String, u64) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        (
            format!("{}-{}-{}", action.target(), action.kind(), sequence),
            sequence,
        )
    }

    /// Apply each action in order, continuing past failures
    pub fn apply_actions(&self, actions: &[OptimizationAction]) -> Vec<ActionResult> {
        let mut inner = self.lock();
        let mut results = Vec::with_capacity(actions.len());

        for action in actions {
            let (action_id, sequence) = self.next_id(action);
            let domain = action.kind().domain();

            let result = match inner.backends.get(&domain) {
                None => ActionResult::failed(
                    &action_id,
                    ActuationError::Unroutable {
                        action: action.kind(),
                        domain,
                    },
                ),
                Some(slot) if !slot.enabled => {
                    ActionResult::failed(&action_id, ActuationError::DomainDisabled { domain })
                }
                Some(slot) => slot.backend.apply(&action_id, action),
            };

            if result.success {
                info!(action_id = %result.action_id, kind = %action.kind(), "Applied action");
                inner.active.insert(
                    result.action_id.clone(),
                    ActiveActionRecord {
                        action: action.clone(),
                        result: result.clone(),
                        applied_at: Utc::now(),
                        sequence,
                    },
                );
            } else {
                warn!(
                    action_id = %result.action_id,
                    kind = %action.kind(),
                    error = ?result.error,
                    "Failed to apply action"
                );
            }
            results.push(result);
        }

        inner.history.extend(results.iter().cloned());
        if inner.history.len() > HISTORY_LIMIT {
            let excess = inner.history.len() - HISTORY_RETAIN;
            inner.history.drain(..excess);
        }

        results
    }

    pub fn revert_action(&self, action_id: &str) -> ActionResult {
        let mut inner = self.lock();
        Self::revert_locked(&mut inner, action_id)
    }

    fn revert_locked(inner: &mut ExecutorInner, action_id: &str) -> ActionResult {
        let Some(record) = inner.active.get(action_id) else {
            return ActionResult::failed(
                action_id,
                ActuationError::NotFound {
                    action_id: action_id.to_string(),
                },
            );
        };

        let domain = record.action.kind().domain();
        let result = match inner.backends.get(&domain) {
            Some(slot) => slot.backend.revert(action_id),
            None => ActionResult::failed(
                action_id,
                ActuationError::Unroutable {
                    action: record.action.kind(),
                    domain,
                },
            ),
        };

        if result.success {
            inner.active.remove(action_id);
            info!(action_id, "Reverted action");
        } else {
            warn!(action_id, error = ?result.error, "Failed to revert action");
        }
        result
    }

    /// Revert every active action, most recent first
    pub fn revert_all_actions(&self) -> Vec<ActionResult> {
        let mut inner = self.lock();
        let mut ids: Vec<(u64, String)> = inner
            .active
            .iter()
            .map(|(id, record)| (record.sequence, id.clone()))
            .collect();
        ids.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let results: Vec<ActionResult> = ids
            .iter()
            .map(|(_, id)| Self::revert_locked(&mut inner, id))
            .collect();
        info!(count = results.len(), "Reverted all actions");
        results
    }

    /// Active actions in apply order
    pub fn active_actions(&self) -> Vec<(String, ActiveActionRecord)> {
        let inner = self.lock();
        let mut active: Vec<_> = inner
            .active
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        active.sort_by_key(|(_, record)| record.sequence);
        active
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// The most recent `limit` results, oldest first
    pub fn action_history(&self, limit: usize) -> Vec<ActionResult> {
        let inner = self.lock();
        let start = inner.history.len().saturating_sub(limit);
        inner.history[start..].to_vec()
    }

    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    /// Each backend's reported state plus its enabled flag
    pub fn system_state(&self) -> BTreeMap<Domain, BackendState> {
        let inner = self.lock();
        inner
            .backends
            .iter()
            .map(|(domain, slot)| {
                let mut state = slot.backend.current_state();
                state.insert("enabled".to_string(), serde_json::json!(slot.enabled));
                (*domain, state)
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, ExecutorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionKind, ObservedValue};
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// Backend whose revert can be made to fail
    struct FlakyBackend {
        domain: Domain,
        fail_revert: Arc<AtomicBool>,
    }

    impl ActuatorBackend for FlakyBackend {
        fn domain(&self) -> Domain {
            self.domain
        }

        fn apply(&self, action_id: &str, action: &OptimizationAction) -> ActionResult {
            ActionResult::succeeded(action_id).with_savings(action.estimated_savings())
        }

        fn revert(&self, action_id: &str) -> ActionResult {
            if self.fail_revert.load(Ordering::SeqCst) {
                ActionResult::failed(action_id, ActuationError::backend("stuck"))
            } else {
                ActionResult::succeeded(action_id)
            }
        }

        fn current_state(&self) -> BackendState {
            BackendState::from([("flaky".to_string(), json!(true))])
        }
    }

    fn simulated_executor() -> ActionExecutor {
        let executor = ActionExecutor::new();
        executor.register_backend(Box::new(DisplayBackend::simulated(80)));
        executor.register_backend(Box::new(ProcessorBackend::simulated()));
        executor.register_backend(Box::new(NetworkBackend::new("/nonexistent")));
        executor
    }

    fn brightness(intensity: f64) -> OptimizationAction {
        OptimizationAction::new(ActionKind::BrightnessAdjust, intensity, 10.0, 0.2, 0.9)
    }

    fn cpu(intensity: f64) -> OptimizationAction {
        OptimizationAction::new(ActionKind::CpuThrottle, intensity, 20.0, 0.5, 0.9)
    }

    #[test]
    fn test_apply_tracks_successes_and_continues_past_failures() {
        let executor = simulated_executor();
        let actions = vec![
            brightness(0.3),
            OptimizationAction::new(ActionKind::AppThrottle, 0.5, 5.0, 0.3, 0.9),
            cpu(0.5),
        ];

        let results = executor.apply_actions(&actions);

        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(matches!(
            results[1].error,
            Some(ActuationError::Unroutable {
                domain: Domain::Application,
                ..
            })
        ));
        assert!(results[2].success);
        assert_eq!(executor.active_count(), 2);
        assert_eq!(executor.history_len(), 3);
    }

    #[test]
    fn test_action_ids_are_unique() {
        let executor = simulated_executor();
        let results = executor.apply_actions(&[brightness(0.1), brightness(0.1)]);
        assert_ne!(results[0].action_id, results[1].action_id);
        assert!(results[0].action_id.starts_with("display-brightness_adjust-"));
    }

    #[test]
    fn test_brightness_round_trip_through_executor() {
        let executor = simulated_executor();
        let result = executor.apply_actions(&[brightness(0.3)]).remove(0);
        assert_eq!(result.new_value, Some(ObservedValue::Brightness(65)));

        let reverted = executor.revert_action(&result.action_id);

        assert!(reverted.success);
        assert_eq!(reverted.new_value, Some(ObservedValue::Brightness(80)));
        assert_eq!(executor.active_count(), 0);
    }

    #[test]
    fn test_revert_unknown_id_is_not_found() {
        let executor = simulated_executor();
        let result = executor.revert_action("display-brightness_adjust-999");
        assert!(matches!(result.error, Some(ActuationError::NotFound { .. })));
    }

    #[test]
    fn test_failed_revert_keeps_record() {
        let executor = ActionExecutor::new();
        let fail_revert = Arc::new(AtomicBool::new(true));
        executor.register_backend(Box::new(FlakyBackend {
            domain: Domain::Display,
            fail_revert: fail_revert.clone(),
        }));
        let id = executor.apply_actions(&[brightness(0.2)]).remove(0).action_id;

        assert!(!executor.revert_action(&id).success);
        assert_eq!(executor.active_count(), 1);

        fail_revert.store(false, Ordering::SeqCst);
        assert!(executor.revert_action(&id).success);
        assert_eq!(executor.active_count(), 0);
    }

    #[test]
    fn test_disabled_domain_is_reported() {
        let executor = simulated_executor();
        assert!(executor.disable_domain(Domain::Processor));
        assert!(!executor.disable_domain(Domain::Application));

        let result = executor.apply_actions(&[cpu(0.5)]).remove(0);
        assert_eq!(
            result.error,
            Some(ActuationError::DomainDisabled {
                domain: Domain::Processor
            })
        );

        executor.enable_domain(Domain::Processor);
        assert!(executor.apply_actions(&[cpu(0.5)])[0].success);
        assert_eq!(executor.system_state()[&Domain::Processor]["enabled"], json!(true));
    }

    #[test]
    fn test_revert_all_returns_one_result_per_action() {
        let executor = simulated_executor();
        executor.apply_actions(&[brightness(0.3), cpu(0.4), brightness(0.2), cpu(0.8)]);
        assert_eq!(executor.active_count(), 4);

        let results = executor.revert_all_actions();

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(executor.active_count(), 0);
        // Stacked brightness cuts unwind to the original value
        assert_eq!(results[3].new_value, Some(ObservedValue::Brightness(80)));
    }

    #[test]
    fn test_revert_all_continues_past_failures() {
        let executor = ActionExecutor::new();
        let fail_revert = Arc::new(AtomicBool::new(true));
        executor.register_backend(Box::new(FlakyBackend {
            domain: Domain::Display,
            fail_revert,
        }));
        executor.register_backend(Box::new(ProcessorBackend::simulated()));
        executor.apply_actions(&[brightness(0.2), cpu(0.5)]);

        let results = executor.revert_all_actions();

        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.success).count(), 1);
        assert_eq!(executor.active_count(), 1);
    }

    #[test]
    fn test_history_truncates_to_most_recent() {
        let executor = ActionExecutor::new();
        for _ in 0..1001 {
            executor.apply_actions(&[brightness(0.1)]);
        }

        assert_eq!(executor.history_len(), HISTORY_RETAIN);
        let history = executor.action_history(HISTORY_RETAIN);
        assert!(history
            .last()
            .unwrap()
            .action_id
            .ends_with("-1001"));
        assert!(history[0].action_id.ends_with("-502"));
        assert_eq!(executor.action_history(10).len(), 10);
    }
}
