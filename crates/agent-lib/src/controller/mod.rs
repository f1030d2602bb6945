//! Closed-loop battery optimization controller
//!
//! The controller runs two tokio tasks while started:
//! - a metrics producer that samples the [`MetricsSource`] on a fixed
//!   interval, runs the emergency watchdog and feeds a bounded decision
//!   queue
//! - a decision consumer that debounces the queue to at most one decision
//!   per `decision_interval`, runs decide -> filter -> apply, then drops
//!   any stale snapshots
//!
//! Control-API calls (feedback, mode changes, reverts) come from the
//! caller's task and only touch state behind short-lived locks.

mod diagnostics;
mod events;
mod loops;
mod records;


pub use diagnostics::DiagnosticsExport;
pub use events::{DecisionEvent, EventBus, SubscriptionId};
pub use loops::{emergency_actions, QUEUE_POLL_TIMEOUT};
pub use records::{
    DecisionRecord, PerformanceStatistics, UserFeedback, DECISION_HISTORY_LIMIT,
    DECISION_HISTORY_RETAIN, METRICS_HISTORY_LIMIT, STATISTICS_WINDOW,
};

use crate::collector::{now_ms, MetricsSource};
use crate::config::{OptimizerConfig, UserPreferences};
use crate::decision::{DecisionEngine, FeedbackRecord, RetrainStatus};
use crate::error::ControllerError;
use crate::executor::{ActionExecutor, BatteryAware, TargetRegistry};
use crate::health::{components, HealthRegistry};
use crate::models::{ActionResult, ControllerState, MetricsSnapshot};
use crate::observability::{ControllerMetrics, StructuredLogger};
use records::{push_truncating, MetricsHistory};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Weight kept by the previous satisfaction score on each feedback
const SATISFACTION_DECAY: f64 = 0.8;

/// Controller state plus derived, read-only fields
#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    #[serde(flatten)]
    pub state: ControllerState,
    pub running: bool,
    pub paused: bool,
    pub registered_apps: Vec<String>,
    pub active_optimizations: usize,
    pub current_metrics: Option<MetricsSnapshot>,
}

/// State shared between the control API and the loop tasks
pub(crate) struct Shared {
    config: RwLock<OptimizerConfig>,
    state: RwLock<ControllerState>,
    running: AtomicBool,
    paused: AtomicBool,
    feedback_sequence: AtomicU64,
    source: Arc<dyn MetricsSource>,
    engine: DecisionEngine,
    executor: ActionExecutor,
    registry: TargetRegistry,
    events: EventBus,
    metrics_history: Mutex<MetricsHistory>,
    decisions: Mutex<Vec<DecisionRecord>>,
    feedback: Mutex<Vec<UserFeedback>>,
    health: HealthRegistry,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
}

impl Shared {
    pub(crate) fn config(&self) -> RwLockReadGuard<'_, OptimizerConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn config_mut(&self) -> RwLockWriteGuard<'_, OptimizerConfig> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> RwLockReadGuard<'_, ControllerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'_, ControllerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn refresh_active_flag(&self) {
        let active = self.running.load(Ordering::SeqCst) && !self.is_paused();
        self.state_mut().active = active;
    }

    /// Revert every active action, logging each outcome
    fn revert_all(&self, reason: &str) -> Vec<ActionResult> {
        let results = self.executor.revert_all_actions();
        for result in &results {
            self.logger
                .log_action_reverted(&result.action_id, result.success, reason);
        }
        let reverted = results.iter().filter(|r| r.success).count();
        self.metrics.record_reverted(reverted);
        self.metrics.set_active_actions(self.executor.active_count());
        results
    }
}

struct RunningLoops {
    shutdown: broadcast::Sender<()>,
    producer: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

pub struct Controller {
    shared: Arc<Shared>,
    loops: tokio::sync::Mutex<Option<RunningLoops>>,
}

/// Assembles a [`Controller`] from its collaborators
pub struct ControllerBuilder {
    config: OptimizerConfig,
    source: Arc<dyn MetricsSource>,
    executor: Option<ActionExecutor>,
    engine: Option<DecisionEngine>,
    registry: TargetRegistry,
    health: HealthRegistry,
    node_name: String,
}

impl ControllerBuilder {
    /// Executor the controller drives. Defaults to one with no backends.
    pub fn executor(mut self, executor: ActionExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Decision engine. Defaults to one built from the configuration.
    pub fn engine(mut self, engine: DecisionEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Target registry shared with the executor's application backend
    pub fn registry(mut self, registry: TargetRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn build(self) -> Controller {
        let engine = self
            .engine
            .unwrap_or_else(|| DecisionEngine::new(&self.config));
        let state = ControllerState::new(self.config.optimization_mode.clone());

        Controller {
            shared: Arc::new(Shared {
                config: RwLock::new(self.config),
                state: RwLock::new(state),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                feedback_sequence: AtomicU64::new(0),
                source: self.source,
                engine,
                executor: self.executor.unwrap_or_default(),
                registry: self.registry,
                events: EventBus::new(),
                metrics_history: Mutex::new(MetricsHistory::default()),
                decisions: Mutex::new(Vec::new()),
                feedback: Mutex::new(Vec::new()),
                health: self.health,
                metrics: ControllerMetrics::new(),
                logger: StructuredLogger::new(self.node_name),
            }),
            loops: tokio::sync::Mutex::new(None),
        }
    }
}

impl Controller {
    pub fn builder(config: OptimizerConfig, source: Arc<dyn MetricsSource>) -> ControllerBuilder {
        ControllerBuilder {
            config,
            source,
            executor: None,
            engine: None,
            registry: TargetRegistry::new(),
            health: HealthRegistry::new(),
            node_name: "localhost".to_string(),
        }
    }

    /// Spawn the producer and consumer loops. Starting a running
    /// controller is a no-op.
    pub async fn start(&self) -> Result<(), ControllerError> {
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            debug!("Controller already running");
            return Ok(());
        }

        let (model_path, queue_capacity, mode) = {
            let config = self.shared.config();
            (
                config.model_path.clone(),
                config.queue_capacity.max(1),
                self.shared.state().optimization_mode.clone(),
            )
        };
        if let Some(dir) = Path::new(&model_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            fs::create_dir_all(dir).map_err(|e| {
                ControllerError::Startup(format!(
                    "cannot create model directory {}: {e}",
                    dir.display()
                ))
            })?;
        }

        for name in components::ALL {
            self.shared.health.register(name).await;
        }

        let (shutdown, _) = broadcast::channel(1);
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.refresh_active_flag();

        let producer = tokio::spawn(loops::run_producer(
            self.shared.clone(),
            queue_tx,
            shutdown.subscribe(),
        ));
        let consumer = tokio::spawn(loops::run_consumer(
            self.shared.clone(),
            queue_rx,
            shutdown.subscribe(),
        ));
        *loops = Some(RunningLoops {
            shutdown,
            producer,
            consumer,
        });

        let version = self.shared.engine.classifier_version();
        self.shared.metrics.set_classifier_version(&version);
        self.shared.health.set_ready(true).await;
        self.shared.logger.log_controller_started(&mode, &version);
        Ok(())
    }

    /// Signal both loops, wait (bounded) for the decision loop to finish
    /// its iteration, then revert every active action. Returns the revert
    /// results; stopping a stopped controller returns none.
    pub async fn stop(&self) -> Vec<ActionResult> {
        let Some(loops) = self.loops.lock().await.take() else {
            return Vec::new();
        };

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.refresh_active_flag();
        self.shared.health.set_ready(false).await;
        // Receivers may already be gone if a loop exited on its own
        let _ = loops.shutdown.send(());

        let timeout = self.shared.config().stop_period();
        match tokio::time::timeout(timeout, loops.consumer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Decision loop terminated abnormally"),
            Err(_) => warn!(
                timeout_secs = timeout.as_secs_f64(),
                "Decision loop did not stop in time"
            ),
        }
        if tokio::time::timeout(timeout, loops.producer).await.is_err() {
            warn!("Metrics producer did not stop in time");
        }

        let results = self.shared.revert_all("controller_stopped");
        let failed = results.iter().filter(|r| !r.success).count();
        self.shared
            .logger
            .log_controller_stopped(results.len() - failed, failed);
        results
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Record user feedback: smooth the satisfaction score and forward a
    /// derived outcome to the learning loop
    pub fn provide_feedback(
        &self,
        satisfaction: f64,
        performance_acceptable: bool,
        battery_improvement: bool,
        comments: impl Into<String>,
    ) -> RetrainStatus {
        let shared = &self.shared;
        let satisfaction = if satisfaction.is_nan() {
            0.0
        } else {
            satisfaction.clamp(0.0, 1.0)
        };
        let now = now_ms();

        let feedback = {
            let mut state = shared.state_mut();
            state.user_satisfaction = state.user_satisfaction * SATISFACTION_DECAY
                + satisfaction * (1.0 - SATISFACTION_DECAY);
            UserFeedback {
                timestamp_ms: now,
                satisfaction,
                performance_acceptable,
                battery_improvement,
                comments: comments.into(),
                optimization_mode: state.optimization_mode.clone(),
                actions_applied: state.actions_applied,
            }
        };
        push_truncating(
            &mut *shared.feedback.lock().unwrap_or_else(PoisonError::into_inner),
            feedback.clone(),
        );

        let success = performance_acceptable && battery_improvement;
        let sequence = shared.feedback_sequence.fetch_add(1, Ordering::Relaxed);
        let previous_version = shared.engine.classifier_version();
        let status = shared.engine.provide_feedback(FeedbackRecord {
            action_id: format!("session_{now}_{sequence}"),
            success,
            energy_savings: if battery_improvement { 10.0 } else { 0.0 },
            performance_impact: if performance_acceptable { 0.1 } else { 0.3 },
            user_satisfaction: satisfaction,
            timestamp_ms: now,
        });

        match &status {
            RetrainStatus::Retrained { version, samples } => {
                shared.metrics.record_retrain(true);
                shared.metrics.set_classifier_version(version);
                shared
                    .logger
                    .log_model_retrained(&previous_version, version, *samples);
            }
            RetrainStatus::Failed(reason) => {
                shared.metrics.record_retrain(false);
                shared
                    .logger
                    .log_model_retrain_failed(&previous_version, reason);
            }
            RetrainStatus::NotDue => {}
        }

        let smoothed = shared.state().user_satisfaction;
        shared.logger.log_user_feedback(satisfaction, smoothed, success);
        shared.events.publish_feedback(&feedback);
        status
    }

    pub fn set_optimization_mode(&self, mode: &str) -> Result<(), ControllerError> {
        if self.shared.config().mode(mode).is_none() {
            return Err(ControllerError::UnknownMode(mode.to_string()));
        }
        let previous = std::mem::replace(
            &mut self.shared.state_mut().optimization_mode,
            mode.to_string(),
        );
        info!(previous = %previous, mode = %mode, "Optimization mode changed");
        Ok(())
    }

    /// Apply runtime preferences. An unknown mode rejects the whole set;
    /// out-of-range numbers fall back to their defaults.
    pub fn load_user_preferences(&self, preferences: &UserPreferences) -> Result<(), ControllerError> {
        if let Some(mode) = &preferences.optimization_mode {
            if self.shared.config().mode(mode).is_none() {
                return Err(ControllerError::UnknownMode(mode.clone()));
            }
        }

        {
            let mut config = self.shared.config_mut();
            let mut updated = config.clone();
            if let Some(threshold) = preferences.emergency_threshold {
                updated.emergency_battery_threshold = threshold;
            }
            if let Some(impact) = preferences.max_performance_impact {
                updated.max_performance_impact = impact;
            }
            if let Some(interval) = preferences.decision_interval {
                updated.decision_interval = interval;
            }
            *config = updated.sanitized();
        }

        if let Some(mode) = &preferences.optimization_mode {
            self.set_optimization_mode(mode)?;
        }
        info!("Loaded user preferences");
        Ok(())
    }

    /// Skip decision cycles until resumed. The emergency watchdog keeps
    /// running.
    pub fn pause_optimization(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.refresh_active_flag();
        info!("Optimization paused");
    }

    pub fn resume_optimization(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.refresh_active_flag();
        info!("Optimization resumed");
    }

    /// Revert every active action immediately
    pub fn emergency_revert(&self) -> Vec<ActionResult> {
        warn!("Emergency revert triggered");
        let results = self.shared.revert_all("emergency_revert");
        let reverted = results.iter().filter(|r| r.success).count();
        warn!(reverted, total = results.len(), "Emergency revert complete");
        results
    }

    pub fn revert_action(&self, action_id: &str) -> ActionResult {
        let result = self.shared.executor.revert_action(action_id);
        self.shared
            .logger
            .log_action_reverted(action_id, result.success, "manual");
        if result.success {
            self.shared.metrics.record_reverted(1);
        }
        self.shared
            .metrics
            .set_active_actions(self.shared.executor.active_count());
        result
    }

    pub fn register_target_application(&self, name: impl Into<String>, app: Arc<dyn BatteryAware>) {
        self.shared.registry.register(name, app);
    }

    pub fn unregister_target_application(&self, name: &str) -> bool {
        self.shared.registry.unregister(name)
    }

    pub fn state(&self) -> ControllerState {
        self.shared.state().clone()
    }

    pub fn current_state(&self) -> StateView {
        StateView {
            state: self.state(),
            running: self.is_running(),
            paused: self.shared.is_paused(),
            registered_apps: self.shared.registry.names(),
            active_optimizations: self.shared.executor.active_count(),
            current_metrics: self.current_metrics(),
        }
    }

    pub fn current_metrics(&self) -> Option<MetricsSnapshot> {
        self.shared
            .metrics_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest()
            .cloned()
    }

    /// Up to `limit` most recent snapshots, oldest first
    pub fn metrics_history(&self, limit: usize) -> Vec<MetricsSnapshot> {
        self.shared
            .metrics_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(limit)
    }

    pub fn decision_history(&self) -> Vec<DecisionRecord> {
        self.shared
            .decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn feedback_history(&self) -> Vec<UserFeedback> {
        self.shared
            .feedback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn performance_statistics(&self) -> Option<PerformanceStatistics> {
        let decisions = self
            .shared
            .decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let feedback_count = self
            .shared
            .feedback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        PerformanceStatistics::summarize(
            &decisions,
            self.shared.state().user_satisfaction,
            feedback_count,
        )
    }

    pub fn config(&self) -> OptimizerConfig {
        self.shared.config().clone()
    }

    pub fn export_diagnostics(&self, path: &Path) -> Result<(), ControllerError> {
        let export = DiagnosticsExport {
            configuration: self.config(),
            current_state: self.current_state(),
            performance_history: self.decision_history(),
            user_feedback_history: self.feedback_history(),
            performance_statistics: self.performance_statistics(),
            export_timestamp_ms: now_ms(),
        };
        export.write_to(path)?;
        info!(path = %path.display(), "Exported diagnostics");
        Ok(())
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.shared.executor
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.shared.engine
    }

    pub fn health(&self) -> HealthRegistry {
        self.shared.health.clone()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // Loops hold their own Arc; tell them to exit if stop() was skipped
        if let Some(loops) = self.loops.get_mut().take() {
            let _ = loops.shutdown.send(());
        }
    }
}
