//! Producer and consumer tasks

use super::events::DecisionEvent;
use super::records::{push_truncating, DecisionRecord};
use super::Shared;
use crate::collector::now_ms;
use crate::health::components;
use crate::models::{ActionKind, ActionResult, BatteryTier, MetricsSnapshot, OptimizationAction};
use crate::policy;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Longest the consumer blocks on the queue before re-checking shutdown
pub const QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Fixed bundle applied, unfiltered, on entering emergency mode
pub fn emergency_actions() -> Vec<OptimizationAction> {
    vec![
        OptimizationAction::new(ActionKind::BrightnessAdjust, 0.9, 25.0, 0.3, 0.95),
        OptimizationAction::new(ActionKind::CpuThrottle, 0.8, 30.0, 0.7, 0.9),
    ]
}

/// Summary of one decide -> filter -> apply pass
struct CycleOutcome {
    applied: usize,
    failed: usize,
}

pub(super) async fn run_producer(
    shared: Arc<Shared>,
    queue: mpsc::Sender<MetricsSnapshot>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = shared
        .config()
        .monitoring_period()
        .max(Duration::from_millis(1));
    info!(
        interval_ms = period.as_millis() as u64,
        "Starting metrics producer"
    );

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => shared.producer_tick(&queue).await,
            _ = shutdown.recv() => {
                info!("Shutting down metrics producer");
                break;
            }
        }
    }
}

pub(super) async fn run_consumer(
    shared: Arc<Shared>,
    mut queue: mpsc::Receiver<MetricsSnapshot>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("Starting decision loop");
    let mut last_decision: Option<Instant> = None;

    loop {
        let snapshot = tokio::select! {
            _ = shutdown.recv() => break,
            received = timeout(QUEUE_POLL_TIMEOUT, queue.recv()) => match received {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => {
                    debug!("Decision queue closed");
                    break;
                }
                Err(_) => continue,
            },
        };

        let decision_period = shared.config().decision_period();
        if last_decision.is_some_and(|at| at.elapsed() < decision_period) {
            continue;
        }
        if shared.is_paused() {
            debug!("Optimization paused, skipping decision");
            continue;
        }

        shared.decision_cycle(&snapshot).await;
        last_decision = Some(Instant::now());

        // Only the freshest state matters for the next cycle
        let mut dropped = 0usize;
        while queue.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Dropped stale snapshots");
        }
    }

    info!("Decision loop stopped");
}

impl Shared {
    /// Sample once, update state, run the emergency watchdog and enqueue.
    /// A degraded snapshot is recorded and published but never reaches the
    /// decision loop.
    pub(super) async fn producer_tick(&self, queue: &mpsc::Sender<MetricsSnapshot>) {
        let (snapshot, sensed) = match self.source.collect().await {
            Ok(snapshot) => {
                self.health.set_healthy(components::MONITOR).await;
                (snapshot, true)
            }
            Err(e) => {
                warn!(error = %e, "Metrics collection failed, using degraded snapshot");
                self.metrics.inc_sensing_errors();
                self.health
                    .set_degraded(components::MONITOR, e.to_string())
                    .await;
                (MetricsSnapshot::degraded(now_ms()), false)
            }
        };

        self.metrics_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(snapshot.clone());

        // Fallback values say nothing about the device
        if sensed {
            self.state_mut().battery_tier = Some(BatteryTier::from_percent(snapshot.battery_percent));
            self.metrics.set_battery_percent(snapshot.battery_percent);
            self.check_emergency(&snapshot);

            match queue.try_send(snapshot.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("Decision queue full, dropping snapshot"),
                Err(TrySendError::Closed(_)) => debug!("Decision queue closed"),
            }
        }

        self.events.publish_metrics(&snapshot);
    }

    /// Enter or leave emergency mode on a threshold crossing. Entering
    /// applies [`emergency_actions`] without the mode filter; leaving takes
    /// no corrective action.
    pub(super) fn check_emergency(&self, snapshot: &MetricsSnapshot) {
        let threshold = self.config().emergency_battery_threshold;
        let below = snapshot.battery_percent <= threshold;

        let transition = {
            let mut state = self.state_mut();
            if below == state.emergency {
                None
            } else {
                state.emergency = below;
                Some(below)
            }
        };

        match transition {
            Some(true) => {
                let results = self.executor.apply_actions(&emergency_actions());
                let applied = results.iter().filter(|r| r.success).count();
                self.metrics.inc_emergency_activations();
                self.metrics.record_apply(applied, results.len() - applied);
                self.metrics.set_active_actions(self.executor.active_count());
                self.logger
                    .log_emergency_entered(snapshot.battery_percent, threshold, applied);
                for result in &results {
                    self.events.publish_action(result);
                }
            }
            Some(false) => self.logger.log_emergency_exited(snapshot.battery_percent),
            None => {}
        }
    }

    pub(super) async fn decision_cycle(&self, snapshot: &MetricsSnapshot) {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.decide_and_apply(snapshot)));
        self.metrics
            .observe_decision_latency(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Some(cycle)) => {
                self.health.set_healthy(components::DECISION_ENGINE).await;
                if cycle.failed > 0 {
                    self.health
                        .set_degraded(
                            components::EXECUTOR,
                            format!("{}/{} actions failed", cycle.failed, cycle.applied + cycle.failed),
                        )
                        .await;
                } else {
                    self.health.set_healthy(components::EXECUTOR).await;
                }
            }
            Ok(None) => self.health.set_healthy(components::DECISION_ENGINE).await,
            Err(_) => {
                error!("Decision cycle panicked, skipping");
                self.health
                    .set_degraded(components::DECISION_ENGINE, "decision cycle panicked")
                    .await;
            }
        }
    }

    /// Returns `None` when nothing reached the executor
    fn decide_and_apply(&self, snapshot: &MetricsSnapshot) -> Option<CycleOutcome> {
        let proposed = self.engine.decide(snapshot);
        let mode_name = {
            let mut state = self.state_mut();
            state.last_decision_ms = Some(now_ms());
            state.optimization_mode.clone()
        };
        if proposed.is_empty() {
            debug!("No optimizations proposed");
            return None;
        }

        let (mode, max_impact) = {
            let config = self.config();
            (config.mode(&mode_name), config.max_performance_impact)
        };
        let Some(mode) = mode else {
            warn!(mode = %mode_name, "Active mode is not configured, skipping decision");
            return None;
        };

        let allowed = policy::filter(proposed.clone(), &mode, max_impact);
        if allowed.is_empty() {
            debug!(proposed = proposed.len(), mode = %mode_name, "No action passed the mode filter");
            return None;
        }

        let results = self.executor.apply_actions(&allowed);
        let succeeded: Vec<&ActionResult> = results.iter().filter(|r| r.success).collect();
        let savings: f64 = succeeded.iter().map(|r| r.estimated_savings).sum();
        let applied = succeeded.len();

        let emergency = {
            let mut state = self.state_mut();
            state.actions_applied += applied as u64;
            state.total_savings += savings;
            state.emergency
        };

        self.metrics.record_apply(applied, results.len() - applied);
        self.metrics.set_active_actions(self.executor.active_count());
        self.logger
            .log_decision(proposed.len(), allowed.len(), applied, savings, &mode_name);

        push_truncating(
            &mut *self.decisions.lock().unwrap_or_else(PoisonError::into_inner),
            DecisionRecord {
                timestamp_ms: now_ms(),
                battery_percent: snapshot.battery_percent,
                actions_requested: proposed.len(),
                actions_applied: applied,
                estimated_savings: savings,
                optimization_mode: mode_name,
                emergency,
            },
        );

        let failed = results.len() - applied;
        let event = DecisionEvent {
            snapshot: snapshot.clone(),
            proposed,
            allowed,
            results,
        };
        self.events.publish_decision(&event);
        for result in &event.results {
            self.events.publish_action(result);
        }

        Some(CycleOutcome { applied, failed })
    }
}
