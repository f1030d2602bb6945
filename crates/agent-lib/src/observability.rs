//! Observability for the power agent
//!
//! Provides:
//! - Prometheus metrics for the control loop (decision latency, action
//!   counters, emergency activations, battery level, classifier version)
//! - Canonical structured log events emitted through tracing

use prometheus::{
    register_gauge, register_gauge_vec, register_histogram, register_int_counter,
    register_int_counter_vec, register_int_gauge, Gauge, GaugeVec, Histogram, IntCounter,
    IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for decision latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Registered once per process; the default registry rejects duplicates
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    decision_latency_seconds: Histogram,
    decisions_total: IntCounter,
    actions_applied: IntCounter,
    actions_failed: IntCounter,
    actions_reverted: IntCounter,
    emergency_activations: IntCounter,
    active_actions: IntGauge,
    battery_percent: Gauge,
    sensing_errors: IntCounter,
    model_retrains: IntCounterVec,
    classifier_version_info: GaugeVec,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            decision_latency_seconds: register_histogram!(
                "power_agent_decision_latency_seconds",
                "Time spent deciding, filtering and applying one cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register decision_latency_seconds"),

            decisions_total: register_int_counter!(
                "power_agent_decisions_total",
                "Decision cycles executed (after debounce)"
            )
            .expect("Failed to register decisions_total"),

            actions_applied: register_int_counter!(
                "power_agent_actions_applied_total",
                "Actions applied successfully"
            )
            .expect("Failed to register actions_applied"),

            actions_failed: register_int_counter!(
                "power_agent_actions_failed_total",
                "Actions whose apply reported failure"
            )
            .expect("Failed to register actions_failed"),

            actions_reverted: register_int_counter!(
                "power_agent_actions_reverted_total",
                "Actions reverted successfully"
            )
            .expect("Failed to register actions_reverted"),

            emergency_activations: register_int_counter!(
                "power_agent_emergency_activations_total",
                "Transitions into emergency battery mode"
            )
            .expect("Failed to register emergency_activations"),

            active_actions: register_int_gauge!(
                "power_agent_active_actions",
                "Applied actions not yet reverted"
            )
            .expect("Failed to register active_actions"),

            battery_percent: register_gauge!(
                "power_agent_battery_percent",
                "Battery charge from the latest snapshot"
            )
            .expect("Failed to register battery_percent"),

            sensing_errors: register_int_counter!(
                "power_agent_sensing_errors_total",
                "Metrics collections that failed and fell back to defaults"
            )
            .expect("Failed to register sensing_errors"),

            model_retrains: register_int_counter_vec!(
                "power_agent_model_retrains_total",
                "Classifier retraining attempts by outcome",
                &["outcome"]
            )
            .expect("Failed to register model_retrains"),

            classifier_version_info: register_gauge_vec!(
                "power_agent_classifier_version_info",
                "Currently loaded classifier version",
                &["version"]
            )
            .expect("Failed to register classifier_version_info"),
        }
    }
}

/// Handle to the process-wide controller metrics. Clones share the same
/// underlying collectors.
#[derive(Clone)]
pub struct ControllerMetrics {
    inner: &'static ControllerMetricsInner,
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new),
        }
    }

    pub fn observe_decision_latency(&self, duration_secs: f64) {
        self.inner.decision_latency_seconds.observe(duration_secs);
        self.inner.decisions_total.inc();
    }

    /// Count the outcome of an apply batch
    pub fn record_apply(&self, succeeded: usize, failed: usize) {
        self.inner.actions_applied.inc_by(succeeded as u64);
        self.inner.actions_failed.inc_by(failed as u64);
    }

    pub fn record_reverted(&self, count: usize) {
        self.inner.actions_reverted.inc_by(count as u64);
    }

    pub fn inc_emergency_activations(&self) {
        self.inner.emergency_activations.inc();
    }

    pub fn set_active_actions(&self, count: usize) {
        self.inner.active_actions.set(count as i64);
    }

    pub fn set_battery_percent(&self, percent: f64) {
        self.inner.battery_percent.set(percent);
    }

    pub fn inc_sensing_errors(&self) {
        self.inner.sensing_errors.inc();
    }

    pub fn record_retrain(&self, success: bool) {
        let outcome = if success { "succeeded" } else { "failed" };
        self.inner.model_retrains.with_label_values(&[outcome]).inc();
    }

    pub fn set_classifier_version(&self, version: &str) {
        self.inner.classifier_version_info.reset();
        self.inner
            .classifier_version_info
            .with_label_values(&[version])
            .set(1.0);
    }
}

/// Emits the agent's canonical event records
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_controller_started(&self, mode: &str, classifier_version: &str) {
        info!(
            event = "controller_started",
            node = %self.node_name,
            mode = %mode,
            classifier_version = %classifier_version,
            "Battery optimization controller started"
        );
    }

    pub fn log_controller_stopped(&self, reverted: usize, failed: usize) {
        info!(
            event = "controller_stopped",
            node = %self.node_name,
            reverted = reverted,
            revert_failures = failed,
            "Battery optimization controller stopped"
        );
    }

    pub fn log_decision(
        &self,
        proposed: usize,
        allowed: usize,
        applied: usize,
        estimated_savings: f64,
        mode: &str,
    ) {
        info!(
            event = "decision_applied",
            node = %self.node_name,
            proposed = proposed,
            allowed = allowed,
            applied = applied,
            estimated_savings = estimated_savings,
            mode = %mode,
            "Applied {}/{} optimizations",
            applied,
            proposed
        );
    }

    pub fn log_emergency_entered(&self, battery_percent: f64, threshold: f64, applied: usize) {
        warn!(
            event = "emergency_entered",
            node = %self.node_name,
            battery_percent = battery_percent,
            threshold = threshold,
            applied = applied,
            "Entering emergency battery mode"
        );
    }

    pub fn log_emergency_exited(&self, battery_percent: f64) {
        info!(
            event = "emergency_exited",
            node = %self.node_name,
            battery_percent = battery_percent,
            "Exiting emergency battery mode"
        );
    }

    pub fn log_user_feedback(&self, satisfaction: f64, smoothed: f64, success: bool) {
        info!(
            event = "user_feedback",
            node = %self.node_name,
            satisfaction = satisfaction,
            smoothed_satisfaction = smoothed,
            success = success,
            "Received user feedback"
        );
    }

    pub fn log_model_retrained(&self, old_version: &str, new_version: &str, samples: usize) {
        info!(
            event = "model_retrained",
            node = %self.node_name,
            old_version = %old_version,
            new_version = %new_version,
            samples = samples,
            "Classifier retrained"
        );
    }

    pub fn log_model_retrain_failed(&self, version: &str, reason: &str) {
        warn!(
            event = "model_retrain_failed",
            node = %self.node_name,
            version = %version,
            reason = %reason,
            "Classifier retraining failed, keeping previous model"
        );
    }

    pub fn log_action_reverted(&self, action_id: &str, success: bool, reason: &str) {
        if success {
            info!(
                event = "action_reverted",
                node = %self.node_name,
                action_id = %action_id,
                reason = %reason,
                "Reverted optimization"
            );
        } else {
            warn!(
                event = "action_reverted",
                node = %self.node_name,
                action_id = %action_id,
                reason = %reason,
                success = false,
                "Failed to revert optimization"
            );
        }
    }
}
