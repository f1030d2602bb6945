//! Bounded histories kept by the controller

use crate::models::MetricsSnapshot;
use serde::Serialize;
use std::collections::VecDeque;

/// Decision history length that triggers truncation
pub const DECISION_HISTORY_LIMIT: usize = 1000;
/// Entries kept after truncation
pub const DECISION_HISTORY_RETAIN: usize = 500;
pub const METRICS_HISTORY_LIMIT: usize = 1000;
/// Number of recent decisions summarized by the statistics
pub const STATISTICS_WINDOW: usize = 100;

/// Outcome of one decision cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub timestamp_ms: i64,
    pub battery_percent: f64,
    pub actions_requested: usize,
    pub actions_applied: usize,
    pub estimated_savings: f64,
    pub optimization_mode: String,
    pub emergency: bool,
}

/// Feedback as submitted by the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserFeedback {
    pub timestamp_ms: i64,
    pub satisfaction: f64,
    pub performance_acceptable: bool,
    pub battery_improvement: bool,
    pub comments: String,
    pub optimization_mode: String,
    /// Cumulative actions applied when the feedback arrived
    pub actions_applied: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStatistics {
    pub total_decisions: usize,
    pub recent_decisions: usize,
    pub average_actions_per_decision: f64,
    pub average_estimated_savings: f64,
    /// Recent decisions made while in emergency mode
    pub emergency_activations: usize,
    pub user_satisfaction: f64,
    pub feedback_count: usize,
}

impl PerformanceStatistics {
    /// Summarize the last [`STATISTICS_WINDOW`] decisions; `None` when no
    /// decision has been recorded
    pub fn summarize(
        history: &[DecisionRecord],
        user_satisfaction: f64,
        feedback_count: usize,
    ) -> Option<Self> {
        if history.is_empty() {
            return None;
        }
        let recent = &history[history.len().saturating_sub(STATISTICS_WINDOW)..];
        let n = recent.len() as f64;

        Some(Self {
            total_decisions: history.len(),
            recent_decisions: recent.len(),
            average_actions_per_decision: recent.iter().map(|r| r.actions_applied as f64).sum::<f64>()
                / n,
            average_estimated_savings: recent.iter().map(|r| r.estimated_savings).sum::<f64>() / n,
            emergency_activations: recent.iter().filter(|r| r.emergency).count(),
            user_satisfaction,
            feedback_count,
        })
    }
}

/// Append to a history, keeping the newest entries once it overflows
pub(crate) fn push_truncating<T>(history: &mut Vec<T>, item: T) {
    history.push(item);
    if history.len() > DECISION_HISTORY_LIMIT {
        let excess = history.len() - DECISION_HISTORY_RETAIN;
        history.drain(..excess);
    }
}

/// Latest snapshot plus a sliding window of recent ones
#[derive(Debug, Default)]
pub(crate) struct MetricsHistory {
    snapshots: VecDeque<MetricsSnapshot>,
}

impl MetricsHistory {
    pub fn record(&mut self, snapshot: MetricsSnapshot) {
        self.snapshots.push_back(snapshot);
        if self.snapshots.len() > METRICS_HISTORY_LIMIT {
            self.snapshots.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&MetricsSnapshot> {
        self.snapshots.back()
    }

    /// Up to `limit` most recent snapshots, oldest first
    pub fn recent(&self, limit: usize) -> Vec<MetricsSnapshot> {
        let skip = self.snapshots.len().saturating_sub(limit);
        self.snapshots.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }
}
