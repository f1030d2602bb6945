//! Experience and feedback bookkeeping for classifier retraining

use super::classifier::{FeatureVector, OptimizationClass, TrainingSample};
use crate::config::LearningConfig;
use crate::models::{Context, MetricsSnapshot, OptimizationAction};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// One decision as seen by the learning loop
#[derive(Debug, Clone, Serialize)]
pub struct Experience {
    pub snapshot: MetricsSnapshot,
    pub context: Context,
    pub hour: u32,
    pub actions: Vec<OptimizationAction>,
    pub timestamp_ms: i64,
}

/// Feedback reported for an applied decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackRecord {
    pub action_id: String,
    pub success: bool,
    pub energy_savings: f64,
    pub performance_impact: f64,
    pub user_satisfaction: f64,
    pub timestamp_ms: i64,
}

/// Bounded experience buffer plus the outcome table
#[derive(Debug)]
pub struct LearningState {
    config: LearningConfig,
    experience: VecDeque<Experience>,
    outcomes: VecDeque<FeedbackRecord>,
    feedback_since_retrain: usize,
}

impl LearningState {
    pub fn new(config: LearningConfig) -> Self {
        Self {
            config,
            experience: VecDeque::new(),
            outcomes: VecDeque::new(),
            feedback_since_retrain: 0,
        }
    }

    pub fn record_experience(&mut self, experience: Experience) {
        self.experience.push_back(experience);
        while self.experience.len() > self.config.experience_capacity.max(1) {
            self.experience.pop_front();
        }
    }

    /// Store an outcome. A record with an existing id replaces the old one.
    pub fn record_outcome(&mut self, record: FeedbackRecord) {
        self.outcomes.retain(|o| o.action_id != record.action_id);
        self.outcomes.push_back(record);
        while self.outcomes.len() > self.config.experience_capacity.max(1) {
            self.outcomes.pop_front();
        }
        self.feedback_since_retrain += 1;
    }

    pub fn experience_len(&self) -> usize {
        self.experience.len()
    }

    pub fn outcome_count(&self) -> usize {
        self.outcomes.len()
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &FeedbackRecord> {
        self.outcomes.iter()
    }

    /// Enough new feedback and enough buffered decisions to attempt a retrain
    pub fn retrain_due(&self) -> bool {
        self.feedback_since_retrain > self.config.min_feedback_count
            && self.experience.len() >= self.config.min_experience
    }

    pub fn mark_retrained(&mut self) {
        self.feedback_since_retrain = 0;
    }

    /// Whether a decision counts as successful, judged by the feedback
    /// recorded within `window` after it
    pub fn decision_succeeded(&self, experience: &Experience, window: Duration) -> bool {
        let start = experience.timestamp_ms;
        let end = start.saturating_add(window.as_millis().min(i64::MAX as u128) as i64);
        let (total, successes) = self
            .outcomes
            .iter()
            .filter(|o| o.timestamp_ms >= start && o.timestamp_ms <= end)
            .fold((0usize, 0usize), |(t, s), o| (t + 1, s + usize::from(o.success)));

        if total == 0 {
            !experience.actions.is_empty()
        } else {
            successes * 2 > total
        }
    }

    /// Labelled samples reconstructed from the experience buffer. Decisions
    /// that proposed nothing carry no outcome to learn from and are skipped.
    pub fn training_samples(&self, window: Duration) -> Vec<TrainingSample> {
        self.experience
            .iter()
            .filter(|e| !e.actions.is_empty())
            .map(|e| TrainingSample {
                features: FeatureVector::from_snapshot(&e.snapshot, e.hour),
                label: label_for(self.decision_succeeded(e, window), e.snapshot.battery_percent),
            })
            .collect()
    }
}

/// Outcome heuristic: the lower the battery, the stronger the class we
/// want the model to learn; an unsuccessful decision shifts one class up.
pub fn label_for(success: bool, battery_percent: f64) -> OptimizationClass {
    let index = if battery_percent > 60.0 {
        if success { 0 } else { 1 }
    } else if battery_percent > 30.0 {
        if success { 1 } else { 2 }
    } else if battery_percent > 15.0 {
        if success { 2 } else { 3 }
    } else {
        3
    };
    OptimizationClass::from_index(index).unwrap_or(OptimizationClass::Aggressive)
}
