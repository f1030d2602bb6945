//! Typed publish/subscribe for controller events
//!
//! Each event kind has its own subscriber list. Delivery is synchronous on
//! the publishing task; a subscriber that errors or panics is logged and
//! skipped.

use super::records::UserFeedback;
use crate::models::{ActionResult, MetricsSnapshot, OptimizationAction};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

/// Payload of a `decision_made` event
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEvent {
    pub snapshot: MetricsSnapshot,
    pub proposed: Vec<OptimizationAction>,
    /// Actions that passed the mode filter
    pub allowed: Vec<OptimizationAction>,
    pub results: Vec<ActionResult>,
}

/// Handle returned by a subscribe call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

struct Subscribers<T> {
    event: &'static str,
    list: RwLock<Vec<(SubscriptionId, Callback<T>)>>,
}

impl<T> Subscribers<T> {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            list: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, id: SubscriptionId, callback: Callback<T>) {
        self.list
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut list = self.list.write().unwrap_or_else(PoisonError::into_inner);
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        list.len() != before
    }

    fn len(&self) -> usize {
        self.list.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn publish(&self, payload: &T) {
        // Callbacks run outside the lock so they may (un)subscribe
        let callbacks: Vec<(SubscriptionId, Callback<T>)> = self
            .list
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    event = self.event,
                    subscription = id.0,
                    error = %e,
                    "Event subscriber failed"
                ),
                Err(_) => warn!(
                    event = self.event,
                    subscription = id.0,
                    "Event subscriber panicked"
                ),
            }
        }
    }
}

/// Subscriber lists for every controller event kind
pub struct EventBus {
    next_id: AtomicU64,
    metrics_update: Subscribers<MetricsSnapshot>,
    decision_made: Subscribers<DecisionEvent>,
    action_applied: Subscribers<ActionResult>,
    user_feedback: Subscribers<UserFeedback>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            metrics_update: Subscribers::new("metrics_update"),
            decision_made: Subscribers::new("decision_made"),
            action_applied: Subscribers::new("action_applied"),
            user_feedback: Subscribers::new("user_feedback"),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_metrics_update<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&MetricsSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.metrics_update.add(id, Arc::new(callback));
        id
    }

    pub fn on_decision_made<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DecisionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.decision_made.add(id, Arc::new(callback));
        id
    }

    pub fn on_action_applied<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ActionResult) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.action_applied.add(id, Arc::new(callback));
        id
    }

    pub fn on_user_feedback<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&UserFeedback) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.user_feedback.add(id, Arc::new(callback));
        id
    }

    /// Remove a subscription from whichever list holds it
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.metrics_update.remove(id)
            || self.decision_made.remove(id)
            || self.action_applied.remove(id)
            || self.user_feedback.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.metrics_update.len()
            + self.decision_made.len()
            + self.action_applied.len()
            + self.user_feedback.len()
    }

    pub(crate) fn publish_metrics(&self, snapshot: &MetricsSnapshot) {
        self.metrics_update.publish(snapshot);
    }

    pub(crate) fn publish_decision(&self, event: &DecisionEvent) {
        self.decision_made.publish(event);
    }

    pub(crate) fn publish_action(&self, result: &ActionResult) {
        self.action_applied.publish(result);
    }

    pub(crate) fn publish_feedback(&self, feedback: &UserFeedback) {
        self.user_feedback.publish(feedback);
    }
}
