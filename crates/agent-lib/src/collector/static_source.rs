//! Fixed or scripted metrics source

use super::{now_ms, MetricsSource};
use crate::models::MetricsSnapshot;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// Serves queued snapshots in order, then repeats the last one.
/// `None` entries simulate a sensing failure for that tick.
pub struct StaticMetricsSource {
    script: Mutex<Script>,
}

struct Script {
    pending: VecDeque<Option<MetricsSnapshot>>,
    last: Option<MetricsSnapshot>,
}

impl StaticMetricsSource {
    /// Always report `snapshot`
    pub fn new(snapshot: MetricsSnapshot) -> Self {
        Self::scripted(vec![Some(snapshot)])
    }

    pub fn scripted(steps: Vec<Option<MetricsSnapshot>>) -> Self {
        Self {
            script: Mutex::new(Script {
                pending: steps.into(),
                last: None,
            }),
        }
    }

    /// Replace the snapshot reported from the next tick on
    pub fn set(&self, snapshot: MetricsSnapshot) {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        script.pending.clear();
        script.pending.push_back(Some(snapshot));
    }
}

#[async_trait]
impl MetricsSource for StaticMetricsSource {
    async fn collect(&self) -> Result<MetricsSnapshot> {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        let step = match script.pending.pop_front() {
            Some(step) => step,
            None => script.last.clone(),
        };

        match step {
            Some(mut snapshot) => {
                script.last = Some(snapshot.clone());
                snapshot.timestamp_ms = now_ms();
                Ok(snapshot)
            }
            None => Err(anyhow!("scripted sensing failure")),
        }
    }
}
