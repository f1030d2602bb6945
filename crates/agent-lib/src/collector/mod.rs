//! Metrics collection for the local device
//!
//! This module defines the [`MetricsSource`] contract consumed by the
//! controller and two implementations: a procfs/sysfs reader for Linux
//! hosts and a static source for replay and tests.

mod procfs;
mod static_source;

#[cfg(test)]
mod tests;

pub use procfs::{
    find_processes, parse_cpu_times, parse_meminfo, parse_net_dev, parse_pid_stat, CpuTimes,
    PidStat, ProcessEntry, ProcfsMetricsSource,
};
pub use static_source::StaticMetricsSource;

use crate::models::MetricsSnapshot;
use anyhow::Result;

pub use async_trait::async_trait;

/// Source of device resource snapshots
///
/// `collect` should return quickly (well under a second) and must not
/// change the state of the device being measured.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Sample the device once
    async fn collect(&self) -> Result<MetricsSnapshot>;
}

/// Current wall-clock time as unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
