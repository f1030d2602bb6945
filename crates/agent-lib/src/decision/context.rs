//! Context derivation
//!
//! Pure functions from a snapshot and the wall-clock hour to the
//! categorical [`Context`] used by the rule tier.

use crate::models::{
    AppPriority, BatteryTier, Context, MetricsSnapshot, PerformanceDemand, PowerSource, TimeOfDay,
    UserActivity,
};

pub fn derive_context(snapshot: &MetricsSnapshot, hour: u32) -> Context {
    Context {
        battery_tier: BatteryTier::from_percent(snapshot.battery_percent),
        performance_demand: performance_demand(snapshot.cpu_percent + snapshot.gpu_percent),
        user_activity: user_activity(snapshot, hour),
        power_source: if snapshot.likely_plugged_in() {
            PowerSource::Plugged
        } else {
            PowerSource::Battery
        },
        time_of_day: time_of_day(hour),
        app_priority: app_priority(snapshot.target_app_cpu),
    }
}

/// Demand from combined CPU and GPU load
pub fn performance_demand(load: f64) -> PerformanceDemand {
    if load > 80.0 {
        PerformanceDemand::Heavy
    } else if load > 50.0 {
        PerformanceDemand::Moderate
    } else if load > 20.0 {
        PerformanceDemand::Light
    } else {
        PerformanceDemand::Idle
    }
}

pub fn user_activity(snapshot: &MetricsSnapshot, hour: u32) -> UserActivity {
    // Sleeping window wraps midnight: 23:00 through 06:59
    if hour >= 23 || hour <= 6 {
        UserActivity::Sleeping
    } else if snapshot.cpu_percent < 10.0 && snapshot.target_app_cpu < 5.0 {
        UserActivity::Away
    } else {
        UserActivity::Active
    }
}

pub fn time_of_day(hour: u32) -> TimeOfDay {
    match hour {
        6..=11 => TimeOfDay::Morning,
        12..=17 => TimeOfDay::Afternoon,
        18..=21 => TimeOfDay::Evening,
        _ => TimeOfDay::Night,
    }
}

pub fn app_priority(target_app_cpu: f64) -> AppPriority {
    if target_app_cpu > 20.0 {
        AppPriority::Critical
    } else if target_app_cpu > 5.0 {
        AppPriority::Foreground
    } else {
        AppPriority::Background
    }
}
