//! Deterministic rule tier

use crate::models::{
    ActionKind, BatteryTier, Context, MetricsSnapshot, OptimizationAction, PerformanceDemand,
    UserActivity,
};

/// Traffic above which an idle device gets its network limited
const AWAY_NETWORK_BYTES: u64 = 1024 * 1024;

/// Context-keyed rules. Stateless; evaluation order is stable so the
/// output order is deterministic for a given input.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleEngine;

impl RuleEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot, context: &Context) -> Vec<OptimizationAction> {
        let mut actions = Vec::new();

        match context.battery_tier {
            BatteryTier::Critical => {
                if snapshot.screen_brightness > 20 {
                    actions.push(OptimizationAction::new(
                        ActionKind::BrightnessAdjust,
                        0.8,
                        20.0,
                        0.3,
                        0.9,
                    ));
                }
                if snapshot.cpu_percent > 30.0 {
                    actions.push(OptimizationAction::new(
                        ActionKind::CpuThrottle,
                        0.7,
                        25.0,
                        0.6,
                        0.85,
                    ));
                }
            }
            BatteryTier::Low => {
                if snapshot.screen_brightness > 50 {
                    actions.push(OptimizationAction::new(
                        ActionKind::BrightnessAdjust,
                        0.4,
                        10.0,
                        0.15,
                        0.8,
                    ));
                }
                if snapshot.cpu_percent > 60.0 {
                    actions.push(OptimizationAction::new(
                        ActionKind::CpuThrottle,
                        0.3,
                        12.0,
                        0.25,
                        0.75,
                    ));
                }
            }
            BatteryTier::Medium | BatteryTier::High => {}
        }

        // Heavy load on a draining battery: keep the target app, cap the rest
        if context.performance_demand == PerformanceDemand::Heavy
            && context.battery_tier.is_depleted()
            && snapshot.target_app_cpu < 50.0
        {
            actions.push(OptimizationAction::new(
                ActionKind::BackgroundLimit,
                0.5,
                8.0,
                0.1,
                0.7,
            ));
        }

        if context.user_activity == UserActivity::Away {
            actions.push(OptimizationAction::new(
                ActionKind::BrightnessAdjust,
                0.9,
                30.0,
                0.1,
                0.95,
            ));
            if snapshot.network_bytes_total() > AWAY_NETWORK_BYTES {
                actions.push(OptimizationAction::new(
                    ActionKind::NetworkLimit,
                    0.6,
                    15.0,
                    0.2,
                    0.8,
                ));
            }
        }

        actions
    }
}
