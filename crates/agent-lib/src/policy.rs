//! Mode filter
//!
//! Pure policy gate applied between the decision engine and the executor.

use crate::config::ModeConfig;
use crate::models::OptimizationAction;

/// Keep the actions allowed by `mode` and the global impact ceiling.
/// Input order is preserved.
pub fn filter(
    actions: Vec<OptimizationAction>,
    mode: &ModeConfig,
    global_max_impact: f64,
) -> Vec<OptimizationAction> {
    actions
        .into_iter()
        .filter(|a| allows(a, mode, global_max_impact))
        .collect()
}

pub fn allows(action: &OptimizationAction, mode: &ModeConfig, global_max_impact: f64) -> bool {
    action.intensity() <= mode.max_intensity
        && action.confidence() >= mode.min_confidence
        && action.performance_impact() <= global_max_impact
}
