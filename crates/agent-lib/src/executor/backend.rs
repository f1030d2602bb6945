//! Actuator backend contract

use crate::models::{ActionResult, Domain, OptimizationAction};
use std::collections::BTreeMap;

/// Key/value view of a backend's current state
pub type BackendState = BTreeMap<String, serde_json::Value>;

/// One actuator per domain. Backends remember what they changed per
/// action id so that `revert` can restore it.
///
/// Implementations report failures inside the returned [`ActionResult`];
/// they must not panic on platform errors.
pub trait ActuatorBackend: Send + Sync {
    fn domain(&self) -> Domain;

    /// Apply `action` and remember the prior state under `action_id`
    fn apply(&self, action_id: &str, action: &OptimizationAction) -> ActionResult;

    /// Restore the state saved for `action_id`. The saved state is dropped
    /// only when the revert succeeds.
    fn revert(&self, action_id: &str) -> ActionResult;

    fn current_state(&self) -> BackendState;
}
