//! Network backend: bandwidth limit on the default-route interface
//!
//! Traffic shaping needs privileges the agent normally lacks, so limits
//! are tracked in a simulated table keyed by interface.

use super::backend::{ActuatorBackend, BackendState};
use crate::error::ActuationError;
use crate::models::{ActionKind, ActionResult, Domain, ObservedValue, OptimizationAction};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Bandwidth at zero intensity, in Mbps
const BASE_LIMIT_MBPS: f64 = 100.0;

const FALLBACK_INTERFACE: &str = "eth0";

pub fn bandwidth_limit(intensity: f64) -> f64 {
    BASE_LIMIT_MBPS * (1.0 - intensity)
}

/// Interface of the default route in a /proc/net/route table
pub fn default_route_interface(route_table: &str) -> Option<String> {
    route_table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [iface, "00000000", ..] => Some((*iface).to_string()),
            _ => None,
        }
    })
}

struct SavedLimit {
    interface: String,
    previous: Option<f64>,
}

#[derive(Default)]
struct NetworkState {
    limits: BTreeMap<String, f64>,
    saved: HashMap<String, SavedLimit>,
}

pub struct NetworkBackend {
    proc_root: PathBuf,
    state: Mutex<NetworkState>,
}

impl NetworkBackend {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            state: Mutex::new(NetworkState::default()),
        }
    }

    pub fn interface(&self) -> String {
        interface_from(&self.proc_root)
    }

    pub fn limit(&self, interface: &str) -> Option<f64> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .limits
            .get(interface)
            .copied()
    }
}

fn interface_from(proc_root: &Path) -> String {
    fs::read_to_string(proc_root.join("net/route"))
        .ok()
        .and_then(|table| default_route_interface(&table))
        .unwrap_or_else(|| FALLBACK_INTERFACE.to_string())
}

fn observed(limit: Option<f64>) -> ObservedValue {
    match limit {
        Some(mbps) => ObservedValue::BandwidthMbps(mbps),
        None => ObservedValue::Unlimited,
    }
}

impl ActuatorBackend for NetworkBackend {
    fn domain(&self) -> Domain {
        Domain::Network
    }

    fn apply(&self, action_id: &str, action: &OptimizationAction) -> ActionResult {
        if action.kind() != ActionKind::NetworkLimit {
            return ActionResult::failed(
                action_id,
                ActuationError::Unsupported {
                    action: action.kind(),
                    domain: Domain::Network,
                },
            );
        }

        let interface = self.interface();
        let limit = bandwidth_limit(action.intensity());
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = state.limits.insert(interface.clone(), limit);
        state.saved.insert(
            action_id.to_string(),
            SavedLimit {
                interface: interface.clone(),
                previous,
            },
        );
        info!(interface = %interface, limit_mbps = limit, "Simulated bandwidth limit");

        ActionResult::succeeded(action_id)
            .with_values(
                Some(observed(previous)),
                Some(ObservedValue::BandwidthMbps(limit)),
            )
            .with_savings(action.estimated_savings())
            .with_impact(action.performance_impact())
    }

    fn revert(&self, action_id: &str) -> ActionResult {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(saved) = state.saved.remove(action_id) else {
            return ActionResult::failed(
                action_id,
                ActuationError::NotFound {
                    action_id: action_id.to_string(),
                },
            );
        };

        let before = match saved.previous {
            Some(limit) => state.limits.insert(saved.interface.clone(), limit),
            None => state.limits.remove(&saved.interface),
        };
        info!(interface = %saved.interface, "Simulated bandwidth limit removal");

        ActionResult::succeeded(action_id)
            .with_values(Some(observed(before)), Some(observed(saved.previous)))
    }

    fn current_state(&self) -> BackendState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        BackendState::from([
            ("active_limits".to_string(), json!(state.limits)),
            ("interface".to_string(), json!(self.interface())),
            ("simulated".to_string(), json!(true)),
        ])
    }
}
