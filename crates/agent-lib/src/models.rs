//! Core data models for the power agent

use crate::error::ActuationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource-usage snapshot produced once per sampling tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,
    pub battery_percent: f64,
    /// Estimated power draw in watts
    pub battery_power_draw: f64,
    pub cpu_percent: f64,
    pub cpu_freq_mhz: f64,
    pub memory_percent: f64,
    pub gpu_percent: f64,
    pub gpu_memory_percent: f64,
    /// Bytes sent since the source's baseline
    pub network_bytes_sent: u64,
    /// Bytes received since the source's baseline
    pub network_bytes_recv: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    /// Screen brightness in percent (0-100)
    pub screen_brightness: u32,
    pub process_count: u32,
    pub target_app_cpu: f64,
    pub target_app_memory: f64,
}

impl MetricsSnapshot {
    /// Snapshot used when the metrics source fails. Values are chosen so
    /// that no rule fires and the emergency watchdog stays idle.
    pub fn degraded(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            battery_percent: 50.0,
            battery_power_draw: 10.0,
            cpu_percent: 0.0,
            cpu_freq_mhz: 0.0,
            memory_percent: 0.0,
            gpu_percent: 0.0,
            gpu_memory_percent: 0.0,
            network_bytes_sent: 0,
            network_bytes_recv: 0,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            screen_brightness: 50,
            process_count: 0,
            target_app_cpu: 0.0,
            target_app_memory: 0.0,
        }
    }

    pub fn network_bytes_total(&self) -> u64 {
        self.network_bytes_sent.saturating_add(self.network_bytes_recv)
    }

    pub fn network_megabytes(&self) -> f64 {
        self.network_bytes_total() as f64 / 1024.0 / 1024.0
    }

    /// Low draw is taken as a sign that the device runs on external power
    pub fn likely_plugged_in(&self) -> bool {
        self.battery_power_draw < 5.0
    }
}

/// Coarse battery bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryTier {
    Critical,
    Low,
    Medium,
    High,
}

impl BatteryTier {
    pub fn from_percent(percent: f64) -> Self {
        if percent <= 15.0 {
            BatteryTier::Critical
        } else if percent <= 30.0 {
            BatteryTier::Low
        } else if percent <= 60.0 {
            BatteryTier::Medium
        } else {
            BatteryTier::High
        }
    }

    pub fn is_depleted(&self) -> bool {
        matches!(self, BatteryTier::Critical | BatteryTier::Low)
    }
}

impl fmt::Display for BatteryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatteryTier::Critical => write!(f, "critical"),
            BatteryTier::Low => write!(f, "low"),
            BatteryTier::Medium => write!(f, "medium"),
            BatteryTier::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceDemand {
    Idle,
    Light,
    Moderate,
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserActivity {
    Active,
    Away,
    Sleeping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSource {
    Battery,
    Plugged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppPriority {
    Background,
    Foreground,
    Critical,
}

/// Categorical summary of a snapshot, used by the rule tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub battery_tier: BatteryTier,
    pub performance_demand: PerformanceDemand,
    pub user_activity: UserActivity,
    pub power_source: PowerSource,
    pub time_of_day: TimeOfDay,
    pub app_priority: AppPriority,
}

/// Actuator domain an action is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Display,
    Processor,
    Network,
    Application,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Display => write!(f, "display"),
            Domain::Processor => write!(f, "processor"),
            Domain::Network => write!(f, "network"),
            Domain::Application => write!(f, "application"),
        }
    }
}

/// Mitigation kinds the agent knows how to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    BrightnessAdjust,
    CpuThrottle,
    NetworkLimit,
    AppThrottle,
    BackgroundLimit,
}

impl ActionKind {
    /// Static routing table: every kind maps to exactly one domain
    pub fn domain(&self) -> Domain {
        match self {
            ActionKind::BrightnessAdjust => Domain::Display,
            ActionKind::CpuThrottle => Domain::Processor,
            ActionKind::NetworkLimit => Domain::Network,
            ActionKind::AppThrottle | ActionKind::BackgroundLimit => Domain::Application,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::BrightnessAdjust => write!(f, "brightness_adjust"),
            ActionKind::CpuThrottle => write!(f, "cpu_throttle"),
            ActionKind::NetworkLimit => write!(f, "network_limit"),
            ActionKind::AppThrottle => write!(f, "app_throttle"),
            ActionKind::BackgroundLimit => write!(f, "background_limit"),
        }
    }
}

/// Proposed mitigation. Intensity, confidence and performance impact are
/// clamped to [0, 1] at construction and cannot be changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationAction {
    kind: ActionKind,
    intensity: f64,
    target: Domain,
    estimated_savings: f64,
    performance_impact: f64,
    confidence: f64,
}

impl OptimizationAction {
    pub fn new(
        kind: ActionKind,
        intensity: f64,
        estimated_savings: f64,
        performance_impact: f64,
        confidence: f64,
    ) -> Self {
        Self {
            kind,
            intensity: unit(intensity),
            target: kind.domain(),
            estimated_savings: if estimated_savings.is_finite() {
                estimated_savings.max(0.0)
            } else {
                0.0
            },
            performance_impact: unit(performance_impact),
            confidence: unit(confidence),
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn intensity(&self) -> f64 {
        self.intensity
    }

    pub fn target(&self) -> Domain {
        self.target
    }

    pub fn estimated_savings(&self) -> f64 {
        self.estimated_savings
    }

    pub fn performance_impact(&self) -> f64 {
        self.performance_impact
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Merge key used when combining classifier and rule proposals
    pub fn merge_key(&self) -> (ActionKind, Domain) {
        (self.kind, self.target)
    }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Value observed on an actuator before or after an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedValue {
    Brightness(u32),
    FrequencyPercent(f64),
    BandwidthMbps(f64),
    Unlimited,
    Processes(usize),
    Level(f64),
    Text(String),
}

/// Outcome of applying or reverting an action
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub action_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActuationError>,
    pub previous_value: Option<ObservedValue>,
    pub new_value: Option<ObservedValue>,
    pub estimated_savings: f64,
    pub actual_impact: f64,
}

impl ActionResult {
    pub fn succeeded(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            success: true,
            error: None,
            previous_value: None,
            new_value: None,
            estimated_savings: 0.0,
            actual_impact: 0.0,
        }
    }

    pub fn failed(action_id: impl Into<String>, error: ActuationError) -> Self {
        Self {
            action_id: action_id.into(),
            success: false,
            error: Some(error),
            previous_value: None,
            new_value: None,
            estimated_savings: 0.0,
            actual_impact: 0.0,
        }
    }

    pub fn with_values(
        mut self,
        previous: Option<ObservedValue>,
        new: Option<ObservedValue>,
    ) -> Self {
        self.previous_value = previous;
        self.new_value = new;
        self
    }

    pub fn with_savings(mut self, estimated_savings: f64) -> Self {
        self.estimated_savings = estimated_savings;
        self
    }

    pub fn with_impact(mut self, actual_impact: f64) -> Self {
        self.actual_impact = actual_impact;
        self
    }
}

/// Aggregate controller state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerState {
    /// Whether decision cycles are allowed to run
    pub active: bool,
    pub battery_tier: Option<BatteryTier>,
    pub optimization_mode: String,
    pub actions_applied: u64,
    pub total_savings: f64,
    pub user_satisfaction: f64,
    /// Unix timestamp (ms) of the last decision cycle
    pub last_decision_ms: Option<i64>,
    pub emergency: bool,
}

impl ControllerState {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            active: false,
            battery_tier: None,
            optimization_mode: mode.into(),
            actions_applied: 0,
            total_savings: 0.0,
            user_satisfaction: 0.8,
            last_decision_ms: None,
            emergency: false,
        }
    }
}
