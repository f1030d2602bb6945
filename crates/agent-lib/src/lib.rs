//! Agent library for closed-loop battery optimization
//!
//! This crate provides the core functionality for:
//! - Metrics collection from procfs/sysfs
//! - Rule and classifier based optimization decisions
//! - Mode filtering and revertible action execution
//! - The controller loop with emergency preemption and feedback learning
//! - Health checks and observability

pub mod collector;
pub mod config;
pub mod controller;
pub mod decision;
pub mod error;
pub mod executor;
pub mod health;
pub mod models;
pub mod observability;
pub mod policy;

pub use config::{ModeConfig, OptimizerConfig, UserPreferences};
pub use controller::{Controller, ControllerBuilder, StateView};
pub use error::{ActuationError, ConfigError, ControllerError, ModelError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
