//! Error types for the power agent
//!
//! Actuation errors travel inside [`ActionResult`](crate::models::ActionResult)
//! values; the control loop never propagates them as faults.

use crate::models::{ActionKind, Domain};
use serde::Serialize;
use thiserror::Error;

/// Failure applying or reverting an action
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActuationError {
    /// No backend is registered for the routed domain
    #[error("no backend registered for domain {domain} (action {action})")]
    Unroutable { action: ActionKind, domain: Domain },

    #[error("backend for domain {domain} is disabled")]
    DomainDisabled { domain: Domain },

    #[error("action {action_id} is not active")]
    NotFound { action_id: String },

    /// Backend accepted the request but the platform primitive failed
    #[error("backend failure: {message}")]
    Backend { message: String },

    #[error("{domain} backend does not support {action}")]
    Unsupported { action: ActionKind, domain: Domain },
}

impl ActuationError {
    pub fn backend(message: impl Into<String>) -> Self {
        ActuationError::Backend {
            message: message.into(),
        }
    }
}

/// Classifier tier failures
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("classifier has not been trained")]
    NotTrained,

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error("model persistence failed: {0}")]
    Persistence(String),

    #[error("operation not supported by {0}")]
    Unsupported(&'static str),
}

/// Configuration loading failures. Callers substitute defaults.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("unknown optimization mode: {0}")]
    UnknownMode(String),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Errors surfaced by the controller's public API
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("startup failed: {0}")]
    Startup(String),

    #[error("unknown optimization mode: {0}")]
    UnknownMode(String),

    #[error("diagnostics export failed: {0}")]
    Export(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actuation_error_display() {
        let err = ActuationError::Unroutable {
            action: ActionKind::NetworkLimit,
            domain: Domain::Network,
        };
        assert_eq!(
            err.to_string(),
            "no backend registered for domain network (action network_limit)"
        );
    }

    #[test]
    fn test_actuation_error_serializes_with_kind_tag() {
        let err = ActuationError::NotFound {
            action_id: "display-7".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "not_found");
        assert_eq!(json["action_id"], "display-7");
    }
}
