//! On-demand diagnostics export
//!
//! The document is written for external tooling and never read back.

use super::records::{DecisionRecord, PerformanceStatistics, UserFeedback};
use super::StateView;
use crate::config::OptimizerConfig;
use crate::error::ControllerError;
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct DiagnosticsExport {
    pub configuration: OptimizerConfig,
    pub current_state: StateView,
    pub performance_history: Vec<DecisionRecord>,
    pub user_feedback_history: Vec<UserFeedback>,
    pub performance_statistics: Option<PerformanceStatistics>,
    pub export_timestamp_ms: i64,
}

impl DiagnosticsExport {
    /// Write as pretty JSON, creating parent directories
    pub fn write_to(&self, path: &Path) -> Result<(), ControllerError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ControllerError::Export(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| ControllerError::Export(format!("{}: {e}", parent.display())))?;
        }
        fs::write(path, json)
            .map_err(|e| ControllerError::Export(format!("{}: {e}", path.display())))
    }
}
