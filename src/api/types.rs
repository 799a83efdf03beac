//! Wire types for the upgrade status API.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::PuwError;

/// Status of a single upgrade step as reported by the admin server.
///
/// The enumeration is closed: a payload carrying any other value fails
/// deserialization instead of being coerced to a known state.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Per-step entry in the status payload.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct StepState {
    pub status: StepStatus,
}

/// One fetched status response covering all upgrade steps.
///
/// `current_substep` and `current_node` are opaque progress metadata; the
/// admin server includes them only while certain steps run.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct StatusSnapshot {
    /// Step the admin server considers active. Absent on some responses,
    /// e.g. before the upgrade has been started.
    #[serde(default)]
    pub current_step: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_substep: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<serde_json::Value>,

    /// Step name to step state. Keys are owned by the backend contract;
    /// unknown extra keys are carried, not rejected.
    pub steps: HashMap<String, StepState>,
}

impl StatusSnapshot {
    /// Look up the status of `step`, failing closed when the key is absent.
    ///
    /// A missing key is a backend contract violation and is surfaced as a
    /// fetch-level error so watches account for it like any other bad fetch.
    pub fn step_status(&self, step: &str) -> Result<StepStatus, PuwError> {
        self.steps
            .get(step)
            .map(|s| s.status)
            .ok_or_else(|| PuwError::MissingStep(step.to_string()))
    }
}
