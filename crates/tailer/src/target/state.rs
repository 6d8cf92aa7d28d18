//! State — observable lifecycle of a target.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Stopped,
    Running,
    /// Waiting out a backoff delay before reconnecting.
    Retrying,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Stopped => "stopped",
            TargetState::Running => "running",
            TargetState::Retrying => "retrying",
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sent when a target stops on its own (container gone, fatal error).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetExit {
    pub container_id: String,
    /// Generation of the run that ended. Lets the receiver ignore exits
    /// from runs that were already replaced.
    pub generation: u64,
    pub reason: String,
}
