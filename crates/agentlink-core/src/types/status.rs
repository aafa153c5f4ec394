//! Worker status types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Worker is not running
    Stopped,
    /// Process spawned, handshake in progress
    Starting,
    /// Handshake complete, accepting feature traffic
    Running,
    /// Process exited or the connection failed
    Crashed,
    /// Explicit shutdown in progress
    Stopping,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Crashed => "crashed",
            WorkerStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// One status transition, as published to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: WorkerStatus,
    pub generation: u64,
    pub at: chrono::DateTime<chrono::Utc>,
    pub detail: Option<String>,
    /// Set when the supervisor has given up and will not restart on its own.
    pub fatal: bool,
}

impl StatusEvent {
    pub fn new(status: WorkerStatus, generation: u64) -> Self {
        Self {
            status,
            generation,
            at: chrono::Utc::now(),
            detail: None,
            fatal: false,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}
