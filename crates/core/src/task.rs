use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manager::ManagerId;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Refresh,
    Search,
    Install,
    Uninstall,
    Upgrade,
    Pin,
    Unpin,
    SelfInstall,
    SelfUpdate,
    SelfUninstall,
}

impl TaskAction {
    pub fn is_upgrade(self) -> bool {
        matches!(self, Self::Upgrade)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Why a task ended in `Failed`. `ValidationMismatch` is deliberately distinct
/// from `ExecutionFailed`: the process exited zero but the re-queried
/// inventory showed no version movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unsupported,
    DetectionFailed,
    ExecutionFailed,
    ParseFailed,
    ValidationMismatch,
    PolicyViolation,
    Interrupted,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub manager: ManagerId,
    pub package: Option<String>,
    pub action: TaskAction,
    pub state: TaskState,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    /// Redacted display form of the literal command issued, if any process ran.
    pub command: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub id: u64,
    pub task: TaskId,
    pub manager: ManagerId,
    pub action: TaskAction,
    pub state: Option<TaskState>,
    pub level: TaskLogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}
