use serde::{Deserialize, Serialize};

use crate::package::PackageRef;

/// Whether superseded installed revisions are purged after an upgrade or
/// uninstall. Advisory metadata only: consulted by the relevant adapter when
/// building argument vectors, never by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    #[default]
    Default,
    KeepOldRevisions,
    CleanupOldRevisions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageCleanupPolicy {
    pub package: PackageRef,
    pub policy: CleanupPolicy,
}

/// Policy inputs to plan building. `safe_mode` is a hard override: OS-update
/// steps are vetoed even when `allow_os_updates` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPolicy {
    pub include_pinned: bool,
    pub allow_os_updates: bool,
    pub safe_mode: bool,
}

impl PlanPolicy {
    pub fn permits_os_updates(self) -> bool {
        self.allow_os_updates && !self.safe_mode
    }
}
