use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manager::ManagerId;

/// Compound package identity: the same name under two managers is two
/// different packages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    pub manager: ManagerId,
    pub name: String,
}

impl PackageRef {
    pub fn new(manager: ManagerId, name: impl Into<String>) -> Self {
        Self {
            manager,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PackageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.manager, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Installed,
    Upgradable,
    Available,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub reference: PackageRef,
    pub installed_version: Option<String>,
    pub latest_version: Option<String>,
    pub status: PackageStatus,
    pub pinned: bool,
    pub restart_required: bool,
    pub summary: Option<String>,
}

impl PackageRecord {
    pub fn installed(reference: PackageRef, version: impl Into<String>) -> Self {
        Self {
            reference,
            installed_version: Some(version.into()),
            latest_version: None,
            status: PackageStatus::Installed,
            pinned: false,
            restart_required: false,
            summary: None,
        }
    }

    pub fn upgradable(
        reference: PackageRef,
        installed: Option<String>,
        latest: impl Into<String>,
    ) -> Self {
        Self {
            reference,
            installed_version: installed,
            latest_version: Some(latest.into()),
            status: PackageStatus::Upgradable,
            pinned: false,
            restart_required: false,
            summary: None,
        }
    }
}

/// One result of a remote search, tagged with the query that produced it so
/// cached hits can be filtered later without re-running the tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub reference: PackageRef,
    pub version: Option<String>,
    pub summary: Option<String>,
    pub originating_query: String,
    pub cached_at: DateTime<Utc>,
}
