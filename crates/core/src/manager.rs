use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Closed set of managers the control plane knows how to drive. Adapters are
/// selected by this id at registry-build time; there is no string-keyed
/// dynamic lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerId {
    Mise,
    Rustup,
    Npm,
    Pip,
    Cargo,
    Homebrew,
    SoftwareUpdate,
}

impl ManagerId {
    pub const ALL: [Self; 7] = [
        Self::Mise,
        Self::Rustup,
        Self::Npm,
        Self::Pip,
        Self::Cargo,
        Self::Homebrew,
        Self::SoftwareUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mise => "mise",
            Self::Rustup => "rustup",
            Self::Npm => "npm",
            Self::Pip => "pip",
            Self::Cargo => "cargo",
            Self::Homebrew => "homebrew",
            Self::SoftwareUpdate => "softwareupdate",
        }
    }
}

impl std::fmt::Display for ManagerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManagerId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == value)
            .ok_or_else(|| format!("unknown manager id '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerCategory {
    ToolchainVersion,
    Language,
    Formula,
    OsUpdate,
}

/// Risk classification controlling plan phase ordering. Lower-risk tiers run
/// first; an entire tier must reach quiescence before the next dispatches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityTier {
    Authoritative,
    Standard,
    Guarded,
}

impl AuthorityTier {
    pub fn rank(self) -> u8 {
        match self {
            Self::Authoritative => 0,
            Self::Standard => 1,
            Self::Guarded => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Detect,
    ListInstalled,
    ListOutdated,
    Search,
    Install,
    Uninstall,
    Upgrade,
    Pin,
    SelfManage,
}

/// Fixed identity card for one manager. Authority tier is invariant per id;
/// only enablement and relative priority are user-mutable (and live in the
/// store, not here).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerDescriptor {
    pub id: ManagerId,
    pub display_name: &'static str,
    pub category: ManagerCategory,
    pub tier: AuthorityTier,
    pub capabilities: &'static [Capability],
    /// Steps for this manager are vetoed by safe mode and the
    /// `allow_os_updates` policy flag.
    pub os_update_class: bool,
    /// Whether an inventory re-query can confirm a specific package's version
    /// after an upgrade. False for coarse system updaters, which makes the
    /// post-action validation skip explicit rather than inferred.
    pub confirms_versions: bool,
}

impl ManagerDescriptor {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionInfo {
    pub installed: bool,
    pub executable_path: Option<PathBuf>,
    pub version: Option<String>,
}

/// Boundary-facing view of one manager: static identity plus runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub id: ManagerId,
    pub display_name: String,
    pub tier: AuthorityTier,
    pub enabled: bool,
    pub priority: u32,
    pub detection: Option<DetectionInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_id_round_trips_through_str() {
        for id in ManagerId::ALL {
            assert_eq!(id.as_str().parse::<ManagerId>(), Ok(id));
        }
    }

    #[test]
    fn tier_rank_orders_authoritative_first() {
        assert!(AuthorityTier::Authoritative.rank() < AuthorityTier::Standard.rank());
        assert!(AuthorityTier::Standard.rank() < AuthorityTier::Guarded.rank());
    }
}
