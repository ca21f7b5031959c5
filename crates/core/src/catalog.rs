use crate::manager::{AuthorityTier, Capability, ManagerCategory, ManagerDescriptor, ManagerId};

const TOOLCHAIN_CAPABILITIES: &[Capability] = &[
    Capability::Detect,
    Capability::ListInstalled,
    Capability::ListOutdated,
    Capability::Install,
    Capability::Uninstall,
    Capability::Upgrade,
];

const RUSTUP_CAPABILITIES: &[Capability] = &[
    Capability::Detect,
    Capability::ListInstalled,
    Capability::ListOutdated,
    Capability::Upgrade,
    Capability::SelfManage,
];

const LANGUAGE_CAPABILITIES: &[Capability] = &[
    Capability::Detect,
    Capability::ListInstalled,
    Capability::ListOutdated,
    Capability::Search,
    Capability::Install,
    Capability::Uninstall,
    Capability::Upgrade,
];

const CARGO_CAPABILITIES: &[Capability] = &[
    Capability::Detect,
    Capability::ListInstalled,
    Capability::Search,
    Capability::Install,
    Capability::Uninstall,
    Capability::Upgrade,
];

const HOMEBREW_CAPABILITIES: &[Capability] = &[
    Capability::Detect,
    Capability::ListInstalled,
    Capability::ListOutdated,
    Capability::Search,
    Capability::Install,
    Capability::Uninstall,
    Capability::Upgrade,
    Capability::Pin,
];

const OS_UPDATE_CAPABILITIES: &[Capability] = &[
    Capability::Detect,
    Capability::ListOutdated,
    Capability::Upgrade,
];

/// The seeded manager catalog. Tier assignments are fixed per identity;
/// enablement and priority are runtime state kept in the store.
static CATALOG: [ManagerDescriptor; 7] = [
    ManagerDescriptor {
        id: ManagerId::Mise,
        display_name: "mise",
        category: ManagerCategory::ToolchainVersion,
        tier: AuthorityTier::Authoritative,
        capabilities: TOOLCHAIN_CAPABILITIES,
        os_update_class: false,
        confirms_versions: true,
    },
    ManagerDescriptor {
        id: ManagerId::Rustup,
        display_name: "rustup",
        category: ManagerCategory::ToolchainVersion,
        tier: AuthorityTier::Authoritative,
        capabilities: RUSTUP_CAPABILITIES,
        os_update_class: false,
        confirms_versions: true,
    },
    ManagerDescriptor {
        id: ManagerId::Npm,
        display_name: "npm (global)",
        category: ManagerCategory::Language,
        tier: AuthorityTier::Standard,
        capabilities: LANGUAGE_CAPABILITIES,
        os_update_class: false,
        confirms_versions: true,
    },
    ManagerDescriptor {
        id: ManagerId::Pip,
        display_name: "pip",
        category: ManagerCategory::Language,
        tier: AuthorityTier::Standard,
        capabilities: LANGUAGE_CAPABILITIES,
        os_update_class: false,
        confirms_versions: true,
    },
    ManagerDescriptor {
        id: ManagerId::Cargo,
        display_name: "cargo",
        category: ManagerCategory::Language,
        tier: AuthorityTier::Standard,
        capabilities: CARGO_CAPABILITIES,
        os_update_class: false,
        confirms_versions: true,
    },
    ManagerDescriptor {
        id: ManagerId::Homebrew,
        display_name: "Homebrew",
        category: ManagerCategory::Formula,
        tier: AuthorityTier::Guarded,
        capabilities: HOMEBREW_CAPABILITIES,
        os_update_class: false,
        confirms_versions: true,
    },
    ManagerDescriptor {
        id: ManagerId::SoftwareUpdate,
        display_name: "softwareupdate",
        category: ManagerCategory::OsUpdate,
        tier: AuthorityTier::Guarded,
        capabilities: OS_UPDATE_CAPABILITIES,
        os_update_class: true,
        confirms_versions: false,
    },
];

pub fn catalog() -> &'static [ManagerDescriptor] {
    &CATALOG
}

pub fn descriptor(id: ManagerId) -> &'static ManagerDescriptor {
    match id {
        ManagerId::Mise => &CATALOG[0],
        ManagerId::Rustup => &CATALOG[1],
        ManagerId::Npm => &CATALOG[2],
        ManagerId::Pip => &CATALOG[3],
        ManagerId::Cargo => &CATALOG[4],
        ManagerId::Homebrew => &CATALOG[5],
        ManagerId::SoftwareUpdate => &CATALOG[6],
    }
}
