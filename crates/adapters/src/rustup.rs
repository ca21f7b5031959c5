use std::time::Duration;

use async_trait::async_trait;

use convoy_core::error::validate_package_name;
use convoy_core::{
    Capability, CoreError, CoreResult, DetectionInfo, ManagerDescriptor, ManagerId, PackageRecord,
    PackageRef, PackageStatus, descriptor,
};
use convoy_executor::{CommandSpec, ExecHarness};

use crate::contract::{ManagerAdapter, ensure_capability};

const RUSTUP_COMMAND: &str = "rustup";
const DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(60);
const MUTATION_TIMEOUT: Duration = Duration::from_secs(600);

pub struct RustupAdapter {
    harness: ExecHarness,
}

impl RustupAdapter {
    pub fn new(harness: ExecHarness) -> Self {
        Self { harness }
    }
}

#[async_trait]
impl ManagerAdapter for RustupAdapter {
    fn descriptor(&self) -> &'static ManagerDescriptor {
        descriptor(ManagerId::Rustup)
    }

    async fn detect(&self) -> CoreResult<DetectionInfo> {
        let spec = CommandSpec::new(RUSTUP_COMMAND).arg("--version");
        let stdout = match self
            .harness
            .run_expect_success(ManagerId::Rustup, spec, Some(DETECT_TIMEOUT))
            .await
        {
            Ok(stdout) => stdout,
            Err(CoreError::ExecutionFailed(_)) => {
                return Ok(DetectionInfo {
                    installed: false,
                    executable_path: None,
                    version: None,
                });
            }
            Err(error) => return Err(error),
        };
        let version = parse_rustup_version(&stdout);
        Ok(DetectionInfo {
            installed: version.is_some(),
            executable_path: None,
            version,
        })
    }

    async fn list_installed(&self) -> CoreResult<Vec<PackageRecord>> {
        let spec = CommandSpec::new(RUSTUP_COMMAND).args(["toolchain", "list"]);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Rustup, spec, Some(LIST_TIMEOUT))
            .await?;
        Ok(parse_toolchain_list(&stdout))
    }

    async fn list_outdated(&self) -> CoreResult<Vec<PackageRecord>> {
        let spec = CommandSpec::new(RUSTUP_COMMAND).arg("check");
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Rustup, spec, Some(LIST_TIMEOUT))
            .await?;
        Ok(parse_rustup_check(&stdout))
    }

    async fn upgrade(&self, name: Option<&str>) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Upgrade, "upgrade")?;
        let mut spec = CommandSpec::new(RUSTUP_COMMAND).arg("update");
        if let Some(toolchain) = name {
            validate_package_name(toolchain)?;
            spec = spec.arg(toolchain);
        }
        self.harness
            .run_expect_success(ManagerId::Rustup, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn self_update(&self) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::SelfManage, "self_update")?;
        let spec = CommandSpec::new(RUSTUP_COMMAND).args(["self", "update"]);
        self.harness
            .run_expect_success(ManagerId::Rustup, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn self_uninstall(&self) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::SelfManage, "self_uninstall")?;
        let spec = CommandSpec::new(RUSTUP_COMMAND).args(["self", "uninstall", "-y"]);
        self.harness
            .run_expect_success(ManagerId::Rustup, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }
}

fn parse_rustup_version(output: &str) -> Option<String> {
    // "rustup 1.28.2 (54dd3d00f 2024-04-24)" -> "1.28.2"
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let rest = line.strip_prefix("rustup ")?;
    let version = rest.split_whitespace().next()?;
    if version.is_empty() {
        return None;
    }
    Some(version.to_owned())
}

/// Each line: "stable-x86_64-apple-darwin (active, default)" or a bare
/// toolchain name. Toolchains have no separate version string.
fn parse_toolchain_list(output: &str) -> Vec<PackageRecord> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let name = match line.find(" (") {
                Some(paren) => &line[..paren],
                None => line,
            };
            if name.is_empty() {
                return None;
            }
            Some(PackageRecord {
                reference: PackageRef::new(ManagerId::Rustup, name),
                installed_version: None,
                latest_version: None,
                status: PackageStatus::Installed,
                pinned: false,
                restart_required: false,
                summary: None,
            })
        })
        .collect()
}

/// "stable-x86_64-apple-darwin - Update available : 1.82.0 -> 1.93.0"
fn parse_rustup_check(output: &str) -> Vec<PackageRecord> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("rustup -"))
        .filter_map(|line| {
            let (toolchain, update) = line.split_once(" - Update available : ")?;
            let toolchain = toolchain.trim();
            let (current, latest) = update.split_once(" -> ")?;
            let current = current.trim();
            let latest = latest.trim();
            if toolchain.is_empty() || latest.is_empty() {
                return None;
            }
            Some(PackageRecord::upgradable(
                PackageRef::new(ManagerId::Rustup, toolchain),
                (!current.is_empty()).then(|| current.to_owned()),
                latest,
            ))
        })
        .collect()
}
