use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use convoy_core::error::validate_package_name;
use convoy_core::{
    Capability, CoreError, CoreResult, DetectionInfo, ManagerDescriptor, ManagerId, PackageRecord,
    PackageRef, descriptor,
};
use convoy_executor::{CommandSpec, ExecHarness};

use crate::contract::{ManagerAdapter, ensure_capability};

const MISE_COMMAND: &str = "mise";
const DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(60);
const MUTATION_TIMEOUT: Duration = Duration::from_secs(600);

pub struct MiseAdapter {
    harness: ExecHarness,
}

impl MiseAdapter {
    pub fn new(harness: ExecHarness) -> Self {
        Self { harness }
    }
}

#[async_trait]
impl ManagerAdapter for MiseAdapter {
    fn descriptor(&self) -> &'static ManagerDescriptor {
        descriptor(ManagerId::Mise)
    }

    async fn detect(&self) -> CoreResult<DetectionInfo> {
        let spec = CommandSpec::new(MISE_COMMAND).arg("--version");
        let captured = match self
            .harness
            .run_expect_success(ManagerId::Mise, spec, Some(DETECT_TIMEOUT))
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
        let version = parse_mise_version(&captured);
        Ok(DetectionInfo {
            installed: version.is_some(),
            executable_path: None,
            version,
        })
    }

    async fn list_installed(&self) -> CoreResult<Vec<PackageRecord>> {
        let spec = CommandSpec::new(MISE_COMMAND).args(["ls", "--json"]);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Mise, spec, Some(LIST_TIMEOUT))
            .await?;
        parse_mise_installed(&stdout)
    }

    async fn list_outdated(&self) -> CoreResult<Vec<PackageRecord>> {
        let spec = CommandSpec::new(MISE_COMMAND).args(["outdated", "--json"]);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Mise, spec, Some(LIST_TIMEOUT))
            .await?;
        parse_mise_outdated(&stdout)
    }

    async fn install(&self, name: &str, version: Option<&str>) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Install, "install")?;
        validate_package_name(name)?;
        let tool = match version {
            Some(version) if !version.trim().is_empty() => format!("{name}@{}", version.trim()),
            _ => name.to_string(),
        };
        let spec = CommandSpec::new(MISE_COMMAND).arg("install").arg(tool);
        self.harness
            .run_expect_success(ManagerId::Mise, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Uninstall, "uninstall")?;
        validate_package_name(name)?;
        let spec = CommandSpec::new(MISE_COMMAND).arg("uninstall").arg(name);
        self.harness
            .run_expect_success(ManagerId::Mise, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn upgrade(&self, name: Option<&str>) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Upgrade, "upgrade")?;
        let mut spec = CommandSpec::new(MISE_COMMAND).arg("upgrade");
        if let Some(name) = name {
            validate_package_name(name)?;
            spec = spec.arg(name);
        }
        self.harness
            .run_expect_success(ManagerId::Mise, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }
}

fn parse_mise_version(output: &str) -> Option<String> {
    // "mise 2026.2.6 macos-x64" -> "2026.2.6"
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let rest = line.strip_prefix("mise ")?;
    let version = rest.split_whitespace().next()?;
    if version.is_empty() {
        return None;
    }
    Some(version.to_owned())
}

#[derive(Debug, Deserialize)]
struct MiseInstalledEntry {
    version: String,
    installed: bool,
}

fn parse_mise_installed(json: &str) -> CoreResult<Vec<PackageRecord>> {
    let tools: HashMap<String, Vec<MiseInstalledEntry>> = serde_json::from_str(json)
        .map_err(|e| CoreError::ParseFailed(format!("invalid mise ls JSON: {e}")))?;

    let mut packages = Vec::new();
    for (tool, entries) in &tools {
        for entry in entries.iter().filter(|entry| entry.installed) {
            packages.push(PackageRecord::installed(
                PackageRef::new(ManagerId::Mise, tool.clone()),
                entry.version.clone(),
            ));
        }
    }

    packages.sort_by(|a, b| {
        a.reference
            .name
            .cmp(&b.reference.name)
            .then_with(|| a.installed_version.cmp(&b.installed_version))
    });
    Ok(packages)
}

#[derive(Debug, Deserialize)]
struct MiseOutdatedEntry {
    current: String,
    latest: String,
}

fn parse_mise_outdated(json: &str) -> CoreResult<Vec<PackageRecord>> {
    let tools: HashMap<String, MiseOutdatedEntry> = serde_json::from_str(json)
        .map_err(|e| CoreError::ParseFailed(format!("invalid mise outdated JSON: {e}")))?;

    let mut packages: Vec<PackageRecord> = tools
        .into_iter()
        .map(|(tool, entry)| {
            PackageRecord::upgradable(
                PackageRef::new(ManagerId::Mise, tool),
                Some(entry.current),
                entry.latest,
            )
        })
        .collect();

    packages.sort_by(|a, b| a.reference.name.cmp(&b.reference.name));
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::PackageStatus;

    const INSTALLED_FIXTURE: &str = r#"{
        "node": [{"version": "22.5.1", "installed": true}],
        "python": [
            {"version": "3.12.3", "installed": true},
            {"version": "3.13.0", "installed": false}
        ]
    }"#;

    const OUTDATED_FIXTURE: &str = r#"{
        "node": {"current": "22.5.1", "latest": "22.12.0"},
        "python": {"current": "3.12.3", "latest": "3.12.8"}
    }"#;

    #[test]
    fn parses_version_banner() {
        assert_eq!(
            parse_mise_version("mise 2026.2.6 macos-x64\n").as_deref(),
            Some("2026.2.6")
        );
        assert!(parse_mise_version("").is_none());
        assert!(parse_mise_version("not-mise output").is_none());
    }

    #[test]
    fn installed_skips_entries_not_actually_installed() {
        let packages = parse_mise_installed(INSTALLED_FIXTURE).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].reference.name, "node");
        assert_eq!(packages[0].installed_version.as_deref(), Some("22.5.1"));
        assert_eq!(packages[1].reference.name, "python");
        assert_eq!(packages[1].status, PackageStatus::Installed);
    }

    #[test]
    fn outdated_carries_both_versions() {
        let packages = parse_mise_outdated(OUTDATED_FIXTURE).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].reference.name, "node");
        assert_eq!(packages[0].latest_version.as_deref(), Some("22.12.0"));
        assert_eq!(packages[0].status, PackageStatus::Upgradable);
    }

    #[test]
    fn empty_json_objects_parse_to_empty_lists() {
        assert!(parse_mise_installed("{}").unwrap().is_empty());
        assert!(parse_mise_outdated("{}").unwrap().is_empty());
    }

    #[test]
    fn invalid_json_is_a_parse_failure() {
        assert!(matches!(
            parse_mise_installed("not json"),
            Err(CoreError::ParseFailed(_))
        ));
    }
}
