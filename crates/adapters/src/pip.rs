use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use convoy_core::error::validate_package_name;
use convoy_core::{
    Capability, CoreError, CoreResult, DetectionInfo, ManagerDescriptor, ManagerId, PackageRecord,
    PackageRef, SearchHit, descriptor,
};
use convoy_executor::{CommandSpec, ExecHarness};

use crate::contract::{ManagerAdapter, ensure_capability};

/// pip is always driven through the interpreter so the adapter and the user
/// agree on which site-packages is being mutated.
const PYTHON_COMMAND: &str = "python3";
const DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(60);
const MUTATION_TIMEOUT: Duration = Duration::from_secs(600);

pub struct PipAdapter {
    harness: ExecHarness,
}

impl PipAdapter {
    pub fn new(harness: ExecHarness) -> Self {
        Self { harness }
    }
}

#[async_trait]
impl ManagerAdapter for PipAdapter {
    fn descriptor(&self) -> &'static ManagerDescriptor {
        descriptor(ManagerId::Pip)
    }

    async fn detect(&self) -> CoreResult<DetectionInfo> {
        let spec = CommandSpec::new(PYTHON_COMMAND).args(["-m", "pip", "--version"]);
        let stdout = match self
            .harness
            .run_expect_success(ManagerId::Pip, spec, Some(DETECT_TIMEOUT))
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
        let version = parse_pip_version(&stdout);
        Ok(DetectionInfo {
            installed: version.is_some(),
            executable_path: None,
            version,
        })
    }

    async fn list_installed(&self) -> CoreResult<Vec<PackageRecord>> {
        let spec = CommandSpec::new(PYTHON_COMMAND).args([
            "-m",
            "pip",
            "list",
            "--format=json",
            "--disable-pip-version-check",
        ]);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Pip, spec, Some(LIST_TIMEOUT))
            .await?;
        parse_pip_list(&stdout)
    }

    async fn list_outdated(&self) -> CoreResult<Vec<PackageRecord>> {
        let spec = CommandSpec::new(PYTHON_COMMAND).args([
            "-m",
            "pip",
            "list",
            "--outdated",
            "--format=json",
            "--disable-pip-version-check",
        ]);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Pip, spec, Some(LIST_TIMEOUT))
            .await?;
        parse_pip_outdated(&stdout)
    }

    /// PyPI removed server-side search, so this filters the local inventory by
    /// a case-insensitive substring instead of issuing a remote query.
    async fn search(&self, query: &str) -> CoreResult<Vec<SearchHit>> {
        ensure_capability(self.descriptor(), Capability::Search, "search")?;
        let spec = CommandSpec::new(PYTHON_COMMAND).args([
            "-m",
            "pip",
            "list",
            "--format=json",
            "--disable-pip-version-check",
        ]);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Pip, spec, Some(LIST_TIMEOUT))
            .await?;
        parse_pip_local_search(&stdout, query, Utc::now())
    }

    async fn install(&self, name: &str, version: Option<&str>) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Install, "install")?;
        validate_package_name(name)?;
        let requirement = match version {
            Some(version) if !version.trim().is_empty() => format!("{name}=={}", version.trim()),
            _ => name.to_string(),
        };
        let spec = CommandSpec::new(PYTHON_COMMAND)
            .args(["-m", "pip", "install", "--disable-pip-version-check"])
            .arg(requirement);
        self.harness
            .run_expect_success(ManagerId::Pip, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Uninstall, "uninstall")?;
        validate_package_name(name)?;
        let spec = CommandSpec::new(PYTHON_COMMAND)
            .args(["-m", "pip", "uninstall", "-y", "--disable-pip-version-check"])
            .arg(name);
        self.harness
            .run_expect_success(ManagerId::Pip, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn upgrade(&self, name: Option<&str>) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Upgrade, "upgrade")?;
        // pip has no upgrade-everything verb; upgrading with no target means
        // upgrading pip itself.
        let target = match name {
            Some(name) => {
                validate_package_name(name)?;
                name
            }
            None => "pip",
        };
        let spec = CommandSpec::new(PYTHON_COMMAND)
            .args(["-m", "pip", "install", "--upgrade", "--disable-pip-version-check"])
            .arg(target);
        self.harness
            .run_expect_success(ManagerId::Pip, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PipListEntry {
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct PipOutdatedEntry {
    name: String,
    version: String,
    latest_version: String,
}

fn parse_pip_version(output: &str) -> Option<String> {
    // "pip 24.3.1 from /.../site-packages/pip (python 3.12)" -> "24.3.1"
    let line = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    let rest = line.strip_prefix("pip ")?;
    let version = rest.split_whitespace().next()?.trim();
    if version.is_empty() {
        return None;
    }
    Some(version.to_string())
}

fn parse_pip_list(output: &str) -> CoreResult<Vec<PackageRecord>> {
    let entries: Vec<PipListEntry> = serde_json::from_str(output)
        .map_err(|e| CoreError::ParseFailed(format!("invalid pip list JSON: {e}")))?;

    let mut packages: Vec<PackageRecord> = entries
        .into_iter()
        .filter_map(|entry| {
            let name = entry.name.trim().to_string();
            if name.is_empty() {
                return None;
            }
            Some(PackageRecord::installed(
                PackageRef::new(ManagerId::Pip, name),
                entry.version.trim(),
            ))
        })
        .collect();

    packages.sort_by(|a, b| a.reference.name.cmp(&b.reference.name));
    Ok(packages)
}

fn parse_pip_outdated(output: &str) -> CoreResult<Vec<PackageRecord>> {
    let entries: Vec<PipOutdatedEntry> = serde_json::from_str(output)
        .map_err(|e| CoreError::ParseFailed(format!("invalid pip outdated JSON: {e}")))?;

    let mut packages: Vec<PackageRecord> = entries
        .into_iter()
        .filter_map(|entry| {
            let name = entry.name.trim().to_string();
            let installed = entry.version.trim().to_string();
            let latest = entry.latest_version.trim().to_string();
            if name.is_empty() || latest.is_empty() {
                return None;
            }
            Some(PackageRecord::upgradable(
                PackageRef::new(ManagerId::Pip, name),
                (!installed.is_empty()).then_some(installed),
                latest,
            ))
        })
        .collect();

    packages.sort_by(|a, b| a.reference.name.cmp(&b.reference.name));
    Ok(packages)
}

fn parse_pip_local_search(
    output: &str,
    query: &str,
    cached_at: DateTime<Utc>,
) -> CoreResult<Vec<SearchHit>> {
    let entries: Vec<PipListEntry> = serde_json::from_str(output)
        .map_err(|e| CoreError::ParseFailed(format!("invalid pip list JSON: {e}")))?;

    let needle = query.to_ascii_lowercase();
    if needle.is_empty() {
        return Ok(Vec::new());
    }

    let mut hits: Vec<SearchHit> = entries
        .into_iter()
        .filter_map(|entry| {
            let name = entry.name.trim().to_string();
            if name.is_empty() || !name.to_ascii_lowercase().contains(&needle) {
                return None;
            }
            let version = entry.version.trim().to_string();
            Some(SearchHit {
                reference: PackageRef::new(ManagerId::Pip, name),
                version: (!version.is_empty()).then_some(version),
                summary: None,
                originating_query: query.to_string(),
                cached_at,
            })
        })
        .collect();

    hits.sort_by(|a, b| a.reference.name.cmp(&b.reference.name));
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_FIXTURE: &str = r#"[
        {"name": "requests", "version": "2.32.3"},
        {"name": "httpx", "version": "0.27.0"}
    ]"#;

    const OUTDATED_FIXTURE: &str = r#"[
        {"name": "requests", "version": "2.32.3", "latest_version": "2.32.4"},
        {"name": "", "version": "1.0", "latest_version": "2.0"}
    ]"#;

    #[test]
    fn parses_version_banner() {
        let banner = "pip 24.3.1 from /opt/homebrew/lib/python3.12/site-packages/pip (python 3.12)";
        assert_eq!(parse_pip_version(banner).as_deref(), Some("24.3.1"));
        assert!(parse_pip_version("python 3.12.3").is_none());
    }

    #[test]
    fn list_sorts_by_name() {
        let packages = parse_pip_list(LIST_FIXTURE).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].reference.name, "httpx");
        assert_eq!(packages[1].installed_version.as_deref(), Some("2.32.3"));
    }

    #[test]
    fn outdated_drops_nameless_entries() {
        let packages = parse_pip_outdated(OUTDATED_FIXTURE).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].latest_version.as_deref(), Some("2.32.4"));
    }

    #[test]
    fn local_search_filters_case_insensitively() {
        let hits = parse_pip_local_search(LIST_FIXTURE, "REQ", Utc::now()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].reference.name, "requests");
        assert_eq!(hits[0].originating_query, "REQ");
    }

    #[test]
    fn empty_query_matches_nothing() {
        assert!(parse_pip_local_search(LIST_FIXTURE, "", Utc::now())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn invalid_json_is_a_parse_failure() {
        assert!(matches!(
            parse_pip_list("nope"),
            Err(CoreError::ParseFailed(_))
        ));
    }
}
