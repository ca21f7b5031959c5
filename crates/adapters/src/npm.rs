use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use convoy_core::error::validate_package_name;
use convoy_core::{
    Capability, CoreError, CoreResult, DetectionInfo, ManagerDescriptor, ManagerId, PackageRecord,
    PackageRef, SearchHit, descriptor,
};
use convoy_executor::{CommandSpec, ExecHarness, ExitDisposition};

use crate::contract::{ManagerAdapter, ensure_capability};

const NPM_COMMAND: &str = "npm";
const DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(60);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const MUTATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Global npm packages only; project-local node_modules are out of scope.
pub struct NpmAdapter {
    harness: ExecHarness,
}

impl NpmAdapter {
    pub fn new(harness: ExecHarness) -> Self {
        Self { harness }
    }
}

#[async_trait]
impl ManagerAdapter for NpmAdapter {
    fn descriptor(&self) -> &'static ManagerDescriptor {
        descriptor(ManagerId::Npm)
    }

    async fn detect(&self) -> CoreResult<DetectionInfo> {
        let spec = CommandSpec::new(NPM_COMMAND).arg("--version");
        let stdout = match self
            .harness
            .run_expect_success(ManagerId::Npm, spec, Some(DETECT_TIMEOUT))
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
        let version = parse_npm_version(&stdout);
        Ok(DetectionInfo {
            installed: version.is_some(),
            executable_path: None,
            version,
        })
    }

    async fn list_installed(&self) -> CoreResult<Vec<PackageRecord>> {
        let spec = CommandSpec::new(NPM_COMMAND).args(["ls", "-g", "--depth=0", "--json"]);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Npm, spec, Some(LIST_TIMEOUT))
            .await?;
        parse_npm_list_installed(&stdout)
    }

    /// `npm outdated` exits 1 when anything is outdated, so a non-zero exit
    /// with parseable stdout is still a successful listing.
    async fn list_outdated(&self) -> CoreResult<Vec<PackageRecord>> {
        let spec = CommandSpec::new(NPM_COMMAND).args(["outdated", "-g", "--json"]);
        let captured = self
            .harness
            .run(ManagerId::Npm, spec, Some(LIST_TIMEOUT))
            .await?;
        match captured.exit {
            ExitDisposition::Code(0) | ExitDisposition::Code(1) => {
                parse_npm_outdated(&captured.stdout)
            }
            _ => Err(CoreError::ExecutionFailed(format!(
                "npm outdated failed: {}",
                captured.stderr.trim()
            ))),
        }
    }

    async fn search(&self, query: &str) -> CoreResult<Vec<SearchHit>> {
        ensure_capability(self.descriptor(), Capability::Search, "search")?;
        let spec = CommandSpec::new(NPM_COMMAND)
            .args(["search", "--json", "--searchlimit=20"])
            .arg(query);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Npm, spec, Some(SEARCH_TIMEOUT))
            .await?;
        parse_npm_search(&stdout, query, Utc::now())
    }

    async fn install(&self, name: &str, version: Option<&str>) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Install, "install")?;
        validate_package_name(name)?;
        let package = match version {
            Some(version) if !version.trim().is_empty() => format!("{name}@{}", version.trim()),
            _ => name.to_string(),
        };
        let spec = CommandSpec::new(NPM_COMMAND).args(["install", "-g"]).arg(package);
        self.harness
            .run_expect_success(ManagerId::Npm, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Uninstall, "uninstall")?;
        validate_package_name(name)?;
        let spec = CommandSpec::new(NPM_COMMAND).args(["uninstall", "-g"]).arg(name);
        self.harness
            .run_expect_success(ManagerId::Npm, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn upgrade(&self, name: Option<&str>) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Upgrade, "upgrade")?;
        let mut spec = CommandSpec::new(NPM_COMMAND).args(["update", "-g"]);
        if let Some(name) = name {
            validate_package_name(name)?;
            spec = spec.arg(name);
        }
        self.harness
            .run_expect_success(ManagerId::Npm, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }
}

fn parse_npm_version(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    let version = line.split_whitespace().next()?.trim();
    if version.is_empty() || !version.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(version.to_owned())
}

fn parse_npm_list_installed(output: &str) -> CoreResult<Vec<PackageRecord>> {
    let json: Value = serde_json::from_str(output)
        .map_err(|e| CoreError::ParseFailed(format!("invalid npm ls JSON: {e}")))?;

    let mut dependencies = BTreeMap::new();
    if let Some(map) = json.get("dependencies").and_then(Value::as_object) {
        for (name, payload) in map {
            let version = payload
                .get("version")
                .and_then(Value::as_str)
                .or_else(|| payload.as_str())
                .map(str::trim)
                .filter(|value| !value.is_empty());
            if let Some(version) = version {
                dependencies.insert(name.clone(), version.to_string());
            }
        }
    }

    Ok(dependencies
        .into_iter()
        .map(|(name, version)| {
            PackageRecord::installed(PackageRef::new(ManagerId::Npm, name), version)
        })
        .collect())
}

fn parse_npm_outdated(output: &str) -> CoreResult<Vec<PackageRecord>> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "{}" {
        return Ok(Vec::new());
    }

    let json: Value = serde_json::from_str(trimmed)
        .map_err(|e| CoreError::ParseFailed(format!("invalid npm outdated JSON: {e}")))?;

    let mut packages = Vec::new();
    let Some(map) = json.as_object() else {
        return Ok(packages);
    };

    for (name, payload) in map {
        let installed = payload
            .get("current")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let latest = payload
            .get("latest")
            .and_then(Value::as_str)
            .or_else(|| payload.get("wanted").and_then(Value::as_str))
            .map(str::trim)
            .filter(|value| !value.is_empty());

        let Some(latest) = latest else {
            continue;
        };
        packages.push(PackageRecord::upgradable(
            PackageRef::new(ManagerId::Npm, name.clone()),
            installed,
            latest,
        ));
    }

    packages.sort_by(|a, b| a.reference.name.cmp(&b.reference.name));
    Ok(packages)
}

#[derive(Debug, Deserialize)]
struct NpmSearchEntry {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
}

/// npm emits either one JSON array or one JSON object per line depending on
/// version; both shapes are accepted.
fn parse_npm_search(
    output: &str,
    query: &str,
    cached_at: DateTime<Utc>,
) -> CoreResult<Vec<SearchHit>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<NpmSearchEntry> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
            .map_err(|e| CoreError::ParseFailed(format!("invalid npm search JSON: {e}")))?
    } else {
        trimmed
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    CoreError::ParseFailed(format!("invalid npm search JSON line: {e}"))
                })
            })
            .collect::<CoreResult<Vec<_>>>()?
    };

    let hits = entries
        .into_iter()
        .filter_map(|entry| {
            let name = entry.name.map(|name| name.trim().to_string())?;
            if name.is_empty() {
                return None;
            }
            Some(SearchHit {
                reference: PackageRef::new(ManagerId::Npm, name),
                version: entry
                    .version
                    .map(|version| version.trim().to_string())
                    .filter(|version| !version.is_empty()),
                summary: entry
                    .description
                    .map(|description| description.trim().to_string())
                    .filter(|description| !description.is_empty()),
                originating_query: query.to_string(),
                cached_at,
            })
        })
        .collect();

    Ok(hits)
}
