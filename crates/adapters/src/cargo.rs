use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use convoy_core::error::validate_package_name;
use convoy_core::{
    Capability, CoreError, CoreResult, DetectionInfo, ManagerDescriptor, ManagerId, PackageRecord,
    PackageRef, SearchHit, descriptor,
};
use convoy_executor::{CommandSpec, ExecHarness};

use crate::contract::{ManagerAdapter, ensure_capability};

const CARGO_COMMAND: &str = "cargo";
const DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(60);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const MUTATION_TIMEOUT: Duration = Duration::from_secs(1800);

/// Binaries installed with `cargo install`. The registry offers no cheap
/// outdated query, so this adapter advertises no `ListOutdated` capability.
pub struct CargoAdapter {
    harness: ExecHarness,
}

impl CargoAdapter {
    pub fn new(harness: ExecHarness) -> Self {
        Self { harness }
    }
}

#[async_trait]
impl ManagerAdapter for CargoAdapter {
    fn descriptor(&self) -> &'static ManagerDescriptor {
        descriptor(ManagerId::Cargo)
    }

    async fn detect(&self) -> CoreResult<DetectionInfo> {
        let spec = CommandSpec::new(CARGO_COMMAND).arg("--version");
        let stdout = match self
            .harness
            .run_expect_success(ManagerId::Cargo, spec, Some(DETECT_TIMEOUT))
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
        let version = parse_cargo_version(&stdout);
        Ok(DetectionInfo {
            installed: version.is_some(),
            executable_path: None,
            version,
        })
    }

    async fn list_installed(&self) -> CoreResult<Vec<PackageRecord>> {
        let spec = CommandSpec::new(CARGO_COMMAND).args(["install", "--list"]);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Cargo, spec, Some(LIST_TIMEOUT))
            .await?;
        Ok(parse_cargo_installed(&stdout))
    }

    async fn search(&self, query: &str) -> CoreResult<Vec<SearchHit>> {
        ensure_capability(self.descriptor(), Capability::Search, "search")?;
        let spec = CommandSpec::new(CARGO_COMMAND)
            .args(["search", "--limit", "20", "--color", "never"])
            .arg(query);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Cargo, spec, Some(SEARCH_TIMEOUT))
            .await?;
        Ok(parse_cargo_search(&stdout, query, Utc::now()))
    }

    async fn install(&self, name: &str, version: Option<&str>) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Install, "install")?;
        validate_package_name(name)?;
        let mut spec = CommandSpec::new(CARGO_COMMAND).args(["install", name]);
        if let Some(version) = version {
            let version = version.trim();
            if !version.is_empty() {
                spec = spec.args(["--version", version]);
            }
        }
        self.harness
            .run_expect_success(ManagerId::Cargo, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Uninstall, "uninstall")?;
        validate_package_name(name)?;
        let spec = CommandSpec::new(CARGO_COMMAND).args(["uninstall", name]);
        self.harness
            .run_expect_success(ManagerId::Cargo, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    /// `cargo install --force` reinstalls at the latest published version.
    /// There is no all-crates upgrade verb, so a target is required.
    async fn upgrade(&self, name: Option<&str>) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Upgrade, "upgrade")?;
        let Some(name) = name else {
            return Err(CoreError::InvalidInput(
                "cargo upgrade requires a crate name".to_string(),
            ));
        };
        validate_package_name(name)?;
        let spec = CommandSpec::new(CARGO_COMMAND).args(["install", "--force", name]);
        self.harness
            .run_expect_success(ManagerId::Cargo, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }
}

fn parse_cargo_version(output: &str) -> Option<String> {
    // "cargo 1.84.1 (66221abde 2024-11-19)" -> "1.84.1"
    let line = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    let rest = line.strip_prefix("cargo ")?;
    let version = rest.split_whitespace().next()?.trim();
    if version.is_empty() {
        return None;
    }
    Some(version.to_string())
}

/// `cargo install --list` prints crate headers ("ripgrep v14.1.1:") with
/// indented binary names below each; only headers matter here.
fn parse_cargo_installed(output: &str) -> Vec<PackageRecord> {
    let mut packages: Vec<PackageRecord> = output
        .lines()
        .filter(|line| !line.starts_with([' ', '\t']))
        .filter_map(|line| {
            let line = line.trim();
            let (name, rest) = line.split_once(" v")?;
            let crate_name = name.trim();
            let version = rest.trim_end_matches(':').trim();
            if crate_name.is_empty() || version.is_empty() {
                return None;
            }
            Some(PackageRecord::installed(
                PackageRef::new(ManagerId::Cargo, crate_name),
                version,
            ))
        })
        .collect();

    packages.sort_by(|a, b| a.reference.name.cmp(&b.reference.name));
    packages
}

/// `cargo search` lines look like `name = "version"  # summary`.
fn parse_cargo_search(
    output: &str,
    query: &str,
    cached_at: DateTime<Utc>,
) -> Vec<SearchHit> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("note:"))
        .filter_map(|line| {
            let (name_part, rhs) = line.split_once('=')?;
            let name = name_part.trim();
            if name.is_empty() {
                return None;
            }

            let first_quote = rhs.find('"')?;
            let after = &rhs[first_quote + 1..];
            let second_quote = after.find('"')?;
            let version = after[..second_quote].trim();

            let summary = rhs
                .find('#')
                .map(|pos| rhs[pos + 1..].trim().to_string())
                .filter(|summary| !summary.is_empty());

            Some(SearchHit {
                reference: PackageRef::new(ManagerId::Cargo, name),
                version: (!version.is_empty()).then(|| version.to_string()),
                summary,
                originating_query: query.to_string(),
                cached_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTALL_LIST_FIXTURE: &str = "\
ripgrep v14.1.1:
    rg
cargo-edit v0.12.2:
    cargo-add
    cargo-rm
";

    const SEARCH_FIXTURE: &str = r#"ripgrep = "14.1.1"    # Fast line-oriented search tool
grep-searcher = "0.1.14"
note: to learn more run `cargo info ripgrep`
"#;

    #[test]
    fn parses_version_banner() {
        assert_eq!(
            parse_cargo_version("cargo 1.84.1 (66221abde 2024-11-19)\n").as_deref(),
            Some("1.84.1")
        );
        assert!(parse_cargo_version("rustc 1.84.1").is_none());
    }

    #[test]
    fn install_list_ignores_indented_binary_lines() {
        let packages = parse_cargo_installed(INSTALL_LIST_FIXTURE);
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].reference.name, "cargo-edit");
        assert_eq!(packages[0].installed_version.as_deref(), Some("0.12.2"));
        assert_eq!(packages[1].reference.name, "ripgrep");
        assert_eq!(packages[1].installed_version.as_deref(), Some("14.1.1"));
    }

    #[test]
    fn search_parses_versions_and_summaries() {
        let hits = parse_cargo_search(SEARCH_FIXTURE, "rip", Utc::now());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].reference.name, "ripgrep");
        assert_eq!(hits[0].version.as_deref(), Some("14.1.1"));
        assert_eq!(
            hits[0].summary.as_deref(),
            Some("Fast line-oriented search tool")
        );
        assert!(hits[1].summary.is_none());
    }
}
