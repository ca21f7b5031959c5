use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use convoy_core::error::validate_package_name;
use convoy_core::{
    Capability, CleanupPolicy, CoreError, CoreResult, DetectionInfo, ManagerDescriptor, ManagerId,
    PackageRecord, PackageRef, SearchHit, descriptor,
};
use convoy_executor::{CommandSpec, ExecHarness};

use crate::contract::{CleanupPolicySource, ManagerAdapter, ensure_capability};

const BREW_COMMAND: &str = "brew";
const DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(120);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(60);
const MUTATION_TIMEOUT: Duration = Duration::from_secs(1800);

/// Formulae only; casks are out of scope. The per-package cleanup policy
/// shapes the mutation argv: keeping old revisions suppresses brew's
/// post-install cleanup, and a cleanup-everything preference removes all
/// revisions on uninstall.
pub struct HomebrewAdapter {
    harness: ExecHarness,
    policies: Arc<dyn CleanupPolicySource>,
}

impl HomebrewAdapter {
    pub fn new(harness: ExecHarness, policies: Arc<dyn CleanupPolicySource>) -> Self {
        Self { harness, policies }
    }
}

#[async_trait]
impl ManagerAdapter for HomebrewAdapter {
    fn descriptor(&self) -> &'static ManagerDescriptor {
        descriptor(ManagerId::Homebrew)
    }

    async fn detect(&self) -> CoreResult<DetectionInfo> {
        let spec = CommandSpec::new(BREW_COMMAND).arg("--version");
        let stdout = match self
            .harness
            .run_expect_success(ManagerId::Homebrew, spec, Some(DETECT_TIMEOUT))
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
        let version = parse_homebrew_version(&stdout);
        Ok(DetectionInfo {
            installed: version.is_some(),
            executable_path: None,
            version,
        })
    }

    async fn list_installed(&self) -> CoreResult<Vec<PackageRecord>> {
        let spec = CommandSpec::new(BREW_COMMAND).args(["list", "--formula", "--versions"]);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Homebrew, spec, Some(LIST_TIMEOUT))
            .await?;
        parse_installed_formulae(&stdout)
    }

    async fn list_outdated(&self) -> CoreResult<Vec<PackageRecord>> {
        let spec = CommandSpec::new(BREW_COMMAND).args(["outdated", "--formula", "--verbose"]);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Homebrew, spec, Some(LIST_TIMEOUT))
            .await?;
        parse_outdated_formulae(&stdout)
    }

    async fn search(&self, query: &str) -> CoreResult<Vec<SearchHit>> {
        ensure_capability(self.descriptor(), Capability::Search, "search")?;
        let spec = CommandSpec::new(BREW_COMMAND)
            .args(["search", "--formula"])
            .arg(query);
        let stdout = self
            .harness
            .run_expect_success(ManagerId::Homebrew, spec, Some(SEARCH_TIMEOUT))
            .await?;
        Ok(parse_search_formulae(&stdout, query, Utc::now()))
    }

    async fn install(&self, name: &str, _version: Option<&str>) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Install, "install")?;
        validate_package_name(name)?;
        let spec = CommandSpec::new(BREW_COMMAND)
            .args(["install", "--formula"])
            .arg(name);
        self.harness
            .run_expect_success(ManagerId::Homebrew, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Uninstall, "uninstall")?;
        validate_package_name(name)?;
        let spec = uninstall_spec(name, self.policies.cleanup_policy(name));
        self.harness
            .run_expect_success(ManagerId::Homebrew, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn upgrade(&self, name: Option<&str>) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Upgrade, "upgrade")?;
        if let Some(name) = name {
            validate_package_name(name)?;
        }
        let policy = name
            .map(|name| self.policies.cleanup_policy(name))
            .unwrap_or(CleanupPolicy::Default);
        let spec = upgrade_spec(name, policy);
        self.harness
            .run_expect_success(ManagerId::Homebrew, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn pin(&self, name: &str) -> CoreResult<bool> {
        ensure_capability(self.descriptor(), Capability::Pin, "pin")?;
        validate_package_name(name)?;
        let spec = CommandSpec::new(BREW_COMMAND).arg("pin").arg(name);
        self.harness
            .run_expect_success(ManagerId::Homebrew, spec, Some(LIST_TIMEOUT))
            .await?;
        Ok(true)
    }

    async fn unpin(&self, name: &str) -> CoreResult<bool> {
        ensure_capability(self.descriptor(), Capability::Pin, "unpin")?;
        validate_package_name(name)?;
        let spec = CommandSpec::new(BREW_COMMAND).arg("unpin").arg(name);
        self.harness
            .run_expect_success(ManagerId::Homebrew, spec, Some(LIST_TIMEOUT))
            .await?;
        Ok(true)
    }
}

fn upgrade_spec(name: Option<&str>, policy: CleanupPolicy) -> CommandSpec {
    let mut spec = CommandSpec::new(BREW_COMMAND).args(["upgrade", "--formula"]);
    if let Some(name) = name {
        spec = spec.arg(name);
    }
    if policy == CleanupPolicy::KeepOldRevisions {
        spec = spec.env("HOMEBREW_NO_INSTALL_CLEANUP", "1");
    }
    spec
}

fn uninstall_spec(name: &str, policy: CleanupPolicy) -> CommandSpec {
    let mut spec = CommandSpec::new(BREW_COMMAND).args(["uninstall", "--formula"]);
    if policy == CleanupPolicy::CleanupOldRevisions {
        // --force removes every installed revision of the keg, not just the
        // currently linked one.
        spec = spec.arg("--force");
    }
    spec.arg(name)
}

fn parse_homebrew_version(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.strip_prefix("Homebrew ").map(str::to_owned))
}

/// `brew list --formula --versions` may print several installed versions per
/// line; the last token is treated as the active version.
fn parse_installed_formulae(output: &str) -> CoreResult<Vec<PackageRecord>> {
    let mut parsed = Vec::new();
    let mut malformed = 0usize;

    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let mut segments = line.split_whitespace();
        match segments.next().filter(|name| !name.is_empty()) {
            Some(name) => {
                let version = segments.last().unwrap_or_default();
                if version.is_empty() {
                    malformed += 1;
                    continue;
                }
                parsed.push(PackageRecord::installed(
                    PackageRef::new(ManagerId::Homebrew, name),
                    version,
                ));
            }
            None => malformed += 1,
        }
    }

    if parsed.is_empty() && malformed > 0 {
        return Err(CoreError::ParseFailed(
            "unable to parse any installed formulae lines".to_string(),
        ));
    }
    Ok(parsed)
}

/// `brew outdated --verbose` lines: "git (2.44.0) < 2.45.1" or
/// "git 2.44.0 -> 2.45.1" depending on version; both arrow forms are handled.
fn parse_outdated_formulae(output: &str) -> CoreResult<Vec<PackageRecord>> {
    let mut parsed = Vec::new();
    let mut malformed = 0usize;

    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        match parse_outdated_line(line) {
            Some((name, installed, latest)) => parsed.push(PackageRecord::upgradable(
                PackageRef::new(ManagerId::Homebrew, name),
                installed,
                latest,
            )),
            None => malformed += 1,
        }
    }

    if parsed.is_empty() && malformed > 0 {
        return Err(CoreError::ParseFailed(
            "unable to parse any outdated formulae lines".to_string(),
        ));
    }
    Ok(parsed)
}

fn parse_outdated_line(line: &str) -> Option<(String, Option<String>, String)> {
    let (left, right) = line
        .split_once(" -> ")
        .or_else(|| line.split_once(" < "))?;
    let mut left_segments = left.split_whitespace();
    let name = left_segments.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let installed = left_segments
        .last()
        .map(|token| token.trim_matches(['(', ')']).to_owned())
        .filter(|token| !token.is_empty());
    let latest = right.trim();
    if latest.is_empty() {
        return None;
    }
    Some((name.to_owned(), installed, latest.to_owned()))
}

/// `brew search` output mixes section headers, formula columns, and a cask
/// section that must be skipped.
fn parse_search_formulae(output: &str, query: &str, cached_at: DateTime<Utc>) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    let mut seen = HashSet::new();
    let mut section = SearchSection::Unspecified;

    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(next) = parse_section_header(line) {
            section = next;
            continue;
        }
        if section == SearchSection::Casks || is_no_results_diagnostic(line) {
            continue;
        }

        for token in line.split_whitespace().filter(|t| is_formula_name_token(t)) {
            if seen.insert(token.to_string()) {
                hits.push(SearchHit {
                    reference: PackageRef::new(ManagerId::Homebrew, token),
                    version: None,
                    summary: None,
                    originating_query: query.to_string(),
                    cached_at,
                });
            }
        }
    }

    hits
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SearchSection {
    Unspecified,
    Formulae,
    Casks,
}

fn parse_section_header(line: &str) -> Option<SearchSection> {
    if !line.starts_with("==>") {
        return None;
    }
    let lowered = line.to_ascii_lowercase();
    if lowered.contains("formula") {
        return Some(SearchSection::Formulae);
    }
    if lowered.contains("cask") {
        return Some(SearchSection::Casks);
    }
    Some(SearchSection::Unspecified)
}

fn is_formula_name_token(token: &str) -> bool {
    if token.is_empty() || token.starts_with("==>") {
        return false;
    }
    token
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '@' | '+' | '-' | '_' | '.' | '/'))
}

fn is_no_results_diagnostic(line: &str) -> bool {
    let lowered = line.to_ascii_lowercase();
    lowered.starts_with("no formulae or casks found for")
        || lowered.starts_with("no formula or cask found for")
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTALLED_FIXTURE: &str = "\
python@3.12 3.12.2 3.12.3
git 2.44.0
node 22.5.1
ripgrep 14.1.1
";

    const OUTDATED_FIXTURE: &str = "\
git (2.44.0) < 2.45.1
node (22.5.1) < 22.12.0
ripgrep 14.0.3 -> 14.1.1
";

    const SEARCH_FIXTURE: &str = "\
==> Formulae
ripgrep      ripgrep-all      ripsecret
==> Casks
ripcord
";

    #[test]
    fn parses_version_banner() {
        assert_eq!(
            parse_homebrew_version("Homebrew 4.2.21\n").as_deref(),
            Some("4.2.21")
        );
        assert!(parse_homebrew_version("brew: command not found").is_none());
    }

    #[test]
    fn installed_uses_last_version_token() {
        let packages = parse_installed_formulae(INSTALLED_FIXTURE).unwrap();
        assert_eq!(packages.len(), 4);
        assert_eq!(packages[0].reference.name, "python@3.12");
        assert_eq!(packages[0].installed_version.as_deref(), Some("3.12.3"));
        assert_eq!(packages[2].reference.name, "node");
    }

    #[test]
    fn outdated_handles_both_arrow_forms() {
        let packages = parse_outdated_formulae(OUTDATED_FIXTURE).unwrap();
        assert_eq!(packages.len(), 3);
        assert_eq!(packages[0].reference.name, "git");
        assert_eq!(packages[0].installed_version.as_deref(), Some("2.44.0"));
        assert_eq!(packages[0].latest_version.as_deref(), Some("2.45.1"));
        assert_eq!(packages[2].installed_version.as_deref(), Some("14.0.3"));
    }

    #[test]
    fn fully_malformed_outdated_output_is_a_parse_failure() {
        assert!(matches!(
            parse_outdated_formulae("this-has-no-arrow"),
            Err(CoreError::ParseFailed(_))
        ));
    }

    #[test]
    fn search_skips_cask_section_and_diagnostics() {
        let hits = parse_search_formulae(SEARCH_FIXTURE, "rip", Utc::now());
        let names: Vec<_> = hits.iter().map(|hit| hit.reference.name.as_str()).collect();
        assert_eq!(names, vec!["ripgrep", "ripgrep-all", "ripsecret"]);

        let none = parse_search_formulae("No formulae or casks found for \"x\".", "x", Utc::now());
        assert!(none.is_empty());
    }

    #[test]
    fn keep_policy_suppresses_install_cleanup() {
        let spec = upgrade_spec(Some("git"), CleanupPolicy::KeepOldRevisions);
        assert_eq!(spec.args, vec!["upgrade", "--formula", "git"]);
        assert_eq!(
            spec.env.get("HOMEBREW_NO_INSTALL_CLEANUP").map(String::as_str),
            Some("1")
        );

        let plain = upgrade_spec(Some("git"), CleanupPolicy::Default);
        assert!(plain.env.is_empty());
    }

    #[test]
    fn cleanup_policy_forces_full_uninstall() {
        let spec = uninstall_spec("git", CleanupPolicy::CleanupOldRevisions);
        assert_eq!(spec.args, vec!["uninstall", "--formula", "--force", "git"]);

        let keep = uninstall_spec("git", CleanupPolicy::KeepOldRevisions);
        assert_eq!(keep.args, vec!["uninstall", "--formula", "git"]);
    }
}
