use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use convoy_core::{
    Capability, CoreError, CoreResult, DetectionInfo, ManagerDescriptor, ManagerId, PackageRecord,
    PackageRef, descriptor,
};
use convoy_executor::{CommandSpec, ExecHarness};

use crate::contract::{ManagerAdapter, ensure_capability};

const SW_VERS_COMMAND: &str = "/usr/bin/sw_vers";
const SOFTWAREUPDATE_COMMAND: &str = "/usr/sbin/softwareupdate";
const DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(120);
const MUTATION_TIMEOUT: Duration = Duration::from_secs(3600);

/// macOS system updates. This manager cannot confirm per-package versions
/// after an install, so its descriptor opts out of post-action validation, and
/// every step it contributes is subject to the safe-mode veto.
pub struct SoftwareUpdateAdapter {
    harness: ExecHarness,
}

impl SoftwareUpdateAdapter {
    pub fn new(harness: ExecHarness) -> Self {
        Self { harness }
    }
}

#[async_trait]
impl ManagerAdapter for SoftwareUpdateAdapter {
    fn descriptor(&self) -> &'static ManagerDescriptor {
        descriptor(ManagerId::SoftwareUpdate)
    }

    async fn detect(&self) -> CoreResult<DetectionInfo> {
        let spec = CommandSpec::new(SW_VERS_COMMAND);
        let stdout = match self
            .harness
            .run_expect_success(ManagerId::SoftwareUpdate, spec, Some(DETECT_TIMEOUT))
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
        let version = parse_product_version(&stdout);
        Ok(DetectionInfo {
            installed: version.is_some(),
            executable_path: version
                .is_some()
                .then(|| PathBuf::from(SOFTWAREUPDATE_COMMAND)),
            version,
        })
    }

    async fn list_outdated(&self) -> CoreResult<Vec<PackageRecord>> {
        let spec = CommandSpec::new(SOFTWAREUPDATE_COMMAND).arg("-l");
        let stdout = self
            .harness
            .run_expect_success(ManagerId::SoftwareUpdate, spec, Some(LIST_TIMEOUT))
            .await?;
        Ok(parse_available_updates(&stdout))
    }

    async fn upgrade(&self, name: Option<&str>) -> CoreResult<()> {
        ensure_capability(self.descriptor(), Capability::Upgrade, "upgrade")?;
        let spec = match name {
            // Labels contain spaces, so only emptiness is rejected here; the
            // label is still a single argv element.
            Some(label) if !label.trim().is_empty() => {
                if label.starts_with('-') {
                    return Err(CoreError::InvalidInput(
                        "update label cannot start with '-'".to_string(),
                    ));
                }
                CommandSpec::new(SOFTWAREUPDATE_COMMAND).arg("-i").arg(label)
            }
            Some(_) => {
                return Err(CoreError::InvalidInput(
                    "update label cannot be empty".to_string(),
                ));
            }
            None => CommandSpec::new(SOFTWAREUPDATE_COMMAND).args(["-i", "-a"]),
        };
        self.harness
            .run_expect_success(ManagerId::SoftwareUpdate, spec, Some(MUTATION_TIMEOUT))
            .await?;
        Ok(())
    }
}

fn parse_product_version(output: &str) -> Option<String> {
    // sw_vers output:
    //   ProductName:    macOS
    //   ProductVersion: 15.3.1
    for line in output.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("ProductVersion:") {
            let version = rest.trim();
            if !version.is_empty() {
                return Some(version.to_owned());
            }
        }
    }
    None
}

/// `softwareupdate -l` emits one block per update:
///   * Label: macOS Sequoia 15.3.2-15.3.2
///       Title: ..., Version: 15.3.2, Size: ..., Recommended: YES, Action: restart,
fn parse_available_updates(output: &str) -> Vec<PackageRecord> {
    let mut updates = Vec::new();
    let mut label: Option<String> = None;
    let mut version: Option<String> = None;
    let mut restart_required = false;

    let mut flush =
        |label: &mut Option<String>, version: &mut Option<String>, restart: &mut bool| {
            if let (Some(label), Some(version)) = (label.take(), version.take()) {
                let mut record = PackageRecord::upgradable(
                    PackageRef::new(ManagerId::SoftwareUpdate, label),
                    None,
                    version,
                );
                record.restart_required = *restart;
                updates.push(record);
            }
            *restart = false;
        };

    for line in output.lines() {
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix("* Label:") {
            flush(&mut label, &mut version, &mut restart_required);
            label = Some(rest.trim().to_owned());
            continue;
        }

        if label.is_some() && (line.starts_with('\t') || line.starts_with("    ")) {
            for field in trimmed.split(',') {
                if let Some((key, value)) = field.trim().split_once(':') {
                    match key.trim() {
                        "Version" => version = Some(value.trim().to_owned()),
                        "Action" if value.trim().eq_ignore_ascii_case("restart") => {
                            restart_required = true;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    flush(&mut label, &mut version, &mut restart_required);

    updates
}
