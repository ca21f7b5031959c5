use convoy_core::{CoreResult, PackageRef, TaskId, TaskRecord, descriptor};
use convoy_adapters::AdapterRegistry;
use convoy_scheduler::Scheduler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// The re-queried inventory shows the version moved (or gave no basis for
    /// comparison); the provisional success stands.
    Confirmed,
    /// The manager cannot confirm per-package versions; the skip is explicit.
    Skipped,
    /// The version did not move; the task was reclassified.
    Mismatch(TaskRecord),
}

/// Confirms that a completed upgrade actually changed something. A zero exit
/// code is only a provisional success for upgrade-class tasks.
#[derive(Clone)]
pub struct PostActionValidator {
    registry: AdapterRegistry,
}

impl PostActionValidator {
    pub fn new(registry: AdapterRegistry) -> Self {
        Self { registry }
    }

    /// Re-queries the manager's inventory for `package` and compares against
    /// the pre-upgrade version. On no movement the task becomes
    /// `Failed(ValidationMismatch)` through the scheduler's single sanctioned
    /// reclassification path.
    pub async fn confirm_upgrade(
        &self,
        scheduler: &Scheduler,
        task: TaskId,
        package: &PackageRef,
        previous_version: Option<&str>,
    ) -> CoreResult<ValidationOutcome> {
        let meta = descriptor(package.manager);
        if !meta.confirms_versions {
            tracing::info!(
                %task,
                manager = %package.manager,
                "validation skipped: manager cannot confirm versions"
            );
            return Ok(ValidationOutcome::Skipped);
        }
        let Some(previous) = previous_version else {
            // No pre-upgrade version was recorded, so there is nothing to
            // compare against.
            return Ok(ValidationOutcome::Confirmed);
        };

        let adapter = self.registry.get(package.manager)?;
        let installed = adapter.list_installed().await?;
        let current = installed
            .iter()
            .find(|record| record.reference.name == package.name)
            .and_then(|record| record.installed_version.as_deref());

        match current {
            Some(current) if current == previous => {
                let record = scheduler.reclassify_validation_failure(
                    task,
                    &format!("'{package}' still reports version {current} after upgrade"),
                )?;
                Ok(ValidationOutcome::Mismatch(record))
            }
            _ => Ok(ValidationOutcome::Confirmed),
        }
    }
}
