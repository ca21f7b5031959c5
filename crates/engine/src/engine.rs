use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use convoy_adapters::{AdapterRegistry, ManagerAdapter, standard_adapters};
use convoy_core::{
    Capability, CoreError, CoreResult, DetectionInfo, ManagerId, ManagerStatus,
    PackageCleanupPolicy, PackageRecord, PackageRef, PackageStatus, PinKind, PinRecord,
    PlanPolicy, SearchHit, TaskAction, TaskId, TaskLogEntry, TaskLogLevel, TaskRecord, TaskState,
    CleanupPolicy, descriptor,
};
use convoy_executor::{ExecHarness, SystemProcessExecutor};
use convoy_planner::{
    ManagerGate, PlanRun, PlanRunner, PlanScope, PostActionValidator, StepOutcome, UpgradePlan,
    build_plan,
};
use convoy_scheduler::Scheduler;
use convoy_store::Store;

const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Captured diagnostics for one task, already redacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task: TaskId,
    pub command: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Enablement lookup the plan runner consults at dispatch time.
struct StoreGate {
    store: Store,
}

impl ManagerGate for StoreGate {
    fn is_enabled(&self, id: ManagerId) -> bool {
        self.store.is_enabled(id)
    }
}

/// The narrow boundary the host process talks to. Reads return snapshots;
/// mutations that start background work return a `TaskId` immediately and
/// never block past submission.
pub struct Engine {
    store: Store,
    scheduler: Scheduler,
    registry: AdapterRegistry,
    runner: PlanRunner,
    validator: PostActionValidator,
    detections: Arc<Mutex<HashMap<ManagerId, DetectionInfo>>>,
    active_run: Mutex<Option<Arc<PlanRun>>>,
}

impl Engine {
    /// Opens the store at `path` and wires the real process executor.
    pub fn open(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let store = Store::open(path)?;
        let harness = ExecHarness::new(Arc::new(SystemProcessExecutor));
        let registry = standard_adapters(harness, Arc::new(store.clone()));
        Ok(Self::new(store, registry))
    }

    pub fn new(store: Store, registry: AdapterRegistry) -> Self {
        // Ids continue where persisted history left off, so history from a
        // previous process never collides with this one.
        let first_id = store
            .recent_tasks(1)
            .first()
            .map(|record| record.id.0 + 1)
            .unwrap_or(1);
        let scheduler = Scheduler::with_first_id(Arc::new(store.clone()), first_id);
        let gate: Arc<dyn ManagerGate> = Arc::new(StoreGate {
            store: store.clone(),
        });
        let runner = PlanRunner::new(scheduler.clone(), registry.clone(), gate);
        let validator = PostActionValidator::new(registry.clone());
        Self {
            store,
            scheduler,
            registry,
            runner,
            validator,
            detections: Arc::new(Mutex::new(HashMap::new())),
            active_run: Mutex::new(None),
        }
    }

    // -- inventory reads ------------------------------------------------------

    pub fn list_installed(&self) -> Vec<PackageRecord> {
        self.with_pin_flags(self.store.installed_packages())
    }

    pub fn list_outdated(&self) -> Vec<PackageRecord> {
        self.with_pin_flags(self.store.outdated_packages())
    }

    pub fn manager_status(&self) -> Vec<ManagerStatus> {
        let detections = lock(&self.detections);
        self.store
            .manager_prefs()
            .into_iter()
            .map(|prefs| {
                let meta = descriptor(prefs.id);
                ManagerStatus {
                    id: prefs.id,
                    display_name: meta.display_name.to_string(),
                    tier: meta.tier,
                    enabled: prefs.enabled,
                    priority: prefs.priority,
                    detection: detections.get(&prefs.id).cloned(),
                }
            })
            .collect()
    }

    pub fn pins(&self) -> Vec<PinRecord> {
        self.store.pins()
    }

    pub fn cleanup_policies(&self) -> Vec<PackageCleanupPolicy> {
        self.store.cleanup_policies()
    }

    pub fn safe_mode(&self) -> bool {
        self.store.safe_mode()
    }

    // -- refresh --------------------------------------------------------------

    /// Re-runs detection and inventory for every enabled manager, one task per
    /// manager so a broken tool degrades only itself.
    pub fn refresh(&self) -> CoreResult<Vec<TaskId>> {
        let mut tasks = Vec::new();
        for prefs in self.store.manager_prefs() {
            if !prefs.enabled {
                continue;
            }
            let manager = prefs.id;
            let adapter = self.registry.get(manager)?;
            let store = self.store.clone();
            let detections = Arc::clone(&self.detections);
            tasks.push(self.scheduler.spawn(
                manager,
                TaskAction::Refresh,
                None,
                move |_cancel| async move {
                    refresh_manager(manager, adapter, store, detections).await
                },
            ));
        }
        Ok(tasks)
    }

    // -- package mutations ------------------------------------------------------

    pub fn install_package(
        &self,
        package: &PackageRef,
        version: Option<String>,
    ) -> CoreResult<TaskId> {
        let adapter = self.registry.get(package.manager)?;
        let name = package.name.clone();
        Ok(self.scheduler.spawn(
            package.manager,
            TaskAction::Install,
            Some(package.name.clone()),
            move |_cancel| async move { adapter.install(&name, version.as_deref()).await },
        ))
    }

    pub fn uninstall_package(&self, package: &PackageRef) -> CoreResult<TaskId> {
        let adapter = self.registry.get(package.manager)?;
        let name = package.name.clone();
        Ok(self.scheduler.spawn(
            package.manager,
            TaskAction::Uninstall,
            Some(package.name.clone()),
            move |_cancel| async move { adapter.uninstall(&name).await },
        ))
    }

    /// Upgrades a single package. Success is provisional: a follow-up
    /// validation re-queries the inventory and may reclassify the task.
    pub fn upgrade_package(&self, package: &PackageRef) -> CoreResult<TaskId> {
        let meta = descriptor(package.manager);
        if meta.os_update_class && self.store.safe_mode() {
            return Err(CoreError::PolicyViolation(
                "safe mode blocks OS updates".to_string(),
            ));
        }
        let adapter = self.registry.get(package.manager)?;
        let previous = self
            .store
            .packages()
            .iter()
            .find(|record| record.reference == *package)
            .and_then(|record| record.installed_version.clone());
        let name = package.name.clone();
        let task = self.scheduler.spawn(
            package.manager,
            TaskAction::Upgrade,
            Some(package.name.clone()),
            move |_cancel| async move { adapter.upgrade(Some(&name)).await },
        );
        self.validate_when_done(task, package.clone(), previous);
        Ok(task)
    }

    fn validate_when_done(&self, task: TaskId, package: PackageRef, previous: Option<String>) {
        let scheduler = self.scheduler.clone();
        let validator = self.validator.clone();
        tokio::spawn(async move {
            let Ok(record) = scheduler.wait_for_terminal(task).await else {
                return;
            };
            if record.state != TaskState::Completed {
                return;
            }
            if let Err(error) = validator
                .confirm_upgrade(&scheduler, task, &package, previous.as_deref())
                .await
            {
                tracing::warn!(%task, %error, "post-action validation query failed");
            }
        });
    }

    // -- bulk upgrade -----------------------------------------------------------

    /// Builds and starts a tiered upgrade plan over everything currently
    /// outdated. Returns the immutable plan snapshot; progress is observed via
    /// `plan_outcomes` and the task records.
    pub fn upgrade_all(
        &self,
        include_pinned: bool,
        allow_os_updates: bool,
    ) -> CoreResult<UpgradePlan> {
        let policy = PlanPolicy {
            include_pinned,
            allow_os_updates,
            safe_mode: self.store.safe_mode(),
        };
        let outdated = self.list_outdated();
        let plan = build_plan(
            &outdated,
            &self.store.enabled_managers(),
            &self.store.pin_refs(),
            policy,
        );
        tracing::info!(steps = plan.steps.len(), "starting upgrade plan");

        let run = Arc::new(PlanRun::new(plan.clone()));
        *lock(&self.active_run) = Some(Arc::clone(&run));
        let runner = self.runner.clone();
        tokio::spawn(async move {
            if let Err(error) = runner.run(run).await {
                tracing::error!(%error, "upgrade plan run aborted");
            }
        });
        Ok(plan)
    }

    pub fn plan_outcomes(&self) -> Vec<StepOutcome> {
        lock(&self.active_run)
            .as_ref()
            .map(|run| run.outcomes())
            .unwrap_or_default()
    }

    /// Cancels the active plan's still-pending steps within `scope`.
    pub async fn cancel_plan(&self, scope: &PlanScope) -> CoreResult<usize> {
        let run = lock(&self.active_run).clone();
        match run {
            Some(run) => self.runner.cancel_remaining(&run, scope).await,
            None => Ok(0),
        }
    }

    /// Re-submits plan steps as fresh tasks; prior attempts stay in history.
    pub async fn retry_plan_steps(&self, step_ids: &[u64]) -> CoreResult<Vec<TaskId>> {
        let run = lock(&self.active_run)
            .clone()
            .ok_or_else(|| CoreError::InvalidInput("no active upgrade plan".to_string()))?;
        self.runner.retry(&run, step_ids).await
    }

    // -- manager self-management --------------------------------------------------

    /// No adapter can bootstrap its own manager today, so this task fails
    /// with a classified `Unsupported` outcome rather than being absent from
    /// the boundary.
    pub fn self_install_manager(&self, id: ManagerId) -> CoreResult<TaskId> {
        let adapter = self.registry.get(id)?;
        Ok(self.scheduler.spawn(
            id,
            TaskAction::SelfInstall,
            None,
            move |_cancel| async move { adapter.self_install().await },
        ))
    }

    pub fn self_update_manager(&self, id: ManagerId) -> CoreResult<TaskId> {
        let adapter = self.registry.get(id)?;
        Ok(self.scheduler.spawn(
            id,
            TaskAction::SelfUpdate,
            None,
            move |_cancel| async move { adapter.self_update().await },
        ))
    }

    pub fn self_uninstall_manager(&self, id: ManagerId) -> CoreResult<TaskId> {
        let adapter = self.registry.get(id)?;
        Ok(self.scheduler.spawn(
            id,
            TaskAction::SelfUninstall,
            None,
            move |_cancel| async move { adapter.self_uninstall().await },
        ))
    }

    // -- pins and policies ----------------------------------------------------------

    /// Attempts a native pin and falls back to a virtual one; either way a pin
    /// record lands in the store and the planner treats both identically.
    pub fn pin_package(
        &self,
        package: &PackageRef,
        version: Option<String>,
    ) -> CoreResult<TaskId> {
        let adapter = self.registry.get(package.manager)?;
        let store = self.store.clone();
        let reference = package.clone();
        Ok(self.scheduler.spawn(
            package.manager,
            TaskAction::Pin,
            Some(package.name.clone()),
            move |_cancel| async move {
                let native = adapter.pin(&reference.name).await?;
                let kind = if native { PinKind::Native } else { PinKind::Virtual };
                store.set_pin(PinRecord {
                    package: reference,
                    kind,
                    version,
                    created_at: Utc::now(),
                })?;
                Ok(())
            },
        ))
    }

    pub fn unpin_package(&self, package: &PackageRef) -> CoreResult<TaskId> {
        let adapter = self.registry.get(package.manager)?;
        let store = self.store.clone();
        let reference = package.clone();
        Ok(self.scheduler.spawn(
            package.manager,
            TaskAction::Unpin,
            Some(package.name.clone()),
            move |_cancel| async move {
                adapter.unpin(&reference.name).await?;
                store.remove_pin(&reference)?;
                Ok(())
            },
        ))
    }

    pub fn set_manager_enabled(&self, id: ManagerId, enabled: bool) -> CoreResult<()> {
        self.store.set_manager_enabled(id, enabled)?;
        Ok(())
    }

    pub fn set_manager_priority(&self, id: ManagerId, priority: u32) -> CoreResult<()> {
        self.store.set_manager_priority(id, priority)?;
        Ok(())
    }

    pub fn set_safe_mode(&self, enabled: bool) -> CoreResult<()> {
        self.store.set_safe_mode(enabled)?;
        Ok(())
    }

    pub fn set_cleanup_policy(
        &self,
        package: PackageRef,
        policy: CleanupPolicy,
    ) -> CoreResult<()> {
        self.store.set_cleanup_policy(package, policy)?;
        Ok(())
    }

    pub async fn cancel_task(&self, id: TaskId) -> CoreResult<bool> {
        self.scheduler.cancel(id, CANCEL_GRACE).await
    }

    pub fn reset_store(&self) -> CoreResult<()> {
        self.store.reset()?;
        Ok(())
    }

    // -- search ------------------------------------------------------------------

    /// Synchronous filter over the cached inventory plus prior remote-search
    /// results. Never runs a process.
    pub fn local_search(&self, query: &str) -> Vec<SearchHit> {
        let needle = query.to_lowercase();
        let now = Utc::now();
        let mut seen: HashSet<PackageRef> = HashSet::new();
        let mut hits = Vec::new();
        for record in self.store.packages() {
            if !record.reference.name.to_lowercase().contains(&needle) {
                continue;
            }
            seen.insert(record.reference.clone());
            hits.push(SearchHit {
                version: record
                    .installed_version
                    .clone()
                    .or_else(|| record.latest_version.clone()),
                summary: record.summary.clone(),
                reference: record.reference,
                originating_query: query.to_string(),
                cached_at: now,
            });
        }
        for hit in self.store.cached_search(query) {
            if seen.insert(hit.reference.clone()) {
                hits.push(hit);
            }
        }
        hits
    }

    /// Starts a remote search task; results merge into the cache when it
    /// completes and show up in subsequent `local_search` calls.
    pub fn remote_search(&self, manager: ManagerId, query: &str) -> CoreResult<TaskId> {
        if !descriptor(manager).supports(Capability::Search) {
            return Err(CoreError::unsupported(manager, "search"));
        }
        let adapter = self.registry.get(manager)?;
        let store = self.store.clone();
        let query = query.to_string();
        Ok(self.scheduler.spawn(
            manager,
            TaskAction::Search,
            None,
            move |_cancel| async move {
                let hits = adapter.search(&query).await?;
                store.merge_search_hits(hits)?;
                Ok(())
            },
        ))
    }

    // -- diagnostics ----------------------------------------------------------------

    /// Live record when the task belongs to this process, persisted record
    /// otherwise.
    pub fn task(&self, id: TaskId) -> Option<TaskRecord> {
        self.scheduler.snapshot(id).or_else(|| self.store.task(id))
    }

    /// Most recent first, merging live tasks over persisted history.
    pub fn tasks(&self, limit: usize) -> Vec<TaskRecord> {
        let mut by_id: HashMap<u64, TaskRecord> = self
            .store
            .recent_tasks(limit)
            .into_iter()
            .map(|record| (record.id.0, record))
            .collect();
        for record in self.scheduler.list() {
            by_id.insert(record.id.0, record);
        }
        let mut records: Vec<_> = by_id.into_values().collect();
        records.sort_by(|a, b| b.id.cmp(&a.id));
        records.truncate(limit);
        records
    }

    pub fn task_output(&self, id: TaskId) -> Option<TaskOutput> {
        self.task(id).map(|record| TaskOutput {
            task: record.id,
            command: record.command,
            stdout: record.stdout,
            stderr: record.stderr,
        })
    }

    pub fn task_logs(
        &self,
        task: TaskId,
        level: Option<TaskLogLevel>,
        state: Option<TaskState>,
        offset: usize,
        limit: usize,
    ) -> Vec<TaskLogEntry> {
        self.store.task_logs(task, level, state, offset, limit)
    }

    pub async fn wait_for_task(&self, id: TaskId) -> CoreResult<TaskRecord> {
        self.scheduler.wait_for_terminal(id).await
    }

    // -- internals --------------------------------------------------------------

    fn with_pin_flags(&self, mut records: Vec<PackageRecord>) -> Vec<PackageRecord> {
        let pins = self.store.pin_refs();
        for record in &mut records {
            if pins.contains(&record.reference) {
                record.pinned = true;
            }
        }
        records
    }
}

async fn refresh_manager(
    manager: ManagerId,
    adapter: Arc<dyn ManagerAdapter>,
    store: Store,
    detections: Arc<Mutex<HashMap<ManagerId, DetectionInfo>>>,
) -> CoreResult<()> {
    let info = adapter.detect().await?;
    lock(&detections).insert(manager, info.clone());
    if !info.installed {
        tracing::info!(%manager, "tool not detected, clearing inventory");
        store.replace_manager_packages(manager, Vec::new())?;
        return Ok(());
    }

    let meta = adapter.descriptor();
    let installed = if meta.supports(Capability::ListInstalled) {
        adapter.list_installed().await?
    } else {
        Vec::new()
    };
    let outdated = if meta.supports(Capability::ListOutdated) {
        adapter.list_outdated().await?
    } else {
        Vec::new()
    };
    let merged = merge_inventory(installed, outdated);
    tracing::info!(%manager, packages = merged.len(), "inventory refreshed");
    store.replace_manager_packages(manager, merged)?;
    Ok(())
}

/// Folds outdated reports into the installed set: a package present in both
/// becomes `Upgradable` with the latest version attached.
fn merge_inventory(
    installed: Vec<PackageRecord>,
    outdated: Vec<PackageRecord>,
) -> Vec<PackageRecord> {
    let mut records = installed;
    for update in outdated {
        match records
            .iter_mut()
            .find(|record| record.reference == update.reference)
        {
            Some(existing) => {
                existing.latest_version = update.latest_version;
                existing.status = PackageStatus::Upgradable;
                existing.restart_required = update.restart_required;
                if existing.installed_version.is_none() {
                    existing.installed_version = update.installed_version;
                }
            }
            None => records.push(update),
        }
    }
    records
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_marks_overlapping_packages_upgradable() {
        let reference = PackageRef::new(ManagerId::Npm, "typescript");
        let installed = vec![PackageRecord::installed(reference.clone(), "5.4.5")];
        let outdated = vec![PackageRecord::upgradable(
            reference.clone(),
            Some("5.4.5".to_string()),
            "5.5.2",
        )];

        let merged = merge_inventory(installed, outdated);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, PackageStatus::Upgradable);
        assert_eq!(merged[0].installed_version.as_deref(), Some("5.4.5"));
        assert_eq!(merged[0].latest_version.as_deref(), Some("5.5.2"));
    }

    #[test]
    fn merge_keeps_outdated_only_entries() {
        let merged = merge_inventory(
            Vec::new(),
            vec![PackageRecord::upgradable(
                PackageRef::new(ManagerId::SoftwareUpdate, "Safari18.3"),
                None,
                "18.3",
            )],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, PackageStatus::Upgradable);
    }
}
