use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use convoy_adapters::CleanupPolicySource;
use convoy_core::{
    CleanupPolicy, FailureKind, ManagerId, PackageCleanupPolicy, PackageRecord, PackageStatus,
    PackageRef, PinRecord, SearchHit, TaskId, TaskLogEntry, TaskLogLevel, TaskRecord, TaskState,
};
use convoy_scheduler::TaskSink;

use crate::document::{Document, ManagerPrefs, load_document};
use crate::{StoreError, StoreResult};

const MAX_TASK_HISTORY: usize = 500;
const MAX_LOG_ENTRIES: usize = 2000;
const MAX_SEARCH_CACHE: usize = 500;

/// The persisted state behind one JSON file. Every mutator rewrites the file
/// atomically (tmp sibling, fsync, rename), so a crash leaves either the old
/// or the new document, never a torn one.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    state: Mutex<Document>,
}

impl Store {
    /// Opens (or seeds) the document at `path`. Tasks persisted as non-terminal
    /// by a previous process are marked `Failed(Interrupted)` here: nothing can
    /// still be running them.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let mut document = match fs::read_to_string(&path) {
            Ok(text) => load_document(&text)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Document::seeded(),
            Err(error) => return Err(StoreError::Io(error.to_string())),
        };

        let interrupted = recover_interrupted_tasks(&mut document);
        if interrupted > 0 {
            tracing::warn!(count = interrupted, "marked interrupted tasks from previous run");
        }

        write_document(&path, &document)?;
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                state: Mutex::new(document),
            }),
        })
    }

    /// Discards everything and reseeds an empty current-version document. The
    /// recovery path for `ResetRequired`.
    pub fn reset(&self) -> StoreResult<()> {
        let document = Document::seeded();
        write_document(&self.inner.path, &document)?;
        *self.state() = document;
        tracing::info!("store reset to seeded state");
        Ok(())
    }

    // -- packages -----------------------------------------------------------

    /// Replaces one manager's reported inventory wholesale; other managers'
    /// packages are untouched.
    pub fn replace_manager_packages(
        &self,
        manager: ManagerId,
        packages: Vec<PackageRecord>,
    ) -> StoreResult<()> {
        let mut state = self.state();
        state
            .packages
            .retain(|record| record.reference.manager != manager);
        state.packages.extend(packages);
        self.persist(&state)
    }

    pub fn packages(&self) -> Vec<PackageRecord> {
        self.state().packages.clone()
    }

    pub fn installed_packages(&self) -> Vec<PackageRecord> {
        self.state()
            .packages
            .iter()
            .filter(|record| {
                matches!(
                    record.status,
                    PackageStatus::Installed | PackageStatus::Upgradable
                )
            })
            .cloned()
            .collect()
    }

    pub fn outdated_packages(&self) -> Vec<PackageRecord> {
        self.state()
            .packages
            .iter()
            .filter(|record| record.status == PackageStatus::Upgradable)
            .cloned()
            .collect()
    }

    // -- tasks --------------------------------------------------------------

    pub fn task(&self, id: TaskId) -> Option<TaskRecord> {
        self.state()
            .tasks
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    /// Most recent first.
    pub fn recent_tasks(&self, limit: usize) -> Vec<TaskRecord> {
        let state = self.state();
        let mut tasks: Vec<_> = state.tasks.clone();
        tasks.sort_by(|a, b| b.id.cmp(&a.id));
        tasks.truncate(limit);
        tasks
    }

    // -- pins ---------------------------------------------------------------

    pub fn set_pin(&self, pin: PinRecord) -> StoreResult<()> {
        let mut state = self.state();
        state.pins.retain(|record| record.package != pin.package);
        state.pins.push(pin);
        self.persist(&state)
    }

    /// Returns whether a pin existed.
    pub fn remove_pin(&self, package: &PackageRef) -> StoreResult<bool> {
        let mut state = self.state();
        let before = state.pins.len();
        state.pins.retain(|record| record.package != *package);
        let removed = state.pins.len() != before;
        if removed {
            self.persist(&state)?;
        }
        Ok(removed)
    }

    pub fn pins(&self) -> Vec<PinRecord> {
        self.state().pins.clone()
    }

    pub fn pin_refs(&self) -> HashSet<PackageRef> {
        self.state()
            .pins
            .iter()
            .map(|record| record.package.clone())
            .collect()
    }

    // -- policies and preferences -------------------------------------------

    pub fn safe_mode(&self) -> bool {
        self.state().safe_mode
    }

    pub fn set_safe_mode(&self, enabled: bool) -> StoreResult<()> {
        let mut state = self.state();
        state.safe_mode = enabled;
        self.persist(&state)
    }

    pub fn manager_prefs(&self) -> Vec<ManagerPrefs> {
        let mut prefs = self.state().managers.clone();
        prefs.sort_by_key(|entry| entry.priority);
        prefs
    }

    pub fn is_enabled(&self, id: ManagerId) -> bool {
        self.state()
            .managers
            .iter()
            .find(|prefs| prefs.id == id)
            .is_none_or(|prefs| prefs.enabled)
    }

    pub fn enabled_managers(&self) -> HashSet<ManagerId> {
        ManagerId::ALL
            .into_iter()
            .filter(|id| self.is_enabled(*id))
            .collect()
    }

    pub fn set_manager_enabled(&self, id: ManagerId, enabled: bool) -> StoreResult<()> {
        let mut state = self.state();
        match state.managers.iter_mut().find(|prefs| prefs.id == id) {
            Some(prefs) => prefs.enabled = enabled,
            None => {
                let priority = state.managers.len() as u32;
                state.managers.push(ManagerPrefs {
                    id,
                    enabled,
                    priority,
                });
            }
        }
        self.persist(&state)
    }

    pub fn set_manager_priority(&self, id: ManagerId, priority: u32) -> StoreResult<()> {
        let mut state = self.state();
        match state.managers.iter_mut().find(|prefs| prefs.id == id) {
            Some(prefs) => prefs.priority = priority,
            None => {
                state.managers.push(ManagerPrefs {
                    id,
                    enabled: true,
                    priority,
                });
            }
        }
        self.persist(&state)
    }

    /// `Default` selection removes the record rather than storing a no-op row.
    pub fn set_cleanup_policy(
        &self,
        package: PackageRef,
        policy: CleanupPolicy,
    ) -> StoreResult<()> {
        let mut state = self.state();
        state
            .cleanup_policies
            .retain(|record| record.package != package);
        if policy != CleanupPolicy::Default {
            state
                .cleanup_policies
                .push(PackageCleanupPolicy { package, policy });
        }
        self.persist(&state)
    }

    pub fn cleanup_policies(&self) -> Vec<PackageCleanupPolicy> {
        self.state().cleanup_policies.clone()
    }

    // -- logs ---------------------------------------------------------------

    /// Log entries for one task, oldest first, filterable by level and
    /// lifecycle state, with offset/limit pagination.
    pub fn task_logs(
        &self,
        task: TaskId,
        level: Option<TaskLogLevel>,
        state_filter: Option<TaskState>,
        offset: usize,
        limit: usize,
    ) -> Vec<TaskLogEntry> {
        self.state()
            .logs
            .iter()
            .filter(|entry| entry.task == task)
            .filter(|entry| level.is_none_or(|wanted| entry.level == wanted))
            .filter(|entry| state_filter.is_none_or(|wanted| entry.state == Some(wanted)))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    // -- search cache -------------------------------------------------------

    /// Merges remote-search results into the cache, superseding stale entries
    /// for the same package.
    pub fn merge_search_hits(&self, hits: Vec<SearchHit>) -> StoreResult<()> {
        let mut state = self.state();
        for hit in hits {
            state
                .search_cache
                .retain(|cached| cached.reference != hit.reference);
            state.search_cache.push(hit);
        }
        let excess = state.search_cache.len().saturating_sub(MAX_SEARCH_CACHE);
        if excess > 0 {
            state.search_cache.drain(..excess);
        }
        self.persist(&state)
    }

    pub fn cached_search(&self, query: &str) -> Vec<SearchHit> {
        let needle = query.to_lowercase();
        self.state()
            .search_cache
            .iter()
            .filter(|hit| hit.reference.name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    // -- internals ----------------------------------------------------------

    fn state(&self) -> MutexGuard<'_, Document> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, document: &Document) -> StoreResult<()> {
        write_document(&self.inner.path, document)
    }

    fn upsert_task(&self, record: &TaskRecord) -> StoreResult<()> {
        let mut state = self.state();
        match state.tasks.iter_mut().find(|task| task.id == record.id) {
            Some(task) => *task = record.clone(),
            None => state.tasks.push(record.clone()),
        }
        let excess = state.tasks.len().saturating_sub(MAX_TASK_HISTORY);
        if excess > 0 {
            state.tasks.drain(..excess);
        }
        self.persist(&state)
    }

    fn append_log(
        &self,
        record: &TaskRecord,
        level: TaskLogLevel,
        message: &str,
    ) -> StoreResult<()> {
        let mut state = self.state();
        let id = state.next_log_id;
        state.next_log_id += 1;
        state.logs.push(TaskLogEntry {
            id,
            task: record.id,
            manager: record.manager,
            action: record.action,
            state: Some(record.state),
            level,
            message: message.to_string(),
            at: Utc::now(),
        });
        let excess = state.logs.len().saturating_sub(MAX_LOG_ENTRIES);
        if excess > 0 {
            state.logs.drain(..excess);
        }
        self.persist(&state)
    }
}

/// The scheduler hands records here at terminal transitions. Persistence
/// failure cannot fail the task itself, so it is logged and swallowed.
impl TaskSink for Store {
    fn record_terminal(&self, record: &TaskRecord) {
        if let Err(error) = self.upsert_task(record) {
            tracing::error!(task = %record.id, %error, "failed to persist task record");
        }
    }

    fn record_event(&self, record: &TaskRecord, level: TaskLogLevel, message: &str) {
        if let Err(error) = self.append_log(record, level, message) {
            tracing::error!(task = %record.id, %error, "failed to persist task log entry");
        }
    }
}

impl CleanupPolicySource for Store {
    fn cleanup_policy(&self, name: &str) -> CleanupPolicy {
        self.state()
            .cleanup_policies
            .iter()
            .find(|record| record.package.name == name)
            .map(|record| record.policy)
            .unwrap_or_default()
    }
}

fn recover_interrupted_tasks(document: &mut Document) -> usize {
    let mut interrupted = 0;
    for task in &mut document.tasks {
        if !task.state.is_terminal() {
            task.state = TaskState::Failed;
            task.failure = Some(FailureKind::Interrupted);
            task.error = Some("interrupted by process restart".to_string());
            task.ended_at = Some(Utc::now());
            interrupted += 1;
        }
    }
    interrupted
}

/// tmp sibling + fsync + rename; the destination is replaced atomically.
fn write_document(path: &Path, document: &Document) -> StoreResult<()> {
    let text = serde_json::to_string_pretty(document)
        .map_err(|error| StoreError::Io(format!("serialize: {error}")))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|error| StoreError::Io(error.to_string()))?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).map_err(|error| StoreError::Io(error.to_string()))?;
    file.write_all(text.as_bytes())
        .map_err(|error| StoreError::Io(error.to_string()))?;
    file.sync_all()
        .map_err(|error| StoreError::Io(error.to_string()))?;
    fs::rename(&tmp, path).map_err(|error| StoreError::Io(error.to_string()))?;
    Ok(())
}
