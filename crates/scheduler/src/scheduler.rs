use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;

use convoy_core::{
    CoreError, CoreResult, FailureKind, ManagerId, TaskAction, TaskId, TaskLogLevel, TaskRecord,
    TaskState,
};
use convoy_executor::process::{TerminationMode, terminate_task_process};
use convoy_executor::{output_store, redact, task_scope};

use crate::cancel::CancelToken;
use crate::sink::TaskSink;

/// Maps an error to the failure classification persisted on the task record.
pub fn failure_kind_for(error: &CoreError) -> FailureKind {
    match error {
        CoreError::Unsupported { .. } => FailureKind::Unsupported,
        CoreError::DetectionFailed { .. } => FailureKind::DetectionFailed,
        CoreError::ExecutionFailed(_) => FailureKind::ExecutionFailed,
        CoreError::ParseFailed(_) => FailureKind::ParseFailed,
        CoreError::ValidationMismatch { .. } => FailureKind::ValidationMismatch,
        CoreError::PolicyViolation(_) | CoreError::InvalidInput(_) => FailureKind::PolicyViolation,
        CoreError::Cancelled => FailureKind::Interrupted,
        CoreError::Storage(_) | CoreError::Internal(_) => FailureKind::Internal,
    }
}

struct TaskEntry {
    record: TaskRecord,
    cancel: CancelToken,
    done: Arc<Notify>,
}

struct Inner {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, TaskEntry>>,
    /// One lock per manager. Holding it is the only path from `Queued` to
    /// `Running`, which serializes all work per manager while leaving
    /// different managers free to run concurrently.
    locks: HashMap<ManagerId, Arc<tokio::sync::Mutex<()>>>,
    sink: Arc<dyn TaskSink>,
}

/// Async task scheduler. Tasks move through
/// `Queued -> Running -> {Completed | Failed | Cancelled}`; terminal states are
/// immutable except for the one sanctioned validation reclassification.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(sink: Arc<dyn TaskSink>) -> Self {
        Self::with_first_id(sink, 1)
    }

    /// Seeds the id counter, so ids stay monotonic across process restarts
    /// when task history is persisted.
    pub fn with_first_id(sink: Arc<dyn TaskSink>, first_id: u64) -> Self {
        let locks = ManagerId::ALL
            .into_iter()
            .map(|id| (id, Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(first_id.max(1)),
                tasks: Mutex::new(HashMap::new()),
                locks,
                sink,
            }),
        }
    }

    /// Enqueues a unit of work for `manager` and returns its id immediately.
    /// The work future runs inside the task's output scope, so any process it
    /// executes attributes captured output to this task.
    pub fn spawn<F, Fut>(
        &self,
        manager: ManagerId,
        action: TaskAction,
        package: Option<String>,
        work: F,
    ) -> TaskId
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<()>> + Send + 'static,
    {
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let record = TaskRecord {
            id,
            manager,
            package,
            action,
            state: TaskState::Queued,
            failure: None,
            error: None,
            command: None,
            stdout: None,
            stderr: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        let cancel = CancelToken::new();
        {
            let mut tasks = lock_tasks(&self.inner.tasks);
            tasks.insert(
                id.0,
                TaskEntry {
                    record,
                    cancel: cancel.clone(),
                    done: Arc::new(Notify::new()),
                },
            );
        }
        tracing::debug!(task = %id, %manager, ?action, "task queued");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_task(inner, id, manager, cancel, work).await;
        });
        id
    }

    pub fn snapshot(&self, id: TaskId) -> Option<TaskRecord> {
        lock_tasks(&self.inner.tasks)
            .get(&id.0)
            .map(|entry| entry.record.clone())
    }

    pub fn list(&self) -> Vec<TaskRecord> {
        let mut records: Vec<_> = lock_tasks(&self.inner.tasks)
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|record| record.id);
        records
    }

    /// Blocks until the task reaches a terminal state and returns the final
    /// record.
    pub async fn wait_for_terminal(&self, id: TaskId) -> CoreResult<TaskRecord> {
        loop {
            let done = {
                let tasks = lock_tasks(&self.inner.tasks);
                let entry = tasks
                    .get(&id.0)
                    .ok_or_else(|| CoreError::Internal(format!("unknown task {id}")))?;
                if entry.record.state.is_terminal() {
                    return Ok(entry.record.clone());
                }
                Arc::clone(&entry.done)
            };
            let notified = done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Re-check after registering, so a notify between the two steps is
            // not lost.
            {
                let tasks = lock_tasks(&self.inner.tasks);
                if let Some(entry) = tasks.get(&id.0) {
                    if entry.record.state.is_terminal() {
                        return Ok(entry.record.clone());
                    }
                }
            }
            notified.await;
        }
    }

    /// Requests cancellation. A queued task flips directly to `Cancelled` and
    /// never runs. A running task gets SIGTERM on its process group, a grace
    /// period to exit, then SIGKILL; `Cancelled` is recorded only once the
    /// task future has actually finished. Returns `false` when the task was
    /// already terminal.
    pub async fn cancel(&self, id: TaskId, grace: Duration) -> CoreResult<bool> {
        enum Disposition {
            AlreadyTerminal,
            FlippedFromQueued(TaskRecord),
            Running,
        }

        let disposition = {
            let mut tasks = lock_tasks(&self.inner.tasks);
            let entry = tasks
                .get_mut(&id.0)
                .ok_or_else(|| CoreError::Internal(format!("unknown task {id}")))?;
            if entry.record.state.is_terminal() {
                Disposition::AlreadyTerminal
            } else {
                entry.cancel.cancel();
                if entry.record.state == TaskState::Queued {
                    entry.record.state = TaskState::Cancelled;
                    entry.record.error = Some("cancelled before start".to_string());
                    entry.record.ended_at = Some(Utc::now());
                    entry.done.notify_waiters();
                    Disposition::FlippedFromQueued(entry.record.clone())
                } else {
                    Disposition::Running
                }
            }
        };

        match disposition {
            Disposition::AlreadyTerminal => Ok(false),
            Disposition::FlippedFromQueued(record) => {
                tracing::info!(task = %id, "cancelled before start");
                self.inner.sink.record_terminal(&record);
                self.inner
                    .sink
                    .record_event(&record, TaskLogLevel::Warn, "cancelled before start");
                Ok(true)
            }
            Disposition::Running => {
                tracing::info!(task = %id, "cancelling running task");
                terminate_task_process(id, TerminationMode::Graceful);
                let graceful = tokio::time::timeout(grace, self.wait_for_terminal(id)).await;
                if graceful.is_err() {
                    tracing::warn!(task = %id, "grace period elapsed, escalating to SIGKILL");
                    terminate_task_process(id, TerminationMode::Kill);
                    self.wait_for_terminal(id).await?;
                }
                Ok(true)
            }
        }
    }

    /// The single sanctioned terminal-state rewrite: a completed upgrade whose
    /// post-action validation found no version movement becomes
    /// `Failed(ValidationMismatch)`. Every other transition is rejected.
    pub fn reclassify_validation_failure(
        &self,
        id: TaskId,
        message: &str,
    ) -> CoreResult<TaskRecord> {
        let redacted = redact(message);
        let record = {
            let mut tasks = lock_tasks(&self.inner.tasks);
            let entry = tasks
                .get_mut(&id.0)
                .ok_or_else(|| CoreError::Internal(format!("unknown task {id}")))?;
            if entry.record.state != TaskState::Completed || !entry.record.action.is_upgrade() {
                return Err(CoreError::InvalidInput(format!(
                    "task {id} is not a completed upgrade"
                )));
            }
            entry.record.state = TaskState::Failed;
            entry.record.failure = Some(FailureKind::ValidationMismatch);
            entry.record.error = Some(redacted.clone());
            entry.record.clone()
        };
        tracing::warn!(task = %id, "completed upgrade reclassified as validation mismatch");
        self.inner.sink.record_terminal(&record);
        self.inner
            .sink
            .record_event(&record, TaskLogLevel::Warn, &redacted);
        Ok(record)
    }
}

fn lock_tasks(tasks: &Mutex<HashMap<u64, TaskEntry>>) -> std::sync::MutexGuard<'_, HashMap<u64, TaskEntry>> {
    match tasks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn run_task<F, Fut>(
    inner: Arc<Inner>,
    id: TaskId,
    manager: ManagerId,
    cancel: CancelToken,
    work: F,
) where
    F: FnOnce(CancelToken) -> Fut + Send,
    Fut: Future<Output = CoreResult<()>> + Send,
{
    let lock = match inner.locks.get(&manager) {
        Some(lock) => Arc::clone(lock),
        None => return,
    };
    let _guard = lock.lock().await;

    // Dispatch gate: the only Queued -> Running transition. A task cancelled
    // while queued is already terminal here and must never run.
    {
        let mut tasks = lock_tasks(&inner.tasks);
        let Some(entry) = tasks.get_mut(&id.0) else {
            return;
        };
        if entry.record.state.is_terminal() {
            return;
        }
        entry.record.state = TaskState::Running;
        entry.record.started_at = Some(Utc::now());
    }
    tracing::info!(task = %id, %manager, "task running");

    let result = task_scope::scope(id, work(cancel.clone())).await;
    finalize(&inner, id, cancel, result);
}

fn finalize(inner: &Arc<Inner>, id: TaskId, cancel: CancelToken, result: CoreResult<()>) {
    let record = {
        let mut tasks = lock_tasks(&inner.tasks);
        let Some(entry) = tasks.get_mut(&id.0) else {
            return;
        };
        if entry.record.state.is_terminal() {
            return;
        }

        if let Some(output) = output_store::get(id) {
            entry.record.command = output.command.map(|c| redact(&c));
            entry.record.stdout = output.stdout.map(|s| redact(&s));
            entry.record.stderr = output.stderr.map(|s| redact(&s));
        }

        match result {
            _ if cancel.is_cancelled() => {
                entry.record.state = TaskState::Cancelled;
                entry.record.error = Some("cancelled".to_string());
            }
            Ok(()) => {
                entry.record.state = TaskState::Completed;
            }
            Err(CoreError::Cancelled) => {
                entry.record.state = TaskState::Cancelled;
                entry.record.error = Some("cancelled".to_string());
            }
            Err(error) => {
                entry.record.state = TaskState::Failed;
                entry.record.failure = Some(failure_kind_for(&error));
                entry.record.error = Some(redact(&error.to_string()));
            }
        }
        entry.record.ended_at = Some(Utc::now());
        entry.done.notify_waiters();
        entry.record.clone()
    };

    match record.state {
        TaskState::Completed => tracing::info!(task = %id, "task completed"),
        TaskState::Cancelled => tracing::info!(task = %id, "task cancelled"),
        _ => tracing::warn!(task = %id, failure = ?record.failure, "task failed"),
    }
    inner.sink.record_terminal(&record);
    let (level, message) = match record.state {
        TaskState::Completed => (TaskLogLevel::Info, "completed".to_string()),
        TaskState::Cancelled => (TaskLogLevel::Warn, "cancelled".to_string()),
        _ => (
            TaskLogLevel::Error,
            record.error.clone().unwrap_or_else(|| "failed".to_string()),
        ),
    };
    inner.sink.record_event(&record, level, &message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullSink;
    use std::sync::atomic::AtomicBool;

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(NullSink))
    }

    #[tokio::test]
    async fn tasks_for_one_manager_never_overlap() {
        let sched = scheduler();
        let in_flight = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        let mut ids = Vec::new();
        for _ in 0..4 {
            let in_flight = Arc::clone(&in_flight);
            let overlapped = Arc::clone(&overlapped);
            ids.push(sched.spawn(
                ManagerId::Homebrew,
                TaskAction::Refresh,
                None,
                move |_cancel| async move {
                    if in_flight.swap(true, Ordering::SeqCst) {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.store(false, Ordering::SeqCst);
                    Ok(())
                },
            ));
        }
        for id in ids {
            let record = sched.wait_for_terminal(id).await.unwrap();
            assert_eq!(record.state, TaskState::Completed);
        }
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn different_managers_run_concurrently() {
        let sched = scheduler();
        let (first_tx, first_rx) = tokio::sync::oneshot::channel::<()>();
        let (second_tx, second_rx) = tokio::sync::oneshot::channel::<()>();

        // Each task completes only once the other has started; a serialized
        // scheduler would deadlock and trip the timeouts.
        let a = sched.spawn(ManagerId::Npm, TaskAction::Refresh, None, move |_c| async move {
            let _ = first_tx.send(());
            tokio::time::timeout(Duration::from_secs(5), second_rx)
                .await
                .map_err(|_| CoreError::Internal("peer never started".to_string()))?
                .map_err(|_| CoreError::Internal("peer dropped".to_string()))?;
            Ok(())
        });
        let b = sched.spawn(ManagerId::Pip, TaskAction::Refresh, None, move |_c| async move {
            let _ = second_tx.send(());
            tokio::time::timeout(Duration::from_secs(5), first_rx)
                .await
                .map_err(|_| CoreError::Internal("peer never started".to_string()))?
                .map_err(|_| CoreError::Internal("peer dropped".to_string()))?;
            Ok(())
        });

        assert_eq!(
            sched.wait_for_terminal(a).await.unwrap().state,
            TaskState::Completed
        );
        assert_eq!(
            sched.wait_for_terminal(b).await.unwrap().state,
            TaskState::Completed
        );
    }

    #[tokio::test]
    async fn queued_task_cancelled_before_start_never_runs() {
        let sched = scheduler();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let ran = Arc::new(AtomicBool::new(false));

        let holder = sched.spawn(
            ManagerId::Cargo,
            TaskAction::Refresh,
            None,
            move |_c| async move {
                let _ = release_rx.await;
                Ok(())
            },
        );
        // Give the holder a moment to take the manager lock.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ran_clone = Arc::clone(&ran);
        let queued = sched.spawn(
            ManagerId::Cargo,
            TaskAction::Upgrade,
            Some("ripgrep".to_string()),
            move |_c| async move {
                ran_clone.store(true, Ordering::SeqCst);
                Ok(())
            },
        );

        assert!(sched.cancel(queued, Duration::from_millis(100)).await.unwrap());
        let record = sched.wait_for_terminal(queued).await.unwrap();
        assert_eq!(record.state, TaskState::Cancelled);
        assert!(record.started_at.is_none());

        let _ = release_tx.send(());
        sched.wait_for_terminal(holder).await.unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn running_task_cancel_is_confirmed_by_completion() {
        let sched = scheduler();
        let id = sched.spawn(
            ManagerId::Npm,
            TaskAction::Upgrade,
            Some("typescript".to_string()),
            move |cancel| async move {
                loop {
                    if cancel.is_cancelled() {
                        return Err(CoreError::Cancelled);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            },
        );

        // Wait until it is running.
        loop {
            match sched.snapshot(id) {
                Some(record) if record.state == TaskState::Running => break,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }

        assert!(sched.cancel(id, Duration::from_secs(1)).await.unwrap());
        let record = sched.wait_for_terminal(id).await.unwrap();
        assert_eq!(record.state, TaskState::Cancelled);
        assert!(record.ended_at.is_some());

        // Second cancel is a no-op on a terminal task.
        assert!(!sched.cancel(id, Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn failure_carries_classification_and_redacted_error() {
        let sched = scheduler();
        let id = sched.spawn(ManagerId::Pip, TaskAction::Install, None, |_c| async {
            Err(CoreError::ExecutionFailed(
                "pip failed for /Users/alex/project".to_string(),
            ))
        });
        let record = sched.wait_for_terminal(id).await.unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.failure, Some(FailureKind::ExecutionFailed));
        let error = record.error.unwrap();
        assert!(!error.contains("/Users/alex"), "error: {error}");
    }

    #[tokio::test]
    async fn terminal_record_absorbs_captured_output() {
        let sched = scheduler();
        let id = sched.spawn(ManagerId::Homebrew, TaskAction::Refresh, None, |_c| async {
            let task = task_scope::current().ok_or(CoreError::Cancelled)?;
            output_store::record_command(task, "brew outdated --formula --verbose");
            output_store::record_streams(task, b"ripgrep 14.0.3 -> 14.1.1\n", b"");
            Ok(())
        });
        let record = sched.wait_for_terminal(id).await.unwrap();
        assert_eq!(record.state, TaskState::Completed);
        assert_eq!(
            record.command.as_deref(),
            Some("brew outdated --formula --verbose")
        );
        assert_eq!(record.stdout.as_deref(), Some("ripgrep 14.0.3 -> 14.1.1\n"));
    }

    #[tokio::test]
    async fn reclassification_only_touches_completed_upgrades() {
        let sched = scheduler();
        let upgrade = sched.spawn(
            ManagerId::Homebrew,
            TaskAction::Upgrade,
            Some("git".to_string()),
            |_c| async { Ok(()) },
        );
        let refresh = sched.spawn(ManagerId::Homebrew, TaskAction::Refresh, None, |_c| async {
            Ok(())
        });
        sched.wait_for_terminal(upgrade).await.unwrap();
        sched.wait_for_terminal(refresh).await.unwrap();

        let record = sched
            .reclassify_validation_failure(upgrade, "git still at 2.44.0")
            .unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.failure, Some(FailureKind::ValidationMismatch));

        assert!(sched
            .reclassify_validation_failure(refresh, "nope")
            .is_err());
        // Reclassifying twice is rejected: the record is no longer Completed.
        assert!(sched
            .reclassify_validation_failure(upgrade, "again")
            .is_err());
    }

    #[tokio::test]
    async fn reclassification_redacts_the_persisted_event() {
        struct CapturingSink {
            events: Mutex<Vec<String>>,
        }
        impl TaskSink for CapturingSink {
            fn record_terminal(&self, _record: &TaskRecord) {}
            fn record_event(&self, _record: &TaskRecord, _level: TaskLogLevel, message: &str) {
                if let Ok(mut events) = self.events.lock() {
                    events.push(message.to_string());
                }
            }
        }

        let sink = Arc::new(CapturingSink {
            events: Mutex::new(Vec::new()),
        });
        let sched = Scheduler::new(Arc::clone(&sink) as Arc<dyn TaskSink>);
        let upgrade = sched.spawn(
            ManagerId::Homebrew,
            TaskAction::Upgrade,
            Some("git".to_string()),
            |_c| async { Ok(()) },
        );
        sched.wait_for_terminal(upgrade).await.unwrap();

        let record = sched
            .reclassify_validation_failure(
                upgrade,
                "git still at 2.44.0 under /Users/alex/homebrew",
            )
            .unwrap();
        assert!(!record.error.unwrap().contains("/Users/alex"));

        let events = sink.events.lock().unwrap();
        assert!(events.iter().any(|message| message.contains("2.44.0")));
        assert!(events.iter().all(|message| !message.contains("/Users/alex")));
    }
}
