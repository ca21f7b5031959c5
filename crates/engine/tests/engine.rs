use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use convoy_adapters::standard_adapters;
use convoy_core::{
    CoreResult, FailureKind, ManagerId, PackageRecord, PackageRef, PinKind, TaskLogLevel,
    TaskState,
};
use convoy_engine::{Engine, PlanScope, Store};
use convoy_executor::{
    CommandSpec, ExecHarness, ExitDisposition, ProcessExecutor, ProcessOutput, RunningProcess,
    TerminationMode,
};

#[derive(Clone)]
struct Script {
    code: i32,
    stdout: String,
    stderr: String,
}

/// Plays back canned process output keyed by the exact command line. Anything
/// unscripted exits 127, which adapters read as "tool not present".
#[derive(Clone, Default)]
struct ScriptedExecutor {
    responses: Arc<Mutex<HashMap<String, Script>>>,
    invocations: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self::default()
    }

    fn script(&self, command: &str, code: i32, stdout: &str) {
        self.responses.lock().unwrap().insert(
            command.to_string(),
            Script {
                code,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    fn script_stderr(&self, command: &str, code: i32, stderr: &str) {
        self.responses.lock().unwrap().insert(
            command.to_string(),
            Script {
                code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        );
    }

    fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }
}

struct ScriptedProcess {
    output: ProcessOutput,
}

#[async_trait]
impl RunningProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn terminate(&self, _mode: TerminationMode) -> CoreResult<()> {
        Ok(())
    }

    async fn wait(self: Box<Self>) -> CoreResult<ProcessOutput> {
        Ok(self.output)
    }
}

#[async_trait]
impl ProcessExecutor for ScriptedExecutor {
    async fn spawn(
        &self,
        _manager: ManagerId,
        spec: &CommandSpec,
        _timeout: Option<Duration>,
    ) -> CoreResult<Box<dyn RunningProcess>> {
        let key = command_key(spec);
        self.invocations.lock().unwrap().push(key.clone());
        let script = self
            .responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or(Script {
                code: 127,
                stdout: String::new(),
                stderr: format!("command not scripted: {key}"),
            });
        let now = Utc::now();
        Ok(Box::new(ScriptedProcess {
            output: ProcessOutput {
                exit: ExitDisposition::Code(script.code),
                stdout: script.stdout.into_bytes(),
                stderr: script.stderr.into_bytes(),
                started_at: now,
                finished_at: now,
            },
        }))
    }
}

fn command_key(spec: &CommandSpec) -> String {
    let mut parts = vec![spec.program.display().to_string()];
    parts.extend(spec.args.iter().cloned());
    parts.join(" ")
}

fn engine_with(executor: &ScriptedExecutor, dir: &TempDir) -> (Engine, Store) {
    let store = Store::open(dir.path().join("convoy.json")).unwrap();
    let harness = ExecHarness::new(Arc::new(executor.clone()));
    let registry = standard_adapters(harness, Arc::new(store.clone()));
    (Engine::new(store.clone(), registry), store)
}

fn outdated(manager: ManagerId, name: &str, installed: &str, latest: &str) -> PackageRecord {
    PackageRecord::upgradable(
        PackageRef::new(manager, name),
        Some(installed.to_string()),
        latest,
    )
}

/// Polls until `check` passes or two seconds elapse.
async fn eventually<F: Fn() -> bool>(check: F, what: &str) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn refresh_merges_detection_and_inventory() {
    let executor = ScriptedExecutor::new();
    executor.script("mise --version", 0, "mise 2026.2.6 macos-x64\n");
    executor.script(
        "mise ls --json",
        0,
        r#"{"node": [{"version": "22.5.1", "installed": true}]}"#,
    );
    executor.script(
        "mise outdated --json",
        0,
        r#"{"node": {"current": "22.5.1", "latest": "22.12.0"}}"#,
    );

    let dir = TempDir::new().unwrap();
    let (engine, _store) = engine_with(&executor, &dir);

    let tasks = engine.refresh().unwrap();
    assert_eq!(tasks.len(), ManagerId::ALL.len());
    for task in tasks {
        engine.wait_for_task(task).await.unwrap();
    }

    let outdated = engine.list_outdated();
    assert_eq!(outdated.len(), 1);
    assert_eq!(outdated[0].reference.name, "node");
    assert_eq!(outdated[0].latest_version.as_deref(), Some("22.12.0"));

    let statuses = engine.manager_status();
    let mise = statuses
        .iter()
        .find(|status| status.id == ManagerId::Mise)
        .unwrap();
    let detection = mise.detection.as_ref().unwrap();
    assert!(detection.installed);
    assert_eq!(detection.version.as_deref(), Some("2026.2.6"));

    // Unscripted tools read as absent, not as errors.
    let npm = statuses
        .iter()
        .find(|status| status.id == ManagerId::Npm)
        .unwrap();
    assert!(!npm.detection.as_ref().unwrap().installed);
}

#[tokio::test]
async fn stale_version_after_upgrade_is_reclassified() {
    let executor = ScriptedExecutor::new();
    executor.script("brew upgrade --formula git", 0, "Already up-to-date.\n");
    // The re-queried inventory still reports the pre-upgrade version.
    executor.script("brew list --formula --versions", 0, "git 2.44.0\n");

    let dir = TempDir::new().unwrap();
    let (engine, store) = engine_with(&executor, &dir);
    store
        .replace_manager_packages(
            ManagerId::Homebrew,
            vec![outdated(ManagerId::Homebrew, "git", "2.44.0", "2.45.1")],
        )
        .unwrap();

    let git = PackageRef::new(ManagerId::Homebrew, "git");
    let task = engine.upgrade_package(&git).unwrap();
    engine.wait_for_task(task).await.unwrap();

    // Validation runs after the task turns terminal; poll for the rewrite.
    eventually(
        || {
            engine
                .task(task)
                .is_some_and(|record| record.state == TaskState::Failed)
        },
        "validation reclassification",
    )
    .await;

    let record = engine.task(task).unwrap();
    assert_eq!(record.failure, Some(FailureKind::ValidationMismatch));
    let error = record.error.unwrap();
    assert!(error.contains("2.44.0"), "error: {error}");
}

#[tokio::test]
async fn upgrade_all_runs_authoritative_managers_first() {
    let executor = ScriptedExecutor::new();
    executor.script("mise upgrade node", 0, "");
    executor.script("npm update -g typescript", 0, "");
    // Post-action validation queries, both confirming movement.
    executor.script(
        "mise ls --json",
        0,
        r#"{"node": [{"version": "22.12.0", "installed": true}]}"#,
    );
    executor.script(
        "npm ls -g --depth=0 --json",
        0,
        r#"{"dependencies": {"typescript": {"version": "5.5.2"}}}"#,
    );

    let dir = TempDir::new().unwrap();
    let (engine, store) = engine_with(&executor, &dir);
    // npm discovered before mise; tier order must still put mise first.
    store
        .replace_manager_packages(
            ManagerId::Npm,
            vec![outdated(ManagerId::Npm, "typescript", "5.4.5", "5.5.2")],
        )
        .unwrap();
    store
        .replace_manager_packages(
            ManagerId::Mise,
            vec![outdated(ManagerId::Mise, "node", "22.5.1", "22.12.0")],
        )
        .unwrap();

    let plan = engine.upgrade_all(false, false).unwrap();
    assert_eq!(plan.steps.len(), 2);
    assert_eq!(plan.steps[0].manager, ManagerId::Mise);

    eventually(
        || {
            let outcomes = engine.plan_outcomes();
            outcomes.len() == 2 && outcomes.iter().all(|o| o.state.is_terminal())
        },
        "plan completion",
    )
    .await;

    assert!(engine
        .plan_outcomes()
        .iter()
        .all(|outcome| outcome.state == TaskState::Completed));

    let invocations = executor.invocations();
    let mise_at = invocations
        .iter()
        .position(|command| command == "mise upgrade node")
        .unwrap();
    let npm_at = invocations
        .iter()
        .position(|command| command == "npm update -g typescript")
        .unwrap();
    assert!(mise_at < npm_at, "invocations: {invocations:?}");
}

#[tokio::test]
async fn pins_fall_back_to_virtual_and_filter_plans() {
    let executor = ScriptedExecutor::new();
    executor.script("brew pin git", 0, "");

    let dir = TempDir::new().unwrap();
    let (engine, store) = engine_with(&executor, &dir);

    // cargo has no native pin mechanism.
    let ripgrep = PackageRef::new(ManagerId::Cargo, "ripgrep");
    let task = engine.pin_package(&ripgrep, Some("14.1.1".to_string())).unwrap();
    let record = engine.wait_for_task(task).await.unwrap();
    assert_eq!(record.state, TaskState::Completed);

    let git = PackageRef::new(ManagerId::Homebrew, "git");
    let task = engine.pin_package(&git, None).unwrap();
    engine.wait_for_task(task).await.unwrap();

    let pins = engine.pins();
    let cargo_pin = pins.iter().find(|pin| pin.package == ripgrep).unwrap();
    assert_eq!(cargo_pin.kind, PinKind::Virtual);
    assert_eq!(cargo_pin.version.as_deref(), Some("14.1.1"));
    let brew_pin = pins.iter().find(|pin| pin.package == git).unwrap();
    assert_eq!(brew_pin.kind, PinKind::Native);

    // The virtual pin excludes the package from bulk upgrades.
    store
        .replace_manager_packages(
            ManagerId::Cargo,
            vec![outdated(ManagerId::Cargo, "ripgrep", "14.0.3", "14.1.1")],
        )
        .unwrap();
    let plan = engine.upgrade_all(false, false).unwrap();
    assert!(plan.steps.is_empty());
    let inclusive = engine.upgrade_all(true, false).unwrap();
    assert_eq!(inclusive.steps.len(), 1);
}

#[tokio::test]
async fn failed_upgrade_surfaces_redacted_diagnostics() {
    let executor = ScriptedExecutor::new();
    executor.script_stderr(
        "npm update -g typescript",
        1,
        "npm ERR! EACCES: permission denied, /Users/alex/.npm/_cacache\n",
    );

    let dir = TempDir::new().unwrap();
    let (engine, _store) = engine_with(&executor, &dir);

    let typescript = PackageRef::new(ManagerId::Npm, "typescript");
    let task = engine.upgrade_package(&typescript).unwrap();
    let record = engine.wait_for_task(task).await.unwrap();

    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.failure, Some(FailureKind::ExecutionFailed));
    let error = record.error.unwrap();
    assert!(error.contains("code 1"), "error: {error}");
    assert!(!error.contains("/Users/alex"), "error: {error}");

    let output = engine.task_output(task).unwrap();
    assert_eq!(output.command.as_deref(), Some("npm update -g typescript"));
    let stderr = output.stderr.unwrap();
    assert!(stderr.contains("EACCES"), "stderr: {stderr}");
    assert!(!stderr.contains("/Users/alex"), "stderr: {stderr}");

    let logs = engine.task_logs(task, Some(TaskLogLevel::Error), None, 0, 10);
    assert_eq!(logs.len(), 1);
}

#[tokio::test]
async fn remote_search_results_land_in_local_search() {
    let executor = ScriptedExecutor::new();
    executor.script(
        "cargo search --limit 20 --color never serde",
        0,
        "serde = \"1.0.219\"    # A generic serialization/deserialization framework\n",
    );

    let dir = TempDir::new().unwrap();
    let (engine, _store) = engine_with(&executor, &dir);

    assert!(engine.local_search("serde").is_empty());

    let task = engine.remote_search(ManagerId::Cargo, "serde").unwrap();
    let record = engine.wait_for_task(task).await.unwrap();
    assert_eq!(record.state, TaskState::Completed);

    let hits = engine.local_search("serde");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].reference, PackageRef::new(ManagerId::Cargo, "serde"));
    assert_eq!(hits[0].version.as_deref(), Some("1.0.219"));

    // softwareupdate has no search capability at all.
    assert!(engine
        .remote_search(ManagerId::SoftwareUpdate, "anything")
        .is_err());
}

#[tokio::test]
async fn cancel_plan_marks_undispatched_steps() {
    let executor = ScriptedExecutor::new();
    let dir = TempDir::new().unwrap();
    let (engine, store) = engine_with(&executor, &dir);
    store
        .replace_manager_packages(
            ManagerId::Npm,
            vec![
                outdated(ManagerId::Npm, "typescript", "5.4.5", "5.5.2"),
                outdated(ManagerId::Npm, "prettier", "3.2.0", "3.3.3"),
            ],
        )
        .unwrap();
    // Disable npm after planning would be racy; instead cancel before any
    // step has been observed terminal and check nothing is left pending.
    let plan = engine.upgrade_all(false, false).unwrap();
    assert_eq!(plan.steps.len(), 2);

    let cancelled = engine.cancel_plan(&PlanScope::default()).await.unwrap();
    assert!(cancelled <= 2);

    eventually(
        || {
            let outcomes = engine.plan_outcomes();
            outcomes.len() == 2 && outcomes.iter().all(|o| o.state.is_terminal())
        },
        "plan to settle after cancel",
    )
    .await;
}

#[tokio::test]
async fn manager_self_install_fails_as_unsupported() {
    let executor = ScriptedExecutor::new();
    let dir = TempDir::new().unwrap();
    let (engine, _store) = engine_with(&executor, &dir);

    let task = engine.self_install_manager(ManagerId::Rustup).unwrap();
    let record = engine.wait_for_task(task).await.unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.failure, Some(FailureKind::Unsupported));
    // No adapter can bootstrap its manager, so nothing may have been spawned.
    assert!(executor.invocations().is_empty());
}

#[tokio::test]
async fn task_history_survives_engine_restart() {
    let executor = ScriptedExecutor::new();
    executor.script("mise upgrade node", 0, "");
    executor.script("mise ls --json", 0, r#"{"node": [{"version": "22.12.0", "installed": true}]}"#);

    let dir = TempDir::new().unwrap();
    let first_task;
    {
        let (engine, store) = engine_with(&executor, &dir);
        first_task = engine
            .upgrade_package(&PackageRef::new(ManagerId::Mise, "node"))
            .unwrap();
        engine.wait_for_task(first_task).await.unwrap();
        // The terminal record is persisted just after waiters are notified.
        eventually(|| store.task(first_task).is_some(), "task persistence").await;
    }

    let (engine, _store) = engine_with(&executor, &dir);
    // History is still readable and new ids continue past the old ones.
    let history = engine.tasks(10);
    assert!(history.iter().any(|record| record.id == first_task));
    let next = engine
        .upgrade_package(&PackageRef::new(ManagerId::Mise, "node"))
        .unwrap();
    assert!(next > first_task);
    engine.wait_for_task(next).await.unwrap();
}
