use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use convoy_adapters::AdapterRegistry;
use convoy_core::{
    AuthorityTier, CoreResult, ManagerId, PackageRef, TaskAction, TaskId, TaskState,
};
use convoy_scheduler::Scheduler;

use crate::plan::{PlanScope, PlanStep, UpgradePlan};
use crate::validator::{PostActionValidator, ValidationOutcome};

/// Live enablement lookup consulted at dispatch time, so a manager disabled
/// mid-run stops contributing steps without touching the plan snapshot.
pub trait ManagerGate: Send + Sync {
    fn is_enabled(&self, id: ManagerId) -> bool;
}

pub struct AllEnabled;

impl ManagerGate for AllEnabled {
    fn is_enabled(&self, _id: ManagerId) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: u64,
    pub task: Option<TaskId>,
    pub state: TaskState,
}

/// Dispatch bookkeeping of one plan run. Task ids and recorded outcomes live
/// under a single lock: whether a step has been dispatched and whether it has
/// been marked cancelled-before-start must be decided in one critical section,
/// or a concurrent cancel could mark a step cancelled while the tier loop
/// dispatches it anyway.
#[derive(Default)]
struct RunState {
    tasks: HashMap<u64, TaskId>,
    outcomes: HashMap<u64, StepOutcome>,
}

/// Mutable state of one plan execution, shared between the driving future and
/// concurrent cancel requests.
pub struct PlanRun {
    pub plan: UpgradePlan,
    state: Mutex<RunState>,
    cancel_requested: AtomicBool,
}

impl PlanRun {
    pub fn new(plan: UpgradePlan) -> Self {
        Self {
            plan,
            state: Mutex::new(RunState::default()),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn task_for(&self, step_id: u64) -> Option<TaskId> {
        lock(&self.state).tasks.get(&step_id).copied()
    }

    /// Outcomes recorded so far, in execution order.
    pub fn outcomes(&self) -> Vec<StepOutcome> {
        let state = lock(&self.state);
        self.plan
            .steps
            .iter()
            .filter_map(|step| state.outcomes.get(&step.id).cloned())
            .collect()
    }

    fn record(&self, outcome: StepOutcome) {
        lock(&self.state).outcomes.insert(outcome.step_id, outcome);
    }
}

fn cancelled_before_start(step_id: u64) -> StepOutcome {
    StepOutcome {
        step_id,
        task: None,
        state: TaskState::Cancelled,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Drives a plan run with tier barriers: every step of a tier must be
/// terminal before the next tier dispatches. Failures never cancel siblings.
#[derive(Clone)]
pub struct PlanRunner {
    scheduler: Scheduler,
    registry: AdapterRegistry,
    gate: Arc<dyn ManagerGate>,
    validator: PostActionValidator,
}

impl PlanRunner {
    pub fn new(
        scheduler: Scheduler,
        registry: AdapterRegistry,
        gate: Arc<dyn ManagerGate>,
    ) -> Self {
        let validator = PostActionValidator::new(registry.clone());
        Self {
            scheduler,
            registry,
            gate,
            validator,
        }
    }

    pub async fn run(&self, run: Arc<PlanRun>) -> CoreResult<()> {
        for tier in [
            AuthorityTier::Authoritative,
            AuthorityTier::Standard,
            AuthorityTier::Guarded,
        ] {
            let steps: Vec<PlanStep> = run
                .plan
                .steps
                .iter()
                .filter(|step| step.tier == tier)
                .cloned()
                .collect();
            if steps.is_empty() {
                continue;
            }
            tracing::info!(?tier, steps = steps.len(), "dispatching plan tier");
            self.run_tier(&run, &steps).await?;
        }
        Ok(())
    }

    /// Re-submits a subset of step ids as fresh tasks. The prior attempt's
    /// history is untouched; the new tasks get new ids and new records.
    pub async fn retry(&self, run: &Arc<PlanRun>, step_ids: &[u64]) -> CoreResult<Vec<TaskId>> {
        let steps: Vec<PlanStep> = run
            .plan
            .steps
            .iter()
            .filter(|step| step_ids.contains(&step.id))
            .cloned()
            .collect();
        let mut spawned = Vec::new();
        for tier in [
            AuthorityTier::Authoritative,
            AuthorityTier::Standard,
            AuthorityTier::Guarded,
        ] {
            let tier_steps: Vec<PlanStep> = steps
                .iter()
                .filter(|step| step.tier == tier)
                .cloned()
                .collect();
            if tier_steps.is_empty() {
                continue;
            }
            spawned.extend(self.run_tier(run, &tier_steps).await?);
        }
        Ok(spawned)
    }

    /// Cancels steps still non-terminal within the scope. Steps not yet
    /// dispatched are marked cancelled and will never spawn a task.
    pub async fn cancel_remaining(
        &self,
        run: &Arc<PlanRun>,
        scope: &PlanScope,
    ) -> CoreResult<usize> {
        let full_scope = *scope == PlanScope::default();
        if full_scope {
            run.cancel_requested.store(true, Ordering::SeqCst);
        }

        let mut cancelled = 0;
        for step in run.plan.steps.iter().filter(|step| scope.matches(step)) {
            // Looked up and marked under one guard: a step seen undispatched
            // here can no longer be dispatched by the tier loop.
            let dispatched = {
                let mut state = lock(&run.state);
                match state.tasks.get(&step.id).copied() {
                    Some(task) => Some(task),
                    None => {
                        state.outcomes.insert(step.id, cancelled_before_start(step.id));
                        cancelled += 1;
                        None
                    }
                }
            };
            if let Some(task) = dispatched {
                if self.scheduler.cancel(task, CANCEL_GRACE).await? {
                    cancelled += 1;
                }
            }
        }
        Ok(cancelled)
    }

    async fn run_tier(&self, run: &Arc<PlanRun>, steps: &[PlanStep]) -> CoreResult<Vec<TaskId>> {
        let mut in_flight = Vec::new();
        for step in steps {
            if !self.gate.is_enabled(step.manager) {
                tracing::info!(
                    manager = %step.manager,
                    package = %step.package,
                    "step not dispatched: manager disabled"
                );
                run.record(cancelled_before_start(step.id));
                continue;
            }
            let adapter = self.registry.get(step.manager)?;
            let package = step.package.clone();

            // Cancel check and dispatch share one critical section, so a
            // cancelled-before-start step can never also spawn a task.
            let task = {
                let mut state = lock(&run.state);
                if run.cancel_requested.load(Ordering::SeqCst)
                    || state
                        .outcomes
                        .get(&step.id)
                        .is_some_and(|outcome| outcome.task.is_none())
                {
                    state.outcomes.insert(step.id, cancelled_before_start(step.id));
                    continue;
                }
                let task = self.scheduler.spawn(
                    step.manager,
                    TaskAction::Upgrade,
                    Some(step.package.clone()),
                    move |_cancel| async move { adapter.upgrade(Some(&package)).await },
                );
                state.tasks.insert(step.id, task);
                task
            };
            in_flight.push((step.clone(), task));
        }

        // Tier barrier: every dispatched step must be terminal before return.
        let mut spawned = Vec::new();
        for (step, task) in in_flight {
            let mut record = self.scheduler.wait_for_terminal(task).await?;
            if record.state == TaskState::Completed {
                let reference = PackageRef::new(step.manager, step.package.clone());
                let outcome = self
                    .validator
                    .confirm_upgrade(
                        &self.scheduler,
                        task,
                        &reference,
                        step.previous_version.as_deref(),
                    )
                    .await;
                match outcome {
                    Ok(ValidationOutcome::Mismatch(reclassified)) => record = reclassified,
                    Ok(_) => {}
                    Err(error) => {
                        // Inventory re-query failed; the provisional success
                        // stands but the incident is visible in the log.
                        tracing::warn!(%task, %error, "post-action validation query failed");
                    }
                }
            }
            run.record(StepOutcome {
                step_id: step.id,
                task: Some(task),
                state: record.state,
            });
            spawned.push(task);
        }
        Ok(spawned)
    }
}
