pub mod plan;
pub mod runner;
pub mod validator;

pub use plan::{
    BreakdownEntry, PlanScope, PlanStep, UpgradePlan, breakdown, build_plan, scope_steps,
};
pub use runner::{AllEnabled, ManagerGate, PlanRun, PlanRunner, StepOutcome};
pub use validator::{PostActionValidator, ValidationOutcome};
