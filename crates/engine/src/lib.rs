mod engine;

pub use engine::{Engine, TaskOutput};

pub use convoy_core::{
    CoreError, CoreResult, ManagerId, ManagerStatus, PackageRecord, PackageRef, PinRecord,
    TaskId, TaskLogEntry, TaskRecord,
};
pub use convoy_planner::{PlanScope, StepOutcome, UpgradePlan};
pub use convoy_store::{Store, StoreError};
