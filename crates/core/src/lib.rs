pub mod catalog;
pub mod error;
pub mod manager;
pub mod package;
pub mod pin;
pub mod policy;
pub mod task;

pub use catalog::{catalog, descriptor};
pub use error::{CoreError, CoreResult};
pub use manager::{
    AuthorityTier, Capability, DetectionInfo, ManagerCategory, ManagerDescriptor, ManagerId,
    ManagerStatus,
};
pub use package::{PackageRecord, PackageRef, PackageStatus, SearchHit};
pub use pin::{PinKind, PinRecord};
pub use policy::{CleanupPolicy, PackageCleanupPolicy, PlanPolicy};
pub use task::{
    FailureKind, TaskAction, TaskId, TaskLogEntry, TaskLogLevel, TaskRecord, TaskState,
};
