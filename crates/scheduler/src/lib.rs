pub mod cancel;
pub mod scheduler;
pub mod sink;

pub use cancel::CancelToken;
pub use scheduler::{Scheduler, failure_kind_for};
pub use sink::{NullSink, TaskSink};
