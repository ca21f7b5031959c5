pub mod command;
pub mod output_store;
pub mod process;
pub mod redact;
pub mod task_scope;

pub use command::CommandSpec;
pub use output_store::TaskOutputRecord;
pub use process::{
    Captured, ExecHarness, ExitDisposition, ProcessExecutor, ProcessOutput, RunningProcess,
    SystemProcessExecutor, TerminationMode, terminate_task_process,
};
pub use redact::redact;
