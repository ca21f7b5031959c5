use convoy_core::{TaskLogLevel, TaskRecord};

/// Where terminal task records and lifecycle events land. The store implements
/// this; tests use `NullSink`. Records arrive already redacted.
pub trait TaskSink: Send + Sync {
    /// Upserts the terminal record for a task. Called once per task, plus at
    /// most once more if post-action validation reclassifies the outcome.
    fn record_terminal(&self, record: &TaskRecord);

    fn record_event(&self, record: &TaskRecord, level: TaskLogLevel, message: &str);
}

pub struct NullSink;

impl TaskSink for NullSink {
    fn record_terminal(&self, _record: &TaskRecord) {}

    fn record_event(&self, _record: &TaskRecord, _level: TaskLogLevel, _message: &str) {}
}
