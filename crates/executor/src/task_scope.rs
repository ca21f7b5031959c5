use std::future::Future;

use convoy_core::TaskId;

tokio::task_local! {
    static CURRENT_TASK: TaskId;
}

/// Runs a future with `task_id` as the ambient task, so process executions
/// deep inside an adapter can attribute their captured output to the task that
/// triggered them without threading the id through every call.
pub async fn scope<F>(task_id: TaskId, future: F) -> F::Output
where
    F: Future,
{
    CURRENT_TASK.scope(task_id, future).await
}

pub fn current() -> Option<TaskId> {
    CURRENT_TASK.try_with(|id| *id).ok()
}
