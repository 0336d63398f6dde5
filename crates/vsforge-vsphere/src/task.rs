//! Waiting on asynchronous platform tasks.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{VsphereError, VsphereResult};
use crate::platform::Platform;
use crate::types::{TaskInfo, TaskRef, TaskStatus};

pub const TASK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Poll `task` until it finishes.
///
/// A failed task becomes a `TaskError` carrying the platform's fault text.
/// Cancellation asks the platform to cancel the task (best effort) and
/// returns `Cancelled`.
pub async fn wait_for_task(
    platform: &dyn Platform,
    task: &TaskRef,
    cancel: &CancellationToken,
) -> VsphereResult<TaskInfo> {
    loop {
        let info = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(abort(platform, task).await),
            info = platform.task_info(task) => info?,
        };

        match info.status {
            TaskStatus::Succeeded => return Ok(info),
            TaskStatus::Failed => return Err(VsphereError::task(info.error_message())),
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Blocked => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(abort(platform, task).await),
            _ = tokio::time::sleep(TASK_POLL_INTERVAL) => {}
        }
    }
}

async fn abort(platform: &dyn Platform, task: &TaskRef) -> VsphereError {
    if let Err(e) = platform.cancel_task(task).await {
        log::warn!("failed to cancel task {task}: {e}");
    }
    VsphereError::cancelled(format!("task {task} cancelled"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VsphereErrorKind;
    use crate::simulator::SimulatedPlatform;
    use crate::types::SnapshotSpec;

    fn snapshot() -> SnapshotSpec {
        SnapshotSpec {
            name: "s".into(),
            description: String::new(),
            memory: false,
            quiesce: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_success() {
        let sim = SimulatedPlatform::lab();
        sim.set_task_delay(Duration::from_secs(2));
        let vm = sim.vm_id("ubuntu-template").unwrap();
        let task = sim.create_snapshot(&vm, &snapshot()).await.unwrap();
        let info = wait_for_task(&sim, &task, &CancellationToken::new()).await.unwrap();
        assert_eq!(info.status, TaskStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_carries_fault_text() {
        let sim = SimulatedPlatform::lab();
        sim.fail_next("create_snapshot", "disk locked");
        let vm = sim.vm_id("ubuntu-template").unwrap();
        let task = sim.create_snapshot(&vm, &snapshot()).await.unwrap();
        let err = wait_for_task(&sim, &task, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::TaskError);
        assert!(err.message.contains("disk locked"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_requests_task_cancel() {
        let sim = SimulatedPlatform::lab();
        sim.set_task_delay(Duration::from_secs(60));
        let vm = sim.vm_id("ubuntu-template").unwrap();
        let task = sim.create_snapshot(&vm, &snapshot()).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = wait_for_task(&sim, &task, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(sim.calls().iter().any(|c| c.starts_with("cancel_task")));
    }
}
