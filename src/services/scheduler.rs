use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::AbortHandle;

use crate::interfaces::scheduler::{RepeatingTask, Scheduler, TaskHandle};

/// Default [`Scheduler`] backed by the ambient tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn new() -> Self {
        Self
    }
}

struct SpawnedTask {
    cancelled: AtomicBool,
    abort: AbortHandle,
}

impl SpawnedTask {
    fn wrap(abort: AbortHandle) -> Box<dyn TaskHandle> {
        Box::new(Self {
            cancelled: AtomicBool::new(false),
            abort,
        })
    }
}

impl TaskHandle for SpawnedTask {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.abort.abort();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Scheduler for TokioScheduler {
    fn run(&self, task: BoxFuture<'static, ()>) -> Box<dyn TaskHandle> {
        SpawnedTask::wrap(tokio::spawn(task).abort_handle())
    }

    fn run_later(&self, delay: Duration, task: BoxFuture<'static, ()>) -> Box<dyn TaskHandle> {
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        SpawnedTask::wrap(join.abort_handle())
    }

    fn run_repeating(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> Box<dyn TaskHandle> {
        let join = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                task().await;
                tokio::time::sleep(period).await;
            }
        });
        SpawnedTask::wrap(join.abort_handle())
    }
}
