use std::time::Duration;

use futures::future::BoxFuture;

/// Factory for the body of a repeating task; invoked once per period.
pub type RepeatingTask = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle to a scheduled task.
pub trait TaskHandle: Send + Sync {
    /// Cancels the task. Cancellation is best-effort and idempotent;
    /// cancelling after the task already ran is a no-op.
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

/// Cooperative scheduler collaborator.
///
/// Every delayed, periodic, or offloaded execution in this crate goes through
/// this contract so host platforms can supply their own task plumbing.
pub trait Scheduler: Send + Sync {
    fn run(&self, task: BoxFuture<'static, ()>) -> Box<dyn TaskHandle>;

    fn run_later(&self, delay: Duration, task: BoxFuture<'static, ()>) -> Box<dyn TaskHandle>;

    fn run_repeating(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> Box<dyn TaskHandle>;
}
