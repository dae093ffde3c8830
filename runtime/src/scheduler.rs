//! Periodic background task spawning.
//!
//! Every recurring job in the runtime — the 5-second outbox tick, the
//! hourly DLQ sweep, the daily retention and expiry sweeps — runs through
//! [`spawn_periodic`]. The loop owns the interval and the error boundary:
//! a failed tick is logged and counted, never propagated, so one transient
//! infrastructure error cannot kill a background loop. The loops are safe
//! to run concurrently with request traffic and with each other across
//! process instances; the stores' atomic claims carry that guarantee.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Spawn a named periodic task.
///
/// `task` is invoked once per `every` interval. Ticks that overrun the
/// interval delay subsequent ticks instead of bursting. Errors are logged
/// at error level with the task name and counted under
/// `taskflow.scheduler.tick_errors`.
///
/// The returned handle aborts the loop when dropped into
/// [`JoinHandle::abort`] at shutdown.
pub fn spawn_periodic<F, Fut, E>(name: &'static str, every: Duration, mut task: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: std::fmt::Display,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(task = name, every_ms = every.as_millis(), "Periodic task started");

        loop {
            interval.tick().await;
            if let Err(err) = task().await {
                tracing::error!(task = name, error = %err, "Periodic task tick failed");
                metrics::counter!("taskflow.scheduler.tick_errors", "task" => name).increment(1);
            }
        }
    })
}
