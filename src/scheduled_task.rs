use std::future::Future;
use std::sync::Arc;

use log::debug;
use rocket::tokio::{
    self,
    sync::Notify,
    task::JoinHandle,
    time::{sleep, Duration},
};

/// A task re-run on a fixed interval until cancelled.
/// A run can also be triggered early, which restarts the interval.
pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
    signal: Arc<Notify>,
}

impl PeriodicTask {
    /// Start running `task` every `interval`, the first run one interval from now.
    pub fn new<F, Fut>(name: &'static str, interval: Duration, mut task: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let signal = Arc::new(Notify::new());

        let task_signal = signal.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = task_signal.notified() => debug!("Periodic task {name} triggered early"),
                }
                task().await;
            }
        });

        Self {
            name,
            handle,
            signal,
        }
    }

    /// Run the task now instead of waiting for the interval to elapse.
    /// A trigger while a run is in progress causes one more run straight after.
    pub fn trigger_now(&self) {
        self.signal.notify_one();
    }

    /// Stop the task. A run in progress is abandoned at its next await point.
    pub fn cancel(self) {
        debug!("Cancelling periodic task {}", self.name);
        self.handle.abort();
    }
}
