//! Coalescing trigger.
//!
//! Bursts of [`Trigger::trigger_with_reason`] calls collapse into one run of
//! the trigger function, and runs are spaced at least `min_interval` apart.
//! A trigger arriving while idle runs immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

type TriggerFn = Arc<dyn Fn(Vec<String>) + Send + Sync>;

pub struct Trigger {
    name: String,
    tx: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Trigger {
    /// Spawns the trigger task on the current tokio runtime. `f` receives the
    /// reasons accumulated since the previous run and is executed on the
    /// blocking pool.
    pub fn new<F>(name: &str, min_interval: Duration, f: F) -> Self
    where
        F: Fn(Vec<String>) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(
            name.to_string(),
            min_interval,
            Arc::new(f),
            rx,
            shutdown.clone(),
        ));

        Self {
            name: name.to_string(),
            tx,
            shutdown,
            task,
        }
    }

    pub fn trigger_with_reason(&self, reason: &str) {
        if self.tx.send(reason.to_string()).is_err() {
            debug!(trigger = %self.name, reason, "trigger already shut down");
        }
    }

    /// Stops the trigger. A pending run is dropped; a run already executing
    /// completes.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    name: String,
    min_interval: Duration,
    f: TriggerFn,
    mut rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) {
    let mut last_run: Option<Instant> = None;

    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => return,
            reason = rx.recv() => match reason {
                Some(reason) => reason,
                None => return,
            },
        };

        if let Some(last) = last_run {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep_until(last + min_interval) => {}
            }
        }

        let mut reasons = vec![first];
        while let Ok(reason) = rx.try_recv() {
            reasons.push(reason);
        }

        // Shutdown may have raced with the wakeup.
        if shutdown.is_cancelled() {
            return;
        }

        last_run = Some(Instant::now());
        debug!(trigger = %name, reasons = ?reasons, "running trigger");
        let f = f.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || f(reasons)).await {
            error!(trigger = %name, error = %err, "trigger function failed");
        }
    }
}
