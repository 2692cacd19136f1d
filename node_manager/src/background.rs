//! Background validation of every node's datapath state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::JoinedError;
use crate::health::SCOPE_BACKGROUND_SYNC;
use crate::manager::Manager;

/// Scales `base` with the fleet size so that per-node work shrinks as the
/// fleet grows.
///
/// | nodes | interval (base = 1m) |
/// |------:|---------------------:|
/// | 1     | 41.59s               |
/// | 2     | 65.92s               |
/// | 8     | 131.83s              |
/// | 1024  | 415.95s              |
///
/// An empty fleet is treated as a single node.
pub fn cluster_size_dependant_interval(base: Duration, nodes: usize) -> Duration {
    let n = nodes.max(1) as f64;
    base.mul_f64(n.ln_1p())
}

/// Reservation based token bucket. A caller takes a token even if the bucket
/// is empty and sleeps until the debt is paid back.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// `rate` tokens per second; the bucket starts full. A rate that is not
    /// a positive finite number disables throttling.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate,
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    fn unlimited(&self) -> bool {
        !(self.rate.is_finite() && self.rate > 0.0)
    }

    /// Takes one token and returns how long the caller must wait before
    /// using it.
    pub fn reserve(&mut self, now: Instant) -> Duration {
        if self.unlimited() {
            return Duration::ZERO;
        }
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }

    /// Waits for a token. Returns `false` if `cancel` fired first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.reserve(Instant::now());
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Validates every node once per interval until `cancel` fires.
pub async fn run(manager: Arc<Manager>, cancel: CancellationToken) {
    loop {
        let interval = manager.background_sync_interval();
        let deadline = Instant::now() + interval;

        debug!(sync_interval = ?interval, "Starting new iteration of background sync");
        let result = single_pass(&manager, interval, &cancel).await;
        debug!(sync_interval = ?interval, "Finished iteration of background sync");

        // Also covers a pass that finished early, e.g. with no nodes yet.
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        match result {
            Ok(()) => manager.health().ok(SCOPE_BACKGROUND_SYNC, "Node validation successful"),
            Err(err) => {
                manager
                    .health()
                    .degraded(SCOPE_BACKGROUND_SYNC, "Failed to apply node validation", &err)
            }
        }
    }
}

/// Validates a snapshot of the registry, spreading the work over
/// `expected_loop_time`.
pub async fn single_pass(
    manager: &Manager,
    expected_loop_time: Duration,
    cancel: &CancellationToken,
) -> Result<(), JoinedError> {
    // Snapshot so the registry is not locked for the whole pass.
    let identities = manager.get_node_identities();
    let rate = identities.len() as f64 / expected_loop_time.as_secs_f64();
    let mut limiter = TokenBucket::new(rate, 1);
    let mut errs = JoinedError::default();

    for identity in identities {
        if !limiter.wait(cancel).await {
            return Ok(());
        }
        manager.validate_node(&identity, &mut errs);
    }

    errs.into_result()
}
