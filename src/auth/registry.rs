//! Live sign-in attempt tracking: single-flight per subject, cooperative
//! cancellation, and a periodic sweep of leaked entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::contracts::Clock;
use super::types::AttemptState;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

/// Sweep cadence and staleness threshold for leaked attempts.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    sweep_interval: Duration,
    stale_after: Duration,
}

impl RegistryConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct AttemptEntry {
    attempt_id: String,
    started_at: Duration,
    state: AttemptState,
    cancel: CancellationToken,
}

/// Tracks all non-terminal attempts, keyed by subject.
///
/// The table is the single source of truth for liveness: a terminal attempt
/// is simply absent. All mutations run inside one mutex so
/// cancel-then-register is a single critical section.
pub struct AuthAttemptRegistry {
    attempts: Mutex<HashMap<String, AttemptEntry>>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

impl AuthAttemptRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Registers a new attempt for `subject_key`, cancelling and removing
    /// any competitor for the same subject strictly before inserting.
    ///
    /// The cancellation fires inside the critical section, so there is no
    /// instant with two live attempts for one subject and the loser is
    /// settled before the winner's first suspension point.
    #[instrument(skip(self, cancel))]
    pub async fn register(&self, attempt_id: &str, subject_key: &str, cancel: CancellationToken) {
        let mut attempts = self.attempts.lock().await;
        if let Some(previous) = attempts.remove(subject_key) {
            warn!(
                superseded = %previous.attempt_id,
                "cancelling superseded sign-in attempt"
            );
            previous.cancel.cancel();
        }
        attempts.insert(
            subject_key.to_string(),
            AttemptEntry {
                attempt_id: attempt_id.to_string(),
                started_at: self.clock.now(),
                state: AttemptState::Pending,
                cancel,
            },
        );
    }

    /// Records a non-terminal state transition on the live entry. Ignored
    /// when the attempt is no longer the live one for its subject.
    pub async fn advance(&self, subject_key: &str, attempt_id: &str, state: AttemptState) {
        if state.is_terminal() {
            return;
        }
        let mut attempts = self.attempts.lock().await;
        if let Some(entry) = attempts.get_mut(subject_key) {
            if entry.attempt_id == attempt_id {
                debug!(attempt_id, %state, "attempt state transition");
                entry.state = state;
            }
        }
    }

    /// Removes a completed attempt. No-op when already absent.
    pub async fn complete(&self, attempt_id: &str) {
        let mut attempts = self.attempts.lock().await;
        let before = attempts.len();
        attempts.retain(|_, entry| entry.attempt_id != attempt_id);
        if attempts.len() < before {
            debug!(attempt_id, "attempt completed");
        }
    }

    /// Removes a failed attempt. No-op when already absent.
    pub async fn fail(&self, attempt_id: &str) {
        let mut attempts = self.attempts.lock().await;
        let before = attempts.len();
        attempts.retain(|_, entry| entry.attempt_id != attempt_id);
        if attempts.len() < before {
            debug!(attempt_id, "attempt removed after failure");
        }
    }

    /// Cancels and removes attempts older than the stale threshold.
    /// Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let stale_after = self.config.stale_after;
        let mut attempts = self.attempts.lock().await;
        let mut swept = 0;
        attempts.retain(|subject_key, entry| {
            if now.saturating_sub(entry.started_at) < stale_after {
                return true;
            }
            warn!(
                subject = %subject_key,
                attempt_id = %entry.attempt_id,
                age_ms = u64::try_from(now.saturating_sub(entry.started_at).as_millis())
                    .unwrap_or(u64::MAX),
                "sweeping stale sign-in attempt"
            );
            entry.cancel.cancel();
            swept += 1;
            false
        });
        swept
    }

    /// Whether any attempt is live, optionally scoped to one subject.
    pub async fn is_in_progress(&self, subject_key: Option<&str>) -> bool {
        let attempts = self.attempts.lock().await;
        match subject_key {
            Some(subject_key) => attempts.contains_key(subject_key),
            None => !attempts.is_empty(),
        }
    }

    /// Whether `attempt_id` is still the live, uncancelled attempt for its
    /// subject. The gate for every trusted write.
    pub async fn is_live(&self, subject_key: &str, attempt_id: &str) -> bool {
        let attempts = self.attempts.lock().await;
        attempts
            .get(subject_key)
            .is_some_and(|entry| entry.attempt_id == attempt_id && !entry.cancel.is_cancelled())
    }

    /// Current non-terminal state of the subject's live attempt, if any.
    pub async fn attempt_state(&self, subject_key: &str) -> Option<AttemptState> {
        let attempts = self.attempts.lock().await;
        attempts.get(subject_key).map(|entry| entry.state)
    }

    /// Cancels and removes every live attempt.
    pub async fn cancel_all(&self) {
        let mut attempts = self.attempts.lock().await;
        let drained = attempts.len();
        for (_, entry) in attempts.drain() {
            entry.cancel.cancel();
        }
        if drained > 0 {
            info!(cancelled = drained, "cancelled all pending sign-in attempts");
        }
    }

    /// Runs [`Self::sweep`] on the configured interval until `shutdown`
    /// fires.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self;
        let interval = registry.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = sleep(interval) => {}
                    () = shutdown.cancelled() => {
                        debug!("sweeper shutting down");
                        return;
                    }
                }
                let swept = registry.sweep().await;
                if swept > 0 {
                    warn!(swept, "sweeper evicted stale attempts");
                }
            }
        })
    }
}
