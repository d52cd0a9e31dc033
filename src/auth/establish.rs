//! Session establishment: install the exchanged tokens, then poll the
//! store until it reflects them or the wait budget runs out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::contracts::{Clock, SessionStore, StoreError};
use super::error::{FlowError, FlowStage};
use super::registry::AuthAttemptRegistry;
use super::types::{ExchangedTokens, SessionRecord};

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_VERIFICATION_DELAY: Duration = Duration::from_millis(500);

/// Wait budget for one establishment.
#[derive(Clone, Debug)]
pub struct EstablishOptions {
    subject_key: String,
    max_wait: Duration,
    verification_delay: Duration,
}

impl EstablishOptions {
    #[must_use]
    pub fn new(subject_key: impl Into<String>) -> Self {
        Self {
            subject_key: subject_key.into(),
            max_wait: DEFAULT_MAX_WAIT,
            verification_delay: DEFAULT_VERIFICATION_DELAY,
        }
    }

    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    #[must_use]
    pub fn with_verification_delay(mut self, verification_delay: Duration) -> Self {
        // A zero delay would spin; clamp to something sane.
        self.verification_delay = verification_delay.max(Duration::from_millis(1));
        self
    }

    #[must_use]
    pub fn subject_key(&self) -> &str {
        &self.subject_key
    }

    #[must_use]
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    #[must_use]
    pub fn verification_delay(&self) -> Duration {
        self.verification_delay
    }

    fn poll_budget(&self) -> u32 {
        let delay_ms = self.verification_delay.as_millis().max(1);
        let budget = self.max_wait.as_millis().div_ceil(delay_ms);
        u32::try_from(budget).unwrap_or(u32::MAX).max(1)
    }
}

/// Sole writer of the trusted session.
///
/// Verification is read-back based: the store counts as ready only once a
/// read returns a non-empty access token and a resolvable subject.
pub struct SessionEstablisher {
    store: Arc<dyn SessionStore>,
    registry: Arc<AuthAttemptRegistry>,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
    trusted: Mutex<Option<Arc<SessionRecord>>>,
}

impl SessionEstablisher {
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<AuthAttemptRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            sequence: AtomicU64::new(0),
            trusted: Mutex::new(None),
        }
    }

    /// The session the application currently trusts, if any. Superseded
    /// wholesale by each later successful establishment.
    #[must_use]
    pub fn current_session(&self) -> Option<Arc<SessionRecord>> {
        self.trusted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs `tokens` and polls the store until the session is readable
    /// or the budget is exhausted.
    ///
    /// Single-flight is the registry's job (competitors were cancelled when
    /// the caller registered); this method only enforces the liveness gate,
    /// at entry and again immediately before the trusted write, so a
    /// just-cancelled attempt's late success can never clobber a newer one.
    #[instrument(skip(self, cancel, tokens, options), fields(subject = %options.subject_key()))]
    pub async fn establish(
        &self,
        attempt_id: &str,
        cancel: &CancellationToken,
        tokens: ExchangedTokens,
        options: &EstablishOptions,
    ) -> Result<Arc<SessionRecord>, FlowError> {
        let started = self.clock.now();
        let subject_key = options.subject_key();

        if !self.registry.is_live(subject_key, attempt_id).await {
            return Err(FlowError::Cancelled);
        }

        // Install failures are fatal here; retry belongs to outer layers.
        self.store.install(&tokens).await.map_err(FlowError::from)?;

        let budget = options.poll_budget();
        let delay = options.verification_delay();
        let mut stale_retried = false;
        let mut polls: u32 = 0;

        while polls < budget {
            polls += 1;
            match self.store.read().await {
                Ok(Some(session)) if session.is_ready() => {
                    if cancel.is_cancelled() {
                        return Err(FlowError::Cancelled);
                    }
                    return self.record_trusted(attempt_id, &tokens, options, polls).await;
                }
                Ok(_) => {
                    debug!(poll = polls, budget, "session not yet readable");
                }
                Err(StoreError::Stale) => {
                    if stale_retried {
                        warn!("second stale read; giving up on verification");
                        return Err(FlowError::Timeout {
                            stage: FlowStage::Establish,
                            elapsed: self.elapsed(started),
                        });
                    }
                    stale_retried = true;
                    debug!("stale read; forcing one immediate re-read");
                    continue;
                }
                Err(err @ StoreError::Unavailable(_)) => {
                    return Err(FlowError::from(err));
                }
            }

            if polls >= budget {
                break;
            }
            tokio::select! {
                () = sleep(delay) => {}
                () = cancel.cancelled() => return Err(FlowError::Cancelled),
            }
            if cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
        }

        let elapsed = self.elapsed(started);
        warn!(
            polls,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "session never became readable"
        );
        Err(FlowError::Timeout {
            stage: FlowStage::Establish,
            elapsed,
        })
    }

    async fn record_trusted(
        &self,
        attempt_id: &str,
        tokens: &ExchangedTokens,
        options: &EstablishOptions,
        polls: u32,
    ) -> Result<Arc<SessionRecord>, FlowError> {
        // Re-check liveness immediately before the write; a cancelled
        // attempt's late success is discarded, never trusted.
        if !self
            .registry
            .is_live(options.subject_key(), attempt_id)
            .await
        {
            debug!(attempt_id, "discarding late success of superseded attempt");
            return Err(FlowError::Cancelled);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let record = Arc::new(SessionRecord::new(
            tokens.subject_id().to_string(),
            tokens,
            sequence,
        ));
        {
            let mut trusted = self.trusted.lock().unwrap_or_else(PoisonError::into_inner);
            *trusted = Some(Arc::clone(&record));
        }
        info!(sequence, polls, "session established and verified");
        Ok(record)
    }

    fn elapsed(&self, started: Duration) -> Duration {
        self.clock.now().saturating_sub(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::contracts::{ManualClock, MemorySessionStore};
    use crate::auth::registry::RegistryConfig;
    use crate::auth::types::InstalledSession;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    /// Store whose reads follow a fixed script after install.
    struct ScriptedStore {
        script: Mutex<Vec<Result<Option<InstalledSession>, StoreError>>>,
        installs: AtomicU32,
        reads: AtomicU32,
    }

    impl ScriptedStore {
        fn new(script: Vec<Result<Option<InstalledSession>, StoreError>>) -> Self {
            Self {
                script: Mutex::new(script),
                installs: AtomicU32::new(0),
                reads: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionStore for ScriptedStore {
        async fn install(&self, _tokens: &ExchangedTokens) -> Result<(), StoreError> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn read(&self) -> Result<Option<InstalledSession>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
            if script.len() > 1 {
                script.remove(0)
            } else {
                match script.first() {
                    Some(Ok(session)) => Ok(session.clone()),
                    Some(Err(StoreError::Stale)) => Err(StoreError::Stale),
                    Some(Err(StoreError::Unavailable(message))) => {
                        Err(StoreError::Unavailable(message.clone()))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    fn ready_session() -> InstalledSession {
        InstalledSession::new("at", Some("user:1".to_string()))
    }

    fn establisher_with(
        store: Arc<dyn SessionStore>,
    ) -> (SessionEstablisher, Arc<AuthAttemptRegistry>) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(50)));
        let registry = Arc::new(AuthAttemptRegistry::new(
            RegistryConfig::new(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));
        let establisher =
            SessionEstablisher::new(store, Arc::clone(&registry), clock as Arc<dyn Clock>);
        (establisher, registry)
    }

    fn options() -> EstablishOptions {
        EstablishOptions::new("user:1")
            .with_max_wait(Duration::from_secs(2))
            .with_verification_delay(Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_after_store_becomes_readable() {
        let store = Arc::new(ScriptedStore::new(vec![
            Ok(None),
            Ok(None),
            Ok(None),
            Ok(Some(ready_session())),
        ]));
        let (establisher, registry) = establisher_with(Arc::clone(&store) as _);
        let cancel = CancellationToken::new();
        registry.register("a1", "user:1", cancel.clone()).await;

        let before = Instant::now();
        let result = establisher
            .establish(
                "a1",
                &cancel,
                ExchangedTokens::new("at", "rt", "user:1"),
                &options(),
            )
            .await;

        assert!(result.is_ok_and(|record| record.sequence() == 1));
        assert_eq!(store.reads.load(Ordering::SeqCst), 4);
        // Three sleeps between the four polls.
        assert_eq!(Instant::now() - before, Duration::from_millis(300));
        assert!(establisher.current_session().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn never_readable_store_times_out_without_trust() {
        let store = Arc::new(ScriptedStore::new(vec![Ok(None)]));
        let (establisher, registry) = establisher_with(Arc::clone(&store) as _);
        let cancel = CancellationToken::new();
        registry.register("a1", "user:1", cancel.clone()).await;

        let result = establisher
            .establish(
                "a1",
                &cancel,
                ExchangedTokens::new("at", "rt", "user:1"),
                &options(),
            )
            .await;

        assert!(matches!(
            result,
            Err(FlowError::Timeout {
                stage: FlowStage::Establish,
                ..
            })
        ));
        // ceil(2s / 100ms) polls, no more.
        assert_eq!(store.reads.load(Ordering::SeqCst), 20);
        assert!(establisher.current_session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn one_stale_read_is_forgiven() {
        let store = Arc::new(ScriptedStore::new(vec![
            Err(StoreError::Stale),
            Ok(Some(ready_session())),
        ]));
        let (establisher, registry) = establisher_with(Arc::clone(&store) as _);
        let cancel = CancellationToken::new();
        registry.register("a1", "user:1", cancel.clone()).await;

        let before = Instant::now();
        let result = establisher
            .establish(
                "a1",
                &cancel,
                ExchangedTokens::new("at", "rt", "user:1"),
                &options(),
            )
            .await;

        assert!(result.is_ok());
        // The forced re-read is immediate; no sleep in between.
        assert_eq!(Instant::now() - before, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn second_stale_read_escalates_to_timeout() {
        let store = Arc::new(ScriptedStore::new(vec![Err(StoreError::Stale)]));
        let (establisher, registry) = establisher_with(Arc::clone(&store) as _);
        let cancel = CancellationToken::new();
        registry.register("a1", "user:1", cancel.clone()).await;

        let result = establisher
            .establish(
                "a1",
                &cancel,
                ExchangedTokens::new("at", "rt", "user:1"),
                &options(),
            )
            .await;

        assert!(matches!(
            result,
            Err(FlowError::Timeout {
                stage: FlowStage::Establish,
                ..
            })
        ));
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_store_is_fatal() {
        let store = Arc::new(ScriptedStore::new(vec![Err(StoreError::Unavailable(
            "quota".to_string(),
        ))]));
        let (establisher, registry) = establisher_with(Arc::clone(&store) as _);
        let cancel = CancellationToken::new();
        registry.register("a1", "user:1", cancel.clone()).await;

        let result = establisher
            .establish(
                "a1",
                &cancel,
                ExchangedTokens::new("at", "rt", "user:1"),
                &options(),
            )
            .await;

        assert!(matches!(result, Err(FlowError::Storage(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_attempt_is_rejected_at_entry() {
        let store = Arc::new(ScriptedStore::new(vec![Ok(Some(ready_session()))]));
        let (establisher, _registry) = establisher_with(Arc::clone(&store) as _);
        let cancel = CancellationToken::new();
        // Never registered: not live.

        let result = establisher
            .establish(
                "a1",
                &cancel,
                ExchangedTokens::new("at", "rt", "user:1"),
                &options(),
            )
            .await;

        assert!(matches!(result, Err(FlowError::Cancelled)));
        assert_eq!(store.installs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_attempt_never_writes_trusted_session() {
        let store = Arc::new(ScriptedStore::new(vec![Ok(Some(ready_session()))]));
        let (establisher, registry) = establisher_with(Arc::clone(&store) as _);
        let cancel = CancellationToken::new();
        registry.register("a1", "user:1", cancel.clone()).await;
        // A competitor registers between install and the trusted write.
        registry
            .register("a2", "user:1", CancellationToken::new())
            .await;

        let result = establisher
            .establish(
                "a1",
                &cancel,
                ExchangedTokens::new("at", "rt", "user:1"),
                &options(),
            )
            .await;

        assert!(matches!(result, Err(FlowError::Cancelled)));
        assert!(establisher.current_session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sequences_increase_across_establishments() {
        let store = Arc::new(MemorySessionStore::new());
        let (establisher, registry) = establisher_with(Arc::clone(&store) as _);

        for (attempt, subject) in [("a1", "user:1"), ("a2", "user:2")] {
            let cancel = CancellationToken::new();
            registry.register(attempt, subject, cancel.clone()).await;
            let result = establisher
                .establish(
                    attempt,
                    &cancel,
                    ExchangedTokens::new("at", "rt", subject),
                    &EstablishOptions::new(subject),
                )
                .await;
            assert!(result.is_ok());
            registry.complete(attempt).await;
        }

        let current = establisher.current_session();
        assert_eq!(current.as_deref().map(SessionRecord::sequence), Some(2));
        assert_eq!(
            current.as_deref().map(SessionRecord::subject_id),
            Some("user:2")
        );
    }
}
