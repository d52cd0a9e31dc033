//! Orchestration of one sign-in flow: state check, registration, retried
//! exchange, and session establishment under nested timeouts.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use url::Url;

use super::contracts::{
    Clock, CredentialExchangeService, EphemeralKv, ExchangeError, SessionStore,
};
use super::csrf::{CsrfState, CsrfStateManager, DEFAULT_STATE_TTL};
use super::error::{ErrorKind, FlowError, FlowFailure, FlowStage};
use super::establish::{
    DEFAULT_MAX_WAIT, DEFAULT_VERIFICATION_DELAY, EstablishOptions, SessionEstablisher,
};
use super::identity::{AttemptDisambiguator, AttemptIdentity};
use super::registry::AuthAttemptRegistry;
use super::retry::{PreflightCheck, RetryError, RetryExecutor, RetryPolicy};
use super::types::{AttemptState, FlowSuccess, SessionRecord};

const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_OVERALL_BUFFER: Duration = Duration::from_secs(5);
const ATTEMPT_KIND: &str = "signin";

/// Stage budgets for the whole flow.
///
/// The overall timeout is derived as the sum of the stage budgets plus a
/// fixed buffer, so the inner budgets always fit under the outer one.
#[derive(Clone, Debug)]
pub struct FlowConfig {
    exchange_policy: RetryPolicy,
    exchange_timeout: Duration,
    session_max_wait: Duration,
    session_verification_delay: Duration,
    overall_buffer: Duration,
}

impl FlowConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            exchange_policy: RetryPolicy::new(),
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            session_max_wait: DEFAULT_MAX_WAIT,
            session_verification_delay: DEFAULT_VERIFICATION_DELAY,
            overall_buffer: DEFAULT_OVERALL_BUFFER,
        }
    }

    #[must_use]
    pub fn with_exchange_policy(mut self, exchange_policy: RetryPolicy) -> Self {
        self.exchange_policy = exchange_policy;
        self
    }

    #[must_use]
    pub fn with_exchange_timeout(mut self, exchange_timeout: Duration) -> Self {
        self.exchange_timeout = exchange_timeout;
        self
    }

    #[must_use]
    pub fn with_session_max_wait(mut self, session_max_wait: Duration) -> Self {
        self.session_max_wait = session_max_wait;
        self
    }

    #[must_use]
    pub fn with_session_verification_delay(mut self, delay: Duration) -> Self {
        self.session_verification_delay = delay;
        self
    }

    #[must_use]
    pub fn with_overall_buffer(mut self, overall_buffer: Duration) -> Self {
        self.overall_buffer = overall_buffer;
        self
    }

    #[must_use]
    pub fn exchange_policy(&self) -> &RetryPolicy {
        &self.exchange_policy
    }

    #[must_use]
    pub fn exchange_timeout(&self) -> Duration {
        self.exchange_timeout
    }

    #[must_use]
    pub fn session_max_wait(&self) -> Duration {
        self.session_max_wait
    }

    #[must_use]
    pub fn session_verification_delay(&self) -> Duration {
        self.session_verification_delay
    }

    #[must_use]
    pub fn overall_timeout(&self) -> Duration {
        self.exchange_timeout + self.session_max_wait + self.overall_buffer
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call options for [`AuthFlow::start_auth_flow`].
#[derive(Clone, Debug, Default)]
pub struct FlowOptions {
    received_state: Option<String>,
}

impl FlowOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Carry the `state` parameter from the inbound callback; the flow then
    /// verifies and consumes it before registering the attempt.
    #[must_use]
    pub fn with_received_state(mut self, received_state: impl Into<String>) -> Self {
        self.received_state = Some(received_state.into());
        self
    }

    #[must_use]
    pub fn received_state(&self) -> Option<&str> {
        self.received_state.as_deref()
    }
}

/// Composition of the whole sign-in subsystem.
///
/// Owns no global state: the registry is injected by the application's
/// composition root so tests get fresh, isolated instances.
pub struct AuthFlow {
    config: FlowConfig,
    registry: Arc<AuthAttemptRegistry>,
    establisher: SessionEstablisher,
    csrf: CsrfStateManager,
    identity: AttemptIdentity,
    exchange: Arc<dyn CredentialExchangeService>,
    retry: RetryExecutor,
    clock: Arc<dyn Clock>,
}

impl AuthFlow {
    #[must_use]
    pub fn new(
        config: FlowConfig,
        registry: Arc<AuthAttemptRegistry>,
        exchange: Arc<dyn CredentialExchangeService>,
        store: Arc<dyn SessionStore>,
        kv: Arc<dyn EphemeralKv>,
        clock: Arc<dyn Clock>,
        disambiguator: Arc<dyn AttemptDisambiguator>,
    ) -> Self {
        let establisher =
            SessionEstablisher::new(store, Arc::clone(&registry), Arc::clone(&clock));
        let csrf = CsrfStateManager::new(kv, Arc::clone(&clock));
        let identity = AttemptIdentity::new(disambiguator, Arc::clone(&clock));
        let retry = RetryExecutor::new(config.exchange_policy().clone());
        Self {
            config,
            registry,
            establisher,
            csrf,
            identity,
            exchange,
            retry,
            clock,
        }
    }

    /// Adds a pre-flight check run before each exchange retry.
    #[must_use]
    pub fn with_preflight(mut self, check: Arc<dyn PreflightCheck>) -> Self {
        self.retry = self.retry.with_preflight(check);
        self
    }

    /// Runs one full sign-in flow for `subject_key`.
    ///
    /// Registering cancels any competing attempt for the same subject; the
    /// newest call always wins. Every failure is mapped to exactly one
    /// taxonomy kind before it reaches the caller.
    #[instrument(skip(self, credential, options))]
    pub async fn start_auth_flow(
        &self,
        subject_key: &str,
        credential: &str,
        options: FlowOptions,
    ) -> Result<FlowSuccess, FlowFailure> {
        let started = self.clock.now();

        if let Some(received_state) = options.received_state() {
            if let Err(err) = self.csrf.verify_and_consume(received_state).await {
                error!(error = %err, "rejecting sign-in before registration");
                return Err(FlowFailure::new(err, self.elapsed(started)));
            }
        }

        let attempt_id = self.identity.attempt_id(ATTEMPT_KIND, subject_key);
        let cancel = CancellationToken::new();
        self.registry
            .register(&attempt_id, subject_key, cancel.clone())
            .await;

        let outcome = tokio::time::timeout(
            self.config.overall_timeout(),
            self.run_stages(subject_key, &attempt_id, &cancel, credential),
        )
        .await;

        match outcome {
            Ok(Ok(session)) => {
                self.registry.complete(&attempt_id).await;
                let duration = self.elapsed(started);
                info!(
                    sequence = session.sequence(),
                    duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                    "sign-in flow succeeded"
                );
                Ok(FlowSuccess::new(session, duration))
            }
            Ok(Err(err)) => {
                self.registry.fail(&attempt_id).await;
                if err.kind() == ErrorKind::Cancelled {
                    debug!(%attempt_id, "sign-in attempt superseded");
                } else {
                    error!(%attempt_id, error = %err, "sign-in flow failed");
                }
                Err(FlowFailure::new(err, self.elapsed(started)))
            }
            Err(_) => {
                self.registry.fail(&attempt_id).await;
                let elapsed = self.elapsed(started);
                error!(%attempt_id, "sign-in flow exceeded its overall budget");
                Err(FlowFailure::new(
                    FlowError::Timeout {
                        stage: FlowStage::Overall,
                        elapsed,
                    },
                    elapsed,
                ))
            }
        }
    }

    async fn run_stages(
        &self,
        subject_key: &str,
        attempt_id: &str,
        cancel: &CancellationToken,
        credential: &str,
    ) -> Result<Arc<SessionRecord>, FlowError> {
        self.registry
            .advance(subject_key, attempt_id, AttemptState::Exchanging)
            .await;

        let exchange_started = self.clock.now();
        let exchanged = tokio::time::timeout(
            self.config.exchange_timeout(),
            self.retry.run(cancel, ExchangeError::is_transient, |attempt| {
                debug!(attempt, "exchanging one-time credential");
                self.exchange.exchange(credential)
            }),
        )
        .await;

        let tokens = match exchanged {
            Err(_) => {
                return Err(FlowError::Timeout {
                    stage: FlowStage::Exchange,
                    elapsed: self.elapsed(exchange_started),
                });
            }
            Ok(Err(RetryError::Cancelled)) => return Err(FlowError::Cancelled),
            Ok(Err(RetryError::Inner(err))) => return Err(FlowError::from(err)),
            Ok(Ok(tokens)) => tokens,
        };

        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        if !tokens.has_required_fields() {
            return Err(FlowError::Malformed(
                "exchange response missing access token or subject".to_string(),
            ));
        }

        self.registry
            .advance(subject_key, attempt_id, AttemptState::Establishing)
            .await;
        let options = EstablishOptions::new(subject_key)
            .with_max_wait(self.config.session_max_wait())
            .with_verification_delay(self.config.session_verification_delay());
        self.establisher
            .establish(attempt_id, cancel, tokens, &options)
            .await
    }

    /// Whether any sign-in is live, optionally scoped to one subject.
    pub async fn is_auth_in_progress(&self, subject_key: Option<&str>) -> bool {
        self.registry.is_in_progress(subject_key).await
    }

    /// Cancels and settles every pending sign-in attempt.
    pub async fn cancel_all_pending_auths(&self) {
        self.registry.cancel_all().await;
    }

    /// Issues a fresh single-use state/nonce pair for the outbound redirect.
    pub async fn generate_csrf_state(&self, ttl: Duration) -> Result<CsrfState, FlowError> {
        self.csrf.generate(ttl).await
    }

    /// Issues a pair with the default five-minute lifetime.
    pub async fn generate_default_csrf_state(&self) -> Result<CsrfState, FlowError> {
        self.csrf.generate(DEFAULT_STATE_TTL).await
    }

    /// Checks and consumes the callback's state parameter.
    ///
    /// All failure kinds collapse to `false` here; hosts needing the exact
    /// kind call `start_auth_flow` with the state in its options instead.
    pub async fn verify_csrf_state(&self, received_state: &str) -> bool {
        match self.csrf.verify_and_consume(received_state).await {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "state verification failed");
                false
            }
        }
    }

    /// Builds the outbound redirect URL carrying a fresh state/nonce pair.
    pub async fn redirect_url(
        &self,
        base: &str,
        ttl: Duration,
    ) -> Result<(Url, CsrfState), FlowError> {
        self.csrf.redirect_url(base, ttl).await
    }

    /// The session the application currently trusts, if any.
    #[must_use]
    pub fn current_session(&self) -> Option<Arc<SessionRecord>> {
        self.establisher.current_session()
    }

    /// Current state of the subject's live attempt, for UI progress.
    pub async fn attempt_state(&self, subject_key: &str) -> Option<AttemptState> {
        self.registry.attempt_state(subject_key).await
    }

    /// Starts the background sweeper for leaked attempts.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        Arc::clone(&self.registry).spawn_sweeper(shutdown)
    }

    fn elapsed(&self, started: Duration) -> Duration {
        self.clock.now().saturating_sub(started)
    }
}
