//! Single-use anti-replay state tokens for the redirect round trip.

use std::sync::Arc;
use std::time::Duration;

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::contracts::{Clock, EphemeralKv};
use super::error::FlowError;

/// Default lifetime of an outstanding state token.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(5 * 60);

const STATE_KEY: &str = "ensaluto.csrf.state";
const TOKEN_BYTES: usize = 32;

/// State/nonce pair handed to the caller for embedding in the outbound
/// redirect URL.
#[derive(Clone, Debug)]
pub struct CsrfState {
    state: String,
    nonce: String,
}

impl CsrfState {
    #[must_use]
    pub fn state(&self) -> &str {
        &self.state
    }

    #[must_use]
    pub fn nonce(&self) -> &str {
        &self.nonce
    }
}

/// Record persisted in the ephemeral KV while the redirect is in flight.
#[derive(Debug, Serialize, Deserialize)]
struct StoredState {
    state: String,
    nonce: String,
    created_at_ms: u64,
    expires_at_ms: u64,
}

/// Issues and consumes the single-use state token.
///
/// Any verify outcome deletes the stored record, so a replayed callback
/// always finds nothing.
pub struct CsrfStateManager {
    kv: Arc<dyn EphemeralKv>,
    clock: Arc<dyn Clock>,
}

impl CsrfStateManager {
    #[must_use]
    pub fn new(kv: Arc<dyn EphemeralKv>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    /// Creates and stores a fresh state/nonce pair valid for `ttl`.
    ///
    /// A previously outstanding pair is overwritten; only the newest
    /// redirect can complete.
    pub async fn generate(&self, ttl: Duration) -> Result<CsrfState, FlowError> {
        let state = random_token()?;
        let nonce = random_token()?;
        let now_ms = clamp_millis(self.clock.now());
        let record = StoredState {
            state: state.clone(),
            nonce: nonce.clone(),
            created_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(clamp_millis(ttl)),
        };
        let json = serde_json::to_string(&record)
            .map_err(|err| FlowError::Storage(format!("failed to encode state record: {err}")))?;
        self.kv
            .set(STATE_KEY, &json)
            .await
            .map_err(|err| FlowError::Storage(err.to_string()))?;
        debug!(ttl_ms = clamp_millis(ttl), "issued sign-in state token");
        Ok(CsrfState { state, nonce })
    }

    /// Checks the callback's state against the stored record and consumes
    /// the record regardless of the outcome.
    pub async fn verify_and_consume(&self, received_state: &str) -> Result<(), FlowError> {
        let Some(json) = self
            .kv
            .get(STATE_KEY)
            .await
            .map_err(|err| FlowError::Storage(err.to_string()))?
        else {
            return Err(FlowError::CsrfMissing);
        };

        // Single-use: drop the record before judging it, so a concurrent or
        // replayed callback finds nothing.
        self.kv
            .delete(STATE_KEY)
            .await
            .map_err(|err| FlowError::Storage(err.to_string()))?;

        let Ok(record) = serde_json::from_str::<StoredState>(&json) else {
            warn!("discarding unreadable state record");
            return Err(FlowError::CsrfMissing);
        };

        let now_ms = clamp_millis(self.clock.now());
        if now_ms > record.expires_at_ms {
            warn!(
                age_ms = now_ms.saturating_sub(record.created_at_ms),
                "rejecting expired state token"
            );
            return Err(FlowError::CsrfExpired);
        }
        if received_state != record.state {
            warn!("state token mismatch; possible cross-site replay");
            return Err(FlowError::CsrfMismatch);
        }

        debug!("state token verified and consumed");
        Ok(())
    }

    /// Builds the outbound redirect URL with `state` and `nonce` query
    /// parameters, issuing a fresh pair in the process.
    pub async fn redirect_url(
        &self,
        base: &str,
        ttl: Duration,
    ) -> Result<(Url, CsrfState), FlowError> {
        let mut url = Url::parse(base)
            .map_err(|err| FlowError::Malformed(format!("invalid redirect base URL: {err}")))?;
        let state = self.generate(ttl).await?;
        url.query_pairs_mut()
            .append_pair("state", state.state())
            .append_pair("nonce", state.nonce());
        Ok((url, state))
    }
}

fn clamp_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn random_token() -> Result<String, FlowError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| FlowError::Storage(format!("failed to generate state token: {err}")))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}
