//! Data model shared across the sign-in flow.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

/// Access/refresh token pair redeemed from the one-time credential.
///
/// Tokens are held as [`SecretString`] behind [`Arc`], so records clone
/// cheaply and accidental `Debug` output stays redacted.
#[derive(Clone, Debug)]
pub struct ExchangedTokens {
    access_token: Arc<SecretString>,
    refresh_token: Arc<SecretString>,
    subject_id: String,
}

impl ExchangedTokens {
    #[must_use]
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        subject_id: impl Into<String>,
    ) -> Self {
        Self {
            access_token: Arc::new(SecretString::from(access_token.into())),
            refresh_token: Arc::new(SecretString::from(refresh_token.into())),
            subject_id: subject_id.into(),
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> &SecretString {
        &self.refresh_token
    }

    #[must_use]
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// An exchange response without an access token or subject is bug-like
    /// and must not reach the session store.
    pub(crate) fn has_required_fields(&self) -> bool {
        !self.access_token.expose_secret().trim().is_empty()
            && !self.subject_id.trim().is_empty()
    }
}

/// What the session store reports back when read.
///
/// The subject may resolve a poll or two after the token write lands; both
/// fields must be present before the session counts as ready.
#[derive(Clone, Debug)]
pub struct InstalledSession {
    access_token: Arc<SecretString>,
    subject_id: Option<String>,
}

impl InstalledSession {
    #[must_use]
    pub fn new(access_token: impl Into<String>, subject_id: Option<String>) -> Self {
        Self {
            access_token: Arc::new(SecretString::from(access_token.into())),
            subject_id,
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    #[must_use]
    pub fn subject_id(&self) -> Option<&str> {
        self.subject_id.as_deref()
    }

    pub(crate) fn is_ready(&self) -> bool {
        !self.access_token.expose_secret().trim().is_empty()
            && self
                .subject_id
                .as_deref()
                .is_some_and(|subject| !subject.trim().is_empty())
    }
}

/// The trusted session produced by a verified establishment.
///
/// Later successful attempts supersede the whole record; it is never
/// mutated in place.
#[derive(Clone, Debug)]
pub struct SessionRecord {
    subject_id: String,
    access_token: Arc<SecretString>,
    refresh_token: Arc<SecretString>,
    sequence: u64,
}

impl SessionRecord {
    pub(crate) fn new(subject_id: String, tokens: &ExchangedTokens, sequence: u64) -> Self {
        Self {
            subject_id,
            access_token: Arc::clone(&tokens.access_token),
            refresh_token: Arc::clone(&tokens.refresh_token),
            sequence,
        }
    }

    #[must_use]
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    #[must_use]
    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> &SecretString {
        &self.refresh_token
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Per-attempt state machine.
///
/// `Pending → Exchanging → Establishing` then exactly one terminal sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Exchanging,
    Establishing,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl AttemptState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Exchanging => "exchanging",
            Self::Establishing => "establishing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Successful outcome of one `start_auth_flow` call.
#[derive(Clone, Debug)]
pub struct FlowSuccess {
    session: Arc<SessionRecord>,
    duration: Duration,
}

impl FlowSuccess {
    pub(crate) fn new(session: Arc<SessionRecord>, duration: Duration) -> Self {
        Self { session, duration }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionRecord> {
        &self.session
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }
}
