//! Contracts for the collaborators outside this subsystem.
//!
//! The UI, the redirect protocol's wire format, and the backing stores are
//! someone else's problem; this module pins down exactly what the flow needs
//! from them. In-memory implementations live next to each trait for simple
//! hosts and tests.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

use super::types::{ExchangedTokens, InstalledSession};

/// How the credential exchange can fail.
///
/// Kinds are assigned at the throw site; nothing downstream inspects
/// message text.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("credential exchange rejected: {0}")]
    Rejected(String),
    #[error("malformed exchange response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    /// Read-after-write inconsistency; the caller gets one forced re-read.
    #[error("stale session read")]
    Stale,
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("ephemeral storage failure: {0}")]
    Backend(String),
}

/// Redeems the one-time external credential for access/refresh tokens.
#[async_trait]
pub trait CredentialExchangeService: Send + Sync {
    async fn exchange(&self, credential: &str) -> Result<ExchangedTokens, ExchangeError>;
}

/// The session store the rest of the application trusts.
///
/// `install` writes the exchanged tokens; `read` reports what the store
/// currently reflects, which may lag the write.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn install(&self, tokens: &ExchangedTokens) -> Result<(), StoreError>;
    async fn read(&self) -> Result<Option<InstalledSession>, StoreError>;
}

/// Per-tab/session-scoped string storage backing the CSRF state record.
#[async_trait]
pub trait EphemeralKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

/// Monotonic-enough timestamp source for TTL and staleness arithmetic.
///
/// Returns the elapsed duration since a fixed origin; only differences are
/// ever compared, so the origin itself does not matter.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Wall-clock backed [`Clock`] (UNIX epoch origin).
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Hand-driven [`Clock`] for deterministic tests and replay hosts.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: Duration) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-local [`EphemeralKv`].
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EphemeralKv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// Process-local [`SessionStore`] whose reads reflect installs immediately.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    installed: Mutex<Option<InstalledSession>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn install(&self, tokens: &ExchangedTokens) -> Result<(), StoreError> {
        let mut installed = self
            .installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *installed = Some(InstalledSession::new(
            secrecy::ExposeSecret::expose_secret(tokens.access_token()),
            Some(tokens.subject_id().to_string()),
        ));
        Ok(())
    }

    async fn read(&self) -> Result<Option<InstalledSession>, StoreError> {
        let installed = self
            .installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(installed.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn memory_kv_round_trip() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("k").await.ok(), Some(None));
        kv.set("k", "v").await.ok();
        assert_eq!(kv.get("k").await.ok(), Some(Some("v".to_string())));
        kv.delete("k").await.ok();
        assert_eq!(kv.get("k").await.ok(), Some(None));
    }

    #[tokio::test]
    async fn memory_store_reflects_install() {
        let store = MemorySessionStore::new();
        assert!(matches!(store.read().await, Ok(None)));

        let tokens = ExchangedTokens::new("at", "rt", "user:1");
        store.install(&tokens).await.ok();
        let session = store.read().await.ok().flatten();
        let session = session.as_ref();
        assert_eq!(
            session.map(|s| s.access_token().expose_secret()),
            Some("at")
        );
        assert_eq!(session.and_then(|s| s.subject_id()), Some("user:1"));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Duration::from_secs(100));
        assert_eq!(clock.now(), Duration::from_secs(100));
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), Duration::from_secs(105));
        clock.set(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(1));
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn exchange_error_classifies_by_kind() {
        assert!(ExchangeError::Transient("reset".to_string()).is_transient());
        assert!(!ExchangeError::Rejected("denied".to_string()).is_transient());
        assert!(!ExchangeError::Malformed("empty".to_string()).is_transient());
    }
}
