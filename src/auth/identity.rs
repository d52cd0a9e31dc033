//! Attempt identity and environment fingerprinting.
//!
//! Attempt ids only disambiguate concurrent callers in logs and the
//! registry; neither the fingerprint nor the id is a security boundary.

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use base64ct::{Base64UrlUnpadded, Encoding};
use sha2::{Digest, Sha256};

use super::contracts::Clock;

/// Env vars folded into the default fingerprint. Low entropy on purpose.
const FINGERPRINT_ENV_KEYS: &[&str] = &["HOSTNAME", "USER", "LANG", "TZ"];

/// Characters of the encoded digest kept for the fingerprint.
const FINGERPRINT_LEN: usize = 12;

/// Host-supplied entropy source behind the fingerprint.
///
/// Each host environment plugs in whatever stable-enough signals it has;
/// the flow never interprets the returned string.
pub trait AttemptDisambiguator: Send + Sync {
    fn fingerprint(&self) -> String;
}

/// Default [`AttemptDisambiguator`] hashing process environment signals.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostFingerprint;

impl AttemptDisambiguator for HostFingerprint {
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for key in FINGERPRINT_ENV_KEYS {
            if let Ok(value) = env::var(key) {
                hasher.update(key.as_bytes());
                hasher.update(value.as_bytes());
            }
        }
        hasher.update(env::consts::OS.as_bytes());
        hasher.update(env::consts::ARCH.as_bytes());
        hasher.update(std::process::id().to_le_bytes());

        let digest = hasher.finalize();
        let encoded = Base64UrlUnpadded::encode_string(digest.as_slice());
        encoded.chars().take(FINGERPRINT_LEN).collect()
    }
}

/// Generates process-unique attempt ids: fingerprint, an atomically
/// incremented sequence, and a clock timestamp.
pub struct AttemptIdentity {
    disambiguator: Arc<dyn AttemptDisambiguator>,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
    cached_fingerprint: OnceLock<String>,
}

impl AttemptIdentity {
    #[must_use]
    pub fn new(disambiguator: Arc<dyn AttemptDisambiguator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            disambiguator,
            clock,
            sequence: AtomicU64::new(0),
            cached_fingerprint: OnceLock::new(),
        }
    }

    /// The per-environment fingerprint, computed once per process.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        self.cached_fingerprint
            .get_or_init(|| self.disambiguator.fingerprint())
    }

    /// Unique-within-process id for one attempt of the given kind.
    #[must_use]
    pub fn attempt_id(&self, kind: &str, subject_key: &str) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let timestamp_ms = self.clock.now().as_millis();
        format!(
            "{kind}-{subject_key}-{fp}-{sequence}-{timestamp_ms}",
            fp = self.fingerprint()
        )
    }
}
