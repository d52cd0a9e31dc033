//! Sign-in flow synchronization.
//!
//! This module turns a one-time redirect credential into a verified local
//! session while suppressing competing attempts (multiple tabs, backgrounded
//! mobile browsers, flaky networks) and cross-site replay.
//!
//! ## Single-flight
//!
//! The registry keeps at most one non-terminal attempt per subject.
//! Registering a new attempt cancels the previous one inside the same
//! critical section, so the newest sign-in always wins and the loser is
//! settled as superseded before the winner first suspends.
//!
//! ## Session trust
//!
//! Exchanged tokens are installed and then verified by polling the store
//! until a read-back carries both an access token and a resolvable subject.
//! Only the attempt that is still live for its subject at write time may
//! produce the trusted [`SessionRecord`]; a superseded attempt's late
//! success is discarded.
//!
//! ## Anti-replay
//!
//! Outbound redirects carry a single-use, time-limited state token. Every
//! verification outcome consumes the stored record, so a replayed callback
//! always finds nothing.

pub mod contracts;
mod csrf;
mod error;
mod establish;
mod flow;
mod identity;
mod registry;
mod retry;
mod types;

pub use csrf::{CsrfState, CsrfStateManager, DEFAULT_STATE_TTL};
pub use error::{ErrorKind, FlowError, FlowFailure, FlowStage};
pub use establish::{
    DEFAULT_MAX_WAIT, DEFAULT_VERIFICATION_DELAY, EstablishOptions, SessionEstablisher,
};
pub use flow::{AuthFlow, FlowConfig, FlowOptions};
pub use identity::{AttemptDisambiguator, AttemptIdentity, HostFingerprint};
pub use registry::{
    AuthAttemptRegistry, DEFAULT_STALE_AFTER, DEFAULT_SWEEP_INTERVAL, RegistryConfig,
};
pub use retry::{JitterDelay, PreflightCheck, RetryError, RetryExecutor, RetryPolicy};
pub use types::{
    AttemptState, ExchangedTokens, FlowSuccess, InstalledSession, SessionRecord,
};
