//! # Ensaluto (Sign-in Flow Synchronizer)
//!
//! `ensaluto` is the authentication subsystem of the Klubejo booking front
//! end. It owns the path from a one-time external credential (delivered by
//! a redirect-based sign-in flow) to a verified, trustworthy local session.
//!
//! ## Concurrency Model
//!
//! Sign-ins race: a user opens two tabs, a mobile browser resumes a
//! backgrounded flow, a flaky network provokes a second click. Attempts are
//! therefore **single-flight per subject**: registering a new attempt
//! cancels any competitor for the same subject before the new attempt first
//! suspends, and a periodic sweeper evicts attempts leaked by crashed or
//! abandoned flows. Cancellation is cooperative; a superseded attempt's
//! in-flight work may still finish, but its result is discarded and never
//! trusted.
//!
//! ## Establishment Protocol
//!
//! The one-time credential is exchanged for tokens (with exponential
//! backoff on transient network failures only), the tokens are installed
//! into the session store, and the store is polled until a read-back shows
//! a non-empty access token and a resolvable subject. Retry, verification,
//! and overall timeouts are enforced independently, with the inner budgets
//! summing below the outer one.
//!
//! ## Anti-replay
//!
//! Outbound redirects embed a single-use, five-minute state token; the
//! inbound callback must return it. Any verification outcome (success,
//! mismatch, or expiry) consumes the stored token, so replays fail.
//!
//! The UI, the redirect protocol's wire format, and the backing stores stay
//! outside this crate; they are consumed through the traits in
//! [`auth::contracts`].

pub mod auth;
