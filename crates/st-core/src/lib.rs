//! Command-dispatch substrate shared by every steward transport front-end.
//!
//! The pieces live roughly in the order a command travels through them:
//! [`limit`] admits the caller, [`filter`] authenticates and rewrites the
//! command, [`processor`] dispatches it to a [`toolbox`] feature, and the
//! result filters massage the reply before it is written back.

pub mod error;
pub mod filter;
pub mod inet;
pub mod limit;
pub mod lockdown;
pub mod mail;
pub mod processor;
pub mod stats;
pub mod testsupport;
pub mod toolbox;

use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

/// Wall-clock instant the process came up. Transports use it to discard
/// messages that were queued before the server existed.
pub static STARTUP_TIME: Lazy<SystemTime> = Lazy::new(SystemTime::now);

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Seconds since [`STARTUP_TIME`].
pub fn uptime_secs() -> u64 {
    STARTUP_TIME.elapsed().map(|d| d.as_secs()).unwrap_or(0)
}
