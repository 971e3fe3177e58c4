//! Daemon front-ends around the steward command substrate: the raw line
//! protocol, the ad-blocking DNS forwarder, the encrypted relay, the HTTP
//! surface, and the long-poll chat bot.
//!
//! Every daemon follows the same lifecycle: `new` validates configuration
//! and builds internal state, `start_and_block` serves until told to stop
//! (returning `Ok` only for a stop-caused shutdown), and `stop` is
//! idempotent.

pub mod chatbot;
pub mod dnsd;
pub mod httpd;
pub mod plainsocket;
pub mod sockd;
