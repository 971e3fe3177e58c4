//! Fixed-window admission control shared by every transport.

use std::collections::{HashMap, HashSet};

use anyhow::bail;
use parking_lot::Mutex;

use crate::unix_now;

/// Tracks the number of hits performed by each source ("actor") against a
/// fixed window: instead of rolling, the tracking data of every actor is
/// reset simultaneously once the window elapses.
pub struct RateLimit {
    unit_secs: i64,
    max_count: usize,
    window: Mutex<Window>,
}

struct Window {
    last_timestamp: i64,
    counter: HashMap<String, usize>,
    logged: HashSet<String>,
}

impl RateLimit {
    pub fn new(unit_secs: i64, max_count: usize) -> anyhow::Result<Self> {
        if unit_secs < 1 || max_count < 1 {
            bail!("rate limit: unit seconds and max count must be greater than 0");
        }
        Ok(Self {
            unit_secs,
            max_count,
            window: Mutex::new(Window {
                last_timestamp: 0,
                counter: HashMap::new(),
                logged: HashSet::new(),
            }),
        })
    }

    /// Increase the actor's counter by one; admit only while the counter
    /// stays within the maximum. When refused and `log_if_refused` holds, a
    /// single warning is emitted per actor per window.
    pub fn add(&self, actor: &str, log_if_refused: bool) -> bool {
        self.add_at(actor, log_if_refused, unix_now())
    }

    fn add_at(&self, actor: &str, log_if_refused: bool, now: i64) -> bool {
        let mut window = self.window.lock();
        if now - window.last_timestamp >= self.unit_secs {
            window.counter.clear();
            window.logged.clear();
            window.last_timestamp = now;
        }
        let count = {
            let entry = window.counter.entry(actor.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count <= self.max_count {
            return true;
        }
        if log_if_refused && window.logged.insert(actor.to_string()) {
            tracing::warn!(
                actor,
                max_count = self.max_count,
                unit_secs = self.unit_secs,
                "rate limit exceeded"
            );
        }
        false
    }
}
