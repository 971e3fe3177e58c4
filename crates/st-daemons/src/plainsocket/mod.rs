//! Plain-text line protocol over raw TCP and UDP: one feature command per
//! line, one reply line per command.

mod tcp;
mod udp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::Notify;

use st_config::PlainSocketDaemonConfig;
use st_core::limit::RateLimit;
use st_core::processor::CommandProcessor;
use st_core::stats::Stats;

/// Rate limit is calculated over this interval.
pub const RATE_LIMIT_INTERVAL_SEC: i64 = 10;
/// IO timeout for both read and write operations.
pub const IO_TIMEOUT_SEC: u64 = 60;
/// Execution timeout of commands received over the line protocol.
pub const COMMAND_TIMEOUT_SEC: u64 = 30;
/// Maximum acceptable UDP packet size.
pub const MAX_PACKET_SIZE: usize = 9038;

/// Durations of TCP conversations, in microseconds.
pub static TCP_DURATION_STATS: Stats = Stats::new();
/// Durations of UDP conversations, in microseconds.
pub static UDP_DURATION_STATS: Stats = Stats::new();

/// The line protocol daemon. Either port may be zero to disable that
/// listener, but not both.
pub struct Daemon {
    pub address: String,
    pub tcp_port: u16,
    pub udp_port: u16,

    processor: Arc<CommandProcessor>,
    rate_limit: RateLimit,
    stop: Notify,
    stopping: AtomicBool,
}

impl Daemon {
    pub fn new(
        config: &PlainSocketDaemonConfig,
        processor: Arc<CommandProcessor>,
    ) -> anyhow::Result<Self> {
        if config.address.is_empty() {
            bail!("plainsocket: listen address must not be empty");
        }
        if config.tcp_port == 0 && config.udp_port == 0 {
            bail!("plainsocket: either or both TCP and UDP ports must be specified");
        }
        if processor.is_empty() {
            bail!("plainsocket: command processor filters must be configured");
        }
        let rate_limit = RateLimit::new(RATE_LIMIT_INTERVAL_SEC, config.per_ip_limit.max(1))
            .context("plainsocket: bad rate limit")?;
        Ok(Self {
            address: config.address.clone(),
            tcp_port: config.tcp_port,
            udp_port: config.udp_port,
            processor,
            rate_limit,
            stop: Notify::new(),
            stopping: AtomicBool::new(false),
        })
    }

    /// Serve the configured listeners until `stop` is called; any listener
    /// error is returned and tears the daemon down.
    pub async fn start_and_block(self: &Arc<Self>) -> anyhow::Result<()> {
        tokio::try_join!(self.clone().serve_tcp(), self.clone().serve_udp())?;
        Ok(())
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop.notify_waiters();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}
