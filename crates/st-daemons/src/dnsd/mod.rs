//! Ad-blocking recursive DNS forwarder: a UDP listener with queue-based
//! fan-out toward upstream resolvers, a TCP listener with fresh dials, and a
//! periodically refreshed blacklist answered with a black-hole A record.

mod tcp;
mod udp;

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{interval, Duration};

use st_config::DnsDaemonConfig;
use st_core::inet::{self, PUBLIC_IP_REFRESH_INTERVAL_SEC};
use st_core::limit::RateLimit;
use st_core::stats::Stats;
use st_core::unix_now;

/// Rate limit is calculated over this interval.
pub const RATE_LIMIT_INTERVAL_SEC: i64 = 10;
/// IO timeout for both read and write operations.
pub const IO_TIMEOUT_SEC: u64 = 60;
/// Maximum acceptable UDP packet size.
pub const MAX_PACKET_SIZE: usize = 9038;
/// Upon start, create `PerIPLimit / NUM_QUEUE_RATIO` queues to handle
/// queries; at least one per forwarder.
pub const NUM_QUEUE_RATIO: usize = 10;
/// Update the ad-server blacklist at this interval.
pub const BLACKLIST_UPDATE_INTERVAL_SEC: u64 = 7200;
/// A query shorter than this cannot possibly be a name query.
pub const MIN_NAME_QUERY_SIZE: usize = 14;

const FORWARD_QUEUE_DEPTH: usize = 16;
const BLACKHOLE_QUEUE_DEPTH: usize = 4;
const BLACKLIST_FETCH_TIMEOUT_SEC: u64 = 30;

/// Durations of UDP query handling, in microseconds.
pub static UDP_DURATION_STATS: Stats = Stats::new();
/// Durations of TCP query handling, in microseconds.
pub static TCP_DURATION_STATS: Stats = Stats::new();

/// DNS response flags: standard response, no indication of error.
pub const STANDARD_RESPONSE_NO_ERROR: [u8; 2] = [0x81, 0x80];

//                                            Domain      A     IN     TTL 1466   IPv4    0.0.0.0
pub const BLACK_HOLE_ANSWER: [u8; 16] = [192, 12, 0, 1, 0, 1, 0, 0, 5, 186, 0, 4, 0, 0, 0, 0];

/// Create a response packet (without length prefix bytes) that points the
/// incoming query to 0.0.0.0.
pub fn respond_with_0(query_no_length: &[u8]) -> Vec<u8> {
    if query_no_length.len() < MIN_NAME_QUERY_SIZE {
        return Vec::new();
    }
    let mut answer = vec![0u8; 2 + 2 + query_no_length.len() - 4 + BLACK_HOLE_ANSWER.len()];
    // Match the transaction ID of the original query.
    answer[0] = query_no_length[0];
    answer[1] = query_no_length[1];
    answer[2..4].copy_from_slice(&STANDARD_RESPONSE_NO_ERROR);
    // Copy the original query structure.
    let copied = query_no_length.len() - 4;
    answer[4..4 + copied].copy_from_slice(&query_no_length[4..]);
    // There is exactly one answer RR.
    answer[6] = 0;
    answer[7] = 1;
    let tail = answer.len() - BLACK_HOLE_ANSWER.len();
    answer[tail..].copy_from_slice(&BLACK_HOLE_ANSWER);
    answer
}

/// Extract the domain name asked by the query, returning the name itself
/// followed by every strict tail after a full stop. E.g. a query for
/// "a.b.github.com" yields ["a.b.github.com", "b.github.com", "github.com"].
pub fn extract_domain_names(packet: &[u8]) -> Vec<String> {
    let mut ret = Vec::new();
    if packet.len() < MIN_NAME_QUERY_SIZE {
        return ret;
    }
    // Locate the Type-A Class-IN trailer that follows the question name.
    let trailer = [0u8, 1, 0, 1];
    let index = packet[13..]
        .windows(4)
        .position(|window| window == trailer);
    let index = match index {
        Some(i) if i >= 1 => i + 13,
        _ => return ret,
    };
    // The byte right before the trailer terminates the name.
    let mut name_bytes = packet[13..index - 1].to_vec();
    // Label length bytes occupy the positions where full stops belong.
    for b in &mut name_bytes {
        if *b <= 44 || (58..=64).contains(b) || (91..=96).contains(b) {
            *b = b'.';
        }
    }
    let mut name = String::from_utf8_lossy(&name_bytes).into_owned();
    if name.len() > 1024 {
        // Unrealistically long, refuse to process.
        return ret;
    }
    ret.push(name.clone());
    loop {
        match name.find('.') {
            Some(i) if i >= 1 && i != name.len() - 1 => {
                name = name[i + 1..].to_string();
                ret.push(name.clone());
            }
            _ => break,
        }
    }
    ret
}

/// A UDP query waiting in a worker queue.
struct UdpQuery {
    client: SocketAddr,
    packet: Vec<u8>,
}

/// The DNS forwarder daemon that selectively refuses to answer A record
/// requests made against advertisement servers.
pub struct Daemon {
    pub address: String,
    pub per_ip_limit: usize,
    pub udp_port: u16,
    pub udp_forwarders: Vec<String>,
    pub tcp_port: u16,
    pub tcp_forwarders: Vec<String>,

    allow_query_ip_prefixes: Mutex<Vec<String>>,
    allow_query_last_update: AtomicI64,
    blacklist: Mutex<Arc<HashSet<String>>>,
    rate_limit: RateLimit,
    stop: Notify,
    stopping: AtomicBool,
}

impl Daemon {
    pub fn new(config: &DnsDaemonConfig) -> anyhow::Result<Self> {
        if config.address.is_empty() {
            bail!("dnsd: listen address must not be empty");
        }
        if config.udp_port == 0 && config.tcp_port == 0 {
            bail!("dnsd: either or both TCP and UDP ports must be specified");
        }
        if config.udp_port > 0 && config.udp_forwarders.is_empty() {
            bail!("dnsd: there must be at least one UDP forwarder address");
        }
        if config.tcp_port > 0 && config.tcp_forwarders.is_empty() {
            bail!("dnsd: there must be at least one TCP forwarder address");
        }
        if config.per_ip_limit < 10 {
            bail!("dnsd: PerIPLimit must be greater than 9");
        }
        if config.allow_query_ip_prefixes.is_empty() {
            bail!("dnsd: allowable IP prefix list must not be empty");
        }
        if config.allow_query_ip_prefixes.iter().any(String::is_empty) {
            bail!("dnsd: allowable IP prefixes must not be empty strings");
        }
        let mut prefixes = config.allow_query_ip_prefixes.clone();
        // Localhost may always query, via both IPv4 and IPv6.
        prefixes.push("127.".to_string());
        prefixes.push("::1".to_string());
        let rate_limit = RateLimit::new(RATE_LIMIT_INTERVAL_SEC, config.per_ip_limit)
            .context("dnsd: bad rate limit")?;
        Ok(Self {
            address: config.address.clone(),
            per_ip_limit: config.per_ip_limit,
            udp_port: config.udp_port,
            udp_forwarders: config.udp_forwarders.clone(),
            tcp_port: config.tcp_port,
            tcp_forwarders: config.tcp_forwarders.clone(),
            allow_query_ip_prefixes: Mutex::new(prefixes),
            allow_query_last_update: AtomicI64::new(0),
            blacklist: Mutex::new(Arc::new(HashSet::new())),
            rate_limit,
            stop: Notify::new(),
            stopping: AtomicBool::new(false),
        })
    }

    /// Serve the configured listeners and keep the blacklist fresh until
    /// `stop` is called.
    pub async fn start_and_block(self: &Arc<Self>) -> anyhow::Result<()> {
        let updater = {
            let daemon = self.clone();
            tokio::spawn(async move {
                daemon.update_ad_block_lists().await;
                let mut tick = interval(Duration::from_secs(BLACKLIST_UPDATE_INTERVAL_SEC));
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = daemon.stop.notified() => return,
                        _ = tick.tick() => daemon.update_ad_block_lists().await,
                    }
                }
            })
        };
        let served = tokio::try_join!(self.clone().serve_udp(), self.clone().serve_tcp());
        updater.abort();
        served?;
        Ok(())
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop.notify_waiters();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// The number of UDP worker queues for this configuration.
    fn num_queues(&self) -> usize {
        (self.per_ip_limit / NUM_QUEUE_RATIO).max(self.udp_forwarders.len())
    }

    /// Deterministic queue assignment: hashing the client address keeps one
    /// client on one upstream socket.
    fn queue_index(&self, client: &SocketAddr) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        client.hash(&mut hasher);
        (hasher.finish() as usize) % self.num_queues()
    }

    /// True only if the client address opens with one of the allowed
    /// prefixes. The machine's own public IP is re-admitted at a regular
    /// interval so the server may query itself through NAT.
    async fn check_allow_client_ip(&self, client_ip: &str) -> bool {
        self.allow_my_public_ip().await;
        let prefixes = self.allow_query_ip_prefixes.lock();
        prefixes.iter().any(|prefix| client_ip.starts_with(prefix))
    }

    async fn allow_my_public_ip(&self) {
        let now = unix_now();
        if self.allow_query_last_update.load(Ordering::Acquire) + PUBLIC_IP_REFRESH_INTERVAL_SEC
            >= now
        {
            return;
        }
        // This runs periodically no matter whether the probe succeeds.
        self.allow_query_last_update.store(now, Ordering::Release);
        let latest_ip = inet::get_public_ip().await;
        if latest_ip.is_empty() {
            // Not fatal; the server simply cannot query itself for now.
            return;
        }
        let mut prefixes = self.allow_query_ip_prefixes.lock();
        if !prefixes.iter().any(|p| p == &latest_ip) {
            tracing::info!(public_ip = %latest_ip, "dnsd: the latest public IP address of this computer is now allowed to query");
            prefixes.push(latest_ip);
        }
    }

    /// True if any of the names is blacklisted. The set pointer is cloned
    /// under the mutex so membership tests do not hold it.
    pub fn names_are_blacklisted(&self, names: &[String]) -> bool {
        let blacklist = self.blacklist.lock().clone();
        names.iter().any(|name| blacklist.contains(name))
    }

    /// Swap in a new blacklist wholesale.
    pub fn replace_blacklist(&self, names: impl IntoIterator<Item = String>) {
        let fresh: HashSet<String> = names.into_iter().collect();
        let count = fresh.len();
        *self.blacklist.lock() = Arc::new(fresh);
        tracing::info!(entries = count, "dnsd: ad-blacklist replaced");
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.lock().len()
    }

    /// Fetch both ad-server lists and replace the blacklist with the union
    /// of the successful fetches. When every source fails the previous
    /// blacklist stays in place; the refresh never kills the daemon.
    async fn update_ad_block_lists(&self) {
        let mut union: Vec<String> = Vec::new();
        let mut any_success = false;
        match get_ad_blacklist_pgl().await {
            Ok(names) => {
                tracing::info!(entries = names.len(), "dnsd: successfully retrieved PGL ad-blacklist");
                union.extend(names);
                any_success = true;
            }
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "dnsd: failed to update PGL ad-blacklist");
            }
        }
        match get_ad_blacklist_mvps().await {
            Ok(names) => {
                tracing::info!(entries = names.len(), "dnsd: successfully retrieved MVPS ad-blacklist");
                union.extend(names);
                any_success = true;
            }
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "dnsd: failed to update MVPS ad-blacklist");
            }
        }
        if any_success {
            self.replace_blacklist(union);
        }
    }
}

/// Download the ad-server list from pgl.yoyo.org.
async fn get_ad_blacklist_pgl() -> anyhow::Result<Vec<String>> {
    let url = "https://pgl.yoyo.org/adservers/serverlist.php?hostformat=nohtml&showintro=0&mimetype=plaintext";
    let body = fetch_text(url).await?;
    let names: Vec<String> = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if names.len() < 100 {
        bail!(
            "the PGL ad-server list is suspiciously short at only {} lines",
            names.len()
        );
    }
    Ok(names)
}

/// Download the ad-server hosts file from winhelp2002.mvps.org and collect
/// the host names out of its `0.0.0.0 name # comment` lines.
async fn get_ad_blacklist_mvps() -> anyhow::Result<Vec<String>> {
    let url = "http://winhelp2002.mvps.org/hosts.txt";
    let body = fetch_text(url).await?;
    let mut names = Vec::with_capacity(16384);
    for line in body.lines() {
        let zero = match line.find("0.0.0.0") {
            Some(i) => i,
            None => continue,
        };
        let name_end = line.find('#').unwrap_or(line.len());
        let name_begin = zero + "0.0.0.0".len();
        if name_begin >= name_end {
            continue;
        }
        let name = line[name_begin..name_end].trim();
        if !name.is_empty() {
            names.push(name.to_string());
        }
    }
    if names.len() < 100 {
        bail!(
            "the MVPS ad-server list is suspiciously short at only {} entries",
            names.len()
        );
    }
    Ok(names)
}

async fn fetch_text(url: &str) -> anyhow::Result<String> {
    let resp = inet::http_client(BLACKLIST_FETCH_TIMEOUT_SEC)
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to fetch {url}"))?;
    if !resp.status().is_success() {
        bail!("{url} answered HTTP {}", resp.status());
    }
    resp.text().await.context("failed to read body")
}
