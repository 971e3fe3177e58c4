//! Encrypted SOCKS-style relay: per-session AEAD over TCP, per-datagram
//! AEAD over UDP with a NAT table, and decoy replies toward probing clients.

pub mod cipher;
mod tcp;
mod udp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use st_config::SockDaemonConfig;
use st_core::limit::RateLimit;
use st_core::stats::Stats;

use cipher::CipherKind;

/// Rate limit is calculated over this interval.
pub const RATE_LIMIT_INTERVAL_SEC: i64 = 10;
/// IO timeout for both read and write operations.
pub const IO_TIMEOUT_SEC: u64 = 60;
/// Maximum acceptable UDP packet size.
pub const MAX_PACKET_SIZE: usize = 9038;
/// The UDP backlog is cleared wholesale at this interval.
pub const BACKLOG_CLEAR_INTERVAL_SEC: u64 = 2 * IO_TIMEOUT_SEC;

/// Address types of the relay header following decryption.
pub const ADDRESS_TYPE_IPV4: u8 = 0x01;
pub const ADDRESS_TYPE_DOMAIN: u8 = 0x03;
pub const ADDRESS_TYPE_IPV6: u8 = 0x04;
const ADDRESS_TYPE_MASK: u8 = 0x0f;

/// Durations of TCP sessions, in microseconds.
pub static TCP_DURATION_STATS: Stats = Stats::new();
/// Durations of UDP packet handling, in microseconds.
pub static UDP_DURATION_STATS: Stats = Stats::new();

/// Destination parsed out of a relay address header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAddr {
    pub host: String,
    pub port: u16,
    /// Bytes the header occupied, including the type byte.
    pub consumed: usize,
}

/// Decode the `<type><address><port>` header that opens every decrypted
/// message. Domains containing NUL are rejected outright, as are headers
/// longer than the buffer that carries them.
pub fn parse_relay_addr(buf: &[u8]) -> anyhow::Result<RelayAddr> {
    if buf.is_empty() {
        bail!("empty address header");
    }
    match buf[0] & ADDRESS_TYPE_MASK {
        ADDRESS_TYPE_IPV4 => {
            if buf.len() < 1 + 4 + 2 {
                bail!("truncated IPv4 address");
            }
            let host = std::net::Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]).to_string();
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            Ok(RelayAddr { host, port, consumed: 7 })
        }
        ADDRESS_TYPE_DOMAIN => {
            if buf.len() < 2 {
                bail!("truncated domain length");
            }
            let name_len = buf[1] as usize;
            if buf.len() < 2 + name_len + 2 {
                bail!("truncated domain address");
            }
            let name = &buf[2..2 + name_len];
            if name.contains(&0) {
                bail!("domain name contains invalid byte 0");
            }
            let host = String::from_utf8_lossy(name).into_owned();
            let port = u16::from_be_bytes([buf[2 + name_len], buf[2 + name_len + 1]]);
            Ok(RelayAddr {
                host,
                port,
                consumed: 2 + name_len + 2,
            })
        }
        ADDRESS_TYPE_IPV6 => {
            if buf.len() < 1 + 16 + 2 {
                bail!("truncated IPv6 address");
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let host = std::net::Ipv6Addr::from(octets).to_string();
            let port = u16::from_be_bytes([buf[17], buf[18]]);
            Ok(RelayAddr {
                host,
                port,
                consumed: 19,
            })
        }
        other => bail!("unknown address type {other}"),
    }
}

/// Build the address header announcing the packet source on the return
/// path.
pub fn make_relay_addr_header(addr: &SocketAddr) -> Vec<u8> {
    let mut header = Vec::with_capacity(19);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => {
            header.push(ADDRESS_TYPE_IPV4);
            header.extend_from_slice(&ip.octets());
        }
        std::net::IpAddr::V6(ip) => {
            header.push(ADDRESS_TYPE_IPV6);
            header.extend_from_slice(&ip.octets());
        }
    }
    header.extend_from_slice(&addr.port().to_be_bytes());
    header
}

/// First-request packets per destination; the stored header is prepended to
/// the first reply of each relay. Cleared wholesale on a timer.
#[derive(Default)]
struct UdpBacklog {
    backlog: Mutex<HashMap<String, Vec<u8>>>,
}

impl UdpBacklog {
    fn clear(&self) {
        self.backlog.lock().clear();
    }

    fn get(&self, addr: &str) -> Option<Vec<u8>> {
        self.backlog.lock().get(addr).cloned()
    }

    fn put_if_absent(&self, addr: String, packet: Vec<u8>) {
        self.backlog.lock().entry(addr).or_insert(packet);
    }

    fn len(&self) -> usize {
        self.backlog.lock().len()
    }
}

/// One ephemeral upstream socket per client address.
#[derive(Default)]
struct UdpTable {
    connections: Mutex<HashMap<String, Arc<UdpSocket>>>,
}

impl UdpTable {
    /// Fetch the client's socket, creating one on first sight. The boolean
    /// reports whether the socket already existed.
    async fn get(&self, client_id: &str) -> anyhow::Result<(Arc<UdpSocket>, bool)> {
        if let Some(conn) = self.connections.lock().get(client_id) {
            return Ok((conn.clone(), true));
        }
        let fresh = Arc::new(
            UdpSocket::bind("0.0.0.0:0")
                .await
                .context("failed to open upstream socket")?,
        );
        // A concurrent insert for the same client wins; use whichever
        // socket landed in the table.
        let mut connections = self.connections.lock();
        match connections.get(client_id) {
            Some(existing) => Ok((existing.clone(), true)),
            None => {
                connections.insert(client_id.to_string(), fresh.clone());
                Ok((fresh, false))
            }
        }
    }

    fn delete(&self, client_id: &str) -> Option<Arc<UdpSocket>> {
        self.connections.lock().remove(client_id)
    }

    fn len(&self) -> usize {
        self.connections.lock().len()
    }
}

/// The relay daemon.
pub struct Daemon {
    pub address: String,
    pub tcp_port: u16,
    pub udp_port: u16,

    cipher: CipherKind,
    master_key: Vec<u8>,
    rate_limit_tcp: RateLimit,
    rate_limit_udp: RateLimit,
    backlog: UdpBacklog,
    table: UdpTable,
    stop: Notify,
    stopping: AtomicBool,
}

impl Daemon {
    pub fn new(config: &SockDaemonConfig) -> anyhow::Result<Self> {
        if config.address.is_empty() {
            bail!("sockd: listen address must not be empty");
        }
        if config.tcp_port == 0 && config.udp_port == 0 {
            bail!("sockd: either or both TCP and UDP ports must be specified");
        }
        if config.password.len() < 7 {
            bail!("sockd: password must be at least 7 characters long");
        }
        let cipher = CipherKind::from_method(&config.method)
            .with_context(|| format!("sockd: unsupported method {:?}", config.method))?;
        let per_ip_limit = config.per_ip_limit.max(1);
        Ok(Self {
            address: config.address.clone(),
            tcp_port: config.tcp_port,
            udp_port: config.udp_port,
            master_key: cipher::evp_bytes_to_key(&config.password, cipher.key_len()),
            cipher,
            rate_limit_tcp: RateLimit::new(RATE_LIMIT_INTERVAL_SEC, per_ip_limit)
                .context("sockd: bad rate limit")?,
            rate_limit_udp: RateLimit::new(RATE_LIMIT_INTERVAL_SEC, per_ip_limit)
                .context("sockd: bad rate limit")?,
            backlog: UdpBacklog::default(),
            table: UdpTable::default(),
            stop: Notify::new(),
            stopping: AtomicBool::new(false),
        })
    }

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
