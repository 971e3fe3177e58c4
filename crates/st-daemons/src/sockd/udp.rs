use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout};

use st_core::error::CommandError;
use st_core::lockdown;

use super::cipher::{decoy_len, open_datagram, seal_datagram};
use super::{
    Daemon, BACKLOG_CLEAR_INTERVAL_SEC, IO_TIMEOUT_SEC, MAX_PACKET_SIZE, UDP_DURATION_STATS,
};

impl Daemon {
    pub(super) async fn serve_udp(self: Arc<Self>) -> anyhow::Result<()> {
        if self.udp_port == 0 {
            return Ok(());
        }
        let server = UdpSocket::bind((self.address.as_str(), self.udp_port))
            .await
            .with_context(|| {
                format!("sockd: failed to listen on {}:{}", self.address, self.udp_port)
            })?;
        let server = Arc::new(server);
        tracing::info!(address = %self.address, port = self.udp_port, "sockd: going to listen for UDP data");

        // Clear the backlog wholesale on a timer, and observe table sizes
        // once in a while.
        {
            let daemon = self.clone();
            tokio::spawn(async move {
                let mut clear_tick = interval(Duration::from_secs(BACKLOG_CLEAR_INTERVAL_SEC));
                clear_tick.tick().await;
                let mut log_tick = interval(Duration::from_secs(900));
                log_tick.tick().await;
                loop {
                    tokio::select! {
                        _ = daemon.stop.notified() => return,
                        _ = clear_tick.tick() => daemon.backlog.clear(),
                        _ = log_tick.tick() => {
                            tracing::info!(
                                backlog = daemon.backlog.len(),
                                nat_entries = daemon.table.len(),
                                "sockd: UDP table sizes"
                            );
                        }
                    }
                }
            });
        }

        let mut packet_buf = [0u8; MAX_PACKET_SIZE];
        loop {
            if lockdown::is_effective() {
                return Err(CommandError::EmergencyLockDown.into());
            }
            if self.is_stopping() {
                return Ok(());
            }
            let (length, client) = tokio::select! {
                _ = self.stop.notified() => return Ok(()),
                received = server.recv_from(&mut packet_buf) => {
                    received.context("sockd: failed to receive packet")?
                }
            };
            let client_ip = client.ip().to_string();
            if !self.rate_limit_udp.add(&client_ip, true) {
                continue;
            }
            // Undecryptable input earns a decoy reply, not an error.
            let plain = match open_datagram(self.cipher, &self.master_key, &packet_buf[..length]) {
                Ok(plain) => plain,
                Err(_) => {
                    self.write_rand_udp(&server, client).await;
                    continue;
                }
            };
            let daemon = self.clone();
            let server = server.clone();
            tokio::spawn(async move {
                daemon.handle_udp_packet(server, client, plain).await;
            });
        }
    }

    /// Relay one decrypted datagram: note the request header in the backlog,
    /// find or create the client's upstream socket, and push the body toward
    /// the destination.
    async fn handle_udp_packet(
        self: Arc<Self>,
        server: Arc<UdpSocket>,
        client: SocketAddr,
        plain: Vec<u8>,
    ) {
        let began = Instant::now();
        let header = match super::parse_relay_addr(&plain) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(client_ip = %client.ip(), error = %format!("{err:#}"), "sockd: malformed packet");
                self.write_rand_udp(&server, client).await;
                return;
            }
        };
        let dest = match tokio::net::lookup_host((header.host.as_str(), header.port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
        {
            Some(dest) => dest,
            None => {
                tracing::warn!(client_ip = %client.ip(), host = %header.host, "sockd: failed to resolve destination");
                self.write_rand_udp(&server, client).await;
                return;
            }
        };
        // Remember the original header so the first reply can carry it.
        self.backlog
            .put_if_absent(dest.to_string(), plain[..header.consumed].to_vec());

        let client_id = client.to_string();
        let (upstream, existed) = match self.table.get(&client_id).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(client_ip = %client.ip(), error = %format!("{err:#}"), "sockd: failed to retrieve connection from table");
                return;
            }
        };
        if !existed {
            let daemon = self.clone();
            let pipe_upstream = upstream.clone();
            tokio::spawn(async move {
                daemon
                    .pipe_udp_connection(server, client, pipe_upstream)
                    .await;
                daemon.table.delete(&client_id);
            });
        }
        let send = timeout(
            Duration::from_secs(IO_TIMEOUT_SEC),
            upstream.send_to(&plain[header.consumed..], dest),
        )
        .await;
        match send {
            Ok(Ok(_)) => {}
            _ => {
                tracing::warn!(client_ip = %client.ip(), "sockd: failed to relay packet upstream");
                self.table.delete(&client.to_string());
            }
        }
        UDP_DURATION_STATS.trigger(began.elapsed().as_micros() as f64);
    }

    /// Read replies from the upstream socket and write them back to the
    /// client, prefixing the first reply from each source with the original
    /// request header kept in the backlog.
    async fn pipe_udp_connection(
        &self,
        server: Arc<UdpSocket>,
        client: SocketAddr,
        upstream: Arc<UdpSocket>,
    ) {
        let mut packet_buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let (length, from) = match timeout(
                Duration::from_secs(IO_TIMEOUT_SEC),
                upstream.recv_from(&mut packet_buf),
            )
            .await
            {
                Ok(Ok(received)) => received,
                _ => return,
            };
            let mut reply = match self.backlog.get(&from.to_string()) {
                Some(header) => header,
                None => super::make_relay_addr_header(&from),
            };
            reply.extend_from_slice(&packet_buf[..length]);
            let packet = match seal_datagram(self.cipher, &self.master_key, &reply) {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "sockd: failed to seal reply");
                    return;
                }
            };
            if server.send_to(&packet, client).await.is_err() {
                return;
            }
        }
    }

    /// Mimic a decoy service: reply with an encrypted blob of random length
    /// and content.
    async fn write_rand_udp(&self, server: &UdpSocket, client: SocketAddr) {
        use rand::RngCore;
        let mut junk = vec![0u8; decoy_len()];
        rand::thread_rng().fill_bytes(&mut junk);
        match seal_datagram(self.cipher, &self.master_key, &junk) {
            Ok(packet) => {
                if let Err(err) = server.send_to(&packet, client).await {
                    tracing::debug!(client_ip = %client.ip(), error = %err, "sockd: failed to write decoy bytes");
                }
            }
            Err(err) => {
                tracing::debug!(error = %format!("{err:#}"), "sockd: failed to seal decoy bytes")
            }
        }
    }
}
