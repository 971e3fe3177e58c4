use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use st_core::error::CommandError;
use st_core::lockdown;

use super::{
    Daemon, UdpQuery, BLACKHOLE_QUEUE_DEPTH, FORWARD_QUEUE_DEPTH, IO_TIMEOUT_SEC,
    MAX_PACKET_SIZE, MIN_NAME_QUERY_SIZE, UDP_DURATION_STATS,
};

impl Daemon {
    pub(super) async fn serve_udp(self: Arc<Self>) -> anyhow::Result<()> {
        if self.udp_port == 0 {
            return Ok(());
        }
        let server = UdpSocket::bind((self.address.as_str(), self.udp_port))
            .await
            .with_context(|| {
                format!("dnsd: failed to listen on {}:{}", self.address, self.udp_port)
            })?;
        let server = Arc::new(server);
        tracing::info!(address = %self.address, port = self.udp_port, "dnsd: going to listen for UDP queries");

        // One pair of worker queues per upstream socket. The workers drain
        // until the senders are dropped by this loop returning.
        let num_queues = self.num_queues();
        let mut forward_queues = Vec::with_capacity(num_queues);
        let mut blackhole_queues = Vec::with_capacity(num_queues);
        for i in 0..num_queues {
            let forwarder_addr = &self.udp_forwarders[i % self.udp_forwarders.len()];
            let upstream = UdpSocket::bind("0.0.0.0:0")
                .await
                .context("dnsd: failed to open upstream socket")?;
            upstream
                .connect(forwarder_addr)
                .await
                .with_context(|| format!("dnsd: failed to connect to UDP forwarder {forwarder_addr}"))?;
            let (forward_tx, forward_rx) = mpsc::channel::<UdpQuery>(FORWARD_QUEUE_DEPTH);
            let (blackhole_tx, blackhole_rx) = mpsc::channel::<UdpQuery>(BLACKHOLE_QUEUE_DEPTH);
            tokio::spawn(forward_worker(forward_rx, upstream, server.clone()));
            tokio::spawn(blackhole_worker(blackhole_rx, server.clone()));
            forward_queues.push(forward_tx);
            blackhole_queues.push(blackhole_tx);
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
                    received.context("dnsd: failed to receive packet")?
                }
            };
            let began = Instant::now();
            let client_ip = client.ip().to_string();
            // Unknown sources are dropped silently.
            if !self.check_allow_client_ip(&client_ip).await {
                tracing::debug!(%client_ip, "dnsd: client IP is not allowed to query");
                continue;
            }
            if !self.rate_limit.add(&client_ip, true) {
                continue;
            }
            let query = UdpQuery {
                client,
                packet: packet_buf[..length].to_vec(),
            };
            let index = self.queue_index(&client);
            // Too short to be a name query: pass through without a
            // blacklist check.
            let queue = if length < MIN_NAME_QUERY_SIZE {
                &forward_queues[index]
            } else {
                let names = super::extract_domain_names(&query.packet);
                if self.names_are_blacklisted(&names) {
                    tracing::info!(%client_ip, domain = %names.first().cloned().unwrap_or_default(), "dnsd: answering blacklisted domain with black hole");
                    &blackhole_queues[index]
                } else {
                    &forward_queues[index]
                }
            };
            if queue.try_send(query).is_err() {
                tracing::debug!(%client_ip, "dnsd: worker queue is full, dropping query");
            }
            UDP_DURATION_STATS.trigger(began.elapsed().as_micros() as f64);
        }
    }
}

/// Forward each queued query to the upstream resolver over the queue's
/// persistent socket and relay the answer back to the client.
async fn forward_worker(
    mut queue: mpsc::Receiver<UdpQuery>,
    upstream: UdpSocket,
    server: Arc<UdpSocket>,
) {
    let io = Duration::from_secs(IO_TIMEOUT_SEC);
    let mut reply_buf = [0u8; MAX_PACKET_SIZE];
    while let Some(query) = queue.recv().await {
        match timeout(io, upstream.send(&query.packet)).await {
            Ok(Ok(_)) => {}
            _ => {
                tracing::warn!("dnsd: failed to forward query upstream");
                continue;
            }
        }
        let length = match timeout(io, upstream.recv(&mut reply_buf)).await {
            Ok(Ok(length)) => length,
            _ => {
                tracing::warn!("dnsd: upstream did not answer in time");
                continue;
            }
        };
        if let Err(err) = server.send_to(&reply_buf[..length], query.client).await {
            tracing::warn!(error = %err, "dnsd: failed to answer client");
        }
    }
}

/// Answer each queued query with the canned black-hole response, without
/// touching upstream.
async fn blackhole_worker(mut queue: mpsc::Receiver<UdpQuery>, server: Arc<UdpSocket>) {
    while let Some(query) = queue.recv().await {
        let answer = super::respond_with_0(&query.packet);
        if answer.is_empty() {
            continue;
        }
        if let Err(err) = server.send_to(&answer, query.client).await {
            tracing::warn!(error = %err, "dnsd: failed to answer client with black hole");
        }
    }
}
