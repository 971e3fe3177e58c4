use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use st_core::error::CommandError;
use st_core::lockdown;
use st_core::toolbox::Command;

use super::{Daemon, COMMAND_TIMEOUT_SEC, IO_TIMEOUT_SEC, MAX_PACKET_SIZE, UDP_DURATION_STATS};

impl Daemon {
    pub(super) async fn serve_udp(self: Arc<Self>) -> anyhow::Result<()> {
        if self.udp_port == 0 {
            return Ok(());
        }
        let socket = UdpSocket::bind((self.address.as_str(), self.udp_port))
            .await
            .with_context(|| {
                format!(
                    "plainsocket: failed to listen on {}:{}",
                    self.address, self.udp_port
                )
            })?;
        let socket = Arc::new(socket);
        tracing::info!(address = %self.address, port = self.udp_port, "plainsocket: going to listen for UDP commands");
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
                received = socket.recv_from(&mut packet_buf) => {
                    received.context("plainsocket: failed to receive packet")?
                }
            };
            let client_ip = client.ip().to_string();
            if !self.rate_limit.add(&client_ip, true) {
                continue;
            }
            let packet = packet_buf[..length].to_vec();
            let daemon = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                daemon.handle_udp_packet(socket, client, packet).await;
            });
        }
    }

    /// A datagram carries one or more command lines; each is processed and
    /// answered toward the sender's address.
    async fn handle_udp_packet(&self, socket: Arc<UdpSocket>, client: SocketAddr, packet: Vec<u8>) {
        let began = Instant::now();
        let client_ip = client.ip().to_string();
        tracing::debug!(%client_ip, "plainsocket: working on the packet");
        let text = String::from_utf8_lossy(&packet);
        let io = Duration::from_secs(IO_TIMEOUT_SEC);
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            // Unlike TCP there is no connection to admit, but each command
            // line still counts.
            if !self.rate_limit.add(&client_ip, true) {
                break;
            }
            let result = self
                .processor
                .process(Command::new(line, COMMAND_TIMEOUT_SEC))
                .await;
            let mut reply = result.combined_output.into_bytes();
            reply.extend_from_slice(b"\r\n");
            if let Err(err) = timeout(io, socket.send_to(&reply, client))
                .await
                .map_err(anyhow::Error::from)
                .and_then(|r| r.map_err(anyhow::Error::from))
            {
                tracing::debug!(%client_ip, error = %err, "plainsocket: failed to write response");
                break;
            }
        }
        UDP_DURATION_STATS.trigger(began.elapsed().as_micros() as f64);
    }
}
