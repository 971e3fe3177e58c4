use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use st_core::error::CommandError;
use st_core::lockdown;

use super::{Daemon, IO_TIMEOUT_SEC, MAX_PACKET_SIZE, TCP_DURATION_STATS};

impl Daemon {
    pub(super) async fn serve_tcp(self: Arc<Self>) -> anyhow::Result<()> {
        if self.tcp_port == 0 {
            return Ok(());
        }
        let listener = TcpListener::bind((self.address.as_str(), self.tcp_port))
            .await
            .with_context(|| {
                format!("dnsd: failed to listen on {}:{}", self.address, self.tcp_port)
            })?;
        tracing::info!(address = %self.address, port = self.tcp_port, "dnsd: going to listen for TCP queries");
        loop {
            if lockdown::is_effective() {
                return Err(CommandError::EmergencyLockDown.into());
            }
            if self.is_stopping() {
                return Ok(());
            }
            tokio::select! {
                _ = self.stop.notified() => return Ok(()),
                accepted = listener.accept() => {
                    let (conn, peer) = accepted.context("dnsd: failed to accept new connection")?;
                    let client_ip = peer.ip().to_string();
                    if !self.check_allow_client_ip(&client_ip).await {
                        tracing::debug!(%client_ip, "dnsd: client IP is not allowed to query");
                        continue;
                    }
                    if !self.rate_limit.add(&client_ip, true) {
                        continue;
                    }
                    let daemon = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = daemon.handle_tcp_query(conn, &peer).await {
                            tracing::warn!(client_ip = %peer.ip(), error = %format!("{err:#}"), "dnsd: failed to serve TCP query");
                        }
                    });
                }
            }
        }
    }

    /// One length-prefixed query per connection: answer blacklisted names
    /// directly, otherwise forward over a fresh dial and stream the response
    /// back.
    async fn handle_tcp_query(
        &self,
        mut conn: TcpStream,
        peer: &std::net::SocketAddr,
    ) -> anyhow::Result<()> {
        let began = Instant::now();
        let io = Duration::from_secs(IO_TIMEOUT_SEC);

        let mut length_bytes = [0u8; 2];
        timeout(io, conn.read_exact(&mut length_bytes))
            .await
            .context("query length read timed out")??;
        let length = u16::from_be_bytes(length_bytes) as usize;
        if length == 0 || length > MAX_PACKET_SIZE {
            anyhow::bail!("unreasonable query length {length}");
        }
        let mut query = vec![0u8; length];
        timeout(io, conn.read_exact(&mut query))
            .await
            .context("query read timed out")??;

        let names = super::extract_domain_names(&query);
        if self.names_are_blacklisted(&names) {
            tracing::info!(client_ip = %peer.ip(), domain = %names.first().cloned().unwrap_or_default(), "dnsd: answering blacklisted domain with black hole");
            let answer = super::respond_with_0(&query);
            let reply = async {
                conn.write_all(&(answer.len() as u16).to_be_bytes()).await?;
                conn.write_all(&answer).await
            };
            timeout(io, reply).await.context("answer write timed out")??;
            TCP_DURATION_STATS.trigger(began.elapsed().as_micros() as f64);
            return Ok(());
        }

        // A fresh dial per query; the TCP path does not use the queues.
        let forwarder = &self.tcp_forwarders[self.queue_index(peer) % self.tcp_forwarders.len()];
        let mut upstream = timeout(io, TcpStream::connect(forwarder.as_str()))
            .await
            .context("forwarder dial timed out")?
            .with_context(|| format!("failed to connect to TCP forwarder {forwarder}"))?;
        let send = async {
            upstream.write_all(&length_bytes).await?;
            upstream.write_all(&query).await
        };
        timeout(io, send).await.context("forward write timed out")??;

        let mut reply_length_bytes = [0u8; 2];
        timeout(io, upstream.read_exact(&mut reply_length_bytes))
            .await
            .context("response length read timed out")??;
        let reply_length = u16::from_be_bytes(reply_length_bytes) as usize;
        let mut reply = vec![0u8; reply_length];
        timeout(io, upstream.read_exact(&mut reply))
            .await
            .context("response read timed out")??;

        let answer = async {
            conn.write_all(&reply_length_bytes).await?;
            conn.write_all(&reply).await
        };
        timeout(io, answer).await.context("answer write timed out")??;
        TCP_DURATION_STATS.trigger(began.elapsed().as_micros() as f64);
        Ok(())
    }
}
