use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use st_core::error::CommandError;
use st_core::lockdown;
use st_core::toolbox::Command;

use super::{Daemon, COMMAND_TIMEOUT_SEC, IO_TIMEOUT_SEC, TCP_DURATION_STATS};

impl Daemon {
    pub(super) async fn serve_tcp(self: Arc<Self>) -> anyhow::Result<()> {
        if self.tcp_port == 0 {
            return Ok(());
        }
        let listener = TcpListener::bind((self.address.as_str(), self.tcp_port))
            .await
            .with_context(|| {
                format!(
                    "plainsocket: failed to listen on {}:{}",
                    self.address, self.tcp_port
                )
            })?;
        tracing::info!(address = %self.address, port = self.tcp_port, "plainsocket: going to listen for TCP connections");
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
                    let (conn, peer) = accepted.context("plainsocket: failed to accept new connection")?;
                    let daemon = self.clone();
                    tokio::spawn(async move {
                        daemon.handle_tcp_connection(conn, peer.ip().to_string()).await;
                    });
                }
            }
        }
    }

    /// Read a feature command from each line, invoke the processor and write
    /// the combined result back, until the client goes away or runs into the
    /// rate limit.
    async fn handle_tcp_connection(&self, mut conn: TcpStream, client_ip: String) {
        let began = Instant::now();
        // The connection itself counts against the rate limit, before a
        // single line is read.
        if !self.rate_limit.add(&client_ip, true) {
            return;
        }
        tracing::debug!(%client_ip, "plainsocket: working on the connection");
        let (reader, mut writer) = conn.split();
        let mut lines = BufReader::new(reader).lines();
        let io = Duration::from_secs(IO_TIMEOUT_SEC);
        loop {
            let line = match timeout(io, lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    tracing::debug!(%client_ip, error = %err, "plainsocket: failed to read from client");
                    break;
                }
                Err(_) => break,
            };
            if !self.rate_limit.add(&client_ip, true) {
                break;
            }
            let result = self
                .processor
                .process(Command::new(line, COMMAND_TIMEOUT_SEC))
                .await;
            let reply = async {
                writer.write_all(result.combined_output.as_bytes()).await?;
                writer.write_all(b"\r\n").await
            };
            match timeout(io, reply).await {
                Ok(Ok(())) => {}
                _ => break,
            }
        }
        TCP_DURATION_STATS.trigger(began.elapsed().as_micros() as f64);
    }
}
