use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use st_core::error::CommandError;
use st_core::lockdown;

use super::cipher::{
    decoy_len, hkdf_subkey, random_salt, read_aead_chunk, write_aead_chunk,
};
use super::{Daemon, IO_TIMEOUT_SEC, TCP_DURATION_STATS};

impl Daemon {
    pub(super) async fn serve_tcp(self: Arc<Self>) -> anyhow::Result<()> {
        if self.tcp_port == 0 {
            return Ok(());
        }
        let listener = TcpListener::bind((self.address.as_str(), self.tcp_port))
            .await
            .with_context(|| {
                format!("sockd: failed to listen on {}:{}", self.address, self.tcp_port)
            })?;
        tracing::info!(address = %self.address, port = self.tcp_port, "sockd: going to listen for TCP connections");
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
                    let (conn, peer) = accepted.context("sockd: failed to accept new connection")?;
                    let client_ip = peer.ip().to_string();
                    if !self.rate_limit_tcp.add(&client_ip, true) {
                        continue;
                    }
                    let daemon = self.clone();
                    tokio::spawn(async move {
                        daemon.handle_tcp_connection(conn, client_ip).await;
                    });
                }
            }
        }
    }

    /// One relay session: client salt, address chunk, upstream dial, then
    /// bidirectional copy with per-operation deadlines. Anything that smells
    /// like probing gets a decoy reply instead of a protocol error.
    async fn handle_tcp_connection(&self, mut conn: TcpStream, client_ip: String) {
        let began = Instant::now();
        let io = Duration::from_secs(IO_TIMEOUT_SEC);

        let mut client_salt = vec![0u8; self.cipher.salt_len()];
        match timeout(io, conn.read_exact(&mut client_salt)).await {
            Ok(Ok(_)) => {}
            _ => return,
        }
        let client_key = hkdf_subkey(&self.master_key, &client_salt);
        let mut read_counter = 0u64;
        let first_chunk =
            match timeout(io, read_aead_chunk(self.cipher, &client_key, &mut read_counter, &mut conn))
                .await
            {
                Ok(Ok(chunk)) => chunk,
                _ => {
                    self.write_rand_tcp(&mut conn).await;
                    return;
                }
            };
        let header = match super::parse_relay_addr(&first_chunk) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(%client_ip, error = %format!("{err:#}"), "sockd: malformed session header");
                self.write_rand_tcp(&mut conn).await;
                return;
            }
        };
        let mut upstream = match timeout(
            io,
            TcpStream::connect((header.host.as_str(), header.port)),
        )
        .await
        {
            Ok(Ok(upstream)) => upstream,
            _ => {
                tracing::warn!(%client_ip, host = %header.host, port = header.port, "sockd: failed to reach destination");
                self.write_rand_tcp(&mut conn).await;
                return;
            }
        };
        // The remainder of the first chunk is early payload.
        if first_chunk.len() > header.consumed {
            if upstream
                .write_all(&first_chunk[header.consumed..])
                .await
                .is_err()
            {
                return;
            }
        }

        let server_salt = random_salt(self.cipher);
        let server_key = hkdf_subkey(&self.master_key, &server_salt);
        if conn.write_all(&server_salt).await.is_err() {
            return;
        }

        let (mut client_read, mut client_write) = conn.into_split();
        let (mut upstream_read, mut upstream_write) = upstream.into_split();

        // Client -> upstream: decrypt chunks.
        let cipher = self.cipher;
        let decrypt_leg = async move {
            let mut counter = read_counter;
            loop {
                let chunk = match timeout(
                    io,
                    read_aead_chunk(cipher, &client_key, &mut counter, &mut client_read),
                )
                .await
                {
                    Ok(Ok(chunk)) => chunk,
                    _ => break,
                };
                if upstream_write.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        };
        // Upstream -> client: encrypt chunks.
        let encrypt_leg = async move {
            let mut counter = 0u64;
            let mut buf = [0u8; 16384];
            loop {
                let length = match timeout(io, upstream_read.read(&mut buf)).await {
                    Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                    Ok(Ok(length)) => length,
                };
                let written = write_aead_chunk(
                    cipher,
                    &server_key,
                    &mut counter,
                    &mut client_write,
                    &buf[..length],
                )
                .await;
                if written.is_err() {
                    break;
                }
            }
        };
        tokio::join!(decrypt_leg, encrypt_leg);
        TCP_DURATION_STATS.trigger(began.elapsed().as_micros() as f64);
    }

    /// Send an encrypted random-length blob down the stream and let the
    /// probing client chew on it.
    async fn write_rand_tcp(&self, conn: &mut TcpStream) {
        use rand::RngCore;
        let salt = random_salt(self.cipher);
        let key = hkdf_subkey(&self.master_key, &salt);
        let mut junk = vec![0u8; decoy_len()];
        rand::thread_rng().fill_bytes(&mut junk);
        let reply = async {
            conn.write_all(&salt).await?;
            let mut counter = 0u64;
            write_aead_chunk(self.cipher, &key, &mut counter, conn, &junk).await?;
            Ok::<_, anyhow::Error>(())
        };
        if let Err(err) = timeout(Duration::from_secs(IO_TIMEOUT_SEC), reply)
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r)
        {
            tracing::debug!(error = %format!("{err:#}"), "sockd: failed to write decoy bytes");
        }
    }
}
