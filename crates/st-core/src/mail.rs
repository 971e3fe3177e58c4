//! Plain SMTP delivery toward a configured mail transfer agent.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use st_config::MailClientConfig;

const IO_TIMEOUT_SEC: u64 = 60;

/// Sends mail via an unauthenticated SMTP dialogue with the configured MTA,
/// the way a host submits to its own smarthost.
#[derive(Debug, Clone, Default)]
pub struct MailClient {
    pub mta_host: String,
    pub mta_port: u16,
    pub mail_from: String,
}

fn expect(code: u16, line: &str) -> Result<()> {
    if !line.starts_with(&code.to_string()) {
        bail!("MTA said {:?}, expected {}", line.trim(), code);
    }
    Ok(())
}

impl MailClient {
    pub fn from_config(config: &MailClientConfig) -> Self {
        Self {
            mta_host: config.mta_host.clone(),
            mta_port: if config.mta_port == 0 { 25 } else { config.mta_port },
            mail_from: config.mail_from.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.mta_host.is_empty() && !self.mail_from.is_empty()
    }

    /// Deliver one message to every recipient in a single SMTP session.
    pub async fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()> {
        if !self.is_configured() {
            bail!("mail client is not configured");
        }
        if recipients.is_empty() {
            bail!("no recipients");
        }
        let io = Duration::from_secs(IO_TIMEOUT_SEC);
        let stream = timeout(io, TcpStream::connect((self.mta_host.as_str(), self.mta_port)))
            .await
            .context("connect to MTA timed out")?
            .context("connect to MTA")?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut line = String::new();

        macro_rules! read_reply {
            () => {{
                // Skip continuation lines of multi-line replies ("250-...").
                loop {
                    line.clear();
                    timeout(io, reader.read_line(&mut line))
                        .await
                        .context("MTA read timed out")?
                        .context("read MTA reply")?;
                    if line.len() < 4 || line.as_bytes()[3] != b'-' {
                        break;
                    }
                }
            }};
        }
        macro_rules! write_line {
            ($($arg:tt)*) => {{
                let out = format!($($arg)*);
                timeout(io, writer.write_all(out.as_bytes()))
                    .await
                    .context("MTA write timed out")?
                    .context("write to MTA")?;
            }};
        }

        read_reply!();
        expect(220, &line)?;
        write_line!("HELO steward\r\n");
        read_reply!();
        expect(250, &line)?;
        write_line!("MAIL FROM:<{}>\r\n", self.mail_from);
        read_reply!();
        expect(250, &line)?;
        for recipient in recipients {
            write_line!("RCPT TO:<{}>\r\n", recipient);
            read_reply!();
            expect(250, &line)?;
        }
        write_line!("DATA\r\n");
        read_reply!();
        expect(354, &line)?;
        write_line!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\n\r\n",
            self.mail_from,
            recipients.join(", "),
            subject.replace(['\r', '\n'], " ")
        );
        for body_line in body.lines() {
            // Dot-stuff per RFC 5321.
            if body_line.starts_with('.') {
                write_line!(".{}\r\n", body_line);
            } else {
                write_line!("{}\r\n", body_line);
            }
        }
        write_line!(".\r\n");
        read_reply!();
        expect(250, &line)?;
        write_line!("QUIT\r\n");
        Ok(())
    }
}
