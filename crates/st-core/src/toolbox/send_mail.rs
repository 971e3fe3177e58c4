//! Mail feature: send an email composed on the command line.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{Command, CommandResult, Feature, SELF_TEST_TIMEOUT_SEC};
use crate::error::CommandError;
use crate::mail::MailClient;

/// Captured into three groups, a mail command looks like:
/// `address@domain.tld "this is the subject" this is the body`
static REGEX_MAIL_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([^\s@"]+@[^\s@"]+)\s*"(.*)"\s*(.*)"#).expect("mail regex"));

const BAD_PARAM: &str = r#"Example: addr@dom.tld "subj" body"#;

/// Sends outgoing emails through the configured mail client.
#[derive(Debug, Clone, Default)]
pub struct SendMail {
    pub client: MailClient,
}

#[async_trait]
impl Feature for SendMail {
    fn is_configured(&self) -> bool {
        self.client.is_configured()
    }

    fn initialise(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn self_test(&self) -> anyhow::Result<()> {
        let addr = (self.client.mta_host.as_str(), self.client.mta_port);
        timeout(
            Duration::from_secs(SELF_TEST_TIMEOUT_SEC),
            TcpStream::connect(addr),
        )
        .await
        .context("MTA connection timed out")?
        .context("MTA connection failed")?;
        Ok(())
    }

    fn trigger(&self) -> &'static str {
        ".m"
    }

    async fn execute(&self, mut cmd: Command) -> CommandResult {
        if let Some(err_result) = cmd.trim() {
            return err_result;
        }
        let caps = match REGEX_MAIL_COMMAND.captures(&cmd.content) {
            Some(caps) => caps,
            None => {
                return CommandResult::from_error(CommandError::Feature(BAD_PARAM.to_string()))
            }
        };
        let recipient = caps[1].to_string();
        let subject = caps[2].to_string();
        let body = caps[3].to_string();

        // Wait for the email to go out in the foreground, but tell the user
        // if it takes longer than the command timeout.
        let client = self.client.clone();
        let body_len = body.len();
        let mut send_task = tokio::spawn(async move {
            client.send(&subject, &body, &[recipient]).await
        });
        match timeout(Duration::from_secs(cmd.timeout_sec.max(1)), &mut send_task).await {
            Err(_) => CommandResult::from_output("Sending in background"),
            Ok(joined) => match joined {
                Ok(Ok(())) => CommandResult::from_output(body_len.to_string()),
                Ok(Err(err)) => {
                    CommandResult::from_error(CommandError::Feature(format!("{err:#}")))
                }
                Err(err) => CommandResult::from_error(CommandError::Feature(format!(
                    "mail delivery task failed - {err}"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mail_command() {
        let caps = REGEX_MAIL_COMMAND
            .captures(r#"howard@localhost "hi there" this is the body"#)
            .unwrap();
        assert_eq!(&caps[1], "howard@localhost");
        assert_eq!(&caps[2], "hi there");
        assert_eq!(&caps[3], "this is the body");
    }

    #[tokio::test]
    async fn refuses_malformed_command() {
        let feature = SendMail {
            client: MailClient {
                mta_host: "localhost".to_string(),
                mta_port: 25,
                mail_from: "root@localhost".to_string(),
            },
        };
        let ret = feature.execute(Command::new("no quotes here", 5)).await;
        assert_eq!(
            ret.error,
            Some(CommandError::Feature(BAD_PARAM.to_string()))
        );
    }
}
