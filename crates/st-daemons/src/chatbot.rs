//! Long-poll chat bot: fetch updates from the chat API at a fixed interval,
//! run private-chat messages as commands, reply with the combined output.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use anyhow::{bail, Context};
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};

use st_config::ChatBotConfig;
use st_core::error::CommandError;
use st_core::limit::RateLimit;
use st_core::lockdown;
use st_core::processor::CommandProcessor;
use st_core::stats::Stats;
use st_core::toolbox::Command;
use st_core::STARTUP_TIME;

/// Name of the private chat type.
pub const CHAT_TYPE_PRIVATE: &str = "private";
/// Poll for incoming messages at this interval.
pub const POLL_INTERVAL_SEC: u64 = 5;
/// Outgoing API calls are constrained by this timeout.
pub const API_CALL_TIMEOUT_SEC: u64 = 30;
/// Command execution is constrained by this timeout.
pub const COMMAND_TIMEOUT_SEC: u64 = 30;

/// Durations of chat conversations served, in microseconds.
pub static DURATION_STATS: Stats = Stats::new();

/// Chat API entity - user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiUser {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub username: String,
}

/// Chat API entity - chat.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiChat {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default, rename = "type")]
    pub chat_type: String,
}

/// Chat API entity - message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiMessage {
    #[serde(default, rename = "message_id")]
    pub id: u64,
    #[serde(default)]
    pub from: ApiUser,
    #[serde(default)]
    pub chat: ApiChat,
    #[serde(default, rename = "date")]
    pub timestamp: i64,
    #[serde(default)]
    pub text: String,
}

/// Chat API entity - one bot update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiUpdate {
    #[serde(default, rename = "update_id")]
    pub id: u64,
    #[serde(default)]
    pub message: ApiMessage,
}

/// Chat API entity - getUpdates response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiUpdates {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, rename = "result")]
    pub updates: Vec<ApiUpdate>,
}

/// Processes feature commands arriving over chat messages.
pub struct Daemon {
    authorization_token: String,
    api_base: String,
    processor: Arc<CommandProcessor>,
    user_rate_limit: RateLimit,
    message_offset: AtomicU64,
    client: reqwest::Client,
    stop: Notify,
    stopping: AtomicBool,
}

impl Daemon {
    pub fn new(config: &ChatBotConfig, processor: Arc<CommandProcessor>) -> anyhow::Result<Self> {
        Self::with_api_base(config, processor, "https://api.telegram.org".to_string())
    }

    /// Test seam: point the bot at an alternative API host.
    pub fn with_api_base(
        config: &ChatBotConfig,
        processor: Arc<CommandProcessor>,
        api_base: String,
    ) -> anyhow::Result<Self> {
        if processor.is_empty() {
            bail!("chatbot: command processor and its filters must be configured");
        }
        let findings = processor.is_sane_for_internet();
        if !findings.is_empty() {
            bail!("chatbot: processor configuration is insane: {findings:?}");
        }
        if config.authorization_token.is_empty() {
            bail!("chatbot: AuthorizationToken must not be empty");
        }
        if config.rate_limit < 1 {
            bail!("chatbot: RateLimit must be greater than 0");
        }
        Ok(Self {
            authorization_token: config.authorization_token.clone(),
            api_base,
            processor,
            user_rate_limit: RateLimit::new(POLL_INTERVAL_SEC as i64, config.rate_limit)
                .context("chatbot: bad rate limit")?,
            message_offset: AtomicU64::new(0),
            client: st_core::inet::http_client(API_CALL_TIMEOUT_SEC),
            stop: Notify::new(),
            stopping: AtomicBool::new(false),
        })
    }

    /// Send a text reply into the chat.
    async fn reply_to(&self, chat_id: u64, text: &str) -> anyhow::Result<()> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base, self.authorization_token
        );
        let resp = self
            .client
            .post(&url)
            .form(&[("chat_id", chat_id.to_string()), ("text", text.to_string())])
            .send()
            .await
            .context("sendMessage call failed")?;
        if !resp.status().is_success() {
            bail!("sendMessage answered HTTP {}", resp.status());
        }
        Ok(())
    }

    /// Process a batch of updates: rate limit per user, ignore stale and
    /// non-private chatter, run the rest as commands in the background.
    fn process_updates(self: &Arc<Self>, updates: ApiUpdates) {
        for update in updates.updates {
            let began = Instant::now();
            if self.message_offset.load(Ordering::Acquire) <= update.id {
                self.message_offset.store(update.id + 1, Ordering::Release);
            }
            let message = update.message;
            let mut origin = message.from.username.clone();
            if origin.is_empty() {
                origin = message.chat.username.clone();
            }
            if !self.user_rate_limit.add(&origin, true) {
                let daemon = self.clone();
                let chat_id = message.chat.id;
                let origin = origin.clone();
                tokio::spawn(async move {
                    if let Err(err) = daemon.reply_to(chat_id, "rate limited").await {
                        tracing::warn!(%origin, error = %format!("{err:#}"), "chatbot: failed to send reply");
                    }
                });
                continue;
            }
            // Skip messages that were queued before the server came up.
            let startup_unix = STARTUP_TIME
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            if message.timestamp < startup_unix {
                tracing::warn!(%origin, "chatbot: ignoring message that arrived before server startup");
                continue;
            }
            if message.chat.chat_type != CHAT_TYPE_PRIVATE {
                tracing::warn!(%origin, chat_id = message.chat.id, "chatbot: ignoring non-private chat");
                continue;
            }
            // The conventional greeting is not a command.
            if message.text == "/start" {
                tracing::info!(%origin, chat_id = message.chat.id, "chatbot: chat started");
                continue;
            }
            let daemon = self.clone();
            tokio::spawn(async move {
                let result = daemon
                    .processor
                    .process(Command::new(message.text, COMMAND_TIMEOUT_SEC))
                    .await;
                if let Err(err) = daemon
                    .reply_to(message.chat.id, &result.combined_output)
                    .await
                {
                    tracing::warn!(username = %message.chat.username, error = %format!("{err:#}"), "chatbot: failed to send reply");
                }
                DURATION_STATS.trigger(began.elapsed().as_micros() as f64);
            });
        }
    }

    /// Poll and process messages until told to stop. An unreachable API at
    /// startup is fatal; later failures are logged and retried at the next
    /// tick.
    pub async fn start_and_block(self: &Arc<Self>) -> anyhow::Result<()> {
        let me_url = format!("{}/bot{}/getMe", self.api_base, self.authorization_token);
        let test_resp = self
            .client
            .get(&me_url)
            .send()
            .await
            .context("chatbot: API test call failed")?;
        if !test_resp.status().is_success() {
            bail!("chatbot: API test call answered HTTP {}", test_resp.status());
        }
        tracing::info!("chatbot: going to poll for messages");
        loop {
            if lockdown::is_effective() {
                return Err(CommandError::EmergencyLockDown.into());
            }
            if self.is_stopping() {
                return Ok(());
            }
            let updates_url = format!(
                "{}/bot{}/getUpdates?offset={}",
                self.api_base,
                self.authorization_token,
                self.message_offset.load(Ordering::Acquire)
            );
            match self.client.get(&updates_url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<ApiUpdates>().await {
                    Ok(updates) if updates.ok => self.process_updates(updates),
                    Ok(_) => tracing::warn!("chatbot: API response is not OK"),
                    Err(err) => {
                        tracing::warn!(error = %err, "chatbot: failed to decode response JSON")
                    }
                },
                Ok(resp) => {
                    tracing::warn!(status = %resp.status(), "chatbot: failed to poll for updates")
                }
                Err(err) => tracing::warn!(error = %err, "chatbot: failed to poll for updates"),
            }
            tokio::select! {
                _ = self.stop.notified() => return Ok(()),
                _ = sleep(Duration::from_secs(POLL_INTERVAL_SEC)) => {}
            }
        }
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop.notify_waiters();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use st_core::testsupport::get_test_command_processor;

    fn test_config() -> ChatBotConfig {
        ChatBotConfig {
            authorization_token: "test-token".to_string(),
            rate_limit: 2,
        }
    }

    #[test]
    fn configuration_is_validated() {
        let processor = Arc::new(get_test_command_processor());
        assert!(Daemon::new(&test_config(), processor.clone()).is_ok());

        let mut config = test_config();
        config.authorization_token.clear();
        assert!(Daemon::new(&config, processor.clone()).is_err());

        let mut config = test_config();
        config.rate_limit = 0;
        assert!(Daemon::new(&config, processor).is_err());

        let insane = Arc::new(CommandProcessor::default());
        assert!(Daemon::new(&test_config(), insane).is_err());
    }

    #[test]
    fn updates_deserialise() {
        let body = r#"{"ok": true, "result": [{
            "update_id": 7,
            "message": {
                "message_id": 1,
                "from": {"id": 2, "username": "howard"},
                "chat": {"id": 3, "username": "howard", "type": "private"},
                "date": 1500000000,
                "text": "verysecret .s echo hi"
            }
        }]}"#;
        let updates: ApiUpdates = serde_json::from_str(body).unwrap();
        assert!(updates.ok);
        assert_eq!(updates.updates.len(), 1);
        let message = &updates.updates[0].message;
        assert_eq!(message.chat.chat_type, CHAT_TYPE_PRIVATE);
        assert_eq!(message.text, "verysecret .s echo hi");
    }

    #[tokio::test]
    async fn start_fails_against_unreachable_api() {
        let processor = Arc::new(get_test_command_processor());
        let daemon = Arc::new(
            Daemon::with_api_base(
                &test_config(),
                processor,
                // Nothing listens here.
                "http://127.0.0.1:9".to_string(),
            )
            .unwrap(),
        );
        assert!(daemon.start_and_block().await.is_err());
        // Repeatedly stopping the daemon has no negative consequence.
        daemon.stop();
        daemon.stop();
    }
}
