//! The configuration document: one JSON file with a section per daemon and
//! per filter. The keys mirror the wire-facing names (`Address`, `UDPPort`,
//! `PerIPLimit`, ...), so a running deployment's config reads the same as its
//! documentation.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// The whole configuration document.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default, rename = "Features")]
    pub features: FeaturesConfig,
    #[serde(default, rename = "MailClient")]
    pub mail_client: MailClientConfig,

    #[serde(default, rename = "DNSDaemon")]
    pub dns_daemon: Option<DnsDaemonConfig>,

    #[serde(default, rename = "HTTPDaemon")]
    pub http_daemon: Option<HttpDaemonConfig>,
    #[serde(default, rename = "HTTPFilters")]
    pub http_filters: FiltersConfig,

    #[serde(default, rename = "PlainSocketDaemon")]
    pub plain_socket_daemon: Option<PlainSocketDaemonConfig>,
    #[serde(default, rename = "PlainSocketFilters")]
    pub plain_socket_filters: FiltersConfig,

    #[serde(default, rename = "SockDaemon")]
    pub sock_daemon: Option<SockDaemonConfig>,

    #[serde(default, rename = "ChatBot")]
    pub chat_bot: Option<ChatBotConfig>,
    #[serde(default, rename = "ChatBotFilters")]
    pub chat_bot_filters: FiltersConfig,
}

impl Config {
    pub fn deserialise(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("malformed configuration document")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        Self::deserialise(&text)
            .with_context(|| format!("failed to parse configuration {}", path.display()))
    }
}

/// Feature configuration; features lacking a section fall back to their
/// defaults or stay unconfigured.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FeaturesConfig {
    #[serde(default, rename = "Shell")]
    pub shell: ShellConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ShellConfig {
    /// Interpreter that runs `.s` statements; empty means `/bin/sh`.
    #[serde(default, rename = "Interpreter")]
    pub interpreter: String,
}

/// Outgoing mail: the smarthost every mail-producing part submits to.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MailClientConfig {
    #[serde(default, rename = "MTAHost")]
    pub mta_host: String,
    #[serde(default, rename = "MTAPort")]
    pub mta_port: u16,
    #[serde(default, rename = "MailFrom")]
    pub mail_from: String,
}

/// The filter variants to instantiate for one daemon's command processor,
/// with their parameters. Instantiation order is fixed: PIN gate, sequence
/// translation in front; combined-text reset, lint, empty-output
/// substitution, mail notification behind.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FiltersConfig {
    #[serde(default, rename = "PINAndShortcuts")]
    pub pin_and_shortcuts: Option<PinConfig>,
    #[serde(default, rename = "TranslateSequences")]
    pub translate_sequences: Option<TranslateSequencesConfig>,
    #[serde(default, rename = "LintText")]
    pub lint_text: Option<LintTextConfig>,
    #[serde(default, rename = "NotifyViaEmail")]
    pub notify_via_email: Option<NotifyViaEmailConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PinConfig {
    #[serde(default, rename = "PIN")]
    pub pin: String,
    #[serde(default, rename = "Shortcuts")]
    pub shortcuts: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TranslateSequencesConfig {
    /// Ordered `[from, to]` pairs.
    #[serde(default, rename = "Sequences")]
    pub sequences: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LintTextConfig {
    #[serde(default, rename = "TrimSpaces")]
    pub trim_spaces: bool,
    #[serde(default, rename = "CompressSpaces")]
    pub compress_spaces: bool,
    #[serde(default, rename = "CompressToSingleLine")]
    pub compress_to_single_line: bool,
    #[serde(default, rename = "KeepVisible7BitCharOnly")]
    pub keep_visible_7bit_char_only: bool,
    #[serde(default, rename = "BeginPosition")]
    pub begin_position: usize,
    #[serde(default, rename = "MaxLength")]
    pub max_length: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotifyViaEmailConfig {
    #[serde(default, rename = "Recipients")]
    pub recipients: Vec<String>,
}

/// Ad-blocking recursive DNS forwarder.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DnsDaemonConfig {
    #[serde(default, rename = "Address")]
    pub address: String,
    #[serde(default, rename = "AllowQueryIPPrefixes")]
    pub allow_query_ip_prefixes: Vec<String>,
    /// How many queries an IP may send within the rate limit interval.
    #[serde(default, rename = "PerIPLimit")]
    pub per_ip_limit: usize,

    #[serde(default, rename = "UDPPort")]
    pub udp_port: u16,
    #[serde(default, rename = "UDPForwarders")]
    pub udp_forwarders: Vec<String>,
    #[serde(default, rename = "TCPPort")]
    pub tcp_port: u16,
    #[serde(default, rename = "TCPForwarders")]
    pub tcp_forwarders: Vec<String>,
}

/// HTTP daemon with its handler surface.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HttpDaemonConfig {
    #[serde(default, rename = "Address")]
    pub address: String,
    #[serde(default, rename = "Port")]
    pub port: u16,
    /// How many times the most expensive handler may be invoked by an IP
    /// within the rate limit interval.
    #[serde(default, rename = "BaseRateLimit")]
    pub base_rate_limit: usize,
    /// Serve directories (value) on URL prefixes (key).
    #[serde(default, rename = "ServeDirectories")]
    pub serve_directories: HashMap<String, String>,
    /// Greeting spoken to incoming Twilio phone calls.
    #[serde(default, rename = "TwilioCallGreeting")]
    pub twilio_call_greeting: String,
    /// Recipients of the mail-me form.
    #[serde(default, rename = "MailMeRecipients")]
    pub mail_me_recipients: Vec<String>,
}

/// Line-protocol daemon over raw TCP and UDP.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlainSocketDaemonConfig {
    #[serde(default, rename = "Address")]
    pub address: String,
    #[serde(default, rename = "TCPPort")]
    pub tcp_port: u16,
    #[serde(default, rename = "UDPPort")]
    pub udp_port: u16,
    #[serde(default, rename = "PerIPLimit")]
    pub per_ip_limit: usize,
}

/// Encrypted SOCKS-style relay.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SockDaemonConfig {
    #[serde(default, rename = "Address")]
    pub address: String,
    #[serde(default, rename = "TCPPort")]
    pub tcp_port: u16,
    #[serde(default, rename = "UDPPort")]
    pub udp_port: u16,
    #[serde(default, rename = "Password")]
    pub password: String,
    /// AEAD method name; empty means aes-256-gcm.
    #[serde(default, rename = "Method")]
    pub method: String,
    #[serde(default, rename = "PerIPLimit")]
    pub per_ip_limit: usize,
}

/// Long-poll chat bot.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatBotConfig {
    #[serde(default, rename = "AuthorizationToken")]
    pub authorization_token: String,
    /// Messages a user may have processed per poll interval.
    #[serde(default, rename = "RateLimit")]
    pub rate_limit: usize,
}
