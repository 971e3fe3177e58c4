//! The HTTP surface: command form, Twilio SMS and voice webhooks, mail-me,
//! and cheap static directory serving. Every endpoint carries its own
//! fixed-window rate limit bucket scaled off the base rate limit.

mod handlers;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};

use st_config::HttpDaemonConfig;
use st_core::error::CommandError;
use st_core::limit::RateLimit;
use st_core::lockdown;
use st_core::mail::MailClient;
use st_core::processor::CommandProcessor;
use st_core::stats::Stats;

/// Directory handlers are this much cheaper than the most expensive handler.
pub const DIRECTORY_HANDLER_RATE_LIMIT_FACTOR: usize = 10;
/// Rate limit is calculated over this interval.
pub const RATE_LIMIT_INTERVAL_SEC: i64 = 10;
/// IO timeout for both read and write operations.
pub const IO_TIMEOUT_SEC: u64 = 60;
/// Execution timeout of commands submitted through the form and webhooks.
pub const COMMAND_TIMEOUT_SEC: u64 = 120;
/// A phone number may issue one Twilio interaction per this interval.
pub const TWILIO_PHONE_NUMBER_RATE_LIMIT_INTERVAL_SEC: i64 = 10;

/// Durations of handled requests, in microseconds.
pub static DURATION_STATS: Stats = Stats::new();

/// Shared state behind every handler.
pub(crate) struct HttpState {
    pub processor: Arc<CommandProcessor>,
    pub mail_client: MailClient,
    pub mail_me_recipients: Vec<String>,
    pub twilio_call_greeting: String,
    /// URL prefix -> filesystem directory.
    pub serve_directories: HashMap<String, String>,

    pub cmd_form_limit: RateLimit,
    pub twilio_limit: RateLimit,
    pub mail_me_limit: RateLimit,
    pub directory_limit: RateLimit,
    /// Secondary limit keyed by the caller's phone number.
    pub phone_number_limit: RateLimit,
}

impl HttpState {
    /// Admission shared by every handler: the lock down answer deliberately
    /// carries status 200 so an external health check does not relaunch the
    /// process, defeating the point of the lock down.
    pub fn gate(
        &self,
        bucket: &RateLimit,
        headers: &HeaderMap,
        addr: &SocketAddr,
    ) -> Result<(), Response> {
        if lockdown::is_effective() {
            return Err(CommandError::EmergencyLockDown.to_string().into_response());
        }
        let client_ip = get_real_client_ip(headers, addr);
        if !bucket.add(&client_ip, true) {
            return Err(axum::http::StatusCode::TOO_MANY_REQUESTS.into_response());
        }
        Ok(())
    }
}

/// The client address, preferring proxy-provided headers over the socket
/// peer.
pub(crate) fn get_real_client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    for header in ["x-real-ip", "x-forwarded-for"] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    addr.ip().to_string()
}

/// Generic HTTP daemon.
pub struct Daemon {
    pub address: String,
    pub port: u16,

    router: Router,
    stop: Arc<Notify>,
    stopping: AtomicBool,
}

impl Daemon {
    pub fn new(
        config: &HttpDaemonConfig,
        processor: Arc<CommandProcessor>,
        mail_client: MailClient,
    ) -> anyhow::Result<Self> {
        if config.address.is_empty() {
            bail!("httpd: listen address must not be empty");
        }
        if config.port == 0 {
            bail!("httpd: listen port must be greater than 0");
        }
        if config.base_rate_limit < 1 {
            bail!("httpd: BaseRateLimit must be greater than 0");
        }
        // This daemon faces the Internet; refuse an insane processor.
        let findings = processor.is_sane_for_internet();
        if !findings.is_empty() {
            bail!("httpd: processor configuration is insane: {findings:?}");
        }

        let base = config.base_rate_limit;
        let mut serve_directories = HashMap::new();
        for (url_prefix, dir_path) in &config.serve_directories {
            if url_prefix.is_empty() || dir_path.is_empty() {
                continue;
            }
            let mut prefix = url_prefix.clone();
            if !prefix.starts_with('/') {
                prefix.insert(0, '/');
            }
            let prefix = prefix.trim_end_matches('/').to_string();
            if prefix.is_empty() {
                continue;
            }
            serve_directories.insert(prefix, dir_path.clone());
        }
        let state = Arc::new(HttpState {
            processor,
            mail_client,
            mail_me_recipients: config.mail_me_recipients.clone(),
            twilio_call_greeting: config.twilio_call_greeting.clone(),
            serve_directories: serve_directories.clone(),
            cmd_form_limit: RateLimit::new(RATE_LIMIT_INTERVAL_SEC, base)
                .context("httpd: bad rate limit")?,
            twilio_limit: RateLimit::new(RATE_LIMIT_INTERVAL_SEC, base)
                .context("httpd: bad rate limit")?,
            mail_me_limit: RateLimit::new(RATE_LIMIT_INTERVAL_SEC, base)
                .context("httpd: bad rate limit")?,
            directory_limit: RateLimit::new(
                RATE_LIMIT_INTERVAL_SEC,
                DIRECTORY_HANDLER_RATE_LIMIT_FACTOR * base,
            )
            .context("httpd: bad rate limit")?,
            phone_number_limit: RateLimit::new(TWILIO_PHONE_NUMBER_RATE_LIMIT_INTERVAL_SEC, 1)
                .context("httpd: bad rate limit")?,
        });

        let mut router = Router::new()
            .route(
                "/cmd_form",
                get(handlers::cmd_form_page).post(handlers::cmd_form_execute),
            )
            .route("/sms_hook", axum::routing::post(handlers::twilio_sms_hook))
            .route(
                "/call_greeting",
                get(handlers::twilio_call_greeting).post(handlers::twilio_call_greeting),
            )
            .route(
                "/mail_me",
                get(handlers::mail_me_page).post(handlers::mail_me_submit),
            );
        for prefix in serve_directories.keys() {
            router = router
                .route(prefix, get(handlers::serve_directory))
                .route(&format!("{prefix}/*path"), get(handlers::serve_directory));
        }
        let router = router.with_state(state);

        Ok(Self {
            address: config.address.clone(),
            port: config.port,
            router,
            stop: Arc::new(Notify::new()),
            stopping: AtomicBool::new(false),
        })
    }

    pub async fn start_and_block(self: &Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.address.as_str(), self.port))
            .await
            .with_context(|| format!("httpd: failed to listen on {}:{}", self.address, self.port))?;
        tracing::info!(address = %self.address, port = self.port, "httpd: going to listen for HTTP connections");
        let stop = self.stop.clone();
        let server = axum::serve(
            listener,
            self.router
                .clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { stop.notified().await });
        if self.is_stopping() {
            return Ok(());
        }
        // The graceful drain is bounded; lingering connections do not hold
        // the daemon open forever.
        tokio::select! {
            served = server => served.context("httpd: server failed"),
            _ = async {
                self.stop.notified().await;
                sleep(Duration::from_secs(IO_TIMEOUT_SEC + 2)).await;
            } => Ok(()),
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

    #[test]
    fn real_client_ip_prefers_proxy_headers() {
        let addr: SocketAddr = "192.0.2.1:1234".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(get_real_client_ip(&headers, &addr), "192.0.2.1");

        headers.insert("x-forwarded-for", "198.51.100.7, 10.0.0.1".parse().unwrap());
        assert_eq!(get_real_client_ip(&headers, &addr), "198.51.100.7");

        headers.insert("x-real-ip", "203.0.113.9".parse().unwrap());
        assert_eq!(get_real_client_ip(&headers, &addr), "203.0.113.9");
    }

    fn test_config() -> HttpDaemonConfig {
        HttpDaemonConfig {
            address: "127.0.0.1".to_string(),
            port: 23486,
            base_rate_limit: 10,
            serve_directories: HashMap::new(),
            twilio_call_greeting: "Hi there".to_string(),
            mail_me_recipients: Vec::new(),
        }
    }

    #[test]
    fn refuses_insane_processor() {
        use st_core::testsupport::{get_empty_command_processor, get_test_command_processor};
        let sane = Arc::new(get_test_command_processor());
        assert!(Daemon::new(&test_config(), sane, MailClient::default()).is_ok());

        // An empty processor is sane (huge random PIN), a filterless one is
        // not.
        let empty = Arc::new(get_empty_command_processor());
        assert!(Daemon::new(&test_config(), empty, MailClient::default()).is_ok());

        let insane = Arc::new(CommandProcessor::default());
        assert!(Daemon::new(&test_config(), insane, MailClient::default()).is_err());
    }
}
