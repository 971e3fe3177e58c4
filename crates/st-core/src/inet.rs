//! Outgoing-Internet helpers: a shared HTTP client and the public IP probe.

use std::net::IpAddr;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::unix_now;

/// How long a successfully probed public IP stays cached.
pub const PUBLIC_IP_REFRESH_INTERVAL_SEC: i64 = 900;

const PROBE_TIMEOUT_SEC: u64 = 10;

/// Endpoints that answer a bare GET with the caller's address in plain text.
const PUBLIC_IP_SOURCES: [&str; 2] = ["https://checkip.amazonaws.com", "https://api.ipify.org"];

static CACHED_PUBLIC_IP: Lazy<Mutex<(String, i64)>> = Lazy::new(|| Mutex::new((String::new(), 0)));

/// A reqwest client with the given total-request timeout.
pub fn http_client(timeout_sec: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_sec))
        .build()
        .unwrap_or_default()
}

/// Determine the machine's public IP address, caching a successful answer
/// for [`PUBLIC_IP_REFRESH_INTERVAL_SEC`]. Returns an empty string when no
/// source can be reached; callers treat that as "unknown", never as fatal.
pub async fn get_public_ip() -> String {
    {
        let cached = CACHED_PUBLIC_IP.lock();
        if !cached.0.is_empty() && unix_now() - cached.1 < PUBLIC_IP_REFRESH_INTERVAL_SEC {
            return cached.0.clone();
        }
    }
    let client = http_client(PROBE_TIMEOUT_SEC);
    for source in PUBLIC_IP_SOURCES {
        let body = match client.get(source).send().await {
            Ok(resp) => match resp.text().await {
                Ok(text) => text,
                Err(_) => continue,
            },
            Err(_) => continue,
        };
        let candidate = body.trim();
        if candidate.parse::<IpAddr>().is_ok() {
            let mut cached = CACHED_PUBLIC_IP.lock();
            cached.0 = candidate.to_string();
            cached.1 = unix_now();
            return cached.0.clone();
        }
        tracing::debug!(source, "public IP source returned garbage");
    }
    tracing::warn!("unable to determine the public IP address of this computer");
    String::new()
}
