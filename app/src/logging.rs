//! Logging pipeline: level and format come from the environment.

use anyhow::Context;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialise the global tracing subscriber. `STEWARD_LOG_LEVEL` carries an
/// env-filter directive (default "info"); `STEWARD_LOG_FORMAT` selects
/// "compact" (default) or "json" output.
pub fn init() -> anyhow::Result<()> {
    let level = std::env::var("STEWARD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::try_new(&level)
        .with_context(|| format!("bad STEWARD_LOG_LEVEL directive {level:?}"))?;
    let format = std::env::var("STEWARD_LOG_FORMAT").unwrap_or_default();
    match format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_target(true))
                .try_init()
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_target(true))
                .try_init()
        }
    }
    .map_err(|err| anyhow::anyhow!("logging already initialised: {err}"))?;
    Ok(())
}
