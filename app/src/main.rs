//! steward — a multi-protocol personal server. One toolbox command language
//! over raw TCP/UDP lines, HTTP and chat, an ad-blocking DNS forwarder, and
//! an encrypted relay.

mod build;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;

use st_config::Config;
use st_daemons::{chatbot, dnsd, httpd, plainsocket, sockd};

#[derive(Parser)]
#[command(name = "steward", about = "multi-protocol personal server")]
struct Args {
    /// Path to the JSON configuration document.
    #[arg(long)]
    config: PathBuf,
    /// Comma-separated daemons to start:
    /// plainsocket,dnsd,httpd,sockd,chatbot.
    #[arg(long)]
    daemons: String,
}

/// A daemon lifecycle erased down to what the supervisor needs.
struct Running {
    stop: Box<dyn Fn() + Send + Sync>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init()?;
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let selected: Vec<&str> = args
        .daemons
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect();
    if selected.is_empty() {
        bail!("no daemons selected; pass --daemons with a comma-separated list");
    }

    // Completion funnel: every daemon task reports its name and outcome.
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(&'static str, anyhow::Result<()>)>();
    let mut running: Vec<Running> = Vec::new();

    for name in &selected {
        match *name {
            "plainsocket" => {
                let section = config
                    .plain_socket_daemon
                    .as_ref()
                    .context("configuration lacks the PlainSocketDaemon section")?;
                let processor = build::processor(&config, &config.plain_socket_filters)?;
                let daemon = Arc::new(plainsocket::Daemon::new(section, processor)?);
                spawn(&mut running, &done_tx, "plainsocket", daemon.clone(), {
                    move || {
                        let daemon = daemon.clone();
                        async move { daemon.start_and_block().await }
                    }
                });
            }
            "dnsd" => {
                let section = config
                    .dns_daemon
                    .as_ref()
                    .context("configuration lacks the DNSDaemon section")?;
                let daemon = Arc::new(dnsd::Daemon::new(section)?);
                spawn(&mut running, &done_tx, "dnsd", daemon.clone(), {
                    move || {
                        let daemon = daemon.clone();
                        async move { daemon.start_and_block().await }
                    }
                });
            }
            "httpd" => {
                let section = config
                    .http_daemon
                    .as_ref()
                    .context("configuration lacks the HTTPDaemon section")?;
                let processor = build::processor(&config, &config.http_filters)?;
                let daemon = Arc::new(httpd::Daemon::new(
                    section,
                    processor,
                    build::mail_client(&config),
                )?);
                spawn(&mut running, &done_tx, "httpd", daemon.clone(), {
                    move || {
                        let daemon = daemon.clone();
                        async move { daemon.start_and_block().await }
                    }
                });
            }
            "sockd" => {
                let section = config
                    .sock_daemon
                    .as_ref()
                    .context("configuration lacks the SockDaemon section")?;
                let daemon = Arc::new(sockd::Daemon::new(section)?);
                spawn(&mut running, &done_tx, "sockd", daemon.clone(), {
                    move || {
                        let daemon = daemon.clone();
                        async move { daemon.start_and_block().await }
                    }
                });
            }
            "chatbot" => {
                let section = config
                    .chat_bot
                    .as_ref()
                    .context("configuration lacks the ChatBot section")?;
                let processor = build::processor(&config, &config.chat_bot_filters)?;
                let daemon = Arc::new(chatbot::Daemon::new(section, processor)?);
                spawn(&mut running, &done_tx, "chatbot", daemon.clone(), {
                    move || {
                        let daemon = daemon.clone();
                        async move { daemon.start_and_block().await }
                    }
                });
            }
            other => bail!("unknown daemon name {other:?}"),
        }
    }
    drop(done_tx);

    tracing::info!(daemons = ?selected, "steward is up");

    let mut remaining = running.len();
    let mut first_error: Option<anyhow::Error> = None;
    let mut interrupted = false;
    while remaining > 0 {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                tracing::info!("interrupt received, stopping daemons");
                interrupted = true;
                for daemon in &running {
                    (daemon.stop)();
                }
            }
            completed = done_rx.recv() => {
                let (name, outcome) = match completed {
                    Some(completed) => completed,
                    None => break,
                };
                remaining -= 1;
                match outcome {
                    Ok(()) => tracing::info!(daemon = name, "daemon stopped"),
                    Err(err) => {
                        tracing::error!(daemon = name, error = %format!("{err:#}"), "daemon failed");
                        if first_error.is_none() {
                            first_error = Some(err.context(name));
                        }
                        // One daemon going down takes the process with it.
                        for daemon in &running {
                            (daemon.stop)();
                        }
                    }
                }
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Spawn one daemon's serve loop and register its stop handle.
fn spawn<D, F, Fut>(
    running: &mut Vec<Running>,
    done_tx: &mpsc::UnboundedSender<(&'static str, anyhow::Result<()>)>,
    name: &'static str,
    daemon: Arc<D>,
    serve: F,
) where
    D: Stoppable + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let done_tx = done_tx.clone();
    let fut = serve();
    tokio::spawn(async move {
        let outcome = fut.await;
        let _ = done_tx.send((name, outcome));
    });
    running.push(Running {
        stop: Box::new(move || daemon.stop()),
    });
}

/// The one lifecycle capability the supervisor needs from every daemon.
trait Stoppable {
    fn stop(&self);
}

impl Stoppable for plainsocket::Daemon {
    fn stop(&self) {
        plainsocket::Daemon::stop(self)
    }
}
impl Stoppable for dnsd::Daemon {
    fn stop(&self) {
        dnsd::Daemon::stop(self)
    }
}
impl Stoppable for httpd::Daemon {
    fn stop(&self) {
        httpd::Daemon::stop(self)
    }
}
impl Stoppable for sockd::Daemon {
    fn stop(&self) {
        sockd::Daemon::stop(self)
    }
}
impl Stoppable for chatbot::Daemon {
    fn stop(&self) {
        chatbot::Daemon::stop(self)
    }
}
