//! Supervised HTTP server demonstrating zero-downtime upgrades.
//!
//! Run the binary to start the parent watchdog; it spawns a worker child
//! serving `GET /pid` on the `web` listener. `kill -USR2 $(cat daemonPID)`
//! (or re-running with `--upgrade`) swaps in a fresh worker without the
//! listening socket ever closing; the pid in the response changes.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Router};
use molt::Supervisor;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const WEB_LISTENER: &str = "web";
const DEFAULT_PORT: u16 = 10080;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn web_port() -> u16 {
    std::env::var("MOLT_DEMO_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

async fn pid() -> String {
    format!("pid:{}\n", std::process::id())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let ports = HashMap::from([(WEB_LISTENER.to_string(), web_port())]);

    let supervisor = Supervisor::default();
    supervisor
        .bootstrap(ports, |tcp_fds, ready, exit| async move {
            // Simulate slow startup work before the listener is taken over.
            tokio::time::sleep(Duration::from_secs(1)).await;

            let Some(&fd) = tcp_fds.get(WEB_LISTENER) else {
                error!("no inherited fd for the web listener");
                let _ = ready.send(false);
                return;
            };
            let listener = match molt::listener::adopt(fd) {
                Ok(listener) => listener,
                Err(err) => {
                    error!(%err, fd, "could not adopt inherited listener");
                    let _ = ready.send(false);
                    return;
                }
            };

            let app = Router::new().route("/pid", get(pid));

            let _ = ready.send(true);
            info!(pid = std::process::id(), "serving /pid");

            let server = axum::serve(listener, app)
                .with_graceful_shutdown(exit.cancelled_owned());
            if let Err(err) = server.await {
                error!(%err, "http server failed");
            }
            info!("worker drained");
        })
        .await?;

    Ok(())
}
