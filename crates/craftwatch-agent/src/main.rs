//! craftwatch: hibernates idle Crafty-managed Minecraft servers and wakes
//! them when a player knocks on the port.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::prelude::*;

mod bedrock_listener;
mod config;
mod controller;
mod events;
mod http_api;
mod java_listener;
mod machine;
mod metrics;
mod monitor;
mod webhook;

use controller::CraftyClient;
use events::MonitorEvent;
use metrics::Metrics;
use monitor::{Monitor, StatusSnapshot};

const DEFAULT_CONFIG_PATH: &str = "/etc/craftwatch/config.yaml";

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CRAFTWATCH_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
        .into()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config_path();
    let cfg = config::load(&config_path)?;

    // Stdout for docker/journald, a daily-rolled file for everything else.
    std::fs::create_dir_all(&cfg.logging.directory)
        .with_context(|| format!("create log directory {}", cfg.logging.directory))?;
    let file_appender = tracing_appender::rolling::daily(&cfg.logging.directory, "craftwatch.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    let _file_guard = file_guard;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        servers = cfg.servers.len(),
        "craftwatch starting"
    );

    let token = config::api_token()?;
    let client = CraftyClient::new(&cfg.controller, &token)?;

    startup_probe(&client, &cfg).await?;

    let metrics = Arc::new(Metrics::new());
    let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
    let (events_tx, events_rx) = mpsc::channel::<MonitorEvent>(64);

    let api_listener = tokio::net::TcpListener::bind(cfg.health.listen_addr())
        .await
        .with_context(|| format!("bind health endpoint on {}", cfg.health.listen_addr()))?;
    tokio::spawn({
        let state = http_api::ApiState {
            status: status_rx,
            metrics: metrics.clone(),
        };
        async move {
            if let Err(err) = http_api::serve(api_listener, state).await {
                tracing::error!(error = %err, "health endpoint stopped");
            }
        }
    });

    spawn_signal_bridge(events_tx.clone());

    let webhook = webhook::WebhookNotifier::new(&cfg.webhook).map(Arc::new);
    if webhook.is_some() {
        tracing::info!("webhook notifications enabled");
    }

    let monitor = Monitor::new(
        cfg,
        config_path,
        client,
        token,
        events_tx,
        status_tx,
        metrics,
        webhook,
    );
    monitor.run(events_rx).await?;

    tracing::info!("shutdown complete");
    Ok(())
}

/// One-shot boot checks: controller liveness and configured server ids.
/// Only a bad token is fatal; an unreachable controller is the monitor's
/// normal retry territory.
async fn startup_probe(client: &CraftyClient, cfg: &config::Config) -> anyhow::Result<()> {
    match client.check().await {
        Ok(true) => tracing::info!(url = %cfg.controller.base_url, "controller reachable"),
        Ok(false) => tracing::warn!("controller answered but did not report ok"),
        Err(err) if err.is_fatal() => {
            return Err(anyhow::Error::from(err).context("controller rejected the API token"));
        }
        Err(err) => {
            tracing::warn!(error = %err, "controller unreachable; polling will keep trying")
        }
    }

    match client.list_server_ids().await {
        Ok(known) => {
            for (name, server) in &cfg.servers {
                if !known.contains(&server.crafty_server_id) {
                    tracing::error!(
                        server = %name,
                        id = %server.crafty_server_id,
                        "configured server id is unknown to the controller"
                    );
                }
            }
        }
        Err(err) if err.is_fatal() => {
            return Err(anyhow::Error::from(err).context("controller rejected the API token"));
        }
        Err(err) => tracing::warn!(error = %err, "could not validate configured server ids"),
    }

    Ok(())
}

#[cfg(unix)]
fn spawn_signal_bridge(tx: mpsc::Sender<MonitorEvent>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let (mut hup, mut term, mut int) = match (
            signal(SignalKind::hangup()),
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(h), Ok(t), Ok(i)) => (h, t, i),
            _ => {
                tracing::error!("failed to install signal handlers");
                return;
            }
        };

        loop {
            let event = tokio::select! {
                _ = hup.recv() => MonitorEvent::Reload,
                _ = term.recv() => MonitorEvent::Shutdown,
                _ = int.recv() => MonitorEvent::Shutdown,
            };
            let stop = event == MonitorEvent::Shutdown;
            tracing::info!(?event, "signal received");
            if tx.send(event).await.is_err() || stop {
                return;
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_bridge(tx: mpsc::Sender<MonitorEvent>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received");
            let _ = tx.send(MonitorEvent::Shutdown).await;
        }
    });
}
