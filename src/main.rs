//! HoneyPoke - a low-interaction network honeypot
//!
//! Listens on the configured TCP/UDP ports and records whatever peers send,
//! while a packet watcher counts probes against every other port:
//! - Raw input capture with disk spillover for large payloads
//! - Missed port hit counts in a fixed-width counter file
//! - Privileges dropped only after every socket and the capture are open

mod config;
mod geoip;
mod handlers;
mod privileges;
mod readiness;
mod record;
mod recorder;
mod watcher;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::handlers::CaptureContext;
use crate::privileges::PrivilegeGuard;
use crate::readiness::{Component, ReadinessBarrier};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting HoneyPoke...");

    let config = Arc::new(config::Config::load()?);
    info!("Configuration loaded");

    // Initialize GeoIP
    let geoip = Arc::new(geoip::GeoIp::new(&config.geoip.database));
    if geoip.is_available() {
        info!("GeoIP enabled");
    } else {
        info!("GeoIP disabled (database not found)");
    }

    let sinks = recorder::build_all(&config.recorders).await;
    if sinks.is_empty() {
        anyhow::bail!("No recorders configured");
    }
    let owned_paths: Vec<_> = sinks.iter().flat_map(|sink| sink.owned_paths()).collect();
    let records = recorder::start(sinks, geoip);

    std::fs::create_dir_all(&config.capture.large_dir).with_context(|| {
        format!("Could not create {}", config.capture.large_dir.display())
    })?;

    let host_identity = if config.server.hostname.is_empty() {
        nix::unistd::gethostname()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        config.server.hostname.clone()
    };

    let (mut guard, gate) =
        PrivilegeGuard::new(&config.privileges.user, &config.privileges.group);
    guard.hand_over([config.capture.large_dir.clone()]);
    guard.hand_over(owned_paths);
    let listener_count = config.listeners().len();
    let (barrier, ready) = ReadinessBarrier::new(listener_count + 1);

    let ctx = Arc::new(CaptureContext::from_config(&config, host_identity, records));
    handlers::start_all(&config, ctx, &ready, gate.clone());

    let watcher_ready = ready.handle(Component::Watcher);
    let watcher_config = config.clone();
    tokio::spawn(async move {
        if let Err(e) = watcher::start(&watcher_config, watcher_ready, gate).await {
            debug!("Missed port watcher exited: {:#}", e);
        }
    });
    drop(ready);

    // Wait for everybody to report they are running
    let readiness = barrier.wait().await;
    info!(
        "{} listeners and the watcher have reported ({} ready, {} failed)",
        listener_count,
        readiness.ready.len(),
        readiness.failed.len()
    );
    if readiness.healthy() == 0 {
        anyhow::bail!("No listener or watcher came up");
    }
    if readiness.failed.iter().any(|(component, _)| *component == Component::Watcher) {
        warn!("Running without missed port visibility");
    }

    guard
        .drop_privileges()
        .context("Refusing to serve while privileged")?;
    info!("HoneyPoke running");

    shutdown_signal().await;
    info!("Shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
