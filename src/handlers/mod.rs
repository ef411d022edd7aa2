//! Listener supervisors and capture handlers

pub mod capture;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use capture::CaptureLimits;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::privileges::PrivilegeGate;
use crate::readiness::{Component, ReadySender};
use crate::record::Protocol;
use crate::recorder::RecordSender;

/// Pause after a failed accept or receive before trying again
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// One configured listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSpec {
    pub protocol: Protocol,
    pub port: u16,
    pub tls: bool,
}

impl ListenerSpec {
    pub fn component(&self) -> Component {
        match self.protocol {
            Protocol::Tcp => Component::Tcp(self.port),
            Protocol::Udp => Component::Udp(self.port),
        }
    }
}

/// Shared by every listener and capture handler
pub struct CaptureContext {
    pub bind_host: String,
    pub host_identity: String,
    pub limits: CaptureLimits,
    pub spill_dir: PathBuf,
    pub records: RecordSender,
}

impl CaptureContext {
    pub fn from_config(config: &Config, host_identity: String, records: RecordSender) -> Self {
        Self {
            bind_host: config.server.host.clone(),
            host_identity,
            limits: config.capture_limits(),
            spill_dir: config.capture.large_dir.clone(),
            records,
        }
    }
}

/// Load TLS material once, only if some listener asks for it
fn tls_acceptor(config: &Config, listeners: &[ListenerSpec]) -> Option<TlsAcceptor> {
    if !listeners.iter().any(|spec| spec.tls) {
        return None;
    }
    match tls::load_acceptor(
        Path::new(&config.server.tls_cert),
        Path::new(&config.server.tls_key),
    ) {
        Ok(acceptor) => Some(acceptor),
        Err(e) => {
            error!("TLS listeners disabled: {:#}", e);
            None
        }
    }
}

/// Spawn one supervisor per configured listener. Each reports to the barrier
/// once bound (or failed) and serves only after the privilege drop.
pub fn start_all(
    config: &Config,
    ctx: Arc<CaptureContext>,
    ready: &ReadySender,
    gate: PrivilegeGate,
) {
    let listeners = config.listeners();
    let acceptor = tls_acceptor(config, &listeners);

    for spec in &listeners {
        let spec = *spec;
        let handle = ready.handle(spec.component());
        let ctx = ctx.clone();
        let gate = gate.clone();

        match spec.protocol {
            Protocol::Tcp => {
                let acceptor = if spec.tls {
                    match acceptor.clone() {
                        Some(acceptor) => Some(acceptor),
                        None => {
                            handle.failed("TLS material unavailable");
                            continue;
                        }
                    }
                } else {
                    None
                };

                tokio::spawn(async move {
                    let listener = match tcp::TcpSupervisor::bind(spec, acceptor, &ctx).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            warn!("Cannot start TCP listener on port {}: {:#}", spec.port, e);
                            handle.failed(format!("{:#}", e));
                            return;
                        }
                    };
                    handle.ready();
                    if let Err(e) = listener.serve(gate, ctx).await {
                        warn!("TCP listener on port {} stopped: {:#}", spec.port, e);
                    }
                });
            }
            Protocol::Udp => {
                tokio::spawn(async move {
                    let listener = match udp::UdpSupervisor::bind(spec.port, &ctx).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            warn!("Cannot start UDP listener on port {}: {:#}", spec.port, e);
                            handle.failed(format!("{:#}", e));
                            return;
                        }
                    };
                    handle.ready();
                    if let Err(e) = listener.serve(gate, ctx).await {
                        warn!("UDP listener on port {} stopped: {:#}", spec.port, e);
                    }
                });
            }
        }
    }

    info!("Starting {} listeners", listeners.len());
}
