//! TCP listener supervisor, optionally TLS wrapped

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::capture::{capture_stream, CaptureEnd, CaptureOutcome};
use super::{CaptureContext, ListenerSpec};
use crate::privileges::PrivilegeGate;
use crate::record::{Protocol, Record};

pub struct TcpSupervisor {
    spec: ListenerSpec,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

impl TcpSupervisor {
    /// Bind while still privileged; nothing is accepted until [`serve`](Self::serve)
    pub async fn bind(
        spec: ListenerSpec,
        acceptor: Option<TlsAcceptor>,
        ctx: &CaptureContext,
    ) -> Result<Self> {
        let addr = format!("{}:{}", ctx.bind_host, spec.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Cannot bind to {}", addr))?;

        info!(
            "TCP listener bound on port {}{}",
            spec.port,
            if acceptor.is_some() { " (tls)" } else { "" }
        );
        Ok(Self {
            spec,
            listener,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self, mut gate: PrivilegeGate, ctx: Arc<CaptureContext>) -> Result<()> {
        gate.dropped().await?;
        let port = self.spec.port;
        debug!("TCP:{} serving on {}", port, self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let acceptor = self.acceptor.clone();
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        handle_connection(socket, peer_addr, port, acceptor, ctx).await;
                    });
                }
                Err(e) => {
                    // e.g. EMFILE: give in-flight connections time to finish
                    warn!("Accept error on port {}: {}", port, e);
                    tokio::time::sleep(super::ERROR_BACKOFF).await;
                }
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    port: u16,
    acceptor: Option<TlsAcceptor>,
    ctx: Arc<CaptureContext>,
) {
    let started = Utc::now();
    let record = Record::new(Protocol::Tcp, peer_addr, port, &ctx.host_identity)
        .with_time(started)
        .with_tls(acceptor.is_some());

    let outcome = match acceptor {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(mut stream) => Some(capture_and_close(&mut stream, port, started, &ctx).await),
            Err(e) => {
                debug!("TLS handshake from {} on port {} failed: {}", peer_addr, port, e);
                None
            }
        },
        None => {
            let mut socket = socket;
            Some(capture_and_close(&mut socket, port, started, &ctx).await)
        }
    };

    let record = match outcome {
        Some(outcome) => {
            debug!(
                "Captured {} bytes from {} on port {} ({:?})",
                outcome.bytes, peer_addr, port, outcome.end
            );
            record.with_payload(outcome.payload, outcome.is_binary)
        }
        None => record,
    };

    if ctx.records.send(record).await.is_err() {
        warn!("Recorder stopped, dropping record from {} on port {}", peer_addr, port);
    }
}

async fn capture_and_close<S>(
    stream: &mut S,
    port: u16,
    started: DateTime<Utc>,
    ctx: &CaptureContext,
) -> CaptureOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = capture_stream(stream, port, started, &ctx.limits, &ctx.spill_dir).await;
    if outcome.end == CaptureEnd::CapReached {
        info!("Max buffer reached on port {}, closing connection", port);
        let _ = stream.shutdown().await;
    }
    outcome
}
