//! UDP listener supervisor: every datagram is its own capture unit

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::CaptureContext;
use crate::privileges::PrivilegeGate;
use crate::record::{Protocol, Record};

/// Largest datagram payload kept; the rest of a bigger datagram is discarded
pub const MAX_DATAGRAM: usize = 2048;

pub struct UdpSupervisor {
    port: u16,
    socket: UdpSocket,
}

impl UdpSupervisor {
    pub async fn bind(port: u16, ctx: &CaptureContext) -> Result<Self> {
        let addr = format!("{}:{}", ctx.bind_host, port);
        let socket = UdpSocket::bind(&addr)
            .await
            .with_context(|| format!("Cannot bind to {}", addr))?;

        info!("UDP listener bound on port {}", port);
        Ok(Self { port, socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn serve(self, mut gate: PrivilegeGate, ctx: Arc<CaptureContext>) -> Result<()> {
        gate.dropped().await?;
        debug!("UDP:{} serving on {}", self.port, self.local_addr()?);

        let mut buffer = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((n, peer_addr)) => {
                    let Some(record) = capture_datagram(&buffer[..n], peer_addr, self.port, &ctx)
                    else {
                        continue;
                    };
                    if ctx.records.send(record).await.is_err() {
                        warn!("Recorder stopped, dropping datagram from {}", peer_addr);
                    }
                }
                Err(e) => {
                    warn!("Error getting packet on port {}: {}", self.port, e);
                    tokio::time::sleep(super::ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// One record per non-empty datagram
pub fn capture_datagram(
    data: &[u8],
    peer_addr: SocketAddr,
    port: u16,
    ctx: &CaptureContext,
) -> Option<Record> {
    if data.is_empty() {
        return None;
    }
    Some(Record::new(Protocol::Udp, peer_addr, port, &ctx.host_identity).with_bytes(data))
}
