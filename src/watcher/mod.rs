//! Missed port watcher
//!
//! Captures every frame on the configured interface with pnet's datalink
//! channel (requires CAP_NET_RAW or root) and counts TCP/UDP probes against
//! ports that have no listener. Listener ports and the interface's own
//! traffic are filtered out, so bound ports are covered by the listeners and
//! everything else by the counter file.

pub mod decode;
pub mod filter;
pub mod store;

pub use decode::{decode_frame, DecodeError};
pub use filter::CaptureFilter;
#[cfg(test)]
pub use store::PortCounts;
pub use store::{MissedPortStore, StoreError};

use anyhow::{Context, Result};
use pnet::datalink::{self, Channel, DataLinkReceiver, NetworkInterface};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::privileges::PrivilegeGate;
use crate::readiness::ReadyHandle;
use crate::record::Protocol;

/// Result of looking at one frame
#[derive(Debug, PartialEq, Eq)]
pub enum Observation {
    Counted { protocol: Protocol, port: u16, count: u32 },
    Filtered,
    Ignored,
    Malformed(DecodeError),
}

/// Sole owner of the counter store
pub struct PortWatcher {
    filter: CaptureFilter,
    store: MissedPortStore,
}

impl PortWatcher {
    pub fn new(filter: CaptureFilter, store: MissedPortStore) -> Self {
        Self { filter, store }
    }

    /// Decode one frame and count it. Only a store failure is an error.
    pub fn observe(&mut self, frame: &[u8]) -> Result<Observation, StoreError> {
        let probe = match decode_frame(frame) {
            Ok(Some(probe)) => probe,
            Ok(None) => return Ok(Observation::Ignored),
            Err(e) => return Ok(Observation::Malformed(e)),
        };

        if !self.filter.admits(&probe) {
            return Ok(Observation::Filtered);
        }
        if probe.destination_port == 0 {
            return Ok(Observation::Ignored);
        }

        let count = self.store.increment(probe.protocol, probe.destination_port)?;
        Ok(Observation::Counted {
            protocol: probe.protocol,
            port: probe.destination_port,
            count,
        })
    }

    #[cfg(test)]
    pub fn counts(&mut self, port: u16) -> Result<PortCounts, StoreError> {
        self.store.counts(port)
    }
}

/// Filter for everything this process does not already listen on
pub fn build_filter(config: &Config, interface: &NetworkInterface) -> CaptureFilter {
    let mut filter = CaptureFilter::new();
    for port in &config.ports.ignore_tcp {
        filter = filter.exclude_port(Protocol::Tcp, *port);
    }
    for spec in config.listeners() {
        filter = filter.exclude_port(spec.protocol, spec.port);
    }
    for network in &interface.ips {
        filter = filter.exclude_source(network.ip());
    }
    filter
}

fn find_interface(name: &str) -> Result<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| anyhow::anyhow!("Could not get interface {}", name))
}

/// Pause after a failed read so a downed interface does not spin the loop
const CAPTURE_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// Everything opened during privileged setup
struct Capture {
    interface: NetworkInterface,
    filter: CaptureFilter,
    store: MissedPortStore,
    rx: Box<dyn DataLinkReceiver>,
}

/// Blocking: may write the whole counter table and opens a raw socket
fn open_capture(config: &Config) -> Result<Capture> {
    let interface = find_interface(&config.watcher.interface)?;
    let filter = build_filter(config, &interface);
    let store = MissedPortStore::open(&config.watcher.missed_file).with_context(|| {
        format!("Could not open missed file {}", config.watcher.missed_file.display())
    })?;

    let channel_config = datalink::Config {
        read_timeout: Some(Duration::from_secs(1)),
        promiscuous: true,
        ..Default::default()
    };
    let rx = match datalink::channel(&interface, channel_config)
        .with_context(|| format!("Could not open interface {} for listening", interface.name))?
    {
        Channel::Ethernet(_tx, rx) => rx,
        _ => anyhow::bail!("Unsupported channel type for {}", interface.name),
    };

    Ok(Capture {
        interface,
        filter,
        store,
        rx,
    })
}

/// Open the capture and counter file, report readiness, then count until the
/// store breaks. Setup failures are reported to the barrier and returned.
pub async fn start(config: &Config, ready: ReadyHandle, mut gate: PrivilegeGate) -> Result<()> {
    let setup_config = config.clone();
    let setup = match tokio::task::spawn_blocking(move || open_capture(&setup_config)).await {
        Ok(result) => result,
        Err(e) => Err(e.into()),
    };

    let Capture {
        interface,
        filter,
        store,
        mut rx,
    } = match setup {
        Ok(capture) => capture,
        Err(e) => {
            error!("Missed port watcher disabled: {:#}", e);
            ready.failed(format!("{:#}", e));
            return Err(e);
        }
    };

    info!("Watcher filter: {}", filter);
    info!("Missed port watcher listening on {}", interface.name);
    ready.ready();

    gate.dropped().await?;

    let mut watcher = PortWatcher::new(filter, store);
    tokio::task::spawn_blocking(move || -> Result<()> {
        loop {
            match rx.next() {
                Ok(frame) => match watcher.observe(frame) {
                    Ok(Observation::Counted { protocol, port, count }) => {
                        trace!("Missed {} port {} (count {})", protocol, port, count);
                    }
                    Ok(Observation::Malformed(e)) => {
                        debug!("Skipping frame: {}", e);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Missed port watcher stopped: {}", e);
                        return Err(e.into());
                    }
                },
                // Timeout is expected, only warn on real errors
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("Capture error on {}: {}", interface.name, e);
                    std::thread::sleep(CAPTURE_ERROR_BACKOFF);
                }
            }
        }
    })
    .await?
}
