//! Which frames count as missed port probes

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use super::decode::Probe;
use crate::record::Protocol;

/// Excludes the ports owned by listeners (either direction, like a BPF
/// `port` primitive) and anything sent from the capture interface itself.
#[derive(Debug, Clone, Default)]
pub struct CaptureFilter {
    tcp_ports: BTreeSet<u16>,
    udp_ports: BTreeSet<u16>,
    local_addrs: Vec<IpAddr>,
}

impl CaptureFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_port(mut self, protocol: Protocol, port: u16) -> Self {
        match protocol {
            Protocol::Tcp => self.tcp_ports.insert(port),
            Protocol::Udp => self.udp_ports.insert(port),
        };
        self
    }

    pub fn exclude_source(mut self, addr: IpAddr) -> Self {
        if !self.local_addrs.contains(&addr) {
            self.local_addrs.push(addr);
        }
        self
    }

    pub fn admits(&self, probe: &Probe) -> bool {
        if self.local_addrs.contains(&probe.source) {
            return false;
        }
        let owned = match probe.protocol {
            Protocol::Tcp => &self.tcp_ports,
            Protocol::Udp => &self.udp_ports,
        };
        !owned.contains(&probe.source_port) && !owned.contains(&probe.destination_port)
    }
}

/// Renders the equivalent BPF expression
impl fmt::Display for CaptureFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clauses = self
            .tcp_ports
            .iter()
            .map(|port| format!("not tcp port {}", port))
            .chain(self.udp_ports.iter().map(|port| format!("not udp port {}", port)))
            .chain(self.local_addrs.iter().map(|addr| format!("not src host {}", addr)))
            .collect::<Vec<_>>();
        f.write_str(&clauses.join(" and "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(protocol: Protocol, source: &str, source_port: u16, destination_port: u16) -> Probe {
        Probe {
            protocol,
            source: source.parse().unwrap(),
            source_port,
            destination_port,
        }
    }

    fn filter() -> CaptureFilter {
        CaptureFilter::new()
            .exclude_port(Protocol::Tcp, 22)
            .exclude_port(Protocol::Tcp, 80)
            .exclude_port(Protocol::Udp, 53)
            .exclude_source("10.0.0.5".parse().unwrap())
    }

    #[test]
    fn test_owned_ports_are_excluded_per_protocol() {
        let filter = filter();

        assert!(!filter.admits(&probe(Protocol::Tcp, "198.51.100.1", 40000, 22)));
        assert!(!filter.admits(&probe(Protocol::Udp, "198.51.100.1", 40000, 53)));
        assert!(filter.admits(&probe(Protocol::Udp, "198.51.100.1", 40000, 22)));
        assert!(filter.admits(&probe(Protocol::Tcp, "198.51.100.1", 40000, 53)));
        assert!(filter.admits(&probe(Protocol::Tcp, "198.51.100.1", 40000, 23)));
    }

    #[test]
    fn test_port_match_applies_to_either_direction() {
        assert!(!filter().admits(&probe(Protocol::Tcp, "198.51.100.1", 80, 51515)));
    }

    #[test]
    fn test_own_traffic_is_excluded() {
        assert!(!filter().admits(&probe(Protocol::Tcp, "10.0.0.5", 40000, 8443)));
    }

    #[test]
    fn test_renders_bpf_expression() {
        assert_eq!(
            filter().to_string(),
            "not tcp port 22 and not tcp port 80 and not udp port 53 and not src host 10.0.0.5"
        );
        assert_eq!(CaptureFilter::new().to_string(), "");
    }
}
