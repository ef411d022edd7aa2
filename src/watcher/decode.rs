//! Link, network and transport header decoding

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet};
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use std::net::IpAddr;
use thiserror::Error;

use crate::record::Protocol;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short for {0} header")]
    Truncated(&'static str),
}

/// Addressing of one TCP segment or UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub protocol: Protocol,
    pub source: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
}

/// Decode an Ethernet frame. `Ok(None)` for anything that is not TCP/UDP over IP.
pub fn decode_frame(frame: &[u8]) -> Result<Option<Probe>, DecodeError> {
    let ethernet = EthernetPacket::new(frame).ok_or(DecodeError::Truncated("ethernet"))?;

    match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ip = Ipv4Packet::new(ethernet.payload()).ok_or(DecodeError::Truncated("ipv4"))?;
            // Only an unfragmented datagram starts with a transport header we can trust
            if ip.get_fragment_offset() != 0 || ip.get_flags() & Ipv4Flags::MoreFragments != 0 {
                return Ok(None);
            }
            decode_transport(
                IpAddr::V4(ip.get_source()),
                ip.get_next_level_protocol(),
                ip.payload(),
            )
        }
        EtherTypes::Ipv6 => {
            let ip = Ipv6Packet::new(ethernet.payload()).ok_or(DecodeError::Truncated("ipv6"))?;
            decode_transport(IpAddr::V6(ip.get_source()), ip.get_next_header(), ip.payload())
        }
        _ => Ok(None),
    }
}

fn decode_transport(
    source: IpAddr,
    next: IpNextHeaderProtocol,
    payload: &[u8],
) -> Result<Option<Probe>, DecodeError> {
    match next {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(payload).ok_or(DecodeError::Truncated("tcp"))?;
            Ok(Some(Probe {
                protocol: Protocol::Tcp,
                source,
                source_port: tcp.get_source(),
                destination_port: tcp.get_destination(),
            }))
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(payload).ok_or(DecodeError::Truncated("udp"))?;
            Ok(Some(Probe {
                protocol: Protocol::Udp,
                source,
                source_port: udp.get_source(),
                destination_port: udp.get_destination(),
            }))
        }
        _ => Ok(None),
    }
}

/// Hand-built frames for tests
#[cfg(test)]
pub(crate) mod frames {
    const IPV4: [u8; 2] = [0x08, 0x00];
    const IPV6: [u8; 2] = [0x86, 0xdd];

    fn ethernet(ethertype: [u8; 2]) -> Vec<u8> {
        let mut frame = vec![0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0x02];
        frame.extend_from_slice(&ethertype);
        frame
    }

    fn transport(protocol: u8, source_port: u16, destination_port: u16) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(&source_port.to_be_bytes());
        header.extend_from_slice(&destination_port.to_be_bytes());
        if protocol == 6 {
            header.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x02, 0xff, 0xff, 0, 0, 0, 0]);
        } else {
            header.extend_from_slice(&[0, 8, 0, 0]);
        }
        header
    }

    pub fn ipv4(protocol: u8, source: [u8; 4], source_port: u16, destination_port: u16) -> Vec<u8> {
        let segment = transport(protocol, source_port, destination_port);
        let total = (20 + segment.len()) as u16;

        let mut frame = ethernet(IPV4);
        frame.extend_from_slice(&[0x45, 0]);
        frame.extend_from_slice(&total.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0x40, 0, 64, protocol, 0, 0]);
        frame.extend_from_slice(&source);
        frame.extend_from_slice(&[192, 0, 2, 1]);
        frame.extend_from_slice(&segment);
        frame
    }

    pub fn ipv6(protocol: u8, source: [u8; 16], source_port: u16, destination_port: u16) -> Vec<u8> {
        let segment = transport(protocol, source_port, destination_port);

        let mut frame = ethernet(IPV6);
        frame.extend_from_slice(&[0x60, 0, 0, 0]);
        frame.extend_from_slice(&(segment.len() as u16).to_be_bytes());
        frame.extend_from_slice(&[protocol, 64]);
        frame.extend_from_slice(&source);
        frame.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        frame.extend_from_slice(&segment);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_ipv4_tcp() {
        let frame = frames::ipv4(6, [203, 0, 113, 9], 51000, 3389);
        let probe = decode_frame(&frame).unwrap().unwrap();

        assert_eq!(probe.protocol, Protocol::Tcp);
        assert_eq!(probe.source, "203.0.113.9".parse::<IpAddr>().unwrap());
        assert_eq!(probe.source_port, 51000);
        assert_eq!(probe.destination_port, 3389);
    }

    #[test]
    fn test_decodes_ipv6_udp() {
        let mut source = [0u8; 16];
        source[0] = 0x20;
        source[1] = 0x01;
        source[15] = 0x42;
        let frame = frames::ipv6(17, source, 5000, 161);
        let probe = decode_frame(&frame).unwrap().unwrap();

        assert_eq!(probe.protocol, Protocol::Udp);
        assert_eq!(probe.source, "2001::42".parse::<IpAddr>().unwrap());
        assert_eq!(probe.destination_port, 161);
    }

    #[test]
    fn test_non_transport_traffic_is_ignored() {
        // ICMP over IPv4
        let frame = frames::ipv4(1, [203, 0, 113, 9], 0, 0);
        assert_eq!(decode_frame(&frame), Ok(None));

        // ARP
        let mut arp = frames::ipv4(6, [203, 0, 113, 9], 1, 2);
        arp[12] = 0x08;
        arp[13] = 0x06;
        assert_eq!(decode_frame(&arp), Ok(None));
    }

    #[test]
    fn test_ipv4_fragments_are_not_decoded() {
        // Bytes 20..22 of the frame hold flags and fragment offset
        let mut later = frames::ipv4(6, [203, 0, 113, 9], 1234, 31337);
        later[20..22].copy_from_slice(&185u16.to_be_bytes());
        assert_eq!(decode_frame(&later), Ok(None));

        let mut first = frames::ipv4(17, [203, 0, 113, 9], 1234, 161);
        first[20] = 0x20;
        first[21] = 0;
        assert_eq!(decode_frame(&first), Ok(None));

        let whole = frames::ipv4(6, [203, 0, 113, 9], 1234, 31337);
        assert_eq!(decode_frame(&whole).unwrap().unwrap().destination_port, 31337);
    }

    #[test]
    fn test_truncated_frames_are_errors() {
        assert_eq!(decode_frame(&[0u8; 6]), Err(DecodeError::Truncated("ethernet")));

        let frame = frames::ipv4(6, [203, 0, 113, 9], 51000, 3389);
        assert_eq!(decode_frame(&frame[..20]), Err(DecodeError::Truncated("ipv4")));
        assert_eq!(decode_frame(&frame[..40]), Err(DecodeError::Truncated("tcp")));
    }
}
