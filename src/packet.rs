//! Immutable per-packet record (spec §3) and header decoding.

use std::net::IpAddr;
use std::time::SystemTime;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet as PnetPacket;
use uuid::Uuid;

/// L4 protocol tag. `Other` covers ICMP and anything not TCP/UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Other,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Other => "OTHER",
        }
    }
}

/// IP-layer fields carried alongside the record, present only when an IP
/// layer was decoded.
#[derive(Debug, Clone, Copy)]
pub struct IpHeader {
    pub total_len: u16,
    pub ttl: u8,
    pub proto: u8,
}

/// Immutable per-packet record. Created by the capture adapter, owned
/// exclusively by the worker processing it, discarded after routing
/// (spec §3).
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub id: Uuid,
    pub captured_at: SystemTime,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub protocol: Protocol,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub tcp_flags: Option<u8>,
    pub tcp_window: Option<u16>,
    pub ip: Option<IpHeader>,
}

impl PacketRecord {
    /// `bytes` is a raw link-layer (Ethernet) frame, the shape the capture
    /// adapter hands to the pipeline. Returns `None` for anything that
    /// isn't a decodable IPv4/IPv6 frame with no transport layer we
    /// understand; callers treat this the same as an empty feature map.
    pub fn parse_ethernet(bytes: &[u8]) -> Option<PacketRecord> {
        let eth = EthernetPacket::new(bytes)?;
        match eth.get_ethertype() {
            EtherTypes::Ipv4 => Self::parse_ipv4(eth.payload()),
            EtherTypes::Ipv6 => Self::parse_ipv6(eth.payload()),
            _ => None,
        }
    }

    fn parse_ipv4(bytes: &[u8]) -> Option<PacketRecord> {
        let ip = Ipv4Packet::new(bytes)?;
        let src_ip = IpAddr::V4(ip.get_source());
        let dst_ip = IpAddr::V4(ip.get_destination());
        let header = IpHeader {
            total_len: ip.get_total_length(),
            ttl: ip.get_ttl(),
            proto: ip.get_next_level_protocol().0,
        };
        Some(Self::from_transport(
            src_ip,
            dst_ip,
            ip.get_next_level_protocol().0,
            ip.payload(),
            header,
        ))
    }

    fn parse_ipv6(bytes: &[u8]) -> Option<PacketRecord> {
        let ip = Ipv6Packet::new(bytes)?;
        let src_ip = IpAddr::V6(ip.get_source());
        let dst_ip = IpAddr::V6(ip.get_destination());
        let header = IpHeader {
            total_len: ip.get_payload_length() + 40,
            ttl: ip.get_hop_limit(),
            proto: ip.get_next_header().0,
        };
        Some(Self::from_transport(
            src_ip,
            dst_ip,
            ip.get_next_header().0,
            ip.payload(),
            header,
        ))
    }

    fn from_transport(
        src_ip: IpAddr,
        dst_ip: IpAddr,
        next_proto: u8,
        payload: &[u8],
        ip: IpHeader,
    ) -> PacketRecord {
        let mut record = PacketRecord {
            id: Uuid::new_v4(),
            captured_at: SystemTime::now(),
            src_ip,
            dst_ip,
            protocol: Protocol::Other,
            src_port: None,
            dst_port: None,
            tcp_flags: None,
            tcp_window: None,
            ip: Some(ip),
        };

        if next_proto == IpNextHeaderProtocols::Tcp.0 {
            if let Some(tcp) = TcpPacket::new(payload) {
                record.protocol = Protocol::Tcp;
                record.src_port = Some(tcp.get_source());
                record.dst_port = Some(tcp.get_destination());
                record.tcp_flags = Some(tcp.get_flags());
                record.tcp_window = Some(tcp.get_window());
            }
        } else if next_proto == IpNextHeaderProtocols::Udp.0 {
            if let Some(udp) = UdpPacket::new(payload) {
                record.protocol = Protocol::Udp;
                record.src_port = Some(udp.get_source());
                record.dst_port = Some(udp.get_destination());
            }
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_bytes_yield_none_not_panic() {
        assert!(PacketRecord::parse_ethernet(&[0u8; 4]).is_none());
        assert!(PacketRecord::parse_ethernet(&[]).is_none());
    }
}
