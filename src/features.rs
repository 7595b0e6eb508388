//! Per-packet feature extraction (C3). Pure, total functions over a
//! [`crate::packet::PacketRecord`]; never fails. Missing protocol layers
//! simply produce missing keys — never sentinel zeros (spec §4.3).

use std::collections::HashMap;
use std::fmt;

use crate::packet::{PacketRecord, Protocol};

/// Closed set of feature names. Unknown names in a rule file are a
/// `ConfigError` at parse time (spec §9, "dynamic, stringly-typed features
/// -> closed enum").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKey {
    IpLen,
    IpTtl,
    IpProto,
    TcpSport,
    TcpDport,
    TcpFlags,
    TcpWindow,
    UdpSport,
    UdpDport,
    UdpLen,
    Duration,
    PacketCount,
    BytesTotal,
    BytesPerSecond,
    PacketSizeMean,
    PacketSizeStd,
}

impl FeatureKey {
    pub const ALL: &'static [FeatureKey] = &[
        FeatureKey::IpLen,
        FeatureKey::IpTtl,
        FeatureKey::IpProto,
        FeatureKey::TcpSport,
        FeatureKey::TcpDport,
        FeatureKey::TcpFlags,
        FeatureKey::TcpWindow,
        FeatureKey::UdpSport,
        FeatureKey::UdpDport,
        FeatureKey::UdpLen,
        FeatureKey::Duration,
        FeatureKey::PacketCount,
        FeatureKey::BytesTotal,
        FeatureKey::BytesPerSecond,
        FeatureKey::PacketSizeMean,
        FeatureKey::PacketSizeStd,
    ];

    pub fn from_str(s: &str) -> Option<FeatureKey> {
        Some(match s {
            "ip_len" => FeatureKey::IpLen,
            "ip_ttl" => FeatureKey::IpTtl,
            "ip_proto" => FeatureKey::IpProto,
            "tcp_sport" => FeatureKey::TcpSport,
            "tcp_dport" => FeatureKey::TcpDport,
            "tcp_flags" => FeatureKey::TcpFlags,
            "tcp_window" => FeatureKey::TcpWindow,
            "udp_sport" => FeatureKey::UdpSport,
            "udp_dport" => FeatureKey::UdpDport,
            "udp_len" => FeatureKey::UdpLen,
            "duration" => FeatureKey::Duration,
            "packet_count" => FeatureKey::PacketCount,
            "bytes_total" => FeatureKey::BytesTotal,
            "bytes_per_second" => FeatureKey::BytesPerSecond,
            "packet_size_mean" => FeatureKey::PacketSizeMean,
            "packet_size_std" => FeatureKey::PacketSizeStd,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKey::IpLen => "ip_len",
            FeatureKey::IpTtl => "ip_ttl",
            FeatureKey::IpProto => "ip_proto",
            FeatureKey::TcpSport => "tcp_sport",
            FeatureKey::TcpDport => "tcp_dport",
            FeatureKey::TcpFlags => "tcp_flags",
            FeatureKey::TcpWindow => "tcp_window",
            FeatureKey::UdpSport => "udp_sport",
            FeatureKey::UdpDport => "udp_dport",
            FeatureKey::UdpLen => "udp_len",
            FeatureKey::Duration => "duration",
            FeatureKey::PacketCount => "packet_count",
            FeatureKey::BytesTotal => "bytes_total",
            FeatureKey::BytesPerSecond => "bytes_per_second",
            FeatureKey::PacketSizeMean => "packet_size_mean",
            FeatureKey::PacketSizeStd => "packet_size_std",
        }
    }

    /// Whether this feature can ever appear on a per-packet map, a
    /// per-flow map, or both. Used to resolve spec §9's open question on
    /// packet vs. flow rule namespaces.
    pub fn domain(&self) -> crate::rules::Domain {
        use crate::rules::Domain;
        match self {
            FeatureKey::IpLen
            | FeatureKey::IpTtl
            | FeatureKey::IpProto
            | FeatureKey::TcpSport
            | FeatureKey::TcpDport
            | FeatureKey::TcpFlags
            | FeatureKey::TcpWindow
            | FeatureKey::UdpSport
            | FeatureKey::UdpDport
            | FeatureKey::UdpLen => Domain::Packet,
            FeatureKey::Duration
            | FeatureKey::PacketCount
            | FeatureKey::BytesTotal
            | FeatureKey::BytesPerSecond
            | FeatureKey::PacketSizeMean
            | FeatureKey::PacketSizeStd => Domain::Flow,
        }
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed feature value. Integers and floats compare numerically; strings
/// compare lexicographically; a comparison across variants is always false
/// (spec §4.5, "type mismatch => condition false").
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl FeatureValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Int(v) => Some(*v as f64),
            FeatureValue::Float(v) => Some(*v),
            FeatureValue::Str(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FeatureValue::Int(v) => Some(*v),
            FeatureValue::Float(v) => Some(*v as i64),
            FeatureValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Mapping from feature name to typed value. All features are optional:
/// absence means "not applicable to this packet/flow".
#[derive(Debug, Clone, Default)]
pub struct FeatureMap {
    values: HashMap<FeatureKey, FeatureValue>,
}

impl FeatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: FeatureKey, value: FeatureValue) {
        self.values.insert(key, value);
    }

    pub fn get(&self, key: FeatureKey) -> Option<&FeatureValue> {
        self.values.get(&key)
    }

    pub fn contains(&self, key: FeatureKey) -> bool {
        self.values.contains_key(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Combines this map with `other`, `other`'s entries winning on key
    /// collision. Used to re-inject a session's flow features alongside
    /// the packet that triggered the update, so a `Domain::Both` rule
    /// mixing packet-only and flow-only features sees both in one map
    /// (spec §4.4).
    pub fn merged_with(&self, other: &FeatureMap) -> FeatureMap {
        let mut merged = self.clone();
        for (key, value) in &other.values {
            merged.values.insert(*key, value.clone());
        }
        merged
    }
}

/// Extracts the per-packet feature set. Never fails; malformed packets
/// (failed header parse) simply yield an empty map.
pub fn extract_packet_features(packet: &PacketRecord) -> FeatureMap {
    let mut features = FeatureMap::new();

    if let Some(ip) = &packet.ip {
        features.insert(FeatureKey::IpLen, FeatureValue::Int(ip.total_len as i64));
        features.insert(FeatureKey::IpTtl, FeatureValue::Int(ip.ttl as i64));
        features.insert(FeatureKey::IpProto, FeatureValue::Int(ip.proto as i64));
    }

    match packet.protocol {
        Protocol::Tcp => {
            if let (Some(sport), Some(dport)) = (packet.src_port, packet.dst_port) {
                features.insert(FeatureKey::TcpSport, FeatureValue::Int(sport as i64));
                features.insert(FeatureKey::TcpDport, FeatureValue::Int(dport as i64));
            }
            if let Some(flags) = packet.tcp_flags {
                features.insert(FeatureKey::TcpFlags, FeatureValue::Int(flags as i64));
            }
            if let Some(window) = packet.tcp_window {
                features.insert(FeatureKey::TcpWindow, FeatureValue::Int(window as i64));
            }
        }
        Protocol::Udp => {
            if let (Some(sport), Some(dport)) = (packet.src_port, packet.dst_port) {
                features.insert(FeatureKey::UdpSport, FeatureValue::Int(sport as i64));
                features.insert(FeatureKey::UdpDport, FeatureValue::Int(dport as i64));
            }
            if let Some(ip) = &packet.ip {
                features.insert(FeatureKey::UdpLen, FeatureValue::Int(ip.total_len as i64));
            }
        }
        Protocol::Other => {}
    }

    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IpHeader, PacketRecord, Protocol};
    use std::net::IpAddr;
    use std::time::SystemTime;

    fn base_packet() -> PacketRecord {
        PacketRecord {
            id: uuid::Uuid::new_v4(),
            captured_at: SystemTime::now(),
            src_ip: "10.0.0.1".parse::<IpAddr>().unwrap(),
            dst_ip: "10.0.0.2".parse::<IpAddr>().unwrap(),
            protocol: Protocol::Other,
            src_port: None,
            dst_port: None,
            tcp_flags: None,
            tcp_window: None,
            ip: None,
        }
    }

    #[test]
    fn missing_layers_yield_missing_keys_never_zero() {
        let packet = base_packet();
        let features = extract_packet_features(&packet);
        assert!(features.is_empty());
        assert!(!features.contains(FeatureKey::IpLen));
    }

    #[test]
    fn tcp_packet_yields_tcp_keys_not_udp_keys() {
        let mut packet = base_packet();
        packet.protocol = Protocol::Tcp;
        packet.src_port = Some(1025);
        packet.dst_port = Some(80);
        packet.tcp_flags = Some(0x02);
        packet.tcp_window = Some(8192);
        packet.ip = Some(IpHeader {
            total_len: 64,
            ttl: 64,
            proto: 6,
        });

        let features = extract_packet_features(&packet);
        assert_eq!(features.get(FeatureKey::TcpDport).unwrap().as_i64(), Some(80));
        assert_eq!(features.get(FeatureKey::TcpFlags).unwrap().as_i64(), Some(0x02));
        assert!(!features.contains(FeatureKey::UdpDport));
        assert_eq!(features.get(FeatureKey::IpTtl).unwrap().as_i64(), Some(64));
    }

    #[test]
    fn merged_with_lets_flow_features_win_on_collision() {
        let mut packet_side = FeatureMap::new();
        packet_side.insert(FeatureKey::TcpFlags, FeatureValue::Int(2));
        packet_side.insert(FeatureKey::Duration, FeatureValue::Int(0));

        let mut flow_side = FeatureMap::new();
        flow_side.insert(FeatureKey::Duration, FeatureValue::Float(3.5));
        flow_side.insert(FeatureKey::PacketCount, FeatureValue::Int(250));

        let merged = packet_side.merged_with(&flow_side);
        assert_eq!(merged.get(FeatureKey::TcpFlags).unwrap().as_i64(), Some(2));
        assert_eq!(merged.get(FeatureKey::PacketCount).unwrap().as_i64(), Some(250));
        assert_eq!(merged.get(FeatureKey::Duration).unwrap().as_f64(), Some(3.5));
    }

    #[test]
    fn feature_key_round_trips_through_its_string_name() {
        for key in FeatureKey::ALL {
            assert_eq!(FeatureKey::from_str(key.as_str()), Some(*key));
        }
        assert_eq!(FeatureKey::from_str("not_a_feature"), None);
    }
}
