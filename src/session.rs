//! Session Tracker (C4): groups packets into 5-tuple flows, expires idle
//! flows, and computes flow-level features on demand.

use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use uuid::Uuid;

use crate::features::{FeatureKey, FeatureMap, FeatureValue};
use crate::packet::{PacketRecord, Protocol};

/// Unordered 5-tuple key: both directions of one flow share a session
/// because the two endpoints are sorted before the key is built
/// (testable property 4, "session canonicality").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    endpoint_a: (IpAddr, u16),
    endpoint_b: (IpAddr, u16),
    protocol: &'static str,
}

impl SessionKey {
    pub fn from_packet(packet: &PacketRecord) -> Option<SessionKey> {
        let (sport, dport) = match (packet.src_port, packet.dst_port) {
            (Some(s), Some(d)) => (s, d),
            _ => return None,
        };
        let protocol = match packet.protocol {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Other => return None,
        };
        let a = (packet.src_ip, sport);
        let b = (packet.dst_ip, dport);
        let (endpoint_a, endpoint_b) = if a <= b { (a, b) } else { (b, a) };
        Some(SessionKey {
            endpoint_a,
            endpoint_b,
            protocol,
        })
    }
}

struct PacketRef {
    #[allow(dead_code)]
    packet_ref: Uuid,
    ip_len: Option<u16>,
    timestamp: SystemTime,
}

/// Keyed by [`SessionKey`]. Append-only packet history plus first/last
/// seen timestamps (spec §3).
pub struct Session {
    packets: Vec<PacketRef>,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
}

impl Session {
    fn new(packet_ref: Uuid, timestamp: SystemTime, ip_len: Option<u16>) -> Session {
        Session {
            packets: vec![PacketRef { packet_ref, ip_len, timestamp }],
            first_seen: timestamp,
            last_seen: timestamp,
        }
    }

    fn push(&mut self, packet_ref: Uuid, timestamp: SystemTime, ip_len: Option<u16>) {
        self.packets.push(PacketRef { packet_ref, ip_len, timestamp });
        if timestamp > self.last_seen {
            self.last_seen = timestamp;
        }
    }

    /// Flow-level features computed over this session's packet history
    /// (spec §4.4).
    pub fn flow_features(&self) -> FeatureMap {
        let mut features = FeatureMap::new();

        let duration = self
            .last_seen
            .duration_since(self.first_seen)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        features.insert(FeatureKey::Duration, FeatureValue::Float(duration));
        features.insert(FeatureKey::PacketCount, FeatureValue::Int(self.packets.len() as i64));

        let sizes: Vec<f64> = self.packets.iter().filter_map(|p| p.ip_len).map(|l| l as f64).collect();
        let bytes_total: f64 = sizes.iter().sum();
        features.insert(FeatureKey::BytesTotal, FeatureValue::Int(bytes_total as i64));

        let bytes_per_second = if duration > 0.0 { bytes_total / duration } else { 0.0 };
        features.insert(FeatureKey::BytesPerSecond, FeatureValue::Float(bytes_per_second));

        if !sizes.is_empty() {
            let mean = sizes.iter().sum::<f64>() / sizes.len() as f64;
            features.insert(FeatureKey::PacketSizeMean, FeatureValue::Float(mean));

            let std = if sizes.len() < 2 {
                0.0
            } else {
                let variance = sizes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / sizes.len() as f64;
                variance.sqrt()
            };
            features.insert(FeatureKey::PacketSizeStd, FeatureValue::Float(std));
        }

        features
    }
}

/// Sharded (via `DashMap`'s internal shard locks) session table, per spec
/// §9's "session table -> sharded map" design note.
pub struct SessionTracker {
    sessions: DashMap<SessionKey, Session>,
    idle_timeout: Duration,
}

impl SessionTracker {
    pub fn new(idle_timeout: Duration) -> Self {
        SessionTracker {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Appends `packet` to its session, creating one if absent, and
    /// returns the canonical key so the caller can fetch flow features.
    /// Also opportunistically expires the touched entry's neighbors are
    /// left to the periodic sweeper; only this key is checked here to keep
    /// the hot path O(1).
    pub fn add(&self, packet: &PacketRecord) -> Option<SessionKey> {
        let key = SessionKey::from_packet(packet)?;
        let ip_len = packet.ip.map(|h| h.total_len);
        self.sessions
            .entry(key.clone())
            .and_modify(|s| s.push(packet.id, packet.captured_at, ip_len))
            .or_insert_with(|| Session::new(packet.id, packet.captured_at, ip_len));
        Some(key)
    }

    pub fn flow_features(&self, key: &SessionKey) -> Option<FeatureMap> {
        self.sessions.get(key).map(|s| s.flow_features())
    }

    /// Removes every session whose last-seen time is older than
    /// `idle_timeout` relative to `now` (spec §4.4, testable property 5).
    pub fn expire(&self, now: SystemTime) {
        self.sessions.retain(|_, session| {
            now.duration_since(session.last_seen)
                .map(|age| age <= self.idle_timeout)
                .unwrap_or(true)
        });
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tcp_packet(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), ts: SystemTime) -> PacketRecord {
        PacketRecord {
            id: Uuid::new_v4(),
            captured_at: ts,
            src_ip: IpAddr::V4(src.0),
            dst_ip: IpAddr::V4(dst.0),
            protocol: Protocol::Tcp,
            src_port: Some(src.1),
            dst_port: Some(dst.1),
            tcp_flags: None,
            tcp_window: None,
            ip: Some(crate::packet::IpHeader {
                total_len: 100,
                ttl: 64,
                proto: 6,
            }),
        }
    }

    #[test]
    fn both_directions_of_one_flow_share_a_key_testable_property_4() {
        let a = (Ipv4Addr::new(10, 0, 0, 1), 4000u16);
        let b = (Ipv4Addr::new(10, 0, 0, 2), 80u16);
        let now = SystemTime::now();
        let forward = tcp_packet(a, b, now);
        let backward = tcp_packet(b, a, now);
        assert_eq!(SessionKey::from_packet(&forward), SessionKey::from_packet(&backward));
    }

    #[test]
    fn expiry_removes_idle_sessions_testable_property_5() {
        let tracker = SessionTracker::new(Duration::from_secs(60));
        let now = SystemTime::now();
        let packet = tcp_packet((Ipv4Addr::new(1, 1, 1, 1), 1), (Ipv4Addr::new(2, 2, 2, 2), 2), now);
        tracker.add(&packet);
        assert_eq!(tracker.len(), 1);

        tracker.expire(now + Duration::from_secs(30));
        assert_eq!(tracker.len(), 1, "not yet idle");

        tracker.expire(now + Duration::from_secs(120));
        assert_eq!(tracker.len(), 0, "idle timeout elapsed");
    }

    #[test]
    fn flow_features_std_is_zero_below_two_samples() {
        let tracker = SessionTracker::new(Duration::from_secs(60));
        let now = SystemTime::now();
        let packet = tcp_packet((Ipv4Addr::new(1, 1, 1, 1), 1), (Ipv4Addr::new(2, 2, 2, 2), 2), now);
        let key = tracker.add(&packet).unwrap();
        let features = tracker.flow_features(&key).unwrap();
        assert_eq!(features.get(FeatureKey::PacketSizeStd).unwrap().as_f64(), Some(0.0));
        assert_eq!(features.get(FeatureKey::Duration).unwrap().as_f64(), Some(0.0));
    }
}
