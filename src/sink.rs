//! Storage sink (spec §6): persistence of packets/alerts is an external
//! collaborator, specified here only as an interface. `InMemorySink` is a
//! bounded-history implementation sufficient for running without an
//! external database and for tests; it mirrors the shape of the original
//! `ids/models/db_manager.py`, with the SQL backing itself out of scope.

use std::collections::VecDeque;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::alert::Alert;
use crate::correlator::CorrelationAlert;
use crate::error::Result;
use crate::features::FeatureMap;
use crate::packet::PacketRecord;

pub trait StorageSink: Send + Sync {
    fn save_packet(&self, packet: &PacketRecord, features: &FeatureMap) -> Result<Uuid>;
    fn save_alert(&self, packet_ref: Uuid, alerts: &[Alert]) -> Result<()>;
    fn save_correlation_alert(&self, alert: &CorrelationAlert) -> Result<()>;
}

struct StoredPacket {
    #[allow(dead_code)]
    id: Uuid,
}

/// Keeps only the most recent `capacity` records of each kind, per record
/// type, so a long-running process without a real database doesn't grow
/// without bound.
pub struct InMemorySink {
    capacity: usize,
    packets: Mutex<VecDeque<StoredPacket>>,
    alerts: Mutex<VecDeque<Alert>>,
    correlation_alerts: Mutex<VecDeque<CorrelationAlert>>,
}

impl InMemorySink {
    pub fn new(capacity: usize) -> Self {
        InMemorySink {
            capacity,
            packets: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(VecDeque::new()),
            correlation_alerts: Mutex::new(VecDeque::new()),
        }
    }

    pub fn recent_alerts(&self, page: usize, per_page: usize) -> (usize, Vec<Alert>) {
        let alerts = self.alerts.lock();
        let total = alerts.len();
        let page_alerts = alerts
            .iter()
            .rev()
            .skip(page.saturating_sub(1) * per_page)
            .take(per_page)
            .cloned()
            .collect();
        (total, page_alerts)
    }

    pub fn all_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    /// Source IPs ranked by alert count, most frequent first (spec §6
    /// "top-talker stats"), over the bounded alert history currently held.
    pub fn top_talkers(&self, limit: usize) -> Vec<(std::net::IpAddr, usize)> {
        let mut counts: std::collections::HashMap<std::net::IpAddr, usize> = std::collections::HashMap::new();
        for alert in self.alerts.lock().iter() {
            if let Some(ip) = alert.src_ip {
                *counts.entry(ip).or_insert(0) += 1;
            }
        }
        let mut ranked: Vec<_> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(limit);
        ranked
    }
}

impl StorageSink for InMemorySink {
    fn save_packet(&self, packet: &PacketRecord, _features: &FeatureMap) -> Result<Uuid> {
        let mut packets = self.packets.lock();
        packets.push_back(StoredPacket { id: packet.id });
        if packets.len() > self.capacity {
            packets.pop_front();
        }
        Ok(packet.id)
    }

    fn save_alert(&self, _packet_ref: Uuid, alerts: &[Alert]) -> Result<()> {
        let mut stored = self.alerts.lock();
        for alert in alerts {
            stored.push_back(alert.clone());
        }
        while stored.len() > self.capacity {
            stored.pop_front();
        }
        Ok(())
    }

    fn save_correlation_alert(&self, alert: &CorrelationAlert) -> Result<()> {
        let mut stored = self.correlation_alerts.lock();
        stored.push_back(alert.clone());
        if stored.len() > self.capacity {
            stored.pop_front();
        }
        Ok(())
    }
}
