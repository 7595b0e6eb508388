//! Alert type and router (C7). The router merges rule and anomaly
//! verdicts for one packet, dispatches to sinks, forwards to the
//! correlator, and triggers quarantine for high-severity hits.

use std::net::IpAddr;
use std::time::SystemTime;

use serde::Serialize;
use uuid::Uuid;

use crate::anomaly::AnomalyVerdict;
use crate::packet::PacketRecord;
use crate::quarantine::QuarantineActuator;
use crate::rules::{Rule, Severity};
use crate::sink::StorageSink;
use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    Rule,
    Anomaly,
    Correlation,
}

/// An emitted verdict (spec §3). `related` carries either the triggering
/// packet id (rule/anomaly alerts) or the tail of related alert ids
/// (correlation alerts).
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: SystemTime,
    pub severity: Severity,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub protocol: Option<&'static str>,
    pub kind: AlertKind,
    pub rule_name: Option<String>,
    pub confidence: Option<f64>,
    pub packet_id: Option<Uuid>,
    pub related: Vec<Uuid>,
}

impl Alert {
    pub fn from_rule(rule: &Rule, kind: AlertKind) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            timestamp: SystemTime::now(),
            severity: rule.severity,
            src_ip: None,
            dst_ip: None,
            protocol: None,
            kind,
            rule_name: Some(rule.name.clone()),
            confidence: None,
            packet_id: None,
            related: Vec::new(),
        }
    }

    pub fn with_packet(mut self, packet: &PacketRecord) -> Alert {
        self.src_ip = Some(packet.src_ip);
        self.dst_ip = Some(packet.dst_ip);
        self.protocol = Some(packet.protocol.as_str());
        self.packet_id = Some(packet.id);
        self
    }

    pub fn from_anomaly(packet: &PacketRecord, verdict: &AnomalyVerdict, severity: Severity) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            timestamp: SystemTime::now(),
            severity,
            src_ip: Some(packet.src_ip),
            dst_ip: Some(packet.dst_ip),
            protocol: Some(packet.protocol.as_str()),
            kind: AlertKind::Anomaly,
            rule_name: None,
            confidence: Some(verdict.confidence),
            packet_id: Some(packet.id),
            related: Vec::new(),
        }
    }
}

/// Confidence above which an anomaly verdict alone justifies quarantine
/// (spec §4.7).
pub const ANOMALY_QUARANTINE_THRESHOLD: f64 = 0.9;

pub struct AlertRouter<'a> {
    pub sink: &'a dyn StorageSink,
    pub quarantine: &'a dyn QuarantineActuator,
    pub stats: &'a Stats,
}

impl<'a> AlertRouter<'a> {
    pub fn new(sink: &'a dyn StorageSink, quarantine: &'a dyn QuarantineActuator, stats: &'a Stats) -> Self {
        AlertRouter { sink, quarantine, stats }
    }

    /// Routes all alerts produced for one packet. Returns the alerts so
    /// the caller can forward them to the correlator. `packet_ref` is the
    /// sink-assigned reference from `save_packet`.
    pub fn route(
        &self,
        packet: &PacketRecord,
        packet_ref: Uuid,
        rule_alerts: Vec<Alert>,
        anomaly: Option<AnomalyVerdict>,
    ) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = rule_alerts.into_iter().map(|a| a.with_packet(packet)).collect();

        if let Some(verdict) = &anomaly {
            if verdict.attack {
                let severity = if verdict.confidence > ANOMALY_QUARANTINE_THRESHOLD {
                    Severity::High
                } else {
                    Severity::Medium
                };
                alerts.push(Alert::from_anomaly(packet, verdict, severity));
            }
        }

        if alerts.is_empty() {
            return alerts;
        }

        if let Err(e) = self.sink.save_alert(packet_ref, &alerts) {
            log::warn!("failed to persist alert(s) for packet {packet_ref}: {e}");
            self.stats.sink_errors.inc();
        }
        self.stats.alerts_emitted.add(alerts.len() as u64);

        for alert in &alerts {
            let should_quarantine = alert.severity == Severity::High
                || alert.confidence.map(|c| c > ANOMALY_QUARANTINE_THRESHOLD).unwrap_or(false);
            if should_quarantine {
                if let Some(ip) = alert.src_ip {
                    let reason = match &alert.rule_name {
                        Some(name) => format!("rule {name} fired"),
                        None => format!("anomaly confidence {:.2}", alert.confidence.unwrap_or(0.0)),
                    };
                    match self.quarantine.ban(ip, &reason) {
                        Ok(true) => self.stats.bans_issued.inc(),
                        Ok(false) => {}
                        Err(e) => {
                            log::warn!("quarantine ban failed for {ip}: {e}");
                            self.stats.sink_errors.inc();
                        }
                    }
                }
            }
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quarantine::{LocalActuator, NoopActuator};
    use crate::sink::InMemorySink;
    use std::net::Ipv4Addr;
    use std::time::SystemTime;

    fn test_packet() -> PacketRecord {
        PacketRecord {
            id: Uuid::new_v4(),
            captured_at: SystemTime::now(),
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            protocol: crate::packet::Protocol::Tcp,
            src_port: Some(1234),
            dst_port: Some(80),
            tcp_flags: Some(0x02),
            tcp_window: None,
            ip: None,
        }
    }

    #[test]
    fn high_severity_rule_hit_bans_exactly_once_scenario_s6() {
        let sink = InMemorySink::new(100);
        let quarantine = LocalActuator::new(std::time::Duration::from_secs(300));
        let stats = Stats::default();
        let router = AlertRouter::new(&sink, &quarantine, &stats);

        let rule = crate::rules::builtin_rules()
            .into_iter()
            .find(|r| r.name == "SYN Flood Detection")
            .unwrap();
        let packet = test_packet();
        let alert = Alert::from_rule(&rule, AlertKind::Rule);

        router.route(&packet, packet.id, vec![alert.clone()], None);
        assert!(quarantine.is_banned(packet.src_ip));

        // Second high-severity alert from the same IP must not re-ban.
        let before = stats.bans_issued.get();
        router.route(&packet, packet.id, vec![alert], None);
        assert_eq!(stats.bans_issued.get(), before);
    }

    #[test]
    fn no_alerts_means_no_sink_write_and_no_ban() {
        let sink = InMemorySink::new(100);
        let quarantine = NoopActuator;
        let stats = Stats::default();
        let router = AlertRouter::new(&sink, &quarantine, &stats);
        let packet = test_packet();
        let routed = router.route(&packet, packet.id, Vec::new(), None);
        assert!(routed.is_empty());
        assert_eq!(stats.alerts_emitted.get(), 0);
    }
}
