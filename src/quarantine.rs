//! Quarantine actuator (spec §6/§9): firewall mutation is an external
//! collaborator. `LocalActuator` keeps the ban-table/timer bookkeeping the
//! original `IPTablesHandler` (`ids/utils/firewall.py`) did, without
//! shelling out to `iptables` or opening an SSH connection — those are
//! explicitly out of scope (spec §1, §9 "firewall over SSH -> pluggable
//! actuator").

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Result;

pub trait QuarantineActuator: Send + Sync {
    /// Bans `ip`. Returns `Ok(true)` if a new ban was created, `Ok(false)`
    /// if the ip was already banned (at-most-one-ban, testable property 8).
    fn ban(&self, ip: IpAddr, reason: &str) -> Result<bool>;
    fn unban(&self, ip: IpAddr) -> Result<bool>;
    fn is_banned(&self, ip: IpAddr) -> bool;
    /// Invoked periodically; lifts bans whose duration has elapsed.
    fn sweep_expired(&self);
}

struct BanEntry {
    banned_at: Instant,
    #[allow(dead_code)]
    reason: String,
}

pub struct LocalActuator {
    ban_time: Duration,
    banned: Mutex<HashMap<IpAddr, BanEntry>>,
}

impl LocalActuator {
    pub fn new(ban_time: Duration) -> Self {
        LocalActuator {
            ban_time,
            banned: Mutex::new(HashMap::new()),
        }
    }
}

impl QuarantineActuator for LocalActuator {
    fn ban(&self, ip: IpAddr, reason: &str) -> Result<bool> {
        let mut banned = self.banned.lock();
        if banned.contains_key(&ip) {
            return Ok(false);
        }
        banned.insert(
            ip,
            BanEntry {
                banned_at: Instant::now(),
                reason: reason.to_string(),
            },
        );
        log::info!("banned {ip}: {reason}");
        Ok(true)
    }

    fn unban(&self, ip: IpAddr) -> Result<bool> {
        let mut banned = self.banned.lock();
        Ok(banned.remove(&ip).is_some())
    }

    fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.lock().contains_key(&ip)
    }

    fn sweep_expired(&self) {
        let mut banned = self.banned.lock();
        let now = Instant::now();
        let ban_time = self.ban_time;
        banned.retain(|ip, entry| {
            let keep = now.duration_since(entry.banned_at) <= ban_time;
            if !keep {
                log::info!("unbanned {ip}: ban expired");
            }
            keep
        });
    }
}

/// A no-op actuator for tests and for running without quarantine enabled.
pub struct NoopActuator;

impl QuarantineActuator for NoopActuator {
    fn ban(&self, _ip: IpAddr, _reason: &str) -> Result<bool> {
        Ok(true)
    }
    fn unban(&self, _ip: IpAddr) -> Result<bool> {
        Ok(true)
    }
    fn is_banned(&self, _ip: IpAddr) -> bool {
        false
    }
    fn sweep_expired(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn repeated_ban_is_a_no_op_testable_property_8() {
        let actuator = LocalActuator::new(Duration::from_secs(300));
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        assert!(actuator.ban(ip, "first").unwrap());
        assert!(!actuator.ban(ip, "second").unwrap());
        assert!(actuator.is_banned(ip));
    }

    #[test]
    fn sweep_unbans_only_after_ban_time_elapses() {
        let actuator = LocalActuator::new(Duration::from_millis(0));
        let ip = IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9));
        actuator.ban(ip, "test").unwrap();
        assert!(actuator.is_banned(ip));
        std::thread::sleep(Duration::from_millis(5));
        actuator.sweep_expired();
        assert!(!actuator.is_banned(ip));
    }
}
