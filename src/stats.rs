//! Process-wide counters, exposed read-only through the control plane
//! (spec §6 traffic/top-talker stats). Grounded in `SystemStats` from
//! `koonimoh-network-ids` (examples/other_examples/.../types.rs), realized
//! here with plain atomics since the hot path only ever increments.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    pub packets_captured: Counter,
    pub queue_dropped: Counter,
    pub eval_errors: Counter,
    pub sink_errors: Counter,
    pub alerts_emitted: Counter,
    pub correlation_alerts_emitted: Counter,
    pub bans_issued: Counter,
}
