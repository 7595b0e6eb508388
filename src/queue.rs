//! Ingress Queue (C2): a bounded, lossy hand-off between the capture
//! thread and the worker pool. Grounded in the teacher's bounded
//! `crossbeam-channel` usage pattern and `AtomicBool` shutdown flag
//! (`examples/jeeka1469-DDOS-Rust/src/main.rs`), generalized into an
//! explicit drop-counted queue (spec §4.2, testable property 1).

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::packet::PacketRecord;
use crate::stats::Stats;

/// How long a consumer blocks waiting for the next item before re-checking
/// the shutdown flag. Keeps shutdown latency bounded without busy-polling.
const RECV_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct IngressQueue {
    sender: Sender<PacketRecord>,
    receiver: Receiver<PacketRecord>,
}

impl IngressQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        IngressQueue { sender, receiver }
    }

    pub fn producer(&self) -> QueueProducer {
        QueueProducer { sender: self.sender.clone() }
    }

    pub fn consumer(&self) -> QueueConsumer {
        QueueConsumer { receiver: self.receiver.clone() }
    }
}

/// Non-blocking enqueue side. Never slows down the capture loop: when the
/// queue is full the packet is dropped and counted, not waited on (spec
/// §4.2 "never block the capture thread").
#[derive(Clone)]
pub struct QueueProducer {
    sender: Sender<PacketRecord>,
}

impl QueueProducer {
    /// Returns `true` if the packet was enqueued, `false` if it was
    /// dropped because the queue was full.
    pub fn try_push(&self, packet: PacketRecord, stats: &Stats) -> bool {
        match self.sender.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                stats.packets_dropped.inc();
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

#[derive(Clone)]
pub struct QueueConsumer {
    receiver: Receiver<PacketRecord>,
}

impl QueueConsumer {
    /// Blocks up to [`RECV_POLL_INTERVAL`] for the next packet. `Ok(None)`
    /// means the wait timed out with nothing available; the caller should
    /// check its shutdown signal and call again.
    pub fn recv(&self) -> Result<Option<PacketRecord>, ()> {
        match self.receiver.recv_timeout(RECV_POLL_INTERVAL) {
            Ok(packet) => Ok(Some(packet)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::SystemTime;
    use uuid::Uuid;

    fn packet() -> PacketRecord {
        PacketRecord {
            id: Uuid::new_v4(),
            captured_at: SystemTime::now(),
            src_ip: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)),
            protocol: crate::packet::Protocol::Other,
            src_port: None,
            dst_port: None,
            tcp_flags: None,
            tcp_window: None,
            ip: None,
        }
    }

    #[test]
    fn full_queue_drops_and_counts_instead_of_blocking_testable_property_1() {
        let queue = IngressQueue::new(1);
        let producer = queue.producer();
        let stats = Stats::default();

        assert!(producer.try_push(packet(), &stats));
        assert!(!producer.try_push(packet(), &stats));
        assert_eq!(stats.packets_dropped.get(), 1);
    }

    #[test]
    fn capacity_10_under_burst_of_50_drops_at_least_40_in_fifo_order_scenario_s5() {
        let queue = IngressQueue::new(10);
        let producer = queue.producer();
        let consumer = queue.consumer();
        let stats = Stats::default();

        let ids: Vec<Uuid> = (0..50)
            .map(|_| {
                let p = packet();
                let id = p.id;
                producer.try_push(p, &stats);
                id
            })
            .collect();

        assert!(stats.packets_dropped.get() >= 40);

        let mut received = Vec::new();
        while let Ok(Some(p)) = consumer.recv() {
            received.push(p.id);
        }
        assert!(received.len() <= 10);
        // Whatever made it through arrived in the order it was pushed.
        let expected_prefix: Vec<Uuid> = ids.into_iter().take(received.len()).collect();
        assert_eq!(received, expected_prefix);
    }

    #[test]
    fn consumer_receives_in_fifo_order() {
        let queue = IngressQueue::new(4);
        let producer = queue.producer();
        let consumer = queue.consumer();
        let stats = Stats::default();

        let first = packet();
        let first_id = first.id;
        producer.try_push(first, &stats);
        producer.try_push(packet(), &stats);

        let received = consumer.recv().unwrap().unwrap();
        assert_eq!(received.id, first_id);
    }
}
