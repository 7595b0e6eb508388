//! Packet Source Adapter (C1): abstracts live capture from a replayable
//! feed so the rest of the pipeline never depends on `pnet::datalink`
//! directly. Grounded in the teacher's interface-selection and
//! `datalink::channel` capture loop (`examples/jeeka1469-DDOS-Rust/src/main.rs`),
//! generalized behind a trait instead of being inlined in `main`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pnet::datalink::{self, Channel::Ethernet, NetworkInterface};

use crate::error::{NidsError, Result};

/// Anything that can hand back a stream of raw Ethernet frames.
pub trait PacketSource: Send {
    /// Blocks until a frame is available, the source is stopped, or an
    /// error occurs. `Ok(None)` means the source was stopped cleanly.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Lists interfaces with at least one assigned IP, matching the teacher's
/// interface-selection prompt (spec §4.1 leaves interface selection to the
/// operator via CLI flag rather than an interactive prompt).
pub fn list_interfaces() -> Vec<NetworkInterface> {
    datalink::interfaces()
}

pub fn find_interface(name: &str) -> Result<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| NidsError::Capture(format!("no such interface: {name}")))
}

/// Live capture off a network interface via `pnet::datalink`, in
/// promiscuous mode like the teacher's capture loop.
pub struct PnetSource {
    rx: Box<dyn datalink::DataLinkReceiver>,
    running: Arc<AtomicBool>,
}

impl PnetSource {
    pub fn open(interface: &NetworkInterface, running: Arc<AtomicBool>) -> Result<Self> {
        let mut config = datalink::Config::default();
        config.promiscuous = true;
        let channel = datalink::channel(interface, config)
            .map_err(|e| NidsError::Capture(format!("failed to open channel on {}: {e}", interface.name)))?;
        let rx = match channel {
            Ethernet(_, rx) => rx,
            _ => return Err(NidsError::Capture("unsupported channel type".into())),
        };
        Ok(PnetSource { rx, running })
    }
}

impl PacketSource for PnetSource {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match self.rx.next() {
            Ok(bytes) => Ok(Some(bytes.to_vec())),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Some(Vec::new())),
            Err(e) => Err(NidsError::Capture(format!("capture read failed: {e}"))),
        }
    }
}

/// Feeds pre-recorded frames, used by tests and by replay-mode operation
/// (spec §9's "replay -> same pipeline" requirement: a `ReplaySource`
/// drives the identical ingestion path a live interface would).
pub struct ReplaySource {
    frames: std::vec::IntoIter<Vec<u8>>,
}

impl ReplaySource {
    pub fn new(frames: Vec<Vec<u8>>) -> Self {
        ReplaySource { frames: frames.into_iter() }
    }
}

impl PacketSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.frames.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_source_yields_frames_then_none() {
        let mut source = ReplaySource::new(vec![vec![1, 2, 3], vec![4, 5]]);
        assert_eq!(source.next_frame().unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(source.next_frame().unwrap(), Some(vec![4, 5]));
        assert_eq!(source.next_frame().unwrap(), None);
    }
}
