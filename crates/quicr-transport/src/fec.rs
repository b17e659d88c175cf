//! # Forward Error Correction Stage
//!
//! XOR parity over a window of data packets: every `interval` FEC-eligible
//! packets, one parity packet carrying the XOR of their (length-padded)
//! payloads is emitted alongside the data. A receiver holding all but one
//! packet of a window can rebuild the missing payload from the parity.
//!
//! Disabled by default (`interval = None`), in which case the stage is a
//! pure pass-through. The receive-side recovery hook is intentionally left
//! as accounting only: parity packets are consumed and counted, and
//! [`FecStage::try_recover`] documents the contract for a full recoverer.

use quanta::Instant;
use tracing::trace;

use crate::packet::Packet;
use crate::pipeline::{Stage, StackUpdate};
use crate::wire::PubData;

/// Fragment-id value marking a parity packet; data fragments never reach it
/// because the index shares the byte with the last-flag.
pub const PARITY_FRAGMENT_ID: u8 = 0xFF;

pub struct FecStage {
    /// Emit one parity packet per this many FEC-eligible data packets;
    /// `None` disables generation.
    interval: Option<u32>,
    /// XOR accumulator over the current window.
    accumulator: Vec<u8>,
    window_count: u32,
    parity_sent: u64,
    parity_seen: u64,
}

impl FecStage {
    pub fn new(interval: Option<u32>) -> Self {
        FecStage {
            interval: interval.filter(|&n| n > 0),
            accumulator: Vec::new(),
            window_count: 0,
            parity_sent: 0,
            parity_seen: 0,
        }
    }

    pub fn set_interval(&mut self, interval: Option<u32>) {
        self.interval = interval.filter(|&n| n > 0);
        self.accumulator.clear();
        self.window_count = 0;
    }

    pub fn parity_sent(&self) -> u64 {
        self.parity_sent
    }

    pub fn parity_seen(&self) -> u64 {
        self.parity_seen
    }

    fn absorb(&mut self, payload: &[u8]) {
        if self.accumulator.len() < payload.len() {
            self.accumulator.resize(payload.len(), 0);
        }
        for (acc, byte) in self.accumulator.iter_mut().zip(payload) {
            *acc ^= byte;
        }
        self.window_count += 1;
    }

    fn emit_parity(&mut self, template: &Packet) -> Packet {
        let mut parity = template.clone_shell();
        parity.push_slice(&self.accumulator);

        let mut name = template.name();
        name.fragment_id = PARITY_FRAGMENT_ID;
        parity.set_name(name);
        PubData {
            name,
            payload_len: self.accumulator.len() as u16,
        }
        .encode(&mut parity);

        self.accumulator.clear();
        self.window_count = 0;
        self.parity_sent += 1;
        trace!(name = %name, "parity packet emitted");
        parity
    }

    /// Recovery hook. A full implementation tracks the window's payloads
    /// and, when a parity arrives with exactly one member missing, XORs the
    /// parity against the members it holds to rebuild the absent payload.
    /// This build consumes parity packets without recovering.
    pub fn try_recover(&mut self, _parity: &Packet) -> Option<Packet> {
        None
    }
}

impl Stage for FecStage {
    fn label(&self) -> &'static str {
        "fec"
    }

    fn send(&mut self, packet: Packet) -> Vec<Packet> {
        let Some(interval) = self.interval else {
            return vec![packet];
        };
        if !packet.use_fec() {
            return vec![packet];
        }

        // The pubData block already rides on the tail here; the parity
        // covers only the payload bytes ahead of it.
        let Some(pub_data) = PubData::peek(&packet) else {
            return vec![packet];
        };
        let payload_len = (pub_data.payload_len as usize).min(packet.payload().len());
        let payload = packet.payload()[..payload_len].to_vec();
        self.absorb(&payload);

        if self.window_count >= interval {
            let parity = self.emit_parity(&packet);
            return vec![packet, parity];
        }
        vec![packet]
    }

    fn recv(&mut self, packet: Packet) -> Option<Packet> {
        // The pubData block is still on the tail here; peek it to spot
        // parity packets without disturbing the buffer for later stages.
        if let Some(pd) = PubData::peek(&packet) {
            if pd.name.fragment_id == PARITY_FRAGMENT_ID {
                self.parity_seen += 1;
                return self.try_recover(&packet);
            }
        }
        Some(packet)
    }

    fn on_update(&mut self, _update: &StackUpdate) {}

    fn on_tick(&mut self, _now: Instant) -> Vec<Packet> {
        Vec::new()
    }
}
