//! # Transport Statistics
//!
//! Counter snapshots for the client stack and the pacer engine. Everything
//! serializes for JSON export; the live counters sit inside the stages that
//! own them and are aggregated on demand.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::packet::Packet;
use crate::pipeline::Stage;

// ─── Stack Snapshot ─────────────────────────────────────────────────────────

/// Aggregated counters from the stages above the pacer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StackSnapshot {
    /// Chunks accepted by `publish`.
    pub published: u64,
    /// Chunks surfaced to the application by `recv`.
    pub delivered: u64,
    /// Payload bytes accepted by `publish`.
    pub bytes_published: u64,
    /// Payload bytes surfaced by `recv`.
    pub bytes_delivered: u64,
    /// Reliable packets currently held for retransmission.
    pub retransmit_held: u64,
    /// Retransmissions pushed back into the send queues.
    pub retransmits_resent: u64,
    /// Reliable packets that aged out unacknowledged.
    pub retransmits_expired: u64,
    /// Fragments produced by the splitter.
    pub fragments_sent: u64,
    /// Chunks rebuilt from fragments.
    pub chunks_reassembled: u64,
    /// Partial reassemblies dropped on timeout.
    pub fragment_timeouts: u64,
    /// Subscriptions currently tracked for reconnect replay.
    pub subscriptions: u64,
    /// AEAD open failures (dropped, never surfaced).
    pub crypto_failures: u64,
    /// Malformed packets dropped inside the stack.
    pub bad_packets: u64,
    /// Parity packets emitted.
    pub fec_parity_sent: u64,
    /// Parity packets observed on receive.
    pub fec_parity_seen: u64,
}

// ─── Engine Stats ───────────────────────────────────────────────────────────

/// Live counters owned by the pacer engine; all atomics, no locking.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub acks_received: AtomicU64,
    pub fake_loss_drops: AtomicU64,
    pub rate_reqs_sent: AtomicU64,
    pub syncs_sent: AtomicU64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            fake_loss_drops: self.fake_loss_drops.load(Ordering::Relaxed),
            rate_reqs_sent: self.rate_reqs_sent.load(Ordering::Relaxed),
            syncs_sent: self.syncs_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub acks_received: u64,
    pub fake_loss_drops: u64,
    pub rate_reqs_sent: u64,
    pub syncs_sent: u64,
}

// ─── Client Snapshot ────────────────────────────────────────────────────────

/// Everything the client exposes for observability in one struct.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientSnapshot {
    pub connected: bool,
    pub stack: StackSnapshot,
    pub engine: EngineSnapshot,
    /// Current upstream pacing target in bits/s.
    pub bw_up_target_bps: u64,
    /// Downstream target requested from the relay in bits/s.
    pub bw_down_target_bps: u64,
    /// Smoothed round-trip estimate in microseconds.
    pub est_rtt_us: u64,
}

impl ClientSnapshot {
    /// Upstream delivery ratio: acked / sent.
    pub fn ack_ratio(&self) -> f64 {
        if self.engine.packets_sent == 0 {
            0.0
        } else {
            self.engine.acks_received as f64 / self.engine.packets_sent as f64
        }
    }
}

// ─── Stats Stage ────────────────────────────────────────────────────────────

/// Top-of-stack observability tap: counts chunks in both directions and
/// otherwise passes packets through untouched.
#[derive(Debug, Default)]
pub struct StatsStage {
    pub published: u64,
    pub delivered: u64,
    pub bytes_published: u64,
    pub bytes_delivered: u64,
}

impl Stage for StatsStage {
    fn label(&self) -> &'static str {
        "stats"
    }

    fn send(&mut self, packet: Packet) -> Vec<Packet> {
        self.published += 1;
        self.bytes_published += packet.data_len() as u64;
        vec![packet]
    }

    fn recv(&mut self, packet: Packet) -> Option<Packet> {
        self.delivered += 1;
        self.bytes_delivered += packet.payload().len() as u64;
        Some(packet)
    }
}
