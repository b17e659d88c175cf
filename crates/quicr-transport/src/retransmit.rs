//! # Retransmission Stage
//!
//! Holds a clone of every reliable packet, keyed by its short name, until
//! the relay acknowledges that name or the entry ages out. Name-keyed
//! rather than sequence-keyed because the relay forwards by name and can
//! acknowledge by name; resequencing across the relay would invalidate a
//! sequence-keyed table.
//!
//! A periodic sweep resends entries whose last transmission is older than
//! one big-RTT and erases entries older than `AGE_RTT_MULTIPLIER` big-RTTs.

use std::collections::BTreeMap;
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, trace};

use crate::name::ShortName;
use crate::packet::Packet;
use crate::pipeline::{Stage, StackUpdate};

/// Entries are erased after this many big-RTTs without an ack.
const AGE_RTT_MULTIPLIER: u32 = 3;

struct Entry {
    packet: Packet,
    last_sent: Instant,
    deadline: Instant,
}

pub struct RetransmitStage {
    table: BTreeMap<ShortName, Entry>,
    /// Resend interval: one big-RTT.
    resend_after: Duration,
    /// Total retention: `AGE_RTT_MULTIPLIER` big-RTTs.
    max_age: Duration,
    resent: u64,
    expired: u64,
}

impl RetransmitStage {
    pub fn new() -> Self {
        let big_rtt = Duration::from_millis(50);
        RetransmitStage {
            table: BTreeMap::new(),
            resend_after: big_rtt,
            max_age: big_rtt * AGE_RTT_MULTIPLIER,
            resent: 0,
            expired: 0,
        }
    }

    /// Reliable packets currently retained.
    pub fn held(&self) -> usize {
        self.table.len()
    }

    pub fn resent(&self) -> u64 {
        self.resent
    }

    pub fn expired(&self) -> u64 {
        self.expired
    }
}

impl Default for RetransmitStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for RetransmitStage {
    fn label(&self) -> &'static str {
        "retransmit"
    }

    fn send(&mut self, packet: Packet) -> Vec<Packet> {
        if packet.is_reliable() {
            let now = Instant::now();
            self.table.insert(
                packet.name(),
                Entry {
                    packet: packet.clone(),
                    last_sent: now,
                    deadline: now + self.max_age,
                },
            );
            trace!(name = %packet.name(), held = self.table.len(), "retaining reliable packet");
        }
        vec![packet]
    }

    fn recv(&mut self, packet: Packet) -> Option<Packet> {
        Some(packet)
    }

    fn on_ack(&mut self, name: &ShortName) {
        if self.table.remove(name).is_some() {
            trace!(name = %name, "reliable packet acked");
        }
    }

    fn on_update(&mut self, update: &StackUpdate) {
        if let StackUpdate::Rtt { big_ms, .. } = *update {
            let big_rtt = Duration::from_millis(big_ms.max(1) as u64);
            self.resend_after = big_rtt;
            self.max_age = big_rtt * AGE_RTT_MULTIPLIER;
        }
    }

    fn on_tick(&mut self, now: Instant) -> Vec<Packet> {
        let mut resend = Vec::new();
        let mut dead = Vec::new();

        for (name, entry) in self.table.iter_mut() {
            if now >= entry.deadline {
                dead.push(*name);
            } else if now.duration_since(entry.last_sent) >= self.resend_after {
                entry.last_sent = now;
                resend.push(entry.packet.clone());
            }
        }

        for name in dead {
            self.table.remove(&name);
            self.expired += 1;
            debug!(name = %name, "reliable packet aged out unacked");
        }
        self.resent += resend.len() as u64;
        resend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Magic;

    fn reliable_packet(name: ShortName) -> Packet {
        let mut p = Packet::with_header(Magic::Data, 0);
        p.set_name(name);
        p.set_reliable(true);
        p.push_slice(b"chunk");
        p
    }

    fn fast_rtt(stage: &mut RetransmitStage, big_ms: u16) {
        stage.on_update(&StackUpdate::Rtt {
            min_ms: 1,
            big_ms,
        });
    }

    #[test]
    fn unreliable_packets_are_not_retained() {
        let mut stage = RetransmitStage::new();
        let mut p = Packet::with_header(Magic::Data, 0);
        p.push_slice(b"data");
        stage.send(p);
        assert_eq!(stage.held(), 0);
    }

    #[test]
    fn reliable_packet_held_until_ack() {
        let mut stage = RetransmitStage::new();
        let name = ShortName::source(1, 2, 3);
        stage.send(reliable_packet(name));
        assert_eq!(stage.held(), 1);

        stage.on_ack(&name);
        assert_eq!(stage.held(), 0);
    }

    #[test]
    fn ack_for_unknown_name_is_harmless() {
        let mut stage = RetransmitStage::new();
        stage.on_ack(&ShortName::resource(99));
        assert_eq!(stage.held(), 0);
    }

    #[test]
    fn sweep_resends_after_one_big_rtt() {
        let mut stage = RetransmitStage::new();
        fast_rtt(&mut stage, 1);
        stage.send(reliable_packet(ShortName::source(1, 1, 1)));

        // Immediately: nothing due.
        assert!(stage.on_tick(Instant::now()).is_empty());

        std::thread::sleep(Duration::from_millis(3));
        let resent = stage.on_tick(Instant::now());
        assert_eq!(resent.len(), 1);
        assert_eq!(stage.resent(), 1);
        // Entry survives the resend until acked or expired.
        assert_eq!(stage.held(), 1);
    }

    #[test]
    fn entry_expires_after_three_big_rtts() {
        let mut stage = RetransmitStage::new();
        fast_rtt(&mut stage, 1);
        stage.send(reliable_packet(ShortName::source(2, 2, 2)));

        std::thread::sleep(Duration::from_millis(5));
        stage.on_tick(Instant::now());
        assert_eq!(stage.held(), 0);
        assert_eq!(stage.expired(), 1);
    }

    #[test]
    fn table_size_tracks_sends_minus_acks() {
        let mut stage = RetransmitStage::new();
        let names: Vec<ShortName> = (1u64..=5).map(|i| ShortName::source(i, 0, 0)).collect();
        for &n in &names {
            stage.send(reliable_packet(n));
        }
        assert_eq!(stage.held(), 5);

        stage.on_ack(&names[0]);
        stage.on_ack(&names[3]);
        assert_eq!(stage.held(), 3);
    }
}
