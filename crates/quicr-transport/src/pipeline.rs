//! # Pipeline Stages
//!
//! The stack of transformations a packet traverses between the application
//! and the pacer. Every stage exposes the same contract: `send` transforms
//! packets on the way down (possibly one-to-many, possibly absorbing),
//! `recv` transforms on the way up (possibly consuming), and three
//! out-of-band channels flow alongside: acks upward, parameter updates
//! downward, and a periodic tick that lets stages act on stored deadlines
//! instead of owning timers.
//!
//! The stage graph is static: [`Stack`] owns the stages in pipeline order
//! and threads packets through by index. Entering mid-stack (subscription
//! requests join below the fragmenter) is the `send_from` operation.

use quanta::Instant;
use tracing::trace;

use crate::encrypt::{Aead, EncryptStage};
use crate::fec::FecStage;
use crate::fragment::FragmentStage;
use crate::name::ShortName;
use crate::packet::Packet;
use crate::retransmit::RetransmitStage;
use crate::stats::{StackSnapshot, StatsStage};
use crate::subscribe::SubscribeStage;

// ─── Out-of-Band Updates ────────────────────────────────────────────────────

/// Parameter changes pushed down the stack.
#[derive(Debug, Clone, PartialEq)]
pub enum StackUpdate {
    /// Path MTU and target packet rate.
    Mtu { mtu: u16, pps: u32 },
    /// Operator round-trip estimates in milliseconds.
    Rtt { min_ms: u16, big_ms: u16 },
    /// Upstream bitrate envelope in bits/s.
    BitrateUp {
        min_bps: u64,
        start_bps: u64,
        max_bps: u64,
    },
    /// The connection (re-)entered the connected state.
    Reconnected,
}

// ─── Stage Contract ─────────────────────────────────────────────────────────

/// One pipeline stage. Default implementations make every out-of-band
/// channel a no-op so stages only spell out what they react to.
pub trait Stage: Send {
    /// Short name for log fields.
    fn label(&self) -> &'static str;

    /// Downward pass: transform, absorb (empty vec), or multiply a packet.
    fn send(&mut self, packet: Packet) -> Vec<Packet>;

    /// Upward pass: transform or consume (`None`) a packet.
    fn recv(&mut self, packet: Packet) -> Option<Packet>;

    /// A name was acknowledged by the relay.
    fn on_ack(&mut self, _name: &ShortName) {}

    /// A parameter update is flowing down.
    fn on_update(&mut self, _update: &StackUpdate) {}

    /// Periodic tick; returned packets re-enter the downward pass below
    /// this stage.
    fn on_tick(&mut self, _now: Instant) -> Vec<Packet> {
        Vec::new()
    }
}

// ─── Stack ──────────────────────────────────────────────────────────────────

/// Stage index of the subscription tracker; subscription requests enter the
/// downward pass here, below the encrypter and fragmenter.
const IDX_SUBSCRIBE: usize = 3;

const STAGE_COUNT: usize = 6;

/// The client-side stage stack, top (application) to bottom (send queues).
pub struct Stack {
    stats: StatsStage,
    encrypt: EncryptStage,
    fragment: FragmentStage,
    subscribe: SubscribeStage,
    fec: FecStage,
    retransmit: RetransmitStage,
}

impl Stack {
    pub fn new(
        encrypt: EncryptStage,
        fragment: FragmentStage,
        fec: FecStage,
        retransmit: RetransmitStage,
    ) -> Self {
        Stack {
            stats: StatsStage::default(),
            encrypt,
            fragment,
            subscribe: SubscribeStage::new(),
            fec,
            retransmit,
        }
    }

    fn stage_mut(&mut self, idx: usize) -> &mut dyn Stage {
        match idx {
            0 => &mut self.stats,
            1 => &mut self.encrypt,
            2 => &mut self.fragment,
            3 => &mut self.subscribe,
            4 => &mut self.fec,
            _ => &mut self.retransmit,
        }
    }

    /// Run a packet down from stage `idx`; the returned packets are ready
    /// for the priority queues.
    fn send_from(&mut self, idx: usize, packet: Packet) -> Vec<Packet> {
        let mut current = vec![packet];
        for i in idx..STAGE_COUNT {
            let mut next = Vec::new();
            for p in current {
                next.extend(self.stage_mut(i).send(p));
            }
            if next.is_empty() {
                return next;
            }
            current = next;
        }
        current
    }

    /// Full downward pass for a published chunk.
    pub fn send(&mut self, packet: Packet) -> Vec<Packet> {
        self.send_from(0, packet)
    }

    /// Downward pass for a subscription request, entering at the
    /// subscription tracker (control packets skip encryption and
    /// fragmentation).
    pub fn send_subscribe(&mut self, packet: Packet) -> Vec<Packet> {
        self.send_from(IDX_SUBSCRIBE, packet)
    }

    /// Full upward pass; `None` when a stage consumed the packet.
    pub fn recv(&mut self, packet: Packet) -> Option<Packet> {
        let mut current = packet;
        for i in (0..STAGE_COUNT).rev() {
            match self.stage_mut(i).recv(current) {
                Some(p) => current = p,
                None => {
                    trace!(stage = i, "packet consumed on upward pass");
                    return None;
                }
            }
        }
        Some(current)
    }

    /// Propagate a relay ack to every stage.
    pub fn on_ack(&mut self, name: &ShortName) {
        for i in 0..STAGE_COUNT {
            self.stage_mut(i).on_ack(name);
        }
    }

    /// Push a parameter update down the whole stack.
    pub fn on_update(&mut self, update: &StackUpdate) {
        for i in 0..STAGE_COUNT {
            self.stage_mut(i).on_update(update);
        }
    }

    /// Tick every stage; emissions re-enter the pass below their origin and
    /// the fully transformed results are returned for the send queues.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Packet> {
        let mut out = Vec::new();
        for i in 0..STAGE_COUNT {
            let emitted = self.stage_mut(i).on_tick(now);
            for p in emitted {
                out.extend(self.send_from(i + 1, p));
            }
        }
        out
    }

    pub fn set_crypto_key(&mut self, epoch: u64, secret: &[u8]) {
        self.encrypt.set_key(epoch, secret);
    }

    /// Install a different AEAD engine.
    pub fn set_aead(&mut self, aead: Box<dyn Aead>) {
        self.encrypt.set_aead(aead);
    }

    pub fn snapshot(&self) -> StackSnapshot {
        StackSnapshot {
            published: self.stats.published,
            delivered: self.stats.delivered,
            bytes_published: self.stats.bytes_published,
            bytes_delivered: self.stats.bytes_delivered,
            retransmit_held: self.retransmit.held() as u64,
            retransmits_resent: self.retransmit.resent(),
            retransmits_expired: self.retransmit.expired(),
            fragments_sent: self.fragment.fragments_sent(),
            chunks_reassembled: self.fragment.chunks_reassembled(),
            fragment_timeouts: self.fragment.timeouts(),
            subscriptions: self.subscribe.len() as u64,
            crypto_failures: self.encrypt.failures(),
            bad_packets: self.fragment.bad_packets(),
            fec_parity_sent: self.fec.parity_sent(),
            fec_parity_seen: self.fec.parity_seen(),
        }
    }

    /// Number of reliable packets currently retained (test hook).
    pub fn retransmit_held(&self) -> usize {
        self.retransmit.held()
    }
}
