//! # Subscription Tracker
//!
//! Remembers every subscription the client has issued and replays them when
//! the connection is re-established, so a relay restart or redirect does
//! not silently drop the receive side. Data packets pass through untouched.

use quanta::Instant;
use tracing::{debug, trace};

use std::collections::BTreeMap;

use crate::name::ShortName;
use crate::packet::Packet;
use crate::pipeline::{Stage, StackUpdate};
use crate::wire::PacketTag;

pub struct SubscribeStage {
    /// Outstanding subscriptions, keyed by name; the stored packet is the
    /// fully formed request, cloned for replay.
    subscriptions: BTreeMap<ShortName, Packet>,
    resend_pending: bool,
}

impl SubscribeStage {
    pub fn new() -> Self {
        SubscribeStage {
            subscriptions: BTreeMap::new(),
            resend_pending: false,
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

impl Default for SubscribeStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for SubscribeStage {
    fn label(&self) -> &'static str {
        "subscribe"
    }

    fn send(&mut self, packet: Packet) -> Vec<Packet> {
        if packet.next_tag() == PacketTag::SubscribeReq {
            let name = packet.name();
            debug!(name = %name, "tracking subscription");
            self.subscriptions.insert(name, packet.clone());
        }
        vec![packet]
    }

    fn recv(&mut self, packet: Packet) -> Option<Packet> {
        Some(packet)
    }

    fn on_update(&mut self, update: &StackUpdate) {
        if *update == StackUpdate::Reconnected && !self.subscriptions.is_empty() {
            self.resend_pending = true;
        }
    }

    fn on_tick(&mut self, _now: Instant) -> Vec<Packet> {
        if !self.resend_pending {
            return Vec::new();
        }
        self.resend_pending = false;
        trace!(count = self.subscriptions.len(), "replaying subscriptions");
        self.subscriptions.values().cloned().collect()
    }
}
