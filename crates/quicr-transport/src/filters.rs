//! # Engine Filters
//!
//! The two diagnostic filters sitting between the connection gate and the
//! socket: [`FakeLoss`] drops packets with a configured probability, and
//! [`CrazyBit`] alternates the framing magic between its normal and
//! "crazy" byte on successive packets. Both are lock-light so the pacer
//! threads can consult them on every packet.

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::trace;

use crate::packet::Packet;
use crate::wire::Magic;

// ─── Fake Loss ──────────────────────────────────────────────────────────────

/// Probability drop filter for loss testing. Probability zero (the
/// default) short-circuits without touching the RNG.
pub struct FakeLoss {
    /// Drop probability as `f32` bits, so updates need no lock.
    probability_bits: AtomicU32,
    rng: Mutex<StdRng>,
    drops: AtomicU64,
}

impl FakeLoss {
    pub fn new(probability: f32) -> Self {
        FakeLoss {
            probability_bits: AtomicU32::new(probability.clamp(0.0, 1.0).to_bits()),
            rng: Mutex::new(StdRng::from_rng(&mut rand::rng())),
            drops: AtomicU64::new(0),
        }
    }

    pub fn set_probability(&self, probability: f32) {
        self.probability_bits
            .store(probability.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn probability(&self) -> f32 {
        f32::from_bits(self.probability_bits.load(Ordering::Relaxed))
    }

    /// Roll the dice for one packet.
    pub fn should_drop(&self) -> bool {
        let p = self.probability();
        if p <= 0.0 {
            return false;
        }
        let drop = self.rng.lock().unwrap().random_bool(p as f64);
        if drop {
            self.drops.fetch_add(1, Ordering::Relaxed);
            trace!("fake loss dropped a packet");
        }
        drop
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

impl Default for FakeLoss {
    fn default() -> Self {
        Self::new(0.0)
    }
}

// ─── Crazy Bit ──────────────────────────────────────────────────────────────

/// Magic-byte rewriter: when enabled, flips the framing magic between the
/// normal and alternate encoding on each outbound packet. Receivers accept
/// both forms, so the flip is invisible above the wire.
pub struct CrazyBit {
    enabled: AtomicBool,
    flip: AtomicBool,
}

impl CrazyBit {
    pub fn new(enabled: bool) -> Self {
        CrazyBit {
            enabled: AtomicBool::new(enabled),
            flip: AtomicBool::new(false),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Rewrite the packet's magic byte if the filter is active.
    pub fn apply(&self, packet: &mut Packet) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let Some((magic, _)) = packet.magic() else {
            return;
        };
        let crazy = self.flip.fetch_xor(true, Ordering::Relaxed);
        packet.set_magic(magic, crazy);
    }
}

impl Default for CrazyBit {
    fn default() -> Self {
        Self::new(false)
    }
}
