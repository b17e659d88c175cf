//! # Rate Controller
//!
//! Sender-side bandwidth estimation driving the pacer. Time is divided
//! into phases (~16.7 ms, half a frame at 30 fps) grouped ten to a cycle;
//! the pacer emits one downstream rate request per phase boundary, and at
//! each cycle boundary the controller folds the matured packet histories
//! into per-direction loss, bandwidth, RTT, and relay-clock-offset
//! estimates, then runs an AIMD filter bounded by the operator-supplied
//! `{min, start, max}` envelope: loss above the threshold halves the
//! target, anything else earns an additive increase.
//!
//! All methods take explicit microsecond timestamps, so the controller is
//! fully deterministic under test.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::name::ShortName;

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Phase length in microseconds (half a 30 fps frame).
    pub phase_time_us: u64,
    pub phases_per_cycle: u32,
    pub mtu: u16,
    pub target_pps: u32,
    pub up_min_bps: u64,
    pub up_start_bps: u64,
    pub up_max_bps: u64,
    pub down_min_bps: u64,
    pub down_start_bps: u64,
    pub down_max_bps: u64,
    /// Per-cycle loss above this halves the relevant target.
    pub loss_threshold: f32,
    /// Pacing headroom granted during the probe phase of each cycle.
    pub probe_gain: f64,
    /// Per-direction history bound (packets).
    pub history_len: usize,
}

impl Default for RateConfig {
    fn default() -> Self {
        RateConfig {
            phase_time_us: 33_333 / 2,
            phases_per_cycle: 10,
            mtu: 1280,
            target_pps: 480,
            up_min_bps: 250_000,
            up_start_bps: 1_000_000,
            up_max_bps: 20_000_000,
            down_min_bps: 500_000,
            down_start_bps: 2_000_000,
            down_max_bps: 40_000_000,
            loss_threshold: 0.02,
            probe_gain: 1.25,
            history_len: 4096,
        }
    }
}

// ─── Packet Histories ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct UpStatus {
    size_bits: u32,
    send_time_us: u64,
    acked: bool,
    ack_time_us: u64,
    name: ShortName,
}

#[derive(Debug, Clone, Default)]
struct DownStatus {
    seen: bool,
    size_bits: u32,
    remote_send_us: u32,
    recv_time_us: u64,
}

/// Entries newer than this many slots are ignored at cycle end: they may
/// legitimately still be in flight or reordered.
const DOWN_REORDER_GUARD: usize = 16;

/// Minimum matured packets before an estimate updates.
const MIN_SAMPLES: u32 = 5;

// ─── Controller ─────────────────────────────────────────────────────────────

pub struct RateCtrl {
    cfg: RateConfig,
    /// Monotonic phase counter; never resets, `% phases_per_cycle` gives
    /// the phase index.
    phase_count: u64,
    phase_started_us: Option<u64>,

    /// Upstream history ring: index = seq − `up_offset`.
    up: VecDeque<UpStatus>,
    up_offset: u32,
    up_primed: bool,

    /// Downstream history ring: index = relay seq − `down_offset`.
    down: VecDeque<DownStatus>,
    down_offset: u32,
    down_primed: bool,

    est_rtt_us: u64,
    /// Estimated relay-minus-local clock offset in microseconds; lets the
    /// controller read `local_recv − remote_send − offset` as one-way delay.
    relay_offset_us: i64,
    offset_primed: bool,

    up_loss: f32,
    down_loss: f32,
    bw_up_est: f64,
    bw_down_est: f64,
    up_cycle_bw: f64,
    down_cycle_bw: f64,
}

impl RateCtrl {
    pub fn new(cfg: RateConfig) -> Self {
        let bw_up_est = cfg.up_start_bps as f64;
        let bw_down_est = cfg.down_start_bps as f64;
        RateCtrl {
            cfg,
            phase_count: 0,
            phase_started_us: None,
            up: VecDeque::new(),
            up_offset: 0,
            up_primed: false,
            down: VecDeque::new(),
            down_offset: 0,
            down_primed: false,
            est_rtt_us: 0,
            relay_offset_us: 0,
            offset_primed: false,
            up_loss: 0.0,
            down_loss: 0.0,
            bw_up_est,
            bw_down_est,
            up_cycle_bw: 0.0,
            down_cycle_bw: 0.0,
        }
    }

    fn cycle_time_us(&self) -> u64 {
        self.cfg.phase_time_us * self.cfg.phases_per_cycle as u64
    }

    /// Advance phase/cycle accounting to `now_us` and return the current
    /// phase index (0 .. phases_per_cycle).
    pub fn poll_phase(&mut self, now_us: u64) -> u32 {
        let mut started = match self.phase_started_us {
            Some(t) => t,
            None => {
                self.phase_started_us = Some(now_us);
                now_us
            }
        };
        while now_us >= started + self.cfg.phase_time_us {
            started += self.cfg.phase_time_us;
            self.phase_count += 1;
            if self.phase_count % self.cfg.phases_per_cycle as u64 == 0 {
                self.end_cycle(now_us);
            }
        }
        self.phase_started_us = Some(started);
        (self.phase_count % self.cfg.phases_per_cycle as u64) as u32
    }

    // ─── Feeding ────────────────────────────────────────────────────────

    /// Register an upstream transmission.
    pub fn send_packet(&mut self, seq: u32, send_time_us: u64, size_bits: u32, name: ShortName) {
        if !self.up_primed {
            self.up_offset = seq;
            self.up_primed = true;
        }
        let idx = match seq.checked_sub(self.up_offset) {
            Some(i) => i as usize,
            None => return, // stale seq from before a trim
        };
        while self.up.len() <= idx {
            self.up.push_back(UpStatus::default());
        }
        self.up[idx] = UpStatus {
            size_bits,
            send_time_us,
            acked: false,
            ack_time_us: 0,
            name,
        };
        while self.up.len() > self.cfg.history_len {
            self.up.pop_front();
            self.up_offset = self.up_offset.wrapping_add(1);
        }
    }

    /// Process an ack for an upstream sequence number. Returns the name of
    /// the acked packet (redundant acks included) so the retransmit stage
    /// can release it.
    pub fn recv_ack(
        &mut self,
        seq: u32,
        _remote_recv_us: u32,
        local_now_us: u64,
        congested: bool,
        is_first: bool,
    ) -> Option<ShortName> {
        if !self.up_primed {
            return None;
        }
        let idx = seq.checked_sub(self.up_offset)? as usize;
        let entry = self.up.get_mut(idx)?;
        if entry.size_bits == 0 {
            return None; // placeholder slot, never sent
        }
        if is_first || !entry.acked {
            entry.acked = true;
            entry.ack_time_us = local_now_us;
        }
        if congested {
            self.bw_up_est = (self.bw_up_est * 0.5).max(self.cfg.up_min_bps as f64);
        }
        Some(entry.name)
    }

    /// Register a downstream arrival stamped by the relay.
    pub fn recv_packet(
        &mut self,
        relay_seq: u32,
        remote_send_us: u32,
        local_now_us: u64,
        size_bits: u32,
        congested: bool,
    ) {
        if !self.down_primed {
            self.down_offset = relay_seq;
            self.down_primed = true;
        }
        let idx = match relay_seq.checked_sub(self.down_offset) {
            Some(i) => i as usize,
            None => return, // older than the retained window
        };
        if idx > self.cfg.history_len * 4 {
            // Enormous jump: the relay restarted its sequence space.
            debug!(relay_seq, "downstream sequence jump, resetting history");
            self.down.clear();
            self.down_offset = relay_seq;
            return self.recv_packet(relay_seq, remote_send_us, local_now_us, size_bits, congested);
        }
        while self.down.len() <= idx {
            self.down.push_back(DownStatus::default());
        }
        self.down[idx] = DownStatus {
            seen: true,
            size_bits,
            remote_send_us,
            recv_time_us: local_now_us,
        };
        if congested {
            self.bw_down_est = (self.bw_down_est * 0.5).max(self.cfg.down_min_bps as f64);
        }
    }

    // ─── Cycle-End Estimation ───────────────────────────────────────────

    fn end_cycle(&mut self, now_us: u64) {
        self.end_cycle_upstream(now_us);
        self.end_cycle_downstream();
    }

    fn end_cycle_upstream(&mut self, now_us: u64) {
        // Only packets old enough for their ack to have returned count;
        // anything younger stays for the next cycle.
        let matured_before = now_us.saturating_sub(self.cycle_time_us());

        let mut sent = 0u32;
        let mut acked = 0u32;
        let mut acked_bits = 0u64;
        let mut min_rtt = u64::MAX;

        while let Some(front) = self.up.front() {
            if front.send_time_us >= matured_before {
                break;
            }
            let entry = self.up.pop_front().unwrap();
            self.up_offset = self.up_offset.wrapping_add(1);
            if entry.size_bits == 0 {
                continue;
            }
            sent += 1;
            if entry.acked {
                acked += 1;
                acked_bits += entry.size_bits as u64;
                min_rtt = min_rtt.min(entry.ack_time_us.saturating_sub(entry.send_time_us));
            }
        }

        if sent < MIN_SAMPLES {
            return;
        }

        self.up_loss = 1.0 - acked as f32 / sent as f32;
        self.up_cycle_bw = acked_bits as f64 * 1e6 / self.cycle_time_us() as f64;
        if min_rtt != u64::MAX {
            self.est_rtt_us = if self.est_rtt_us == 0 {
                min_rtt
            } else {
                (self.est_rtt_us * 7 + min_rtt) / 8
            };
        }

        if self.up_loss > self.cfg.loss_threshold {
            self.bw_up_est = (self.bw_up_est * 0.5).max(self.cfg.up_min_bps as f64);
            debug!(
                loss = self.up_loss,
                target_bps = self.bw_up_est as u64,
                "upstream loss, halving target"
            );
        } else {
            let additive = self.cfg.mtu as f64 * 8.0 * 4.0;
            self.bw_up_est = (self.bw_up_est + additive).min(self.cfg.up_max_bps as f64);
        }
        trace!(
            loss = self.up_loss,
            cycle_bw = self.up_cycle_bw as u64,
            rtt_us = self.est_rtt_us,
            target = self.bw_up_est as u64,
            "upstream cycle"
        );
    }

    fn end_cycle_downstream(&mut self) {
        if self.down.len() <= DOWN_REORDER_GUARD {
            return;
        }
        let evaluate = self.down.len() - DOWN_REORDER_GUARD;

        let mut total = 0u32;
        let mut seen = 0u32;
        let mut seen_bits = 0u64;
        let mut best_offset = i64::MIN;

        for _ in 0..evaluate {
            let entry = self.down.pop_front().unwrap();
            self.down_offset = self.down_offset.wrapping_add(1);
            total += 1;
            if entry.seen {
                seen += 1;
                seen_bits += entry.size_bits as u64;
                // Relay clock minus local clock; the max over a cycle
                // corresponds to the minimum one-way delay.
                let offset =
                    entry.remote_send_us as i64 - (entry.recv_time_us & 0xFFFF_FFFF) as i64;
                best_offset = best_offset.max(offset);
            }
        }

        if total < MIN_SAMPLES {
            return;
        }

        self.down_loss = 1.0 - seen as f32 / total as f32;
        self.down_cycle_bw = seen_bits as f64 * 1e6 / self.cycle_time_us() as f64;

        if best_offset != i64::MIN {
            self.relay_offset_us = if self.offset_primed {
                (self.relay_offset_us * 7 + best_offset) / 8
            } else {
                self.offset_primed = true;
                best_offset
            };
        }

        if self.down_loss > self.cfg.loss_threshold {
            self.bw_down_est = (self.bw_down_est * 0.5).max(self.cfg.down_min_bps as f64);
            debug!(
                loss = self.down_loss,
                target_bps = self.bw_down_est as u64,
                "downstream loss, halving target"
            );
        } else {
            let additive = self.cfg.mtu as f64 * 8.0 * 4.0;
            self.bw_down_est = (self.bw_down_est + additive).min(self.cfg.down_max_bps as f64);
        }
        trace!(
            loss = self.down_loss,
            cycle_bw = self.down_cycle_bw as u64,
            offset_us = self.relay_offset_us,
            target = self.bw_down_est as u64,
            "downstream cycle"
        );
    }

    // ─── Targets & Overrides ────────────────────────────────────────────

    /// Upstream pacing ceiling in bits/s. The first phase of each cycle is
    /// the probe phase and earns extra headroom.
    pub fn bw_up_target(&self) -> u64 {
        let mut target = self.bw_up_est;
        if self.phase_count % self.cfg.phases_per_cycle as u64 == 0 {
            target *= self.cfg.probe_gain;
        }
        (target.min(self.cfg.up_max_bps as f64) as u64).max(self.cfg.up_min_bps)
    }

    /// Downstream target requested from the relay, in bits/s.
    pub fn bw_down_target(&self) -> u64 {
        (self.bw_down_est as u64)
            .clamp(self.cfg.down_min_bps, self.cfg.down_max_bps)
    }

    pub fn est_rtt_us(&self) -> u64 {
        self.est_rtt_us
    }

    pub fn relay_offset_us(&self) -> i64 {
        self.relay_offset_us
    }

    pub fn up_loss(&self) -> f32 {
        self.up_loss
    }

    pub fn down_loss(&self) -> f32 {
        self.down_loss
    }

    pub fn override_mtu(&mut self, mtu: u16, pps: u32) {
        self.cfg.mtu = mtu;
        self.cfg.target_pps = pps;
    }

    pub fn override_rtt(&mut self, min_ms: u16, _big_ms: u16) {
        self.est_rtt_us = min_ms as u64 * 1000;
    }

    pub fn override_bitrate_up(&mut self, min_bps: u64, start_bps: u64, max_bps: u64) {
        self.cfg.up_min_bps = min_bps;
        self.cfg.up_start_bps = start_bps;
        self.cfg.up_max_bps = max_bps;
        self.bw_up_est = start_bps as f64;
    }
}
