//! # Pacer Engine
//!
//! The threaded bottom half of the client: a send loop that drains the
//! priority queues under two pacing constraints (constant packet rate and
//! the rate controller's bandwidth ceiling), a receive loop that strips
//! acks and relay stamps before handing packets up, and a 1 ms timer that
//! advances the connection machine and the stage stack.
//!
//! The engine also folds in the stages below the pacer: the connection
//! gate, the crazy-bit magic rewriter, the fake-loss filter, and the
//! transport itself. Threads share no mutable state with the public API
//! except through the queues, the per-component mutexes, and the atomic
//! connection-state mirror.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, warn};

use crate::connection::{ClientConnection, ConnState, ConnTick};
use crate::filters::{CrazyBit, FakeLoss};
use crate::packet::Packet;
use crate::pipeline::{Stack, StackUpdate};
use crate::priority::PriorityQueues;
use crate::rate::RateCtrl;
use crate::stats::EngineStats;
use crate::transport::Transport;
use crate::wire::{
    ClientData, Magic, NetAck, NetRateReq, NetRstRedirect, NetRstRetry, NetSyncAck, PacketTag,
    RelayData,
};

/// Link framing ahead of the UDP payload (Ethernet + IP + UDP), charged to
/// every packet when accounting bandwidth. Matches what captures show.
pub const LINK_OVERHEAD_BYTES: usize = 42;

// ─── Microsecond Clock ──────────────────────────────────────────────────────

/// Monotonic microsecond clock. Internally 64-bit; the wire carries the
/// low 32 bits (wrapping every ~71 minutes).
pub struct MicroClock {
    epoch: Instant,
}

impl MicroClock {
    pub fn new() -> Self {
        MicroClock {
            epoch: Instant::now(),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// The truncated form stamped into wire fields.
    pub fn wire_now_us(&self) -> u32 {
        (self.now_us() & 0xFFFF_FFFF) as u32
    }
}

impl Default for MicroClock {
    fn default() -> Self {
        Self::new()
    }
}

fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        std::thread::sleep(deadline - now);
    }
}

fn resolve(origin: &str, port: u16) -> Option<SocketAddr> {
    (origin, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
}

// ─── Engine ─────────────────────────────────────────────────────────────────

pub(crate) struct Engine {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) relay_addr: Mutex<SocketAddr>,
    pub(crate) path_token: u32,
    pub(crate) stack: Mutex<Stack>,
    pub(crate) queues: PriorityQueues,
    pub(crate) conn: Mutex<ClientConnection>,
    pub(crate) conn_state: AtomicU8,
    pub(crate) conn_failed: AtomicBool,
    pub(crate) rate: Mutex<RateCtrl>,
    pub(crate) fake_loss: FakeLoss,
    pub(crate) crazy: CrazyBit,
    pub(crate) clock: MicroClock,
    pub(crate) shutdown: AtomicBool,
    pub(crate) next_seq: AtomicU32,
    pub(crate) target_pps: AtomicU32,
    pub(crate) stats: EngineStats,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        relay_addr: SocketAddr,
        path_token: u32,
        stack: Stack,
        conn: ClientConnection,
        rate: RateCtrl,
        fake_loss_probability: f32,
        crazy_bit: bool,
        target_pps: u32,
    ) -> Self {
        Engine {
            transport,
            relay_addr: Mutex::new(relay_addr),
            path_token,
            stack: Mutex::new(stack),
            queues: PriorityQueues::new(),
            conn: Mutex::new(conn),
            conn_state: AtomicU8::new(ConnState::Start as u8),
            conn_failed: AtomicBool::new(false),
            rate: Mutex::new(rate),
            fake_loss: FakeLoss::new(fake_loss_probability),
            crazy: CrazyBit::new(crazy_bit),
            clock: MicroClock::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU32::new(1),
            target_pps: AtomicU32::new(target_pps),
            stats: EngineStats::default(),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.conn_state.load(Ordering::Acquire) == ConnState::Connected as u8
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.conn_failed.load(Ordering::Acquire)
    }

    /// Mirror the connection state into atomics for lock-free `ready()`.
    fn sync_conn_state(&self, conn: &ClientConnection) {
        self.conn_state.store(conn.state() as u8, Ordering::Release);
        self.conn_failed.store(conn.has_failed(), Ordering::Release);
    }

    /// Bottom of the stack: crazy-bit rewrite, fake-loss filter, socket.
    pub(crate) fn transmit(&self, mut packet: Packet) -> bool {
        self.crazy.apply(&mut packet);
        if self.fake_loss.should_drop() {
            self.stats.fake_loss_drops.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let dst = packet
            .dst()
            .unwrap_or_else(|| *self.relay_addr.lock().unwrap());
        let sent = self.transport.send(packet.as_bytes(), dst);
        if sent {
            self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_sent
                .fetch_add(packet.full_len() as u64, Ordering::Relaxed);
        }
        sent
    }

    /// Kick off the handshake (first SYNC plus timer arm).
    pub(crate) fn begin_handshake(&self) {
        let now = Instant::now();
        let now_ms = self.clock.now_us() / 1000;
        let syn = {
            let mut conn = self.conn.lock().unwrap();
            let syn = conn.begin(now, now_ms);
            self.sync_conn_state(&conn);
            syn
        };
        self.stats.syncs_sent.fetch_add(1, Ordering::Relaxed);
        self.transmit(syn);
    }

    /// Flag shutdown and push a best-effort reset.
    pub(crate) fn shutdown_now(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let rst = {
            let mut conn = self.conn.lock().unwrap();
            let rst = conn.make_rst();
            self.sync_conn_state(&conn);
            rst
        };
        self.transmit(rst);
    }

    fn send_rate_request(&self) {
        let bitrate_kbps = (self.rate.lock().unwrap().bw_down_target() / 1000) as u32;
        let mut packet = Packet::with_header(Magic::Data, self.path_token);
        NetRateReq { bitrate_kbps }.encode(&mut packet);
        self.stats.rate_reqs_sent.fetch_add(1, Ordering::Relaxed);
        self.transmit(packet);
    }
}

// ─── Send Loop ──────────────────────────────────────────────────────────────

pub(crate) fn run_send(engine: &Arc<Engine>) {
    let mut old_phase = u32::MAX;
    let mut phase_start = Instant::now();
    let mut sent_this_phase: u64 = 0;

    while !engine.shutdown.load(Ordering::Relaxed) {
        let now_us = engine.clock.now_us();
        let phase = engine.rate.lock().unwrap().poll_phase(now_us);
        let connected = engine.is_connected();

        if phase != old_phase {
            old_phase = phase;
            phase_start = Instant::now();
            sent_this_phase = 0;
            if connected {
                engine.send_rate_request();
            }
        }

        if !connected {
            // Handshake gate: queued packets wait for Connected.
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        let Some(mut packet) = engine.queues.pop_send() else {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        };

        let seq = engine.next_seq.fetch_add(1, Ordering::Relaxed);
        ClientData {
            client_seq_num: seq,
        }
        .encode(&mut packet);

        let bits = ((packet.full_len() + LINK_OVERHEAD_BYTES) * 8) as u32;
        let send_instant = Instant::now();
        let send_us = engine.clock.now_us();
        engine
            .rate
            .lock()
            .unwrap()
            .send_packet(seq, send_us, bits, packet.name());

        engine.transmit(packet);
        sent_this_phase += 1;

        // Constraint (a): constant packet rate within the phase.
        let pps = engine.target_pps.load(Ordering::Relaxed);
        if pps > 0 {
            let due = phase_start
                + Duration::from_micros(sent_this_phase.saturating_mul(1_000_000) / pps as u64);
            sleep_until(due);
        }

        // Constraint (b): bandwidth ceiling from the rate controller.
        let bw = engine.rate.lock().unwrap().bw_up_target();
        if bw > 0 {
            sleep_until(send_instant + Duration::from_micros(bits as u64 * 1_000_000 / bw));
        }
    }
}

// ─── Receive Loop ───────────────────────────────────────────────────────────

pub(crate) fn run_recv(engine: &Arc<Engine>) {
    while !engine.shutdown.load(Ordering::Relaxed) {
        let Some((data, src)) = engine.transport.recv() else {
            continue;
        };
        engine.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        if engine.fake_loss.should_drop() {
            continue;
        }

        let mut packet = Packet::from_datagram(data, src);
        let now = Instant::now();
        let now_us = engine.clock.now_us();
        let now_ms = now_us / 1000;

        match packet.next_tag() {
            PacketTag::SyncAck => {
                let Some(ack) = NetSyncAck::decode(&mut packet) else {
                    continue;
                };
                let newly = {
                    let mut conn = engine.conn.lock().unwrap();
                    let newly = conn.on_sync_ack(&ack, now_ms);
                    engine.sync_conn_state(&conn);
                    newly
                };
                if newly {
                    engine
                        .stack
                        .lock()
                        .unwrap()
                        .on_update(&StackUpdate::Reconnected);
                }
                continue;
            }
            PacketTag::RstRetry => {
                let Some(retry) = NetRstRetry::decode(&mut packet) else {
                    continue;
                };
                let resend = {
                    let mut conn = engine.conn.lock().unwrap();
                    let resend = conn.on_rst_retry(retry.cookie, now, now_ms);
                    engine.sync_conn_state(&conn);
                    resend
                };
                if let Some(syn) = resend {
                    engine.stats.syncs_sent.fetch_add(1, Ordering::Relaxed);
                    engine.transmit(syn);
                }
                continue;
            }
            PacketTag::RstRedirect => {
                let Some(redirect) = NetRstRedirect::decode(&mut packet) else {
                    continue;
                };
                match resolve(&redirect.origin, redirect.port) {
                    Some(addr) => *engine.relay_addr.lock().unwrap() = addr,
                    None => {
                        warn!(origin = %redirect.origin, "cannot resolve redirect target");
                        continue;
                    }
                }
                let resend = {
                    let mut conn = engine.conn.lock().unwrap();
                    let resend = conn.on_rst_redirect(&redirect, now, now_ms);
                    engine.sync_conn_state(&conn);
                    resend
                };
                if let Some(syn) = resend {
                    engine.stats.syncs_sent.fetch_add(1, Ordering::Relaxed);
                    engine.transmit(syn);
                }
                continue;
            }
            PacketTag::None => {
                // Bare framing: a reset is the only meaningful form.
                if matches!(packet.magic(), Some((Magic::Rst, _))) {
                    let resend = {
                        let mut conn = engine.conn.lock().unwrap();
                        let resend = conn.on_rst(now, now_ms);
                        engine.sync_conn_state(&conn);
                        resend
                    };
                    if let Some(syn) = resend {
                        engine.stats.syncs_sent.fetch_add(1, Ordering::Relaxed);
                        engine.transmit(syn);
                    }
                }
                continue;
            }
            PacketTag::Bad => {
                debug!(%src, "unknown outer tag, dropping");
                continue;
            }
            _ => {}
        }

        // Drain trailing acks; redundant entries feed the rate controller
        // without counting as fresh acknowledgements.
        let mut first = true;
        while packet.next_tag() == PacketTag::Ack {
            let Some(ack) = NetAck::decode(&mut packet) else {
                break;
            };
            engine.stats.acks_received.fetch_add(1, Ordering::Relaxed);
            let name = engine.rate.lock().unwrap().recv_ack(
                ack.client_seq_num,
                ack.recv_time_us,
                now_us,
                false,
                first,
            );
            if let Some(name) = name {
                engine.stack.lock().unwrap().on_ack(&name);
            }
            first = false;
        }

        if packet.next_tag() == PacketTag::RelayData {
            let Some(stamp) = RelayData::decode(&mut packet) else {
                continue;
            };
            let bits = ((packet.full_len() + LINK_OVERHEAD_BYTES) * 8) as u32;
            engine.rate.lock().unwrap().recv_packet(
                stamp.relay_seq_num,
                stamp.remote_send_time_us,
                now_us,
                bits,
                false,
            );
        }

        if packet.data_len() == 0 && packet.next_tag() == PacketTag::None {
            continue; // pure control datagram, fully consumed
        }
        engine.queues.push_recv(packet);
    }
}

// ─── Timer Loop ─────────────────────────────────────────────────────────────

pub(crate) fn run_timer(engine: &Arc<Engine>) {
    while !engine.shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        let now_ms = engine.clock.now_us() / 1000;

        let action = {
            let mut conn = engine.conn.lock().unwrap();
            let action = conn.on_tick(now, now_ms);
            engine.sync_conn_state(&conn);
            action
        };
        match action {
            ConnTick::Resend(syn) => {
                engine.stats.syncs_sent.fetch_add(1, Ordering::Relaxed);
                engine.transmit(syn);
            }
            ConnTick::Failed => warn!("handshake abandoned"),
            ConnTick::Idle => {}
        }

        let emitted = engine.stack.lock().unwrap().on_tick(now);
        for packet in emitted {
            engine.queues.push_send(packet);
        }

        std::thread::sleep(Duration::from_millis(1));
    }
}
