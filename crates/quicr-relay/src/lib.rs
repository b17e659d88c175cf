//! # quicr-relay
//!
//! The QuicR relay: admits clients through a stateless-until-proven cookie
//! handshake, stores their subscriptions in a prefix [`Fib`], and fans
//! every publication out to the matching faces with a per-face relay
//! sequence stamp. Single-threaded; one datagram per [`Relay::process`]
//! call, with the transport's poll timeout providing the idle sleep.
//!
//! The relay never retries anything: acks are the only feedback channel
//! and the client's retransmit stage is the sole reliability mechanism.

pub mod fib;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quanta::Instant;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use tracing::{debug, info, trace, warn};

use quicr_transport::packet::Packet;
use quicr_transport::transport::Transport;
use quicr_transport::wire::{
    ClientData, Magic, NetAck, NetRateReq, NetRstRetry, NetSyncAck, NetSyncReq, PacketTag,
    PubData, RelayData, SubscribeReq,
};
use quicr_transport::MicroClock;

pub use fib::{Fib, SubscriberInfo};

/// Link framing charged per forwarded packet when shaping.
const LINK_OVERHEAD_BYTES: usize = 42;

/// Wire bytes of the pubData block (length, name, two tag bytes) that sit
/// behind the payload on a publish.
const PUB_BLOCK_LEN: usize = 2 + 18 + 1 + 1;

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Unanswered handshake cookies expire after this long.
    pub cookie_ttl: Duration,
    /// Connections with no SYNC refresh for this long are dropped.
    pub connection_idle_ttl: Duration,
    /// Drop every relay sequence ending in 7 (debugging aid).
    pub simulate_loss: bool,
    /// Feature bits advertised in SyncAcks.
    pub features: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            cookie_ttl: Duration::from_secs(10),
            connection_idle_ttl: Duration::from_secs(300),
            simulate_loss: false,
            features: 1,
        }
    }
}

// ─── Per-Peer State ─────────────────────────────────────────────────────────

struct RelayConnection {
    /// Next relay sequence stamp for copies sent to this face.
    relay_seq_num: u32,
    last_syn: Instant,
    /// Downstream shaper, armed by the peer's rate requests.
    shaper: Option<TokenBucket>,
    /// One-deep ack history piggy-backed onto the peer's next ack. This
    /// is the entire sender-acknowledgement redundancy channel.
    prev_ack: Option<NetAck>,
}

struct PendingCookie {
    cookie: u64,
    issued_at: Instant,
}

/// Simple token bucket: capacity is one second at the configured rate, so
/// a freshly shaped face gets at most that burst before draining to the
/// steady rate.
struct TokenBucket {
    rate_bps: u64,
    available_bits: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_bps: u64) -> Self {
        TokenBucket {
            rate_bps,
            available_bits: rate_bps as f64,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, bits: u64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.available_bits =
            (self.available_bits + elapsed * self.rate_bps as f64).min(self.rate_bps as f64);
        if self.available_bits >= bits as f64 {
            self.available_bits -= bits as f64;
            true
        } else {
            false
        }
    }
}

// ─── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct RelayStats {
    pub packets_received: u64,
    pub forwarded: u64,
    pub acks_sent: u64,
    pub syncs_received: u64,
    pub rate_requests: u64,
    pub bad_packets: u64,
    pub sim_loss_drops: u64,
    pub shaped_drops: u64,
}

// ─── Relay ──────────────────────────────────────────────────────────────────

pub struct Relay {
    transport: Arc<dyn Transport>,
    cfg: RelayConfig,
    fib: Fib,
    connections: HashMap<SocketAddr, RelayConnection>,
    cookies: HashMap<SocketAddr, PendingCookie>,
    clock: MicroClock,
    rng: StdRng,
    stats: RelayStats,
}

impl Relay {
    pub fn new(transport: Arc<dyn Transport>, cfg: RelayConfig) -> Self {
        Relay {
            transport,
            cfg,
            fib: Fib::new(),
            connections: HashMap::new(),
            cookies: HashMap::new(),
            clock: MicroClock::new(),
            rng: StdRng::from_rng(&mut rand::rng()),
            stats: RelayStats::default(),
        }
    }

    /// Handle at most one datagram. Returns false when the transport had
    /// nothing within its poll timeout (the relay's idle sleep).
    pub fn process(&mut self) -> bool {
        let Some((data, src)) = self.transport.recv() else {
            return false;
        };
        self.stats.packets_received += 1;

        let mut packet = Packet::from_datagram(data, src);
        match packet.next_tag() {
            PacketTag::Sync => self.process_syn(packet, src),
            PacketTag::ClientData => self.process_app_message(packet, src),
            PacketTag::RelayRateReq => self.process_rate_request(packet, src),
            PacketTag::None => {
                if matches!(packet.magic(), Some((Magic::Rst, _))) {
                    self.process_rst(src);
                } else {
                    self.stats.bad_packets += 1;
                    debug!(%src, "bare packet without reset magic, dropping");
                }
            }
            other => {
                self.stats.bad_packets += 1;
                debug!(%src, tag = %other, "unknown outer tag, dropping");
            }
        }
        true
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn has_connection(&self, peer: SocketAddr) -> bool {
        self.connections.contains_key(&peer)
    }

    pub fn fib(&self) -> &Fib {
        &self.fib
    }

    // ─── Handshake ──────────────────────────────────────────────────────

    fn process_syn(&mut self, mut packet: Packet, src: SocketAddr) {
        let token = packet.path_token().unwrap_or(0);
        let Some(req) = NetSyncReq::decode(&mut packet) else {
            self.stats.bad_packets += 1;
            warn!(%src, "malformed SYNC, dropping");
            return;
        };
        self.stats.syncs_received += 1;
        let now = Instant::now();
        self.collect_garbage(now);

        // Established peers just refresh their liveness.
        if let Some(conn) = self.connections.get_mut(&src) {
            conn.last_syn = now;
            trace!(%src, "SYNC refresh");
            self.send_sync_ack(src, token);
            return;
        }

        let pending = self.cookies.get(&src).map(|p| p.cookie);
        match pending {
            None if req.cookie == 0 => {
                // First contact: challenge before committing any state.
                let cookie: u64 = self.rng.random();
                self.cookies.insert(
                    src,
                    PendingCookie {
                        cookie,
                        issued_at: now,
                    },
                );
                debug!(%src, sender = req.sender_id, "SYNC challenged with cookie");
                self.send_rst_retry(src, token, cookie);
            }
            None => {
                // A cookie we never issued (or one that expired).
                debug!(%src, "SYNC with unknown cookie, resetting");
                self.send_rst(src, token);
            }
            Some(cookie) if cookie == req.cookie => {
                // The peer proved it receives at its claimed address.
                self.cookies.remove(&src);
                self.connections.insert(
                    src,
                    RelayConnection {
                        relay_seq_num: self.rng.random(),
                        last_syn: now,
                        shaper: None,
                        prev_ack: None,
                    },
                );
                info!(%src, sender = req.sender_id, "connection admitted");
                self.send_sync_ack(src, token);
            }
            Some(_) => {
                debug!(%src, "SYNC cookie mismatch, resetting");
                self.send_rst(src, token);
            }
        }
    }

    fn process_rst(&mut self, src: SocketAddr) {
        if self.connections.remove(&src).is_some() {
            info!(%src, "connection dropped by reset");
            self.fib.remove_face(src);
        }
        self.cookies.remove(&src);
    }

    // ─── Data Paths ─────────────────────────────────────────────────────

    fn process_app_message(&mut self, mut packet: Packet, src: SocketAddr) {
        let Some(client_data) = ClientData::decode(&mut packet) else {
            self.stats.bad_packets += 1;
            return;
        };
        match packet.next_tag() {
            PacketTag::PubData => self.process_pub(packet, src, client_data),
            PacketTag::SubscribeReq => self.process_sub(packet, src, client_data),
            other => {
                self.stats.bad_packets += 1;
                debug!(%src, tag = %other, "unexpected app message, dropping");
            }
        }
    }

    fn process_sub(&mut self, mut packet: Packet, src: SocketAddr, client_data: ClientData) {
        let token = packet.path_token().unwrap_or(0);
        self.send_ack(src, token, client_data.client_seq_num);

        let Some(req) = SubscribeReq::decode(&mut packet) else {
            self.stats.bad_packets += 1;
            warn!(%src, "malformed subscribe, dropping");
            return;
        };
        self.fib
            .add_subscription(req.name, SubscriberInfo { face: src });
        info!(%src, name = %req.name, "subscription stored");
    }

    fn process_pub(&mut self, packet: Packet, src: SocketAddr, client_data: ClientData) {
        let token = packet.path_token().unwrap_or(0);

        // Peek the name and length without disturbing the buffer: every
        // subscriber copy must carry identical header bytes.
        let Some(pub_data) = PubData::peek(&packet) else {
            self.stats.bad_packets += 1;
            warn!(%src, "malformed publish, dropping");
            return;
        };
        if pub_data.payload_len as usize + PUB_BLOCK_LEN > packet.data_len() {
            self.stats.bad_packets += 1;
            warn!(
                %src,
                declared = pub_data.payload_len,
                have = packet.data_len(),
                "publish length overruns buffer, dropping"
            );
            return;
        }

        self.send_ack(src, token, client_data.client_seq_num);

        let now = Instant::now();
        let now_wire = self.clock.wire_now_us();
        let subscribers = self.fib.lookup(&pub_data.name);
        trace!(name = %pub_data.name, count = subscribers.len(), "fan-out");

        for subscriber in subscribers {
            let Some(conn) = self.connections.get_mut(&subscriber.face) else {
                debug!(face = %subscriber.face, "subscriber without connection, skipping");
                continue;
            };
            let seq = conn.relay_seq_num;
            conn.relay_seq_num = conn.relay_seq_num.wrapping_add(1);

            if self.cfg.simulate_loss && seq % 10 == 7 {
                self.stats.sim_loss_drops += 1;
                continue;
            }

            let mut copy = packet.clone();
            copy.set_dst(subscriber.face);
            RelayData {
                relay_seq_num: seq,
                remote_send_time_us: now_wire,
            }
            .encode(&mut copy);

            let bits = ((copy.full_len() + LINK_OVERHEAD_BYTES) * 8) as u64;
            if let Some(bucket) = conn.shaper.as_mut() {
                if !bucket.try_consume(bits, now) {
                    self.stats.shaped_drops += 1;
                    continue;
                }
            }

            if self.transport.send(copy.as_bytes(), subscriber.face) {
                self.stats.forwarded += 1;
            }
        }
    }

    fn process_rate_request(&mut self, mut packet: Packet, src: SocketAddr) {
        let Some(req) = NetRateReq::decode(&mut packet) else {
            self.stats.bad_packets += 1;
            return;
        };
        self.stats.rate_requests += 1;
        debug!(%src, kbps = req.bitrate_kbps, "downstream rate request");

        if let Some(conn) = self.connections.get_mut(&src) {
            let rate_bps = req.bitrate_kbps as u64 * 1000;
            match conn.shaper.as_mut() {
                Some(bucket) if bucket.rate_bps == rate_bps => {}
                _ => conn.shaper = Some(TokenBucket::new(rate_bps)),
            }
        }
    }

    // ─── Replies ────────────────────────────────────────────────────────

    fn send_ack(&mut self, dst: SocketAddr, token: u32, client_seq_num: u32) {
        let mut packet = Packet::with_header(Magic::Data, token);
        let prev = self.connections.get(&dst).and_then(|c| c.prev_ack);
        if let Some(prev) = prev {
            prev.encode(&mut packet);
        }
        let ack = NetAck {
            recv_time_us: self.clock.wire_now_us(),
            client_seq_num,
            ack_vec: 0,
            ecn_vec: 0,
        };
        ack.encode(&mut packet);
        if let Some(conn) = self.connections.get_mut(&dst) {
            conn.prev_ack = Some(ack);
        }

        if self.transport.send(packet.as_bytes(), dst) {
            self.stats.acks_sent += 1;
        }
    }

    fn send_sync_ack(&mut self, dst: SocketAddr, token: u32) {
        let mut packet = Packet::with_header(Magic::SynAck, token);
        NetSyncAck {
            server_time_ms: self.clock.now_us() / 1000,
            use_features: self.cfg.features,
        }
        .encode(&mut packet);
        self.transport.send(packet.as_bytes(), dst);
    }

    fn send_rst_retry(&mut self, dst: SocketAddr, token: u32, cookie: u64) {
        let mut packet = Packet::with_header(Magic::Rst, token);
        NetRstRetry { cookie }.encode(&mut packet);
        self.transport.send(packet.as_bytes(), dst);
    }

    fn send_rst(&mut self, dst: SocketAddr, token: u32) {
        let packet = Packet::with_header(Magic::Rst, token);
        self.transport.send(packet.as_bytes(), dst);
    }

    // ─── Housekeeping ───────────────────────────────────────────────────

    /// Probe-time garbage collection of expired cookies and idle
    /// connections (with their subscriptions).
    fn collect_garbage(&mut self, now: Instant) {
        let cookie_ttl = self.cfg.cookie_ttl;
        self.cookies
            .retain(|_, pending| now.duration_since(pending.issued_at) < cookie_ttl);

        let idle_ttl = self.cfg.connection_idle_ttl;
        let dead: Vec<SocketAddr> = self
            .connections
            .iter()
            .filter(|(_, conn)| now.duration_since(conn.last_syn) >= idle_ttl)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in dead {
            info!(%addr, "idle connection dropped");
            self.connections.remove(&addr);
            self.fib.remove_face(addr);
        }
    }
}
