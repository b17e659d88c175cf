//! # Client Connection Handshake
//!
//! Pure state machine, no I/O: the pacer engine feeds it received control
//! messages and clock ticks, and it hands back packets to transmit.
//!
//! ```text
//!   Start ──begin──▶ ConnectionPending ──SyncAck──▶ Connected
//!                        │        ▲
//!                  timer fire   RstRetry / RstRedirect
//!                  (≤3 retries)   (resend SYNC with cookie)
//! ```
//!
//! Exhausting the retry budget returns the machine to `Start` and latches
//! the failure, which the client surfaces as `ready() == false`.

use std::time::Duration;

use quanta::Instant;
use tracing::{debug, info, warn};

use crate::packet::Packet;
use crate::wire::{Magic, NetRstRedirect, NetSyncAck, NetSyncReq};

// ─── State ──────────────────────────────────────────────────────────────────

/// Connection lifecycle state. The discriminants are stable so the engine
/// can mirror the state into an atomic for lock-free `ready()` checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Start = 0,
    ConnectionPending = 1,
    Connected = 2,
}

impl ConnState {
    pub fn from_u8(v: u8) -> ConnState {
        match v {
            1 => ConnState::ConnectionPending,
            2 => ConnState::Connected,
            _ => ConnState::Start,
        }
    }
}

/// Result of a resync-timer tick.
#[derive(Debug)]
pub enum ConnTick {
    /// Nothing due.
    Idle,
    /// Retry budget left: transmit this SYNC again.
    Resend(Packet),
    /// Retries exhausted; the machine fell back to `Start`.
    Failed,
}

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Origin string carried in the SYNC (the relay name dialed).
    pub origin: String,
    /// Publishing endpoint id.
    pub sender_id: u32,
    /// Path token stamped into every framing header.
    pub path_token: u32,
    /// Resync timer interval.
    pub resync_timeout: Duration,
    /// SYNC retries before giving up.
    pub max_retries: u32,
    /// Feature bits advertised in the SYNC.
    pub features: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            origin: String::new(),
            sender_id: 0,
            path_token: 0,
            resync_timeout: Duration::from_millis(500),
            max_retries: 3,
            features: 1,
        }
    }
}

// ─── State Machine ──────────────────────────────────────────────────────────

pub struct ClientConnection {
    cfg: ConnectionConfig,
    state: ConnState,
    /// Cookie learned from the relay's RstRetry, echoed on resends.
    cookie: u64,
    retries: u32,
    resync_at: Option<Instant>,
    server_time_offset_ms: i64,
    failed: bool,
}

impl ClientConnection {
    pub fn new(cfg: ConnectionConfig) -> Self {
        ClientConnection {
            cfg,
            state: ConnState::Start,
            cookie: 0,
            retries: 0,
            resync_at: None,
            server_time_offset_ms: 0,
            failed: false,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    /// Whether the handshake gave up (retries exhausted).
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Estimated `server − client` clock offset from the SyncAck exchange.
    pub fn server_time_offset_ms(&self) -> i64 {
        self.server_time_offset_ms
    }

    fn make_syn(&self, client_time_ms: u64) -> Packet {
        let mut packet = Packet::with_header(Magic::Syn, self.cfg.path_token);
        NetSyncReq {
            cookie: self.cookie,
            origin: self.cfg.origin.clone(),
            sender_id: self.cfg.sender_id,
            client_time_ms,
            supported_features: self.cfg.features,
        }
        .encode(&mut packet);
        packet
    }

    /// Kick off the handshake: emits the initial SYNC and arms the timer.
    pub fn begin(&mut self, now: Instant, client_time_ms: u64) -> Packet {
        self.state = ConnState::ConnectionPending;
        self.cookie = 0;
        self.retries = 0;
        self.failed = false;
        self.resync_at = Some(now + self.cfg.resync_timeout);
        debug!(origin = %self.cfg.origin, "handshake started");
        self.make_syn(client_time_ms)
    }

    /// Resync timer: call every tick.
    pub fn on_tick(&mut self, now: Instant, client_time_ms: u64) -> ConnTick {
        if self.state != ConnState::ConnectionPending {
            return ConnTick::Idle;
        }
        let Some(due) = self.resync_at else {
            return ConnTick::Idle;
        };
        if now < due {
            return ConnTick::Idle;
        }

        if self.retries < self.cfg.max_retries {
            self.retries += 1;
            self.resync_at = Some(now + self.cfg.resync_timeout);
            debug!(retry = self.retries, "resending SYNC");
            ConnTick::Resend(self.make_syn(client_time_ms))
        } else {
            self.state = ConnState::Start;
            self.resync_at = None;
            self.failed = true;
            warn!("handshake retries exhausted");
            ConnTick::Failed
        }
    }

    /// The relay challenged us with a cookie: store and resend at once.
    pub fn on_rst_retry(
        &mut self,
        cookie: u64,
        now: Instant,
        client_time_ms: u64,
    ) -> Option<Packet> {
        if self.state != ConnState::ConnectionPending {
            return None;
        }
        self.cookie = cookie;
        self.resync_at = Some(now + self.cfg.resync_timeout);
        debug!(cookie, "cookie received, resending SYNC");
        Some(self.make_syn(client_time_ms))
    }

    /// The relay pointed us elsewhere: adopt the cookie and resend. The
    /// caller re-points the transport at the returned origin/port.
    pub fn on_rst_redirect(
        &mut self,
        redirect: &NetRstRedirect,
        now: Instant,
        client_time_ms: u64,
    ) -> Option<Packet> {
        if self.state != ConnState::ConnectionPending {
            return None;
        }
        self.cookie = redirect.cookie;
        self.resync_at = Some(now + self.cfg.resync_timeout);
        info!(origin = %redirect.origin, port = redirect.port, "redirected by relay");
        Some(self.make_syn(client_time_ms))
    }

    /// The relay accepted us. Returns true when the state newly became
    /// `Connected` (triggering subscription replay).
    pub fn on_sync_ack(&mut self, ack: &NetSyncAck, client_time_ms: u64) -> bool {
        let newly = self.state != ConnState::Connected;
        self.state = ConnState::Connected;
        self.retries = 0;
        self.resync_at = None;
        self.failed = false;
        self.server_time_offset_ms = ack.server_time_ms as i64 - client_time_ms as i64;
        if newly {
            info!(offset_ms = self.server_time_offset_ms, "connected");
        }
        newly
    }

    /// A bare reset arrived: restart the handshake with a fresh cookie,
    /// counting it against the retry budget.
    pub fn on_rst(&mut self, now: Instant, client_time_ms: u64) -> Option<Packet> {
        if self.state == ConnState::Start {
            return None;
        }
        self.cookie = 0;
        if self.retries < self.cfg.max_retries {
            self.retries += 1;
            self.state = ConnState::ConnectionPending;
            self.resync_at = Some(now + self.cfg.resync_timeout);
            debug!("reset received, restarting handshake");
            Some(self.make_syn(client_time_ms))
        } else {
            self.state = ConnState::Start;
            self.resync_at = None;
            self.failed = true;
            None
        }
    }

    /// Best-effort teardown packet pushed out on `stop()`.
    pub fn make_rst(&mut self) -> Packet {
        self.state = ConnState::Start;
        self.resync_at = None;
        Packet::with_header(Magic::Rst, self.cfg.path_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{NetSyncReq, PacketTag};

    fn conn() -> ClientConnection {
        ClientConnection::new(ConnectionConfig {
            origin: "relay.test".into(),
            sender_id: 42,
            path_token: 7,
            resync_timeout: Duration::from_millis(10),
            ..Default::default()
        })
    }

    #[test]
    fn begin_emits_syn_with_zero_cookie() {
        let mut c = conn();
        let mut syn = c.begin(Instant::now(), 1000);
        assert_eq!(c.state(), ConnState::ConnectionPending);
        assert_eq!(syn.magic(), Some((Magic::Syn, false)));
        assert_eq!(syn.path_token(), Some(7));

        let req = NetSyncReq::decode(&mut syn).unwrap();
        assert_eq!(req.cookie, 0);
        assert_eq!(req.sender_id, 42);
        assert_eq!(req.origin, "relay.test");
        assert_eq!(req.client_time_ms, 1000);
    }

    #[test]
    fn rst_retry_echoes_cookie() {
        let mut c = conn();
        c.begin(Instant::now(), 0);
        let mut syn = c.on_rst_retry(0xC00C1E, Instant::now(), 5).unwrap();
        let req = NetSyncReq::decode(&mut syn).unwrap();
        assert_eq!(req.cookie, 0xC00C1E);
    }

    #[test]
    fn sync_ack_connects_and_records_offset() {
        let mut c = conn();
        c.begin(Instant::now(), 0);
        let newly = c.on_sync_ack(
            &NetSyncAck {
                server_time_ms: 1500,
                use_features: 1,
            },
            1000,
        );
        assert!(newly);
        assert!(c.is_connected());
        assert_eq!(c.server_time_offset_ms(), 500);

        // A refresh ack is not a reconnect.
        assert!(!c.on_sync_ack(&NetSyncAck::default(), 0));
    }

    #[test]
    fn timer_retries_then_fails() {
        let mut c = conn();
        let t0 = Instant::now();
        c.begin(t0, 0);

        let mut resends = 0;
        let mut t = t0;
        loop {
            t += Duration::from_millis(11);
            match c.on_tick(t, 0) {
                ConnTick::Resend(_) => resends += 1,
                ConnTick::Failed => break,
                ConnTick::Idle => panic!("timer should be due"),
            }
        }
        assert_eq!(resends, 3, "default budget is three retries");
        assert_eq!(c.state(), ConnState::Start);
        assert!(c.has_failed());
    }

    #[test]
    fn tick_is_idle_before_deadline_and_when_connected() {
        let mut c = conn();
        let t0 = Instant::now();
        c.begin(t0, 0);
        assert!(matches!(c.on_tick(t0, 0), ConnTick::Idle));

        c.on_sync_ack(&NetSyncAck::default(), 0);
        assert!(matches!(
            c.on_tick(t0 + Duration::from_secs(1), 0),
            ConnTick::Idle
        ));
    }

    #[test]
    fn redirect_adopts_cookie() {
        let mut c = conn();
        c.begin(Instant::now(), 0);
        let redirect = NetRstRedirect {
            cookie: 99,
            origin: "other.relay".into(),
            port: 5005,
        };
        let mut syn = c.on_rst_redirect(&redirect, Instant::now(), 0).unwrap();
        let req = NetSyncReq::decode(&mut syn).unwrap();
        assert_eq!(req.cookie, 99);
    }

    #[test]
    fn bare_rst_restarts_handshake_with_fresh_cookie() {
        let mut c = conn();
        c.begin(Instant::now(), 0);
        c.on_rst_retry(123, Instant::now(), 0);
        c.on_sync_ack(&NetSyncAck::default(), 0);

        let mut syn = c.on_rst(Instant::now(), 0).unwrap();
        assert_eq!(c.state(), ConnState::ConnectionPending);
        let req = NetSyncReq::decode(&mut syn).unwrap();
        assert_eq!(req.cookie, 0, "cookie resets after a bare Rst");
    }

    #[test]
    fn make_rst_is_bare_header() {
        let mut c = conn();
        c.begin(Instant::now(), 0);
        let rst = c.make_rst();
        assert_eq!(rst.magic(), Some((Magic::Rst, false)));
        assert_eq!(rst.next_tag(), PacketTag::None);
        assert_eq!(c.state(), ConnState::Start);
    }
}
