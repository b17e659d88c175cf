//! # Client Facade
//!
//! [`QuicrClient`] assembles the full stack: stage pipeline above the
//! queues, pacer engine below them, and the three background threads
//! (send, receive, timer). The public surface is non-blocking throughout;
//! `ready()` reflects the handshake state and turns false on both
//! transport failure and retry exhaustion.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::connection::{ClientConnection, ConnectionConfig};
use crate::encrypt::{Aead, EncryptStage};
use crate::fec::FecStage;
use crate::fragment::FragmentStage;
use crate::name::ShortName;
use crate::pacer::{self, Engine};
use crate::packet::Packet;
use crate::pipeline::{Stack, StackUpdate};
use crate::rate::{RateConfig, RateCtrl};
use crate::retransmit::RetransmitStage;
use crate::stats::ClientSnapshot;
use crate::transport::{Transport, UdpTransport};
use crate::wire::{Magic, SubscribeReq};

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub mtu: u16,
    pub target_pps: u32,
    pub min_rtt_ms: u16,
    pub big_rtt_ms: u16,
    pub bitrate_up_min: u64,
    pub bitrate_up_start: u64,
    pub bitrate_up_max: u64,
    /// Diagnostic drop probability applied in both directions.
    pub fake_loss: f32,
    /// Alternate the framing magic per packet.
    pub crazy_bit: bool,
    /// XOR parity interval; `None` disables FEC generation.
    pub fec_interval: Option<u32>,
    pub resync_timeout: Duration,
    pub max_connection_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            mtu: 1280,
            target_pps: 480,
            min_rtt_ms: 20,
            big_rtt_ms: 50,
            bitrate_up_min: 250_000,
            bitrate_up_start: 1_000_000,
            bitrate_up_max: 20_000_000,
            fake_loss: 0.0,
            crazy_bit: false,
            fec_interval: None,
            resync_timeout: Duration::from_millis(500),
            max_connection_retries: 3,
        }
    }
}

// ─── Client ─────────────────────────────────────────────────────────────────

pub struct QuicrClient {
    cfg: ClientConfig,
    engine: Option<Arc<Engine>>,
    threads: Vec<JoinHandle<()>>,
    path_token: u32,
}

impl QuicrClient {
    pub fn new(cfg: ClientConfig) -> Self {
        QuicrClient {
            cfg,
            engine: None,
            threads: Vec::new(),
            path_token: 0,
        }
    }

    /// Dial a relay over a fresh UDP socket. Returns false when the socket
    /// cannot bind or the relay name does not resolve; the handshake then
    /// proceeds in the background and `ready()` flips once it completes.
    pub fn open(&mut self, client_id: u32, relay: &str, port: u16, token: u64) -> bool {
        let transport = match UdpTransport::bind(("0.0.0.0", 0)) {
            Ok(t) => Arc::new(t),
            Err(err) => {
                warn!(%err, "client socket bind failed");
                return false;
            }
        };
        let Some(relay_addr) = (relay, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut a| a.next())
        else {
            warn!(relay, port, "relay does not resolve");
            return false;
        };
        self.open_with_transport(transport, relay_addr, relay, client_id, token)
    }

    /// Dial over an injected transport (tests, simulations).
    pub fn open_with_transport(
        &mut self,
        transport: Arc<dyn Transport>,
        relay_addr: SocketAddr,
        origin: &str,
        client_id: u32,
        token: u64,
    ) -> bool {
        if self.engine.is_some() {
            warn!("client already open");
            return false;
        }

        // The 32-bit path token folds the caller's 64-bit token.
        let path_token = (token ^ (token >> 32)) as u32;

        let conn = ClientConnection::new(ConnectionConfig {
            origin: origin.to_string(),
            sender_id: client_id,
            path_token,
            resync_timeout: self.cfg.resync_timeout,
            max_retries: self.cfg.max_connection_retries,
            features: 1,
        });

        let rate = RateCtrl::new(RateConfig {
            mtu: self.cfg.mtu,
            target_pps: self.cfg.target_pps,
            up_min_bps: self.cfg.bitrate_up_min,
            up_start_bps: self.cfg.bitrate_up_start,
            up_max_bps: self.cfg.bitrate_up_max,
            ..Default::default()
        });

        let stack = Stack::new(
            EncryptStage::new(),
            FragmentStage::new(self.cfg.mtu),
            FecStage::new(self.cfg.fec_interval),
            RetransmitStage::new(),
        );

        let engine = Arc::new(Engine::new(
            transport,
            relay_addr,
            path_token,
            stack,
            conn,
            rate,
            self.cfg.fake_loss,
            self.cfg.crazy_bit,
            self.cfg.target_pps,
        ));

        {
            let mut stack = engine.stack.lock().unwrap();
            stack.on_update(&StackUpdate::Mtu {
                mtu: self.cfg.mtu,
                pps: self.cfg.target_pps,
            });
            stack.on_update(&StackUpdate::Rtt {
                min_ms: self.cfg.min_rtt_ms,
                big_ms: self.cfg.big_rtt_ms,
            });
            stack.on_update(&StackUpdate::BitrateUp {
                min_bps: self.cfg.bitrate_up_min,
                start_bps: self.cfg.bitrate_up_start,
                max_bps: self.cfg.bitrate_up_max,
            });
        }
        engine
            .rate
            .lock()
            .unwrap()
            .override_rtt(self.cfg.min_rtt_ms, self.cfg.big_rtt_ms);

        engine.begin_handshake();

        for (label, body) in [
            ("quicr-send", run_thread(pacer::run_send, &engine)),
            ("quicr-recv", run_thread(pacer::run_recv, &engine)),
            ("quicr-timer", run_thread(pacer::run_timer, &engine)),
        ] {
            match std::thread::Builder::new().name(label.into()).spawn(body) {
                Ok(handle) => self.threads.push(handle),
                Err(err) => {
                    warn!(%err, label, "thread spawn failed");
                    engine.shutdown_now();
                    return false;
                }
            }
        }

        info!(client_id, %relay_addr, "client opened");
        self.path_token = path_token;
        self.engine = Some(engine);
        true
    }

    /// Connected and serviceable.
    pub fn ready(&self) -> bool {
        self.engine
            .as_ref()
            .map(|e| e.is_connected())
            .unwrap_or(false)
    }

    /// Tear down: reset to the relay, stop the threads, drop the engine.
    pub fn close(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.shutdown_now();
            for handle in self.threads.drain(..) {
                let _ = handle.join();
            }
            debug!("client closed");
        }
    }

    /// A named, framed packet with payload capacity reserved.
    pub fn create_packet(&self, name: ShortName, reserved_bytes: usize) -> Packet {
        let mut packet = Packet::with_header(Magic::Data, self.path_token);
        packet.set_name(name);
        packet.reserve(reserved_bytes + 20);
        packet
    }

    /// Hand a chunk to the stack. False when the connection is not ready
    /// or the stack rejected the packet.
    pub fn publish(&mut self, packet: Packet) -> bool {
        if !self.ready() {
            return false;
        }
        let engine = self.engine.as_ref().expect("ready implies engine");
        let outputs = engine.stack.lock().unwrap().send(packet);
        let accepted = !outputs.is_empty();
        for p in outputs {
            engine.queues.push_send(p);
        }
        accepted
    }

    /// Non-blocking receive of the next reassembled, decrypted chunk.
    pub fn recv(&mut self) -> Option<Packet> {
        let engine = self.engine.as_ref()?;
        loop {
            let packet = engine.queues.pop_recv()?;
            if let Some(delivered) = engine.stack.lock().unwrap().recv(packet) {
                return Some(delivered);
            }
        }
    }

    /// Subscribe to a name prefix. Queued through the stack, so it holds
    /// across reconnects; may be called before the handshake completes.
    pub fn subscribe(&mut self, name: ShortName) -> bool {
        let Some(engine) = self.engine.as_ref() else {
            return false;
        };
        let mut packet = Packet::with_header(Magic::Data, self.path_token);
        packet.set_name(name);
        packet.set_priority(1);
        SubscribeReq { name }.encode(&mut packet);

        let outputs = engine.stack.lock().unwrap().send_subscribe(packet);
        for p in outputs {
            engine.queues.push_send(p);
        }
        true
    }

    pub fn set_packets_up(&mut self, pps: u32, mtu: u16) {
        self.cfg.target_pps = pps;
        self.cfg.mtu = mtu;
        if let Some(engine) = self.engine.as_ref() {
            engine.target_pps.store(pps, Ordering::Relaxed);
            engine.rate.lock().unwrap().override_mtu(mtu, pps);
            engine
                .stack
                .lock()
                .unwrap()
                .on_update(&StackUpdate::Mtu { mtu, pps });
        }
    }

    pub fn set_rtt_estimate(&mut self, min_rtt_ms: u16, big_rtt_ms: u16) {
        let big_rtt_ms = if big_rtt_ms == 0 {
            min_rtt_ms.saturating_mul(3) / 2
        } else {
            big_rtt_ms
        };
        self.cfg.min_rtt_ms = min_rtt_ms;
        self.cfg.big_rtt_ms = big_rtt_ms;
        if let Some(engine) = self.engine.as_ref() {
            engine.rate.lock().unwrap().override_rtt(min_rtt_ms, big_rtt_ms);
            engine.stack.lock().unwrap().on_update(&StackUpdate::Rtt {
                min_ms: min_rtt_ms,
                big_ms: big_rtt_ms,
            });
        }
    }

    pub fn set_bitrate_up(&mut self, min_bps: u64, start_bps: u64, max_bps: u64) {
        self.cfg.bitrate_up_min = min_bps;
        self.cfg.bitrate_up_start = start_bps;
        self.cfg.bitrate_up_max = max_bps;
        if let Some(engine) = self.engine.as_ref() {
            engine
                .rate
                .lock()
                .unwrap()
                .override_bitrate_up(min_bps, start_bps, max_bps);
            engine
                .stack
                .lock()
                .unwrap()
                .on_update(&StackUpdate::BitrateUp {
                    min_bps,
                    start_bps,
                    max_bps,
                });
        }
    }

    /// Current upstream pacing target in bits/s.
    pub fn get_target_upstream_bitrate(&self) -> u64 {
        self.engine
            .as_ref()
            .map(|e| e.rate.lock().unwrap().bw_up_target())
            .unwrap_or(0)
    }

    pub fn set_crypto_key(&mut self, epoch: u64, secret: &[u8]) {
        if let Some(engine) = self.engine.as_ref() {
            engine.stack.lock().unwrap().set_crypto_key(epoch, secret);
        }
    }

    /// Install a different AEAD engine (the cipher is pluggable).
    pub fn set_aead(&mut self, aead: Box<dyn Aead>) {
        if let Some(engine) = self.engine.as_ref() {
            engine.stack.lock().unwrap().set_aead(aead);
        }
    }

    pub fn stats(&self) -> ClientSnapshot {
        let Some(engine) = self.engine.as_ref() else {
            return ClientSnapshot::default();
        };
        let rate = engine.rate.lock().unwrap();
        ClientSnapshot {
            connected: engine.is_connected(),
            stack: engine.stack.lock().unwrap().snapshot(),
            engine: engine.stats.snapshot(),
            bw_up_target_bps: rate.bw_up_target(),
            bw_down_target_bps: rate.bw_down_target(),
            est_rtt_us: rate.est_rtt_us(),
        }
    }
}

impl Drop for QuicrClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bind a loop function to a cloned engine handle for a spawn.
fn run_thread(
    body: fn(&Arc<Engine>),
    engine: &Arc<Engine>,
) -> impl FnOnce() + Send + 'static {
    let engine = Arc::clone(engine);
    move || body(&engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemNetwork;

    fn addr(last: u8) -> SocketAddr {
        format!("10.2.0.{last}:5004").parse().unwrap()
    }

    #[test]
    fn publish_refused_before_open() {
        let mut client = QuicrClient::new(ClientConfig::default());
        let packet = client.create_packet(ShortName::resource(1), 100);
        assert!(!client.publish(packet));
        assert!(!client.ready());
        assert!(client.recv().is_none());
    }

    #[test]
    fn create_packet_carries_name_and_framing() {
        let client = QuicrClient::new(ClientConfig::default());
        let name = ShortName::source(4, 5, 6);
        let packet = client.create_packet(name, 500);
        assert_eq!(packet.name(), name);
        assert_eq!(packet.magic(), Some((Magic::Data, false)));
        assert_eq!(packet.data_len(), 0);
    }

    #[test]
    fn open_without_relay_stays_unready_and_closes() {
        let net = MemNetwork::new();
        let transport = Arc::new(net.endpoint(addr(1)));
        let mut client = QuicrClient::new(ClientConfig {
            resync_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        assert!(client.open_with_transport(
            transport,
            addr(2), // nobody listening
            "dead.relay",
            7,
            0xABCD,
        ));
        assert!(!client.ready());

        // Subscriptions queue even while unconnected.
        assert!(client.subscribe(ShortName::resource(1)));

        client.close();
        assert!(!client.ready());
    }

    #[test]
    fn double_open_is_rejected() {
        let net = MemNetwork::new();
        let mut client = QuicrClient::new(ClientConfig::default());
        assert!(client.open_with_transport(
            Arc::new(net.endpoint(addr(1))),
            addr(2),
            "relay",
            1,
            1
        ));
        assert!(!client.open_with_transport(
            Arc::new(net.endpoint(addr(3))),
            addr(2),
            "relay",
            1,
            1
        ));
    }
}
