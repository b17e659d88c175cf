//! # Datagram Transport
//!
//! The socket seam of the stack: a blocking `send`, a polling `recv` with a
//! short internal timeout (so shutdown never stalls more than one poll),
//! and nothing else. [`UdpTransport`] wraps a standard UDP socket;
//! [`MemNetwork`] provides in-process endpoints with the same contract for
//! tests and simulations.

use anyhow::Context;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// How long one `recv` poll blocks before reporting emptiness.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 65_536;

// ─── Contract ───────────────────────────────────────────────────────────────

/// UDP-shaped datagram I/O.
pub trait Transport: Send + Sync {
    /// Send one datagram; false on a socket error.
    fn send(&self, datagram: &[u8], dst: SocketAddr) -> bool;

    /// Poll for one datagram, blocking at most ~1 ms.
    fn recv(&self) -> Option<(Vec<u8>, SocketAddr)>;

    /// The local address, where meaningful.
    fn local_addr(&self) -> Option<SocketAddr>;
}

// ─── UDP ────────────────────────────────────────────────────────────────────

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a socket. The read timeout implements the polling contract.
    pub fn bind<A: ToSocketAddrs + std::fmt::Debug>(addr: A) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(&addr).with_context(|| format!("binding UDP {addr:?}"))?;
        socket
            .set_read_timeout(Some(POLL_TIMEOUT))
            .context("setting UDP read timeout")?;
        Ok(UdpTransport { socket })
    }
}

impl Transport for UdpTransport {
    fn send(&self, datagram: &[u8], dst: SocketAddr) -> bool {
        match self.socket.send_to(datagram, dst) {
            Ok(_) => true,
            Err(err) => {
                warn!(%dst, %err, "UDP send failed");
                false
            }
        }
    }

    fn recv(&self) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match self.socket.recv_from(&mut buf) {
            Ok((len, src)) => {
                buf.truncate(len);
                Some((buf, src))
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(err) => {
                warn!(%err, "UDP recv failed");
                None
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

// ─── In-Memory Network ──────────────────────────────────────────────────────

/// A hub of in-process endpoints addressed like sockets. Every endpoint
/// gets its own inbox; `send` routes by destination address. Lossless and
/// ordered, which keeps protocol tests deterministic.
#[derive(Clone, Default)]
pub struct MemNetwork {
    inboxes: Arc<Mutex<HashMap<SocketAddr, Sender<(Vec<u8>, SocketAddr)>>>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the endpoint at `addr`.
    pub fn endpoint(&self, addr: SocketAddr) -> MemTransport {
        let (tx, rx) = unbounded();
        self.inboxes.lock().unwrap().insert(addr, tx);
        MemTransport {
            addr,
            inbox: rx,
            network: self.clone(),
        }
    }

    fn route(&self, datagram: &[u8], src: SocketAddr, dst: SocketAddr) -> bool {
        let inboxes = self.inboxes.lock().unwrap();
        match inboxes.get(&dst) {
            Some(tx) => tx.send((datagram.to_vec(), src)).is_ok(),
            None => false,
        }
    }
}

/// One endpoint of a [`MemNetwork`].
pub struct MemTransport {
    addr: SocketAddr,
    inbox: Receiver<(Vec<u8>, SocketAddr)>,
    network: MemNetwork,
}

impl Transport for MemTransport {
    fn send(&self, datagram: &[u8], dst: SocketAddr) -> bool {
        self.network.route(datagram, self.addr, dst)
    }

    fn recv(&self) -> Option<(Vec<u8>, SocketAddr)> {
        self.inbox.recv_timeout(POLL_TIMEOUT).ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:5004").parse().unwrap()
    }

    #[test]
    fn mem_endpoints_exchange_datagrams() {
        let net = MemNetwork::new();
        let a = net.endpoint(addr(1));
        let b = net.endpoint(addr(2));

        assert!(a.send(b"hello", addr(2)));
        let (data, src) = b.recv().unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(src, addr(1));
    }

    #[test]
    fn mem_send_to_unknown_address_fails() {
        let net = MemNetwork::new();
        let a = net.endpoint(addr(1));
        assert!(!a.send(b"void", addr(9)));
    }

    #[test]
    fn mem_recv_times_out_when_empty() {
        let net = MemNetwork::new();
        let a = net.endpoint(addr(1));
        assert!(a.recv().is_none());
    }

    #[test]
    fn mem_preserves_order() {
        let net = MemNetwork::new();
        let a = net.endpoint(addr(1));
        let b = net.endpoint(addr(2));
        for i in 0..10u8 {
            a.send(&[i], addr(2));
        }
        for i in 0..10u8 {
            assert_eq!(b.recv().unwrap().0, vec![i]);
        }
    }

    #[test]
    fn udp_bind_and_loopback() {
        let t1 = UdpTransport::bind("127.0.0.1:0").unwrap();
        let t2 = UdpTransport::bind("127.0.0.1:0").unwrap();
        let dst = t2.local_addr().unwrap();

        assert!(t1.send(b"ping", dst));
        // Allow a few polls for delivery.
        let mut got = None;
        for _ in 0..50 {
            if let Some(msg) = t2.recv() {
                got = Some(msg);
                break;
            }
        }
        let (data, _src) = got.expect("loopback datagram should arrive");
        assert_eq!(data, b"ping");
    }

    #[test]
    fn udp_bind_conflict_errors() {
        let t1 = UdpTransport::bind("127.0.0.1:0").unwrap();
        let taken = t1.local_addr().unwrap();
        assert!(UdpTransport::bind(taken).is_err());
    }
}
