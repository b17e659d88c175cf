//! # Packet Buffer
//!
//! One mutable byte buffer per packet plus sidecar metadata. The wire format
//! is suffix-encoded: stages append tags at the tail of the buffer and
//! receivers decode by popping from the tail, so the payload bytes never
//! move once written. The first [`HEADER_SIZE`] bytes are the fixed framing
//! header (magic tag, path token, pad).
//!
//! A packet has exactly one owner as it traverses the pipeline; [`Packet`]
//! is `Clone`, and cloning is the only way to duplicate one (relay fan-out,
//! retransmit retention).

use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;

use crate::name::ShortName;
use crate::wire::{Magic, PacketTag};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Fixed framing header: 1 byte magic tag + 4 byte path token + 1 byte pad.
pub const HEADER_SIZE: usize = 6;

/// Lowest (most urgent) priority class.
pub const PRIORITY_HIGHEST: u8 = 1;

/// Highest (least urgent) priority class.
pub const PRIORITY_LOWEST: u8 = 10;

// ─── Packet ─────────────────────────────────────────────────────────────────

/// A wire packet: buffer + metadata. See the module docs for the layout.
#[derive(Debug, Clone)]
pub struct Packet {
    buffer: BytesMut,
    /// Offset separating framing from payload; `buffer[header_size..]` is
    /// the payload region (plus any appended suffix tags while in transit).
    header_size: usize,
    name: ShortName,
    priority: u8,
    reliable: bool,
    use_fec: bool,
    src: Option<SocketAddr>,
    dst: Option<SocketAddr>,
}

impl Packet {
    /// An empty packet with no framing. Most callers want
    /// [`Packet::with_header`].
    pub fn new() -> Self {
        Packet {
            buffer: BytesMut::new(),
            header_size: 0,
            name: ShortName::default(),
            priority: 4,
            reliable: false,
            use_fec: false,
            src: None,
            dst: None,
        }
    }

    /// A packet starting with the 6-byte framing header.
    pub fn with_header(magic: Magic, path_token: u32) -> Self {
        let mut buffer = BytesMut::with_capacity(HEADER_SIZE);
        buffer.put_u8(magic.tag(false).wire_byte());
        buffer.put_u32_le(path_token);
        buffer.put_u8(PacketTag::None.wire_byte());
        Packet {
            buffer,
            header_size: HEADER_SIZE,
            name: ShortName::default(),
            priority: 4,
            reliable: false,
            use_fec: false,
            src: None,
            dst: None,
        }
    }

    /// Wrap a received datagram. The framing header, if present, occupies
    /// the first [`HEADER_SIZE`] bytes.
    pub fn from_datagram(data: Vec<u8>, src: SocketAddr) -> Self {
        let header_size = HEADER_SIZE.min(data.len());
        Packet {
            buffer: BytesMut::from(&data[..]),
            header_size,
            name: ShortName::default(),
            priority: 4,
            reliable: false,
            use_fec: false,
            src: Some(src),
            dst: None,
        }
    }

    // ─── Framing header ─────────────────────────────────────────────────

    /// The framing magic, if the header is intact. Returns the kind and
    /// whether the "crazy" alternate byte was used.
    pub fn magic(&self) -> Option<(Magic, bool)> {
        if self.buffer.len() < HEADER_SIZE {
            return None;
        }
        Magic::from_tag(PacketTag::from_code(self.buffer[0] as u16))
    }

    /// Rewrite the framing magic byte in place.
    pub fn set_magic(&mut self, magic: Magic, crazy: bool) {
        if !self.buffer.is_empty() {
            self.buffer[0] = magic.tag(crazy).wire_byte();
        }
    }

    /// The opaque path token echoed on every packet.
    pub fn path_token(&self) -> Option<u32> {
        if self.buffer.len() < HEADER_SIZE {
            return None;
        }
        Some(u32::from_le_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]))
    }

    // ─── Buffer access ──────────────────────────────────────────────────

    /// Total buffer length including framing and tags.
    pub fn full_len(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes past the framing split (payload plus in-transit tags).
    pub fn data_len(&self) -> usize {
        self.buffer.len().saturating_sub(self.header_size)
    }

    /// The payload region.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.header_size.min(self.buffer.len())..]
    }

    /// The whole buffer as it goes on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Current framing/payload split offset.
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Re-point the framing/payload split so that the last `payload_len`
    /// bytes form the payload. Used after popping suffix tags on receive.
    pub fn set_payload_split(&mut self, payload_len: usize) {
        self.header_size = self.buffer.len().saturating_sub(payload_len);
    }

    /// Reserve room for `additional` payload bytes.
    pub fn reserve(&mut self, additional: usize) {
        self.buffer.reserve(additional);
    }

    // ─── Tail primitives (suffix encoding) ──────────────────────────────

    pub fn push(&mut self, byte: u8) {
        self.buffer.put_u8(byte);
    }

    pub fn push_slice(&mut self, bytes: &[u8]) {
        self.buffer.put_slice(bytes);
    }

    /// Last byte of the buffer without removing it.
    pub fn peek(&self) -> Option<u8> {
        self.buffer.last().copied()
    }

    /// Pop the last byte.
    pub fn pop(&mut self) -> Option<u8> {
        let last = self.buffer.last().copied()?;
        self.buffer.truncate(self.buffer.len() - 1);
        Some(last)
    }

    /// Pop the last `len` bytes, returned in buffer order.
    pub fn pop_tail(&mut self, len: usize) -> Option<Vec<u8>> {
        if len > self.buffer.len() {
            return None;
        }
        let split = self.buffer.len() - len;
        let tail = self.buffer[split..].to_vec();
        self.buffer.truncate(split);
        Some(tail)
    }

    /// Drop everything past the framing header, keeping metadata.
    pub fn clear_data(&mut self) {
        self.buffer.truncate(self.header_size);
    }

    // ─── Metadata ───────────────────────────────────────────────────────

    pub fn name(&self) -> ShortName {
        self.name
    }

    pub fn set_name(&mut self, name: ShortName) {
        self.name = name;
    }

    /// Priority class, 1 (highest) through 10 (lowest).
    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority.clamp(PRIORITY_HIGHEST, PRIORITY_LOWEST);
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn set_reliable(&mut self, reliable: bool) {
        self.reliable = reliable;
    }

    pub fn use_fec(&self) -> bool {
        self.use_fec
    }

    pub fn set_use_fec(&mut self, use_fec: bool) {
        self.use_fec = use_fec;
    }

    pub fn src(&self) -> Option<SocketAddr> {
        self.src
    }

    pub fn set_src(&mut self, src: SocketAddr) {
        self.src = Some(src);
    }

    pub fn dst(&self) -> Option<SocketAddr> {
        self.dst
    }

    pub fn set_dst(&mut self, dst: SocketAddr) {
        self.dst = Some(dst);
    }

    /// A shell sharing this packet's framing header and metadata but with
    /// an empty payload. Fragmentation builds sub-packets from this.
    pub fn clone_shell(&self) -> Packet {
        let mut shell = self.clone();
        shell.buffer.truncate(HEADER_SIZE.min(shell.buffer.len()));
        shell.header_size = shell.buffer.len();
        shell
    }

    /// Hex dump of the full buffer, for debugging.
    pub fn to_hex(&self) -> String {
        self.buffer
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5004".parse().unwrap()
    }

    #[test]
    fn header_fields_roundtrip() {
        let pkt = Packet::with_header(Magic::Data, 0xDEAD_BEEF);
        assert_eq!(pkt.full_len(), HEADER_SIZE);
        assert_eq!(pkt.magic(), Some((Magic::Data, false)));
        assert_eq!(pkt.path_token(), Some(0xDEAD_BEEF));
        assert_eq!(pkt.data_len(), 0);
    }

    #[test]
    fn crazy_magic_rewrite() {
        let mut pkt = Packet::with_header(Magic::Syn, 1);
        pkt.set_magic(Magic::Syn, true);
        assert_eq!(pkt.magic(), Some((Magic::Syn, true)));
        pkt.set_magic(Magic::Syn, false);
        assert_eq!(pkt.magic(), Some((Magic::Syn, false)));
    }

    #[test]
    fn tail_push_pop() {
        let mut pkt = Packet::with_header(Magic::Data, 0);
        pkt.push_slice(b"abc");
        assert_eq!(pkt.data_len(), 3);
        assert_eq!(pkt.peek(), Some(b'c'));
        assert_eq!(pkt.pop(), Some(b'c'));
        assert_eq!(pkt.pop_tail(2).unwrap(), b"ab");
        assert_eq!(pkt.data_len(), 0);
        assert!(pkt.pop_tail(HEADER_SIZE + 1).is_none());
    }

    #[test]
    fn payload_split_tracks_tail() {
        let mut pkt = Packet::with_header(Magic::Data, 0);
        pkt.push_slice(b"payload");
        pkt.push_slice(b"TAGS");
        pkt.pop_tail(4);
        pkt.set_payload_split(7);
        assert_eq!(pkt.payload(), b"payload");
    }

    #[test]
    fn clone_is_independent() {
        let mut original = Packet::with_header(Magic::Data, 7);
        original.push_slice(b"data");
        original.set_src(addr());

        let mut copy = original.clone();
        copy.push_slice(b"more");
        copy.set_priority(1);

        assert_eq!(original.data_len(), 4);
        assert_eq!(copy.data_len(), 8);
        assert_eq!(original.priority(), 4);
    }

    #[test]
    fn clone_shell_drops_payload() {
        let mut pkt = Packet::with_header(Magic::Data, 9);
        pkt.push_slice(b"data");
        pkt.set_reliable(true);
        pkt.set_priority(2);

        let shell = pkt.clone_shell();
        assert_eq!(shell.full_len(), HEADER_SIZE);
        assert_eq!(shell.path_token(), Some(9));
        assert!(shell.is_reliable());
        assert_eq!(shell.priority(), 2);
    }

    #[test]
    fn priority_clamps_to_range() {
        let mut pkt = Packet::new();
        pkt.set_priority(0);
        assert_eq!(pkt.priority(), PRIORITY_HIGHEST);
        pkt.set_priority(200);
        assert_eq!(pkt.priority(), PRIORITY_LOWEST);
    }
}
