//! # Wire Codec
//!
//! Suffix-tag encoding over a [`Packet`] buffer. Encoding appends a
//! message's fields and then its tag byte; decoding peeks the last byte,
//! dispatches on the tag code, and pops fields off the tail (fields
//! therefore decode in the reverse of encode order).
//!
//! Integers are **little-endian** on the wire — explicitly not network byte
//! order; hardware tracers depend on it and the byte order is contractual.
//!
//! Every tag is one byte on the wire. The registry value pairs the tag code
//! (high 8 bits) with the length of its fixed payload (low 8 bits, 255 for
//! variable-length messages, which carry their own internal lengths).

use std::fmt;

use crate::name::{ShortName, SHORT_NAME_WIRE_LEN};
use crate::packet::Packet;

// ─── Tag Registry ───────────────────────────────────────────────────────────

/// Variable-length marker in the registry's length byte.
const VAR_LEN: u32 = 255;

const fn tag_value(code: u32, len: u32) -> u32 {
    (code << 8) | len
}

/// Wire tag codes. See the table in the protocol description: codes 16-23
/// are framing magics chosen to multiplex cleanly with STUN/DTLS/RTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketTag {
    None = tag_value(0, 0),
    PubData = tag_value(1, VAR_LEN),
    ClientData = tag_value(2, 4),
    Ack = tag_value(3, 17),
    Sync = tag_value(4, VAR_LEN),
    ShortName = tag_value(5, 18),
    RelayRateReq = tag_value(6, 4),
    RelayData = tag_value(7, 8),
    Nack = tag_value(8, 4),
    SubscribeReq = tag_value(9, VAR_LEN),
    SyncAck = tag_value(10, VAR_LEN),
    RstRetry = tag_value(11, VAR_LEN),
    RstRedirect = tag_value(12, VAR_LEN),
    MagicData = tag_value(16, 0),
    MagicDataCrazy = tag_value(17, 0),
    MagicSyn = tag_value(18, 0),
    MagicSynCrazy = tag_value(19, 0),
    MagicSynAck = tag_value(20, 0),
    MagicSynAckCrazy = tag_value(21, 0),
    MagicRst = tag_value(22, 0),
    MagicRstCrazy = tag_value(23, 0),
    Bad = tag_value(16383, 0),
}

impl PacketTag {
    /// The tag code (high half of the registry value).
    pub fn code(self) -> u16 {
        ((self as u32) >> 8) as u16
    }

    /// Fixed payload length preceding the tag byte; `None` for
    /// variable-length messages.
    pub fn fixed_len(self) -> Option<u16> {
        match (self as u32) & 0xFF {
            VAR_LEN => None,
            len => Some(len as u16),
        }
    }

    /// The single byte written to the wire. All registered codes fit.
    pub fn wire_byte(self) -> u8 {
        debug_assert!(self.code() < 127, "tag codes above 126 are reserved");
        self.code() as u8
    }

    /// Decode a tag code; anything unregistered is [`PacketTag::Bad`].
    pub fn from_code(code: u16) -> PacketTag {
        match code {
            0 => PacketTag::None,
            1 => PacketTag::PubData,
            2 => PacketTag::ClientData,
            3 => PacketTag::Ack,
            4 => PacketTag::Sync,
            5 => PacketTag::ShortName,
            6 => PacketTag::RelayRateReq,
            7 => PacketTag::RelayData,
            8 => PacketTag::Nack,
            9 => PacketTag::SubscribeReq,
            10 => PacketTag::SyncAck,
            11 => PacketTag::RstRetry,
            12 => PacketTag::RstRedirect,
            16 => PacketTag::MagicData,
            17 => PacketTag::MagicDataCrazy,
            18 => PacketTag::MagicSyn,
            19 => PacketTag::MagicSynCrazy,
            20 => PacketTag::MagicSynAck,
            21 => PacketTag::MagicSynAckCrazy,
            22 => PacketTag::MagicRst,
            23 => PacketTag::MagicRstCrazy,
            _ => PacketTag::Bad,
        }
    }
}

impl fmt::Display for PacketTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ─── Framing Magic ──────────────────────────────────────────────────────────

/// Top-level framing kind carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Data,
    Syn,
    SynAck,
    Rst,
}

impl Magic {
    /// The tag for this kind, normal or "crazy" alternate.
    pub fn tag(self, crazy: bool) -> PacketTag {
        match (self, crazy) {
            (Magic::Data, false) => PacketTag::MagicData,
            (Magic::Data, true) => PacketTag::MagicDataCrazy,
            (Magic::Syn, false) => PacketTag::MagicSyn,
            (Magic::Syn, true) => PacketTag::MagicSynCrazy,
            (Magic::SynAck, false) => PacketTag::MagicSynAck,
            (Magic::SynAck, true) => PacketTag::MagicSynAckCrazy,
            (Magic::Rst, false) => PacketTag::MagicRst,
            (Magic::Rst, true) => PacketTag::MagicRstCrazy,
        }
    }

    /// Classify a magic tag; `None` for non-magic tags.
    pub fn from_tag(tag: PacketTag) -> Option<(Magic, bool)> {
        match tag {
            PacketTag::MagicData => Some((Magic::Data, false)),
            PacketTag::MagicDataCrazy => Some((Magic::Data, true)),
            PacketTag::MagicSyn => Some((Magic::Syn, false)),
            PacketTag::MagicSynCrazy => Some((Magic::Syn, true)),
            PacketTag::MagicSynAck => Some((Magic::SynAck, false)),
            PacketTag::MagicSynAckCrazy => Some((Magic::SynAck, true)),
            PacketTag::MagicRst => Some((Magic::Rst, false)),
            PacketTag::MagicRstCrazy => Some((Magic::Rst, true)),
            _ => None,
        }
    }
}

// ─── Variable-Length Integers ───────────────────────────────────────────────

/// A variable-length unsigned integer, 1/2/4/8 bytes wide for values below
/// 2^7 / 2^14 / 2^29 / 2^61. The tail-most byte carries the width marker in
/// its top bits (`0…` / `10…` / `110…` / `111…`); values at or above 2^61
/// are invalid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UintVar(u64);

impl UintVar {
    /// Largest representable value: 2^61 - 1.
    pub const MAX: u64 = (1u64 << 61) - 1;

    /// Create a `UintVar`, `None` if the value needs 61 bits or more.
    pub fn new(val: u64) -> Option<Self> {
        (val <= Self::MAX).then_some(UintVar(val))
    }

    /// Create a `UintVar`, panicking on out-of-range values.
    pub fn from_u64(val: u64) -> Self {
        Self::new(val).expect("UintVar value exceeds 61-bit limit")
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Number of bytes this value encodes to.
    pub fn encoded_len(self) -> usize {
        if self.0 < (1 << 7) {
            1
        } else if self.0 < (1 << 14) {
            2
        } else if self.0 < (1 << 29) {
            4
        } else {
            8
        }
    }
}

impl fmt::Display for UintVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for UintVar {
    fn from(v: u32) -> Self {
        UintVar(v as u64)
    }
}

impl From<u16> for UintVar {
    fn from(v: u16) -> Self {
        UintVar(v as u64)
    }
}

// ─── Scalar Tail Codec ──────────────────────────────────────────────────────

impl Packet {
    pub fn push_u8(&mut self, val: u8) {
        self.push(val);
    }

    pub fn push_u16(&mut self, val: u16) {
        self.push_slice(&val.to_le_bytes());
    }

    pub fn push_u32(&mut self, val: u32) {
        self.push_slice(&val.to_le_bytes());
    }

    pub fn push_u64(&mut self, val: u64) {
        self.push_slice(&val.to_le_bytes());
    }

    pub fn pop_u8(&mut self) -> Option<u8> {
        self.pop()
    }

    pub fn pop_u16(&mut self) -> Option<u16> {
        let bytes = self.pop_tail(2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn pop_u32(&mut self) -> Option<u32> {
        let bytes = self.pop_tail(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn pop_u64(&mut self) -> Option<u64> {
        let bytes = self.pop_tail(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes);
        Some(u64::from_le_bytes(arr))
    }

    /// Append a byte vector with its one-byte length (max 255 bytes).
    pub fn push_vec(&mut self, val: &[u8]) -> bool {
        if val.len() > 255 {
            return false;
        }
        self.push_slice(val);
        self.push(val.len() as u8);
        true
    }

    pub fn pop_vec(&mut self) -> Option<Vec<u8>> {
        let len = self.pop()? as usize;
        self.pop_tail(len)
    }

    /// Append a string with its one-byte length (max 255 bytes).
    pub fn push_str(&mut self, val: &str) -> bool {
        self.push_vec(val.as_bytes())
    }

    pub fn pop_str(&mut self) -> Option<String> {
        let bytes = self.pop_vec()?;
        String::from_utf8(bytes).ok()
    }

    pub fn push_var(&mut self, val: UintVar) {
        let v = val.value();
        match val.encoded_len() {
            1 => self.push((v & 0x7F) as u8),
            2 => {
                self.push((v & 0xFF) as u8);
                self.push((((v >> 8) & 0x3F) as u8) | 0x80);
            }
            4 => {
                self.push((v & 0xFF) as u8);
                self.push(((v >> 8) & 0xFF) as u8);
                self.push(((v >> 16) & 0xFF) as u8);
                self.push((((v >> 24) & 0x1F) as u8) | 0xC0);
            }
            _ => {
                for shift in (0..56).step_by(8) {
                    self.push(((v >> shift) & 0xFF) as u8);
                }
                self.push((((v >> 56) & 0x1F) as u8) | 0xE0);
            }
        }
    }

    pub fn pop_var(&mut self) -> Option<UintVar> {
        let marker = self.peek()?;
        if marker & 0x80 == 0 {
            let b = self.pop()?;
            Some(UintVar((b & 0x7F) as u64))
        } else if marker & 0xC0 == 0x80 {
            let hi = self.pop()?;
            let lo = self.pop()?;
            Some(UintVar((((hi & 0x3F) as u64) << 8) | lo as u64))
        } else if marker & 0xE0 == 0xC0 {
            let b3 = self.pop()?;
            let b2 = self.pop()?;
            let b1 = self.pop()?;
            let b0 = self.pop()?;
            Some(UintVar(
                (((b3 & 0x1F) as u64) << 24)
                    | ((b2 as u64) << 16)
                    | ((b1 as u64) << 8)
                    | b0 as u64,
            ))
        } else {
            let top = self.pop()?;
            let mut val = ((top & 0x1F) as u64) << 56;
            for shift in [48u32, 40, 32, 24, 16, 8, 0] {
                val |= (self.pop()? as u64) << shift;
            }
            Some(UintVar(val))
        }
    }

    // ─── Tags ───────────────────────────────────────────────────────────

    pub fn push_tag(&mut self, tag: PacketTag) {
        self.push(tag.wire_byte());
    }

    /// Peek the outermost tag without consuming it. An empty buffer decodes
    /// as [`PacketTag::None`].
    pub fn next_tag(&self) -> PacketTag {
        match self.peek() {
            Some(byte) => PacketTag::from_code(byte as u16),
            None => PacketTag::None,
        }
    }

    pub fn pop_tag(&mut self) -> PacketTag {
        match self.pop() {
            Some(byte) => PacketTag::from_code(byte as u16),
            None => PacketTag::None,
        }
    }

    /// Pop the outermost tag if it matches, otherwise leave the buffer
    /// untouched and return `false`.
    pub fn pop_expected(&mut self, tag: PacketTag) -> bool {
        if self.next_tag() == tag {
            self.pop();
            true
        } else {
            false
        }
    }

    // ─── Short names ────────────────────────────────────────────────────

    /// Append the 18-byte short name and its tag.
    pub fn push_name(&mut self, name: &ShortName) {
        let start = self.full_len();
        self.push_u8(name.fragment_id);
        self.push_u32(name.media_time);
        self.push_u8(name.source_id);
        self.push_u32(name.sender_id);
        self.push_u64(name.resource_id);
        debug_assert_eq!(self.full_len() - start, SHORT_NAME_WIRE_LEN);
        self.push_tag(PacketTag::ShortName);
    }

    pub fn pop_name(&mut self) -> Option<ShortName> {
        if !self.pop_expected(PacketTag::ShortName) {
            return None;
        }
        let resource_id = self.pop_u64()?;
        let sender_id = self.pop_u32()?;
        let source_id = self.pop_u8()?;
        let media_time = self.pop_u32()?;
        let fragment_id = self.pop_u8()?;
        Some(ShortName {
            resource_id,
            sender_id,
            source_id,
            media_time,
            fragment_id,
        })
    }
}

// ─── Protocol Messages ──────────────────────────────────────────────────────

/// Client handshake request. The cookie is zero on first contact and echoes
/// the relay's retry cookie afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetSyncReq {
    pub cookie: u64,
    pub origin: String,
    pub sender_id: u32,
    pub client_time_ms: u64,
    pub supported_features: u64,
}

impl NetSyncReq {
    pub fn encode(&self, p: &mut Packet) {
        p.push_var(UintVar::from_u64(self.supported_features));
        p.push_u64(self.client_time_ms);
        p.push_u32(self.sender_id);
        p.push_str(&self.origin);
        p.push_u64(self.cookie);
        p.push_tag(PacketTag::Sync);
    }

    pub fn decode(p: &mut Packet) -> Option<Self> {
        if !p.pop_expected(PacketTag::Sync) {
            return None;
        }
        let cookie = p.pop_u64()?;
        let origin = p.pop_str()?;
        let sender_id = p.pop_u32()?;
        let client_time_ms = p.pop_u64()?;
        let supported_features = p.pop_var()?.value();
        Some(NetSyncReq {
            cookie,
            origin,
            sender_id,
            client_time_ms,
            supported_features,
        })
    }
}

/// Relay handshake acceptance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetSyncAck {
    pub server_time_ms: u64,
    pub use_features: u64,
}

impl NetSyncAck {
    pub fn encode(&self, p: &mut Packet) {
        p.push_var(UintVar::from_u64(self.use_features));
        p.push_u64(self.server_time_ms);
        p.push_tag(PacketTag::SyncAck);
    }

    pub fn decode(p: &mut Packet) -> Option<Self> {
        if !p.pop_expected(PacketTag::SyncAck) {
            return None;
        }
        let server_time_ms = p.pop_u64()?;
        let use_features = p.pop_var()?.value();
        Some(NetSyncAck {
            server_time_ms,
            use_features,
        })
    }
}

/// Relay's cookie challenge: resend the SYNC carrying this cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetRstRetry {
    pub cookie: u64,
}

impl NetRstRetry {
    pub fn encode(&self, p: &mut Packet) {
        p.push_u64(self.cookie);
        p.push_tag(PacketTag::RstRetry);
    }

    pub fn decode(p: &mut Packet) -> Option<Self> {
        if !p.pop_expected(PacketTag::RstRetry) {
            return None;
        }
        Some(NetRstRetry {
            cookie: p.pop_u64()?,
        })
    }
}

/// Relay's redirect: re-point the transport and resend the SYNC with the
/// cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetRstRedirect {
    pub cookie: u64,
    pub origin: String,
    pub port: u16,
}

impl NetRstRedirect {
    pub fn encode(&self, p: &mut Packet) {
        p.push_u16(self.port);
        p.push_str(&self.origin);
        p.push_u64(self.cookie);
        p.push_tag(PacketTag::RstRedirect);
    }

    pub fn decode(p: &mut Packet) -> Option<Self> {
        if !p.pop_expected(PacketTag::RstRedirect) {
            return None;
        }
        let cookie = p.pop_u64()?;
        let origin = p.pop_str()?;
        let port = p.pop_u16()?;
        Some(NetRstRedirect {
            cookie,
            origin,
            port,
        })
    }
}

/// Relay acknowledgement of one client sequence number. `ack_vec`/`ecn_vec`
/// are carried for future selective-ack use and are zero today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetAck {
    pub recv_time_us: u32,
    pub client_seq_num: u32,
    pub ack_vec: u64,
    pub ecn_vec: u8,
}

impl NetAck {
    pub fn encode(&self, p: &mut Packet) {
        p.push_u8(self.ecn_vec);
        p.push_u64(self.ack_vec);
        p.push_u32(self.client_seq_num);
        p.push_u32(self.recv_time_us);
        p.push_tag(PacketTag::Ack);
    }

    pub fn decode(p: &mut Packet) -> Option<Self> {
        if !p.pop_expected(PacketTag::Ack) {
            return None;
        }
        let recv_time_us = p.pop_u32()?;
        let client_seq_num = p.pop_u32()?;
        let ack_vec = p.pop_u64()?;
        let ecn_vec = p.pop_u8()?;
        Some(NetAck {
            recv_time_us,
            client_seq_num,
            ack_vec,
            ecn_vec,
        })
    }
}

/// Downstream loss report naming a missing relay sequence number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetNack {
    pub relay_seq_num: u32,
}

impl NetNack {
    pub fn encode(&self, p: &mut Packet) {
        p.push_u32(self.relay_seq_num);
        p.push_tag(PacketTag::Nack);
    }

    pub fn decode(p: &mut Packet) -> Option<Self> {
        if !p.pop_expected(PacketTag::Nack) {
            return None;
        }
        Some(NetNack {
            relay_seq_num: p.pop_u32()?,
        })
    }
}

/// Client sequence number attached by the pacer to every upstream packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientData {
    pub client_seq_num: u32,
}

impl ClientData {
    pub fn encode(&self, p: &mut Packet) {
        p.push_u32(self.client_seq_num);
        p.push_tag(PacketTag::ClientData);
    }

    pub fn decode(p: &mut Packet) -> Option<Self> {
        if !p.pop_expected(PacketTag::ClientData) {
            return None;
        }
        Some(ClientData {
            client_seq_num: p.pop_u32()?,
        })
    }
}

/// Relay sequence number and send timestamp attached to every forwarded
/// copy; the subscriber's rate controller feeds on these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayData {
    pub relay_seq_num: u32,
    pub remote_send_time_us: u32,
}

impl RelayData {
    pub fn encode(&self, p: &mut Packet) {
        p.push_u32(self.remote_send_time_us);
        p.push_u32(self.relay_seq_num);
        p.push_tag(PacketTag::RelayData);
    }

    pub fn decode(p: &mut Packet) -> Option<Self> {
        if !p.pop_expected(PacketTag::RelayData) {
            return None;
        }
        let relay_seq_num = p.pop_u32()?;
        let remote_send_time_us = p.pop_u32()?;
        Some(RelayData {
            relay_seq_num,
            remote_send_time_us,
        })
    }
}

/// Downstream bandwidth target requested from the relay, in kbit/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetRateReq {
    pub bitrate_kbps: u32,
}

impl NetRateReq {
    pub fn encode(&self, p: &mut Packet) {
        p.push_u32(self.bitrate_kbps);
        p.push_tag(PacketTag::RelayRateReq);
    }

    pub fn decode(p: &mut Packet) -> Option<Self> {
        if !p.pop_expected(PacketTag::RelayRateReq) {
            return None;
        }
        Some(NetRateReq {
            bitrate_kbps: p.pop_u32()?,
        })
    }
}

/// Subscription request for a name prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeReq {
    pub name: ShortName,
}

impl SubscribeReq {
    pub fn encode(&self, p: &mut Packet) {
        p.push_name(&self.name);
        p.push_tag(PacketTag::SubscribeReq);
    }

    pub fn decode(p: &mut Packet) -> Option<Self> {
        if !p.pop_expected(PacketTag::SubscribeReq) {
            return None;
        }
        Some(SubscribeReq {
            name: p.pop_name()?,
        })
    }
}

/// Published chunk descriptor: the chunk name plus the payload length so a
/// receiver can split payload from framing after popping the tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PubData {
    pub name: ShortName,
    pub payload_len: u16,
}

impl PubData {
    pub fn encode(&self, p: &mut Packet) {
        p.push_u16(self.payload_len);
        p.push_name(&self.name);
        p.push_tag(PacketTag::PubData);
    }

    pub fn decode(p: &mut Packet) -> Option<Self> {
        if !p.pop_expected(PacketTag::PubData) {
            return None;
        }
        let name = p.pop_name()?;
        let payload_len = p.pop_u16()?;
        Some(PubData { name, payload_len })
    }

    /// Decode without mutating the packet. The relay uses this on the
    /// publish path so the stored buffer stays byte-stable across fan-out.
    pub fn peek(p: &Packet) -> Option<Self> {
        let mut reader = TailReader::new(p);
        if reader.take_tag()? != PacketTag::PubData {
            return None;
        }
        if reader.take_tag()? != PacketTag::ShortName {
            return None;
        }
        let resource_id = reader.take_u64()?;
        let sender_id = reader.take_u32()?;
        let source_id = reader.take_u8()?;
        let media_time = reader.take_u32()?;
        let fragment_id = reader.take_u8()?;
        let payload_len = reader.take_u16()?;
        Some(PubData {
            name: ShortName {
                resource_id,
                sender_id,
                source_id,
                media_time,
                fragment_id,
            },
            payload_len,
        })
    }
}

// ─── Non-Destructive Tail Reader ────────────────────────────────────────────

/// Cursor reading a packet's suffix tags from the tail without popping
/// them. Mirrors the destructive `pop_*` accessors.
pub struct TailReader<'a> {
    buf: &'a [u8],
    /// One past the last unread byte.
    end: usize,
}

impl<'a> TailReader<'a> {
    pub fn new(packet: &'a Packet) -> Self {
        let buf = packet.as_bytes();
        TailReader {
            buf,
            end: buf.len(),
        }
    }

    /// Unread bytes remaining ahead of (below) the cursor.
    pub fn remaining(&self) -> usize {
        self.end
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if len > self.end {
            return None;
        }
        self.end -= len;
        Some(&self.buf[self.end..self.end + len])
    }

    pub fn take_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn take_u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn take_u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn take_u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(b);
            u64::from_le_bytes(arr)
        })
    }

    pub fn take_tag(&mut self) -> Option<PacketTag> {
        self.take_u8().map(|b| PacketTag::from_code(b as u16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn scratch() -> Packet {
        Packet::with_header(Magic::Data, 0x55AA_55AA)
    }

    // ─── Scalars ────────────────────────────────────────────────────────

    #[test]
    fn scalar_roundtrip() {
        let mut p = scratch();
        p.push_u8(0xAB);
        p.push_u16(0x1234);
        p.push_u32(0xDEAD_BEEF);
        p.push_u64(0x0123_4567_89AB_CDEF);

        assert_eq!(p.pop_u64(), Some(0x0123_4567_89AB_CDEF));
        assert_eq!(p.pop_u32(), Some(0xDEAD_BEEF));
        assert_eq!(p.pop_u16(), Some(0x1234));
        assert_eq!(p.pop_u8(), Some(0xAB));
    }

    #[test]
    fn scalars_are_little_endian() {
        let mut p = Packet::new();
        p.push_u32(0x0403_0201);
        assert_eq!(p.as_bytes(), &[0x01, 0x02, 0x03, 0x04]);
        let mut p = Packet::new();
        p.push_u16(0xBBAA);
        assert_eq!(p.as_bytes(), &[0xAA, 0xBB]);
    }

    #[test]
    fn string_and_vec_roundtrip() {
        let mut p = scratch();
        assert!(p.push_str("This is a string with : , * () + - !"));
        assert!(p.push_vec(&[1, 2, 3, 4, 5, 0xA]));

        assert_eq!(p.pop_vec(), Some(vec![1, 2, 3, 4, 5, 0xA]));
        assert_eq!(
            p.pop_str().as_deref(),
            Some("This is a string with : , * () + - !")
        );
    }

    #[test]
    fn oversized_string_rejected() {
        let mut p = scratch();
        let long = "x".repeat(256);
        assert!(!p.push_str(&long));
        assert_eq!(p.data_len(), 0);
    }

    // ─── Varints ────────────────────────────────────────────────────────

    #[test]
    fn varint_widths_at_boundaries() {
        let cases: &[(u64, usize)] = &[
            (0, 1),
            ((1 << 7) - 1, 1),
            (1 << 7, 2),
            ((1 << 14) - 1, 2),
            (1 << 14, 4),
            ((1 << 29) - 1, 4),
            (1 << 29, 8),
            (UintVar::MAX, 8),
        ];
        for &(val, width) in cases {
            let v = UintVar::from_u64(val);
            assert_eq!(v.encoded_len(), width, "width for {val}");
            let mut p = Packet::new();
            p.push_var(v);
            assert_eq!(p.full_len(), width, "encoded bytes for {val}");
            assert_eq!(p.pop_var(), Some(v), "roundtrip for {val}");
        }
    }

    #[test]
    fn varint_rejects_61_bit_and_up() {
        assert!(UintVar::new(UintVar::MAX).is_some());
        assert!(UintVar::new(UintVar::MAX + 1).is_none());
        assert!(UintVar::new(u64::MAX).is_none());
    }

    #[test]
    fn varint_stacked_roundtrip() {
        let vals = [3u64, 300, 70_000, 5_000_000_000];
        let mut p = scratch();
        for &v in &vals {
            p.push_var(UintVar::from_u64(v));
        }
        for &v in vals.iter().rev() {
            assert_eq!(p.pop_var().map(UintVar::value), Some(v));
        }
    }

    // ─── Tags ───────────────────────────────────────────────────────────

    #[test]
    fn tag_codes_match_registry() {
        assert_eq!(PacketTag::None.code(), 0);
        assert_eq!(PacketTag::PubData.code(), 1);
        assert_eq!(PacketTag::ClientData.code(), 2);
        assert_eq!(PacketTag::Ack.code(), 3);
        assert_eq!(PacketTag::ShortName.code(), 5);
        assert_eq!(PacketTag::RelayData.code(), 7);
        assert_eq!(PacketTag::MagicData.code(), 16);
        assert_eq!(PacketTag::MagicRstCrazy.code(), 23);
        assert_eq!(PacketTag::Bad.code(), 16383);
    }

    #[test]
    fn tag_fixed_lengths() {
        assert_eq!(PacketTag::None.fixed_len(), Some(0));
        assert_eq!(PacketTag::ClientData.fixed_len(), Some(4));
        assert_eq!(PacketTag::Ack.fixed_len(), Some(17));
        assert_eq!(PacketTag::ShortName.fixed_len(), Some(18));
        assert_eq!(PacketTag::RelayData.fixed_len(), Some(8));
        assert_eq!(PacketTag::Sync.fixed_len(), None);
        assert_eq!(PacketTag::PubData.fixed_len(), None);
    }

    #[test]
    fn unknown_code_decodes_as_bad() {
        assert_eq!(PacketTag::from_code(13), PacketTag::Bad);
        assert_eq!(PacketTag::from_code(99), PacketTag::Bad);
        let mut p = Packet::new();
        p.push(99);
        assert_eq!(p.next_tag(), PacketTag::Bad);
    }

    #[test]
    fn pop_expected_leaves_mismatches_alone() {
        let mut p = scratch();
        p.push_tag(PacketTag::Ack);
        assert!(!p.pop_expected(PacketTag::Sync));
        assert_eq!(p.next_tag(), PacketTag::Ack);
        assert!(p.pop_expected(PacketTag::Ack));
    }

    #[test]
    fn ack_wire_length_matches_registry() {
        let mut p = Packet::new();
        NetAck::default().encode(&mut p);
        // fields + one tag byte
        assert_eq!(p.full_len(), 17 + 1);
    }

    // ─── Short names ────────────────────────────────────────────────────

    #[test]
    fn short_name_roundtrip() {
        let name = ShortName {
            resource_id: 0xAA,
            sender_id: 0xBB,
            source_id: 0xCC,
            media_time: 0xDD,
            fragment_id: 0xEE,
        };
        let mut p = scratch();
        p.push_name(&name);
        assert_eq!(p.data_len(), SHORT_NAME_WIRE_LEN + 1);
        assert_eq!(p.pop_name(), Some(name));
    }

    // ─── Protocol messages ──────────────────────────────────────────────

    #[test]
    fn sync_req_roundtrip() {
        let req = NetSyncReq {
            cookie: 0xC001E,
            origin: "example.com".into(),
            sender_id: 0x1234,
            client_time_ms: 0xA1B1_C1D1,
            supported_features: 0xABCD,
        };
        let mut p = scratch();
        req.encode(&mut p);
        assert_eq!(NetSyncReq::decode(&mut p), Some(req));
    }

    #[test]
    fn sync_ack_roundtrip() {
        let ack = NetSyncAck {
            server_time_ms: 0x2222,
            use_features: 0x1111,
        };
        let mut p = scratch();
        ack.encode(&mut p);
        assert_eq!(NetSyncAck::decode(&mut p), Some(ack));
    }

    #[test]
    fn rst_retry_roundtrip() {
        let retry = NetRstRetry { cookie: 0x1234 };
        let mut p = scratch();
        retry.encode(&mut p);
        assert_eq!(NetRstRetry::decode(&mut p), Some(retry));
    }

    #[test]
    fn rst_redirect_roundtrip() {
        let redirect = NetRstRedirect {
            cookie: 0x1234,
            origin: "example.com".into(),
            port: 0x1000,
        };
        let mut p = scratch();
        redirect.encode(&mut p);
        assert_eq!(NetRstRedirect::decode(&mut p), Some(redirect));
    }

    #[test]
    fn ack_roundtrip() {
        let ack = NetAck {
            recv_time_us: 0x2000,
            client_seq_num: 0x1000,
            ack_vec: 0x4,
            ecn_vec: 0x1,
        };
        let mut p = scratch();
        ack.encode(&mut p);
        assert_eq!(NetAck::decode(&mut p), Some(ack));
    }

    #[test]
    fn nack_roundtrip() {
        let nack = NetNack {
            relay_seq_num: 77,
        };
        let mut p = scratch();
        nack.encode(&mut p);
        assert_eq!(NetNack::decode(&mut p), Some(nack));
    }

    #[test]
    fn client_data_roundtrip() {
        let data = ClientData {
            client_seq_num: 0x1000,
        };
        let mut p = scratch();
        data.encode(&mut p);
        assert_eq!(ClientData::decode(&mut p), Some(data));
    }

    #[test]
    fn relay_data_roundtrip() {
        let data = RelayData {
            relay_seq_num: 0x1000,
            remote_send_time_us: 42,
        };
        let mut p = scratch();
        data.encode(&mut p);
        assert_eq!(RelayData::decode(&mut p), Some(data));
    }

    #[test]
    fn rate_req_roundtrip() {
        let req = NetRateReq { bitrate_kbps: 500 };
        let mut p = scratch();
        req.encode(&mut p);
        assert_eq!(NetRateReq::decode(&mut p), Some(req));
    }

    #[test]
    fn subscribe_req_roundtrip() {
        let req = SubscribeReq {
            name: ShortName::source(1, 2, 3),
        };
        let mut p = scratch();
        req.encode(&mut p);
        assert_eq!(SubscribeReq::decode(&mut p), Some(req));
    }

    #[test]
    fn pub_data_roundtrip() {
        let data = PubData {
            name: ShortName {
                resource_id: 1,
                sender_id: 2,
                source_id: 3,
                media_time: 90,
                fragment_id: 0,
            },
            payload_len: 1200,
        };
        let mut p = scratch();
        p.push_slice(&[0u8; 16]);
        data.encode(&mut p);
        assert_eq!(PubData::decode(&mut p), Some(data));
        assert_eq!(p.data_len(), 16);
    }

    #[test]
    fn pub_data_peek_is_non_destructive() {
        let data = PubData {
            name: ShortName::source(9, 8, 7),
            payload_len: 512,
        };
        let mut p = scratch();
        p.push_slice(b"payload");
        data.encode(&mut p);

        let before = p.full_len();
        assert_eq!(PubData::peek(&p), Some(data));
        assert_eq!(p.full_len(), before, "peek must not consume bytes");
        // Destructive decode still works afterwards.
        assert_eq!(PubData::decode(&mut p), Some(data));
    }

    #[test]
    fn truncated_message_decode_fails() {
        let mut p = Packet::new();
        p.push_tag(PacketTag::Ack);
        assert!(NetAck::decode(&mut p).is_none());
    }
}
