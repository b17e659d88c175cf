//! # Fragmentation Stage
//!
//! Splits oversized chunks into MTU-sized sub-packets and reassembles them
//! on the far side. Fragments carry `fragment_id = (index << 1) | last`
//! with indexes starting at 1; a reassembled (or never-fragmented) chunk
//! surfaces with `fragment_id = 0`. All fragments of a chunk share the
//! other four name components, so reassembly keys on the name with the
//! fragment field cleared.
//!
//! This stage also owns writing the `pubData` suffix block (name + payload
//! length) since it is the last point where the per-packet payload length
//! is known, and popping it on receive.

use std::collections::BTreeMap;
use std::time::Duration;

use quanta::Instant;
use tracing::{trace, warn};

use crate::name::ShortName;
use crate::packet::Packet;
use crate::pipeline::{Stage, StackUpdate};
use crate::wire::PubData;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Bytes reserved out of the MTU for framing: the 6-byte header plus the
/// suffix blocks appended below this stage (pubData, clientData, relayData)
/// with margin.
pub const FRAGMENT_OVERHEAD: usize = 64;

/// Highest usable fragment index: the index shares a u8 with the
/// last-flag, and the top value (0xFF) is reserved for parity packets.
const MAX_FRAGMENTS: usize = 0x7E;

fn encode_fragment_id(index: usize, last: bool) -> u8 {
    ((index as u8) << 1) | last as u8
}

fn decode_fragment_id(id: u8) -> (u8, bool) {
    (id >> 1, id & 1 == 1)
}

// ─── Reassembly State ───────────────────────────────────────────────────────

struct PartialChunk {
    fragments: BTreeMap<u8, Vec<u8>>,
    last_index: Option<u8>,
    started: Instant,
    shell: Packet,
}

// ─── Stage ──────────────────────────────────────────────────────────────────

pub struct FragmentStage {
    mtu: usize,
    /// Incomplete assemblies age out after roughly one round trip.
    timeout: Duration,
    partial: BTreeMap<ShortName, PartialChunk>,
    fragments_sent: u64,
    chunks_reassembled: u64,
    timeouts: u64,
    bad_packets: u64,
}

impl FragmentStage {
    pub fn new(mtu: u16) -> Self {
        FragmentStage {
            mtu: mtu as usize,
            timeout: Duration::from_millis(50),
            partial: BTreeMap::new(),
            fragments_sent: 0,
            chunks_reassembled: 0,
            timeouts: 0,
            bad_packets: 0,
        }
    }

    /// Largest payload that still fits one packet.
    pub fn max_payload(&self) -> usize {
        self.mtu.saturating_sub(FRAGMENT_OVERHEAD).max(1)
    }

    pub fn fragments_sent(&self) -> u64 {
        self.fragments_sent
    }

    pub fn chunks_reassembled(&self) -> u64 {
        self.chunks_reassembled
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    pub fn bad_packets(&self) -> u64 {
        self.bad_packets
    }

    /// Incomplete assemblies currently held (test hook).
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    fn assemble(&mut self, key: ShortName) -> Option<Packet> {
        let ready = {
            let chunk = self.partial.get(&key)?;
            let last = chunk.last_index?;
            (1..=last).all(|i| chunk.fragments.contains_key(&i))
        };
        if !ready {
            return None;
        }

        let chunk = self.partial.remove(&key)?;
        let mut out = chunk.shell;
        for (_, data) in chunk.fragments {
            out.push_slice(&data);
        }
        out.set_name(key);
        self.chunks_reassembled += 1;
        trace!(name = %key, len = out.data_len(), "chunk reassembled");
        Some(out)
    }
}

impl Stage for FragmentStage {
    fn label(&self) -> &'static str {
        "fragment"
    }

    fn send(&mut self, mut packet: Packet) -> Vec<Packet> {
        let max = self.max_payload();
        let len = packet.data_len();

        if len <= max {
            let mut name = packet.name();
            name.fragment_id = 0;
            packet.set_name(name);
            PubData {
                name,
                payload_len: len as u16,
            }
            .encode(&mut packet);
            return vec![packet];
        }

        let count = len.div_ceil(max);
        if count > MAX_FRAGMENTS {
            warn!(len, max, "chunk too large to fragment, dropping");
            self.bad_packets += 1;
            return Vec::new();
        }

        let payload = packet.payload().to_vec();
        let mut out = Vec::with_capacity(count);
        for (i, piece) in payload.chunks(max).enumerate() {
            let index = i + 1;
            let mut fragment = packet.clone_shell();
            fragment.push_slice(piece);

            let mut name = packet.name();
            name.fragment_id = encode_fragment_id(index, index == count);
            fragment.set_name(name);

            PubData {
                name,
                payload_len: piece.len() as u16,
            }
            .encode(&mut fragment);

            self.fragments_sent += 1;
            out.push(fragment);
        }
        trace!(name = %packet.name(), count, "chunk fragmented");
        out
    }

    fn recv(&mut self, mut packet: Packet) -> Option<Packet> {
        let Some(pd) = PubData::decode(&mut packet) else {
            self.bad_packets += 1;
            warn!(tag = %packet.next_tag(), "expected pubData block, dropping");
            return None;
        };
        if pd.payload_len as usize > packet.data_len() {
            self.bad_packets += 1;
            warn!(
                declared = pd.payload_len,
                have = packet.data_len(),
                "pubData length overruns buffer, dropping"
            );
            return None;
        }

        packet.set_payload_split(pd.payload_len as usize);
        packet.set_name(pd.name);

        if pd.name.fragment_id == 0 {
            return Some(packet);
        }

        let (index, last) = decode_fragment_id(pd.name.fragment_id);
        if index == 0 {
            self.bad_packets += 1;
            return None;
        }

        let key = pd.name.without_fragment();
        let entry = self.partial.entry(key).or_insert_with(|| PartialChunk {
            fragments: BTreeMap::new(),
            last_index: None,
            started: Instant::now(),
            shell: packet.clone_shell(),
        });
        entry.fragments.insert(index, packet.payload().to_vec());
        if last {
            entry.last_index = Some(index);
        }

        self.assemble(key)
    }

    fn on_update(&mut self, update: &StackUpdate) {
        match *update {
            StackUpdate::Mtu { mtu, .. } => self.mtu = mtu as usize,
            StackUpdate::Rtt { big_ms, .. } => {
                self.timeout = Duration::from_millis(big_ms.max(1) as u64)
            }
            _ => {}
        }
    }

    fn on_tick(&mut self, now: Instant) -> Vec<Packet> {
        let timeout = self.timeout;
        let before = self.partial.len();
        self.partial
            .retain(|_, chunk| now.duration_since(chunk.started) < timeout);
        let dropped = before - self.partial.len();
        if dropped > 0 {
            self.timeouts += dropped as u64;
            trace!(dropped, "incomplete reassemblies timed out");
        }
        Vec::new()
    }
}
