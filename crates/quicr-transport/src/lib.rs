//! # quicr-transport
//!
//! QuicR pure-Rust media transport: UDP publish/subscribe of named data
//! chunks through a relay, built for interactive audio/video.
//!
//! The crate is organised around a layered packet pipeline with a
//! suffix-tag wire codec at the bottom and a paced, loss-signalling client
//! engine on top.
//!
//! ## Crate structure
//!
//! - [`name`] — hierarchical short names and prefix matching
//! - [`packet`] — the packet buffer and its sidecar metadata
//! - [`wire`] — suffix-tag codec: varints, tag registry, protocol messages
//! - [`pipeline`] — the stage contract and the client stage stack
//! - [`priority`] — ten-class send queues and the receive FIFO
//! - [`retransmit`] — name-keyed reliability for flagged packets
//! - [`fragment`] — MTU splitting and reassembly
//! - [`fec`] — XOR parity generation (interface with pass-through recovery)
//! - [`subscribe`] — subscription tracking and reconnect replay
//! - [`encrypt`] — AEAD seam binding payloads to their names
//! - [`connection`] — cookie handshake state machine
//! - [`rate`] — phase/cycle rate controller (AIMD with probing)
//! - [`filters`] — fake-loss and crazy-bit diagnostic filters
//! - [`transport`] — the UDP seam plus an in-memory network for tests
//! - [`stats`] — counter snapshots
//! - [`client`] — the public client facade

pub mod client;
pub mod connection;
pub mod encrypt;
pub mod fec;
pub mod filters;
pub mod fragment;
pub mod name;
mod pacer;
pub mod packet;
pub mod pipeline;
pub mod priority;
pub mod rate;
pub mod retransmit;
pub mod stats;
pub mod subscribe;
pub mod transport;
pub mod wire;

pub use client::{ClientConfig, QuicrClient};
pub use name::ShortName;
pub use packet::Packet;
pub use pacer::MicroClock;
