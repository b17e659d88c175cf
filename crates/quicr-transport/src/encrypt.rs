//! # Encryption Stage
//!
//! End-to-end authenticated encryption of chunk payloads. The cipher
//! itself is an external collaborator behind the [`Aead`] trait; this stage
//! owns the epoch bookkeeping, derives a deterministic nonce from the chunk
//! name, and binds the name into the ciphertext as associated data so a
//! relay cannot splice payloads between names.
//!
//! Open failures are dropped and logged, never surfaced to the application.

use tracing::warn;

use crate::name::ShortName;
use crate::packet::Packet;
use crate::pipeline::Stage;

// ─── AEAD Contract ──────────────────────────────────────────────────────────

/// Authenticated encryption primitive. Implementations live outside this
/// crate; [`NullAead`] is the default stand-in until a key is installed.
pub trait Aead: Send {
    /// Install the secret for an epoch.
    fn set_key(&mut self, epoch: u64, secret: &[u8]);

    /// Seal `plaintext`; the result replaces the packet payload.
    fn seal(&self, epoch: u64, nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Vec<u8>;

    /// Open `ciphertext`; `None` means authentication failed.
    fn open(&self, epoch: u64, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>>;
}

/// Identity cipher: no confidentiality, no integrity. Keeps the pipeline
/// shape intact when no key has been provisioned.
#[derive(Debug, Default)]
pub struct NullAead;

impl Aead for NullAead {
    fn set_key(&mut self, _epoch: u64, _secret: &[u8]) {}

    fn seal(&self, _epoch: u64, _nonce: &[u8], _aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        plaintext.to_vec()
    }

    fn open(&self, _epoch: u64, _nonce: &[u8], _aad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        Some(ciphertext.to_vec())
    }
}

// ─── Nonce / AAD Derivation ─────────────────────────────────────────────────

/// 96-bit nonce from the chunk name. Chunks are sealed before fragmentation
/// so `fragment_id` never participates; the remaining components make the
/// nonce unique per chunk within an epoch.
fn nonce_from(name: &ShortName) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0..4].copy_from_slice(&name.media_time.to_le_bytes());
    nonce[4..8].copy_from_slice(&name.sender_id.to_le_bytes());
    nonce[8] = name.source_id;
    nonce[9..12].copy_from_slice(&name.resource_id.to_le_bytes()[0..3]);
    nonce
}

/// The wire form of the name, bound as associated data.
fn aad_from(name: &ShortName) -> [u8; 18] {
    let mut aad = [0u8; 18];
    aad[0] = name.fragment_id;
    aad[1..5].copy_from_slice(&name.media_time.to_le_bytes());
    aad[5] = name.source_id;
    aad[6..10].copy_from_slice(&name.sender_id.to_le_bytes());
    aad[10..18].copy_from_slice(&name.resource_id.to_le_bytes());
    aad
}

// ─── Stage ──────────────────────────────────────────────────────────────────

/// The pipeline stage wrapping an [`Aead`].
pub struct EncryptStage {
    aead: Box<dyn Aead>,
    epoch: u64,
    failures: u64,
}

impl EncryptStage {
    pub fn new() -> Self {
        EncryptStage {
            aead: Box::new(NullAead),
            epoch: 0,
            failures: 0,
        }
    }

    pub fn set_key(&mut self, epoch: u64, secret: &[u8]) {
        self.epoch = epoch;
        self.aead.set_key(epoch, secret);
    }

    pub fn set_aead(&mut self, aead: Box<dyn Aead>) {
        self.aead = aead;
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

impl Default for EncryptStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for EncryptStage {
    fn label(&self) -> &'static str {
        "encrypt"
    }

    fn send(&mut self, mut packet: Packet) -> Vec<Packet> {
        let name = packet.name();
        let sealed = self.aead.seal(
            self.epoch,
            &nonce_from(&name),
            &aad_from(&name),
            packet.payload(),
        );
        packet.clear_data();
        packet.push_slice(&sealed);
        vec![packet]
    }

    fn recv(&mut self, mut packet: Packet) -> Option<Packet> {
        let name = packet.name();
        match self.aead.open(
            self.epoch,
            &nonce_from(&name),
            &aad_from(&name),
            packet.payload(),
        ) {
            Some(plaintext) => {
                packet.clear_data();
                packet.push_slice(&plaintext);
                Some(packet)
            }
            None => {
                self.failures += 1;
                warn!(name = %name, "AEAD open failed, dropping chunk");
                None
            }
        }
    }
}
