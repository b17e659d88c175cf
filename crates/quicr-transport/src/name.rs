//! # Short Names
//!
//! Hierarchical content identifiers. A short name is the five-tuple
//! `(resource, sender, source, media time, fragment)`; subscriptions match
//! on a prefix of the first three components, while `media_time` and
//! `fragment_id` only distinguish chunks within a stream.
//!
//! Lexicographic ordering over the tuple (the derived `Ord`) is used both
//! for retransmit bookkeeping and for forwarding-table keys.

use std::fmt;
use std::str::FromStr;

// ─── ShortName ──────────────────────────────────────────────────────────────

/// An 18-byte hierarchical chunk name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortName {
    /// Resource (stream/session) identifier.
    pub resource_id: u64,
    /// Publishing endpoint identifier.
    pub sender_id: u32,
    /// Media source within the sender (camera, mic, ...).
    pub source_id: u8,
    /// Media timeline position of the chunk.
    pub media_time: u32,
    /// Fragment number within the chunk; 0 = unfragmented / reassembled.
    pub fragment_id: u8,
}

/// Encoded size of a short name on the wire (excluding its tag byte).
pub const SHORT_NAME_WIRE_LEN: usize = 18;

impl ShortName {
    /// Name a whole resource (coarsest subscription prefix).
    pub fn resource(resource_id: u64) -> Self {
        ShortName {
            resource_id,
            ..Default::default()
        }
    }

    /// Name every source published by one sender within a resource.
    pub fn sender(resource_id: u64, sender_id: u32) -> Self {
        ShortName {
            resource_id,
            sender_id,
            ..Default::default()
        }
    }

    /// Name a single media source (finest subscription prefix).
    pub fn source(resource_id: u64, sender_id: u32, source_id: u8) -> Self {
        ShortName {
            resource_id,
            sender_id,
            source_id,
            ..Default::default()
        }
    }

    /// The name with `media_time` and `fragment_id` cleared. This is the
    /// form forwarding tables key on and fragment reassembly groups by.
    pub fn base(&self) -> Self {
        ShortName {
            resource_id: self.resource_id,
            sender_id: self.sender_id,
            source_id: self.source_id,
            media_time: 0,
            fragment_id: 0,
        }
    }

    /// The name with only `fragment_id` cleared (reassembly key for one
    /// chunk: all fragments share resource, sender, source and time).
    pub fn without_fragment(&self) -> Self {
        ShortName {
            fragment_id: 0,
            ..*self
        }
    }

    /// Subscription prefixes matching this name, coarsest first:
    /// `(resource)`, `(resource, sender)`, `(resource, sender, source)`.
    pub fn prefixes(&self) -> [ShortName; 3] {
        [
            ShortName::resource(self.resource_id),
            ShortName::sender(self.resource_id, self.sender_id),
            ShortName::source(self.resource_id, self.sender_id, self.source_id),
        ]
    }

    /// Whether `self`, taken as a subscription prefix, matches `name`.
    ///
    /// A zero `sender_id`/`source_id` acts as a wildcard for that level and
    /// everything below it; `media_time` and `fragment_id` never participate.
    pub fn matches(&self, name: &ShortName) -> bool {
        if self.resource_id != name.resource_id {
            return false;
        }
        if self.sender_id == 0 {
            return true;
        }
        if self.sender_id != name.sender_id {
            return false;
        }
        if self.source_id == 0 {
            return true;
        }
        self.source_id == name.source_id
    }
}

// ─── String form ────────────────────────────────────────────────────────────

/// Error parsing the `res/sender/source@time#frag` string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidShortName(pub String);

impl fmt::Display for InvalidShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid short name: {}", self.0)
    }
}

impl std::error::Error for InvalidShortName {}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}#{}",
            self.resource_id, self.sender_id, self.source_id, self.media_time, self.fragment_id
        )
    }
}

impl FromStr for ShortName {
    type Err = InvalidShortName;

    /// Parses `resourceID/senderID/sourceID` decimal, with optional
    /// `@mediaTime` and `#fragmentID` suffixes. Trailing fields may be
    /// omitted: `"12"`, `"12/7"`, `"12/7/3"`, `"12/7/3@100"` are all valid.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidShortName(s.to_string());

        let (rest, fragment_id) = match s.split_once('#') {
            Some((head, frag)) => (head, frag.parse::<u8>().map_err(|_| err())?),
            None => (s, 0),
        };
        let (path, media_time) = match rest.split_once('@') {
            Some((head, time)) => (head, time.parse::<u32>().map_err(|_| err())?),
            None => (rest, 0),
        };

        let mut parts = path.split('/');
        let resource_id = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(err)?
            .parse::<u64>()
            .map_err(|_| err())?;
        let sender_id = match parts.next() {
            Some(p) => p.parse::<u32>().map_err(|_| err())?,
            None => 0,
        };
        let source_id = match parts.next() {
            Some(p) => p.parse::<u8>().map_err(|_| err())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(err());
        }

        Ok(ShortName {
            resource_id,
            sender_id,
            source_id,
            media_time,
            fragment_id,
        })
    }
}
