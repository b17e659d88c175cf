//! # Forwarding Information Base
//!
//! Maps short-name prefixes to subscriber faces. Subscriptions are stored
//! under their base name (media time and fragment cleared — the FIB never
//! keys on either); lookup walks the three prefix levels of the published
//! name, coarsest first, and concatenates the matches. A face appears at
//! most once per prefix, so re-subscribing is idempotent.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use tracing::debug;

use quicr_transport::ShortName;

/// A subscriber as the relay sees it: the UDP address copies are sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub face: SocketAddr,
}

#[derive(Debug, Default)]
pub struct Fib {
    entries: BTreeMap<ShortName, Vec<SubscriberInfo>>,
}

impl Fib {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. Returns false when the face was already
    /// subscribed at this prefix (the insert is coalesced).
    pub fn add_subscription(&mut self, name: ShortName, subscriber: SubscriberInfo) -> bool {
        let key = name.base();
        let faces = self.entries.entry(key).or_default();
        if faces.contains(&subscriber) {
            return false;
        }
        debug!(name = %key, face = %subscriber.face, "subscription added");
        faces.push(subscriber);
        true
    }

    /// Remove one face's subscription at one prefix.
    pub fn remove_subscription(&mut self, name: ShortName, face: SocketAddr) {
        let key = name.base();
        if let Some(faces) = self.entries.get_mut(&key) {
            faces.retain(|s| s.face != face);
            if faces.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    /// Drop every subscription held by a face (connection teardown).
    pub fn remove_face(&mut self, face: SocketAddr) {
        self.entries.retain(|_, faces| {
            faces.retain(|s| s.face != face);
            !faces.is_empty()
        });
    }

    /// All subscribers matching a published name, walking `(resource)`,
    /// `(resource, sender)`, `(resource, sender, source)`. A face
    /// subscribed at several levels is returned once per level, matching
    /// one delivery per subscription.
    pub fn lookup(&self, name: &ShortName) -> Vec<SubscriberInfo> {
        let mut result = Vec::new();
        if name.resource_id == 0 {
            return result;
        }

        let mut probe = |key: ShortName| {
            if let Some(faces) = self.entries.get(&key) {
                result.extend_from_slice(faces);
            }
        };

        probe(ShortName::resource(name.resource_id));
        if name.sender_id != 0 {
            probe(ShortName::sender(name.resource_id, name.sender_id));
        }
        if name.source_id != 0 {
            probe(ShortName::source(
                name.resource_id,
                name.sender_id,
                name.source_id,
            ));
        }
        result
    }

    /// Number of distinct prefixes with at least one subscriber.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribers registered at exactly this prefix (test hook).
    pub fn subscribers_at(&self, name: ShortName) -> usize {
        self.entries.get(&name.base()).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:4444").parse().unwrap()
    }

    fn sub(last: u8) -> SubscriberInfo {
        SubscriberInfo { face: face(last) }
    }

    fn published(resource: u64, sender: u32, source: u8) -> ShortName {
        let mut name = ShortName::source(resource, sender, source);
        name.media_time = 1234;
        name.fragment_id = 3;
        name
    }

    #[test]
    fn lookup_walks_all_three_prefix_levels() {
        let mut fib = Fib::new();
        fib.add_subscription(ShortName::resource(100), sub(1));
        fib.add_subscription(ShortName::sender(100, 7), sub(2));
        fib.add_subscription(ShortName::source(100, 7, 3), sub(3));

        let matches = fib.lookup(&published(100, 7, 3));
        assert_eq!(matches.len(), 3);
        assert!(matches.contains(&sub(1)));
        assert!(matches.contains(&sub(2)));
        assert!(matches.contains(&sub(3)));
    }

    #[test]
    fn narrower_publication_skips_unrelated_prefixes() {
        let mut fib = Fib::new();
        fib.add_subscription(ShortName::sender(100, 7), sub(1));
        fib.add_subscription(ShortName::sender(100, 8), sub(2));

        let matches = fib.lookup(&published(100, 7, 1));
        assert_eq!(matches, vec![sub(1)]);
    }

    #[test]
    fn media_time_and_fragment_never_key() {
        let mut fib = Fib::new();
        let mut noisy = ShortName::source(5, 6, 7);
        noisy.media_time = 999;
        noisy.fragment_id = 9;
        fib.add_subscription(noisy, sub(1));

        // Any chunk under (5,6,7) matches, regardless of time/fragment.
        assert_eq!(fib.lookup(&published(5, 6, 7)).len(), 1);
    }

    #[test]
    fn duplicate_insert_is_coalesced() {
        let mut fib = Fib::new();
        assert!(fib.add_subscription(ShortName::resource(1), sub(1)));
        assert!(!fib.add_subscription(ShortName::resource(1), sub(1)));
        assert_eq!(fib.subscribers_at(ShortName::resource(1)), 1);
    }

    #[test]
    fn same_face_at_two_prefixes_gets_two_copies() {
        let mut fib = Fib::new();
        fib.add_subscription(ShortName::resource(100), sub(1));
        fib.add_subscription(ShortName::sender(100, 7), sub(1));
        assert_eq!(fib.lookup(&published(100, 7, 3)).len(), 2);
    }

    #[test]
    fn ordered_names_share_prefix_matches_iff_common() {
        let mut fib = Fib::new();
        fib.add_subscription(ShortName::sender(100, 7), sub(1));

        let a = published(100, 7, 3);
        let b = published(100, 9, 1);
        assert!(a <= b);
        // The (100,7) prefix is not a common prefix of a and b: it must
        // match only a.
        assert_eq!(fib.lookup(&a).len(), 1);
        assert_eq!(fib.lookup(&b).len(), 0);

        fib.add_subscription(ShortName::resource(100), sub(2));
        // (100) is a common prefix: both match.
        assert_eq!(fib.lookup(&a).len(), 2);
        assert_eq!(fib.lookup(&b).len(), 1);
    }

    #[test]
    fn remove_subscription_and_face() {
        let mut fib = Fib::new();
        fib.add_subscription(ShortName::resource(1), sub(1));
        fib.add_subscription(ShortName::resource(2), sub(1));
        fib.add_subscription(ShortName::resource(1), sub(2));

        fib.remove_subscription(ShortName::resource(1), face(1));
        assert_eq!(fib.subscribers_at(ShortName::resource(1)), 1);

        fib.remove_face(face(1));
        assert_eq!(fib.subscribers_at(ShortName::resource(2)), 0);
        assert_eq!(fib.len(), 1);
    }

    #[test]
    fn zero_resource_matches_nothing() {
        let mut fib = Fib::new();
        fib.add_subscription(ShortName::resource(1), sub(1));
        assert!(fib.lookup(&ShortName::default()).is_empty());
    }
}
