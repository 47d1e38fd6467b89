//! Identifiers and distance metrics for the overlay address space.
//!
//! Two address forms coexist:
//!
//! - [`Address`]: the opaque identity a peer presents on the wire, typically
//!   a public-key hash. Variable width, compared byte-for-byte.
//! - [`KademliaAddress`]: the fixed 160-bit identifier obtained by hashing an
//!   [`Address`] through SHA-1. All distance math happens in this space.
//!
//! The hash step lives behind the [`AddressHasher`] trait so tests can place
//! peers in specific buckets with a transparent hasher while production uses
//! [`Sha1AddressHasher`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

/// Width of the Kademlia identifier space in bits (SHA-1 digest width).
pub const KADEMLIA_ID_BITS: usize = 160;

/// Width of the Kademlia identifier space in bytes.
pub const KADEMLIA_ID_BYTES: usize = KADEMLIA_ID_BITS / 8;

// ============================================================================
// Raw peer identity
// ============================================================================

/// Opaque identity of a peer as presented on the wire.
///
/// The table never interprets the contents; it only compares, indexes, and
/// hashes them. Serialized as a hex string so it can key JSON maps in the
/// persisted peer cache.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(Vec<u8>);

impl Address {
    /// Wrap raw identity bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True for a zero-length identity.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short hex preview of the identity, suitable for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(8)])
    }
}

impl From<Vec<u8>> for Address {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Address {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({}…)", self.short())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

// ============================================================================
// Endpoint URIs
// ============================================================================

/// Canonical reachable endpoint of a peer, `scheme://host:port`.
///
/// Stored verbatim; the accessors parse lazily. IPv6 hosts keep their
/// brackets (`tcp://[::1]:9000`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn authority(&self) -> Option<(&str, &str)> {
        self.0.split_once("://")
    }

    /// The scheme portion, if the URI is well formed.
    pub fn scheme(&self) -> Option<&str> {
        self.authority().map(|(scheme, _)| scheme)
    }

    /// The host portion, brackets included for IPv6 literals.
    pub fn host(&self) -> Option<&str> {
        let (_, rest) = self.authority()?;
        if rest.starts_with('[') {
            rest.find(']').map(|end| &rest[..=end])
        } else {
            Some(rest.rsplit_once(':').map_or(rest, |(host, _)| host))
        }
    }

    /// The port portion, if present and numeric.
    pub fn port(&self) -> Option<u16> {
        let (_, rest) = self.authority()?;
        let tail = if rest.starts_with('[') {
            &rest[rest.find(']')? + 1..]
        } else {
            rest
        };
        let (_, port) = tail.rsplit_once(':')?;
        port.parse().ok()
    }

    /// The same endpoint with its port rewritten. Returns the URI unchanged
    /// when it cannot be parsed.
    pub fn with_port(&self, port: u16) -> Uri {
        match (self.scheme(), self.host()) {
            (Some(scheme), Some(host)) => Uri(format!("{scheme}://{host}:{port}")),
            _ => self.clone(),
        }
    }
}

impl From<&str> for Uri {
    fn from(uri: &str) -> Self {
        Self(uri.to_owned())
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Network scope tag
// ============================================================================

/// Opaque tag identifying which overlay network a table belongs to.
///
/// Rendered as four ASCII characters in log output, e.g. `MAIN` or `TEST`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(u32);

impl NetworkId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn from_tag(tag: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(tag))
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.to_be_bytes() {
            let ch = if byte.is_ascii_graphic() { byte as char } else { '?' };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Kademlia identifiers
// ============================================================================

/// A 160-bit identifier in the Kademlia address space.
///
/// Derived from an [`Address`] via an [`AddressHasher`]; all routing distance
/// math operates on this form.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct KademliaAddress([u8; KADEMLIA_ID_BYTES]);

impl KademliaAddress {
    pub const fn from_bytes(bytes: [u8; KADEMLIA_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; KADEMLIA_ID_BYTES] {
        &self.0
    }

    /// XOR distance to another identifier.
    ///
    /// # Properties
    /// - `a.distance(a) == [0; 20]` (reflexive)
    /// - `a.distance(b) == b.distance(a)` (symmetric)
    pub fn distance(&self, other: &KademliaAddress) -> [u8; KADEMLIA_ID_BYTES] {
        let mut out = [0u8; KADEMLIA_ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Logarithmic distance class: the position of the highest set bit of the
    /// XOR distance, counted from the least significant bit.
    ///
    /// An identifier differing only in the top bit is in class 159; one
    /// differing only in the bottom bit is in class 0. Equal identifiers map
    /// to [`KADEMLIA_ID_BITS`], the "self" class.
    pub fn log_id(&self, other: &KademliaAddress) -> u64 {
        let dist = self.distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                let high_bit = 7 - byte.leading_zeros() as usize;
                return ((KADEMLIA_ID_BYTES - 1 - byte_idx) * 8 + high_bit) as u64;
            }
        }
        KADEMLIA_ID_BITS as u64
    }

    /// Hamming distance class: the popcount of the XOR distance, in
    /// `[0, 160]`.
    pub fn hamming_id(&self, other: &KademliaAddress) -> u64 {
        self.distance(other)
            .iter()
            .map(|byte| u64::from(byte.count_ones()))
            .sum()
    }
}

impl fmt::Display for KademliaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KademliaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KademliaAddress({})", hex::encode(&self.0[..8]))
    }
}

/// Compare two XOR distances lexicographically.
///
/// Returns `Ordering::Less` if `a` represents a smaller distance.
pub(crate) fn distance_cmp(
    a: &[u8; KADEMLIA_ID_BYTES],
    b: &[u8; KADEMLIA_ID_BYTES],
) -> std::cmp::Ordering {
    a.cmp(b)
}

// ============================================================================
// Address hashing
// ============================================================================

/// Maps a wire [`Address`] to its [`KademliaAddress`].
///
/// Abstracted so tests can pin peers to chosen buckets; production tables use
/// [`Sha1AddressHasher`].
pub trait AddressHasher: Send + Sync {
    fn hash(&self, address: &Address) -> KademliaAddress;
}

/// The production hasher: SHA-1 of the raw identity bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha1AddressHasher;

impl AddressHasher for Sha1AddressHasher {
    fn hash(&self, address: &Address) -> KademliaAddress {
        let mut hasher = Sha1::new();
        hasher.update(address.as_bytes());
        let digest = hasher.finalize();

        let mut out = [0u8; KADEMLIA_ID_BYTES];
        out.copy_from_slice(&digest);
        KademliaAddress(out)
    }
}
