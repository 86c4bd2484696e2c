// Identity — fixed-width peer identifiers and the XOR metric used for routing

mod keys;

pub use keys::IdentityKeys;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Width of a peer identifier in bytes
pub const PEER_ID_LEN: usize = 32;

/// Number of distinct bucket indices (one per bit of the identifier)
pub const ID_BITS: usize = PEER_ID_LEN * 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("Invalid peer id length: expected {expected} hex chars, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("Invalid peer id encoding: {0}")]
    InvalidEncoding(String),
}

/// 256-bit peer identity.
///
/// Canonical text form is 64 lowercase hex chars. Identities are compared
/// byte-wise (big-endian), which is also the order used by the routing table
/// when it needs a deterministic tie-break.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn zero() -> Self {
        Self([0u8; PEER_ID_LEN])
    }

    /// Derive the identity of an Ed25519 public key (Blake3 of the key bytes)
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; PEER_ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance between two identities
    pub fn distance(&self, other: &PeerId) -> PeerId {
        let mut out = [0u8; PEER_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        PeerId(out)
    }

    /// Position of the highest set bit, counting from the least significant
    /// bit (0..=255). `None` for the all-zero identifier.
    pub fn highest_bit(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit_in_byte = 7 - byte.leading_zeros() as usize;
                return Some((PEER_ID_LEN - 1 - i) * 8 + bit_in_byte);
            }
        }
        None
    }

    /// Bucket index of `other` relative to `self`: the position of the
    /// highest differing bit. Identical identities have no bucket.
    pub fn bucket_index(&self, other: &PeerId) -> Option<usize> {
        self.distance(other).highest_bit()
    }

    /// Compare `a` and `b` by their XOR distance to `self`
    pub fn xor_cmp(&self, a: &PeerId, b: &PeerId) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }

    /// Flip a single bit (0 = least significant). Used to build identities
    /// that land in a chosen bucket.
    pub fn with_bit_flipped(&self, bit: usize) -> PeerId {
        let mut bytes = self.0;
        let byte_index = PEER_ID_LEN - 1 - (bit / 8);
        bytes[byte_index] ^= 1 << (bit % 8);
        PeerId(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        write!(f, "PeerId({}…)", &self.to_hex()[..12])
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != PEER_ID_LEN * 2 {
            return Err(IdentityError::InvalidLength {
                expected: PEER_ID_LEN * 2,
                actual: s.len(),
            });
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;
        Ok(PeerId(bytes))
    }
}

impl TryFrom<&str> for PeerId {
    type Error = IdentityError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
