//! Content hashing.
//!
//! Every content-derived key in the swarm (question sub-keys, gossip message ids, tie-break ranks)
//! is a SHA-256 digest rendered as lowercase hex.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::common::RoundStage;

/// A SHA-256 digest.
///
/// Keys derived from it differ from MD5-based keys, so stores shared with MD5-keyed peers are not
/// interoperable.
///
/// The derived ordering compares the digests as 256 bit big-endian integers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hashes the given data.
    pub fn digest(data: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(data.as_ref()).into())
    }

    /// Gets the digest as a byte array.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Gets the lowercase hex encoding of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// The sub-key under which a peer stores its output for a question.
pub fn question_hash(question: &str) -> String {
    ContentHash::digest(question).to_hex()
}

/// The id of a gossip message. Identical inputs always produce the same id.
pub fn gossip_id(peer_id: &str, round_stage: RoundStage, question: &str) -> String {
    ContentHash::digest(format!(
        "{}_{}_{}_{}",
        peer_id, round_stage.round, round_stage.stage, question
    ))
    .to_hex()
}
