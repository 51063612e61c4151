//! Envelope digests for anti-entropy.
//!
//! Two replicas compare key → digest maps in `Status` messages and only ship
//! envelopes whose digests differ.

use crate::envelope::{DataEnvelope, EnvelopeData};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use tracing::warn;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Digest {
    /// Tombstone.
    Deleted,
    /// Not computed yet; resolved on first comparison.
    Lazy,
    /// The sender has no entry for the key.
    NotFound,
    Sha256([u8; 32]),
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Digest::Deleted => write!(f, "Deleted"),
            Digest::Lazy => write!(f, "Lazy"),
            Digest::NotFound => write!(f, "NotFound"),
            Digest::Sha256(bytes) => {
                write!(f, "Sha256(")?;
                for b in &bytes[..6] {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "..)")
            }
        }
    }
}

/// Hash of the envelope's data and pruning state. Delta versions are
/// excluded; they differ between replicas holding identical data.
pub fn digest(envelope: &DataEnvelope) -> Digest {
    if let EnvelopeData::Deleted = envelope.data {
        return Digest::Deleted;
    }
    hash_serialized(&(&envelope.data, &envelope.pruning))
}

/// An entry that cannot be serialized reports `NotFound`, so peers send
/// their copy instead of treating it as equal to another failure.
fn hash_serialized<T: Serialize>(value: &T) -> Digest {
    match serde_json::to_vec(value) {
        Ok(bytes) => Digest::Sha256(Sha256::digest(&bytes).into()),
        Err(err) => {
            warn!(error = %err, "failed to serialize envelope for digest");
            Digest::NotFound
        }
    }
}

/// Stable bucket of `key` among `total_chunks` status chunks.
pub fn chunk_of(key: &str, total_chunks: usize) -> usize {
    if total_chunks <= 1 {
        return 0;
    }
    let hash = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);
    (u64::from_be_bytes(prefix) % total_chunks as u64) as usize
}
