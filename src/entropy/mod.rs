//! Entropy sources for winner selection.
//!
//! None of these sources are cryptographically secure. [`BlockEntropy`] mixes
//! block metadata with the contract address, which no single caller controls
//! at call time but which a block producer could bias. That is acceptable for
//! small stakes only.

use rand::{rngs::StdRng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};

use crate::ledger::AccountId;

/// Supplies the 32-byte seed mixed into each draw.
pub trait EntropySource {
    fn entropy(&mut self) -> [u8; 32];
}

impl<T: EntropySource + ?Sized> EntropySource for &mut T {
    fn entropy(&mut self) -> [u8; 32] {
        (**self).entropy()
    }
}

/// Chain-derived entropy: parent block hash, height, timestamp and the
/// address of the contract performing the draw.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockEntropy {
    pub parent_hash: [u8; 32],
    pub height: u64,
    pub timestamp: u64,
    pub contract: AccountId,
}

impl EntropySource for BlockEntropy {
    fn entropy(&mut self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"block-entropy");
        hasher.update(self.parent_hash);
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.contract.as_bytes());
        hasher.finalize().into()
    }
}

/// Returns the same seed on every call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedEntropy(pub [u8; 32]);

impl EntropySource for FixedEntropy {
    fn entropy(&mut self) -> [u8; 32] {
        self.0
    }
}

/// Reproducible stream of seeds derived from a `u64`.
#[derive(Clone, Debug)]
pub struct SeededEntropy {
    rng: StdRng,
}

impl SeededEntropy {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl EntropySource for SeededEntropy {
    fn entropy(&mut self) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.rng.fill_bytes(&mut out);
        out
    }
}

/// Hash of the seed and the whole participant sequence, so the same seed
/// gives unrelated draws for different entrant lists.
pub fn draw_digest(seed: &[u8; 32], participants: &[AccountId]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"lottery-draw");
    hasher.update(seed);
    hasher.update((participants.len() as u64).to_le_bytes());
    for participant in participants {
        hasher.update((participant.len() as u64).to_le_bytes());
        hasher.update(participant.as_bytes());
    }
    hasher.finalize().into()
}

/// Picks an index into `participants`, uniform over the array. Returns
/// `None` for an empty sequence.
pub fn draw_index(seed: &[u8; 32], participants: &[AccountId]) -> Option<usize> {
    if participants.is_empty() {
        return None;
    }
    let digest = draw_digest(seed, participants);
    Some(reduce_be(&digest, participants.len() as u128) as usize)
}

// digest read as a big-endian 256-bit integer, reduced mod `modulus` exactly
fn reduce_be(digest: &[u8; 32], modulus: u128) -> u128 {
    digest
        .iter()
        .fold(0u128, |acc, byte| (acc * 256 + *byte as u128) % modulus)
}
