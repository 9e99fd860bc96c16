//! Hashcash-style proof of work binding an offer id to the maker's address.
//!
//! ```text
//! hash = SHA256("offer/pow" || offer_id || maker_address || nonce)
//! ```
//!
//! A proof with difficulty `d` has a hash with at least `d` leading zero bits.

use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::offer::payload::OfferId;
use crate::ports::{BoxFuture, ProofOfWorkMinter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfWork {
    pub nonce: u64,
    /// Difficulty the proof was minted for, in leading zero bits.
    pub difficulty: u8,
    /// Wall-clock minting time. Informational, not hashed.
    pub duration_ms: u64,
}

impl ProofOfWork {
    /// Whether the proof's hash meets its own declared difficulty.
    pub fn verify(&self, offer_id: &OfferId, maker_address: &str) -> bool {
        leading_zero_bits(&pow_hash(offer_id, maker_address, self.nonce)) >= u32::from(self.difficulty)
    }

    /// Whether the proof is valid for `offer_id` under a `required` difficulty.
    pub fn satisfies(&self, offer_id: &OfferId, maker_address: &str, required: u8) -> bool {
        self.difficulty >= required && self.verify(offer_id, maker_address)
    }
}

pub fn pow_hash(offer_id: &OfferId, maker_address: &str, nonce: u64) -> [u8; 32] {
    let id = offer_id.to_string();
    let mut h = Sha256::new();
    h.update(b"offer/pow");
    h.update((id.len() as u32).to_be_bytes());
    h.update(id.as_bytes());
    h.update((maker_address.len() as u32).to_be_bytes());
    h.update(maker_address.as_bytes());
    h.update(nonce.to_be_bytes());
    h.finalize().into()
}

pub fn leading_zero_bits(hash: &[u8; 32]) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Search nonces in parallel until one meets `difficulty`. CPU-bound; call
/// from a blocking thread.
pub fn mint(offer_id: &OfferId, maker_address: &str, difficulty: u8) -> Result<ProofOfWork, String> {
    if u32::from(difficulty) > 256 - 8 {
        return Err(format!("difficulty {difficulty} is not mintable"));
    }
    let started = Instant::now();
    let target = u32::from(difficulty);
    let nonce = (0..u64::MAX)
        .into_par_iter()
        .find_any(|nonce| leading_zero_bits(&pow_hash(offer_id, maker_address, *nonce)) >= target)
        .ok_or_else(|| format!("nonce space exhausted at difficulty {difficulty}"))?;
    let duration_ms = started.elapsed().as_millis() as u64;
    log::debug!("pow: minted {offer_id} at difficulty {difficulty} in {duration_ms}ms");
    Ok(ProofOfWork {
        nonce,
        difficulty,
        duration_ms,
    })
}

/// Default minter: runs [`mint`] on tokio's blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashCashMinter;

impl ProofOfWorkMinter for HashCashMinter {
    fn mint(
        &self,
        offer_id: OfferId,
        maker_address: String,
        difficulty: u8,
    ) -> BoxFuture<'static, Result<ProofOfWork, String>> {
        Box::pin(async move {
            tokio::task::spawn_blocking(move || mint(&offer_id, &maker_address, difficulty))
                .await
                .map_err(|e| format!("mint task: {e}"))?
        })
    }
}
