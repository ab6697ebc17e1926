//! Deterministic proof computation.
//!
//! Uses HMAC-SHA256 keyed by the operator's private key to produce a proof that
//! is deterministic (same seed = same proof) but unpredictable without the key.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::ledger::Address;

type HmacSha256 = Hmac<Sha256>;

/// Seed for a randomness request: `<consumer>-<request_id>`.
pub fn request_seed(consumer: &Address, request_id: u64) -> String {
    format!("{consumer}-{request_id}")
}

/// Compute the base64-encoded proof over `seed`.
///
/// ```text
/// proof = base64(HMAC-SHA256(private_key, seed))
/// ```
pub fn generate_proof(seed: &str, private_key: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(private_key).expect("HMAC accepts keys of any size");
    mac.update(seed.as_bytes());
    let bytes = mac.finalize().into_bytes();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
