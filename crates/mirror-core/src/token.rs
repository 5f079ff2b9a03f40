//! Shared-secret access tokens.
//!
//! Tokens are compared through their SHA-256 digests so that the comparison
//! runs over equal-length inputs in constant time, regardless of what the
//! client sent.

use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// SHA-256 digest of a token.
pub type TokenDigest = [u8; 32];

/// Hash a token for later comparison.
pub fn token_digest(token: &str) -> TokenDigest {
    Sha256::digest(token.as_bytes()).into()
}

/// Compare a presented token against a stored digest in constant time.
pub fn matches_digest(presented: &str, expected: &TokenDigest) -> bool {
    let digest = token_digest(presented);
    digest.ct_eq(expected).into()
}

/// Generate a random access token (32 bytes, hex-encoded).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
