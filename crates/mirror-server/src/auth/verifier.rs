//! Constant-time verification of presented tokens.

use mirror_core::{matches_digest, token_digest, TokenDigest};
use tracing::{debug, warn};

/// Accepts any of a fixed set of tokens. Only digests are kept in memory.
pub struct TokenVerifier {
    digests: Vec<TokenDigest>,
}

impl TokenVerifier {
    /// Build a verifier from plain tokens. Blank entries are ignored.
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let digests = tokens
            .into_iter()
            .filter(|t| !t.as_ref().trim().is_empty())
            .map(|t| token_digest(t.as_ref().trim()))
            .collect();
        Self { digests }
    }

    pub fn token_count(&self) -> usize {
        self.digests.len()
    }

    /// Check `token` presented by `source` (usually the peer address).
    pub fn verify(&self, token: &str, source: &str) -> bool {
        let token = token.trim();
        if token.is_empty() {
            warn!(source = %source, "request without token");
            return false;
        }
        // Compare against every digest so the time taken does not depend on
        // which token matched.
        let matched = self
            .digests
            .iter()
            .fold(false, |acc, digest| matches_digest(token, digest) | acc);
        if matched {
            debug!(source = %source, "token accepted");
        } else {
            warn!(source = %source, "invalid token");
        }
        matched
    }
}
