//! mirror-core: Shared library for mobilemirror.
//!
//! Provides the JSON message types of the HTTP API, the service error type,
//! and constant-time access-token comparison.

pub mod error;
pub mod messages;
pub mod token;

// Re-export commonly used items at crate root.
pub use error::{MirrorError, MirrorResult};
pub use token::{generate_token, matches_digest, token_digest, TokenDigest};
