//! Shared-secret token authentication for the HTTP and WebSocket API.

pub mod extract;
pub mod verifier;

pub use extract::Authorized;
pub use verifier::TokenVerifier;
