//! Remote input: mouse actions and their rate limits.

pub mod mouse;
pub mod rate_limit;

pub use mouse::{MouseDispatcher, MouseSettings};
