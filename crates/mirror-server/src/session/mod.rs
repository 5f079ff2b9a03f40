//! Terminal sessions: PTY processes, the duplex relay, per-connection
//! lifecycle and the registry of live sessions.

pub mod lifecycle;
pub mod pty;
pub mod registry;
pub mod relay;

#[cfg(test)]
pub(crate) mod testing;

pub use lifecycle::{SessionController, TerminalSettings};
pub use pty::{ProcessSpawner, PtySpawner, ShellCommand};
pub use registry::SessionRegistry;
pub use relay::Inbound;
