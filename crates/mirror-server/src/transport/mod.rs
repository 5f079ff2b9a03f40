//! Adapters from network transports to the terminal relay.

pub mod websocket;
