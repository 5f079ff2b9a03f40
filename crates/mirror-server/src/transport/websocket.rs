//! WebSocket framing for terminal sessions.
//!
//! Terminal output goes out as text frames. Client text and binary frames
//! are both written to the shell verbatim; a close frame ends the session.

use crate::session::Inbound;
use axum::extract::ws::{Message, WebSocket};
use futures_util::future::{ready, Ready};
use futures_util::{Sink, SinkExt, Stream, StreamExt};

/// Maximum accepted client frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Split an upgraded socket into the halves the relay expects.
pub fn split(
    socket: WebSocket,
) -> (
    impl Sink<String, Error = axum::Error> + Unpin,
    impl Stream<Item = Result<Inbound, axum::Error>> + Unpin,
) {
    let (tx, rx) = socket.split();
    let sink = tx.with(|text: String| -> Ready<Result<Message, axum::Error>> {
        ready(Ok(Message::Text(text)))
    });
    let stream = rx.filter_map(|message| {
        ready(match message {
            Ok(message) => to_inbound(message).map(Ok),
            Err(e) => Some(Err(e)),
        })
    });
    (sink, stream)
}

/// Map a client frame to relay input. Control frames that carry no
/// terminal data map to `None`.
pub fn to_inbound(message: Message) -> Option<Inbound> {
    match message {
        Message::Text(text) => Some(Inbound::Data(text.into_bytes())),
        Message::Binary(data) => Some(Inbound::Data(data)),
        Message::Close(_) => Some(Inbound::Close),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}
