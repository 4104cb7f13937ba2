//! Conversion between WebSocket frames and protocol lines.
//!
//! Text and binary frames both carry UTF-8 protocol lines; fragmented
//! messages are reassembled by the transport layer before they reach this
//! module, so a single decode path covers every payload shape.

use tokio_tungstenite::tungstenite::{Bytes, Message};

/// A decoded inbound frame the session state machine cares about.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One relayed protocol line (without trailing newline)
    Line(String),
    /// Liveness response to an outstanding probe
    Pong,
}

/// Decode a WebSocket message into an [`Inbound`] event.
///
/// Returns `None` for frames the bridge does not relay: ping frames (the
/// transport answers them automatically), close frames (surfaced by the
/// read loop as a connection-closed event) and binary payloads that are
/// not valid UTF-8.
#[must_use]
pub fn decode(message: &Message) -> Option<Inbound> {
    match message {
        Message::Text(text) => Some(Inbound::Line(text.as_str().to_owned())),
        Message::Binary(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Some(Inbound::Line(text.to_owned())),
            Err(e) => {
                tracing::warn!(len = bytes.len(), error = %e, "Dropping non-UTF-8 binary frame");
                None
            }
        },
        Message::Pong(_) => Some(Inbound::Pong),
        _ => None,
    }
}

/// Encode one outbound protocol line as a text frame.
#[must_use]
pub fn line(text: &str) -> Message {
    Message::Text(text.into())
}

/// Encode a liveness probe as a native ping control frame.
#[must_use]
pub fn ping() -> Message {
    Message::Ping(Bytes::new())
}
