use axum::extract::ws::Message as ClientMessage;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::Message as UpstreamMessage;

/// Largest frame accepted from either side.
pub const WS_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// An opaque payload relayed between a client and the upstream.
///
/// The relay never looks inside; it only remembers whether the frame was
/// sent as text or binary so the peer receives the same opcode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Data frame carried by a client message; control frames yield `None`.
    pub fn from_client(msg: ClientMessage) -> Option<Frame> {
        match msg {
            ClientMessage::Text(text) => Some(Frame::Text(text)),
            ClientMessage::Binary(bytes) => Some(Frame::Binary(bytes)),
            ClientMessage::Ping(_) | ClientMessage::Pong(_) | ClientMessage::Close(_) => None,
        }
    }

    /// Data frame carried by an upstream message; control frames yield `None`.
    pub fn from_upstream(msg: UpstreamMessage) -> Option<Frame> {
        match msg {
            UpstreamMessage::Text(text) => Some(Frame::Text(text)),
            UpstreamMessage::Binary(bytes) => Some(Frame::Binary(bytes)),
            UpstreamMessage::Ping(_)
            | UpstreamMessage::Pong(_)
            | UpstreamMessage::Close(_)
            | UpstreamMessage::Frame(_) => None,
        }
    }
}

impl From<Frame> for ClientMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => ClientMessage::Text(text),
            Frame::Binary(bytes) => ClientMessage::Binary(bytes),
        }
    }
}

impl From<Frame> for UpstreamMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => UpstreamMessage::Text(text),
            Frame::Binary(bytes) => UpstreamMessage::Binary(bytes),
        }
    }
}

/// The only structured message the relay itself ever sends to a client.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct ErrorPayload {
    pub error: String,
}

impl ErrorPayload {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    pub fn to_frame(&self) -> Frame {
        // A struct with a single string field always serializes.
        let text = serde_json::to_string(self)
            .unwrap_or_else(|_| String::from(r#"{"error":"internal error"}"#));
        Frame::Text(text)
    }

    /// Parse an error payload out of a text frame, if it is one.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match frame {
            Frame::Text(text) => serde_json::from_str(text).ok(),
            Frame::Binary(_) => None,
        }
    }
}
