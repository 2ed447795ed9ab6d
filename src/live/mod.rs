//! Realtime session with the multimodal live service
//!
//! This module owns the WebSocket protocol, the inbound audio accumulator and
//! the session loop that drives turn-taking and playback.
//!
//! # Architecture
//!
//! ```text
//! LiveClient (handle) ──commands──▶ session loop ──frames──▶ writer task ──▶ WebSocket
//!        ▲                              │  ▲
//!        │ watch / broadcast            │  └── reader task ◀── WebSocket
//!        └──────────────────────────────┤
//!                                       ├─▶ TurnState reducer
//!                                       └─▶ AudioAccumulator ─flush─▶ PlaybackSession
//! ```
//!
//! # Failure Strategy
//!
//! - Connect and handshake failures are returned to the caller; nothing is retried here
//! - Malformed inbound frames are logged and dropped
//! - Sends while disconnected are logged and dropped
//! - Transport close/error always tears the whole session down

mod accumulator;
mod client;
pub mod protocol;
mod session;
mod transport;

pub use accumulator::AudioAccumulator;
pub use client::LiveClient;
pub use protocol::{ClientMessage, MediaChunk, Part, ServerMessage, SessionConfig};
pub use session::SessionOptions;
pub use transport::{Connector, TransportEvent, TransportHandle, WsConnector};

/// Lifecycle of the transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Errors surfaced by `connect()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// No `setupComplete` within the handshake window
    Timeout,
    /// Socket could not be opened or failed before setup completed
    Transport(String),
    /// No API credential configured
    Unauthenticated,
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Timeout => write!(f, "Timed out waiting for session setup"),
            ConnectError::Transport(e) => write!(f, "Transport error: {}", e),
            ConnectError::Unauthenticated => {
                write!(
                    f,
                    "API key not configured. Set GEMINI_API_KEY environment variable."
                )
            }
        }
    }
}

impl std::error::Error for ConnectError {}

/// Inbound frame could not be understood (non-fatal)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    MalformedMessage(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::MalformedMessage(e) => write!(f, "Malformed message: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Outbound message dropped (non-fatal)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    NotConnected,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::NotConnected => write!(f, "Not connected to the live service"),
        }
    }
}

impl std::error::Error for SendError {}
