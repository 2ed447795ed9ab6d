//! Cloneable handle to a live session
//!
//! Every call becomes a command on one FIFO channel, so outbound messages
//! reach the transport in call order. Fire-and-forget calls (`send`,
//! `send_realtime_input`, ...) never fail; problems are logged by the
//! session loop.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::protocol::{MediaChunk, Part, ServerMessage, SessionConfig};
use super::session::{Channels, Command, Session, SessionOptions};
use super::transport::{Connector, WsConnector};
use super::{ConnectError, ConnectionState};
use crate::audio::playback::AudioOutput;
use crate::state_machine::TurnState;

/// Buffered content messages per subscriber before it starts lagging
const CONTENT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct LiveClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionState>,
    volume: watch::Receiver<f32>,
    turn: watch::Receiver<TurnState>,
    content: broadcast::Sender<ServerMessage>,
}

impl LiveClient {
    /// Spawn a session loop on the current tokio runtime
    pub fn new(
        options: SessionOptions,
        connector: Arc<dyn Connector>,
        output: Box<dyn AudioOutput>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionState::Disconnected);
        let (volume_tx, volume) = watch::channel(0.0);
        let (turn_tx, turn) = watch::channel(TurnState::Idle);
        let (content, _) = broadcast::channel(CONTENT_CAPACITY);

        let channels = Channels {
            status: status_tx,
            volume: volume_tx,
            turn: turn_tx,
            content: content.clone(),
        };
        let session = Session::new(options, connector, output, commands_rx, channels);
        tokio::spawn(session.run());

        Self {
            commands,
            status,
            volume,
            turn,
            content,
        }
    }

    /// Session over a real WebSocket
    pub fn with_websocket(options: SessionOptions, output: Box<dyn AudioOutput>) -> Self {
        Self::new(options, Arc::new(WsConnector), output)
    }

    /// Open the transport and complete the setup handshake
    ///
    /// Any existing connection is torn down first. Resolves once the service
    /// acknowledged the setup.
    pub async fn connect(&self, config: SessionConfig) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { config, reply });
        rx.await
            .unwrap_or_else(|_| Err(ConnectError::Transport("session stopped".to_string())))
    }

    /// Send a complete user turn (barge-in on any playing response)
    pub fn send(&self, parts: Vec<Part>) {
        self.command(Command::Send { parts });
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.send(vec![Part::text(text)]);
    }

    /// Stream media chunks; leaves turn state and pending response audio alone
    pub fn send_realtime_input(&self, chunks: Vec<MediaChunk>) {
        self.command(Command::RealtimeInput { chunks });
    }

    /// Reply to a `toolCall`; the payload is sent as-is
    pub fn send_tool_response(&self, payload: Value) {
        self.command(Command::ToolResponse { payload });
    }

    /// Mark the start of a spoken user turn (capture start), interrupting playback
    pub fn begin_user_turn(&self) {
        self.command(Command::BeginUserTurn);
    }

    /// Voice activity edge from the capture side
    pub fn voice_activity(&self, speaking: bool) {
        self.command(Command::VoiceActivity { speaking });
    }

    /// Close the connection and reset the session. Idempotent.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Disconnect { reply });
        let _ = rx.await;
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Every parsed inbound message, in arrival order
    pub fn content(&self) -> broadcast::Receiver<ServerMessage> {
        self.content.subscribe()
    }

    pub fn input_volume(&self) -> watch::Receiver<f32> {
        self.volume.clone()
    }

    pub fn turn_state(&self) -> watch::Receiver<TurnState> {
        self.turn.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::warn!("LiveClient: session loop is gone, command dropped");
        }
    }
}
