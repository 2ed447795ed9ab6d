//! Session loop
//!
//! One task owns everything mutable about a session: the transport, the
//! turn state, the inbound audio accumulator, every timer and the playback
//! session. `LiveClient` handles talk to it over a FIFO command channel, so
//! commands are applied in call order and there is exactly one writer for
//! the connection and turn state.
//!
//! Timers are plain `Option<Instant>` deadlines raced in one `select!`. A
//! flush from any trigger (debounce, silence, `turnComplete`) clears both
//! deadlines, so a turn's audio is flushed exactly once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use super::accumulator::AudioAccumulator;
use super::protocol::{
    connection_url, ClientMessage, MediaChunk, Part, ServerContent, ServerMessage, SessionConfig,
    LIVE_API_URL,
};
use super::transport::{Connector, TransportEvent, TransportHandle};
use super::{ConnectError, ConnectionState, SendError};
use crate::audio::pcm::TARGET_SAMPLE_RATE;
use crate::audio::playback::{AudioOutput, PlaybackSession, DEFAULT_PLAYBACK_RATE};
use crate::state_machine::{reduce, TurnEffect, TurnEvent, TurnState};

/// Input volume pulse shown on every outbound message: (offset, level)
const VOLUME_PULSE: [(Duration, f32); 3] = [
    (Duration::ZERO, 0.8),
    (Duration::from_millis(100), 0.4),
    (Duration::from_millis(200), 0.0),
];

/// Session loop tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Endpoint without the credential
    pub ws_url: String,
    /// Resolved credential; `None` makes every connect fail with `Unauthenticated`
    pub api_key: Option<String>,
    /// Quiet period after the last inbound audio chunk before playback
    pub debounce: Duration,
    /// Delay after voice activity stops before the turn moves to processing
    pub silence: Duration,
    /// Covers both opening the socket and the `setupComplete` handshake
    pub connect_timeout: Duration,
    /// Rate response audio is played at
    pub response_sample_rate: u32,
    pub playback_rate: f32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ws_url: LIVE_API_URL.to_string(),
            api_key: None,
            debounce: Duration::from_millis(500),
            silence: Duration::from_millis(300),
            connect_timeout: Duration::from_secs(10),
            response_sample_rate: TARGET_SAMPLE_RATE,
            playback_rate: DEFAULT_PLAYBACK_RATE,
        }
    }
}

/// Requests from `LiveClient` handles
pub(crate) enum Command {
    Connect {
        config: SessionConfig,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Send {
        parts: Vec<Part>,
    },
    RealtimeInput {
        chunks: Vec<MediaChunk>,
    },
    ToolResponse {
        payload: Value,
    },
    BeginUserTurn,
    VoiceActivity {
        speaking: bool,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Observable state shared with the handles
pub(crate) struct Channels {
    pub status: watch::Sender<ConnectionState>,
    pub volume: watch::Sender<f32>,
    pub turn: watch::Sender<TurnState>,
    pub content: broadcast::Sender<ServerMessage>,
}

/// Connect call waiting for `setupComplete`
struct PendingConnect {
    reply: oneshot::Sender<Result<(), ConnectError>>,
    deadline: Instant,
}

pub(crate) struct Session {
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    channels: Channels,

    transport: Option<TransportHandle>,
    config: Option<SessionConfig>,
    pending_connect: Option<PendingConnect>,

    turn: TurnState,
    accumulator: AudioAccumulator,
    debounce_deadline: Option<Instant>,
    silence_deadline: Option<Instant>,
    volume_steps: VecDeque<(Instant, f32)>,

    playback: PlaybackSession,
    playback_done: mpsc::UnboundedReceiver<Uuid>,
}

impl Session {
    pub(crate) fn new(
        options: SessionOptions,
        connector: Arc<dyn Connector>,
        output: Box<dyn AudioOutput>,
        commands: mpsc::UnboundedReceiver<Command>,
        channels: Channels,
    ) -> Self {
        let (playback, playback_done) = PlaybackSession::new(output, options.playback_rate);
        Self {
            options,
            connector,
            commands,
            channels,
            transport: None,
            config: None,
            pending_connect: None,
            turn: TurnState::Idle,
            accumulator: AudioAccumulator::new(),
            debounce_deadline: None,
            silence_deadline: None,
            volume_steps: VecDeque::new(),
            playback,
            playback_done,
        }
    }

    /// Run until every client handle is dropped
    pub(crate) async fn run(mut self) {
        log::info!("Session: loop started");

        loop {
            let handshake_deadline = self.pending_connect.as_ref().map(|p| p.deadline);
            let volume_deadline = self.volume_steps.front().map(|(at, _)| *at);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                event = next_transport_event(&mut self.transport) => {
                    self.handle_transport_event(event);
                }

                Some(id) = self.playback_done.recv() => {
                    if self.playback.finished(id) {
                        self.dispatch(TurnEvent::PlaybackEnded { id });
                    }
                }

                _ = sleep_until_opt(handshake_deadline) => self.handshake_timed_out(),

                _ = sleep_until_opt(self.debounce_deadline) => {
                    log::debug!("Session: debounce elapsed");
                    self.flush_accumulator();
                }

                _ = sleep_until_opt(self.silence_deadline) => {
                    self.silence_deadline = None;
                    log::debug!("Session: silence elapsed");
                    self.dispatch(TurnEvent::SilenceElapsed);
                }

                _ = sleep_until_opt(volume_deadline) => {
                    if let Some((_, level)) = self.volume_steps.pop_front() {
                        self.channels.volume.send_replace(level);
                    }
                }
            }
        }

        self.teardown("client dropped");
        log::info!("Session: loop exiting");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { config, reply } => self.connect(config, reply).await,
            Command::Send { parts } => {
                if !self.ensure_connected("send") {
                    return;
                }
                // Barge-in: playback stopped and accumulator cleared before the frame is queued
                self.dispatch(TurnEvent::OutboundSend);
                self.send_message(ClientMessage::user_turn(parts));
            }
            Command::RealtimeInput { chunks } => {
                if self.ensure_connected("realtime input") {
                    self.send_message(ClientMessage::realtime_input(chunks));
                }
            }
            Command::ToolResponse { payload } => {
                if self.ensure_connected("tool response") {
                    self.send_message(ClientMessage::ToolResponse(payload));
                }
            }
            Command::BeginUserTurn => self.dispatch(TurnEvent::OutboundSend),
            Command::VoiceActivity { speaking } => {
                self.dispatch(TurnEvent::VoiceActivity { speaking })
            }
            Command::Disconnect { reply } => {
                self.teardown("disconnect requested");
                let _ = reply.send(());
            }
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    async fn connect(
        &mut self,
        config: SessionConfig,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    ) {
        let api_key = match self.options.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => {
                log::warn!("Session: no API key configured, not connecting");
                let _ = reply.send(Err(ConnectError::Unauthenticated));
                return;
            }
        };

        if self.transport.is_some() || self.pending_connect.is_some() {
            log::info!("Session: replacing existing connection");
            self.teardown("replaced by a new connection");
        }

        self.set_status(ConnectionState::Connecting);
        let deadline = Instant::now() + self.options.connect_timeout;
        let url = connection_url(&self.options.ws_url, &api_key);

        let transport =
            match tokio::time::timeout_at(deadline, self.connector.connect(url)).await {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    log::error!("Session: connect failed: {}", e);
                    self.set_status(ConnectionState::Disconnected);
                    let _ = reply.send(Err(e));
                    return;
                }
                Err(_) => {
                    log::error!("Session: timed out opening the connection");
                    self.set_status(ConnectionState::Disconnected);
                    let _ = reply.send(Err(ConnectError::Timeout));
                    return;
                }
            };

        let setup = match ClientMessage::Setup(config.clone()).to_json() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Session: failed to serialize setup: {}", e);
                transport.close();
                self.set_status(ConnectionState::Disconnected);
                let _ = reply.send(Err(ConnectError::Transport(e.to_string())));
                return;
            }
        };

        if let Err(e) = transport.send(setup) {
            log::error!("Session: failed to send setup: {}", e);
            self.set_status(ConnectionState::Disconnected);
            let _ = reply.send(Err(ConnectError::Transport(e)));
            return;
        }

        log::info!("Session: setup sent for {}, awaiting acknowledgment", config.model);
        self.transport = Some(transport);
        self.config = Some(config);
        self.pending_connect = Some(PendingConnect { reply, deadline });
    }

    fn handshake_timed_out(&mut self) {
        if let Some(pending) = self.pending_connect.take() {
            log::error!("Session: no setupComplete within {:?}", self.options.connect_timeout);
            let _ = pending.reply.send(Err(ConnectError::Timeout));
        }
        self.teardown("handshake timed out");
    }

    /// Full cleanup: close transport, stop playback, clear turn state and config
    ///
    /// Safe to call repeatedly.
    fn teardown(&mut self, reason: &str) {
        if let Some(pending) = self.pending_connect.take() {
            let _ = pending
                .reply
                .send(Err(ConnectError::Transport(reason.to_string())));
        }

        if let Some(transport) = self.transport.take() {
            log::info!("Session: closing connection ({})", reason);
            self.set_status(ConnectionState::Closing);
            transport.close();
        }

        self.config = None;
        self.dispatch(TurnEvent::Disconnected);
        self.set_status(ConnectionState::Disconnected);
    }

    fn status(&self) -> ConnectionState {
        *self.channels.status.borrow()
    }

    fn set_status(&self, state: ConnectionState) {
        self.channels.status.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            log::debug!("Session: connection {:?} -> {:?}", *current, state);
            *current = state;
            true
        });
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    fn ensure_connected(&self, what: &str) -> bool {
        if self.status().is_connected() {
            return true;
        }
        log::warn!("Session: dropping {}: {}", what, SendError::NotConnected);
        false
    }

    fn send_message(&mut self, message: ClientMessage) {
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Session: failed to serialize message: {}", e);
                return;
            }
        };

        let Some(transport) = &self.transport else {
            log::warn!("Session: {}", SendError::NotConnected);
            return;
        };
        if let Err(e) = transport.send(frame) {
            log::warn!("Session: failed to queue frame: {}", e);
            return;
        }

        self.pulse_volume();
    }

    fn pulse_volume(&mut self) {
        let now = Instant::now();
        self.volume_steps = VOLUME_PULSE
            .iter()
            .map(|(offset, level)| (now + *offset, *level))
            .collect();
        if let Some((_, level)) = self.volume_steps.pop_front() {
            self.channels.volume.send_replace(level);
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(text) => self.handle_frame(&text),
            TransportEvent::Closed(reason) => {
                log::info!("Session: transport closed ({:?})", reason);
                self.teardown("transport closed");
            }
            TransportEvent::Error(e) => {
                log::error!("Session: transport error: {}", e);
                self.teardown("transport error");
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Session: dropping inbound frame: {}", e);
                return;
            }
        };

        match &message {
            ServerMessage::SetupComplete => match self.pending_connect.take() {
                Some(pending) => {
                    self.set_status(ConnectionState::Connected);
                    log::info!("Session: connected");
                    let _ = pending.reply.send(Ok(()));
                }
                None => log::debug!("Session: unexpected setupComplete"),
            },
            ServerMessage::ServerContent(content) => self.handle_server_content(content),
            ServerMessage::ToolCall(_) => log::info!("Session: tool call received"),
            ServerMessage::Unknown(_) => log::debug!("Session: unhandled message type"),
        }

        // Err only means nobody is subscribed
        let _ = self.channels.content.send(message);
    }

    fn handle_server_content(&mut self, content: &ServerContent) {
        if content.interrupted == Some(true) {
            log::info!("Session: response interrupted by the service");
            self.dispatch(TurnEvent::Interrupted);
        }

        let mut received = false;
        for chunk in content.audio_chunks() {
            match STANDARD.decode(&chunk.data) {
                Ok(bytes) if !bytes.is_empty() => {
                    self.accumulator.push(bytes);
                    received = true;
                }
                Ok(_) => {}
                Err(e) => log::warn!("Session: dropping undecodable audio part: {}", e),
            }
        }

        if received {
            self.debounce_deadline = Some(Instant::now() + self.options.debounce);
            self.dispatch(TurnEvent::InboundAudio);
        } else if content.parts().iter().any(|part| part.as_audio().is_none()) {
            self.dispatch(TurnEvent::InboundText);
        }

        if content.is_turn_complete() {
            log::debug!("Session: turn complete");
            self.flush_accumulator();
        }
    }

    /// Hand pending audio to playback and cancel both flush timers
    fn flush_accumulator(&mut self) {
        self.debounce_deadline = None;
        self.silence_deadline = None;

        let Some(bytes) = self.accumulator.take() else {
            log::debug!("Session: nothing to flush");
            return;
        };

        log::debug!("Session: flushing {} bytes of response audio", bytes.len());
        match self.playback.play(&bytes, self.options.response_sample_rate) {
            Some(id) => self.dispatch(TurnEvent::PlaybackStarted { id }),
            // Nothing playable in the flush; the earlier buffer keeps the turn
            None => {
                if let Some(id) = self.playback.current_id() {
                    self.dispatch(TurnEvent::PlaybackStarted { id });
                }
            }
        }
    }

    // ========================================================================
    // Turn state
    // ========================================================================

    fn dispatch(&mut self, event: TurnEvent) {
        let (next, effects) = reduce(&self.turn, event);
        if next != self.turn {
            log::debug!("Session: turn {} -> {}", self.turn.as_str(), next.as_str());
        }
        self.turn = next;

        for effect in effects {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: TurnEffect) {
        match effect {
            TurnEffect::StopPlayback => self.playback.stop(),
            TurnEffect::ClearAccumulator => {
                self.accumulator.clear();
                self.debounce_deadline = None;
            }
            TurnEffect::ArmSilenceTimer => {
                if self.silence_deadline.is_none() {
                    self.silence_deadline = Some(Instant::now() + self.options.silence);
                }
            }
            TurnEffect::CancelSilenceTimer => self.silence_deadline = None,
            TurnEffect::FlushAccumulator => self.flush_accumulator(),
            TurnEffect::EmitState => {
                let turn = self.turn;
                self.channels.turn.send_if_modified(|current| {
                    if *current == turn {
                        return false;
                    }
                    *current = turn;
                    true
                });
            }
        }
    }
}

async fn next_transport_event(transport: &mut Option<TransportHandle>) -> TransportEvent {
    match transport {
        Some(transport) => transport
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed(None)),
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
