//! Turn-taking state machine
//!
//! This module implements conversational turn tracking using a single-writer
//! pattern. All transitions go through the `reduce()` function, which returns
//! a new state and a list of effects for the session loop to execute.

use uuid::Uuid;

/// Conversational phase of a session.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    /// User turn in progress (a send or capture just started)
    Listening,
    /// Response audio is arriving or being prepared for playback
    Processing,
    /// A response buffer is playing
    Speaking {
        playback_id: Uuid,
    },
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::Processing => "processing",
            TurnState::Speaking { .. } => "speaking",
        }
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self, TurnState::Speaking { .. })
    }
}

/// Events that can trigger turn transitions.
/// These come from the session loop: outbound calls, inbound frames, timers and playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// New user turn (text send or capture start) - barge-in
    OutboundSend,
    /// The service cut its own response short
    Interrupted,
    /// Inbound audio chunk for the active response
    InboundAudio,
    /// Inbound non-audio content (text, code) for the active response
    InboundText,
    /// Voice activity edge from the capture side
    VoiceActivity { speaking: bool },
    /// Silence timer fired
    SilenceElapsed,
    /// Playback of a flushed buffer started
    PlaybackStarted { id: Uuid },
    /// Playback finished on its own (includes id to drop completions of stopped buffers)
    PlaybackEnded { id: Uuid },
    /// Connection went away, for any reason
    Disconnected,
}

/// Effects to be executed after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEffect {
    StopPlayback,
    /// Discard pending inbound audio and its debounce deadline
    ClearAccumulator,
    /// Arm the silence timer (ignored while already armed)
    ArmSilenceTimer,
    CancelSilenceTimer,
    /// Hand pending inbound audio to playback now
    FlushAccumulator,
    /// Publish the new state to observers
    EmitState,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore playback completions whose id is not the playing buffer
/// - Always emit EmitState after state changes
pub fn reduce(state: &TurnState, event: TurnEvent) -> (TurnState, Vec<TurnEffect>) {
    use TurnEffect::*;
    use TurnEvent::*;
    use TurnState::*;

    match (*state, event) {
        // -----------------
        // Barge-in: any state
        // -----------------
        (_, OutboundSend) | (_, Interrupted) => (
            Listening,
            vec![StopPlayback, ClearAccumulator, CancelSilenceTimer, EmitState],
        ),

        // -----------------
        // Inbound audio
        // -----------------
        (Listening, InboundAudio) | (Processing, InboundAudio) => (*state, vec![]),
        (_, InboundAudio) => (Processing, vec![EmitState]),

        // Text opens a response, but never pulls Speaking back to Processing
        (Idle, InboundText) => (Processing, vec![EmitState]),
        (_, InboundText) => (*state, vec![]),

        // -----------------
        // Voice activity / silence
        // -----------------
        (_, VoiceActivity { speaking: true }) => (Listening, vec![CancelSilenceTimer, EmitState]),
        (_, VoiceActivity { speaking: false }) => (*state, vec![ArmSilenceTimer]),
        // Already playing: flush whatever is pending, keep speaking until it starts
        (Speaking { .. }, SilenceElapsed) => (*state, vec![FlushAccumulator]),
        (_, SilenceElapsed) => (Processing, vec![EmitState, FlushAccumulator]),

        // -----------------
        // Playback
        // -----------------
        (_, PlaybackStarted { id }) => (Speaking { playback_id: id }, vec![EmitState]),
        (Speaking { playback_id }, PlaybackEnded { id }) if playback_id == id => {
            (Idle, vec![EmitState])
        }
        // Stale or interrupted completion - ignore
        (_, PlaybackEnded { .. }) => (*state, vec![]),

        // -----------------
        // Disconnect
        // -----------------
        (_, Disconnected) => (
            Idle,
            vec![StopPlayback, ClearAccumulator, CancelSilenceTimer, EmitState],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_send_transitions_to_listening() {
        let (next, effects) = reduce(&TurnState::Idle, TurnEvent::OutboundSend);
        assert_eq!(next, TurnState::Listening);
        assert!(effects.contains(&TurnEffect::StopPlayback));
        assert!(effects.contains(&TurnEffect::ClearAccumulator));
        assert!(effects.contains(&TurnEffect::EmitState));
    }

    #[test]
    fn send_while_speaking_barges_in() {
        let state = TurnState::Speaking {
            playback_id: Uuid::new_v4(),
        };
        let (next, effects) = reduce(&state, TurnEvent::OutboundSend);

        assert_eq!(next, TurnState::Listening);
        // Playback must stop before the accumulator is discarded
        let stop = effects.iter().position(|e| *e == TurnEffect::StopPlayback);
        let clear = effects
            .iter()
            .position(|e| *e == TurnEffect::ClearAccumulator);
        assert!(stop.is_some() && clear.is_some());
        assert!(stop < clear);
    }

    #[test]
    fn send_while_processing_barges_in() {
        let (next, effects) = reduce(&TurnState::Processing, TurnEvent::OutboundSend);
        assert_eq!(next, TurnState::Listening);
        assert!(effects.contains(&TurnEffect::CancelSilenceTimer));
    }

    #[test]
    fn server_interruption_discards_response() {
        let state = TurnState::Speaking {
            playback_id: Uuid::new_v4(),
        };
        let (next, effects) = reduce(&state, TurnEvent::Interrupted);

        assert_eq!(next, TurnState::Listening);
        assert!(effects.contains(&TurnEffect::StopPlayback));
        assert!(effects.contains(&TurnEffect::ClearAccumulator));
    }

    #[test]
    fn inbound_audio_from_idle_moves_to_processing() {
        let (next, effects) = reduce(&TurnState::Idle, TurnEvent::InboundAudio);
        assert_eq!(next, TurnState::Processing);
        assert_eq!(effects, vec![TurnEffect::EmitState]);
    }

    #[test]
    fn inbound_audio_while_listening_stays_listening() {
        let (next, effects) = reduce(&TurnState::Listening, TurnEvent::InboundAudio);
        assert_eq!(next, TurnState::Listening);
        assert!(effects.is_empty());
    }

    #[test]
    fn inbound_text_from_idle_moves_to_processing() {
        let (next, effects) = reduce(&TurnState::Idle, TurnEvent::InboundText);
        assert_eq!(next, TurnState::Processing);
        assert_eq!(effects, vec![TurnEffect::EmitState]);
    }

    #[test]
    fn inbound_text_while_speaking_keeps_speaking() {
        let state = TurnState::Speaking {
            playback_id: Uuid::new_v4(),
        };
        let (next, effects) = reduce(&state, TurnEvent::InboundText);
        assert_eq!(next, state);
        assert!(effects.is_empty());

        let (next, _) = reduce(&TurnState::Listening, TurnEvent::InboundText);
        assert_eq!(next, TurnState::Listening);
    }

    #[test]
    fn voice_activity_arms_and_cancels_silence() {
        let (next, effects) = reduce(
            &TurnState::Processing,
            TurnEvent::VoiceActivity { speaking: false },
        );
        assert_eq!(next, TurnState::Processing);
        assert_eq!(effects, vec![TurnEffect::ArmSilenceTimer]);

        let (next, effects) = reduce(&next, TurnEvent::VoiceActivity { speaking: true });
        assert_eq!(next, TurnState::Listening);
        assert!(effects.contains(&TurnEffect::CancelSilenceTimer));
    }

    #[test]
    fn silence_moves_to_processing_and_flushes() {
        let (next, effects) = reduce(&TurnState::Listening, TurnEvent::SilenceElapsed);
        assert_eq!(next, TurnState::Processing);
        assert!(effects.contains(&TurnEffect::FlushAccumulator));
    }

    #[test]
    fn silence_while_speaking_keeps_speaking() {
        let state = TurnState::Speaking {
            playback_id: Uuid::new_v4(),
        };
        let (next, effects) = reduce(&state, TurnEvent::SilenceElapsed);
        assert_eq!(next, state);
        assert_eq!(effects, vec![TurnEffect::FlushAccumulator]);
    }

    #[test]
    fn playback_lifecycle_returns_to_idle() {
        let id = Uuid::new_v4();
        let (next, _) = reduce(&TurnState::Processing, TurnEvent::PlaybackStarted { id });
        assert_eq!(next, TurnState::Speaking { playback_id: id });

        let (next, effects) = reduce(&next, TurnEvent::PlaybackEnded { id });
        assert_eq!(next, TurnState::Idle);
        assert!(effects.contains(&TurnEffect::EmitState));
    }

    #[test]
    fn stale_playback_end_is_ignored() {
        let current = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let state = TurnState::Speaking {
            playback_id: current,
        };
        let (next, effects) = reduce(&state, TurnEvent::PlaybackEnded { id: stale });

        // Should stay Speaking, no effects
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn playback_end_after_barge_in_is_ignored() {
        let id = Uuid::new_v4();
        let (next, _) = reduce(
            &TurnState::Speaking { playback_id: id },
            TurnEvent::OutboundSend,
        );
        let (next, effects) = reduce(&next, TurnEvent::PlaybackEnded { id });

        assert_eq!(next, TurnState::Listening);
        assert!(effects.is_empty());
    }

    #[test]
    fn disconnect_from_any_state_resets() {
        let states = [
            TurnState::Idle,
            TurnState::Listening,
            TurnState::Processing,
            TurnState::Speaking {
                playback_id: Uuid::new_v4(),
            },
        ];

        for state in states {
            let (next, effects) = reduce(&state, TurnEvent::Disconnected);
            assert_eq!(next, TurnState::Idle);
            assert!(effects.contains(&TurnEffect::StopPlayback));
            assert!(effects.contains(&TurnEffect::ClearAccumulator));
            assert!(effects.contains(&TurnEffect::CancelSilenceTimer));
        }
    }

    #[test]
    fn state_names() {
        assert_eq!(TurnState::Idle.as_str(), "idle");
        assert_eq!(TurnState::Listening.as_str(), "listening");
        assert_eq!(TurnState::Processing.as_str(), "processing");
        assert!(TurnState::Speaking {
            playback_id: Uuid::nil()
        }
        .is_speaking());
    }
}
