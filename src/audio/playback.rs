//! Interruptible playback of response audio
//!
//! `PlaybackSession` owns at most one playing buffer. Starting a new buffer
//! stops the old one first, and `stop()` discards whatever was left: there is
//! no queue and no resume. The device itself sits behind `AudioOutput`, so
//! the session can be driven by a fake in tests.

use tokio::sync::mpsc;
use uuid::Uuid;

use super::pcm::decode_pcm16_le;

/// Default speed-up applied to response audio
pub const DEFAULT_PLAYBACK_RATE: f32 = 1.42;

/// Errors from the output device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    NoOutputDevice,
    StreamFailed(String),
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::NoOutputDevice => write!(f, "No audio output device found"),
            PlaybackError::StreamFailed(e) => write!(f, "Failed to start output stream: {}", e),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// Decoded mono buffer ready for the device
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Speed multiplier (1.0 = as recorded)
    pub playback_rate: f32,
}

impl PlayableBuffer {
    /// Wall-clock length once the rate is applied
    pub fn duration(&self) -> std::time::Duration {
        let effective_rate = self.sample_rate as f64 * self.playback_rate as f64;
        if effective_rate <= 0.0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_secs_f64(self.samples.len() as f64 / effective_rate)
    }
}

/// Completion signal for one buffer
///
/// The output calls `finish()` when the buffer ran to the end on its own.
/// A stopped buffer must not call it.
#[derive(Debug)]
pub struct PlaybackDone {
    id: Uuid,
    tx: mpsc::UnboundedSender<Uuid>,
}

impl PlaybackDone {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn finish(self) {
        let _ = self.tx.send(self.id);
    }
}

/// A buffer currently playing on the device
pub trait ActivePlayback: Send {
    /// Halt immediately, discarding what is left
    fn stop(&mut self);
}

/// Host audio output capability
pub trait AudioOutput: Send {
    fn play(
        &mut self,
        buffer: PlayableBuffer,
        done: PlaybackDone,
    ) -> Result<Box<dyn ActivePlayback>, PlaybackError>;
}

/// The currently playing buffer
pub struct PlaybackHandle {
    id: Uuid,
    active: Box<dyn ActivePlayback>,
}

impl PlaybackHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Owns the single output stream of a session
pub struct PlaybackSession {
    output: Box<dyn AudioOutput>,
    current: Option<PlaybackHandle>,
    playback_rate: f32,
    done_tx: mpsc::UnboundedSender<Uuid>,
}

impl PlaybackSession {
    /// Create a session over `output`
    ///
    /// Returns the receiver for "playback ended" signals; each carries the
    /// id of the buffer that finished naturally.
    pub fn new(
        output: Box<dyn AudioOutput>,
        playback_rate: f32,
    ) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let playback_rate = if playback_rate.is_finite() && playback_rate > 0.0 {
            playback_rate
        } else {
            log::warn!(
                "Playback: invalid rate {}, using {}",
                playback_rate,
                DEFAULT_PLAYBACK_RATE
            );
            DEFAULT_PLAYBACK_RATE
        };

        let (done_tx, done_rx) = mpsc::unbounded_channel();
        (
            Self {
                output,
                current: None,
                playback_rate,
                done_tx,
            },
            done_rx,
        )
    }

    /// Play `raw` (PCM16 LE mono at `sample_rate`), replacing whatever is playing
    ///
    /// Returns the id of the new buffer, or `None` when nothing started.
    /// Input that decodes to no samples leaves the current buffer playing;
    /// a device failure (logged) leaves nothing playing.
    pub fn play(&mut self, raw: &[u8], sample_rate: u32) -> Option<Uuid> {
        let samples = decode_pcm16_le(raw);
        if samples.is_empty() {
            log::debug!("Playback: empty buffer, nothing to play");
            return None;
        }

        self.stop();

        let buffer = PlayableBuffer {
            samples,
            sample_rate,
            playback_rate: self.playback_rate,
        };
        let id = Uuid::new_v4();
        let done = PlaybackDone {
            id,
            tx: self.done_tx.clone(),
        };

        log::info!(
            "Playback: starting {} ({} samples @ {} Hz, {:.2}x, ~{} ms)",
            id,
            buffer.samples.len(),
            sample_rate,
            self.playback_rate,
            buffer.duration().as_millis()
        );

        match self.output.play(buffer, done) {
            Ok(active) => {
                self.current = Some(PlaybackHandle { id, active });
                Some(id)
            }
            Err(e) => {
                log::error!("Playback: {}", e);
                None
            }
        }
    }

    /// Halt the current buffer, if any
    pub fn stop(&mut self) {
        if let Some(mut handle) = self.current.take() {
            log::info!("Playback: stopping {}", handle.id);
            handle.active.stop();
        }
    }

    /// Record a natural completion
    ///
    /// Returns `true` if `id` was the current buffer (which is then cleared);
    /// completions of buffers that were already replaced or stopped return `false`.
    pub fn finished(&mut self, id: Uuid) -> bool {
        match &self.current {
            Some(handle) if handle.id == id => {
                log::debug!("Playback: {} finished", id);
                self.current = None;
                true
            }
            _ => {
                log::debug!("Playback: ignoring stale completion {}", id);
                false
            }
        }
    }

    pub fn current_id(&self) -> Option<Uuid> {
        self.current.as_ref().map(PlaybackHandle::id)
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    pub fn playback_rate(&self) -> f32 {
        self.playback_rate
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Play(PlayableBuffer),
        Stop,
    }

    #[derive(Clone, Default)]
    struct MockOutput {
        calls: Arc<Mutex<Vec<Call>>>,
        done: Arc<Mutex<Vec<PlaybackDone>>>,
        fail: bool,
    }

    struct MockActive {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl ActivePlayback for MockActive {
        fn stop(&mut self) {
            self.calls.lock().unwrap().push(Call::Stop);
        }
    }

    impl AudioOutput for MockOutput {
        fn play(
            &mut self,
            buffer: PlayableBuffer,
            done: PlaybackDone,
        ) -> Result<Box<dyn ActivePlayback>, PlaybackError> {
            if self.fail {
                return Err(PlaybackError::NoOutputDevice);
            }
            self.calls.lock().unwrap().push(Call::Play(buffer));
            self.done.lock().unwrap().push(done);
            Ok(Box::new(MockActive {
                calls: self.calls.clone(),
            }))
        }
    }

    #[test]
    fn test_play_decodes_and_applies_rate() {
        let output = MockOutput::default();
        let (mut session, _rx) = PlaybackSession::new(Box::new(output.clone()), 1.42);

        let id = session.play(&[0x00, 0x40, 0x00, 0xC0], 16000);

        assert!(id.is_some());
        assert_eq!(session.current_id(), id);
        let calls = output.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![Call::Play(PlayableBuffer {
                samples: vec![0.5, -0.5],
                sample_rate: 16000,
                playback_rate: 1.42,
            })]
        );
    }

    #[test]
    fn test_empty_input_is_noop() {
        let output = MockOutput::default();
        let (mut session, _rx) = PlaybackSession::new(Box::new(output.clone()), 1.0);

        assert_eq!(session.play(&[], 16000), None);
        // A lone odd byte decodes to nothing as well
        assert_eq!(session.play(&[0x7F], 16000), None);
        assert!(output.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_empty_input_keeps_current_buffer() {
        let output = MockOutput::default();
        let (mut session, _rx) = PlaybackSession::new(Box::new(output.clone()), 1.0);

        let id = session.play(&[1, 0], 16000);
        assert_eq!(session.play(&[0x7F], 16000), None);
        assert_eq!(session.play(&[], 16000), None);

        assert!(session.is_playing());
        assert_eq!(session.current_id(), id);
        let calls = output.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(!calls.contains(&Call::Stop));
    }

    #[test]
    fn test_new_buffer_stops_previous() {
        let output = MockOutput::default();
        let (mut session, _rx) = PlaybackSession::new(Box::new(output.clone()), 1.0);

        let first = session.play(&[1, 0], 16000).unwrap();
        let second = session.play(&[2, 0], 16000).unwrap();

        assert_ne!(first, second);
        let calls = output.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], Call::Play(_)));
        assert_eq!(calls[1], Call::Stop);
        assert!(matches!(calls[2], Call::Play(_)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let output = MockOutput::default();
        let (mut session, _rx) = PlaybackSession::new(Box::new(output.clone()), 1.0);

        session.play(&[1, 0], 16000);
        session.stop();
        session.stop();

        assert!(!session.is_playing());
        let stops = output
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == Call::Stop)
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn test_natural_completion_signals_id() {
        let output = MockOutput::default();
        let (mut session, mut rx) = PlaybackSession::new(Box::new(output.clone()), 1.0);

        let id = session.play(&[1, 0, 2, 0], 16000).unwrap();
        let done = output.done.lock().unwrap().pop().unwrap();
        assert_eq!(done.id(), id);
        done.finish();

        let finished = rx.recv().await.unwrap();
        assert_eq!(finished, id);
        assert!(session.finished(finished));
        assert!(!session.is_playing());
    }

    #[test]
    fn test_stale_completion_ignored() {
        let output = MockOutput::default();
        let (mut session, _rx) = PlaybackSession::new(Box::new(output.clone()), 1.0);

        let first = session.play(&[1, 0], 16000).unwrap();
        let second = session.play(&[2, 0], 16000).unwrap();

        assert!(!session.finished(first));
        assert_eq!(session.current_id(), Some(second));
    }

    #[test]
    fn test_device_failure_is_not_fatal() {
        let output = MockOutput {
            fail: true,
            ..Default::default()
        };
        let (mut session, _rx) = PlaybackSession::new(Box::new(output), 1.0);

        assert_eq!(session.play(&[1, 0], 16000), None);
        assert!(!session.is_playing());
    }

    #[test]
    fn test_invalid_rate_falls_back() {
        let (session, _rx) = PlaybackSession::new(Box::new(MockOutput::default()), 0.0);
        assert_eq!(session.playback_rate(), DEFAULT_PLAYBACK_RATE);
    }

    #[test]
    fn test_buffer_duration() {
        let buffer = PlayableBuffer {
            samples: vec![0.0; 16000],
            sample_rate: 16000,
            playback_rate: 2.0,
        };
        assert_eq!(buffer.duration().as_millis(), 500);
    }
}
