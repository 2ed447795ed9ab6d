//! Audio pipeline for the live client
//!
//! This module handles microphone capture (resample, PCM16 encode, volume
//! metering) and interruptible playback of response audio. The host devices
//! are reached only through the `AudioInput` / `AudioOutput` capabilities;
//! CPAL implementations live in `device`.

pub mod capture;
mod device;
pub mod meter;
pub mod pcm;
pub mod playback;

pub use capture::{ActiveCapture, AudioInput, CaptureBuffer, CaptureError, CaptureSession, InputStream};
pub use device::{CpalInput, CpalOutput};
pub use meter::{volume_from_snapshot, LevelBuffer, VoiceActivityGate};
pub use playback::{
    ActivePlayback, AudioOutput, PlayableBuffer, PlaybackDone, PlaybackError, PlaybackSession,
    DEFAULT_PLAYBACK_RATE,
};
