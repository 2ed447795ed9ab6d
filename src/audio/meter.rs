//! Input volume metering
//!
//! Keeps a short window of the most recent capture samples, folds it into a
//! byte-scaled amplitude snapshot (0-255 per bin) and reduces the snapshot
//! to a single 0.0-1.0 loudness value. The capture pump samples this on a
//! fixed interval, independent of the encode/send cadence.

use std::collections::VecDeque;

/// Samples kept for one snapshot (an analyser frame of 256)
const WINDOW_SIZE: usize = 256;

/// Bins per snapshot (half the window, like a frequency-bin count)
const SNAPSHOT_BINS: usize = WINDOW_SIZE / 2;

/// Default interval between volume readings
pub const DEFAULT_VOLUME_INTERVAL_MS: u64 = 100;

/// Default loudness above which the speaker is considered active
pub const DEFAULT_VAD_THRESHOLD: f32 = 0.1;

/// Reduce a byte-scaled snapshot to a normalized volume: `(sum / M) / 255`
///
/// An empty snapshot reads as silence.
pub fn volume_from_snapshot(snapshot: &[u8]) -> f32 {
    if snapshot.is_empty() {
        return 0.0;
    }

    let sum: u64 = snapshot.iter().map(|&b| b as u64).sum();
    let average = sum as f32 / snapshot.len() as f32;
    average / 255.0
}

/// Ring buffer for the most recent capture samples
pub struct LevelBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl LevelBuffer {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW_SIZE),
            capacity: WINDOW_SIZE,
        }
    }

    /// Add samples to the buffer, removing oldest samples if at capacity
    pub fn push_samples(&mut self, samples: &[f32]) {
        let len = samples.len();

        // If incoming samples exceed capacity, just keep the last part
        if len >= self.capacity {
            self.samples.clear();
            self.samples.extend(&samples[len - self.capacity..]);
            return;
        }

        let to_remove = (self.samples.len() + len).saturating_sub(self.capacity);
        if to_remove > 0 {
            self.samples.drain(0..to_remove);
        }

        self.samples.extend(samples);
    }

    /// Fold the window into `SNAPSHOT_BINS` bins of peak magnitude, scaled to 0-255
    pub fn snapshot(&self) -> Vec<u8> {
        let mut bins = vec![0u8; SNAPSHOT_BINS];
        if self.samples.is_empty() {
            return bins;
        }

        let per_bin = (self.samples.len() / SNAPSHOT_BINS).max(1);

        for (bin_idx, bin) in bins.iter_mut().enumerate() {
            let start = bin_idx * per_bin;
            if start >= self.samples.len() {
                break;
            }
            let end = (start + per_bin).min(self.samples.len());

            let peak = (start..end)
                .map(|i| self.samples[i].abs())
                .fold(0.0f32, f32::max)
                .min(1.0);
            *bin = (peak * 255.0).round() as u8;
        }

        bins
    }

    /// Current loudness of the window
    pub fn volume(&self) -> f32 {
        volume_from_snapshot(&self.snapshot())
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

impl Default for LevelBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns volume readings into speaking/silent decisions
///
/// Only reports edges: a reading that does not change the decision yields `None`.
#[derive(Debug, Clone)]
pub struct VoiceActivityGate {
    threshold: f32,
    speaking: Option<bool>,
}

impl VoiceActivityGate {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            speaking: None,
        }
    }

    /// Feed a volume reading; returns the new decision when it changed
    pub fn update(&mut self, volume: f32) -> Option<bool> {
        let speaking = volume > self.threshold;
        if self.speaking == Some(speaking) {
            return None;
        }
        self.speaking = Some(speaking);
        Some(speaking)
    }

    pub fn reset(&mut self) {
        self.speaking = None;
    }
}

impl Default for VoiceActivityGate {
    fn default() -> Self {
        Self::new(DEFAULT_VAD_THRESHOLD)
    }
}
