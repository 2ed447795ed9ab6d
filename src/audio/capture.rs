//! Microphone capture pipeline
//!
//! Bridges the device callback (sync) to the session (async): raw blocks
//! are batched, resampled to 16 kHz, PCM16 + base64 encoded and handed to
//! the data callback as `MediaChunk`s. Volume readings go to a second,
//! independent callback on a fixed interval.
//!
//! # Architecture
//!
//! ```text
//! Device Thread (sync)             Tokio Runtime (async)
//! ┌──────────────────┐             ┌─────────────────────────┐
//! │ input callback   │──channel──▶ │ capture pump            │
//! │ try_send(block)  │             │   ├─ CaptureBuffer (x8) │──▶ on_data
//! └──────────────────┘             │   └─ LevelBuffer (100ms)│──▶ on_volume
//!                                  └─────────────────────────┘
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::meter::{LevelBuffer, DEFAULT_VOLUME_INTERVAL_MS};
use super::pcm::{encode_base64_pcm16, resample_to_pcm16, CAPTURE_MIME_TYPE, TARGET_SAMPLE_RATE};
use crate::live::MediaChunk;

/// Blocks batched into one encoded frame
pub const DEFAULT_BATCH_BLOCKS: usize = 8;

/// Capacity of the device → pump channel (blocks)
const BLOCK_CHANNEL_CAPACITY: usize = 64;

/// Errors that can occur when starting capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    DeviceUnavailable(String),
    PermissionDenied,
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::DeviceUnavailable(e) => write!(f, "Audio input unavailable: {}", e),
            CaptureError::PermissionDenied => write!(f, "Microphone permission denied"),
        }
    }
}

impl std::error::Error for CaptureError {}

/// An open input stream.
/// Dropping it (or calling `stop()`) releases the device.
pub trait ActiveCapture: Send {
    fn stop(&mut self);
}

/// Result of opening the input device
pub struct InputStream {
    /// Native rate of the blocks the device will send
    pub sample_rate: u32,
    pub handle: Box<dyn ActiveCapture>,
}

/// Host microphone capability
///
/// `open` starts the device and delivers mono `f32` blocks on `blocks`.
/// Implementations must never block the device callback: use `try_send`.
pub trait AudioInput: Send {
    fn open(&mut self, blocks: mpsc::Sender<Vec<f32>>) -> Result<InputStream, CaptureError>;
}

/// Raw blocks awaiting resample + encode
///
/// Flushed as one frame every `batch_blocks` blocks.
pub struct CaptureBuffer {
    blocks: Vec<Vec<f32>>,
    batch_blocks: usize,
    source_rate: u32,
}

impl CaptureBuffer {
    pub fn new(source_rate: u32, batch_blocks: usize) -> Self {
        let batch_blocks = batch_blocks.max(1);
        Self {
            blocks: Vec::with_capacity(batch_blocks),
            batch_blocks,
            source_rate,
        }
    }

    /// Queue one block; returns the encoded frame once the batch is full
    pub fn push(&mut self, block: Vec<f32>) -> Option<MediaChunk> {
        self.blocks.push(block);
        if self.blocks.len() < self.batch_blocks {
            return None;
        }

        let samples: Vec<f32> = self.blocks.drain(..).flatten().collect();
        let pcm = resample_to_pcm16(&samples, self.source_rate, TARGET_SAMPLE_RATE);
        Some(MediaChunk::new(CAPTURE_MIME_TYPE, encode_base64_pcm16(&pcm)))
    }

    /// Discard buffered-but-unsent blocks
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

type DataCallback = Box<dyn FnMut(MediaChunk) + Send>;
type VolumeCallback = Box<dyn FnMut(f32) + Send>;

/// Single-slot handlers; registering again replaces the previous one
#[derive(Default)]
struct Callbacks {
    data: Mutex<Option<DataCallback>>,
    volume: Mutex<Option<VolumeCallback>>,
}

impl Callbacks {
    fn emit_data(&self, chunk: MediaChunk) {
        if let Ok(mut slot) = self.data.lock() {
            if let Some(cb) = slot.as_mut() {
                cb(chunk);
            }
        }
    }

    fn emit_volume(&self, volume: f32) {
        if let Ok(mut slot) = self.volume.lock() {
            if let Some(cb) = slot.as_mut() {
                cb(volume);
            }
        }
    }
}

struct Running {
    token: CancellationToken,
    stream: Box<dyn ActiveCapture>,
}

/// Owns the microphone for one session
///
/// Callbacks run on the pump task and must not register new callbacks.
pub struct CaptureSession {
    input: Box<dyn AudioInput>,
    callbacks: Arc<Callbacks>,
    batch_blocks: usize,
    volume_interval: Duration,
    running: Option<Running>,
}

impl CaptureSession {
    pub fn new(input: Box<dyn AudioInput>) -> Self {
        Self {
            input,
            callbacks: Arc::new(Callbacks::default()),
            batch_blocks: DEFAULT_BATCH_BLOCKS,
            volume_interval: Duration::from_millis(DEFAULT_VOLUME_INTERVAL_MS),
            running: None,
        }
    }

    pub fn with_batch_blocks(mut self, batch_blocks: usize) -> Self {
        self.batch_blocks = batch_blocks.max(1);
        self
    }

    pub fn with_volume_interval(mut self, interval: Duration) -> Self {
        if interval.is_zero() {
            log::warn!("Capture: zero volume interval, keeping {:?}", self.volume_interval);
        } else {
            self.volume_interval = interval;
        }
        self
    }

    /// Register the encoded-frame handler (replaces any previous one)
    pub fn on_data(&self, callback: impl FnMut(MediaChunk) + Send + 'static) {
        if let Ok(mut slot) = self.callbacks.data.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    /// Register the volume handler (replaces any previous one)
    pub fn on_volume(&self, callback: impl FnMut(f32) + Send + 'static) {
        if let Ok(mut slot) = self.callbacks.volume.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    /// Acquire the input device and start the pump
    ///
    /// Must be called from within a tokio runtime. Starting twice is a no-op.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.running.is_some() {
            log::debug!("Capture: already running");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(BLOCK_CHANNEL_CAPACITY);
        let stream = self.input.open(tx)?;

        log::info!(
            "Capture: started ({} Hz → {} Hz, {} blocks per frame)",
            stream.sample_rate,
            TARGET_SAMPLE_RATE,
            self.batch_blocks
        );

        let token = CancellationToken::new();
        tokio::spawn(run_pump(
            rx,
            CaptureBuffer::new(stream.sample_rate, self.batch_blocks),
            self.callbacks.clone(),
            self.volume_interval,
            token.clone(),
        ));

        self.running = Some(Running {
            token,
            stream: stream.handle,
        });
        Ok(())
    }

    /// Release the device and discard unsent samples. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.token.cancel();
            running.stream.stop();
            log::info!("Capture: stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_pump(
    mut rx: mpsc::Receiver<Vec<f32>>,
    mut buffer: CaptureBuffer,
    callbacks: Arc<Callbacks>,
    volume_interval: Duration,
    token: CancellationToken,
) {
    let mut level = LevelBuffer::new();
    let mut ticker = tokio::time::interval(volume_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut frames_sent: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => break,

            block = rx.recv() => match block {
                Some(block) => {
                    level.push_samples(&block);
                    if let Some(chunk) = buffer.push(block) {
                        callbacks.emit_data(chunk);
                        frames_sent += 1;
                        if frames_sent % 50 == 0 {
                            log::debug!("Capture: {} frames encoded", frames_sent);
                        }
                    }
                }
                None => {
                    log::warn!("Capture: device channel closed");
                    break;
                }
            },

            _ = ticker.tick() => callbacks.emit_volume(level.volume()),
        }
    }

    if !buffer.is_empty() {
        log::debug!("Capture: discarding {} unsent blocks", buffer.len());
    }
    buffer.clear();
    log::debug!("Capture: pump exiting after {} frames", frames_sent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine};

    struct MockStream {
        stopped: Arc<Mutex<u32>>,
    }

    impl ActiveCapture for MockStream {
        fn stop(&mut self) {
            *self.stopped.lock().unwrap() += 1;
        }
    }

    #[derive(Clone, Default)]
    struct MockInput {
        sender: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
        stopped: Arc<Mutex<u32>>,
        deny: bool,
    }

    impl AudioInput for MockInput {
        fn open(&mut self, blocks: mpsc::Sender<Vec<f32>>) -> Result<InputStream, CaptureError> {
            if self.deny {
                return Err(CaptureError::PermissionDenied);
            }
            *self.sender.lock().unwrap() = Some(blocks);
            Ok(InputStream {
                sample_rate: 48000,
                handle: Box::new(MockStream {
                    stopped: self.stopped.clone(),
                }),
            })
        }
    }

    impl MockInput {
        async fn push(&self, block: Vec<f32>) {
            let tx = self.sender.lock().unwrap().clone();
            if let Some(tx) = tx {
                let _ = tx.send(block).await;
            }
        }
    }

    #[test]
    fn test_buffer_flushes_every_batch() {
        let mut buffer = CaptureBuffer::new(48000, 8);

        for _ in 0..7 {
            assert!(buffer.push(vec![0.0; 480]).is_none());
        }
        let chunk = buffer.push(vec![0.0; 480]).expect("Expected a frame");

        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        // 8 × 480 samples at 48 kHz → 1280 samples at 16 kHz → 2560 bytes
        assert_eq!(STANDARD.decode(&chunk.data).unwrap().len(), 2560);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffer_clear_discards() {
        let mut buffer = CaptureBuffer::new(16000, 8);
        buffer.push(vec![0.5; 10]);
        buffer.clear();

        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_start_failure_surfaces() {
        let input = MockInput {
            deny: true,
            ..Default::default()
        };
        let mut session = CaptureSession::new(Box::new(input));

        assert_eq!(session.start(), Err(CaptureError::PermissionDenied));
        assert!(!session.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_delivered_to_last_registered_callback() {
        let input = MockInput::default();
        let mut session = CaptureSession::new(Box::new(input.clone()));

        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        {
            let first = first.clone();
            session.on_data(move |chunk| first.lock().unwrap().push(chunk));
        }
        {
            let second = second.clone();
            session.on_data(move |chunk| second.lock().unwrap().push(chunk));
        }

        session.start().unwrap();
        for _ in 0..16 {
            input.push(vec![0.25; 96]).await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 2);
        session.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_reported_on_interval() {
        let input = MockInput::default();
        let mut session = CaptureSession::new(Box::new(input.clone()));

        let readings = Arc::new(Mutex::new(Vec::new()));
        {
            let readings = readings.clone();
            session.on_volume(move |v| readings.lock().unwrap().push(v));
        }

        session.start().unwrap();
        input.push(vec![1.0; 256]).await;
        // Ticks at 0, 100, 200 and 300 ms
        tokio::time::sleep(Duration::from_millis(350)).await;

        let readings = readings.lock().unwrap().clone();
        assert_eq!(readings.len(), 4);
        assert!((readings[readings.len() - 1] - 1.0).abs() < 1e-6);
        session.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_discards() {
        let input = MockInput::default();
        let mut session = CaptureSession::new(Box::new(input.clone()));

        let frames = Arc::new(Mutex::new(0u32));
        {
            let frames = frames.clone();
            session.on_data(move |_| *frames.lock().unwrap() += 1);
        }

        session.start().unwrap();
        for _ in 0..7 {
            input.push(vec![0.1; 64]).await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        session.stop();
        session.stop();
        assert!(!session.is_running());
        assert_eq!(*input.stopped.lock().unwrap(), 1);

        // The eighth block would have completed the batch
        input.push(vec![0.1; 64]).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*frames.lock().unwrap(), 0);
    }
}
