//! CPAL implementations of the audio capabilities
//!
//! `cpal::Stream` is not `Send`, so every stream lives on its own device
//! thread. The thread reports the open result back once, then parks on a
//! stop channel; dropping the handle (or calling `stop()`) ends the thread,
//! which drops the stream and releases the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use tokio::sync::mpsc;

use super::capture::{ActiveCapture, AudioInput, CaptureError, InputStream};
use super::pcm::resample_linear;
use super::playback::{ActivePlayback, AudioOutput, PlayableBuffer, PlaybackDone, PlaybackError};

/// How often an output thread checks for natural completion
const COMPLETION_POLL: Duration = Duration::from_millis(20);

/// Longest a caller waits for a device thread to report its open result
const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Stop signal for a device thread
struct DeviceThread {
    stop_tx: Option<std_mpsc::Sender<()>>,
}

impl DeviceThread {
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ActiveCapture for DeviceThread {
    fn stop(&mut self) {
        DeviceThread::stop(self);
    }
}

impl ActivePlayback for DeviceThread {
    fn stop(&mut self) {
        DeviceThread::stop(self);
    }
}

/// Wait for a device thread's open result without hanging the caller
///
/// On timeout the caller drops its stop sender, so a late-opening thread
/// releases the device as soon as it notices.
fn wait_ready<T, E>(
    ready_rx: &std_mpsc::Receiver<Result<T, E>>,
    timeout: Duration,
    what: &str,
    to_error: impl Fn(String) -> E,
) -> Result<T, E> {
    match ready_rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(std_mpsc::RecvTimeoutError::Timeout) => {
            log::error!("{} device did not open within {:?}", what, timeout);
            Err(to_error(format!("{} device did not open within {:?}", what, timeout)))
        }
        Err(std_mpsc::RecvTimeoutError::Disconnected) => {
            Err(to_error(format!("{} thread exited unexpectedly", what)))
        }
    }
}

fn classify_input_error(message: String) -> CaptureError {
    if message.to_lowercase().contains("permission") {
        CaptureError::PermissionDenied
    } else {
        CaptureError::DeviceUnavailable(message)
    }
}

// ============================================================================
// Input
// ============================================================================

/// Default input device of the default host
#[derive(Debug, Default)]
pub struct CpalInput;

impl AudioInput for CpalInput {
    fn open(&mut self, blocks: mpsc::Sender<Vec<f32>>) -> Result<InputStream, CaptureError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, CaptureError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("audio-input".to_string())
            .spawn(move || {
                let stream = match build_input_stream(blocks) {
                    Ok((stream, sample_rate)) => {
                        let _ = ready_tx.send(Ok(sample_rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Park until stopped or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Input device thread exiting");
            })
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        let sample_rate = wait_ready(
            &ready_rx,
            DEVICE_OPEN_TIMEOUT,
            "Input",
            CaptureError::DeviceUnavailable,
        )?;

        Ok(InputStream {
            sample_rate,
            handle: Box::new(DeviceThread {
                stop_tx: Some(stop_tx),
            }),
        })
    }
}

fn build_input_stream(
    blocks: mpsc::Sender<Vec<f32>>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::DeviceUnavailable("No audio input device found".to_string()))?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|e| classify_input_error(e.to_string()))?;

    log::info!(
        "Audio input config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;

    let stream = match sample_format {
        SampleFormat::I16 => build_input_typed::<i16>(&device, &config, blocks),
        SampleFormat::U16 => build_input_typed::<u16>(&device, &config, blocks),
        SampleFormat::F32 => build_input_typed::<f32>(&device, &config, blocks),
        other => Err(CaptureError::DeviceUnavailable(format!(
            "Unsupported sample format {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| classify_input_error(format!("Failed to start stream: {}", e)))?;

    Ok((stream, sample_rate))
}

fn build_input_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    blocks: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = |err| log::error!("Audio input stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Downmix to mono
                let block: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        frame.iter().map(|&s| f32::from_sample_(s)).sum::<f32>() / frame.len() as f32
                    })
                    .collect();

                // Never block the audio thread; drop the block if the pump is behind
                if blocks.try_send(block).is_err() {
                    log::trace!("Input block dropped (pump busy or closed)");
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| classify_input_error(e.to_string()))
}

// ============================================================================
// Output
// ============================================================================

/// Default output device of the default host
#[derive(Debug, Default)]
pub struct CpalOutput;

impl AudioOutput for CpalOutput {
    fn play(
        &mut self,
        buffer: PlayableBuffer,
        done: PlaybackDone,
    ) -> Result<Box<dyn ActivePlayback>, PlaybackError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), PlaybackError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let finished = Arc::new(AtomicBool::new(false));
                let stream = match build_output_stream(&buffer, finished.clone()) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let interrupted = loop {
                    match stop_rx.recv_timeout(COMPLETION_POLL) {
                        Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break true,
                        Err(std_mpsc::RecvTimeoutError::Timeout) => {
                            if finished.load(Ordering::SeqCst) {
                                break false;
                            }
                        }
                    }
                };

                drop(stream);
                if !interrupted {
                    done.finish();
                }
            })
            .map_err(|e| PlaybackError::StreamFailed(e.to_string()))?;

        wait_ready(
            &ready_rx,
            DEVICE_OPEN_TIMEOUT,
            "Output",
            PlaybackError::StreamFailed,
        )?;

        Ok(Box::new(DeviceThread {
            stop_tx: Some(stop_tx),
        }))
    }
}

fn build_output_stream(
    buffer: &PlayableBuffer,
    finished: Arc<AtomicBool>,
) -> Result<cpal::Stream, PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(PlaybackError::NoOutputDevice)?;

    let supported_config = device
        .default_output_config()
        .map_err(|e| PlaybackError::StreamFailed(e.to_string()))?;

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();

    // Speed-up: treat the buffer as recorded at `rate × sample_rate`, then
    // resample to what the device runs at
    let effective_rate = (buffer.sample_rate as f32 * buffer.playback_rate).round() as u32;
    let samples = Arc::new(resample_linear(
        &buffer.samples,
        effective_rate,
        config.sample_rate.0,
    ));

    log::debug!(
        "Audio output: {} samples @ {} Hz on device ({} channels)",
        samples.len(),
        config.sample_rate.0,
        config.channels
    );

    let stream = match sample_format {
        SampleFormat::I16 => build_output_typed::<i16>(&device, &config, samples, finished),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &config, samples, finished),
        SampleFormat::F32 => build_output_typed::<f32>(&device, &config, samples, finished),
        other => Err(PlaybackError::StreamFailed(format!(
            "Unsupported sample format {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| PlaybackError::StreamFailed(e.to_string()))?;

    Ok(stream)
}

fn build_output_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    samples: Arc<Vec<f32>>,
    finished: Arc<AtomicBool>,
) -> Result<cpal::Stream, PlaybackError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let mut position = 0usize;
    let err_fn = |err| log::error!("Audio output stream error: {}", err);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let value = samples.get(position).copied().unwrap_or(0.0);
                    for out in frame.iter_mut() {
                        *out = T::from_sample_(value);
                    }
                    position += 1;
                }

                if position >= samples.len() {
                    finished.store(true, Ordering::SeqCst);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| PlaybackError::StreamFailed(e.to_string()))
}
