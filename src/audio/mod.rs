//! Audio capture and playback
//!
//! Devices are blocking and usually not `Send`, so each one is opened and driven on
//! its own worker thread. The async side talks to those threads over channels:
//!
//! ```text
//! capture thread ──mpsc──▶ AudioIo::read_chunk        (send loop)
//! receive loop ──▶ PlaybackQueue ──▶ AudioIo::drain_playback ──cmd──▶ playback thread
//! ```
//!
//! [`AudioIo`] is opened once per engine lifetime and shared by every connection attempt.

mod capture;
mod cpal_backend;
mod playback;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

pub use cpal_backend::CpalBackend;
pub use playback::PlaybackQueue;

use crate::config::AudioConfig;
use crate::{Error, Result};

/// Raw 16-bit little-endian PCM plus its format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    /// Wrap raw PCM bytes
    #[must_use]
    pub const fn new(data: Vec<u8>, sample_rate: u32, channels: u16) -> Self {
        Self {
            data,
            sample_rate,
            channels,
        }
    }

    /// Encode samples as a frame
    #[must_use]
    pub fn from_samples(samples: &[i16], sample_rate: u32, channels: u16) -> Self {
        let data = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::new(data, sample_rate, channels)
    }

    /// Decode the frame's samples (a trailing odd byte is ignored)
    #[must_use]
    pub fn samples(&self) -> Vec<i16> {
        self.data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    /// Size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the frame carries no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Playback duration of the frame
    #[must_use]
    pub fn duration(&self) -> Duration {
        let per_second = u64::from(self.sample_rate) * u64::from(self.channels) * 2;
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.data.len() as u64 * 1_000_000 / per_second)
    }
}

/// Blocking microphone handle, driven from a worker thread
pub trait CaptureDevice {
    /// Block until one chunk of audio is available
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the device fails
    fn read_chunk(&mut self) -> Result<AudioFrame>;
}

/// Blocking speaker handle, driven from a worker thread
pub trait PlaybackDevice {
    /// Write one frame, blocking until the device has accepted it
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the device fails
    fn write(&mut self, frame: &AudioFrame) -> Result<()>;
}

/// Source of audio devices
///
/// Devices are opened on the thread that uses them.
pub trait AudioBackend: Send + Sync + 'static {
    /// Open the input device for mono capture
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if no suitable device is available
    fn open_capture(&self, sample_rate: u32, chunk_size: usize) -> Result<Box<dyn CaptureDevice>>;

    /// Open the output device for mono playback
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if no suitable device is available
    fn open_playback(&self, sample_rate: u32) -> Result<Box<dyn PlaybackDevice>>;
}

/// Capture and playback for one engine lifetime
pub struct AudioIo {
    captured: Mutex<mpsc::Receiver<Result<AudioFrame>>>,
    capture: capture::CaptureWorker,
    playback: playback::PlaybackWorker,
    queue: Arc<PlaybackQueue>,
    config: AudioConfig,
    closed: AtomicBool,
}

impl AudioIo {
    /// Open both devices and start their worker threads
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if either device cannot be opened
    pub async fn open(backend: Arc<dyn AudioBackend>, config: AudioConfig) -> Result<Self> {
        let (capture, captured) = capture::CaptureWorker::spawn(Arc::clone(&backend), config).await?;
        let playback = match playback::PlaybackWorker::spawn(backend, config.output_sample_rate).await
        {
            Ok(playback) => playback,
            Err(e) => {
                capture.stop();
                return Err(e);
            }
        };

        tracing::info!(
            input_rate = config.input_sample_rate,
            output_rate = config.output_sample_rate,
            chunk = config.chunk_size,
            "audio opened"
        );

        Ok(Self {
            captured: Mutex::new(captured),
            capture,
            playback,
            queue: Arc::new(PlaybackQueue::new(config.playback_queue_capacity)),
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Wait for the next microphone chunk
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if capture failed repeatedly or has stopped
    pub async fn read_chunk(&self) -> Result<AudioFrame> {
        let mut captured = self.captured.lock().await;
        captured
            .recv()
            .await
            .unwrap_or_else(|| Err(Error::Audio("capture stopped".to_string())))
    }

    /// Drop microphone chunks captured while no attempt was reading
    ///
    /// Returns the number of frames discarded.
    ///
    /// # Errors
    ///
    /// Returns the capture failure if one was queued among the stale frames
    pub async fn discard_captured(&self) -> Result<usize> {
        let mut captured = self.captured.lock().await;
        let mut discarded = 0;
        while let Ok(item) = captured.try_recv() {
            item?;
            discarded += 1;
        }
        Ok(discarded)
    }

    /// Queue a frame for playback without blocking
    pub fn enqueue_playback(&self, frame: AudioFrame) {
        self.queue.push(frame);
    }

    /// Drop everything waiting to be played
    ///
    /// Returns the number of frames dropped.
    pub fn clear_playback(&self) -> usize {
        self.queue.clear()
    }

    /// Frames waiting to be played
    #[must_use]
    pub fn playback_len(&self) -> usize {
        self.queue.len()
    }

    /// Resolves once the playback queue has emptied
    pub async fn playback_drained(&self) {
        self.queue.drained().await;
    }

    /// Feed queued frames to the speaker until cancelled
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` after `max_playback_failures` consecutive write failures
    pub async fn drain_playback(&self, cancel: CancellationToken) -> Result<()> {
        let mut failures = 0u32;

        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                frame = self.queue.next() => frame,
            };

            let written = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                written = self.playback.write(frame) => written,
            };

            match written {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "playback write failed");
                    if failures >= self.config.max_playback_failures {
                        return Err(Error::Audio(format!(
                            "playback failed {failures} times in a row: {e}"
                        )));
                    }
                }
            }
        }
    }

    /// Audio configuration in use
    #[must_use]
    pub const fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Stop both workers and release the devices
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.capture.stop();
        self.playback.stop();
        self.queue.clear();
        tracing::info!("audio closed");
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for AudioIo {
    fn drop(&mut self) {
        self.close();
    }
}

/// Encode 16-bit PCM as a WAV file
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for b in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([b[0], b[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Root-mean-square level of 16-bit PCM, normalized to 0.0..=1.0
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms_level(pcm: &[u8]) -> f32 {
    let samples: Vec<f32> = pcm
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect();

    if samples.is_empty() {
        return 0.0;
    }

    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
