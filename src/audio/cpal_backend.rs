//! Audio devices backed by cpal

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig, SupportedStreamConfigRange};

use super::{AudioBackend, AudioFrame, CaptureDevice, PlaybackDevice};
use crate::{Error, Result};

/// Longest wait for one capture chunk before the device is considered stuck
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

/// Seconds of capture audio kept when nobody is reading
const CAPTURE_BACKLOG_SECS: usize = 2;

/// Default system audio devices
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_capture(&self, sample_rate: u32, chunk_size: usize) -> Result<Box<dyn CaptureDevice>> {
        Ok(Box::new(CpalCapture::open(sample_rate, chunk_size)?))
    }

    fn open_playback(&self, sample_rate: u32) -> Result<Box<dyn PlaybackDevice>> {
        Ok(Box::new(CpalPlayback::open(sample_rate)?))
    }
}

#[derive(Default)]
struct Buffer<T> {
    samples: VecDeque<T>,
    error: Option<String>,
}

type Shared<T> = Arc<(Mutex<Buffer<T>>, Condvar)>;

fn supports(range: &SupportedStreamConfigRange, channels: u16, rate: u32) -> bool {
    range.channels() == channels
        && range.min_sample_rate() <= SampleRate(rate)
        && range.max_sample_rate() >= SampleRate(rate)
}

fn lock_err<T>(_: T) -> Error {
    Error::Audio("audio buffer lock poisoned".to_string())
}

// -- capture ------------------------------------------------------------------

struct CpalCapture {
    _stream: Stream,
    shared: Shared<i16>,
    sample_rate: u32,
    chunk_size: usize,
}

impl CpalCapture {
    fn open(sample_rate: u32, chunk_size: usize) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .collect::<Vec<_>>();

        // Prefer mono; anything else is downmixed in the callback
        let range = supported
            .iter()
            .find(|c| supports(c, 1, sample_rate))
            .or_else(|| {
                supported.iter().find(|c| {
                    c.min_sample_rate() <= SampleRate(sample_rate)
                        && c.max_sample_rate() >= SampleRate(sample_rate)
                })
            })
            .ok_or_else(|| Error::Audio("no suitable input config found".to_string()))?;

        let config: StreamConfig = range.clone().with_sample_rate(SampleRate(sample_rate)).config();
        let channels = usize::from(config.channels.max(1));
        let backlog = sample_rate as usize * CAPTURE_BACKLOG_SECS;

        let shared: Shared<i16> = Arc::new((Mutex::new(Buffer::default()), Condvar::new()));
        let data_shared = Arc::clone(&shared);
        let err_shared = Arc::clone(&shared);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let (lock, ready) = &*data_shared;
                    if let Ok(mut buf) = lock.lock() {
                        for frame in data.chunks(channels) {
                            #[allow(clippy::cast_precision_loss)]
                            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
                            buf.samples.push_back(to_i16(mono));
                        }
                        let excess = buf.samples.len().saturating_sub(backlog);
                        buf.samples.drain(..excess);
                    }
                    ready.notify_all();
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    let (lock, ready) = &*err_shared;
                    if let Ok(mut buf) = lock.lock() {
                        buf.error = Some(err.to_string());
                    }
                    ready.notify_all();
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            _stream: stream,
            shared,
            sample_rate,
            chunk_size,
        })
    }
}

impl CaptureDevice for CpalCapture {
    fn read_chunk(&mut self) -> Result<AudioFrame> {
        let (lock, ready) = &*self.shared;
        let buf = lock.lock().map_err(lock_err)?;

        let (mut buf, _) = ready
            .wait_timeout_while(buf, CAPTURE_TIMEOUT, |b| {
                b.samples.len() < self.chunk_size && b.error.is_none()
            })
            .map_err(lock_err)?;

        if let Some(error) = buf.error.take() {
            return Err(Error::Audio(error));
        }
        if buf.samples.len() < self.chunk_size {
            return Err(Error::Audio("timed out waiting for microphone audio".to_string()));
        }

        let samples: Vec<i16> = buf.samples.drain(..self.chunk_size).collect();
        Ok(AudioFrame::from_samples(&samples, self.sample_rate, 1))
    }
}

// -- playback -----------------------------------------------------------------

struct CpalPlayback {
    _stream: Stream,
    shared: Shared<f32>,
    low_water: usize,
}

impl CpalPlayback {
    fn open(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| supports(c, 1, sample_rate))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports(c, 2, sample_rate))
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();
        let channels = usize::from(config.channels.max(1));

        let shared: Shared<f32> = Arc::new((Mutex::new(Buffer::default()), Condvar::new()));
        let data_shared = Arc::clone(&shared);
        let err_shared = Arc::clone(&shared);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let (lock, drained) = &*data_shared;
                    if let Ok(mut buf) = lock.lock() {
                        for frame in data.chunks_mut(channels) {
                            let sample = buf.samples.pop_front().unwrap_or(0.0);
                            for out in frame.iter_mut() {
                                *out = sample;
                            }
                        }
                    } else {
                        data.fill(0.0);
                    }
                    drained.notify_all();
                },
                move |err| {
                    tracing::error!(error = %err, "audio playback error");
                    let (lock, drained) = &*err_shared;
                    if let Ok(mut buf) = lock.lock() {
                        buf.error = Some(err.to_string());
                    }
                    drained.notify_all();
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            _stream: stream,
            shared,
            // Keep roughly 50ms buffered so writes pace with the device
            low_water: sample_rate as usize / 20,
        })
    }
}

impl PlaybackDevice for CpalPlayback {
    fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        let (lock, drained) = &*self.shared;
        let mut buf = lock.lock().map_err(lock_err)?;

        if let Some(error) = buf.error.take() {
            return Err(Error::Audio(error));
        }

        buf.samples
            .extend(frame.samples().into_iter().map(|s| f32::from(s) / 32768.0));

        let timeout = frame.duration() + Duration::from_secs(1);
        let (mut buf, waited) = drained
            .wait_timeout_while(buf, timeout, |b| {
                b.samples.len() > self.low_water && b.error.is_none()
            })
            .map_err(lock_err)?;

        if let Some(error) = buf.error.take() {
            return Err(Error::Audio(error));
        }
        if waited.timed_out() {
            buf.samples.clear();
            return Err(Error::Audio("output device stopped consuming audio".to_string()));
        }

        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_and_clamps_samples() {
        assert_eq!(to_i16(0.0), 0);
        assert_eq!(to_i16(1.0), 32767);
        assert_eq!(to_i16(-2.0), -32768);
        assert_eq!(to_i16(2.0), 32767);
    }
}
