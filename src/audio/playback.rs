//! Speaker worker thread and playback queue

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, oneshot};

use super::{AudioBackend, AudioFrame, PlaybackDevice};
use crate::{Error, Result};

/// Bounded FIFO between the receive loop and the playback drain
///
/// Pushing never blocks: when full, the oldest frame is dropped.
#[derive(Debug)]
pub struct PlaybackQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    available: Notify,
    drained: Notify,
    dropped: AtomicU64,
}

impl PlaybackQueue {
    /// Create a queue holding at most `capacity` frames
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            available: Notify::new(),
            drained: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a frame, dropping the oldest one when full
    pub fn push(&self, frame: AudioFrame) {
        if let Ok(mut frames) = self.frames.lock() {
            if frames.len() >= self.capacity {
                frames.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(capacity = self.capacity, dropped, "playback queue full, dropped oldest frame");
            }
            frames.push_back(frame);
        }
        self.available.notify_one();
    }

    /// Take the oldest frame if there is one
    pub fn pop(&self) -> Option<AudioFrame> {
        let (frame, emptied) = self.frames.lock().ok().map_or((None, false), |mut frames| {
            let frame = frames.pop_front();
            (frame, frames.is_empty())
        });
        if frame.is_some() && emptied {
            self.drained.notify_one();
        }
        frame
    }

    /// Wait for the next frame
    pub async fn next(&self) -> AudioFrame {
        loop {
            if let Some(frame) = self.pop() {
                return frame;
            }
            self.available.notified().await;
        }
    }

    /// Drop every queued frame, returning how many were dropped
    pub fn clear(&self) -> usize {
        self.frames
            .lock()
            .map(|mut frames| {
                let n = frames.len();
                frames.clear();
                n
            })
            .inspect(|&n| {
                if n > 0 {
                    self.drained.notify_one();
                }
            })
            .unwrap_or_default()
    }

    /// Resolves after the queue last went from non-empty to empty
    ///
    /// A drain that happened before the call is remembered, so callers must
    /// re-check `is_empty` when woken.
    pub async fn drained(&self) {
        self.drained.notified().await;
    }

    /// Number of queued frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().map(|frames| frames.len()).unwrap_or_default()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames dropped because the queue was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct WriteRequest {
    frame: AudioFrame,
    reply: oneshot::Sender<Result<()>>,
}

/// Handle to the thread writing to the speaker
pub(super) struct PlaybackWorker {
    requests: Mutex<Option<std::sync::mpsc::Sender<WriteRequest>>>,
}

impl PlaybackWorker {
    /// Open the output device on a new thread
    pub(super) async fn spawn(backend: Arc<dyn AudioBackend>, sample_rate: u32) -> Result<Self> {
        let (tx, rx) = std::sync::mpsc::channel::<WriteRequest>();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || run(backend.as_ref(), sample_rate, &rx, ready_tx))
            .map_err(|e| Error::Audio(format!("failed to start playback thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                requests: Mutex::new(Some(tx)),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Audio("playback thread exited during startup".to_string())),
        }
    }

    /// Write one frame on the playback thread
    pub(super) async fn write(&self, frame: AudioFrame) -> Result<()> {
        let (reply, response) = oneshot::channel();
        let sent = self
            .requests
            .lock()
            .ok()
            .and_then(|requests| requests.as_ref().map(|tx| tx.send(WriteRequest { frame, reply })));

        match sent {
            Some(Ok(())) => {}
            _ => return Err(Error::Audio("playback stopped".to_string())),
        }

        response
            .await
            .unwrap_or_else(|_| Err(Error::Audio("playback thread exited".to_string())))
    }

    /// Close the request channel; the thread exits after its current write
    pub(super) fn stop(&self) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.take();
        }
    }
}

fn run(
    backend: &dyn AudioBackend,
    sample_rate: u32,
    requests: &std::sync::mpsc::Receiver<WriteRequest>,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut device: Option<Box<dyn PlaybackDevice>> = match backend.open_playback(sample_rate) {
        Ok(device) => {
            let _ = ready.send(Ok(()));
            Some(device)
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Ok(WriteRequest { frame, reply }) = requests.recv() {
        let result = write_with_reopen(backend, sample_rate, &mut device, &frame);
        let _ = reply.send(result);
    }

    tracing::debug!("playback worker stopped");
}

/// Write a frame; on failure reopen the device and retry once
fn write_with_reopen(
    backend: &dyn AudioBackend,
    sample_rate: u32,
    device: &mut Option<Box<dyn PlaybackDevice>>,
    frame: &AudioFrame,
) -> Result<()> {
    if let Some(dev) = device.as_mut() {
        match dev.write(frame) {
            Ok(()) => return Ok(()),
            Err(e) => tracing::warn!(error = %e, "playback write failed, reopening device"),
        }
    }

    // Release the failed device before opening a new one
    *device = None;
    let mut reopened = backend.open_playback(sample_rate)?;
    tracing::info!("playback device reopened");
    let result = reopened.write(frame);
    *device = Some(reopened);
    result
}
