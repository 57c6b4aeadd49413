//! Microphone worker thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use super::{AudioBackend, AudioFrame, CaptureDevice};
use crate::config::AudioConfig;
use crate::{Error, Result};

/// Chunks buffered between the capture thread and the send loop
const CHANNEL_FRAMES: usize = 32;

/// Pause after a failed reopen before trying again
const REOPEN_PAUSE: Duration = Duration::from_millis(100);

/// Handle to the thread reading the microphone
pub(super) struct CaptureWorker {
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureWorker {
    /// Open the input device on a new thread and start reading
    ///
    /// Chunks arrive on the returned receiver. A capture failure that could not be
    /// recovered by reopening the device is delivered as the final item.
    pub(super) async fn spawn(
        backend: Arc<dyn AudioBackend>,
        config: AudioConfig,
    ) -> Result<(Self, mpsc::Receiver<Result<AudioFrame>>)> {
        let (tx, rx) = mpsc::channel(CHANNEL_FRAMES);
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn({
                let stop = Arc::clone(&stop);
                move || run(backend.as_ref(), config, &tx, &stop, ready_tx)
            })
            .map_err(|e| Error::Audio(format!("failed to start capture thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Audio("capture thread exited during startup".to_string())),
        }

        Ok((
            Self {
                stop,
                thread: Mutex::new(Some(thread)),
            },
            rx,
        ))
    }

    /// Ask the thread to stop after its current read
    pub(super) fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);

        // The device is released when the in-flight read returns
        if let Ok(mut thread) = self.thread.lock() {
            if let Some(handle) = thread.take() {
                if handle.is_finished() {
                    let _ = handle.join();
                }
            }
        }
    }
}

fn run(
    backend: &dyn AudioBackend,
    config: AudioConfig,
    tx: &mpsc::Sender<Result<AudioFrame>>,
    stop: &AtomicBool,
    ready: oneshot::Sender<Result<()>>,
) {
    let open = || backend.open_capture(config.input_sample_rate, config.chunk_size);

    let mut device: Option<Box<dyn CaptureDevice>> = match open() {
        Ok(device) => {
            let _ = ready.send(Ok(()));
            Some(device)
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut failures = 0u32;

    while !stop.load(Ordering::SeqCst) {
        if device.is_none() {
            match open() {
                Ok(dev) => {
                    tracing::info!("capture device reopened");
                    device = Some(dev);
                }
                Err(e) => {
                    if give_up(&mut failures, &e, config, tx, stop) {
                        break;
                    }
                    continue;
                }
            }
        }

        let Some(dev) = device.as_mut() else {
            continue;
        };

        match dev.read_chunk() {
            Ok(frame) => {
                failures = 0;
                match tx.try_send(Ok(frame)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::trace!("capture channel full, dropping chunk");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => {
                // Release the device before reopening it
                device = None;
                if give_up(&mut failures, &e, config, tx, stop) {
                    break;
                }
            }
        }
    }

    tracing::debug!("capture worker stopped");
}

/// Count a failure; once the limit is reached, report it and return true
fn give_up(
    failures: &mut u32,
    error: &Error,
    config: AudioConfig,
    tx: &mpsc::Sender<Result<AudioFrame>>,
    stop: &AtomicBool,
) -> bool {
    *failures += 1;
    tracing::warn!(error = %error, failures = *failures, "capture failed");

    if *failures >= config.max_capture_failures {
        tracing::error!(failures = *failures, "capture failed repeatedly, giving up");
        deliver(
            tx,
            Err(Error::Audio(format!(
                "capture failed {} times in a row: {error}",
                *failures
            ))),
            stop,
        );
        return true;
    }

    std::thread::sleep(REOPEN_PAUSE);
    false
}

/// Send an item that must not be dropped, waiting for room until stopped
fn deliver(tx: &mpsc::Sender<Result<AudioFrame>>, item: Result<AudioFrame>, stop: &AtomicBool) {
    let mut item = item;
    loop {
        match tx.try_send(item) {
            Ok(()) | Err(TrySendError::Closed(_)) => return,
            Err(TrySendError::Full(back)) => {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                item = back;
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}
