//! Shared test utilities
//!
//! A scripted connector standing in for the remote service, an in-memory audio
//! backend standing in for the sound card, and a dispatcher that records calls.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};

use duplex_voice::audio::{AudioBackend, AudioFrame, CaptureDevice, PlaybackDevice};
use duplex_voice::config::{AudioConfig, Config, SessionConfig};
use duplex_voice::tools::{
    ToolArgs, ToolCallRequest, ToolCallResponse, ToolDispatcher, ToolError, ToolSchema,
};
use duplex_voice::transport::{ConnectConfig, Connection, Connector, TransportSink};
use duplex_voice::{Error, Result, ServerEvent};

// -- config -------------------------------------------------------------------

/// Configuration with short timings and two credentials
#[must_use]
pub fn test_config() -> Config {
    Config {
        credentials: vec![
            SecretString::from("key-0".to_string()),
            SecretString::from("key-1".to_string()),
        ],
        session: SessionConfig {
            max_retries: 3,
            credential_cooldown: Duration::from_secs(30),
            all_cooldown_wait: Duration::from_millis(50),
            conflict_backoff_base: Duration::from_millis(10),
            retry_delay: Duration::from_millis(10),
            watchdog_threshold: Duration::from_secs(10),
            watchdog_interval: Duration::from_millis(20),
            send_cooldown: Duration::from_millis(20),
            join_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(1),
            history_turns: 20,
            ..SessionConfig::default()
        },
        audio: AudioConfig {
            chunk_size: 160,
            playback_queue_capacity: 64,
            ..AudioConfig::default()
        },
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Build a tool call request with string arguments
#[must_use]
pub fn tool_call(id: &str, name: &str, args: &[(&str, &str)]) -> ToolCallRequest {
    let mut map = ToolArgs::new();
    for (key, value) in args {
        map.insert((*key).to_string(), serde_json::Value::String((*value).to_string()));
    }
    ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        args: map,
    }
}

/// A frame of model speech
#[must_use]
pub fn model_audio() -> ServerEvent {
    ServerEvent::ModelAudio(AudioFrame::from_samples(&[100; 240], 24_000, 1))
}

// -- scripted connector -------------------------------------------------------

/// One step of a scripted connection
pub enum Step {
    /// Deliver an event
    Event(ServerEvent),
    /// Pause before the next step
    Wait(Duration),
    /// Fail the event stream
    Fail(Error),
    /// Keep the connection open without further events
    Hold,
}

/// What the next connect call does
pub enum Script {
    /// Refuse the connection
    Refuse(Error),
    /// Accept and play back the steps; the stream ends after the last one
    Accept(Vec<Step>),
}

/// Record of one connect call
#[derive(Clone)]
pub struct ConnectRecord {
    pub credential: String,
    pub config: ConnectConfig,
    pub at: Instant,
}

/// Something sent over a scripted connection
#[derive(Debug, Clone)]
pub enum Sent {
    Audio { bytes: usize, at: Instant },
    ToolResponses {
        responses: Vec<ToolCallResponse>,
        at: Instant,
    },
}

/// Connector that follows a script; connects beyond the script are refused
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    connects: Arc<Mutex<Vec<ConnectRecord>>>,
    sent: Arc<Mutex<Vec<Sent>>>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    #[must_use]
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            ..Self::default()
        }
    }

    /// Connect calls so far
    #[must_use]
    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.connects.lock().unwrap().clone()
    }

    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    /// Everything sent over every connection, in order
    #[must_use]
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    #[must_use]
    pub fn audio_sent(&self) -> usize {
        self.sent()
            .iter()
            .filter(|s| matches!(s, Sent::Audio { .. }))
            .count()
    }

    #[must_use]
    pub fn tool_responses(&self) -> Vec<Vec<ToolCallResponse>> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::ToolResponses { responses, .. } => Some(responses),
                Sent::Audio { .. } => None,
            })
            .collect()
    }

    /// Connections closed by the engine
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, credential: &SecretString, config: &ConnectConfig) -> Result<Connection> {
        self.connects.lock().unwrap().push(ConnectRecord {
            credential: credential.expose_secret().to_string(),
            config: config.clone(),
            at: Instant::now(),
        });

        let script = self.scripts.lock().unwrap().pop_front();
        let steps = match script {
            Some(Script::Accept(steps)) => steps,
            Some(Script::Refuse(e)) => return Err(e),
            None => return Err(Error::Connect("script exhausted".to_string())),
        };

        let events = futures::stream::unfold(VecDeque::from(steps), |mut steps| async move {
            loop {
                match steps.pop_front()? {
                    Step::Event(event) => return Some((Ok(event), steps)),
                    Step::Fail(e) => return Some((Err(e), steps)),
                    Step::Wait(delay) => tokio::time::sleep(delay).await,
                    Step::Hold => futures::future::pending::<()>().await,
                }
            }
        })
        .boxed();

        Ok(Connection {
            sink: Box::new(RecordingSink {
                sent: Arc::clone(&self.sent),
                closes: Arc::clone(&self.closes),
                closed: false,
            }),
            events,
        })
    }
}

struct RecordingSink {
    sent: Arc<Mutex<Vec<Sent>>>,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl TransportSink for RecordingSink {
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        if self.closed {
            return Err(Error::Transport("closed".to_string()));
        }
        self.sent.lock().unwrap().push(Sent::Audio {
            bytes: frame.len(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn send_tool_responses(&mut self, responses: &[ToolCallResponse]) -> Result<()> {
        if self.closed {
            return Err(Error::Transport("closed".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push(Sent::ToolResponses {
                responses: responses.to_vec(),
                at: Instant::now(),
            });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// -- in-memory audio ----------------------------------------------------------

#[derive(Default)]
struct AudioShared {
    capture_interval: Mutex<Duration>,
    capture_failures: AtomicU32,
    capture_fail_forever: AtomicBool,
    capture_opens: AtomicUsize,
    playback_delay: Mutex<Duration>,
    playback_failures: AtomicU32,
    playback_opens: AtomicUsize,
    played: Mutex<Vec<AudioFrame>>,
}

/// Audio backend producing silence and recording playback
#[derive(Clone)]
pub struct MemoryAudio {
    shared: Arc<AudioShared>,
}

impl Default for MemoryAudio {
    fn default() -> Self {
        let shared = AudioShared::default();
        *shared.capture_interval.lock().unwrap() = Duration::from_millis(5);
        Self {
            shared: Arc::new(shared),
        }
    }
}

impl MemoryAudio {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` capture reads
    pub fn fail_capture(&self, n: u32) {
        self.shared.capture_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every capture read from now on
    pub fn break_capture(&self) {
        self.shared.capture_fail_forever.store(true, Ordering::SeqCst);
    }

    /// Fail the next `n` playback writes
    pub fn fail_playback(&self, n: u32) {
        self.shared.playback_failures.store(n, Ordering::SeqCst);
    }

    /// Make every playback write take `delay`
    pub fn slow_playback(&self, delay: Duration) {
        *self.shared.playback_delay.lock().unwrap() = delay;
    }

    #[must_use]
    pub fn capture_opens(&self) -> usize {
        self.shared.capture_opens.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn playback_opens(&self) -> usize {
        self.shared.playback_opens.load(Ordering::SeqCst)
    }

    /// Frames written to the speaker
    #[must_use]
    pub fn played(&self) -> Vec<AudioFrame> {
        self.shared.played.lock().unwrap().clone()
    }
}

/// Take one failure from `counter`, returning whether there was one
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl AudioBackend for MemoryAudio {
    fn open_capture(&self, sample_rate: u32, chunk_size: usize) -> Result<Box<dyn CaptureDevice>> {
        self.shared.capture_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryCapture {
            shared: Arc::clone(&self.shared),
            sample_rate,
            chunk_size,
        }))
    }

    fn open_playback(&self, _sample_rate: u32) -> Result<Box<dyn PlaybackDevice>> {
        self.shared.playback_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryPlayback {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MemoryCapture {
    shared: Arc<AudioShared>,
    sample_rate: u32,
    chunk_size: usize,
}

impl CaptureDevice for MemoryCapture {
    fn read_chunk(&mut self) -> Result<AudioFrame> {
        let interval = *self.shared.capture_interval.lock().unwrap();
        std::thread::sleep(interval);

        if self.shared.capture_fail_forever.load(Ordering::SeqCst)
            || take_failure(&self.shared.capture_failures)
        {
            return Err(Error::Audio("input overflow".to_string()));
        }
        Ok(AudioFrame::from_samples(
            &vec![0; self.chunk_size],
            self.sample_rate,
            1,
        ))
    }
}

struct MemoryPlayback {
    shared: Arc<AudioShared>,
}

impl PlaybackDevice for MemoryPlayback {
    fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        if take_failure(&self.shared.playback_failures) {
            return Err(Error::Audio("output underrun".to_string()));
        }

        let delay = *self.shared.playback_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.shared.played.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

// -- recording dispatcher -----------------------------------------------------

/// Dispatcher offering one `lookup` tool and recording every call
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    calls: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl RecordingDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call take `delay`
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Call ids in execution order
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ToolDispatcher for RecordingDispatcher {
    fn schemas(&self) -> Vec<ToolSchema> {
        vec![ToolSchema::new("lookup", "Look something up")]
    }

    fn execute(&self, name: &str, args: &ToolArgs) -> std::result::Result<String, ToolError> {
        if name != "lookup" {
            return Err(ToolError::Unknown(name.to_string()));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.calls.lock().unwrap().push(query.clone());
        Ok(format!("found {query}"))
    }
}
