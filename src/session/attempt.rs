//! One connection attempt
//!
//! An attempt runs four tasks until the first of them finishes:
//!
//! - send: microphone chunks to the remote, gated by status and send cooldown
//! - receive: server events in arrival order (status, playback, tools, history)
//! - playback: drains the playback queue into the speaker
//! - watchdog: ends the attempt if `Processing` stalls
//!
//! The rest are then cancelled and joined under a bounded timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::history::{HistoryBuffer, TranscriptCollector};
use super::state::{SessionState, SessionStatus};
use super::watchdog::Watchdog;
use crate::audio::AudioIo;
use crate::tools::{self, ToolCallRequest, ToolCallResponse, ToolDispatcher};
use crate::transport::{Connection, EventStream, ServerEvent, TransportSink};
use crate::{Error, Result};

type SharedSink = Arc<tokio::sync::Mutex<Box<dyn TransportSink>>>;

/// How an attempt ended
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Cancelled from outside, usually because the session is stopping
    Cancelled,
    /// The session was ended from within (exit tool)
    Stopped,
    /// A voice change needs a fresh connection
    VoiceChange,
    /// The server asked us to reconnect
    GoAway,
    /// The watchdog ended a stalled attempt
    WatchdogTimeout,
    /// The remote closed the connection without an error
    Closed,
    /// Connect, transport, protocol or hardware failure
    Failed(Error),
}

/// Result of one attempt
#[derive(Debug)]
pub struct AttemptReport {
    pub outcome: AttemptOutcome,
    /// At least one turn completed during the attempt
    pub turn_completed: bool,
}

impl AttemptReport {
    pub(crate) const fn new(outcome: AttemptOutcome) -> Self {
        Self {
            outcome,
            turn_completed: false,
        }
    }
}

/// Shared handles for the tasks of one attempt
#[derive(Clone)]
pub(crate) struct AttemptContext {
    pub state: Arc<SessionState>,
    pub audio: Arc<AudioIo>,
    pub dispatcher: Arc<dyn ToolDispatcher>,
    pub history: Arc<Mutex<HistoryBuffer>>,
    pub send_cooldown: Duration,
    pub watchdog: Watchdog,
    pub join_timeout: Duration,
}

enum TaskEnd {
    Send(Result<()>),
    Receive(Result<ReceiveEnd>),
    Playback(Result<()>),
    Watchdog(bool),
}

enum ReceiveEnd {
    Cancelled,
    Stopped,
    VoiceChange,
    GoAway,
    Closed,
}

impl AttemptContext {
    /// Run the attempt over an established connection until it ends
    pub(crate) async fn run(&self, connection: Connection, cancel: CancellationToken) -> AttemptReport {
        let Connection { sink, events } = connection;
        let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
        let turn_completed = Arc::new(AtomicBool::new(false));

        let mut tasks = JoinSet::new();
        {
            let (ctx, sink, cancel) = (self.clone(), Arc::clone(&sink), cancel.clone());
            tasks.spawn(async move { TaskEnd::Send(ctx.send_loop(&sink, &cancel).await) });
        }
        {
            let (ctx, sink, cancel) = (self.clone(), Arc::clone(&sink), cancel.clone());
            let turn_completed = Arc::clone(&turn_completed);
            tasks.spawn(async move {
                TaskEnd::Receive(ctx.receive_loop(events, &sink, &turn_completed, &cancel).await)
            });
        }
        {
            let (audio, cancel) = (Arc::clone(&self.audio), cancel.clone());
            tasks.spawn(async move { TaskEnd::Playback(audio.drain_playback(cancel).await) });
        }
        {
            let (watchdog, state, cancel) = (self.watchdog, Arc::clone(&self.state), cancel.clone());
            tasks.spawn(async move { TaskEnd::Watchdog(watchdog.run(state, cancel).await) });
        }

        let first = tasks.join_next().await;
        cancel.cancel();

        let outcome = match first {
            Some(Ok(end)) => outcome_of(end),
            Some(Err(e)) => AttemptOutcome::Failed(Error::Transport(format!("attempt task failed: {e}"))),
            None => AttemptOutcome::Cancelled,
        };

        self.shutdown(&mut tasks, &sink).await;

        AttemptReport {
            outcome,
            turn_completed: turn_completed.load(Ordering::SeqCst),
        }
    }

    /// Join the remaining tasks, aborting stragglers, then close the connection
    async fn shutdown(&self, tasks: &mut JoinSet<TaskEnd>, sink: &SharedSink) {
        let joined = tokio::time::timeout(self.join_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Ok(TaskEnd::Send(Err(e)) | TaskEnd::Playback(Err(e))) = result {
                    tracing::debug!(error = %e, "task failed during teardown");
                }
            }
        })
        .await;

        if joined.is_err() {
            tracing::warn!(remaining = tasks.len(), "attempt tasks did not stop in time, aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let closed = tokio::time::timeout(self.join_timeout, async {
            sink.lock().await.close().await
        })
        .await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "error closing connection"),
            Err(_) => tracing::debug!("timed out closing connection"),
        }
    }

    // -- send -----------------------------------------------------------------

    async fn send_loop(&self, sink: &SharedSink, cancel: &CancellationToken) -> Result<()> {
        let stale = self.audio.discard_captured().await?;
        if stale > 0 {
            tracing::trace!(frames = stale, "discarded stale microphone audio");
        }

        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                frame = self.audio.read_chunk() => frame?,
            };

            // Status is re-read for every chunk so turn changes take effect immediately
            if !self.state.may_send(Instant::now()) {
                continue;
            }

            let mut sink = sink.lock().await;
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                sent = sink.send_audio(&frame) => sent?,
            }
            tracing::trace!(bytes = frame.len(), "sent microphone chunk");
        }
    }

    // -- receive --------------------------------------------------------------

    async fn receive_loop(
        &self,
        events: EventStream,
        sink: &SharedSink,
        turn_completed: &AtomicBool,
        cancel: &CancellationToken,
    ) -> Result<ReceiveEnd> {
        let mut collector = TranscriptCollector::default();
        let result = self
            .dispatch_events(events, sink, turn_completed, cancel, &mut collector)
            .await;
        self.commit_transcripts(&mut collector);
        result
    }

    async fn dispatch_events(
        &self,
        mut events: EventStream,
        sink: &SharedSink,
        turn_completed: &AtomicBool,
        cancel: &CancellationToken,
        collector: &mut TranscriptCollector,
    ) -> Result<ReceiveEnd> {
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(ReceiveEnd::Cancelled),
                () = self.state.voice_change_requested() => {
                    if self.voice_change_ready() {
                        return Ok(ReceiveEnd::VoiceChange);
                    }
                    continue;
                }
                // A change requested mid-playback waits for the queue to empty
                () = self.audio.playback_drained(), if self.state.voice_change_pending() => {
                    if self.voice_change_ready() {
                        return Ok(ReceiveEnd::VoiceChange);
                    }
                    continue;
                }
                event = events.next() => event,
            };

            let Some(event) = event else {
                return Ok(ReceiveEnd::Closed);
            };
            let event = event?;
            self.state.touch();

            match event {
                ServerEvent::ModelAudio(frame) => {
                    self.state.set_status(SessionStatus::Speaking);
                    tracing::trace!(bytes = frame.len(), "model audio");
                    self.audio.enqueue_playback(frame);
                }
                ServerEvent::ModelText(text) => {
                    tracing::debug!(text = %text, "model text");
                    collector.push_model_text(&text);
                }
                ServerEvent::InputTranscript(text) => {
                    tracing::debug!(text = %text, "user transcript");
                    collector.push_input(&text);
                }
                ServerEvent::OutputTranscript(text) => {
                    tracing::debug!(text = %text, "assistant transcript");
                    collector.push_output(&text);
                }
                ServerEvent::TurnComplete => {
                    turn_completed.store(true, Ordering::SeqCst);
                    self.commit_transcripts(collector);
                    self.state.start_send_cooldown(Instant::now(), self.send_cooldown);
                    self.state.set_status(SessionStatus::Listening);
                    tracing::debug!("turn complete");

                    if self.state.voice_change_pending() {
                        return Ok(ReceiveEnd::VoiceChange);
                    }
                }
                ServerEvent::Interrupted => {
                    let dropped = self.audio.clear_playback();
                    self.commit_transcripts(collector);
                    self.state.set_status(SessionStatus::Listening);
                    tracing::info!(dropped, "interrupted, playback cleared");
                }
                ServerEvent::ToolCall(calls) => {
                    self.state.set_status(SessionStatus::Processing);
                    let responses = {
                        let _running = self.state.tool_batch();
                        self.execute_tools(calls).await
                    };
                    sink.lock().await.send_tool_responses(&responses).await?;
                    self.state.touch();
                    tracing::debug!(count = responses.len(), "sent tool responses");

                    if !self.state.is_active() {
                        return Ok(ReceiveEnd::Stopped);
                    }
                }
                ServerEvent::ToolCallCancellation(ids) => {
                    // Calls run to completion before the next event is read
                    tracing::debug!(?ids, "tool calls cancelled by remote");
                }
                ServerEvent::ResumptionUpdate(Some(token)) => {
                    tracing::debug!("resumption token updated");
                    self.state.set_resumption_token(token);
                }
                ServerEvent::ResumptionUpdate(None) => {
                    tracing::debug!("session no longer resumable");
                    self.state.clear_resumption_token();
                }
                ServerEvent::GoAway(time_left) => {
                    tracing::info!(time_left = time_left.as_deref().unwrap_or("unknown"), "server requested reconnect");
                    return Ok(ReceiveEnd::GoAway);
                }
            }
        }
    }

    /// Run a batch of tool calls in order, off the async scheduler
    async fn execute_tools(&self, calls: Vec<ToolCallRequest>) -> Vec<ToolCallResponse> {
        let mut responses = Vec::with_capacity(calls.len());

        for call in calls {
            tracing::info!(tool = %call.name, id = %call.id, "executing tool");
            let (id, name) = (call.id.clone(), call.name.clone());
            let dispatcher = Arc::clone(&self.dispatcher);

            let response =
                match tokio::task::spawn_blocking(move || tools::respond(dispatcher.as_ref(), &call)).await {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::error!(tool = %name, error = %e, "tool panicked");
                        ToolCallResponse {
                            id,
                            result: format!("Error executing {name}: {e}"),
                            name,
                        }
                    }
                };
            responses.push(response);
        }

        responses
    }

    fn is_idle(&self) -> bool {
        self.state.status() == SessionStatus::Listening && self.audio.playback_len() == 0
    }

    fn voice_change_ready(&self) -> bool {
        let ready = self.state.voice_change_pending() && self.is_idle();
        if ready {
            tracing::info!("idle, reconnecting for voice change");
        }
        ready
    }

    fn commit_transcripts(&self, collector: &mut TranscriptCollector) {
        if let Ok(mut history) = self.history.lock() {
            collector.flush(&mut history);
        }
    }
}

fn outcome_of(end: TaskEnd) -> AttemptOutcome {
    match end {
        TaskEnd::Receive(Ok(ReceiveEnd::Cancelled))
        | TaskEnd::Send(Ok(()))
        | TaskEnd::Playback(Ok(()))
        | TaskEnd::Watchdog(false) => AttemptOutcome::Cancelled,
        TaskEnd::Receive(Ok(ReceiveEnd::Stopped)) => AttemptOutcome::Stopped,
        TaskEnd::Receive(Ok(ReceiveEnd::VoiceChange)) => AttemptOutcome::VoiceChange,
        TaskEnd::Receive(Ok(ReceiveEnd::GoAway)) => AttemptOutcome::GoAway,
        TaskEnd::Receive(Ok(ReceiveEnd::Closed)) => AttemptOutcome::Closed,
        TaskEnd::Watchdog(true) => AttemptOutcome::WatchdogTimeout,
        TaskEnd::Send(Err(e)) | TaskEnd::Receive(Err(e)) | TaskEnd::Playback(Err(e)) => {
            AttemptOutcome::Failed(e)
        }
    }
}
