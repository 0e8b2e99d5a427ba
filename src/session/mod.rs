//! The conversation session actor.
//!
//! All session state lives in one task that drains a single event queue, so
//! transcript events, reply fragments and commands interleave without locks.
//! Background work (the transcript pump, reply streaming, synthesis) runs in
//! spawned tasks that post results back onto the same queue, tagged with the
//! generation they belong to. Disconnecting bumps the generation, which makes
//! anything still in flight stale on arrival.

use crate::completion::ReplyStreamer;
use crate::config::{SettingsHandle, TranscriptionMode};
use crate::error::KaiwaError;
use crate::history::{History, Turn};
use crate::playback::{AudioPlayer, decode_audio};
use crate::transcript::{TranscriptEvent, TranscriptSource, UtteranceAccumulator};
use crate::tts::{SpeechSynthesizer, strip_spoken_symbols};
use std::sync::Arc;
use tokio::sync::mpsc;

const EVENT_QUEUE_DEPTH: usize = 64;
const UPDATE_QUEUE_DEPTH: usize = 64;

/// Where the session is in its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected; no audio flows.
    Idle,
    /// Transcript source is starting up.
    Connecting,
    /// Capturing speech, waiting for a completed utterance.
    Listening,
    /// Streaming a reply from the language model.
    Generating,
    /// Turning the reply into audio.
    Synthesizing,
}

/// Updates the session pushes to its display surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    StateChanged(SessionState),
    /// The utterance currently being spoken, refreshed on every delta.
    LiveTranscript(String),
    /// Visible turns after a change (excludes the persona system turn).
    HistoryChanged(Vec<Turn>),
    /// A stage failed; the session already recovered to a stable state.
    StageError { message: String },
}

enum SessionEvent {
    Connect,
    Disconnect,
    SendText(String),
    Transcript {
        generation: u64,
        event: TranscriptEvent,
    },
    /// The transcript source's event channel closed without a stop.
    SourceClosed {
        generation: u64,
    },
    Fragment {
        generation: u64,
        text: String,
    },
    StreamDone {
        generation: u64,
    },
    StreamFailed {
        generation: u64,
        error: KaiwaError,
    },
    SpeechReady {
        generation: u64,
        audio: Vec<u8>,
    },
    SpeechFailed {
        generation: u64,
        error: KaiwaError,
    },
}

/// Cheap clonable handle for driving a running session.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
}

impl SessionHandle {
    pub async fn connect(&self) {
        let _ = self.events.send(SessionEvent::Connect).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.events.send(SessionEvent::Disconnect).await;
    }

    /// Submit a typed message, equivalent to a completed utterance.
    pub async fn send_text(&self, text: impl Into<String>) {
        let _ = self
            .events
            .send(SessionEvent::SendText(text.into()))
            .await;
    }
}

pub struct ConversationSession {
    source: Box<dyn TranscriptSource>,
    streamer: Arc<dyn ReplyStreamer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    player: AudioPlayer,
    settings: SettingsHandle,

    state: SessionState,
    history: History,
    accumulator: UtteranceAccumulator,
    reply_buffer: String,
    generation: u64,

    // Weak so the actor's own reference never keeps the queue alive;
    // the actor exits once every handle is gone
    events_tx: mpsc::WeakSender<SessionEvent>,
    updates_tx: mpsc::Sender<SessionUpdate>,
    pump_task: Option<tokio::task::JoinHandle<()>>,
    stream_task: Option<tokio::task::JoinHandle<()>>,
    speech_task: Option<tokio::task::JoinHandle<()>>,
}

impl ConversationSession {
    /// Spawn the session actor.
    ///
    /// Returns the command handle and the update stream. The actor exits
    /// when every handle clone is dropped.
    pub fn spawn(
        source: Box<dyn TranscriptSource>,
        streamer: Arc<dyn ReplyStreamer>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        player: AudioPlayer,
        settings: SettingsHandle,
    ) -> (SessionHandle, mpsc::Receiver<SessionUpdate>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);

        let persona = settings.snapshot().persona.instructions;
        let accumulator = accumulator_for(&settings);

        let session = Self {
            source,
            streamer,
            synthesizer,
            player,
            settings,
            state: SessionState::Idle,
            history: History::new(persona),
            accumulator,
            reply_buffer: String::new(),
            generation: 0,
            events_tx: events_tx.downgrade(),
            updates_tx,
            pump_task: None,
            stream_task: None,
            speech_task: None,
        };

        tokio::spawn(session.run(events_rx));

        (SessionHandle { events: events_tx }, updates_rx)
    }

    async fn run(mut self, mut events_rx: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events_rx.recv().await {
            self.handle(event).await;
        }
        // All handles dropped: tear down whatever is still running
        self.teardown().await;
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connect => self.on_connect().await,
            SessionEvent::Disconnect => self.on_disconnect().await,
            SessionEvent::SendText(text) => self.on_send_text(text).await,
            SessionEvent::Transcript { generation, event } => {
                if generation == self.generation {
                    self.on_transcript(event).await;
                }
            }
            SessionEvent::SourceClosed { generation } => {
                if generation == self.generation {
                    self.on_source_closed().await;
                }
            }
            SessionEvent::Fragment { generation, text } => {
                if generation == self.generation {
                    self.on_fragment(text).await;
                }
            }
            SessionEvent::StreamDone { generation } => {
                if generation == self.generation {
                    self.on_stream_done().await;
                }
            }
            SessionEvent::StreamFailed { generation, error } => {
                if generation == self.generation {
                    self.on_stream_failed(error).await;
                }
            }
            SessionEvent::SpeechReady { generation, audio } => {
                if generation == self.generation {
                    self.on_speech_ready(audio).await;
                }
            }
            SessionEvent::SpeechFailed { generation, error } => {
                if generation == self.generation {
                    self.on_speech_failed(error).await;
                }
            }
        }
    }

    async fn on_connect(&mut self) {
        if self.state != SessionState::Idle {
            log::warn!("connect ignored in state {:?}", self.state);
            return;
        }
        self.set_state(SessionState::Connecting).await;
        self.accumulator = accumulator_for(&self.settings);

        let (transcript_tx, mut transcript_rx) = mpsc::channel::<TranscriptEvent>(EVENT_QUEUE_DEPTH);
        if let Err(e) = self.source.start(transcript_tx).await {
            self.report_error(&e).await;
            self.set_state(SessionState::Idle).await;
            return;
        }

        let events_tx = self.events_tx.clone();
        let generation = self.generation;
        self.pump_task = Some(tokio::spawn(async move {
            while let Some(event) = transcript_rx.recv().await {
                let Some(tx) = events_tx.upgrade() else { return };
                if tx
                    .send(SessionEvent::Transcript { generation, event })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            // Channel closed without a stop(): the backend connection died
            if let Some(tx) = events_tx.upgrade() {
                let _ = tx.send(SessionEvent::SourceClosed { generation }).await;
            }
        }));

        self.set_state(SessionState::Listening).await;
    }

    async fn on_disconnect(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        self.teardown().await;
        self.history.reset();
        self.accumulator.clear();
        self.reply_buffer.clear();
        self.send_update(SessionUpdate::LiveTranscript(String::new()))
            .await;
        self.send_update(SessionUpdate::HistoryChanged(
            self.history.visible_turns().cloned().collect(),
        ))
        .await;
        self.set_state(SessionState::Idle).await;
    }

    /// Stop all in-flight work and invalidate anything it already queued.
    async fn teardown(&mut self) {
        self.generation += 1;
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        if let Some(task) = self.speech_task.take() {
            task.abort();
        }
        if let Some(task) = self.pump_task.take() {
            task.abort();
        }
        if let Err(e) = self.source.stop().await {
            log::warn!("transcript source stop failed: {e}");
        }
        self.player.stop();
    }

    /// Reconnection is manual: a lost transcription connection idles the
    /// session rather than retrying.
    async fn on_source_closed(&mut self) {
        self.report_error(&KaiwaError::Connection {
            message: "transcription connection lost".to_string(),
        })
        .await;
        self.teardown().await;
        self.history.reset();
        self.accumulator.clear();
        self.reply_buffer.clear();
        self.set_state(SessionState::Idle).await;
    }

    async fn on_send_text(&mut self, text: String) {
        if self.state != SessionState::Listening {
            self.send_update(SessionUpdate::StageError {
                message: format!("cannot send text while {:?}", self.state),
            })
            .await;
            return;
        }
        self.begin_turn(text).await;
    }

    async fn on_transcript(&mut self, event: TranscriptEvent) {
        let finalized = self.accumulator.apply(&event);
        self.send_update(SessionUpdate::LiveTranscript(
            self.accumulator.text().to_string(),
        ))
        .await;

        if let Some(utterance) = finalized {
            if self.state != SessionState::Listening {
                // A turn is already running; this utterance is dropped
                log::debug!("utterance ignored in state {:?}", self.state);
                return;
            }
            self.begin_turn(utterance).await;
        }
    }

    async fn begin_turn(&mut self, utterance: String) {
        let text = utterance.trim().to_string();
        if text.is_empty() {
            return;
        }

        self.history.push_user(text);
        self.history.push_assistant_placeholder();
        self.reply_buffer.clear();
        self.send_update(SessionUpdate::HistoryChanged(
            self.history.visible_turns().cloned().collect(),
        ))
        .await;
        self.set_state(SessionState::Generating).await;

        let streamer = self.streamer.clone();
        let history = self.history.clone();
        let events_tx = self.events_tx.clone();
        let generation = self.generation;
        self.stream_task = Some(tokio::spawn(async move {
            let send = |event: SessionEvent| {
                let tx = events_tx.upgrade();
                async move {
                    match tx {
                        Some(tx) => tx.send(event).await.is_ok(),
                        None => false,
                    }
                }
            };
            let mut stream = match streamer.stream_reply(&history).await {
                Ok(stream) => stream,
                Err(error) => {
                    let _ = send(SessionEvent::StreamFailed { generation, error }).await;
                    return;
                }
            };
            loop {
                match stream.next_fragment().await {
                    Ok(Some(text)) => {
                        if !send(SessionEvent::Fragment { generation, text }).await {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = send(SessionEvent::StreamDone { generation }).await;
                        return;
                    }
                    Err(error) => {
                        let _ = send(SessionEvent::StreamFailed { generation, error }).await;
                        return;
                    }
                }
            }
        }));
    }

    async fn on_fragment(&mut self, text: String) {
        self.reply_buffer.push_str(&text);
        self.history.set_assistant_text(&self.reply_buffer);
        self.send_update(SessionUpdate::HistoryChanged(
            self.history.visible_turns().cloned().collect(),
        ))
        .await;
    }

    async fn on_stream_done(&mut self) {
        self.stream_task = None;
        let reply = self.reply_buffer.clone();
        if reply.trim().is_empty() {
            self.set_state(SessionState::Listening).await;
            return;
        }
        self.set_state(SessionState::Synthesizing).await;

        let synthesizer = self.synthesizer.clone();
        let events_tx = self.events_tx.clone();
        let generation = self.generation;
        self.speech_task = Some(tokio::spawn(async move {
            // The spoken text loses emoji; the displayed reply keeps them
            let spoken = strip_spoken_symbols(&reply);
            let result = if spoken.trim().is_empty() {
                Ok(Vec::new())
            } else {
                synthesizer.synthesize(&spoken).await
            };
            let event = match result {
                Ok(audio) => SessionEvent::SpeechReady { generation, audio },
                Err(error) => SessionEvent::SpeechFailed { generation, error },
            };
            if let Some(tx) = events_tx.upgrade() {
                let _ = tx.send(event).await;
            }
        }));
    }

    async fn on_stream_failed(&mut self, error: KaiwaError) {
        self.stream_task = None;
        // Partial reply text stays in the history
        self.report_error(&error).await;
        self.set_state(SessionState::Listening).await;
    }

    async fn on_speech_ready(&mut self, audio: Vec<u8>) {
        self.speech_task = None;
        if !audio.is_empty() {
            match decode_audio(&audio) {
                Ok(decoded) => {
                    if let Err(e) = self.player.play(decoded) {
                        self.report_error(&e).await;
                    }
                }
                Err(e) => self.report_error(&e).await,
            }
        }
        self.set_state(SessionState::Listening).await;
    }

    async fn on_speech_failed(&mut self, error: KaiwaError) {
        self.speech_task = None;
        self.report_error(&error).await;
        self.set_state(SessionState::Listening).await;
    }

    async fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.send_update(SessionUpdate::StateChanged(state)).await;
    }

    async fn report_error(&mut self, error: &KaiwaError) {
        log::warn!("session stage failed: {error}");
        self.send_update(SessionUpdate::StageError {
            message: error.to_string(),
        })
        .await;
    }

    async fn send_update(&mut self, update: SessionUpdate) {
        if self.updates_tx.send(update).await.is_err() {
            log::debug!("update receiver dropped");
        }
    }
}

fn accumulator_for(settings: &SettingsHandle) -> UtteranceAccumulator {
    match settings.snapshot().transcription.mode {
        TranscriptionMode::Realtime => UtteranceAccumulator::appending(),
        TranscriptionMode::Local => UtteranceAccumulator::replacing(),
    }
}
