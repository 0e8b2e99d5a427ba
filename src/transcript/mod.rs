//! Transcript event sources and utterance accumulation.
//!
//! Two interchangeable backends produce the same event stream: the realtime
//! cloud backend ([`realtime::RealtimeTranscriber`]) and on-device continuous
//! recognition ([`local::LocalTranscriber`]). The session folds the events
//! into a live utterance with [`UtteranceAccumulator`].

pub mod local;
pub mod realtime;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// One event from a transcription backend.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// Incremental fragment of the utterance currently being spoken.
    Delta { text: String },
    /// The final text of a finished utterance.
    Completed { text: String },
}

/// A source of transcript events (microphone capture + recognition).
///
/// `start` begins capturing and delivers events on the given channel until
/// `stop`. `stop` releases the microphone, is idempotent, and guarantees no
/// further events are emitted after it resolves (the sender is dropped).
#[async_trait]
pub trait TranscriptSource: Send {
    async fn start(&mut self, events: mpsc::Sender<TranscriptEvent>) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
}

/// How `Delta` events combine into the live utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaPolicy {
    /// Realtime backend: each delta is a new fragment, appended.
    Append,
    /// Local backend: each delta is the full interim text, replacing the
    /// previous interim.
    Replace,
}

/// Folds transcript events into the current utterance text.
///
/// The realtime backend never signals "a new utterance starts now"; instead
/// a `Completed` event arms `awaiting_utterance_start`, and the clear happens
/// on the *next* `Delta`. Resetting immediately would lose late deltas some
/// backends deliver after `Completed`.
#[derive(Debug, Clone)]
pub struct UtteranceAccumulator {
    policy: DeltaPolicy,
    text: String,
    awaiting_utterance_start: bool,
}

impl UtteranceAccumulator {
    pub fn new(policy: DeltaPolicy) -> Self {
        Self {
            policy,
            text: String::new(),
            awaiting_utterance_start: false,
        }
    }

    /// Accumulator for the realtime backend (appending deltas).
    pub fn appending() -> Self {
        Self::new(DeltaPolicy::Append)
    }

    /// Accumulator for the local backend (replacing interim deltas).
    pub fn replacing() -> Self {
        Self::new(DeltaPolicy::Replace)
    }

    /// Current live utterance text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Apply one event. Returns the finalized utterance on `Completed`.
    pub fn apply(&mut self, event: &TranscriptEvent) -> Option<String> {
        match event {
            TranscriptEvent::Delta { text } => {
                if self.awaiting_utterance_start {
                    self.text.clear();
                    self.awaiting_utterance_start = false;
                }
                match self.policy {
                    DeltaPolicy::Append => self.text.push_str(text),
                    DeltaPolicy::Replace => {
                        self.text.clear();
                        self.text.push_str(text);
                    }
                }
                None
            }
            TranscriptEvent::Completed { text } => {
                // The completed transcript is authoritative regardless of
                // what deltas arrived before it.
                self.text.clear();
                self.text.push_str(text);
                self.awaiting_utterance_start = true;
                Some(text.clone())
            }
        }
    }

    /// Discard any accumulated text and pending reset flag.
    pub fn clear(&mut self) {
        self.text.clear();
        self.awaiting_utterance_start = false;
    }
}

/// Source that never produces events, for typed-input-only sessions.
pub struct NullTranscriptSource {
    events_tx: Option<mpsc::Sender<TranscriptEvent>>,
}

impl NullTranscriptSource {
    pub fn new() -> Self {
        Self { events_tx: None }
    }
}

impl Default for NullTranscriptSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptSource for NullTranscriptSource {
    async fn start(&mut self, events: mpsc::Sender<TranscriptEvent>) -> Result<()> {
        // Held so the channel stays open until stop
        self.events_tx = Some(events);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.events_tx = None;
        Ok(())
    }
}

/// Mock transcript source for testing.
///
/// Emits a scripted list of events once started, then keeps the channel open
/// until `stop`.
pub struct MockTranscriptSource {
    script: Vec<TranscriptEvent>,
    events_tx: Option<mpsc::Sender<TranscriptEvent>>,
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    fail_start: bool,
    close_after_script: bool,
}

impl MockTranscriptSource {
    pub fn new() -> Self {
        Self {
            script: Vec::new(),
            events_tx: None,
            started: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            fail_start: false,
            close_after_script: false,
        }
    }

    /// Events emitted immediately after `start`.
    pub fn with_events(mut self, script: Vec<TranscriptEvent>) -> Self {
        self.script = script;
        self
    }

    /// Make `start` fail with a connection error.
    pub fn with_start_failure(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Drop the event channel right after the script, as if the backend
    /// connection died without a `stop`.
    pub fn with_close_after_script(mut self) -> Self {
        self.close_after_script = true;
        self
    }

    /// Flag that flips to true once `start` succeeds.
    pub fn started_flag(&self) -> Arc<AtomicBool> {
        self.started.clone()
    }

    /// Flag that flips to true once `stop` runs.
    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }

    /// Emit an event mid-test, as if the backend produced it.
    pub async fn emit(&self, event: TranscriptEvent) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(event).await;
        }
    }
}

impl Default for MockTranscriptSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptSource for MockTranscriptSource {
    async fn start(&mut self, events: mpsc::Sender<TranscriptEvent>) -> Result<()> {
        if self.fail_start {
            return Err(crate::error::KaiwaError::Connection {
                message: "mock transcript source refused to start".to_string(),
            });
        }
        self.started.store(true, Ordering::SeqCst);
        for event in self.script.drain(..) {
            let _ = events.send(event).await;
        }
        if !self.close_after_script {
            self.events_tx = Some(events);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        // Dropping the sender ends the event stream
        self.events_tx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> TranscriptEvent {
        TranscriptEvent::Delta {
            text: text.to_string(),
        }
    }

    fn completed(text: &str) -> TranscriptEvent {
        TranscriptEvent::Completed {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_appending_deltas_accumulate() {
        let mut acc = UtteranceAccumulator::appending();
        assert_eq!(acc.apply(&delta("Hel")), None);
        assert_eq!(acc.apply(&delta("lo")), None);
        assert_eq!(acc.text(), "Hello");
    }

    #[test]
    fn test_replacing_deltas_replace() {
        let mut acc = UtteranceAccumulator::replacing();
        acc.apply(&delta("Hel"));
        acc.apply(&delta("Hello wor"));
        assert_eq!(acc.text(), "Hello wor");
    }

    #[test]
    fn test_completed_is_authoritative() {
        // Property: for any interleaving of deltas followed by one completed,
        // the accumulated text equals the completed text exactly.
        let mut acc = UtteranceAccumulator::appending();
        acc.apply(&delta("Hel"));
        acc.apply(&delta("Hel")); // duplicated fragment
        let finalized = acc.apply(&completed("Hello"));
        assert_eq!(finalized.as_deref(), Some("Hello"));
        assert_eq!(acc.text(), "Hello");
    }

    #[test]
    fn test_reset_deferred_to_next_delta() {
        let mut acc = UtteranceAccumulator::appending();
        acc.apply(&completed("first utterance"));
        // No delta yet: completed text still shown
        assert_eq!(acc.text(), "first utterance");

        // The next delta starts a fresh utterance
        acc.apply(&delta("sec"));
        assert_eq!(acc.text(), "sec");
        acc.apply(&delta("ond"));
        assert_eq!(acc.text(), "second");
    }

    #[test]
    fn test_reset_happens_once_per_boundary() {
        let mut acc = UtteranceAccumulator::appending();
        acc.apply(&completed("one"));
        acc.apply(&delta("t"));
        acc.apply(&delta("wo"));
        // Only the first delta after completed cleared the buffer
        assert_eq!(acc.text(), "two");
    }

    #[test]
    fn test_late_delta_after_completed_starts_fresh() {
        // Some backends deliver deltas belonging to the next utterance right
        // after completed; they must not be glued onto the finished one.
        let mut acc = UtteranceAccumulator::appending();
        acc.apply(&delta("Hello"));
        acc.apply(&completed("Hello"));
        acc.apply(&delta("Bye"));
        assert_eq!(acc.text(), "Bye");
    }

    #[test]
    fn test_clear_discards_pending_reset() {
        let mut acc = UtteranceAccumulator::appending();
        acc.apply(&completed("done"));
        acc.clear();
        assert_eq!(acc.text(), "");
        acc.apply(&delta("new"));
        assert_eq!(acc.text(), "new");
    }

    #[tokio::test]
    async fn test_mock_source_emits_script_then_stays_open() {
        let mut source = MockTranscriptSource::new().with_events(vec![delta("a"), completed("a")]);
        let started = source.started_flag();
        let stopped = source.stopped_flag();

        let (tx, mut rx) = mpsc::channel(8);
        source.start(tx).await.expect("start");
        assert!(started.load(Ordering::SeqCst));

        assert_eq!(rx.recv().await, Some(delta("a")));
        assert_eq!(rx.recv().await, Some(completed("a")));

        source.emit(delta("late")).await;
        assert_eq!(rx.recv().await, Some(delta("late")));

        source.stop().await.expect("stop");
        assert!(stopped.load(Ordering::SeqCst));
        // Channel closes: no events after stop resolves
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_mock_source_stop_is_idempotent() {
        let mut source = MockTranscriptSource::new();
        source.stop().await.expect("stop with nothing pending");
        source.stop().await.expect("second stop");
    }

    #[tokio::test]
    async fn test_mock_source_start_failure() {
        let mut source = MockTranscriptSource::new().with_start_failure();
        let (tx, _rx) = mpsc::channel(8);
        let err = source.start(tx).await.unwrap_err();
        assert!(matches!(err, crate::error::KaiwaError::Connection { .. }));
    }
}
