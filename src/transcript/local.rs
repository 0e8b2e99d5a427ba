//! On-device continuous recognition backend.
//!
//! Wraps a platform recognition engine behind a trait and polls it for
//! segments. Interim segments carry the *full* text recognized so far for the
//! current utterance, so this backend emits replacing deltas.

use crate::error::{KaiwaError, Result};
use crate::transcript::{TranscriptEvent, TranscriptSource};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One recognized piece of speech from the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionSegment {
    pub text: String,
    /// Final segments end the utterance; interim ones may still change.
    pub is_final: bool,
}

impl RecognitionSegment {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn finalized(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// A continuous speech recognition engine.
///
/// `poll` drains whatever the engine produced since the last call. Engines
/// run their own capture, so there is no microphone to manage here.
pub trait RecognitionEngine: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn poll(&mut self) -> Result<Vec<RecognitionSegment>>;
}

/// Transcript source backed by a local [`RecognitionEngine`].
pub struct LocalTranscriber {
    engine: Option<Box<dyn RecognitionEngine>>,
    shutdown: Option<oneshot::Sender<()>>,
    poll_task: Option<tokio::task::JoinHandle<()>>,
}

impl LocalTranscriber {
    pub fn new(engine: Box<dyn RecognitionEngine>) -> Self {
        Self {
            engine: Some(engine),
            shutdown: None,
            poll_task: None,
        }
    }
}

#[async_trait]
impl TranscriptSource for LocalTranscriber {
    async fn start(&mut self, events: mpsc::Sender<TranscriptEvent>) -> Result<()> {
        let mut engine = self.engine.take().ok_or_else(|| KaiwaError::Transcription {
            message: "transcriber already started".to_string(),
        })?;
        engine.start()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        self.shutdown = Some(shutdown_tx);

        self.poll_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        let segments = match engine.poll() {
                            Ok(segments) => segments,
                            Err(e) => {
                                log::warn!("recognition engine poll failed: {e}");
                                break;
                            }
                        };
                        for event in segments_to_events(&segments) {
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            if let Err(e) = engine.stop() {
                log::warn!("recognition engine stop failed: {e}");
            }
        }));

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.shutdown = None;
        if let Some(task) = self.poll_task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

/// Fold one poll batch into transcript events.
///
/// Final segments in a batch concatenate into one completed utterance.
/// Interim segments concatenate into one delta carrying the full interim
/// text, which replaces the previous interim downstream.
fn segments_to_events(segments: &[RecognitionSegment]) -> Vec<TranscriptEvent> {
    let mut events = Vec::new();
    let mut finals = String::new();
    let mut interim = String::new();

    for segment in segments {
        if segment.is_final {
            finals.push_str(&segment.text);
        } else {
            interim.push_str(&segment.text);
        }
    }

    if !finals.is_empty() {
        events.push(TranscriptEvent::Completed { text: finals });
    }
    if !interim.is_empty() {
        events.push(TranscriptEvent::Delta { text: interim });
    }
    events
}

/// Scripted recognition engine for testing.
pub struct MockRecognitionEngine {
    batches: Vec<Vec<RecognitionSegment>>,
    cursor: usize,
    running: bool,
}

impl MockRecognitionEngine {
    pub fn new() -> Self {
        Self {
            batches: Vec::new(),
            cursor: 0,
            running: false,
        }
    }

    /// Segment batches returned by successive `poll` calls.
    pub fn with_batches(mut self, batches: Vec<Vec<RecognitionSegment>>) -> Self {
        self.batches = batches;
        self
    }
}

impl Default for MockRecognitionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecognitionEngine for MockRecognitionEngine {
    fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<RecognitionSegment>> {
        if !self.running || self.cursor >= self.batches.len() {
            return Ok(Vec::new());
        }
        let batch = self.batches[self.cursor].clone();
        self.cursor += 1;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interim_segments_become_one_delta() {
        let events = segments_to_events(&[
            RecognitionSegment::interim("hello "),
            RecognitionSegment::interim("world"),
        ]);
        assert_eq!(
            events,
            vec![TranscriptEvent::Delta {
                text: "hello world".to_string()
            }]
        );
    }

    #[test]
    fn test_final_segments_become_completed() {
        let events = segments_to_events(&[RecognitionSegment::finalized("hello world")]);
        assert_eq!(
            events,
            vec![TranscriptEvent::Completed {
                text: "hello world".to_string()
            }]
        );
    }

    #[test]
    fn test_mixed_batch_orders_completed_before_interim() {
        // A final result together with the start of the next utterance
        let events = segments_to_events(&[
            RecognitionSegment::finalized("first utterance"),
            RecognitionSegment::interim("sec"),
        ]);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TranscriptEvent::Completed { text } if text == "first utterance"));
        assert!(matches!(&events[1], TranscriptEvent::Delta { text } if text == "sec"));
    }

    #[test]
    fn test_empty_batch_yields_nothing() {
        assert!(segments_to_events(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_local_transcriber_forwards_engine_output() {
        let engine = MockRecognitionEngine::new().with_batches(vec![
            vec![RecognitionSegment::interim("hel")],
            vec![RecognitionSegment::interim("hello")],
            vec![RecognitionSegment::finalized("hello")],
        ]);
        let mut source = LocalTranscriber::new(Box::new(engine));

        let (tx, mut rx) = mpsc::channel(16);
        source.start(tx).await.expect("start");

        assert_eq!(
            rx.recv().await,
            Some(TranscriptEvent::Delta {
                text: "hel".to_string()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(TranscriptEvent::Delta {
                text: "hello".to_string()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(TranscriptEvent::Completed {
                text: "hello".to_string()
            })
        );

        source.stop().await.expect("stop");
        assert_eq!(rx.recv().await, None, "channel closes after stop");
    }

    #[tokio::test]
    async fn test_local_transcriber_stop_is_idempotent() {
        let mut source = LocalTranscriber::new(Box::new(MockRecognitionEngine::new()));
        source.stop().await.expect("stop before start");

        let (tx, _rx) = mpsc::channel(4);
        source.start(tx).await.expect("start");
        source.stop().await.expect("stop");
        source.stop().await.expect("second stop");
    }
}
