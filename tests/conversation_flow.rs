//! End-to-end conversation scenarios with mocked backends.

use kaiwa::completion::MockReplyStreamer;
use kaiwa::config::Settings;
use kaiwa::error::KaiwaError;
use kaiwa::history::Role;
use kaiwa::playback::{AudioPlayer, MockPlaybackSink, NullPlaybackSink};
use kaiwa::session::{ConversationSession, SessionHandle, SessionState, SessionUpdate};
use kaiwa::transcript::{MockTranscriptSource, TranscriptEvent};
use kaiwa::tts::MockSynthesizer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn wav_clip() -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 24_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("writer");
        for i in 0..2400i16 {
            writer.write_sample((i % 100) * 200).expect("write");
        }
        writer.finalize().expect("finalize");
    }
    cursor.into_inner()
}

async fn next_update(rx: &mut mpsc::Receiver<SessionUpdate>) -> SessionUpdate {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("update within timeout")
        .expect("channel open")
}

async fn wait_for(
    rx: &mut mpsc::Receiver<SessionUpdate>,
    mut pred: impl FnMut(&SessionUpdate) -> bool,
) -> SessionUpdate {
    loop {
        let update = next_update(rx).await;
        if pred(&update) {
            return update;
        }
    }
}

async fn connect_and_listen(handle: &SessionHandle, rx: &mut mpsc::Receiver<SessionUpdate>) {
    handle.connect().await;
    wait_for(rx, |u| {
        *u == SessionUpdate::StateChanged(SessionState::Listening)
    })
    .await;
}

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

#[tokio::test]
async fn spoken_utterance_drives_a_full_turn() {
    let source = MockTranscriptSource::new().with_events(vec![
        delta("Hel"),
        delta("lo"),
        completed("Hello"),
    ]);
    let synthesizer = MockSynthesizer::new().with_audio(wav_clip());
    let spoken = synthesizer.requests_handle();

    let (handle, mut updates) = ConversationSession::spawn(
        Box::new(source),
        Arc::new(MockReplyStreamer::new().with_reply(&["Hi ", "there!"])),
        Arc::new(synthesizer),
        AudioPlayer::new(Box::new(NullPlaybackSink)),
        Settings::default().into_handle(),
    );

    connect_and_listen(&handle, &mut updates).await;

    // Live transcript grows as deltas arrive
    wait_for(&mut updates, |u| {
        matches!(u, SessionUpdate::LiveTranscript(text) if text == "Hello")
    })
    .await;

    // Completed utterance becomes a user turn and a streamed reply
    wait_for(&mut updates, |u| {
        matches!(u, SessionUpdate::HistoryChanged(turns)
            if turns.first().is_some_and(|t| t.role == Role::User && t.text == "Hello"))
    })
    .await;
    wait_for(&mut updates, |u| {
        matches!(u, SessionUpdate::HistoryChanged(turns)
            if turns.last().is_some_and(|t| t.role == Role::Assistant && t.text == "Hi there!"))
    })
    .await;

    // The reply is spoken, then the session listens again
    wait_for(&mut updates, |u| {
        *u == SessionUpdate::StateChanged(SessionState::Synthesizing)
    })
    .await;
    wait_for(&mut updates, |u| {
        *u == SessionUpdate::StateChanged(SessionState::Listening)
    })
    .await;

    let requests = spoken.lock().expect("lock");
    assert_eq!(requests.as_slice(), ["Hi there!"]);
}

#[tokio::test]
async fn auth_failure_leaves_empty_reply_and_skips_synthesis() {
    let synthesizer = MockSynthesizer::new().with_audio(wav_clip());
    let spoken = synthesizer.requests_handle();

    let (handle, mut updates) = ConversationSession::spawn(
        Box::new(MockTranscriptSource::new()),
        Arc::new(MockReplyStreamer::new().with_failure(KaiwaError::Auth {
            message: "invalid api key".to_string(),
        })),
        Arc::new(synthesizer),
        AudioPlayer::new(Box::new(NullPlaybackSink)),
        Settings::default().into_handle(),
    );

    connect_and_listen(&handle, &mut updates).await;
    handle.send_text("Hello").await;

    wait_for(&mut updates, |u| {
        matches!(u, SessionUpdate::StageError { message } if message.contains("invalid api key"))
    })
    .await;
    wait_for(&mut updates, |u| {
        *u == SessionUpdate::StateChanged(SessionState::Listening)
    })
    .await;

    // The empty assistant turn stays in the history, nothing is spoken
    assert!(spoken.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn synthesis_failure_preserves_reply_text() {
    let (handle, mut updates) = ConversationSession::spawn(
        Box::new(MockTranscriptSource::new()),
        Arc::new(MockReplyStreamer::new().with_reply(&["Hi there!"])),
        Arc::new(MockSynthesizer::new().with_failure()),
        AudioPlayer::new(Box::new(NullPlaybackSink)),
        Settings::default().into_handle(),
    );

    connect_and_listen(&handle, &mut updates).await;
    handle.send_text("Hello").await;

    // Reply text lands in the history before synthesis fails
    wait_for(&mut updates, |u| {
        matches!(u, SessionUpdate::HistoryChanged(turns)
            if turns.last().is_some_and(|t| t.text == "Hi there!"))
    })
    .await;
    wait_for(&mut updates, |u| matches!(u, SessionUpdate::StageError { .. })).await;
    wait_for(&mut updates, |u| {
        *u == SessionUpdate::StateChanged(SessionState::Listening)
    })
    .await;
}

#[tokio::test]
async fn disconnect_resets_conversation_and_drops_stale_work() {
    let source = MockTranscriptSource::new();
    let stopped = source.stopped_flag();

    let (handle, mut updates) = ConversationSession::spawn(
        Box::new(source),
        Arc::new(MockReplyStreamer::new().with_reply(&["a ", "long ", "reply"])),
        Arc::new(MockSynthesizer::new().with_audio(wav_clip())),
        AudioPlayer::new(Box::new(NullPlaybackSink)),
        Settings::default().into_handle(),
    );

    connect_and_listen(&handle, &mut updates).await;
    handle.send_text("Hello").await;
    handle.disconnect().await;

    wait_for(&mut updates, |u| {
        *u == SessionUpdate::StateChanged(SessionState::Idle)
    })
    .await;
    assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));

    // No reply fragments or speech leak through after the reset
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut leaked = Vec::new();
    while let Ok(update) = updates.try_recv() {
        leaked.push(update);
    }
    assert!(
        leaked.is_empty(),
        "no updates expected after disconnect, got {leaked:?}"
    );
}

#[tokio::test]
async fn reconnect_after_disconnect_starts_a_fresh_conversation() {
    let (handle, mut updates) = ConversationSession::spawn(
        Box::new(MockTranscriptSource::new()),
        Arc::new(
            MockReplyStreamer::new()
                .with_reply(&["first"])
                .with_reply(&["second"]),
        ),
        Arc::new(MockSynthesizer::new()),
        AudioPlayer::new(Box::new(NullPlaybackSink)),
        Settings::default().into_handle(),
    );

    connect_and_listen(&handle, &mut updates).await;
    handle.send_text("one").await;
    wait_for(&mut updates, |u| {
        matches!(u, SessionUpdate::HistoryChanged(turns)
            if turns.last().is_some_and(|t| t.text == "first"))
    })
    .await;
    wait_for(&mut updates, |u| {
        *u == SessionUpdate::StateChanged(SessionState::Listening)
    })
    .await;

    handle.disconnect().await;
    wait_for(&mut updates, |u| {
        *u == SessionUpdate::StateChanged(SessionState::Idle)
    })
    .await;

    connect_and_listen(&handle, &mut updates).await;
    handle.send_text("two").await;

    // The fresh conversation contains only the new exchange
    wait_for(&mut updates, |u| {
        matches!(u, SessionUpdate::HistoryChanged(turns)
            if turns.last().is_some_and(|t| t.text == "second") && turns.len() == 2)
    })
    .await;
}

#[tokio::test]
async fn new_reply_interrupts_active_playback() {
    let sink = MockPlaybackSink::new();
    let plays = sink.plays_handle();
    let stops = sink.stops_handle();

    let (handle, mut updates) = ConversationSession::spawn(
        Box::new(MockTranscriptSource::new()),
        Arc::new(
            MockReplyStreamer::new()
                .with_reply(&["first reply"])
                .with_reply(&["second reply"]),
        ),
        Arc::new(MockSynthesizer::new().with_audio(wav_clip())),
        AudioPlayer::new(Box::new(sink)),
        Settings::default().into_handle(),
    );

    connect_and_listen(&handle, &mut updates).await;

    for text in ["one", "two"] {
        handle.send_text(text).await;
        wait_for(&mut updates, |u| {
            *u == SessionUpdate::StateChanged(SessionState::Synthesizing)
        })
        .await;
        wait_for(&mut updates, |u| {
            *u == SessionUpdate::StateChanged(SessionState::Listening)
        })
        .await;
    }

    assert_eq!(plays.lock().expect("lock").len(), 2);
    assert_eq!(
        stops.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "second clip must interrupt the first"
    );
}
