//! Realtime cloud transcription over a websocket.
//!
//! Streams microphone PCM to the realtime transcription endpoint and maps
//! the server's delta/completed events into [`TranscriptEvent`]s. Endpoint
//! turn detection (server VAD) decides utterance boundaries, so this backend
//! emits appending deltas.

use crate::audio::MicrophoneSource;
use crate::config::TranscriptionConfig;
use crate::error::{KaiwaError, Result};
use crate::transcript::{TranscriptEvent, TranscriptSource};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite};

/// Interval between microphone frame uploads.
const PUMP_INTERVAL: Duration = Duration::from_millis(100);

/// Server event types carrying transcript text.
const EVENT_DELTA: &str = "conversation.item.input_audio_transcription.delta";
const EVENT_COMPLETED: &str = "conversation.item.input_audio_transcription.completed";

pub struct RealtimeTranscriber {
    config: TranscriptionConfig,
    api_key: String,
    mic: Option<Box<dyn MicrophoneSource>>,
    shutdown: Option<oneshot::Sender<()>>,
    read_task: Option<tokio::task::JoinHandle<()>>,
    pump_task: Option<tokio::task::JoinHandle<()>>,
}

impl RealtimeTranscriber {
    pub fn new(
        config: TranscriptionConfig,
        api_key: impl Into<String>,
        mic: Box<dyn MicrophoneSource>,
    ) -> Self {
        Self {
            config,
            api_key: api_key.into(),
            mic: Some(mic),
            shutdown: None,
            read_task: None,
            pump_task: None,
        }
    }
}

#[async_trait]
impl TranscriptSource for RealtimeTranscriber {
    async fn start(&mut self, events: mpsc::Sender<TranscriptEvent>) -> Result<()> {
        let request = build_ws_request(&self.config.realtime_url, &self.api_key)?;
        let (ws_stream, _) =
            connect_async(request)
                .await
                .map_err(|e| KaiwaError::Connection {
                    message: format!("realtime handshake failed: {e}"),
                })?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let session_update =
            session_update_message(&self.config.model, &self.config.language);
        ws_tx
            .send(tungstenite::Message::Text(
                session_update.to_string().into(),
            ))
            .await
            .map_err(|e| KaiwaError::Connection {
                message: format!("failed to configure realtime session: {e}"),
            })?;

        let mut mic = self.mic.take().ok_or_else(|| KaiwaError::Connection {
            message: "transcriber already started".to_string(),
        })?;
        mic.start()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        self.shutdown = Some(shutdown_tx);

        self.read_task = Some(tokio::spawn(run_read_loop(ws_rx, events)));

        self.pump_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(PUMP_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        let frame = match mic.read_frame() {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("microphone read failed: {e}");
                                break;
                            }
                        };
                        if frame.is_empty() {
                            continue;
                        }
                        let append = json!({
                            "type": "input_audio_buffer.append",
                            "audio": pcm_to_base64(&frame),
                        });
                        if ws_tx
                            .send(tungstenite::Message::Text(append.to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            if let Err(e) = mic.stop() {
                log::warn!("microphone stop failed: {e}");
            }
            let _ = ws_tx.close().await;
        }));

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // Signal the pump to release the mic and close the socket
        self.shutdown = None;
        if let Some(task) = self.pump_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
            // Reap the task so its events sender is dropped and no event can
            // land after stop resolves.
            let _ = task.await;
        }
        Ok(())
    }
}

/// Forward server transcript events until the socket or the receiver closes.
///
/// Owns the events sender for its whole lifetime, so reaping this task is
/// what severs the channel.
async fn run_read_loop<S>(mut ws_rx: S, events: mpsc::Sender<TranscriptEvent>)
where
    S: futures_util::Stream<Item = tungstenite::Result<tungstenite::Message>> + Unpin,
{
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(tungstenite::Message::Text(text)) => {
                if let Some(event) = parse_server_event(&text)
                    && events.send(event).await.is_err()
                {
                    break;
                }
            }
            Ok(tungstenite::Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

fn build_ws_request(url: &str, api_key: &str) -> Result<tungstenite::http::Request<()>> {
    tungstenite::http::Request::builder()
        .uri(url)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("Host", host_of(url))
        .header("Authorization", format!("Bearer {api_key}"))
        .header("OpenAI-Beta", "realtime=v1")
        .body(())
        .map_err(|e| KaiwaError::Connection {
            message: format!("failed to build websocket request: {e}"),
        })
}

fn host_of(url: &str) -> String {
    url.trim_start_matches("wss://")
        .trim_start_matches("ws://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn session_update_message(model: &str, language: &str) -> serde_json::Value {
    json!({
        "type": "session.update",
        "session": {
            "input_audio_transcription": {
                "model": model,
                "language": language,
            },
            "turn_detection": {
                "type": "server_vad",
            },
        },
    })
}

/// Map one server message to a transcript event, ignoring everything else.
fn parse_server_event(text: &str) -> Option<TranscriptEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    match value.get("type")?.as_str()? {
        EVENT_DELTA => Some(TranscriptEvent::Delta {
            text: value.get("delta")?.as_str()?.to_string(),
        }),
        EVENT_COMPLETED => Some(TranscriptEvent::Completed {
            text: value.get("transcript")?.as_str()?.to_string(),
        }),
        _ => None,
    }
}

fn pcm_to_base64(frame: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(frame.len() * 2);
    for sample in frame {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delta_event() {
        let event = parse_server_event(
            r#"{"type":"conversation.item.input_audio_transcription.delta","delta":"Hel"}"#,
        );
        assert_eq!(
            event,
            Some(TranscriptEvent::Delta {
                text: "Hel".to_string()
            })
        );
    }

    #[test]
    fn test_parse_completed_event() {
        let event = parse_server_event(
            r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"Hello"}"#,
        );
        assert_eq!(
            event,
            Some(TranscriptEvent::Completed {
                text: "Hello".to_string()
            })
        );
    }

    #[test]
    fn test_unrelated_events_ignored() {
        assert_eq!(
            parse_server_event(r#"{"type":"input_audio_buffer.speech_started"}"#),
            None
        );
        assert_eq!(parse_server_event("not json"), None);
        assert_eq!(
            parse_server_event(
                r#"{"type":"conversation.item.input_audio_transcription.delta"}"#
            ),
            None,
            "delta without text payload should be dropped"
        );
    }

    #[test]
    fn test_session_update_shape() {
        let msg = session_update_message("gpt-4o-mini-transcribe", "en");
        assert_eq!(msg["type"], "session.update");
        assert_eq!(
            msg["session"]["input_audio_transcription"]["model"],
            "gpt-4o-mini-transcribe"
        );
        assert_eq!(msg["session"]["input_audio_transcription"]["language"], "en");
        assert_eq!(msg["session"]["turn_detection"]["type"], "server_vad");
    }

    #[test]
    fn test_pcm_base64_little_endian() {
        // 0x0102 encodes low byte first
        let encoded = pcm_to_base64(&[0x0102]);
        let decoded = BASE64.decode(encoded).expect("valid base64");
        assert_eq!(decoded, vec![0x02, 0x01]);
    }

    #[tokio::test]
    async fn test_read_loop_forwards_transcript_events() {
        let (tx, mut rx) = mpsc::channel(4);
        let messages = vec![
            Ok(tungstenite::Message::Text(
                r#"{"type":"conversation.item.input_audio_transcription.delta","delta":"Hel"}"#
                    .into(),
            )),
            Ok(tungstenite::Message::Text(
                r#"{"type":"input_audio_buffer.speech_started"}"#.into(),
            )),
        ];
        run_read_loop(futures_util::stream::iter(messages), tx).await;

        assert_eq!(
            rx.recv().await,
            Some(TranscriptEvent::Delta {
                text: "Hel".to_string()
            })
        );
        assert_eq!(rx.recv().await, None, "loop exit drops the sender");
    }

    #[tokio::test]
    async fn test_reaped_read_loop_severs_the_event_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        // A socket that never yields keeps the loop parked
        let task = tokio::spawn(run_read_loop(
            futures_util::stream::pending::<tungstenite::Result<tungstenite::Message>>(),
            tx,
        ));

        task.abort();
        let _ = task.await;

        // The sender is gone by the time the abort is reaped, so the channel
        // reports closed instead of hanging
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_host_extraction() {
        assert_eq!(host_of("wss://api.openai.com/v1/realtime"), "api.openai.com");
        assert_eq!(host_of("ws://127.0.0.1:9000/stream"), "127.0.0.1:9000");
    }
}
