//! Streaming chat completions over server-sent events.
//!
//! One HTTP POST per turn. The response body is an SSE stream of `data:`
//! lines; each carries a JSON chunk with a content delta, and `data: [DONE]`
//! terminates the stream. Lines are reassembled byte-wise so multi-byte
//! characters split across network chunks survive intact.

use crate::config::SettingsHandle;
use crate::error::{KaiwaError, Result};
use crate::history::{History, Role, Turn};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// One wire-format chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self::new(turn.role, turn.text.clone())
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ChatMessage,
}

/// Client for the chat completion endpoint.
///
/// Reads the endpoint selection fresh from settings on every call, so
/// switching between the local and hosted backends applies to the next turn
/// without restarting the session.
#[derive(Clone)]
pub struct CompletionStreamer {
    client: reqwest::Client,
    settings: SettingsHandle,
}

impl CompletionStreamer {
    pub fn new(settings: SettingsHandle) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    /// Start a streaming completion for the whole conversation so far.
    pub async fn stream(&self, history: &History) -> Result<CompletionStream> {
        let generation = self.settings.snapshot().generation;
        let request = CompletionRequest {
            model: generation.model().to_string(),
            messages: history.turns().iter().map(ChatMessage::from).collect(),
            stream: true,
        };

        let mut builder = self.client.post(generation.url()).json(&request);
        if let Some(key) = &generation.api_key
            && !key.is_empty()
        {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| KaiwaError::Connection {
            message: format!("completion request failed: {e}"),
        })?;
        let response = check_status(response).await?;

        Ok(CompletionStream {
            inner: Box::pin(response.bytes_stream()),
            assembler: LineAssembler::new(),
            done: false,
        })
    }

    /// One-shot completion of an arbitrary message list.
    pub async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let generation = self.settings.snapshot().generation;
        let request = CompletionRequest {
            model: generation.model().to_string(),
            messages,
            stream: false,
        };

        let mut builder = self.client.post(generation.url()).json(&request);
        if let Some(key) = &generation.api_key
            && !key.is_empty()
        {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| KaiwaError::Connection {
            message: format!("completion request failed: {e}"),
        })?;
        let response = check_status(response).await?;

        let parsed: CompletionResponse =
            response.json().await.map_err(|e| KaiwaError::StreamParse {
                message: format!("invalid completion response: {e}"),
            })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        Ok(content)
    }

    /// Ask the model for short reply suggestions the user could send next.
    pub async fn suggest_replies(&self, history: &History) -> Result<Vec<String>> {
        let mut messages: Vec<ChatMessage> =
            history.turns().iter().map(ChatMessage::from).collect();
        messages.push(ChatMessage::new(
            Role::User,
            "Suggest three short replies I could send next. \
             Answer with only the replies, separated by commas.",
        ));
        let raw = self.complete(messages).await?;
        Ok(split_suggestions(&raw))
    }

    /// Translate text according to a free-form instruction.
    pub async fn translate(&self, text: &str, instruction: &str) -> Result<String> {
        let messages = vec![
            ChatMessage::new(Role::System, instruction),
            ChatMessage::new(Role::User, text),
        ];
        self.complete(messages).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(KaiwaError::Auth {
            message: format!("completion endpoint rejected credentials: {body}"),
        });
    }
    Err(KaiwaError::Generation {
        status: status.as_u16(),
        message: body,
    })
}

fn split_suggestions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

type ByteStream = Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

/// In-flight streaming completion.
pub struct CompletionStream {
    inner: ByteStream,
    assembler: LineAssembler,
    done: bool,
}

impl CompletionStream {
    /// Next content fragment, or `None` when the stream ends.
    ///
    /// Malformed SSE lines are logged and skipped; the stream keeps going.
    pub async fn next_fragment(&mut self) -> Result<Option<String>> {
        loop {
            if self.done {
                return Ok(None);
            }
            while let Some(line) = self.assembler.pop_line() {
                match parse_sse_line(&line) {
                    SseLine::Fragment(text) => return Ok(Some(text)),
                    SseLine::Done => {
                        self.done = true;
                        return Ok(None);
                    }
                    SseLine::Skip => {}
                    SseLine::Malformed => {
                        log::warn!("skipping malformed stream line: {line}");
                    }
                }
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => self.assembler.push(&chunk),
                Some(Err(e)) => {
                    return Err(KaiwaError::Connection {
                        message: format!("completion stream interrupted: {e}"),
                    });
                }
                None => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
    }
}

/// Seam the session uses to start a reply stream.
#[async_trait::async_trait]
pub trait ReplyStreamer: Send + Sync {
    async fn stream_reply(&self, history: &History) -> Result<Box<dyn ReplyStream>>;
}

/// One in-flight reply, pulled fragment by fragment.
#[async_trait::async_trait]
pub trait ReplyStream: Send {
    async fn next_fragment(&mut self) -> Result<Option<String>>;
}

#[async_trait::async_trait]
impl ReplyStreamer for CompletionStreamer {
    async fn stream_reply(&self, history: &History) -> Result<Box<dyn ReplyStream>> {
        Ok(Box::new(self.stream(history).await?))
    }
}

#[async_trait::async_trait]
impl ReplyStream for CompletionStream {
    async fn next_fragment(&mut self) -> Result<Option<String>> {
        CompletionStream::next_fragment(self).await
    }
}

struct ReplyScript {
    fragments: Vec<String>,
    /// Error surfaced after the fragments, modeling a dropped stream.
    error: Option<KaiwaError>,
}

/// Scripted reply streamer for tests. Each `stream_reply` call consumes the
/// next scripted reply; an exhausted script yields empty replies.
pub struct MockReplyStreamer {
    scripts: std::sync::Mutex<std::collections::VecDeque<Result<ReplyScript>>>,
    requests: std::sync::Arc<std::sync::Mutex<Vec<Vec<ChatMessage>>>>,
}

impl MockReplyStreamer {
    pub fn new() -> Self {
        Self {
            scripts: std::sync::Mutex::new(std::collections::VecDeque::new()),
            requests: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Queue a reply streamed as the given fragments.
    pub fn with_reply(self, fragments: &[&str]) -> Self {
        self.push(Ok(ReplyScript {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            error: None,
        }));
        self
    }

    /// Queue a request-time failure.
    pub fn with_failure(self, error: KaiwaError) -> Self {
        self.push(Err(error));
        self
    }

    /// Queue a reply that breaks mid-stream after the given fragments.
    pub fn with_interrupted_reply(self, fragments: &[&str], error: KaiwaError) -> Self {
        self.push(Ok(ReplyScript {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            error: Some(error),
        }));
        self
    }

    /// Handle to the message lists each call was made with.
    pub fn requests_handle(&self) -> std::sync::Arc<std::sync::Mutex<Vec<Vec<ChatMessage>>>> {
        self.requests.clone()
    }

    fn push(&self, entry: Result<ReplyScript>) {
        let mut guard = match self.scripts.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push_back(entry);
    }
}

impl Default for MockReplyStreamer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ReplyStreamer for MockReplyStreamer {
    async fn stream_reply(&self, history: &History) -> Result<Box<dyn ReplyStream>> {
        {
            let mut guard = match self.requests.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.push(history.turns().iter().map(ChatMessage::from).collect());
        }
        let entry = {
            let mut guard = match self.scripts.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.pop_front()
        };
        match entry {
            Some(Ok(script)) => Ok(Box::new(MockReplyStream {
                fragments: script.fragments.into(),
                error: script.error,
            })),
            Some(Err(e)) => Err(e),
            None => Ok(Box::new(MockReplyStream {
                fragments: std::collections::VecDeque::new(),
                error: None,
            })),
        }
    }
}

struct MockReplyStream {
    fragments: std::collections::VecDeque<String>,
    error: Option<KaiwaError>,
}

#[async_trait::async_trait]
impl ReplyStream for MockReplyStream {
    async fn next_fragment(&mut self) -> Result<Option<String>> {
        if let Some(fragment) = self.fragments.pop_front() {
            return Ok(Some(fragment));
        }
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

enum SseLine {
    Fragment(String),
    Done,
    Skip,
    Malformed,
}

fn parse_sse_line(line: &str) -> SseLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return SseLine::Skip;
    }
    let Some(payload) = trimmed.strip_prefix(DATA_PREFIX) else {
        // Comments and other SSE fields carry no content
        return SseLine::Skip;
    };
    if payload == DONE_SENTINEL {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => {
            let content = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content);
            match content {
                // Role-announcement and finish chunks have no content
                Some(text) => SseLine::Fragment(text),
                None => SseLine::Skip,
            }
        }
        Err(_) => SseLine::Malformed,
    }
}

/// Reassembles `\n`-terminated lines from arbitrary byte chunks.
///
/// Decoding happens only on complete lines. A newline byte never occurs
/// inside a multi-byte UTF-8 sequence, so splitting on it is safe even when
/// the network fragments a character.
struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    fn pop_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|&b| b == b'\n')?;
        let rest = self.buffer.split_off(newline + 1);
        let mut line = std::mem::replace(&mut self.buffer, rest);
        line.pop(); // the newline
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}
