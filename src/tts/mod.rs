//! Speech synthesis providers.
//!
//! The provider is read from settings at the start of every synthesis call,
//! so a mid-conversation switch takes effect on the next reply. Spoken text
//! is stripped of emoji and related pictographs before synthesis; the
//! displayed transcript keeps them.

use crate::config::{SettingsHandle, TtsConfig, TtsProviderId};
use crate::error::{KaiwaError, Result};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct EdgeRequest<'a> {
    voice: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

/// Client for the configured speech synthesis provider.
#[derive(Clone)]
pub struct Synthesizer {
    client: reqwest::Client,
    settings: SettingsHandle,
}

impl Synthesizer {
    pub fn new(settings: SettingsHandle) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    /// Synthesize `text` into encoded audio bytes.
    ///
    /// The text is cleaned of unpronounceable symbols first. Empty cleaned
    /// text yields empty audio without a network call.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let spoken = strip_spoken_symbols(text);
        if spoken.trim().is_empty() {
            return Ok(Vec::new());
        }

        let tts = self.settings.snapshot().tts;
        match tts.provider {
            TtsProviderId::EdgeStream => self.synthesize_edge(&tts, &spoken).await,
            TtsProviderId::ElevenLabs => self.synthesize_elevenlabs(&tts, &spoken).await,
        }
    }

    async fn synthesize_edge(&self, tts: &TtsConfig, text: &str) -> Result<Vec<u8>> {
        let request = EdgeRequest {
            voice: &tts.edge_voice,
            text,
        };
        let response = self
            .client
            .post(&tts.edge_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| KaiwaError::Synthesis {
                message: format!("edge tts request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(KaiwaError::Synthesis {
                message: format!("edge tts returned status {status}"),
            });
        }

        let bytes = response.bytes().await.map_err(|e| KaiwaError::Synthesis {
            message: format!("edge tts body read failed: {e}"),
        })?;
        Ok(bytes.to_vec())
    }

    async fn synthesize_elevenlabs(&self, tts: &TtsConfig, text: &str) -> Result<Vec<u8>> {
        let api_key = match &tts.elevenlabs_api_key {
            Some(key) if !key.is_empty() => key,
            _ => {
                return Err(KaiwaError::Auth {
                    message: "elevenlabs api key is not configured".to_string(),
                });
            }
        };

        let request = ElevenLabsRequest {
            text,
            model_id: &tts.elevenlabs_model,
            voice_settings: VoiceSettings {
                stability: tts.stability,
                similarity_boost: tts.similarity_boost,
            },
        };

        let url = format!("{}/{}", tts.elevenlabs_url, tts.elevenlabs_voice_id);
        let response = self
            .client
            .post(&url)
            .header("xi-api-key", api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| KaiwaError::Synthesis {
                message: format!("elevenlabs request failed: {e}"),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(KaiwaError::Auth {
                message: "elevenlabs rejected the api key".to_string(),
            });
        }
        if !status.is_success() {
            return Err(KaiwaError::Synthesis {
                message: format!("elevenlabs returned status {status}"),
            });
        }

        let bytes = response.bytes().await.map_err(|e| KaiwaError::Synthesis {
            message: format!("elevenlabs body read failed: {e}"),
        })?;
        Ok(bytes.to_vec())
    }
}

/// Seam the session uses to turn reply text into audio bytes.
#[async_trait::async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Empty bytes mean there is nothing to speak.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

#[async_trait::async_trait]
impl SpeechSynthesizer for Synthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        Synthesizer::synthesize(self, text).await
    }
}

/// Scripted synthesizer for tests. Records every requested text.
pub struct MockSynthesizer {
    audio: Vec<u8>,
    fail: bool,
    requests: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self {
            audio: Vec::new(),
            fail: false,
            requests: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Bytes returned for every synthesis call.
    pub fn with_audio(mut self, audio: Vec<u8>) -> Self {
        self.audio = audio;
        self
    }

    /// Make every call fail.
    pub fn with_failure(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Handle to the texts handed to `synthesize`.
    pub fn requests_handle(&self) -> std::sync::Arc<std::sync::Mutex<Vec<String>>> {
        self.requests.clone()
    }
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let mut guard = match self.requests.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(text.to_string());
        if self.fail {
            return Err(KaiwaError::Synthesis {
                message: "mock synthesizer refused".to_string(),
            });
        }
        Ok(self.audio.clone())
    }
}

/// Remove emoji and related symbols a voice cannot pronounce.
///
/// Covers the pictograph planes, misc symbols, variation selectors and the
/// zero-width joiner used in emoji sequences. Regular punctuation and all
/// alphabetic scripts pass through untouched.
pub fn strip_spoken_symbols(text: &str) -> String {
    text.chars()
        .filter(|&c| !is_spoken_symbol(c))
        .collect()
}

fn is_spoken_symbol(c: char) -> bool {
    matches!(u32::from(c),
        0x1F000..=0x1FFFF  // emoji, pictographs, supplemental symbols
        | 0x2600..=0x27BF  // misc symbols, dingbats
        | 0x2B00..=0x2BFF  // arrows, stars
        | 0x2300..=0x23FF  // misc technical (watch, hourglass)
        | 0xFE00..=0xFE0F  // variation selectors
        | 0x200D           // zero-width joiner
    )
}
