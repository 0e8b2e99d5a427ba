//! Default configuration constants for kaiwa.
//!
//! This module provides shared constants used across different configuration
//! types to ensure consistency and eliminate duplication.

/// Default audio sample rate in Hz for microphone capture.
///
/// 24kHz mono PCM is what the realtime transcription backend expects for
/// appended input audio frames.
pub const SAMPLE_RATE: u32 = 24000;

/// Hosted chat-completion endpoint.
pub const REMOTE_COMPLETION_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Local chat-completion endpoint (LM Studio / llama.cpp style server).
pub const LOCAL_COMPLETION_URL: &str = "http://127.0.0.1:1234/v1/chat/completions";

/// Default model id for the hosted completion endpoint.
pub const REMOTE_MODEL: &str = "gpt-4.1-nano";

/// Default model id for the local completion endpoint.
pub const LOCAL_MODEL: &str = "google/gemma-3-4b";

/// Realtime transcription WebSocket endpoint.
pub const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Default transcription model for the realtime backend.
pub const TRANSCRIPTION_MODEL: &str = "gpt-4o-mini-transcribe";

/// Default spoken-input language code.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Hosted edge-TTS streaming endpoint (provider A: `{voice, text}` -> raw bytes).
pub const EDGE_TTS_URL: &str = "https://edge-tts-stream-api.vercel.app/tts/stream";

/// Default voice for the edge-TTS provider.
pub const EDGE_TTS_VOICE: &str = "ru-RU-SvetlanaNeural";

/// ElevenLabs per-voice synthesis endpoint prefix (provider B).
pub const ELEVENLABS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";

/// Default ElevenLabs voice id.
pub const ELEVENLABS_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

/// Default ElevenLabs synthesis model.
pub const ELEVENLABS_MODEL: &str = "eleven_multilingual_v2";

/// Default voice-settings stability for ElevenLabs requests.
pub const ELEVENLABS_STABILITY: f32 = 0.5;

/// Default voice-settings similarity boost for ElevenLabs requests.
pub const ELEVENLABS_SIMILARITY_BOOST: f32 = 0.75;

/// Default persona instructions (the fixed system turn).
///
/// Kept short: replies are spoken aloud, so the persona must not ramble.
pub const DEFAULT_PERSONA: &str = "You are a helpful assistant. Keep every reply \
to a few words or one short sentence; your answers are spoken aloud.";
