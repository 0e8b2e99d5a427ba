//! kaiwa - real-time voice conversation engine for animated LLM personas
//!
//! Speech (or typed text) goes in, a streamed LLM reply comes back, gets
//! spoken aloud and handed to an animation sink for lip-sync.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod completion;
pub mod config;
pub mod defaults;
pub mod error;
pub mod history;
pub mod playback;
pub mod session;
pub mod transcript;
pub mod tts;

// Core seams (transcript → completion → speech → playback)
pub use completion::{CompletionStream, CompletionStreamer, ReplyStream, ReplyStreamer};
pub use playback::{AnimationSink, AudioPlayer, DecodedAudio, PlaybackSink, decode_audio};
pub use transcript::{TranscriptEvent, TranscriptSource, UtteranceAccumulator};
pub use tts::{SpeechSynthesizer, Synthesizer, strip_spoken_symbols};

// Session
pub use session::{ConversationSession, SessionHandle, SessionState, SessionUpdate};

// Conversation data
pub use history::{History, Role, Turn};

// Error handling
pub use error::{KaiwaError, Result};

// Config
pub use config::{Settings, SettingsHandle};

/// Build version string with optional git commit hash.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
