//! Error types for kaiwa.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KaiwaError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Transport errors
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Authentication failed: {message}")]
    Auth { message: String },

    // Transcription errors
    #[error("Transcription error: {message}")]
    Transcription { message: String },

    // Generation errors
    #[error("Malformed stream line: {message}")]
    StreamParse { message: String },

    #[error("Completion request failed with status {status}: {message}")]
    Generation { status: u16, message: String },

    // Speech stage errors
    #[error("Speech synthesis failed: {message}")]
    Synthesis { message: String },

    #[error("Audio playback failed: {message}")]
    Playback { message: String },

    // Audio capture errors
    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, KaiwaError>;
