//! Microphone capture sources.

pub mod capture;
pub mod wav;

pub use capture::{MicrophoneSource, MockMicrophoneSource};
#[cfg(feature = "cpal-audio")]
pub use capture::CpalMicrophoneSource;
pub use wav::WavMicrophoneSource;
